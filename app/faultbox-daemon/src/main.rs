//! The faultbox agent daemon.

mod config;

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use faultbox_action::{Coordinator, CoordinatorDeps};
use faultbox_api::{create_router, health_router, AppState};
use faultbox_engine::sidecar::SidecarExecutor;
use faultbox_engine::{detect, Discovery, DiscoveryConfig, EngineConfig, EngineKind};
use faultbox_runc::{Runc, RuncConfig, SidecarImage};

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "faultbox-daemon")]
#[command(author, version, about, long_about = None)]
struct DaemonArgs {
    /// Configuration file path (default: /etc/faultbox/config.toml).
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Action protocol port override.
    #[arg(long)]
    port: Option<u16>,

    /// Health port override.
    #[arg(long)]
    health_port: Option<u16>,

    /// Enable debug logging and runtime debug output.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let default_filter = if args.debug {
        "faultbox=debug"
    } else {
        "faultbox=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(args).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    info!("Starting faultbox agent...");

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(port) = args.port {
        config.ports.service = port;
    }
    if let Some(port) = args.health_port {
        config.ports.health = port;
    }
    if args.debug {
        config.runc.debug = true;
    }

    if !nix::unistd::geteuid().is_root() {
        warn!("not running as root; sidecar launches will fail");
    }

    let engine_config = EngineConfig {
        hint: EngineKind::parse(&config.engine.runtime),
        socket: config.engine.socket.clone(),
        candidates: config
            .engine
            .candidates
            .iter()
            .filter_map(|s| EngineKind::parse(s))
            .collect(),
        containerd_namespace: config
            .engine
            .namespace
            .clone()
            .unwrap_or_else(|| "k8s.io".to_string()),
    };
    let engine = detect(&engine_config)
        .await
        .context("Failed to create container engine client")?;

    let runc = Runc::new(RuncConfig {
        root: config
            .runc
            .root
            .clone()
            .or_else(|| Some(engine.kind().default_runc_root())),
        debug: config.runc.debug,
        systemd_cgroup: config.runc.systemd_cgroup,
        rootless: config.runc.rootless.clone(),
    });

    let image = SidecarImage::materialize(&config.sidecar.scratch, config.sidecar.image.as_deref())
        .context("Failed to materialize sidecar image")?;
    let executor = if config.sidecar.launch_limit == 0 {
        SidecarExecutor::new(runc, image, config.sidecar.scratch.clone())
    } else {
        SidecarExecutor::with_launch_limit(
            runc,
            image,
            config.sidecar.scratch.clone(),
            config.sidecar.launch_limit,
        )
    };

    let coordinator = Arc::new(Coordinator::new(CoordinatorDeps {
        engine: Arc::clone(&engine),
        executor,
    }));

    let discovery = Arc::new(Discovery::new(
        Arc::clone(&engine),
        DiscoveryConfig {
            interval: std::time::Duration::from_secs(config.discovery.interval),
            label_exclude_globs: config.discovery.excludes.clone(),
        },
    ));
    tokio::spawn(Arc::clone(&discovery).run());

    let state = AppState {
        coordinator: Arc::clone(&coordinator),
        discovery,
    };
    let app = create_router(state.clone());
    let health_app = health_router(state);

    let service_listener = TcpListener::bind(("0.0.0.0", config.ports.service))
        .await
        .with_context(|| format!("Failed to bind service port {}", config.ports.service))?;
    let health_listener = TcpListener::bind(("0.0.0.0", config.ports.health))
        .await
        .with_context(|| format!("Failed to bind health port {}", config.ports.health))?;

    info!(
        service_port = config.ports.service,
        health_port = config.ports.health,
        engine = %engine.kind(),
        "faultbox agent listening"
    );

    tokio::select! {
        result = axum::serve(service_listener, app).into_future() => {
            result.context("action protocol server failed")?;
        }
        result = axum::serve(health_listener, health_app).into_future() => {
            result.context("health server failed")?;
        }
        () = shutdown_signal() => {
            info!("shutdown signal received, reverting in-flight actions");
            coordinator.shutdown().await;
        }
    }

    info!("faultbox agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
