//! The action lifecycle coordinator.
//!
//! One coordinator owns every in-flight action instance. Each instance
//! moves through Preparing -> Running -> Stopping -> Stopped/Failed; stop
//! is honored in any state, revert is executed at most once, and a second
//! stop while stopping is a no-op. Network attacks additionally hold class
//! allocations and a registry entry used for conflict detection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use faultbox_engine::sidecar::{SidecarExecutor, SidecarKill};
use faultbox_engine::{EngineClient, EngineKind, TargetConfig};
use faultbox_error::{FaultError, Result};
use faultbox_net::compile::FirewallEffect;
use faultbox_net::filter::CidrWithPorts;
use faultbox_net::{
    compile, iface, ClassAllocator, CompileInput, NetworkFilter, NetworkOps, PortRange,
    QdiscEffect, ShapingPlan,
};
use faultbox_stress::{IoMode, StressOpts, StressRunner};

use crate::config::{
    validate_rate, ActionKind, ActionRequest, BandwidthConfig, BlackholeConfig, BlockDnsConfig,
    DelayConfig, NetworkFilterConfig, PackageCorruptionConfig, PackageLossConfig, PauseConfig,
    StopConfig, StressCpuConfig, StressIoConfig, StressMemConfig,
};
use crate::instance::{ActionState, StatusReport, StopReport};

/// Everything the coordinator needs to operate.
pub struct CoordinatorDeps {
    /// Engine client for the detected runtime.
    pub engine: Arc<dyn EngineClient>,
    /// Sidecar executor.
    pub executor: SidecarExecutor,
}

/// The coordinator.
pub struct Coordinator {
    engine: Arc<dyn EngineClient>,
    executor: SidecarExecutor,
    net_ops: NetworkOps,
    stress: StressRunner,
    classes: ClassAllocator,
    actions: Mutex<HashMap<String, Arc<ActionHandle>>>,
    active_shapings: Mutex<Vec<ActiveShaping>>,
}

struct ActiveShaping {
    action_id: String,
    kind: ActionKind,
    interfaces: Vec<String>,
    filter: NetworkFilter,
}

struct ActionHandle {
    id: String,
    kind: ActionKind,
    state: Mutex<HandleState>,
}

struct HandleState {
    state: ActionState,
    started_at: Option<DateTime<Utc>>,
    error: Option<String>,
    prepared: Option<PreparedAttack>,
    running: Option<RunningAttack>,
}

enum PreparedAttack {
    Stop {
        container_id: String,
        graceful: bool,
    },
    Pause {
        container_id: String,
        duration: Duration,
    },
    Stress {
        target: TargetConfig,
        cgroup_path: String,
        opts: StressOpts,
        tolerate_oom_kill: bool,
    },
    Network {
        target: TargetConfig,
        plan: ShapingPlan,
        duration: Duration,
    },
}

enum RunningAttack {
    Stop,
    Pause {
        container_id: String,
    },
    Stress {
        kill: SidecarKill,
        monitor: JoinHandle<()>,
    },
    Network {
        target: TargetConfig,
        plan: ShapingPlan,
    },
}

impl Coordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(deps: CoordinatorDeps) -> Self {
        Self {
            engine: deps.engine,
            net_ops: NetworkOps::new(deps.executor.clone()),
            stress: StressRunner::new(deps.executor.clone()),
            executor: deps.executor,
            classes: ClassAllocator::new(),
            actions: Mutex::new(HashMap::new()),
            active_shapings: Mutex::new(Vec::new()),
        }
    }

    /// Prepares an action: resolves the target, checks preconditions, and
    /// builds the attack. Returns the new action instance id.
    pub async fn prepare(&self, kind: ActionKind, request: &ActionRequest) -> Result<String> {
        let container_id = request.target.container_id()?;
        let descriptor = self.engine.inspect(container_id).await?;
        let action_id = format!("fb-{}", Uuid::new_v4().simple());

        let prepared = if kind.is_network() {
            self.prepare_network(kind, &action_id, request, &descriptor)
                .await?
        } else {
            self.prepare_local(kind, request, &descriptor)?
        };

        let handle = Arc::new(ActionHandle {
            id: action_id.clone(),
            kind,
            state: Mutex::new(HandleState {
                state: ActionState::Preparing,
                started_at: None,
                error: None,
                prepared: Some(prepared),
                running: None,
            }),
        });
        self.lock_actions().insert(action_id.clone(), handle);
        tracing::info!(action = %action_id, %kind, container = container_id, "prepared action");
        Ok(action_id)
    }

    fn prepare_local(
        &self,
        kind: ActionKind,
        request: &ActionRequest,
        descriptor: &faultbox_engine::ContainerDescriptor,
    ) -> Result<PreparedAttack> {
        match kind {
            ActionKind::StopContainer => {
                let config: StopConfig = request.config_as()?;
                Ok(PreparedAttack::Stop {
                    container_id: descriptor.id.clone(),
                    graceful: config.graceful,
                })
            }
            ActionKind::Pause => {
                if self.engine.kind() == EngineKind::CriO {
                    return Err(FaultError::unsupported("cri-o", "pause"));
                }
                let config: PauseConfig = request.config_as()?;
                Ok(PreparedAttack::Pause {
                    container_id: descriptor.id.clone(),
                    duration: config.duration,
                })
            }
            ActionKind::StressCpu => {
                let config: StressCpuConfig = request.config_as()?;
                Ok(PreparedAttack::Stress {
                    target: descriptor.target_config(),
                    cgroup_path: descriptor.cgroup_path.clone(),
                    opts: StressOpts::cpu(config.duration, config.workers, config.cpu_load),
                    tolerate_oom_kill: true,
                })
            }
            ActionKind::StressMem => {
                let config: StressMemConfig = request.config_as()?;
                Ok(PreparedAttack::Stress {
                    target: descriptor.target_config(),
                    cgroup_path: descriptor.cgroup_path.clone(),
                    opts: StressOpts::memory(config.duration, config.percentage),
                    tolerate_oom_kill: !config.fail_on_oom_kill,
                })
            }
            ActionKind::StressIo => {
                let config: StressIoConfig = request.config_as()?;
                let mode = IoMode::parse(&config.mode)?;
                Ok(PreparedAttack::Stress {
                    target: descriptor.target_config(),
                    cgroup_path: descriptor.cgroup_path.clone(),
                    opts: StressOpts::io(
                        config.duration,
                        config.path.clone().into(),
                        config.workers,
                        config.percentage,
                        mode,
                    ),
                    tolerate_oom_kill: true,
                })
            }
            other => Err(FaultError::internal(format!(
                "{other} is a network action"
            ))),
        }
    }

    async fn prepare_network(
        &self,
        kind: ActionKind,
        action_id: &str,
        request: &ActionRequest,
        descriptor: &faultbox_engine::ContainerDescriptor,
    ) -> Result<PreparedAttack> {
        let target = descriptor.target_config();

        // Every network config shape flattens the shared filter fields.
        let (duration, filter_config, qdisc, firewall) = match kind {
            ActionKind::NetworkBlackhole => {
                let config: BlackholeConfig = request.config_as()?;
                (
                    config.duration,
                    config.filter,
                    None,
                    Some(FirewallEffect::Blackhole),
                )
            }
            ActionKind::NetworkBlockDns => {
                let config: BlockDnsConfig = request.config_as()?;
                (
                    config.duration,
                    config.filter,
                    None,
                    Some(FirewallEffect::DnsBlock {
                        port: config.dns_port,
                    }),
                )
            }
            ActionKind::NetworkDelay => {
                let config: DelayConfig = request.config_as()?;
                let jitter_ms = config
                    .network_delay_jitter
                    .then(|| config.network_delay * 30 / 100);
                (
                    config.duration,
                    config.filter,
                    Some(QdiscEffect::Delay {
                        delay_ms: config.network_delay,
                        jitter_ms,
                    }),
                    None,
                )
            }
            ActionKind::NetworkBandwidth => {
                let config: BandwidthConfig = request.config_as()?;
                validate_rate(&config.bandwidth)?;
                (
                    config.duration,
                    config.filter,
                    Some(QdiscEffect::Bandwidth {
                        rate: config.bandwidth,
                    }),
                    None,
                )
            }
            ActionKind::NetworkPackageLoss => {
                let config: PackageLossConfig = request.config_as()?;
                (
                    config.duration,
                    config.filter,
                    Some(QdiscEffect::Loss {
                        percent: config.network_loss,
                    }),
                    None,
                )
            }
            ActionKind::NetworkPackageCorruption => {
                let config: PackageCorruptionConfig = request.config_as()?;
                (
                    config.duration,
                    config.filter,
                    Some(QdiscEffect::Corrupt {
                        percent: config.network_corruption,
                    }),
                    None,
                )
            }
            other => {
                return Err(FaultError::internal(format!(
                    "{other} is not a network action"
                )))
            }
        };

        if descriptor.host_network && filter_config.fail_on_host_network {
            return Err(FaultError::HostNetworkRefused);
        }

        let filter = self
            .build_filter(&target, &filter_config, request)
            .await?;

        let interfaces = self
            .resolve_interfaces(&target, &filter_config)
            .await?;

        // Conflict check and registration happen under one lock so two
        // concurrent prepares cannot both pass the check.
        self.register_shaping(kind, action_id, &interfaces, filter.clone())?;

        // Firewall-only attacks need no class allocation; qdisc attacks
        // hold one class per interface until revert.
        let assignments = if qdisc.is_some() {
            match self.classes.allocate(action_id, &interfaces) {
                Ok(assignments) => assignments,
                Err(err) => {
                    self.release_network_state(action_id);
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };

        let plan = compile(&CompileInput {
            action_tag: action_id,
            qdisc,
            firewall,
            filter: &filter,
            interfaces: &assignments,
        });

        if plan.is_empty() {
            self.release_network_state(action_id);
            return Err(FaultError::invalid_config(
                "the filter matches no traffic (hostnames unresolved or family without rules)",
            ));
        }

        Ok(PreparedAttack::Network {
            target,
            plan,
            duration,
        })
    }

    async fn build_filter(
        &self,
        target: &TargetConfig,
        config: &NetworkFilterConfig,
        request: &ActionRequest,
    ) -> Result<NetworkFilter> {
        let mut cidrs = Vec::new();
        for ip in &config.ip {
            cidrs.push(faultbox_net::filter::parse_cidr(ip)?);
        }
        if !config.hostname.is_empty() {
            let resolved = iface::resolve_hostnames(
                self.net_ops.executor(),
                target,
                &config.hostname,
            )
            .await?;
            cidrs.extend(resolved.into_iter().map(ipnetwork_from_addr));
        }

        let mut ports = Vec::new();
        for port in &config.port {
            ports.push(port.to_range()?);
        }

        let include = cross_product(cidrs, ports);
        Ok(NetworkFilter::normalize(
            include,
            Vec::new(),
            &request.execution_context.restricted_endpoints,
        ))
    }

    async fn resolve_interfaces(
        &self,
        target: &TargetConfig,
        config: &NetworkFilterConfig,
    ) -> Result<Vec<String>> {
        let mut interfaces: Vec<String> = if config.network_interface.is_empty() {
            iface::list_interfaces(self.net_ops.executor(), target)
                .await?
                .into_iter()
                .map(|i| i.name)
                .collect()
        } else {
            config.network_interface.clone()
        };

        // Preserve order, drop duplicates.
        let mut seen = std::collections::HashSet::new();
        interfaces.retain(|name| seen.insert(name.clone()));

        if interfaces.is_empty() {
            return Err(FaultError::invalid_config(
                "no network interfaces to attack",
            ));
        }
        Ok(interfaces)
    }

    fn register_shaping(
        &self,
        kind: ActionKind,
        action_id: &str,
        interfaces: &[String],
        filter: NetworkFilter,
    ) -> Result<()> {
        let mut shapings = self.lock_shapings();
        for active in shapings.iter() {
            if active.kind != kind {
                continue;
            }
            let shared_interface = active
                .interfaces
                .iter()
                .any(|i| interfaces.contains(i));
            if shared_interface && active.filter.overlaps(&filter) {
                return Err(FaultError::conflict(format!(
                    "action {} already runs {} on a shared interface with an overlapping filter",
                    active.action_id, active.kind
                )));
            }
        }
        shapings.push(ActiveShaping {
            action_id: action_id.to_string(),
            kind,
            interfaces: interfaces.to_vec(),
            filter,
        });
        Ok(())
    }

    /// Starts a prepared action.
    pub async fn start(self: &Arc<Self>, action_id: &str) -> Result<StatusReport> {
        let handle = self.handle(action_id)?;

        let prepared = {
            let mut state = lock_handle(&handle);
            match state.state {
                ActionState::Preparing => Some(
                    state
                        .prepared
                        .take()
                        .ok_or_else(|| FaultError::internal("prepared attack missing"))?,
                ),
                // Start is idempotent once running.
                ActionState::Running => None,
                _ => {
                    return Err(FaultError::invalid_config(format!(
                        "action {action_id} cannot start from state {:?}",
                        state.state
                    )))
                }
            }
        };
        let Some(prepared) = prepared else {
            return Ok(self.report(&handle));
        };

        let started = self.launch(&handle, prepared).await;
        match started {
            Ok(running) => {
                let mut state = lock_handle(&handle);
                state.started_at = Some(Utc::now());
                match running {
                    Some(running) => {
                        state.running = Some(running);
                        // A very short payload may have finished (and its
                        // monitor reported a terminal state) already.
                        if state.state == ActionState::Preparing {
                            state.state = ActionState::Running;
                        }
                    }
                    // One-shot attacks (stop) complete immediately.
                    None => state.state = ActionState::Stopped,
                }
                drop(state);
                tracing::info!(action = action_id, "started action");
                Ok(self.report(&handle))
            }
            Err(err) => {
                self.release_network_state(action_id);
                let mut state = lock_handle(&handle);
                state.state = ActionState::Failed;
                state.error = Some(err.to_string());
                drop(state);
                Err(err)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        handle: &Arc<ActionHandle>,
        prepared: PreparedAttack,
    ) -> Result<Option<RunningAttack>> {
        match prepared {
            PreparedAttack::Stop {
                container_id,
                graceful,
            } => {
                self.engine.stop(&container_id, graceful).await?;
                Ok(None)
            }
            PreparedAttack::Pause {
                container_id,
                duration,
            } => {
                self.engine.pause(&container_id).await?;
                self.spawn_deadline(handle, duration);
                Ok(Some(RunningAttack::Pause { container_id }))
            }
            PreparedAttack::Stress {
                target,
                cgroup_path,
                opts,
                tolerate_oom_kill,
            } => {
                let running = self
                    .stress
                    .start(&target, &cgroup_path, &opts, tolerate_oom_kill)
                    .await?;
                let kill = running.kill_handle();
                let monitor = self.spawn_stress_monitor(handle, running);
                Ok(Some(RunningAttack::Stress { kill, monitor }))
            }
            PreparedAttack::Network {
                target,
                plan,
                duration,
            } => {
                self.net_ops.apply(&target, &plan).await?;
                self.spawn_deadline(handle, duration);
                Ok(Some(RunningAttack::Network { target, plan }))
            }
        }
    }

    /// Server-side duration bound. The timer calls the regular stop path;
    /// an earlier orchestrator stop makes the expiry a no-op, so the timer
    /// is fire-and-forget.
    fn spawn_deadline(self: &Arc<Self>, handle: &Arc<ActionHandle>, duration: Duration) {
        let coordinator = Arc::clone(self);
        let action_id = handle.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            tracing::debug!(action = %action_id, "action duration expired");
            if let Err(err) = coordinator.stop(&action_id).await {
                tracing::warn!(action = %action_id, error = %err, "self-expiry stop failed");
            }
        });
    }

    fn spawn_stress_monitor(
        self: &Arc<Self>,
        handle: &Arc<ActionHandle>,
        running: faultbox_stress::RunningStress,
    ) -> JoinHandle<()> {
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            let result = running.wait().await;
            let mut state = lock_handle(&handle);
            // A stop in flight owns the terminal transition.
            if matches!(
                state.state,
                ActionState::Stopping | ActionState::Stopped | ActionState::Failed
            ) {
                return;
            }
            match result {
                Ok(()) => state.state = ActionState::Stopped,
                Err(err) => {
                    tracing::warn!(action = %handle.id, error = %err, "stress payload failed");
                    state.state = ActionState::Failed;
                    state.error = Some(err.to_string());
                }
            }
        })
    }

    /// Reports the current state of an action.
    pub fn status(&self, action_id: &str) -> Result<StatusReport> {
        let handle = self.handle(action_id)?;
        Ok(self.report(&handle))
    }

    /// Stops an action from any state.
    ///
    /// Revert runs at most once; concurrent and repeated stops observe the
    /// state machine, not the revert itself.
    pub async fn stop(self: &Arc<Self>, action_id: &str) -> Result<StopReport> {
        let handle = self.handle(action_id)?;

        enum StopWork {
            Nothing(ActionState),
            DropPrepared(PreparedAttack),
            Revert(RunningAttack),
        }

        let work = {
            let mut state = lock_handle(&handle);
            match state.state {
                ActionState::Stopping | ActionState::Stopped | ActionState::Failed => {
                    StopWork::Nothing(state.state.clone())
                }
                ActionState::Preparing => {
                    let prepared = state.prepared.take();
                    state.state = ActionState::Stopped;
                    prepared.map_or(
                        StopWork::Nothing(ActionState::Stopped),
                        StopWork::DropPrepared,
                    )
                }
                ActionState::Running => {
                    state.state = ActionState::Stopping;
                    state.running.take().map_or(
                        StopWork::Nothing(ActionState::Stopping),
                        StopWork::Revert,
                    )
                }
            }
        };

        let mut revert_errors = Vec::new();
        match work {
            StopWork::Nothing(state) => {
                return Ok(StopReport {
                    action_id: action_id.to_string(),
                    state,
                    revert_errors,
                })
            }
            StopWork::DropPrepared(_prepared) => {
                // Nothing was applied yet; bundles are cleaned by their
                // owners, only the registrations have to go.
                self.release_network_state(action_id);
            }
            StopWork::Revert(running) => {
                self.revert(action_id, running, &mut revert_errors).await;
                let mut state = lock_handle(&handle);
                state.state = ActionState::Stopped;
            }
        }

        tracing::info!(
            action = action_id,
            kind = %handle.kind,
            revert_errors = revert_errors.len(),
            "stopped action"
        );
        Ok(StopReport {
            action_id: action_id.to_string(),
            state: ActionState::Stopped,
            revert_errors,
        })
    }

    async fn revert(
        self: &Arc<Self>,
        action_id: &str,
        running: RunningAttack,
        errors: &mut Vec<String>,
    ) {
        match running {
            RunningAttack::Stop => {}
            RunningAttack::Pause { container_id } => {
                if let Err(err) = self.engine.unpause(&container_id).await {
                    tracing::warn!(action = action_id, error = %err, "unpause failed");
                    errors.push(err.to_string());
                }
            }
            RunningAttack::Stress { kill, monitor } => {
                kill.kill().await;
                // The monitor observes the exit and returns quickly; it
                // leaves the terminal transition to us.
                if let Err(err) = monitor.await {
                    tracing::debug!(action = action_id, error = %err, "stress monitor join");
                }
            }
            RunningAttack::Network { target, plan } => {
                if let Err(err) = self.net_ops.revert(&target, &plan).await {
                    tracing::warn!(action = action_id, error = %err, "revert left rules behind");
                    errors.push(err.to_string());
                }
                self.release_network_state(action_id);
            }
        }
    }

    /// Stops every live action; called from the shutdown path.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<String> = self.lock_actions().keys().cloned().collect();
        tracing::info!(actions = ids.len(), "reverting all actions on shutdown");
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                tracing::warn!(action = %id, error = %err, "shutdown stop failed");
            }
        }
    }

    fn release_network_state(&self, action_id: &str) {
        self.classes.release(action_id);
        self.lock_shapings()
            .retain(|shaping| shaping.action_id != action_id);
    }

    fn handle(&self, action_id: &str) -> Result<Arc<ActionHandle>> {
        self.lock_actions()
            .get(action_id)
            .cloned()
            .ok_or_else(|| {
                FaultError::invalid_config(format!("unknown action id '{action_id}'"))
            })
    }

    fn report(&self, handle: &Arc<ActionHandle>) -> StatusReport {
        let state = lock_handle(handle);
        StatusReport {
            action_id: handle.id.clone(),
            state: state.state.clone(),
            started_at: state.started_at,
            error: state.error.clone(),
        }
    }

    fn lock_actions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ActionHandle>>> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_shapings(&self) -> std::sync::MutexGuard<'_, Vec<ActiveShaping>> {
        self.active_shapings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The sidecar executor (used by the HTTP layer for readiness).
    #[must_use]
    pub const fn executor(&self) -> &SidecarExecutor {
        &self.executor
    }

    /// The engine client.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn EngineClient> {
        &self.engine
    }
}

fn lock_handle(handle: &Arc<ActionHandle>) -> std::sync::MutexGuard<'_, HandleState> {
    handle.state.lock().unwrap_or_else(|e| e.into_inner())
}

fn ipnetwork_from_addr(addr: std::net::IpAddr) -> ipnetwork::IpNetwork {
    ipnetwork::IpNetwork::from(addr)
}

fn cross_product(cidrs: Vec<ipnetwork::IpNetwork>, ports: Vec<PortRange>) -> Vec<CidrWithPorts> {
    if cidrs.is_empty() && ports.is_empty() {
        return Vec::new();
    }

    // Ports without addresses mean "those ports anywhere".
    let cidrs = if cidrs.is_empty() {
        vec![
            "0.0.0.0/0".parse().expect("static cidr"),
            "::/0".parse().expect("static cidr"),
        ]
    } else {
        cidrs
    };
    let ports = if ports.is_empty() {
        vec![PortRange::ALL]
    } else {
        ports
    };

    cidrs
        .into_iter()
        .flat_map(|cidr| {
            ports
                .iter()
                .map(move |ports| CidrWithPorts { cidr, ports: *ports })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_product_empty_means_include_all() {
        assert!(cross_product(Vec::new(), Vec::new()).is_empty());
    }

    #[test]
    fn ports_without_addresses_cover_both_families() {
        let tuples = cross_product(Vec::new(), vec![PortRange::single(5001)]);
        assert_eq!(tuples.len(), 2);
        assert!(tuples.iter().any(CidrWithPorts::is_ipv4));
        assert!(tuples.iter().any(|t| !t.is_ipv4()));
        assert!(tuples.iter().all(|t| t.ports == PortRange::single(5001)));
    }

    #[test]
    fn addresses_without_ports_cover_all_ports() {
        let tuples = cross_product(
            vec!["10.0.0.0/8".parse().unwrap()],
            Vec::new(),
        );
        assert_eq!(tuples.len(), 1);
        assert!(tuples[0].ports.is_all());
    }

    #[test]
    fn product_is_every_pair() {
        let tuples = cross_product(
            vec!["10.0.0.0/8".parse().unwrap(), "192.168.0.0/16".parse().unwrap()],
            vec![PortRange::single(80), PortRange::single(443)],
        );
        assert_eq!(tuples.len(), 4);
    }
}
