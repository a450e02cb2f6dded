//! Applying and reverting shaping plans through sidecars.
//!
//! Class ids are allocated from the reserved range per interface, guarded
//! by a process-wide registry; tc mutations on an interface are serialized
//! by per-interface async locks. Reverting is best effort: every batch is
//! attempted, failures are collected, and `tc -force` keeps going past
//! state that is already gone, which makes a second revert harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use faultbox_engine::sidecar::{SidecarExecutor, SidecarSpec};
use faultbox_engine::TargetConfig;
use faultbox_error::{FaultError, Result};

use crate::compile::InterfaceAssignment;
use crate::plan::{ShapingPlan, FIRST_ACTION_CLASS, LAST_ACTION_CLASS};

/// Process-wide allocator of per-interface class ids.
///
/// The first action on an interface installs the faultbox root qdisc and
/// gets `install_root = true`; later actions join it as siblings on their
/// own class.
#[derive(Debug, Default)]
pub struct ClassAllocator {
    // interface -> action tag -> class
    inner: Mutex<HashMap<String, HashMap<String, u32>>>,
}

impl ClassAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates one class per interface for an action.
    ///
    /// Fails with `Conflict` when an interface already carries the maximum
    /// number of concurrent shaping actions.
    pub fn allocate(
        &self,
        action_tag: &str,
        interfaces: &[String],
    ) -> Result<Vec<InterfaceAssignment>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| FaultError::internal("class allocator lock poisoned"))?;

        let mut assignments = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            let (install_root, free_class) = {
                let used = inner.entry(interface.clone()).or_default();
                let free = (FIRST_ACTION_CLASS..=LAST_ACTION_CLASS)
                    .find(|class| !used.values().any(|c| c == class));
                (used.is_empty(), free)
            };
            let Some(class) = free_class else {
                // Roll back the classes this call already took so a failed
                // allocation leaves no trace.
                for used in inner.values_mut() {
                    used.remove(action_tag);
                }
                inner.retain(|_, used| !used.is_empty());
                return Err(FaultError::conflict(format!(
                    "interface {interface} already carries {} concurrent shaping actions",
                    LAST_ACTION_CLASS - FIRST_ACTION_CLASS + 1
                )));
            };
            if let Some(used) = inner.get_mut(interface) {
                used.insert(action_tag.to_string(), class);
            }
            assignments.push(InterfaceAssignment {
                interface: interface.clone(),
                class,
                install_root,
            });
        }
        Ok(assignments)
    }

    /// Releases every class an action held.
    pub fn release(&self, action_tag: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            for used in inner.values_mut() {
                used.remove(action_tag);
            }
            inner.retain(|_, used| !used.is_empty());
        }
    }
}

/// Per-interface async locks serializing tc plan mutations.
#[derive(Debug, Default)]
pub struct InterfaceLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InterfaceLocks {
    fn lock_for(&self, interface: &str) -> Arc<AsyncMutex<()>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            inner
                .entry(interface.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Acquires the locks for a set of interfaces in name order, which
    /// keeps concurrent actions from deadlocking on each other.
    async fn lock_all(&self, interfaces: &[String]) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        let mut names: Vec<&String> = interfaces.iter().collect();
        names.sort();
        names.dedup();
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock_for(name).lock_owned().await);
        }
        guards
    }
}

/// Applies and reverts shaping plans.
pub struct NetworkOps {
    executor: SidecarExecutor,
    locks: InterfaceLocks,
}

impl NetworkOps {
    /// Creates the ops layer over a sidecar executor.
    #[must_use]
    pub fn new(executor: SidecarExecutor) -> Self {
        Self {
            executor,
            locks: InterfaceLocks::default(),
        }
    }

    /// The underlying sidecar executor.
    #[must_use]
    pub const fn executor(&self) -> &SidecarExecutor {
        &self.executor
    }

    /// Installs the plan in the target netns.
    ///
    /// If the firewall half fails after the qdisc half was installed, the
    /// qdisc state is rolled back before the error is returned.
    pub async fn apply(&self, target: &TargetConfig, plan: &ShapingPlan) -> Result<()> {
        let interfaces: Vec<String> =
            plan.interfaces.iter().map(|p| p.interface.clone()).collect();
        let _guards = self.locks.lock_all(&interfaces).await;

        let tc_batch = plan.render_tc_apply();
        if !tc_batch.is_empty() {
            self.tc_batch(target, tc_batch, false).await?;
        }

        if let Err(err) = self.apply_firewall(target, plan).await {
            let revert_batch = plan.render_tc_revert();
            if !revert_batch.is_empty() {
                if let Err(revert_err) = self.tc_batch(target, revert_batch, true).await {
                    tracing::warn!(error = %revert_err, "tc rollback after firewall failure also failed");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the plan from the target netns, best effort.
    ///
    /// Every batch is attempted; the first failure is returned after all
    /// of them ran. `tc -force` skips entries that are already gone, so
    /// calling this twice converges to the same state.
    pub async fn revert(&self, target: &TargetConfig, plan: &ShapingPlan) -> Result<()> {
        let interfaces: Vec<String> =
            plan.interfaces.iter().map(|p| p.interface.clone()).collect();
        let _guards = self.locks.lock_all(&interfaces).await;

        let mut first_error = None;

        for (batch, tool) in [
            (plan.render_fw_revert_v4(), "iptables-restore"),
            (plan.render_fw_revert_v6(), "ip6tables-restore"),
        ] {
            if let Some(batch) = batch {
                if let Err(err) = self.firewall_restore(target, tool, batch).await {
                    tracing::warn!(tool, error = %err, "firewall revert failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        let tc_batch = plan.render_tc_revert();
        if !tc_batch.is_empty() {
            if let Err(err) = self.tc_batch(target, tc_batch, true).await {
                tracing::warn!(error = %err, "tc revert failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn apply_firewall(&self, target: &TargetConfig, plan: &ShapingPlan) -> Result<()> {
        if let Some(batch) = plan.render_fw_apply_v4() {
            self.firewall_restore(target, "iptables-restore", batch)
                .await?;
        }
        if let Some(batch) = plan.render_fw_apply_v6() {
            self.firewall_restore(target, "ip6tables-restore", batch)
                .await?;
        }
        Ok(())
    }

    async fn tc_batch(&self, target: &TargetConfig, batch: String, force: bool) -> Result<()> {
        let mut args = vec!["tc".to_string()];
        if force {
            args.push("-force".to_string());
        }
        args.push("-batch".to_string());
        args.push("-".to_string());
        tracing::debug!(batch = %batch.trim_end(), "tc batch");
        self.executor
            .run(target, SidecarSpec::netns("tc", args).with_stdin(batch))
            .await
            .map(|_| ())
    }

    async fn firewall_restore(
        &self,
        target: &TargetConfig,
        tool: &str,
        batch: String,
    ) -> Result<()> {
        tracing::debug!(tool, batch = %batch.trim_end(), "firewall batch");
        self.executor
            .run(
                target,
                SidecarSpec::netns(
                    "fw",
                    vec![tool.to_string(), "--noflush".to_string()],
                )
                .with_stdin(batch),
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_action_installs_root_second_adopts() {
        let allocator = ClassAllocator::new();
        let a = allocator
            .allocate("fb-a", &["eth0".to_string()])
            .unwrap();
        assert_eq!(a[0].class, FIRST_ACTION_CLASS);
        assert!(a[0].install_root);

        let b = allocator
            .allocate("fb-b", &["eth0".to_string()])
            .unwrap();
        assert_eq!(b[0].class, FIRST_ACTION_CLASS + 1);
        assert!(!b[0].install_root);
    }

    #[test]
    fn release_frees_the_class() {
        let allocator = ClassAllocator::new();
        allocator.allocate("fb-a", &["eth0".to_string()]).unwrap();
        allocator.release("fb-a");
        let again = allocator.allocate("fb-b", &["eth0".to_string()]).unwrap();
        assert_eq!(again[0].class, FIRST_ACTION_CLASS);
        assert!(again[0].install_root);
    }

    #[test]
    fn allocator_rejects_more_actions_than_classes() {
        let allocator = ClassAllocator::new();
        let eth0 = vec!["eth0".to_string()];
        for i in FIRST_ACTION_CLASS..=LAST_ACTION_CLASS {
            allocator.allocate(&format!("fb-{i}"), &eth0).unwrap();
        }
        let err = allocator.allocate("fb-overflow", &eth0).unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn different_interfaces_are_independent() {
        let allocator = ClassAllocator::new();
        let a = allocator.allocate("fb-a", &["eth0".to_string()]).unwrap();
        let b = allocator.allocate("fb-b", &["eth1".to_string()]).unwrap();
        assert!(a[0].install_root);
        assert!(b[0].install_root);
        assert_eq!(a[0].class, b[0].class);
    }

    #[tokio::test]
    async fn interface_locks_are_acquired_in_sorted_order() {
        let locks = InterfaceLocks::default();
        let guards = locks
            .lock_all(&["eth1".to_string(), "eth0".to_string(), "eth1".to_string()])
            .await;
        // Duplicate names are collapsed, otherwise re-locking eth1 would
        // deadlock right here.
        assert_eq!(guards.len(), 2);
    }
}
