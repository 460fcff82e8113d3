//! Shared handles passed to every pod operation.

use crate::config::Config;
use crate::executor::CommandExecutor;
use crate::ledger::{AuditLedger, LedgerStore};
use crate::notify::{Notification, NotificationId, Notifier};
use crate::pod::{PodDriver, PodStateView};
use crate::recovery::DurableStore;
use crate::sync::PumpSync;
use std::sync::Arc;

/// Driver, ledger, synchronized view and the other collaborators of one pod
/// session
pub struct PodContext {
    pub driver: Arc<dyn PodDriver>,
    pub ledger: AuditLedger,
    pub pump_sync: Arc<dyn PumpSync>,
    pub recovery: Arc<dyn DurableStore>,
    pub notifier: Arc<dyn Notifier>,
    pub pod_state: Arc<dyn PodStateView>,
    pub config: Config,
    pub executor: CommandExecutor,
}

impl PodContext {
    pub fn new(
        driver: Arc<dyn PodDriver>,
        ledger_store: Arc<dyn LedgerStore>,
        pump_sync: Arc<dyn PumpSync>,
        recovery: Arc<dyn DurableStore>,
        notifier: Arc<dyn Notifier>,
        pod_state: Arc<dyn PodStateView>,
        config: Config,
    ) -> Self {
        Self {
            driver,
            ledger: AuditLedger::new(ledger_store, pod_state.clone()),
            pump_sync,
            recovery,
            executor: CommandExecutor::new(notifier.clone()),
            notifier,
            pod_state,
            config,
        }
    }

    /// Serial attached to synced records; `-` when no pod is initialized.
    pub fn serial_number(&self) -> String {
        self.pod_state
            .address()
            .map_or_else(|| "-".to_string(), |a| a.to_string())
    }

    pub(crate) fn notify_urgent(&self, id: NotificationId, message: impl Into<String>, sound: bool) {
        self.notifier.notify(Notification::urgent(id, message, sound));
    }

    pub(crate) fn dismiss(&self, id: NotificationId) {
        self.notifier.dismiss(id);
    }
}

#[cfg(test)]
pub(crate) mod test_rig {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::notify::RecordingNotifier;
    use crate::pod::SharedPodState;
    use crate::recovery::MemoryDurableStore;
    use crate::scripted::ScriptedDriver;
    use crate::sync::MemoryPumpSync;

    /// Context wired to in-memory collaborators, with typed handles kept
    pub(crate) struct Rig {
        pub ctx: Arc<PodContext>,
        pub driver: Arc<ScriptedDriver>,
        pub ledger: Arc<MemoryLedger>,
        pub sync: Arc<MemoryPumpSync>,
        pub recovery: Arc<MemoryDurableStore>,
        pub notifier: Arc<RecordingNotifier>,
        pub pod_state: Arc<SharedPodState>,
    }

    impl Rig {
        pub(crate) fn new() -> Self {
            let pod_state = Arc::new(SharedPodState::activated(0x1f0e_89f0));
            let driver = Arc::new(ScriptedDriver::new(pod_state.clone()));
            let ledger = Arc::new(MemoryLedger::new());
            let sync = Arc::new(MemoryPumpSync::new());
            let recovery = Arc::new(MemoryDurableStore::new());
            let notifier = Arc::new(RecordingNotifier::new());
            let ctx = Arc::new(PodContext::new(
                driver.clone(),
                ledger.clone(),
                sync.clone(),
                recovery.clone(),
                notifier.clone(),
                pod_state.clone(),
                Config::default(),
            ));
            Self {
                ctx,
                driver,
                ledger,
                sync,
                recovery,
                notifier,
                pod_state,
            }
        }

        pub(crate) fn entry_types(&self) -> Vec<crate::ledger::LedgerEntryType> {
            self.ledger
                .records()
                .unwrap()
                .into_iter()
                .map(|r| r.entry_type)
                .collect()
        }
    }
}
