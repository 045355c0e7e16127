//! Removal Collector (C7): a background task that discovers VMs in the
//! "removing" state and deletes them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::lifecycle::{classify_name, is_fleet_member, LogicalState};
use crate::proxmox::{PoolMember, SharedGateway, VmStatus};
use crate::settings::Settings;

const COLLECTION_INTERVAL: Duration = Duration::from_secs(60);
const COLLECTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const COLLECTION_WAIT_AFTER_TRIGGER: Duration = Duration::from_secs(10);

/// Handle to a running collector task, returned by [`spawn`].
pub struct Collector {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Collector {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.handle.await;
    }
}

/// Starts the collector background task. It runs an initial collection
/// pass immediately, then wakes on a 60-second interval or the trigger
/// channel until shut down.
pub fn spawn(
    gateway: SharedGateway,
    settings: Arc<Settings>,
    clone_exclusion: Arc<Mutex<()>>,
    mut trigger_rx: mpsc::Receiver<()>,
) -> Collector {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        collect_removed_instances(&gateway, &settings, &clone_exclusion).await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(COLLECTION_INTERVAL) => {
                    collect_removed_instances(&gateway, &settings, &clone_exclusion).await;
                }
                Some(()) = trigger_rx.recv() => {
                    drain_trigger_channel(&mut trigger_rx);
                    tokio::time::sleep(COLLECTION_WAIT_AFTER_TRIGGER).await;
                    collect_removed_instances(&gateway, &settings, &clone_exclusion).await;
                }
            }
        }
    });

    Collector {
        shutdown: shutdown_tx,
        handle,
    }
}

fn drain_trigger_channel(trigger_rx: &mut mpsc::Receiver<()>) {
    while trigger_rx.try_recv().is_ok() {}
}

async fn collect_removed_instances(
    gateway: &SharedGateway,
    settings: &Settings,
    clone_exclusion: &Arc<Mutex<()>>,
) {
    let pool = {
        let _guard = clone_exclusion.lock().await;
        match gateway.pool(&settings.pool).await {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "collector failed to list instances");
                return;
            }
        }
    };

    let to_remove: Vec<PoolMember> = pool
        .into_iter()
        .filter(|member| is_fleet_member(settings, member))
        .filter(|member| classify_name(settings, &member.name) == Some(LogicalState::Removing))
        .collect();

    let tasks = to_remove.into_iter().map(|member| {
        info!(vmid = member.vmid, name = %member.name, "collector found instance to remove");
        let gateway = Arc::clone(gateway);
        async move { collect_instance(&gateway, &member).await }
    });

    futures::future::join_all(tasks).await;
}

async fn collect_instance(gateway: &SharedGateway, member: &PoolMember) {
    let vm = match gateway.vm_on_node(member.vmid, &member.node).await {
        Ok(vm) => vm,
        Err(e) => {
            error!(vmid = member.vmid, error = %e, "collector failed to fetch instance info");
            return;
        }
    };

    if vm.status == VmStatus::Running {
        let stop = match gateway.stop(&vm).await {
            Ok(task) => gateway.wait_task(&task, COLLECTION_TIMEOUT).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stop {
            error!(vmid = member.vmid, error = %e, "collector failed to stop instance");
            return;
        }
    }

    let delete = match gateway.delete(&vm).await {
        Ok(task) => gateway.wait_task(&task, COLLECTION_TIMEOUT).await,
        Err(e) => Err(e),
    };
    if let Err(e) = delete {
        error!(vmid = member.vmid, error = %e, "collector failed to delete instance");
    }
}
