//! Lifecycle State Machine (C5): the state machine encoded entirely in
//! Proxmox VM names, plus the rename-based transitions that drive it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::{ProviderError, Result};
use crate::proxmox::{PoolMember, SharedGateway};
use crate::settings::Settings;

const PROXMOX_TASK_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A VM's lifecycle state as derived purely from its Proxmox name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalState {
    Creating,
    Running,
    Removing,
}

/// Classifies a pool member's name into a lifecycle state, or `None` if the
/// name doesn't match any configured lifecycle name (not part of the fleet).
pub fn classify_name(settings: &Settings, name: &str) -> Option<LogicalState> {
    if name == settings.instance_name_creating {
        Some(LogicalState::Creating)
    } else if name == settings.instance_name_running {
        Some(LogicalState::Running)
    } else if name == settings.instance_name_removing {
        Some(LogicalState::Removing)
    } else {
        None
    }
}

/// A QEMU pool member that isn't the template itself.
pub fn is_fleet_member(settings: &Settings, member: &PoolMember) -> bool {
    member.kind == "qemu" && member.vmid != settings.template_id
}

/// Marks the given pool members for removal by renaming each to the
/// configured "removing" name, concurrently. Regardless of whether any
/// individual rename failed, the collector trigger is signalled exactly
/// once before returning.
pub async fn mark_instances_for_removal(
    gateway: &SharedGateway,
    settings: &Settings,
    trigger: &mpsc::Sender<()>,
    members: &[PoolMember],
) -> Result<()> {
    let tasks = members.iter().map(|member| {
        let gateway = Arc::clone(gateway);
        let new_name = settings.instance_name_removing.clone();
        let vmid = member.vmid;
        let node = member.node.clone();
        async move {
            let vm = gateway
                .vm_on_node(vmid, &node)
                .await
                .map_err(|e| ProviderError::ProxmoxUnavailable {
                    operation: format!("locating vmid {vmid} to mark for removal"),
                    source: e,
                })?;

            let task = gateway
                .rename(&vm, &new_name)
                .await
                .map_err(|e| ProviderError::ProxmoxUnavailable {
                    operation: format!("renaming vmid {vmid} to {new_name}"),
                    source: e,
                })?;

            gateway
                .wait_task(&task, PROXMOX_TASK_WAIT_TIMEOUT)
                .await
                .map_err(|e| ProviderError::ProxmoxUnavailable {
                    operation: format!("waiting for rename of vmid {vmid}"),
                    source: e,
                })
        }
    });

    let results = futures::future::join_all(tasks).await;

    // The trigger fires after every attempted rename, whether or not any of
    // them succeeded (property #2).
    let _ = trigger.send(()).await;

    for result in results {
        result?;
    }

    Ok(())
}

/// Marks every fleet VM currently named `instance_name_creating` for
/// removal, on the assumption it's a zombie from a previous process
/// lifetime (nothing is actively cloning it right now).
pub async fn stale_sweep(
    gateway: &SharedGateway,
    settings: &Settings,
    trigger: &mpsc::Sender<()>,
) -> Result<()> {
    let pool = gateway
        .pool(&settings.pool)
        .await
        .map_err(|e| ProviderError::ProxmoxUnavailable {
            operation: format!("listing pool {}", settings.pool),
            source: e,
        })?;

    let stale: Vec<PoolMember> = pool
        .into_iter()
        .filter(|member| is_fleet_member(settings, member))
        .filter(|member| classify_name(settings, &member.name) == Some(LogicalState::Creating))
        .collect();

    if stale.is_empty() {
        return Ok(());
    }

    for member in &stale {
        info!(vmid = member.vmid, node = %member.node, "found stale instance, marking for removal");
    }

    if let Err(e) = mark_instances_for_removal(gateway, settings, trigger, &stale).await {
        error!(error = %e, "failed to mark one or more stale instances for removal");
        return Err(e);
    }

    Ok(())
}
