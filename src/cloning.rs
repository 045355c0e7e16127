//! Cloning Pipeline (C6): clone, wait, start, wait for guest agent,
//! finalise state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::ProviderError;
use crate::proxmox::{CloneOptions, SharedGateway};
use crate::settings::Settings;

const PROXMOX_TASK_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const PROXMOX_AGENT_START_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Deploys one VM cloned from the configured template. The clone RPC itself
/// is serialised through `clone_serial` — a mutex created fresh for the
/// whole `Increase` batch this deployment belongs to, not the persistent
/// cloning-exclusion mutex held by `Increase`/`Update`/the collector.
///
/// Returns the assigned vmid on success. On failure the vmid is still
/// returned alongside the error when one was assigned (i.e. whenever the
/// clone itself succeeded), so the caller can report it.
pub async fn deploy_instance(
    gateway: &SharedGateway,
    settings: &Settings,
    source_vmid: u32,
    source_is_template: bool,
    clone_serial: &Arc<Mutex<()>>,
) -> std::result::Result<u32, (Option<u32>, ProviderError)> {
    if !source_is_template && settings.storage.is_none() {
        return Err((
            None,
            ProviderError::CloneInfeasible {
                source_vmid,
            },
        ));
    }

    let clone_opts = CloneOptions {
        name: settings.instance_name_creating.clone(),
        pool: settings.pool.clone(),
        storage: settings.storage.clone(),
        full: !source_is_template || settings.storage.is_some(),
    };

    let (vmid, task) = {
        let _guard = clone_serial.lock().await;
        gateway
            .clone(source_vmid, clone_opts)
            .await
            .map_err(|e| {
                (
                    None,
                    ProviderError::ProxmoxUnavailable {
                        operation: format!("cloning template {source_vmid}"),
                        source: e,
                    },
                )
            })?
    };

    info!(vmid, "deploying new instance");

    if let Err(e) = gateway.wait_task(&task, PROXMOX_TASK_WAIT_TIMEOUT).await {
        return Err((
            Some(vmid),
            ProviderError::DeploymentFailed {
                vmid,
                source: e.context("waiting for clone task"),
            },
        ));
    }

    let vm = match gateway.locate_vm(&settings.pool, vmid).await {
        Ok(vm) => vm,
        Err(e) => {
            // Locating the VM failed before a handle was ever obtained: no
            // rename is attempted, matching the pipeline's failure-before-handle
            // case exactly.
            return Err((
                Some(vmid),
                ProviderError::DeploymentFailed {
                    vmid,
                    source: e.context("locating newly cloned instance"),
                },
            ));
        }
    };

    let outcome = async {
        let start_task = gateway.start(&vm).await?;
        gateway.wait_task(&start_task, PROXMOX_TASK_WAIT_TIMEOUT).await?;
        gateway
            .wait_for_agent(&vm, PROXMOX_AGENT_START_TIMEOUT)
            .await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    let new_name = if outcome.is_ok() {
        &settings.instance_name_running
    } else {
        &settings.instance_name_removing
    };

    if outcome.is_err() {
        error!(vmid, "instance deployment failed, marking for removal");
    }

    match gateway.rename(&vm, new_name).await {
        Ok(task) => {
            if let Err(e) = gateway.wait_task(&task, PROXMOX_TASK_WAIT_TIMEOUT).await {
                error!(vmid, error = %e, "failed to wait for instance rename");
            }
        }
        Err(e) => error!(vmid, error = %e, "failed to rename instance"),
    }

    match outcome {
        Ok(()) => Ok(vmid),
        Err(e) => Err((
            Some(vmid),
            ProviderError::DeploymentFailed {
                vmid,
                source: e,
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::AgentNetworkIface;
    use crate::proxmox::{PoolMember, ProxmoxGateway, TaskHandle, VmHandle, VmStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct MockGateway {
        next_vmid: AtomicU32,
        fail_agent: bool,
        renamed: TokioMutex<Vec<(u32, String)>>,
    }

    #[async_trait]
    impl ProxmoxGateway for MockGateway {
        async fn pool(&self, _pool: &str) -> anyhow::Result<Vec<PoolMember>> {
            Ok(vec![])
        }
        async fn vm_on_node(&self, vmid: u32, _node: &str) -> anyhow::Result<VmHandle> {
            Ok(VmHandle {
                vmid,
                node: "pve1".into(),
                status: VmStatus::Stopped,
            })
        }
        async fn locate_vm(&self, _pool: &str, vmid: u32) -> anyhow::Result<VmHandle> {
            Ok(VmHandle {
                vmid,
                node: "pve1".into(),
                status: VmStatus::Stopped,
            })
        }
        async fn clone(
            &self,
            _source_vmid: u32,
            _opts: CloneOptions,
        ) -> anyhow::Result<(u32, TaskHandle)> {
            let vmid = self.next_vmid.fetch_add(1, Ordering::SeqCst);
            Ok((vmid, TaskHandle { upid: String::new() }))
        }
        async fn start(&self, _vm: &VmHandle) -> anyhow::Result<TaskHandle> {
            Ok(TaskHandle { upid: String::new() })
        }
        async fn stop(&self, _vm: &VmHandle) -> anyhow::Result<TaskHandle> {
            Ok(TaskHandle { upid: String::new() })
        }
        async fn delete(&self, _vm: &VmHandle) -> anyhow::Result<TaskHandle> {
            Ok(TaskHandle { upid: String::new() })
        }
        async fn rename(&self, vm: &VmHandle, name: &str) -> anyhow::Result<TaskHandle> {
            self.renamed.lock().await.push((vm.vmid, name.to_string()));
            Ok(TaskHandle { upid: String::new() })
        }
        async fn wait_task(&self, _task: &TaskHandle, _timeout: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn wait_for_agent(&self, _vm: &VmHandle, _timeout: Duration) -> anyhow::Result<()> {
            if self.fail_agent {
                anyhow::bail!("agent never came up")
            } else {
                Ok(())
            }
        }
        async fn agent_network_ifaces(
            &self,
            _vm: &VmHandle,
        ) -> anyhow::Result<Vec<AgentNetworkIface>> {
            Ok(vec![])
        }
        async fn refresh_ticket(&self, _credentials: &crate::proxmox::Credentials) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn settings(storage: Option<&str>) -> Settings {
        Settings {
            url: "https://pve.example.com:8006".into(),
            insecure_skip_tls_verify: false,
            credentials_file_path: "/etc/creds.json".into(),
            pool: "ci-runners".into(),
            storage: storage.map(str::to_string),
            template_id: 9000,
            max_instances: 10,
            instance_network_interface: "ens18".into(),
            instance_network_protocol: crate::settings::NetworkProtocol::Ipv4,
            instance_name_creating: "fleeting-creating".into(),
            instance_name_running: "fleeting-running".into(),
            instance_name_removing: "fleeting-removing".into(),
        }
    }

    #[tokio::test]
    async fn successful_deployment_renames_to_running() {
        let gateway: SharedGateway = Arc::new(MockGateway {
            next_vmid: AtomicU32::new(100),
            fail_agent: false,
            renamed: TokioMutex::new(vec![]),
        });
        let settings = settings(Some("local-zfs"));
        let serial = Arc::new(Mutex::new(()));

        let vmid = deploy_instance(&gateway, &settings, 9000, true, &serial)
            .await
            .unwrap();
        assert_eq!(vmid, 100);
    }

    #[tokio::test]
    async fn failed_guest_agent_renames_to_removing() {
        let gateway: SharedGateway = Arc::new(MockGateway {
            next_vmid: AtomicU32::new(200),
            fail_agent: true,
            renamed: TokioMutex::new(vec![]),
        });
        let settings = settings(Some("local-zfs"));
        let serial = Arc::new(Mutex::new(()));

        let err = deploy_instance(&gateway, &settings, 9000, true, &serial)
            .await
            .unwrap_err();
        assert_eq!(err.0, Some(200));
        assert!(matches!(err.1, ProviderError::DeploymentFailed { vmid: 200, .. }));
    }

    #[tokio::test]
    async fn clone_without_storage_on_non_template_is_infeasible() {
        let gateway: SharedGateway = Arc::new(MockGateway {
            next_vmid: AtomicU32::new(300),
            fail_agent: false,
            renamed: TokioMutex::new(vec![]),
        });
        let settings = settings(None);
        let serial = Arc::new(Mutex::new(()));

        let err = deploy_instance(&gateway, &settings, 9000, false, &serial)
            .await
            .unwrap_err();
        assert!(matches!(err.1, ProviderError::CloneInfeasible { .. }));
    }
}
