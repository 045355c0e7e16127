//! Instance Group Facade (C8): the orchestrator-facing surface — Init,
//! Update, Increase, Decrease, ConnectInfo, Shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::cloning;
use crate::collector::{self, Collector};
use crate::error::{ProviderError, Result};
use crate::lifecycle::{self, classify_name, is_fleet_member, LogicalState};
use crate::network;
use crate::proxmox::{PoolMember, ProxmoxApiGateway, SharedGateway};
use crate::session::{self, SessionKeeper};
use crate::settings::{Settings, SettingsInput};

const STALE_SWEEP_QUIESCENCE: Duration = Duration::from_secs(10);
const COLLECTION_TRIGGER_CAPACITY: usize = 100;

/// Provider identity returned by `Init`.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub max_size: u32,
}

/// One VM as reported to the orchestrator by `Update`.
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub id: String,
    pub state: LogicalState,
}

/// Endpoint information returned by `ConnectInfo`.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub id: String,
    pub internal_addr: String,
    pub external_addr: String,
    pub connector_config: ConnectorConfig,
}

/// Connection parameters negotiated by the orchestrator at `Init` time and
/// never interpreted by this provider. Stored verbatim and handed back
/// unmodified from every `ConnectInfo` call.
#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    pub os: u32,
    pub arch: u32,
    pub protocol: String,
    pub port: u32,
    pub username: String,
    pub key: Vec<u8>,
    pub use_static_credentials: bool,
}

/// The long-lived process-wide entity bound to a single Proxmox pool.
pub struct InstanceGroup {
    settings: Arc<Settings>,
    gateway: SharedGateway,
    clone_exclusion: Arc<Mutex<()>>,
    collection_trigger: mpsc::Sender<()>,
    collector: Mutex<Option<Collector>>,
    session_keeper: Mutex<Option<SessionKeeper>>,
    connector_config: ConnectorConfig,
}

impl InstanceGroup {
    /// Validates `settings_json`, builds a real Proxmox gateway, and runs
    /// the full `Init` sequence.
    pub async fn init(
        settings_json: &str,
        connector_config: ConnectorConfig,
    ) -> Result<(Self, ProviderInfo)> {
        let input: SettingsInput = serde_json::from_str(settings_json).map_err(|e| {
            ProviderError::ConfigInvalid {
                field: "settings".into(),
                reason: e.to_string(),
            }
        })?;
        let settings = input.validate()?;

        let gateway: SharedGateway = Arc::new(
            ProxmoxApiGateway::new(&settings.url, settings.insecure_skip_tls_verify).map_err(
                |e| ProviderError::ProxmoxUnavailable {
                    operation: "constructing proxmox client".into(),
                    source: e,
                },
            )?,
        );

        Self::init_with_gateway(settings, gateway, connector_config).await
    }

    /// Runs the `Init` sequence against an already-constructed gateway.
    /// Exists so tests (and alternate transports) can inject a mock
    /// [`crate::proxmox::ProxmoxGateway`].
    pub async fn init_with_gateway(
        settings: Settings,
        gateway: SharedGateway,
        connector_config: ConnectorConfig,
    ) -> Result<(Self, ProviderInfo)> {
        let settings = Arc::new(settings);
        let (trigger_tx, trigger_rx) = mpsc::channel(COLLECTION_TRIGGER_CAPACITY);
        let clone_exclusion = Arc::new(Mutex::new(()));

        lifecycle::stale_sweep(&gateway, &settings, &trigger_tx).await?;
        tokio::time::sleep(STALE_SWEEP_QUIESCENCE).await;

        let collector = collector::spawn(
            gateway.clone(),
            settings.clone(),
            clone_exclusion.clone(),
            trigger_rx,
        );
        let session_keeper = session::spawn(gateway.clone(), settings.credentials_file_path.clone());

        let info = ProviderInfo {
            id: settings.pool.clone(),
            max_size: settings.max_instances,
        };

        let group = InstanceGroup {
            settings,
            gateway,
            clone_exclusion,
            collection_trigger: trigger_tx,
            collector: Mutex::new(Some(collector)),
            session_keeper: Mutex::new(Some(session_keeper)),
            connector_config,
        };

        Ok((group, info))
    }

    /// Lists the pool under the cloning exclusion mutex and reports the
    /// state of every fleet VM. Unknown-named VMs are silently skipped.
    pub async fn update(&self) -> Result<Vec<InstanceUpdate>> {
        let pool = {
            let _guard = self.clone_exclusion.lock().await;
            self.list_pool().await?
        };

        Ok(pool
            .into_iter()
            .filter(|member| is_fleet_member(&self.settings, member))
            .filter_map(|member| {
                classify_name(&self.settings, &member.name).map(|state| InstanceUpdate {
                    id: member.vmid.to_string(),
                    state,
                })
            })
            .collect())
    }

    /// Holds the cloning exclusion mutex for the entire batch, then spawns
    /// `count` concurrent Cloning Pipelines, each serialised against the
    /// others only for the individual clone RPC via a freshly created
    /// `clone_serial` mutex.
    pub async fn increase(&self, count: u32) -> Result<(Vec<u32>, Option<ProviderError>)> {
        let _guard = self.clone_exclusion.lock().await;

        let template_vm = self
            .gateway
            .locate_vm(&self.settings.pool, self.settings.template_id)
            .await
            .map_err(|e| ProviderError::ProxmoxUnavailable {
                operation: format!("locating template vmid {}", self.settings.template_id),
                source: e,
            })?;
        let source_is_template = self.gateway.is_template(&template_vm).await.map_err(|e| {
            ProviderError::ProxmoxUnavailable {
                operation: format!("checking template flag of vmid {}", self.settings.template_id),
                source: e,
            }
        })?;

        let clone_serial = Arc::new(Mutex::new(()));

        let tasks = (0..count).map(|_| {
            let gateway = self.gateway.clone();
            let settings = self.settings.clone();
            let clone_serial = clone_serial.clone();
            let template_id = self.settings.template_id;
            async move {
                cloning::deploy_instance(
                    &gateway,
                    &settings,
                    template_id,
                    source_is_template,
                    &clone_serial,
                )
                .await
            }
        });

        let results = futures::future::join_all(tasks).await;

        let mut succeeded = Vec::new();
        let mut first_failure = None;
        for result in results {
            match result {
                Ok(vmid) => succeeded.push(vmid),
                Err((_, e)) => {
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }

        Ok((succeeded, first_failure))
    }

    /// Acknowledges each requested vmid idempotently: CREATING vmids are
    /// skipped (cannot be safely deleted mid-clone), REMOVING vmids are
    /// acknowledged without a second rename, RUNNING vmids are marked for
    /// removal and acknowledged.
    pub async fn decrease(&self, vmids: &[u32]) -> Result<Vec<u32>> {
        let pool = self.list_pool().await?;

        let mut acknowledged = Vec::new();
        let mut to_mark: Vec<PoolMember> = Vec::new();

        for vmid in vmids {
            let Some(member) = pool
                .iter()
                .find(|m| is_fleet_member(&self.settings, m) && m.vmid == *vmid)
            else {
                continue;
            };

            match classify_name(&self.settings, &member.name) {
                Some(LogicalState::Creating) => continue,
                Some(LogicalState::Removing) => acknowledged.push(*vmid),
                Some(LogicalState::Running) => {
                    acknowledged.push(*vmid);
                    to_mark.push(member.clone());
                }
                None => continue,
            }
        }

        if !to_mark.is_empty() {
            lifecycle::mark_instances_for_removal(
                &self.gateway,
                &self.settings,
                &self.collection_trigger,
                &to_mark,
            )
            .await?;
        }

        Ok(acknowledged)
    }

    /// Looks up the requested vmid, queries its guest agent, and runs the
    /// Address Resolver.
    pub async fn connect_info(&self, vmid: u32) -> Result<ConnectInfo> {
        let pool = self.list_pool().await?;
        let member = pool
            .into_iter()
            .find(|m| m.kind == "qemu" && m.vmid == vmid)
            .ok_or(ProviderError::NotFound(vmid))?;

        let vm = self
            .gateway
            .vm_on_node(vmid, &member.node)
            .await
            .map_err(|e| ProviderError::ProxmoxUnavailable {
                operation: format!("fetching vm info for vmid {vmid}"),
                source: e,
            })?;

        let ifaces = self
            .gateway
            .agent_network_ifaces(&vm)
            .await
            .map_err(|e| ProviderError::ProxmoxUnavailable {
                operation: format!("querying guest agent network interfaces for vmid {vmid}"),
                source: e,
            })?;

        let (internal_addr, external_addr) = network::resolve_addresses(
            &ifaces,
            &self.settings.instance_network_interface,
            self.settings.instance_network_protocol,
            vmid,
        )?;

        Ok(ConnectInfo {
            id: vmid.to_string(),
            internal_addr,
            external_addr,
            connector_config: self.connector_config.clone(),
        })
    }

    /// Signals collector and session-keeper shutdown and waits for both.
    /// The Proxmox gateway is not drained; shutdown must not block
    /// indefinitely on in-flight API calls.
    pub async fn shutdown(&self) {
        info!("shutting down instance group");
        if let Some(collector) = self.collector.lock().await.take() {
            collector.shutdown().await;
        }
        if let Some(session_keeper) = self.session_keeper.lock().await.take() {
            session_keeper.shutdown().await;
        }
    }

    async fn list_pool(&self) -> Result<Vec<PoolMember>> {
        self.gateway
            .pool(&self.settings.pool)
            .await
            .map_err(|e| ProviderError::ProxmoxUnavailable {
                operation: format!("listing pool {}", self.settings.pool),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::AgentNetworkIface;
    use crate::proxmox::{CloneOptions, Credentials, ProxmoxGateway, TaskHandle, VmHandle, VmStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct MockGateway {
        pool: TokioMutex<Vec<PoolMember>>,
        next_vmid: AtomicU32,
        renamed: TokioMutex<Vec<(u32, String)>>,
        fail_agent_for_vmid: Option<u32>,
    }

    #[async_trait]
    impl ProxmoxGateway for MockGateway {
        async fn pool(&self, _pool: &str) -> anyhow::Result<Vec<PoolMember>> {
            Ok(self.pool.lock().await.clone())
        }
        async fn vm_on_node(&self, vmid: u32, node: &str) -> anyhow::Result<VmHandle> {
            Ok(VmHandle::new(vmid, node, VmStatus::Stopped))
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
            let mut pool = self.pool.lock().await;
            if let Some(member) = pool.iter_mut().find(|m| m.vmid == vm.vmid) {
                member.name = name.to_string();
            }
            Ok(TaskHandle { upid: String::new() })
        }
        async fn wait_task(&self, _task: &TaskHandle, _timeout: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn wait_for_agent(&self, vm: &VmHandle, _timeout: Duration) -> anyhow::Result<()> {
            if self.fail_agent_for_vmid == Some(vm.vmid) {
                anyhow::bail!("agent never came up");
            }
            Ok(())
        }
        async fn agent_network_ifaces(
            &self,
            _vm: &VmHandle,
        ) -> anyhow::Result<Vec<AgentNetworkIface>> {
            Ok(vec![])
        }
        async fn refresh_ticket(&self, _credentials: &Credentials) -> anyhow::Result<()> {
            Ok(())
        }
        async fn is_template(&self, _vm: &VmHandle) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn settings() -> Settings {
        Settings {
            url: "https://pve.example.com:8006".into(),
            insecure_skip_tls_verify: false,
            credentials_file_path: "/etc/creds.json".into(),
            pool: "ci-runners".into(),
            storage: None,
            template_id: 9000,
            max_instances: 10,
            instance_network_interface: "ens18".into(),
            instance_network_protocol: crate::settings::NetworkProtocol::Ipv4,
            instance_name_creating: "fleeting-creating".into(),
            instance_name_running: "fleeting-running".into(),
            instance_name_removing: "fleeting-removing".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn s6_decrease_skips_creating_vmid_silently() {
        let mock = Arc::new(MockGateway {
            pool: TokioMutex::new(vec![PoolMember {
                vmid: 200,
                node: "pve1".into(),
                kind: "qemu".into(),
                name: "fleeting-creating".into(),
            }]),
            next_vmid: AtomicU32::new(1),
            renamed: TokioMutex::new(vec![]),
            fail_agent_for_vmid: None,
        });
        let gateway: SharedGateway = mock.clone();
        let (group, _info) = InstanceGroup::init_with_gateway(settings(), gateway, ConnectorConfig::default())
            .await
            .unwrap();

        let acknowledged = group.decrease(&[200]).await.unwrap();
        assert!(acknowledged.is_empty());
        assert!(mock.renamed.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn decrease_is_idempotent_for_already_removing_vmid() {
        let mock = Arc::new(MockGateway {
            pool: TokioMutex::new(vec![PoolMember {
                vmid: 300,
                node: "pve1".into(),
                kind: "qemu".into(),
                name: "fleeting-removing".into(),
            }]),
            next_vmid: AtomicU32::new(1),
            renamed: TokioMutex::new(vec![]),
            fail_agent_for_vmid: None,
        });
        let gateway: SharedGateway = mock.clone();
        let (group, _info) = InstanceGroup::init_with_gateway(settings(), gateway, ConnectorConfig::default())
            .await
            .unwrap();

        let first = group.decrease(&[300]).await.unwrap();
        let second = group.decrease(&[300]).await.unwrap();
        assert_eq!(first, vec![300]);
        assert_eq!(second, vec![300]);
        assert!(mock.renamed.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn decrease_marks_running_vmid_for_removal() {
        let mock = Arc::new(MockGateway {
            pool: TokioMutex::new(vec![PoolMember {
                vmid: 400,
                node: "pve1".into(),
                kind: "qemu".into(),
                name: "fleeting-running".into(),
            }]),
            next_vmid: AtomicU32::new(1),
            renamed: TokioMutex::new(vec![]),
            fail_agent_for_vmid: None,
        });
        let gateway: SharedGateway = mock.clone();
        let (group, _info) = InstanceGroup::init_with_gateway(settings(), gateway, ConnectorConfig::default())
            .await
            .unwrap();

        let acknowledged = group.decrease(&[400]).await.unwrap();
        assert_eq!(acknowledged, vec![400]);
        assert_eq!(
            mock.renamed.lock().await.as_slice(),
            &[(400, "fleeting-removing".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn update_skips_unknown_named_vms() {
        let mock = Arc::new(MockGateway {
            pool: TokioMutex::new(vec![
                PoolMember {
                    vmid: 500,
                    node: "pve1".into(),
                    kind: "qemu".into(),
                    name: "fleeting-running".into(),
                },
                PoolMember {
                    vmid: 501,
                    node: "pve1".into(),
                    kind: "qemu".into(),
                    name: "some-other-vm".into(),
                },
            ]),
            next_vmid: AtomicU32::new(1),
            renamed: TokioMutex::new(vec![]),
            fail_agent_for_vmid: None,
        });
        let gateway: SharedGateway = mock.clone();
        let (group, _info) = InstanceGroup::init_with_gateway(settings(), gateway, ConnectorConfig::default())
            .await
            .unwrap();

        let updates = group.update().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, "500");
        assert_eq!(updates[0].state, LogicalState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn init_returns_pool_as_provider_id_and_max_instances_as_max_size() {
        let mock = Arc::new(MockGateway {
            pool: TokioMutex::new(vec![]),
            next_vmid: AtomicU32::new(1),
            renamed: TokioMutex::new(vec![]),
            fail_agent_for_vmid: None,
        });
        let gateway: SharedGateway = mock.clone();
        let (_group, info) = InstanceGroup::init_with_gateway(settings(), gateway, ConnectorConfig::default())
            .await
            .unwrap();

        assert_eq!(info.id, "ci-runners");
        assert_eq!(info.max_size, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn s5_increase_with_mid_batch_failure() {
        let mock = Arc::new(MockGateway {
            pool: TokioMutex::new(vec![PoolMember {
                vmid: 9000,
                node: "pve1".into(),
                kind: "qemu".into(),
                name: "template".into(),
            }]),
            next_vmid: AtomicU32::new(100),
            renamed: TokioMutex::new(vec![]),
            fail_agent_for_vmid: Some(101),
        });
        let gateway: SharedGateway = mock.clone();
        let mut settings = settings();
        settings.storage = Some("local-zfs".into());
        let (group, _info) = InstanceGroup::init_with_gateway(settings, gateway, ConnectorConfig::default())
            .await
            .unwrap();

        let (succeeded, failure) = group.increase(3).await.unwrap();
        assert_eq!(succeeded, vec![100, 102]);
        assert!(failure.is_some());

        let renamed = mock.renamed.lock().await;
        assert!(renamed.contains(&(101, "fleeting-removing".to_string())));
    }
}
