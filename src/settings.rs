//! Settings & defaults (validates and fills the configuration document the
//! provider is bootstrapped with).

use serde::Deserialize;

use crate::error::{ProviderError, Result};

pub const DEFAULT_INSTANCE_NETWORK_INTERFACE: &str = "ens18";
pub const DEFAULT_INSTANCE_NAME_CREATING: &str = "fleeting-creating";
pub const DEFAULT_INSTANCE_NAME_RUNNING: &str = "fleeting-running";
pub const DEFAULT_INSTANCE_NAME_REMOVING: &str = "fleeting-removing";
pub const DEFAULT_INSTANCE_NETWORK_PROTOCOL: NetworkProtocol = NetworkProtocol::Ipv4;

/// Address family preference used by the Address Resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
    Any,
}

impl NetworkProtocol {
    fn parse(raw: &str) -> std::result::Result<Self, ()> {
        match raw {
            "" => Ok(DEFAULT_INSTANCE_NETWORK_PROTOCOL),
            "ipv4" => Ok(NetworkProtocol::Ipv4),
            "ipv6" => Ok(NetworkProtocol::Ipv6),
            "any" => Ok(NetworkProtocol::Any),
            _ => Err(()),
        }
    }
}

/// The configuration document as received from the orchestrator, before
/// validation or defaulting. Every field is optional here; required fields
/// are enforced by [`SettingsInput::validate`].
#[derive(Debug, Default, Deserialize)]
pub struct SettingsInput {
    pub url: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    pub credentials_file_path: Option<String>,
    pub pool: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
    pub template_id: Option<u32>,
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub instance_network_interface: Option<String>,
    #[serde(default)]
    pub instance_network_protocol: Option<String>,
    #[serde(default)]
    pub instance_name_creating: Option<String>,
    #[serde(default)]
    pub instance_name_running: Option<String>,
    #[serde(default)]
    pub instance_name_removing: Option<String>,
}

/// Fully validated, fully defaulted settings used by the rest of the
/// process. `storage` is deliberately optional: an empty value means "use
/// Proxmox's default storage", not a missing required field.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    pub insecure_skip_tls_verify: bool,
    pub credentials_file_path: String,
    pub pool: String,
    pub storage: Option<String>,
    pub template_id: u32,
    pub max_instances: u32,
    pub instance_network_interface: String,
    pub instance_network_protocol: NetworkProtocol,
    pub instance_name_creating: String,
    pub instance_name_running: String,
    pub instance_name_removing: String,
}

impl SettingsInput {
    /// Validates required fields and parameter values, then applies
    /// defaults. Defaults are only applied once validation has succeeded.
    pub fn validate(self) -> Result<Settings> {
        let url = self
            .url
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::ConfigMissing("url".into()))?;
        let credentials_file_path = self
            .credentials_file_path
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::ConfigMissing("credentials_file_path".into()))?;
        let pool = self
            .pool
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::ConfigMissing("pool".into()))?;
        let template_id = self
            .template_id
            .ok_or_else(|| ProviderError::ConfigMissing("template_id".into()))?;
        let max_instances = self
            .max_instances
            .ok_or_else(|| ProviderError::ConfigMissing("max_instances".into()))?;

        let protocol_raw = self.instance_network_protocol.unwrap_or_default();
        let instance_network_protocol =
            NetworkProtocol::parse(&protocol_raw).map_err(|_| ProviderError::ConfigInvalid {
                field: "instance_network_protocol".into(),
                reason: format!(
                    "must be one of ipv4, ipv6, any (got {protocol_raw:?})"
                ),
            })?;

        let instance_network_interface = self
            .instance_network_interface
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_INSTANCE_NETWORK_INTERFACE.to_string());
        let instance_name_creating = self
            .instance_name_creating
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_INSTANCE_NAME_CREATING.to_string());
        let instance_name_running = self
            .instance_name_running
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_INSTANCE_NAME_RUNNING.to_string());
        let instance_name_removing = self
            .instance_name_removing
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_INSTANCE_NAME_REMOVING.to_string());

        if instance_name_creating == instance_name_running
            || instance_name_running == instance_name_removing
            || instance_name_creating == instance_name_removing
        {
            return Err(ProviderError::ConfigInvalid {
                field: "instance_name_*".into(),
                reason: "the three lifecycle names must be pairwise distinct".into(),
            });
        }

        Ok(Settings {
            url,
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            credentials_file_path,
            pool,
            storage: self.storage.filter(|s| !s.is_empty()),
            template_id,
            max_instances,
            instance_network_interface,
            instance_network_protocol,
            instance_name_creating,
            instance_name_running,
            instance_name_removing,
        })
    }
}
