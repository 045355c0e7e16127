//! Provider error types.

use thiserror::Error;

/// Errors surfaced by the instance group facade.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A required setting was absent from the configuration document.
    #[error("required setting missing: {0}")]
    ConfigMissing(String),

    /// A setting was present but failed validation.
    #[error("invalid setting {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    /// A Proxmox RPC failed.
    #[error("proxmox unavailable while {operation}: {source}")]
    ProxmoxUnavailable {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// A clone was requested of a non-template source without configured storage.
    #[error("cannot clone vmid {source_vmid} without configured storage: source is not a template")]
    CloneInfeasible { source_vmid: u32 },

    /// A deployment failed after the clone step succeeded.
    #[error("deployment of vmid {vmid} failed: {source}")]
    DeploymentFailed {
        vmid: u32,
        #[source]
        source: anyhow::Error,
    },

    /// No address satisfying the requested protocol could be found.
    #[error("no reachable address for vmid {vmid} on interface {iface}")]
    NoReachableAddress { vmid: u32, iface: String },

    /// The requested vmid is not present in the pool.
    #[error("vmid {0} not found in pool")]
    NotFound(u32),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
