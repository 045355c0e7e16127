//! fleeting-plugin-proxmox - autoscaling provider for a GitLab CI runner
//! fleet on Proxmox VE.
//!
//! This module exposes the provider's components for integration testing
//! and for the gRPC binary in `main.rs`.

pub mod cloning;
pub mod collector;
pub mod error;
pub mod grpc;
pub mod instance_group;
pub mod lifecycle;
pub mod network;
pub mod proxmox;
pub mod session;
pub mod settings;

pub mod pb {
    tonic::include_proto!("fleeting.proxmox");
}

pub use error::ProviderError;
