//! gRPC Transport Binding (C10): exposes the Instance Group Facade as a
//! tonic service, mapping `ProviderError` onto `tonic::Status`.

use std::collections::HashMap;
use std::pin::Pin;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::error;

use crate::error::ProviderError;
use crate::instance_group::{ConnectorConfig, InstanceGroup};
use crate::pb::instance_group_service_server::InstanceGroupService;
use crate::pb::{
    ConnectInfoRequest, ConnectInfoResponse, DecreaseRequest, DecreaseResponse, IncreaseRequest,
    IncreaseResponse, InitRequest, InitResponse, InstanceState, InstanceUpdate, ShutdownRequest,
    ShutdownResponse, UpdateRequest,
};

impl From<crate::pb::ConnectorConfig> for ConnectorConfig {
    fn from(pb: crate::pb::ConnectorConfig) -> Self {
        ConnectorConfig {
            os: pb.os,
            arch: pb.arch,
            protocol: pb.protocol,
            port: pb.port,
            username: pb.username,
            key: pb.key,
            use_static_credentials: pb.use_static_credentials,
        }
    }
}

pub struct InstanceGroupServiceImpl {
    group: tokio::sync::RwLock<Option<InstanceGroup>>,
}

impl InstanceGroupServiceImpl {
    pub fn new() -> Self {
        Self {
            group: tokio::sync::RwLock::new(None),
        }
    }
}

impl Default for InstanceGroupServiceImpl {
    fn default() -> Self {
        Self::new()
    }
}

fn status_from_provider_error(err: ProviderError) -> Status {
    match err {
        ProviderError::ConfigMissing(_) | ProviderError::ConfigInvalid { .. } => {
            Status::invalid_argument(err.to_string())
        }
        ProviderError::NotFound(_) => Status::not_found(err.to_string()),
        ProviderError::ProxmoxUnavailable { .. } => Status::internal(err.to_string()),
        ProviderError::CloneInfeasible { .. } | ProviderError::DeploymentFailed { .. } => {
            Status::failed_precondition(err.to_string())
        }
        ProviderError::NoReachableAddress { .. } => Status::not_found(err.to_string()),
    }
}

fn not_initialized() -> Status {
    Status::failed_precondition("instance group has not been initialized")
}

#[tonic::async_trait]
impl InstanceGroupService for InstanceGroupServiceImpl {
    async fn init(
        &self,
        request: Request<InitRequest>,
    ) -> std::result::Result<Response<InitResponse>, Status> {
        let request = request.into_inner();
        let connector_config = request.connector_config.unwrap_or_default().into();

        let (group, info) = InstanceGroup::init(&request.settings_json, connector_config)
            .await
            .map_err(status_from_provider_error)?;

        *self.group.write().await = Some(group);

        Ok(Response::new(InitResponse {
            provider_id: info.id,
            max_size: info.max_size as i32,
            use_static_credentials: false,
        }))
    }

    type UpdateStream = Pin<Box<dyn tokio_stream::Stream<Item = std::result::Result<InstanceUpdate, Status>> + Send>>;

    async fn update(
        &self,
        _request: Request<UpdateRequest>,
    ) -> std::result::Result<Response<Self::UpdateStream>, Status> {
        let group_lock = self.group.read().await;
        let group = group_lock.as_ref().ok_or_else(not_initialized)?;

        let updates = group.update().await.map_err(status_from_provider_error)?;
        drop(group_lock);

        let (tx, rx) = tokio::sync::mpsc::channel(updates.len().max(1));
        for update in updates {
            let state = match update.state {
                crate::lifecycle::LogicalState::Creating => InstanceState::Creating,
                crate::lifecycle::LogicalState::Running => InstanceState::Running,
                crate::lifecycle::LogicalState::Removing => InstanceState::Deleting,
            };
            if tx
                .send(Ok(InstanceUpdate {
                    id: update.id,
                    state: state as i32,
                }))
                .await
                .is_err()
            {
                break;
            }
        }

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn increase(
        &self,
        request: Request<IncreaseRequest>,
    ) -> std::result::Result<Response<IncreaseResponse>, Status> {
        let group_lock = self.group.read().await;
        let group = group_lock.as_ref().ok_or_else(not_initialized)?;

        let delta = request.into_inner().delta;
        if delta < 0 {
            return Err(Status::invalid_argument("delta must not be negative"));
        }

        let (succeeded, failure) = group
            .increase(delta as u32)
            .await
            .map_err(status_from_provider_error)?;

        let mut failures = HashMap::new();
        if let Some(err) = failure {
            error!(error = %err, "increase batch encountered a failure");
            failures.insert("batch".to_string(), err.to_string());
        }

        Ok(Response::new(IncreaseResponse {
            succeeded: succeeded.into_iter().map(|v| v.to_string()).collect(),
            failures,
        }))
    }

    async fn decrease(
        &self,
        request: Request<DecreaseRequest>,
    ) -> std::result::Result<Response<DecreaseResponse>, Status> {
        let group_lock = self.group.read().await;
        let group = group_lock.as_ref().ok_or_else(not_initialized)?;

        let vmids: std::result::Result<Vec<u32>, _> = request
            .into_inner()
            .ids
            .iter()
            .map(|id| id.parse::<u32>())
            .collect();
        let vmids = vmids.map_err(|e| Status::invalid_argument(format!("invalid vmid: {e}")))?;

        let acknowledged = group
            .decrease(&vmids)
            .await
            .map_err(status_from_provider_error)?;

        Ok(Response::new(DecreaseResponse {
            succeeded: acknowledged.into_iter().map(|v| v.to_string()).collect(),
            failures: HashMap::new(),
        }))
    }

    async fn connect_info(
        &self,
        request: Request<ConnectInfoRequest>,
    ) -> std::result::Result<Response<ConnectInfoResponse>, Status> {
        let group_lock = self.group.read().await;
        let group = group_lock.as_ref().ok_or_else(not_initialized)?;

        let id = request.into_inner().id;
        let vmid: u32 = id
            .parse()
            .map_err(|_| Status::invalid_argument(format!("invalid vmid: {id}")))?;

        let info = group
            .connect_info(vmid)
            .await
            .map_err(status_from_provider_error)?;

        let cfg = info.connector_config;
        Ok(Response::new(ConnectInfoResponse {
            id: info.id,
            internal_addr: info.internal_addr,
            external_addr: info.external_addr,
            os: cfg.os,
            arch: cfg.arch,
            protocol: cfg.protocol,
            port: cfg.port,
            username: cfg.username,
            key: cfg.key,
            use_static_credentials: cfg.use_static_credentials,
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> std::result::Result<Response<ShutdownResponse>, Status> {
        if let Some(group) = self.group.read().await.as_ref() {
            group.shutdown().await;
        }
        Ok(Response::new(ShutdownResponse {}))
    }
}
