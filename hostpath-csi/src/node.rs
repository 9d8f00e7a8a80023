//! CSI Node service implementation.
//!
//! Thin gRPC layer that delegates to DriverState for business logic.

use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::csi;
use crate::driver::{DriverState, run_blocking};
use crate::error::Require;

pub struct NodeService {
    state: Arc<DriverState>,
}

impl NodeService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;
        let target_path = req.target_path.require("target path")?;
        let volume_cap = req.volume_capability.require("volume capability")?;

        let fs_type = match volume_cap.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => mount.fs_type,
            Some(csi::volume_capability::AccessType::Block(_)) => {
                return Err(Status::invalid_argument(
                    "cannot publish a non-block volume as block volume",
                ));
            }
            None => {
                return Err(Status::invalid_argument(
                    "can only publish a non-block volume",
                ));
            }
        };

        let state = Arc::clone(&self.state);
        let readonly = req.readonly;
        run_blocking(move || {
            state.publish_volume(&volume_id, &PathBuf::from(target_path), &fs_type, readonly)
        })
        .await?;

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;
        let target_path = req.target_path.require("target path")?;

        let state = Arc::clone(&self.state);
        run_blocking(move || state.unpublish_volume(&volume_id, &PathBuf::from(target_path)))
            .await?;

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        use csi::volume_usage::Unit;

        let req = request.into_inner();
        req.volume_id.require("volume ID")?;
        let volume_path = req.volume_path.require("volume path")?;

        let state = Arc::clone(&self.state);
        let (stats, health) =
            run_blocking(move || state.volume_stats(&PathBuf::from(volume_path))).await?;

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                csi::VolumeUsage {
                    available: stats.available,
                    total: stats.capacity,
                    used: stats.used,
                    unit: Unit::Bytes as i32,
                },
                csi::VolumeUsage {
                    available: stats.inodes_free,
                    total: stats.inodes,
                    used: stats.inodes_used,
                    unit: Unit::Inodes as i32,
                },
            ],
            volume_condition: Some(health.into()),
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [Type::VolumeCondition, Type::GetVolumeStats]
            .into_iter()
            .map(|t| csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc { r#type: t as i32 },
                )),
            })
            .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.state.config.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: Some(self.state.node_topology()),
        }))
    }
}
