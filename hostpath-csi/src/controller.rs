//! CSI Controller service implementation.
//!
//! Thin gRPC layer that delegates to DriverState for business logic.
//! Snapshot RPCs are serialized by a service-wide lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::csi;
use crate::driver::{DriverState, SnapshotFilter, log_cleanup_error, run_blocking};
use crate::error::{Error, Require};
use crate::paginate::{BaseNamePaginator, OffsetPaginator, Paginator};
use crate::volume::{VolumeDir, delete_volume_dir};

pub struct ControllerService {
    state: Arc<DriverState>,
    snapshot_lock: Mutex<()>,
}

impl ControllerService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self {
            state,
            snapshot_lock: Mutex::new(()),
        }
    }

    fn validate_capabilities(caps: &[csi::VolumeCapability]) -> Result<(), Status> {
        use csi::volume_capability::AccessType;

        if caps.is_empty() {
            return Err(Status::invalid_argument("volume capabilities are required"));
        }
        for cap in caps {
            match &cap.access_type {
                Some(AccessType::Mount(_)) => {}
                Some(AccessType::Block(_)) => {
                    return Err(Status::invalid_argument(
                        "block access type is not supported",
                    ));
                }
                None => {
                    return Err(Status::invalid_argument("must have mount access type"));
                }
            }
        }
        Ok(())
    }

    fn snapshots_enabled() -> Result<(), Status> {
        if cfg!(feature = "snapshots") {
            Ok(())
        } else {
            Err(Error::SnapshotsDisabled.into())
        }
    }

    fn volume_to_proto(volume_id: String, capacity_bytes: i64) -> csi::Volume {
        csi::Volume {
            volume_id,
            capacity_bytes,
            ..Default::default()
        }
    }

    fn snapshot_source(source: Option<&csi::VolumeContentSource>) -> Option<String> {
        match source.and_then(|s| s.r#type.as_ref()) {
            Some(csi::volume_content_source::Type::Snapshot(snapshot)) => {
                Some(snapshot.snapshot_id.clone())
            }
            _ => None,
        }
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        let name = req.name.require("name")?;
        Self::validate_capabilities(&req.volume_capabilities)?;

        if !self
            .state
            .accepts_topology(req.accessibility_requirements.as_ref())
        {
            return Err(Status::invalid_argument(format!(
                "volume {name} cannot be placed: not correct node, this is {}",
                self.state.config.node_id
            )));
        }

        let snapshot_id = Self::snapshot_source(req.volume_content_source.as_ref());
        if snapshot_id.is_some() {
            Self::snapshots_enabled()?;
        }

        let pool = self.state.pools.resolve(&req.parameters)?.clone();
        let state = Arc::clone(&self.state);
        let (capacity, path, created) = run_blocking({
            let name = name.clone();
            move || {
                let capacity = state.pool_capacity(&pool)?;
                let (path, created) = state.create_volume(&name, &pool)?;
                Ok((capacity, path, created))
            }
        })
        .await?;

        // An existing volume already holds its content.
        if let Some(snapshot_id) = snapshot_id.filter(|_| created) {
            let _guard = self.snapshot_lock.lock().await;
            let state = Arc::clone(&self.state);
            run_blocking(move || {
                state.restore_snapshot(&snapshot_id, &path).inspect_err(|_| {
                    log_cleanup_error("remove volume after failed restore", || {
                        delete_volume_dir(&path)
                    });
                })
            })
            .await?;
        }

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                volume_id: name,
                capacity_bytes: capacity,
                volume_context: req.parameters,
                content_source: req.volume_content_source,
                accessible_topology: vec![self.state.node_topology()],
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;

        let state = Arc::clone(&self.state);
        run_blocking(move || state.delete_volume(&volume_id)).await?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerPublishVolume is not supported"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerUnpublishVolume is not supported",
        ))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;

        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(format!(
                "volumeCapabilities not provided for {volume_id}"
            )));
        }
        for cap in &req.volume_capabilities {
            if !matches!(
                cap.access_type,
                Some(csi::volume_capability::AccessType::Mount(_))
            ) {
                return Err(Status::invalid_argument("mount type is undefined"));
            }
        }

        if self.state.find_volume(&volume_id).is_none() {
            return Err(Error::VolumeNotFound(volume_id).into());
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        if req.max_entries < 0 {
            return Err(Status::invalid_argument(format!(
                "maxEntries must not be negative, got {}",
                req.max_entries
            )));
        }

        let state = Arc::clone(&self.state);
        let response = run_blocking(move || {
            let dirs: Vec<VolumeDir> = state.list_volumes()?;
            let page = BaseNamePaginator.paginate(dirs, &req.starting_token, req.max_entries)?;

            let mut capacities: HashMap<String, i64> = HashMap::new();
            let mut entries = Vec::with_capacity(page.items.len());
            for dir in page.items {
                let capacity = match capacities.get(&dir.pool) {
                    Some(capacity) => *capacity,
                    None => {
                        let capacity = state.volume_capacity(&dir)?;
                        capacities.insert(dir.pool.clone(), capacity);
                        capacity
                    }
                };
                let health = state.volume_health(&dir.path);
                entries.push(csi::list_volumes_response::Entry {
                    volume: Some(Self::volume_to_proto(dir.volume_id(), capacity)),
                    status: Some(csi::list_volumes_response::VolumeStatus {
                        published_node_ids: vec![state.config.node_id.clone()],
                        volume_condition: Some(health.into()),
                    }),
                });
            }

            Ok(csi::ListVolumesResponse {
                entries,
                next_token: page.next_token,
            })
        })
        .await?;

        debug!(
            entries = response.entries.len(),
            next_token = %response.next_token,
            "listed volumes"
        );
        Ok(Response::new(response))
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let req = request.into_inner();
        let pool = self.state.pools.resolve(&req.parameters)?.clone();

        let state = Arc::clone(&self.state);
        let stats = run_blocking(move || state.pool_stats(&pool)).await?;

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: stats.available,
            maximum_volume_size: Some(stats.capacity),
            minimum_volume_size: Some(0),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let mut kinds = vec![
            Type::CreateDeleteVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::VolumeCondition,
            Type::GetVolume,
        ];
        if cfg!(feature = "snapshots") {
            kinds.extend([Type::CreateDeleteSnapshot, Type::ListSnapshots]);
        }

        let capabilities = kinds
            .into_iter()
            .map(|t| csi::ControllerServiceCapability {
                r#type: Some(csi::controller_service_capability::Type::Rpc(
                    csi::controller_service_capability::Rpc { r#type: t as i32 },
                )),
            })
            .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Self::snapshots_enabled()?;
        let req = request.into_inner();
        let name = req.name.require("name")?;
        let source_volume_id = req.source_volume_id.require("source volume ID")?;

        let _guard = self.snapshot_lock.lock().await;
        let state = Arc::clone(&self.state);
        let snapshot =
            run_blocking(move || state.create_snapshot(&name, &source_volume_id)).await?;

        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(snapshot),
        }))
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Self::snapshots_enabled()?;
        let req = request.into_inner();
        let snapshot_id = req.snapshot_id.require("snapshot ID")?;

        let _guard = self.snapshot_lock.lock().await;
        let state = Arc::clone(&self.state);
        run_blocking(move || state.delete_snapshot(&snapshot_id)).await?;
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Self::snapshots_enabled()?;
        let req = request.into_inner();
        if req.max_entries < 0 {
            return Err(Status::invalid_argument(format!(
                "maxEntries must not be negative, got {}",
                req.max_entries
            )));
        }

        let _guard = self.snapshot_lock.lock().await;
        let state = Arc::clone(&self.state);
        let page = run_blocking(move || {
            let filter = if !req.snapshot_id.is_empty() {
                SnapshotFilter::SnapshotId(&req.snapshot_id)
            } else if !req.source_volume_id.is_empty() {
                SnapshotFilter::SourceVolumeId(&req.source_volume_id)
            } else {
                SnapshotFilter::All
            };
            let snapshots = state.list_snapshots(filter)?;
            OffsetPaginator.paginate(snapshots, &req.starting_token, req.max_entries)
        })
        .await?;

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries: page
                .items
                .into_iter()
                .map(|snapshot| csi::list_snapshots_response::Entry {
                    snapshot: Some(snapshot),
                })
                .collect(),
            next_token: page.next_token,
        }))
    }

    async fn get_snapshot(
        &self,
        request: Request<csi::GetSnapshotRequest>,
    ) -> Result<Response<csi::GetSnapshotResponse>, Status> {
        Self::snapshots_enabled()?;
        let req = request.into_inner();
        let snapshot_id = req.snapshot_id.require("snapshot ID")?;

        let _guard = self.snapshot_lock.lock().await;
        let state = Arc::clone(&self.state);
        let snapshot = run_blocking(move || state.get_snapshot(&snapshot_id)).await?;

        Ok(Response::new(csi::GetSnapshotResponse {
            snapshot: Some(snapshot),
        }))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerExpandVolume is not supported"))
    }

    async fn controller_get_volume(
        &self,
        request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;

        let state = Arc::clone(&self.state);
        let (capacity, health) = run_blocking({
            let volume_id = volume_id.clone();
            move || {
                let (pool, path) = state
                    .find_volume(&volume_id)
                    .ok_or_else(|| Error::VolumeNotFound(volume_id.clone()))?;
                let capacity = state.pool_capacity(pool)?;
                Ok((capacity, state.volume_health(&path)))
            }
        })
        .await?;

        Ok(Response::new(csi::ControllerGetVolumeResponse {
            volume: Some(Self::volume_to_proto(volume_id, capacity)),
            status: Some(csi::controller_get_volume_response::VolumeStatus {
                published_node_ids: vec![self.state.config.node_id.clone()],
                volume_condition: Some(health.into()),
            }),
        }))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerModifyVolume is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TOPOLOGY_KEY_NODE;
    use crate::health::{FsStats, MSG_NO_SPACE};
    use crate::pool::STORAGE_POOL_PARAMETER;
    use crate::test_util::{TestFixture, healthy_stats};
    use tonic::Code;

    fn mount_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: String::new(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn block_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            ..mount_capability()
        }
    }

    fn node_topology(node_id: &str) -> csi::Topology {
        csi::Topology {
            segments: HashMap::from([(TOPOLOGY_KEY_NODE.to_string(), node_id.to_string())]),
        }
    }

    /// Builder for CreateVolumeRequest to reduce test boilerplate.
    struct CreateVolumeRequestBuilder {
        name: String,
        capabilities: Vec<csi::VolumeCapability>,
        parameters: HashMap<String, String>,
        content_source: Option<csi::VolumeContentSource>,
        accessibility: Option<csi::TopologyRequirement>,
    }

    impl CreateVolumeRequestBuilder {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                capabilities: vec![mount_capability()],
                parameters: HashMap::new(),
                content_source: None,
                accessibility: None,
            }
        }

        fn capabilities(mut self, caps: Vec<csi::VolumeCapability>) -> Self {
            self.capabilities = caps;
            self
        }

        fn pool(mut self, pool: &str) -> Self {
            self.parameters
                .insert(STORAGE_POOL_PARAMETER.to_string(), pool.to_string());
            self
        }

        fn from_snapshot(mut self, snapshot_id: &str) -> Self {
            self.content_source = Some(csi::VolumeContentSource {
                r#type: Some(csi::volume_content_source::Type::Snapshot(
                    csi::volume_content_source::SnapshotSource {
                        snapshot_id: snapshot_id.to_string(),
                    },
                )),
            });
            self
        }

        fn requisite_node(mut self, node_id: &str) -> Self {
            self.accessibility = Some(csi::TopologyRequirement {
                requisite: vec![node_topology(node_id)],
                preferred: vec![],
            });
            self
        }

        fn build(self) -> csi::CreateVolumeRequest {
            csi::CreateVolumeRequest {
                name: self.name,
                capacity_range: None,
                volume_capabilities: self.capabilities,
                parameters: self.parameters,
                secrets: HashMap::new(),
                volume_content_source: self.content_source,
                accessibility_requirements: self.accessibility,
                mutable_parameters: HashMap::new(),
            }
        }
    }

    async fn create_volume(service: &ControllerService, name: &str) -> csi::Volume {
        csi::controller_server::Controller::create_volume(
            service,
            Request::new(CreateVolumeRequestBuilder::new(name).build()),
        )
        .await
        .expect("CreateVolume should succeed")
        .into_inner()
        .volume
        .expect("volume should exist")
    }

    async fn list_volumes(
        service: &ControllerService,
        max_entries: i32,
        starting_token: &str,
    ) -> Result<csi::ListVolumesResponse, Status> {
        csi::controller_server::Controller::list_volumes(
            service,
            Request::new(csi::ListVolumesRequest {
                max_entries,
                starting_token: starting_token.to_string(),
            }),
        )
        .await
        .map(Response::into_inner)
    }

    #[tokio::test]
    async fn create_volume_is_idempotent() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let vol1 = create_volume(&service, "pvc-1").await;
        let vol2 = create_volume(&service, "pvc-1").await;

        assert_eq!(vol1, vol2);
        assert_eq!(vol1.volume_id, "pvc-1");
        assert!(fixture.path("fast/pvc-1").is_dir());
        assert_eq!(fixture.state.list_volumes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_volume_reports_rounded_capacity_and_topology() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        fixture.stats.set(FsStats {
            capacity: (20 << 30) - 2,
            ..healthy_stats()
        });

        let volume = create_volume(&service, "pvc-1").await;

        assert_eq!(volume.capacity_bytes, 19 << 30);
        assert_eq!(
            volume.accessible_topology,
            vec![node_topology(TestFixture::NODE_ID)]
        );
    }

    #[tokio::test]
    async fn create_volume_places_volume_in_requested_pool() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let request = CreateVolumeRequestBuilder::new("pvc-1").pool("slow").build();

        let volume =
            csi::controller_server::Controller::create_volume(&service, Request::new(request))
                .await
                .expect("CreateVolume should succeed")
                .into_inner()
                .volume
                .expect("volume should exist");

        assert!(fixture.path("slow/pvc-1").is_dir());
        assert!(!fixture.path("fast/pvc-1").exists());
        assert_eq!(
            volume.volume_context.get(STORAGE_POOL_PARAMETER),
            Some(&"slow".to_string())
        );
    }

    #[tokio::test]
    async fn create_volume_rejects_name_taken_in_another_pool() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        create_volume(&service, "pvc-1").await;
        let request = CreateVolumeRequestBuilder::new("pvc-1").pool("slow").build();

        let err =
            csi::controller_server::Controller::create_volume(&service, Request::new(request))
                .await
                .expect_err("CreateVolume in a second pool should fail");

        assert_eq!(err.code(), Code::AlreadyExists);
        assert!(fixture.path("fast/pvc-1").is_dir());
        assert!(!fixture.path("slow/pvc-1").exists());

        let page = list_volumes(&service, 0, "").await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.next_token.is_empty());
    }

    #[tokio::test]
    async fn create_volume_rejects_unknown_pool() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let request = CreateVolumeRequestBuilder::new("pvc-1")
            .pool("missing")
            .build();

        let err =
            csi::controller_server::Controller::create_volume(&service, Request::new(request))
                .await
                .expect_err("CreateVolume with unknown pool should fail");

        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn create_volume_requires_name() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let request = CreateVolumeRequestBuilder::new("").build();

        let err =
            csi::controller_server::Controller::create_volume(&service, Request::new(request))
                .await
                .expect_err("CreateVolume without name should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_rejects_missing_or_block_capabilities() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        for caps in [vec![], vec![mount_capability(), block_capability()]] {
            let request = CreateVolumeRequestBuilder::new("pvc-1")
                .capabilities(caps)
                .build();
            let err =
                csi::controller_server::Controller::create_volume(&service, Request::new(request))
                    .await
                    .expect_err("CreateVolume should fail");
            assert_eq!(err.code(), Code::InvalidArgument);
        }
        assert!(!fixture.path("fast/pvc-1").exists());
    }

    #[tokio::test]
    async fn create_volume_checks_topology() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let request = CreateVolumeRequestBuilder::new("pvc-1")
            .requisite_node("other-node")
            .build();
        let err =
            csi::controller_server::Controller::create_volume(&service, Request::new(request))
                .await
                .expect_err("CreateVolume for another node should fail");
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(!fixture.path("fast/pvc-1").exists());

        let request = CreateVolumeRequestBuilder::new("pvc-1")
            .requisite_node(TestFixture::NODE_ID)
            .build();
        csi::controller_server::Controller::create_volume(&service, Request::new(request))
            .await
            .expect("CreateVolume for this node should succeed");
    }

    #[tokio::test]
    async fn delete_volume_is_idempotent() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        create_volume(&service, "pvc-1").await;
        let request = csi::DeleteVolumeRequest {
            volume_id: "pvc-1".to_string(),
            secrets: HashMap::new(),
        };

        csi::controller_server::Controller::delete_volume(&service, Request::new(request.clone()))
            .await
            .expect("DeleteVolume should succeed");
        assert!(!fixture.path("fast/pvc-1").exists());

        csi::controller_server::Controller::delete_volume(&service, Request::new(request))
            .await
            .expect("second call should also succeed");
    }

    #[tokio::test]
    async fn delete_volume_requires_volume_id() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let err = csi::controller_server::Controller::delete_volume(
            &service,
            Request::new(csi::DeleteVolumeRequest::default()),
        )
        .await
        .expect_err("DeleteVolume without volume_id should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn validate_volume_capabilities_echoes_request() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        create_volume(&service, "pvc-1").await;

        let request = csi::ValidateVolumeCapabilitiesRequest {
            volume_id: "pvc-1".to_string(),
            volume_context: HashMap::from([("a".to_string(), "b".to_string())]),
            volume_capabilities: vec![mount_capability()],
            parameters: HashMap::from([("c".to_string(), "d".to_string())]),
            ..Default::default()
        };
        let confirmed = csi::controller_server::Controller::validate_volume_capabilities(
            &service,
            Request::new(request.clone()),
        )
        .await
        .expect("ValidateVolumeCapabilities should succeed")
        .into_inner()
        .confirmed
        .expect("capabilities should be confirmed");

        assert_eq!(confirmed.volume_context, request.volume_context);
        assert_eq!(confirmed.volume_capabilities, request.volume_capabilities);
        assert_eq!(confirmed.parameters, request.parameters);
    }

    #[tokio::test]
    async fn validate_volume_capabilities_rejects_bad_requests() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        create_volume(&service, "pvc-1").await;

        let cases = [
            ("pvc-1", vec![], Code::InvalidArgument),
            ("pvc-1", vec![block_capability()], Code::InvalidArgument),
            ("missing", vec![mount_capability()], Code::NotFound),
        ];
        for (volume_id, caps, code) in cases {
            let request = csi::ValidateVolumeCapabilitiesRequest {
                volume_id: volume_id.to_string(),
                volume_capabilities: caps,
                ..Default::default()
            };
            let err = csi::controller_server::Controller::validate_volume_capabilities(
                &service,
                Request::new(request),
            )
            .await
            .expect_err("ValidateVolumeCapabilities should fail");
            assert_eq!(err.code(), code);
        }
    }

    #[tokio::test]
    async fn list_volumes_paginates_by_volume_name() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        for i in 1..=9 {
            create_volume(&service, &format!("pvc-{i}")).await;
        }

        let page1 = list_volumes(&service, 4, "").await.unwrap();
        assert_eq!(page1.entries.len(), 4);
        assert_eq!(page1.next_token, "pvc-5");

        let page2 = list_volumes(&service, 3, &page1.next_token).await.unwrap();
        assert_eq!(page2.entries.len(), 3);
        assert_eq!(page2.next_token, "pvc-8");

        let page3 = list_volumes(&service, 4, &page2.next_token).await.unwrap();
        assert_eq!(page3.entries.len(), 2);
        assert!(page3.next_token.is_empty());

        let ids: Vec<_> = [page1, page2, page3]
            .into_iter()
            .flat_map(|page| page.entries)
            .map(|entry| entry.volume.unwrap().volume_id)
            .collect();
        let expected: Vec<_> = (1..=9).map(|i| format!("pvc-{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn list_volumes_rejects_bad_tokens() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let err = list_volumes(&service, 0, "pvc-1").await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);

        create_volume(&service, "pvc-1").await;
        let err = list_volumes(&service, 0, "pvc-9").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = list_volumes(&service, -1, "").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn list_volumes_reports_status() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        create_volume(&service, "pvc-1").await;

        let entry = list_volumes(&service, 0, "").await.unwrap().entries.remove(0);
        let status = entry.status.expect("status should be set");
        assert_eq!(status.published_node_ids, vec![TestFixture::NODE_ID]);
        assert!(!status.volume_condition.unwrap().abnormal);
        assert_eq!(entry.volume.unwrap().capacity_bytes, 20 << 30);

        fixture.stats.set(FsStats {
            available: 0,
            ..healthy_stats()
        });
        let entry = list_volumes(&service, 0, "").await.unwrap().entries.remove(0);
        let condition = entry.status.unwrap().volume_condition.unwrap();
        assert!(condition.abnormal);
        assert_eq!(condition.message, MSG_NO_SPACE);
    }

    #[tokio::test]
    async fn list_volumes_skips_snapshot_root_inside_pool() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = TestFixture::config(temp.path());
        config.snapshot_dir = temp.path().join("fast").join("snapshots");
        std::fs::create_dir_all(&config.snapshot_dir).unwrap();
        std::fs::create_dir_all(temp.path().join("fast").join("pvc-1")).unwrap();
        let state =
            Arc::new(DriverState::with_backends(config, TestFixture::fake_backends()).unwrap());
        let service = ControllerService::new(state);

        let response = list_volumes(&service, 0, "").await.unwrap();
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].volume.as_ref().unwrap().volume_id, "pvc-1");
    }

    #[tokio::test]
    async fn controller_get_volume_reports_volume_and_condition() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        create_volume(&service, "pvc-1").await;

        let response = csi::controller_server::Controller::controller_get_volume(
            &service,
            Request::new(csi::ControllerGetVolumeRequest {
                volume_id: "pvc-1".to_string(),
            }),
        )
        .await
        .expect("ControllerGetVolume should succeed")
        .into_inner();
        assert_eq!(response.volume.unwrap().volume_id, "pvc-1");
        let status = response.status.unwrap();
        assert!(!status.volume_condition.unwrap().abnormal);

        let err = csi::controller_server::Controller::controller_get_volume(
            &service,
            Request::new(csi::ControllerGetVolumeRequest {
                volume_id: "missing".to_string(),
            }),
        )
        .await
        .expect_err("ControllerGetVolume for unknown volume should fail");
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn get_capacity_reports_raw_pool_stats() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        fixture.stats.set(FsStats {
            available: 5 << 30,
            capacity: (20 << 30) - 2,
            ..healthy_stats()
        });

        let response = csi::controller_server::Controller::get_capacity(
            &service,
            Request::new(csi::GetCapacityRequest::default()),
        )
        .await
        .expect("GetCapacity should succeed")
        .into_inner();

        assert_eq!(response.available_capacity, 5 << 30);
        assert_eq!(response.maximum_volume_size, Some((20 << 30) - 2));
        assert_eq!(response.minimum_volume_size, Some(0));
    }

    #[tokio::test]
    async fn get_capacity_fails_when_stats_fail() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        fixture.stats.fail("statfs failed");

        let err = csi::controller_server::Controller::get_capacity(
            &service,
            Request::new(csi::GetCapacityRequest::default()),
        )
        .await
        .expect_err("GetCapacity should fail");

        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn controller_get_capabilities_lists_supported_rpcs() {
        use csi::controller_service_capability::rpc::Type;

        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let caps = csi::controller_server::Controller::controller_get_capabilities(
            &service,
            Request::new(csi::ControllerGetCapabilitiesRequest {}),
        )
        .await
        .expect("ControllerGetCapabilities should succeed")
        .into_inner()
        .capabilities;

        let kinds: Vec<i32> = caps
            .iter()
            .filter_map(|cap| match &cap.r#type {
                Some(csi::controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
                None => None,
            })
            .collect();
        for kind in [Type::CreateDeleteVolume, Type::ListVolumes, Type::GetVolume] {
            assert!(kinds.contains(&(kind as i32)));
        }
        assert_eq!(
            kinds.contains(&(Type::CreateDeleteSnapshot as i32)),
            cfg!(feature = "snapshots")
        );
    }

    #[tokio::test]
    async fn unsupported_rpcs_return_unimplemented() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let err = csi::controller_server::Controller::controller_publish_volume(
            &service,
            Request::new(csi::ControllerPublishVolumeRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = csi::controller_server::Controller::controller_expand_volume(
            &service,
            Request::new(csi::ControllerExpandVolumeRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = csi::controller_server::Controller::controller_modify_volume(
            &service,
            Request::new(csi::ControllerModifyVolumeRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[cfg(feature = "snapshots")]
    mod snapshots {
        use super::*;

        async fn create_snapshot(
            service: &ControllerService,
            name: &str,
            source: &str,
        ) -> Result<csi::Snapshot, Status> {
            csi::controller_server::Controller::create_snapshot(
                service,
                Request::new(csi::CreateSnapshotRequest {
                    name: name.to_string(),
                    source_volume_id: source.to_string(),
                    ..Default::default()
                }),
            )
            .await
            .map(|response| response.into_inner().snapshot.expect("snapshot should exist"))
        }

        async fn list_snapshots(
            service: &ControllerService,
            request: csi::ListSnapshotsRequest,
        ) -> Result<csi::ListSnapshotsResponse, Status> {
            csi::controller_server::Controller::list_snapshots(service, Request::new(request))
                .await
                .map(Response::into_inner)
        }

        #[tokio::test]
        async fn create_snapshot_is_idempotent_per_source() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            create_volume(&service, "pvc-1").await;
            create_volume(&service, "pvc-2").await;

            let first = create_snapshot(&service, "snap-1", "pvc-1").await.unwrap();
            assert_eq!(first.snapshot_id, "snap-1");
            assert_eq!(first.source_volume_id, "pvc-1");
            assert!(first.ready_to_use);

            let again = create_snapshot(&service, "snap-1", "pvc-1").await.unwrap();
            assert_eq!(again.creation_time, first.creation_time);

            let err = create_snapshot(&service, "snap-1", "pvc-2")
                .await
                .expect_err("name reuse for another volume should fail");
            assert_eq!(err.code(), Code::AlreadyExists);
        }

        #[tokio::test]
        async fn create_snapshot_validates_request() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();

            let err = create_snapshot(&service, "", "pvc-1").await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);
            let err = create_snapshot(&service, "snap-1", "").await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);
            let err = create_snapshot(&service, "snap-1", "missing").await.unwrap_err();
            assert_eq!(err.code(), Code::NotFound);
            assert!(!fixture.path("snapshots/snap-1").exists());
        }

        #[tokio::test]
        async fn restore_from_snapshot_copies_content() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            create_volume(&service, "pvc-1").await;
            std::fs::write(fixture.path("fast/pvc-1/f"), "c").unwrap();
            create_snapshot(&service, "snap-1", "pvc-1").await.unwrap();
            csi::controller_server::Controller::delete_volume(
                &service,
                Request::new(csi::DeleteVolumeRequest {
                    volume_id: "pvc-1".to_string(),
                    secrets: HashMap::new(),
                }),
            )
            .await
            .expect("DeleteVolume should succeed");
            assert!(!fixture.path("fast/pvc-1").exists());

            let request = CreateVolumeRequestBuilder::new("pvc-2")
                .from_snapshot("snap-1")
                .build();
            let volume =
                csi::controller_server::Controller::create_volume(&service, Request::new(request))
                    .await
                    .expect("CreateVolume from snapshot should succeed")
                    .into_inner()
                    .volume
                    .unwrap();

            assert!(volume.content_source.is_some());
            let content = std::fs::read_to_string(fixture.path("fast/pvc-2/f")).unwrap();
            assert_eq!(content, "c");
        }

        #[tokio::test]
        async fn restore_from_missing_snapshot_removes_volume() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            let request = CreateVolumeRequestBuilder::new("pvc-2")
                .from_snapshot("missing")
                .build();

            let err =
                csi::controller_server::Controller::create_volume(&service, Request::new(request))
                    .await
                    .expect_err("CreateVolume from missing snapshot should fail");

            assert_eq!(err.code(), Code::NotFound);
            assert!(!fixture.path("fast/pvc-2").exists());
        }

        #[tokio::test]
        async fn retry_from_snapshot_keeps_existing_volume() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            create_volume(&service, "pvc-1").await;
            std::fs::write(fixture.path("fast/pvc-1/f"), "c").unwrap();
            create_snapshot(&service, "snap-1", "pvc-1").await.unwrap();

            let restore = |snapshot: &str| {
                CreateVolumeRequestBuilder::new("pvc-2")
                    .from_snapshot(snapshot)
                    .build()
            };
            csi::controller_server::Controller::create_volume(
                &service,
                Request::new(restore("snap-1")),
            )
            .await
            .expect("CreateVolume from snapshot should succeed");
            std::fs::write(fixture.path("fast/pvc-2/f"), "live").unwrap();

            for snapshot in ["snap-1", "missing"] {
                csi::controller_server::Controller::create_volume(
                    &service,
                    Request::new(restore(snapshot)),
                )
                .await
                .expect("CreateVolume for an existing volume should succeed");
            }

            let content = std::fs::read_to_string(fixture.path("fast/pvc-2/f")).unwrap();
            assert_eq!(content, "live");
        }

        #[tokio::test]
        async fn list_snapshots_paginates_by_offset() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            create_volume(&service, "pvc-1").await;
            for i in 1..=9 {
                create_snapshot(&service, &format!("snap-{i}"), "pvc-1")
                    .await
                    .unwrap();
            }

            let mut token = String::new();
            let mut sizes = Vec::new();
            for max_entries in [4, 3, 4] {
                let page = list_snapshots(
                    &service,
                    csi::ListSnapshotsRequest {
                        max_entries,
                        starting_token: token.clone(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
                sizes.push(page.entries.len());
                token = page.next_token;
            }
            assert_eq!(sizes, vec![4, 3, 2]);
            assert!(token.is_empty());

            let err = list_snapshots(
                &service,
                csi::ListSnapshotsRequest {
                    starting_token: "20".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
            assert_eq!(err.code(), Code::Aborted);
        }

        #[tokio::test]
        async fn list_snapshots_filters_by_id_and_source() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            create_volume(&service, "pvc-1").await;
            create_volume(&service, "pvc-2").await;
            create_snapshot(&service, "snap-1", "pvc-1").await.unwrap();
            create_snapshot(&service, "snap-2", "pvc-2").await.unwrap();

            let by_id = list_snapshots(
                &service,
                csi::ListSnapshotsRequest {
                    snapshot_id: "snap-2".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            assert_eq!(by_id.entries.len(), 1);
            assert_eq!(
                by_id.entries[0].snapshot.as_ref().unwrap().source_volume_id,
                "pvc-2"
            );

            let by_source = list_snapshots(
                &service,
                csi::ListSnapshotsRequest {
                    source_volume_id: "pvc-1".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            assert_eq!(by_source.entries.len(), 1);
            assert_eq!(
                by_source.entries[0].snapshot.as_ref().unwrap().snapshot_id,
                "snap-1"
            );

            let none = list_snapshots(
                &service,
                csi::ListSnapshotsRequest {
                    snapshot_id: "missing".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            assert!(none.entries.is_empty());
        }

        #[tokio::test]
        async fn delete_and_get_snapshot() {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            create_volume(&service, "pvc-1").await;
            create_snapshot(&service, "snap-1", "pvc-1").await.unwrap();

            let snapshot = csi::controller_server::Controller::get_snapshot(
                &service,
                Request::new(csi::GetSnapshotRequest {
                    snapshot_id: "snap-1".to_string(),
                    ..Default::default()
                }),
            )
            .await
            .expect("GetSnapshot should succeed")
            .into_inner()
            .snapshot
            .unwrap();
            assert_eq!(snapshot.source_volume_id, "pvc-1");

            let request = csi::DeleteSnapshotRequest {
                snapshot_id: "snap-1".to_string(),
                ..Default::default()
            };
            for _ in 0..2 {
                csi::controller_server::Controller::delete_snapshot(
                    &service,
                    Request::new(request.clone()),
                )
                .await
                .expect("DeleteSnapshot should be idempotent");
            }
            assert!(!fixture.path("snapshots/snap-1").exists());

            let err = csi::controller_server::Controller::get_snapshot(
                &service,
                Request::new(csi::GetSnapshotRequest {
                    snapshot_id: "snap-1".to_string(),
                    ..Default::default()
                }),
            )
            .await
            .expect_err("GetSnapshot after delete should fail");
            assert_eq!(err.code(), Code::NotFound);
        }
    }
}
