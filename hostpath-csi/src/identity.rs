//! CSI Identity service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::csi;
use crate::driver::DriverState;

pub struct IdentityService {
    state: Arc<DriverState>,
}

impl IdentityService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }
}

fn service_capability(kind: csi::plugin_capability::service::Type) -> csi::PluginCapability {
    csi::PluginCapability {
        r#type: Some(csi::plugin_capability::Type::Service(
            csi::plugin_capability::Service {
                r#type: kind as i32,
            },
        )),
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let config = &self.state.config;
        if config.name.is_empty() {
            return Err(Status::unavailable("Driver name not configured"));
        }
        if config.version.is_empty() {
            return Err(Status::unavailable("Driver is missing version"));
        }

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: config.name.clone(),
            vendor_version: config.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        use csi::plugin_capability::service::Type;

        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: vec![
                service_capability(Type::ControllerService),
                service_capability(Type::VolumeAccessibilityConstraints),
            ],
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
