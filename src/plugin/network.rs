//! Network-driver endpoints of the Docker plugin protocol.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::types::*;
use super::ApiError;
use crate::driver::Core;
use crate::link::vxlan::parse_vxlan_id;

#[derive(Clone)]
pub struct NetworkState {
    pub core: Arc<Core>,
    pub scope: String,
}

pub fn router(core: Arc<Core>, scope: String) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.AllocateNetwork", post(empty))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.FreeNetwork", post(empty))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(empty))
        .route("/NetworkDriver.DiscoverNew", post(empty))
        .route("/NetworkDriver.DiscoverDelete", post(empty))
        .route(
            "/NetworkDriver.ProgramExternalConnectivity",
            post(empty),
        )
        .route("/NetworkDriver.RevokeExternalConnectivity", post(empty))
        .with_state(NetworkState { core, scope })
}

async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec!["NetworkDriver"],
    })
}

async fn empty(_body: Option<Json<Value>>) -> Json<Value> {
    Json(json!({}))
}

async fn capabilities(State(state): State<NetworkState>) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        scope: state.scope.clone(),
        connectivity_scope: String::new(),
    })
}

/// Validate the options a network is created with; the network itself is
/// stateless on our side until its first address request.
async fn create_network(
    Json(req): Json<CreateNetworkRequest>,
) -> Result<Json<Value>, ApiError> {
    tracing::debug!(net_id = %req.network_id, "CreateNetwork");

    let has_gateway = req
        .ipv4_data
        .iter()
        .chain(req.ipv6_data.iter())
        .any(|d| !d.gateway.is_empty());
    if !has_gateway {
        return Err(ApiError::msg("gateway not found in IPAM data"));
    }

    let generic = req
        .options
        .get("com.docker.network.generic")
        .and_then(Value::as_object)
        .ok_or_else(|| ApiError::msg("did not retrieve the options for the network"))?;

    let vni = generic
        .get("vxlanid")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ApiError::msg("cannot create a network without a vxlanid (-o vxlanid=<0-16777215>)")
        })?;
    parse_vxlan_id(vni)?;

    Ok(Json(json!({})))
}

/// Drop the network's cached resource; the kernel state follows through
/// endpoint deletion and interface GC.
async fn delete_network(
    State(state): State<NetworkState>,
    Json(req): Json<DeleteNetworkRequest>,
) -> Json<Value> {
    tracing::debug!(net_id = %req.network_id, "DeleteNetwork");
    state.core.uncache(&req.network_id).await;
    Json(json!({}))
}

/// The address was allocated by the IPAM driver; nothing to add here.
async fn create_endpoint(
    Json(req): Json<CreateEndpointRequest>,
) -> Result<Json<CreateEndpointResponse>, ApiError> {
    tracing::debug!(net_id = %req.network_id, endpoint = %req.endpoint_id, "CreateEndpoint");
    Ok(Json(CreateEndpointResponse { interface: None }))
}

async fn delete_endpoint(
    State(state): State<NetworkState>,
    Json(req): Json<EndpointRequest>,
) -> Result<Json<Value>, ApiError> {
    tracing::debug!(net_id = %req.network_id, endpoint = %req.endpoint_id, "DeleteEndpoint");
    state
        .core
        .delete_container_interface(&req.network_id, &req.endpoint_id)
        .await?;
    Ok(Json(json!({})))
}

async fn endpoint_info(Json(req): Json<EndpointRequest>) -> Json<InfoResponse> {
    tracing::debug!(net_id = %req.network_id, endpoint = %req.endpoint_id, "EndpointInfo");
    Json(InfoResponse::default())
}

/// Create the container macvlan and hand its name to the orchestrator,
/// which moves it into the container namespace.
async fn join(
    State(state): State<NetworkState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    tracing::debug!(net_id = %req.network_id, endpoint = %req.endpoint_id, "Join");

    let name = state
        .core
        .create_container_interface(&req.network_id, &req.endpoint_id)
        .await?;
    let gateway = state.core.network_gateway(&req.network_id).await?;
    Ok(Json(JoinResponse {
        interface_name: InterfaceName {
            src_name: name,
            dst_prefix: "eth".to_string(),
        },
        gateway: gateway.addr().to_string(),
        gateway_ipv6: String::new(),
    }))
}
