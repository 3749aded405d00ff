//! IPAM-driver endpoints of the Docker plugin protocol.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use ipnet::IpNet;
use serde_json::{json, Value};

use super::types::*;
use super::ApiError;
use crate::addr;
use crate::config::IPAM_DRIVER_NAME;
use crate::driver::{pool_from_id, Core};
use crate::error::Error;

const GATEWAY_REQUEST_TYPE: &str = "com.docker.network.gateway";

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/IpamDriver.GetCapabilities", post(capabilities))
        .route(
            "/IpamDriver.GetDefaultAddressSpaces",
            post(default_address_spaces),
        )
        .route("/IpamDriver.RequestPool", post(request_pool))
        .route("/IpamDriver.ReleasePool", post(release_pool))
        .route("/IpamDriver.RequestAddress", post(request_address))
        .route("/IpamDriver.ReleaseAddress", post(release_address))
        .with_state(core)
}

async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec!["IpamDriver"],
    })
}

async fn capabilities() -> Json<IpamCapabilitiesResponse> {
    Json(IpamCapabilitiesResponse {
        requires_mac_address: false,
    })
}

async fn default_address_spaces() -> Json<AddressSpacesResponse> {
    Json(AddressSpacesResponse::default())
}

/// Reflect the pool back; the routing table, not a ledger, tracks usage.
async fn request_pool(
    Json(req): Json<RequestPoolRequest>,
) -> Result<Json<RequestPoolResponse>, ApiError> {
    tracing::debug!(pool = %req.pool, "RequestPool");
    if req.pool.is_empty() {
        return Err(ApiError::msg(
            "this driver does not support automatic address pools",
        ));
    }
    req.pool
        .parse::<IpNet>()
        .map_err(|_| ApiError::msg(format!("invalid pool subnet {:?}", req.pool)))?;

    Ok(Json(RequestPoolResponse {
        pool_id: format!("{IPAM_DRIVER_NAME}/{}", req.pool),
        pool: req.pool,
        data: Default::default(),
    }))
}

async fn release_pool(
    State(core): State<Arc<Core>>,
    Json(req): Json<ReleasePoolRequest>,
) -> Json<Value> {
    tracing::debug!(pool_id = %req.pool_id, "ReleasePool");
    core.uncache(&req.pool_id).await;
    Json(json!({}))
}

async fn request_address(
    State(core): State<Arc<Core>>,
    Json(req): Json<RequestAddressRequest>,
) -> Result<Json<RequestAddressResponse>, ApiError> {
    tracing::debug!(pool_id = %req.pool_id, address = %req.address, "RequestAddress");

    let requested = match req.address.as_str() {
        "" => None,
        raw => Some(
            raw.parse::<IpAddr>()
                .map_err(|_| ApiError::msg(format!("invalid requested address {raw:?}")))?,
        ),
    };

    // The gateway's address is answered from the pool directly: it is
    // claimed by the host interface, not by a route.
    if req.options.get("RequestAddressType").map(String::as_str) == Some(GATEWAY_REQUEST_TYPE) {
        let Some(gateway) = requested else {
            return Err(ApiError::msg("gateway request without an address"));
        };
        let subnet: IpNet = pool_from_id(&req.pool_id)
            .parse()
            .map_err(|_| ApiError::msg(format!("invalid pool id {:?}", req.pool_id)))?;
        let address = addr::in_subnet(gateway, &subnet)
            .ok_or_else(|| ApiError::msg("gateway address does not fit the pool"))?;
        return Ok(Json(RequestAddressResponse {
            address: address.to_string(),
            data: Default::default(),
        }));
    }

    let address = core.connect_and_get_address(requested, &req.pool_id).await?;
    Ok(Json(RequestAddressResponse {
        address: address.to_string(),
        data: Default::default(),
    }))
}

async fn release_address(
    State(core): State<Arc<Core>>,
    Json(req): Json<ReleaseAddressRequest>,
) -> Result<Json<Value>, ApiError> {
    tracing::debug!(pool_id = %req.pool_id, address = %req.address, "ReleaseAddress");

    let address: IpAddr = req
        .address
        .parse()
        .map_err(|_| ApiError::msg(format!("invalid address {:?}", req.address)))?;

    match core.delete_route(address).await {
        Ok(()) => {}
        // Expected for the last container on a network: the interface and
        // its routes are already gone.
        Err(Error::InterfaceNotFound(_)) => {
            tracing::debug!(%address, "no interface owns the released address");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(Json(json!({})))
}
