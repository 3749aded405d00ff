//! Docker plugin protocol surface: JSON over HTTP on Unix sockets, one
//! socket per driver (network and IPAM).

pub mod ipam;
pub mod network;
pub mod types;

use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::config::SHUTDOWN_TIMEOUT;
use crate::error::Error;
use types::ErrorResponse;

/// Directory the orchestrator scans for plugin sockets.
const PLUGIN_SOCKET_DIR: &str = "/run/docker/plugins";

/// Handler error, rendered as the protocol's `{"Err": …}` payload.
#[derive(Debug)]
pub struct ApiError(String);

impl ApiError {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { err: self.0 }),
        )
            .into_response()
    }
}

/// Bind the default plugin socket for a driver.
pub fn bind_socket(driver_name: &str) -> io::Result<UnixListener> {
    let dir = Path::new(PLUGIN_SOCKET_DIR);
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{driver_name}.sock"));
    let _ = std::fs::remove_file(&path);
    UnixListener::bind(&path)
}

/// Listeners handed over by the init system, network driver first. Returns
/// `None` when not socket-activated; exactly two listeners are required
/// when we are.
pub fn activation_listeners() -> io::Result<Option<(UnixListener, UnixListener)>> {
    let Ok(count) = std::env::var("LISTEN_FDS") else {
        return Ok(None);
    };
    if let Ok(pid) = std::env::var("LISTEN_PID") {
        if pid != std::process::id().to_string() {
            return Ok(None);
        }
    }
    let count: u32 = count
        .parse()
        .map_err(|_| io::Error::other(format!("invalid LISTEN_FDS {count:?}")))?;
    if count == 0 {
        return Ok(None);
    }
    if count != 2 {
        return Err(io::Error::other(
            "exactly two sockets are required for socket activation",
        ));
    }

    // Activation fds start at 3.
    let adopt = |fd: RawFd| -> io::Result<UnixListener> {
        let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        listener.set_nonblocking(true)?;
        UnixListener::from_std(listener)
    };
    Ok(Some((adopt(3)?, adopt(4)?)))
}

/// Serve a driver router on a Unix socket until `shutdown` fires, then
/// drain in-flight requests within the shutdown timeout.
pub async fn serve(
    router: Router,
    listener: UnixListener,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let tower_service = router.clone();
                connections.spawn(async move {
                    let hyper_service =
                        hyper::service::service_fn(move |request: Request<Incoming>| {
                            tower_service.clone().call(request)
                        });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), hyper_service)
                        .await
                    {
                        tracing::debug!(%err, "plugin connection error");
                    }
                });
            }
        }
    }

    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("shutdown drain timed out, aborting outstanding requests");
        connections.abort_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::docker::mock::MockDocker;
    use crate::driver::Core;
    use crate::netlink::mem::MemNetlink;

    fn test_core() -> (Arc<MemNetlink>, Arc<MockDocker>, Arc<Core>) {
        let mem = Arc::new(MemNetlink::new());
        let docker = Arc::new(MockDocker::new());
        docker.add_network("netid1", "net0", "10.1.0.0/24", "10.1.0.1", "42");
        let config = Config {
            prop_timeout: Duration::from_millis(10),
            resp_timeout: Duration::from_secs(2),
            req_addr_sleep: Duration::from_millis(10),
            ..Config::default()
        };
        let core = Core::new(docker.clone(), mem.clone(), config);
        (mem, docker, core)
    }

    async fn post(router: Router, path: &str, body: Value) -> (u16, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn network_router() -> Router {
        let (_mem, _docker, core) = test_core();
        network::router(core, "local".to_string())
    }

    #[tokio::test]
    async fn activate_announces_drivers() {
        let (status, body) = post(network_router(), "/Plugin.Activate", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["Implements"][0], "NetworkDriver");

        let (_mem, _docker, core) = test_core();
        let (status, body) = post(ipam::router(core), "/Plugin.Activate", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["Implements"][0], "IpamDriver");
    }

    #[tokio::test]
    async fn capabilities_report_scope() {
        let (status, body) =
            post(network_router(), "/NetworkDriver.GetCapabilities", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["Scope"], "local");
    }

    // CreateNetwork validates its arguments up front so the user hears
    // about a bad vxlanid or missing gateway at network-create time.
    #[tokio::test]
    async fn create_network_validates_options() {
        let valid = json!({
            "NetworkID": "netid1",
            "Options": {"com.docker.network.generic": {"vxlanid": "42", "gateway": "10.1.0.1/24"}},
            "IPv4Data": [{"Pool": "10.1.0.0/24", "Gateway": "10.1.0.1/24"}],
        });
        let (status, _) = post(network_router(), "/NetworkDriver.CreateNetwork", valid).await;
        assert_eq!(status, 200);

        let out_of_range = json!({
            "NetworkID": "netid1",
            "Options": {"com.docker.network.generic": {"vxlanid": "16777216"}},
            "IPv4Data": [{"Pool": "10.1.0.0/24", "Gateway": "10.1.0.1/24"}],
        });
        let (status, body) =
            post(network_router(), "/NetworkDriver.CreateNetwork", out_of_range).await;
        assert_eq!(status, 500);
        assert!(body["Err"].as_str().unwrap().contains("out of range"));

        let no_gateway = json!({
            "NetworkID": "netid1",
            "Options": {"com.docker.network.generic": {"vxlanid": "42"}},
            "IPv4Data": [{"Pool": "10.1.0.0/24"}],
        });
        let (status, body) =
            post(network_router(), "/NetworkDriver.CreateNetwork", no_gateway).await;
        assert_eq!(status, 500);
        assert!(body["Err"].as_str().unwrap().contains("gateway"));
    }

    #[tokio::test]
    async fn delete_network_evicts_cached_resource() {
        let (_mem, docker, core) = test_core();
        core.network_resource_by_id("netid1").await.unwrap();

        let router = network::router(core.clone(), "local".to_string());
        let (status, _) = post(
            router,
            "/NetworkDriver.DeleteNetwork",
            json!({"NetworkID": "netid1"}),
        )
        .await;
        assert_eq!(status, 200);

        // Both cache indices must be gone: with the orchestrator broken,
        // neither key resolves anymore.
        docker.set_failing(true);
        assert!(core.network_resource_by_id("netid1").await.is_err());
        assert!(core.network_resource_by_pool("10.1.0.0/24").await.is_err());
    }

    #[tokio::test]
    async fn request_pool_reflects_pool() {
        let (_mem, _docker, core) = test_core();
        let router = ipam::router(core);

        let (status, body) = post(
            router.clone(),
            "/IpamDriver.RequestPool",
            json!({"Pool": "10.1.0.0/24"}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["PoolID"], "vxripam/10.1.0.0/24");
        assert_eq!(body["Pool"], "10.1.0.0/24");

        let (status, _) = post(router, "/IpamDriver.RequestPool", json!({"Pool": ""})).await;
        assert_eq!(status, 500);
    }

    #[tokio::test]
    async fn request_address_gateway_type_is_echoed() {
        let (mem, _docker, core) = test_core();
        let router = ipam::router(core);

        let (status, body) = post(
            router,
            "/IpamDriver.RequestAddress",
            json!({
                "PoolID": "vxripam/10.1.0.0/24",
                "Address": "10.1.0.1",
                "Options": {"RequestAddressType": "com.docker.network.gateway"},
            }),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["Address"], "10.1.0.1/24");
        assert!(mem.routes().is_empty(), "gateway claims install no route");
    }

    #[tokio::test]
    async fn request_and_release_address_roundtrip() {
        let (mem, _docker, core) = test_core();
        let router = ipam::router(core);

        let (status, body) = post(
            router.clone(),
            "/IpamDriver.RequestAddress",
            json!({"PoolID": "vxripam/10.1.0.0/24", "Address": ""}),
        )
        .await;
        assert_eq!(status, 200);
        let address: String = body["Address"].as_str().unwrap().to_string();
        assert!(address.ends_with("/24"));
        assert_eq!(mem.routes().len(), 1);

        let ip = address.split('/').next().unwrap();
        let (status, _) = post(
            router,
            "/IpamDriver.ReleaseAddress",
            json!({"PoolID": "vxripam/10.1.0.0/24", "Address": ip}),
        )
        .await;
        assert_eq!(status, 200);
        assert!(mem.routes().is_empty());
    }
}
