//! Docker Engine API client over the daemon's Unix socket.
//!
//! Connections are per-request; the engine API is low-traffic here (network
//! inspect on cache miss and the reconciler's periodic lists). Every request
//! is bounded by the shared orchestrator timeout.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;

use super::types::{ContainerSummary, NetworkResource};
use super::{DockerError, Orchestrator};
use crate::config::DOCKER_TIMEOUT;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const API_VERSION: &str = "v1.41";

pub struct DockerClient {
    socket_path: PathBuf,
}

impl DockerClient {
    /// Client against `DOCKER_HOST` when it names a unix socket, the
    /// default engine socket otherwise.
    pub fn from_env() -> Self {
        let socket = std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|host| host.strip_prefix("unix://").map(str::to_string))
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());
        Self::with_socket(socket)
    }

    pub fn with_socket(path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DockerError> {
        let body = tokio::time::timeout(DOCKER_TIMEOUT, self.request(path))
            .await
            .map_err(|_| DockerError::Timeout)??;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn request(&self, path: &str) -> Result<Bytes, DockerError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(%err, "docker connection closed");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("http://localhost/{API_VERSION}{path}"))
            .header("Host", "localhost")
            .body(Full::new(Bytes::new()))
            .map_err(|e| DockerError::Http(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(DockerError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }
}

/// Percent-encode a query value (the engine requires encoded JSON filters).
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[async_trait::async_trait]
impl Orchestrator for DockerClient {
    async fn inspect_network(&self, id: &str) -> Result<NetworkResource, DockerError> {
        self.get(&format!("/networks/{id}")).await
    }

    async fn list_networks(&self, driver: &str) -> Result<Vec<NetworkResource>, DockerError> {
        let filters = serde_json::json!({ "driver": [driver] }).to_string();
        self.get(&format!("/networks?filters={}", urlencode(&filters)))
            .await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        self.get("/containers/json").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_json_filter() {
        assert_eq!(
            urlencode(r#"{"driver":["vxrnet"]}"#),
            "%7B%22driver%22%3A%5B%22vxrnet%22%5D%7D"
        );
    }
}
