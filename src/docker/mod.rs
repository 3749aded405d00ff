//! The narrow view of the container orchestrator this daemon depends on:
//! inspect one network, list networks by driver, list containers.

mod client;
pub mod types;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;

pub use client::DockerClient;
pub use types::{ContainerSummary, NetworkResource};

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("request timed out")]
    Timeout,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn inspect_network(&self, id: &str) -> Result<NetworkResource, DockerError>;
    async fn list_networks(&self, driver: &str) -> Result<Vec<NetworkResource>, DockerError>;
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError>;
}
