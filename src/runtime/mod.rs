//! The narrow daemon interface the engine is written against
//!
//! [`DockerRuntime`] talks to a real daemon through bollard; [`InMemoryRuntime`]
//! keeps everything in process memory and is what the test suites run on.

mod docker;
mod memory;

pub use docker::DockerRuntime;
pub use memory::{InMemoryRuntime, RuntimeCall};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;

use crate::container::ContainerSpec;
use crate::error::RuntimeError;
use crate::model::ImageConfig;

/// State of a container as reported by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    /// The container process is up (or about to be again)
    pub fn is_started(self) -> bool {
        matches!(
            self,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting
        )
    }

    /// The container is on its way to another state without anyone acting on it
    pub fn is_transient(self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Removing)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
}

/// One line of image pull progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub status: String,
    pub progress: Option<String>,
}

impl std::fmt::Display for PullProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.progress {
            Some(progress) => write!(f, "{} : {}", self.status, progress),
            None => write!(f, "{}", self.status),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    /// `None` runs as the container's configured user
    pub user: Option<String>,
    pub tty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: String,
}

/// Which streams to collect from a container's logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStreams {
    Both,
    StdErr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
}

pub type PullStream = BoxStream<'static, Result<PullProgress, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;
    async fn inspect_image(&self, image: &str) -> Result<ImageConfig, RuntimeError>;
    /// Pull `image`; the stream ends when the pull is complete
    fn pull_image(&self, image: &str, platform: Option<&str>) -> PullStream;

    /// `Ok(None)` when no container with that name or id exists
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;
    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;
    /// Stopping a container that is not running succeeds
    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError>;
    /// Block until the container exits and return its exit code
    async fn wait_container(&self, name: &str) -> Result<i64, RuntimeError>;
    async fn container_logs(&self, name: &str, streams: LogStreams)
        -> Result<String, RuntimeError>;
    async fn exec(&self, container: &str, request: ExecRequest)
        -> Result<ExecOutcome, RuntimeError>;

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError>;
    /// Names of all user-defined networks
    async fn list_networks(&self) -> Result<Vec<String>, RuntimeError>;
    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError>;
    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: Vec<String>,
    ) -> Result<(), RuntimeError>;

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError>;
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, RuntimeError>;
    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError>;
    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
}

/// Image reference with an explicit tag, `latest` if none is given
pub fn image_reference_with_tag(image: &str) -> String {
    let name_part = image.rsplit('/').next().unwrap_or(image);
    if name_part.contains(':') || name_part.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Pull `image` to completion, handing every progress line to `on_line`
pub async fn pull_with_progress<F>(
    runtime: &dyn ContainerRuntime,
    image: &str,
    platform: Option<&str>,
    mut on_line: F,
) -> Result<(), RuntimeError>
where
    F: FnMut(&PullProgress) + Send,
{
    let mut stream = runtime.pull_image(image, platform);
    while let Some(line) = stream.next().await {
        on_line(&line?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(ContainerStatus::parse("running").is_started());
        assert!(ContainerStatus::parse("Paused").is_started());
        assert!(ContainerStatus::parse("created").is_transient());
        assert!(ContainerStatus::parse("exited").is_finished());
        assert!(ContainerStatus::parse("dead").is_finished());
        assert_eq!(ContainerStatus::parse("weird"), ContainerStatus::Unknown);
    }

    #[test]
    fn test_image_reference_with_tag() {
        assert_eq!(image_reference_with_tag("alpine"), "alpine:latest");
        assert_eq!(image_reference_with_tag("alpine:3.19"), "alpine:3.19");
        assert_eq!(
            image_reference_with_tag("localhost:5000/team/app"),
            "localhost:5000/team/app:latest"
        );
        assert_eq!(
            image_reference_with_tag("nginx@sha256:abc"),
            "nginx@sha256:abc"
        );
    }

    #[test]
    fn test_pull_progress_display() {
        let line = PullProgress {
            status: "Downloading".to_string(),
            progress: Some("[==>  ]".to_string()),
        };
        assert_eq!(line.to_string(), "Downloading : [==>  ]");
    }
}
