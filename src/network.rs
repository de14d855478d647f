//! Project networks and cross-project links
//!
//! Every project gets its own bridge network. Containers can additionally join
//! the networks of linked projects; links to projects that never started are
//! skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::RuntimeError;
use crate::names::{network_name, LABEL_IS_RIPTIDE};
use crate::runtime::ContainerRuntime;

/// Result of a background link attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The container appeared and was attached to these networks
    Attached(Vec<String>),
    /// The container never appeared within the polling budget
    TimedOut,
    /// Aborted before the container appeared
    Cancelled,
    Failed(String),
}

/// Handle of a spawned [`NetworkFabric::attach_links_when_ready`] task
#[derive(Debug)]
pub struct LinkAttachTask {
    handle: JoinHandle<LinkOutcome>,
}

impl LinkAttachTask {
    /// Wait for the task and report its outcome
    pub async fn outcome(self) -> LinkOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => LinkOutcome::Cancelled,
            Err(e) => LinkOutcome::Failed(format!("Link task panicked: {}", e)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
pub struct NetworkFabric {
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl NetworkFabric {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, poll_interval: Duration, poll_attempts: u32) -> Self {
        Self {
            runtime,
            poll_interval,
            poll_attempts,
        }
    }

    /// Create the project network unless it exists
    pub async fn ensure_project_network(&self, project_name: &str) -> Result<String, RuntimeError> {
        let name = network_name(project_name);
        if self.runtime.network_exists(&name).await? {
            return Ok(name);
        }

        log::info!("Creating network {}", name);
        let labels = HashMap::from([(LABEL_IS_RIPTIDE.to_string(), "1".to_string())]);
        match self.runtime.create_network(&name, labels).await {
            Ok(()) => Ok(name),
            // Created concurrently by another start
            Err(RuntimeError::Conflict(_)) => Ok(name),
            Err(e) => Err(e),
        }
    }

    /// Network names of the linked projects that currently exist
    pub async fn resolve_linked_networks(&self, links: &[String]) -> Result<Vec<String>, RuntimeError> {
        if links.is_empty() {
            return Ok(Vec::new());
        }
        let existing = self.runtime.list_networks().await?;
        Ok(links
            .iter()
            .map(|project| network_name(project))
            .filter(|name| existing.contains(name))
            .collect())
    }

    /// Connect `container` to the networks of all linked projects
    pub async fn attach_links(
        &self,
        container: &str,
        alias: Option<&str>,
        links: &[String],
    ) -> Result<Vec<String>, RuntimeError> {
        let networks = self.resolve_linked_networks(links).await?;
        let aliases: Vec<String> = alias.map(|a| vec![a.to_string()]).unwrap_or_default();

        for network in &networks {
            match self
                .runtime
                .connect_network(network, container, aliases.clone())
                .await
            {
                Ok(()) => log::debug!("Connected {} to linked network {}", container, network),
                Err(RuntimeError::Conflict(message)) if message.contains("already exists") => {
                    log::debug!("{} already in network {}: {}", container, network, message);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(networks)
    }

    /// Connect `container` to `network` under `alias`
    pub async fn connect(&self, network: &str, container: &str, alias: &str) -> Result<(), RuntimeError> {
        self.runtime
            .connect_network(network, container, vec![alias.to_string()])
            .await
    }

    /// Attach links to a container that does not exist yet, e.g. one about to
    /// be created by an interactive `docker run`
    pub fn attach_links_when_ready(&self, container: &str, links: &[String]) -> LinkAttachTask {
        let fabric = self.clone();
        let container = container.to_string();
        let links = links.to_vec();

        let handle = tokio::spawn(async move {
            for _ in 0..fabric.poll_attempts {
                match fabric.runtime.inspect_container(&container).await {
                    Ok(Some(_)) => {
                        return match fabric.attach_links(&container, None, &links).await {
                            Ok(networks) => LinkOutcome::Attached(networks),
                            Err(e) => {
                                log::warn!("Failed to link {}: {}", container, e);
                                LinkOutcome::Failed(e.to_string())
                            }
                        };
                    }
                    Ok(None) => {}
                    Err(e) => log::debug!("Waiting for container {}: {}", container, e),
                }
                tokio::time::sleep(fabric.poll_interval).await;
            }

            log::warn!(
                "Container {} did not appear, links to other projects were not added",
                container
            );
            LinkOutcome::TimedOut
        });

        LinkAttachTask { handle }
    }
}
