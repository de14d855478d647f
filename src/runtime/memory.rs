//! A [`ContainerRuntime`] that keeps all daemon state in memory
//!
//! Containers never run anything. Starting one marks it running unless an exit
//! rule says it exits right away; waiting on a running container completes it
//! with exit code 0. Every call is recorded so tests can assert on the exact
//! sequence of daemon operations.

use async_trait::async_trait;
use futures_util::StreamExt;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
    image_reference_with_tag, ContainerInfo, ContainerRuntime, ContainerStatus, ExecOutcome,
    ExecRequest, LogStreams, PullProgress, PullStream, VolumeInfo,
};
use crate::container::ContainerSpec;
use crate::error::RuntimeError;
use crate::model::ImageConfig;
use crate::ports::PortProbe;

/// A daemon operation, as recorded by [`InMemoryRuntime::calls`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    PullImage(String),
    CreateContainer(String),
    StartContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    WaitContainer(String),
    Exec {
        container: String,
        cmd: Vec<String>,
        user: Option<String>,
    },
    CreateNetwork(String),
    ConnectNetwork {
        network: String,
        container: String,
        aliases: Vec<String>,
    },
    CreateVolume(String),
    RemoveVolume(String),
}

type SpecMatcher = Box<dyn Fn(&ContainerSpec) -> bool + Send + Sync>;
type ExecMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

struct ExitRule {
    matches: SpecMatcher,
    exit_code: i64,
    logs: String,
}

struct ExecRule {
    matches: ExecMatcher,
    exit_code: i64,
    output: String,
}

struct FakeContainer {
    id: String,
    name: String,
    spec: Option<ContainerSpec>,
    status: ContainerStatus,
    labels: HashMap<String, String>,
    exit_code: i64,
    logs: String,
}

#[derive(Default)]
struct State {
    images: HashMap<String, ImageConfig>,
    remote_images: HashMap<String, ImageConfig>,
    containers: IndexMap<String, FakeContainer>,
    networks: IndexMap<String, HashMap<String, String>>,
    members: HashMap<String, Vec<(String, Vec<String>)>>,
    volumes: IndexMap<String, HashMap<String, String>>,
    exit_rules: Vec<ExitRule>,
    exec_rules: Vec<ExecRule>,
    failures: HashMap<&'static str, RuntimeError>,
    calls: Vec<RuntimeCall>,
    next_id: u64,
}

impl State {
    fn find(&self, name: &str) -> Option<&FakeContainer> {
        self.containers
            .get(name)
            .or_else(|| self.containers.values().find(|c| c.id == name))
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut FakeContainer> {
        let key = if self.containers.contains_key(name) {
            name.to_string()
        } else {
            self.containers
                .values()
                .find(|c| c.id == name)
                .map(|c| c.name.clone())?
        };
        self.containers.get_mut(&key)
    }

    fn check(&self, operation: &'static str) -> Result<(), RuntimeError> {
        match self.failures.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn published_ports(&self) -> HashSet<u16> {
        self.containers
            .values()
            .filter(|c| !c.status.is_finished())
            .filter_map(|c| c.spec.as_ref())
            .flat_map(|spec| spec.ports.values().copied())
            .collect()
    }

    /// Host ports bound by running containers other than `except`
    fn bound_ports(&self, except: &str) -> HashSet<u16> {
        self.containers
            .values()
            .filter(|c| c.name != except && c.status.is_started())
            .filter_map(|c| c.spec.as_ref())
            .flat_map(|spec| spec.ports.values().copied())
            .collect()
    }
}

fn no_such_container(name: &str) -> RuntimeError {
    RuntimeError::NotFound(format!("No such container: {}", name))
}

#[derive(Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
    create_delay: Option<Duration>,
}

impl std::fmt::Debug for InMemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRuntime")
            .field("create_delay", &self.create_delay)
            .finish_non_exhaustive()
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `image` available locally
    pub fn with_image(self, image: &str, config: ImageConfig) -> Self {
        self.state()
            .images
            .insert(image_reference_with_tag(image), config);
        self
    }

    /// Make `image` available for pulling
    pub fn with_remote_image(self, image: &str, config: ImageConfig) -> Self {
        self.state()
            .remote_images
            .insert(image_reference_with_tag(image), config);
        self
    }

    /// Sleep inside every create call, widening race windows
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Containers matching `matches` exit with `exit_code` as soon as they are started
    pub fn exit_when<F>(&self, matches: F, exit_code: i64, logs: &str)
    where
        F: Fn(&ContainerSpec) -> bool + Send + Sync + 'static,
    {
        self.state().exit_rules.push(ExitRule {
            matches: Box::new(matches),
            exit_code,
            logs: logs.to_string(),
        });
    }

    /// Exec calls whose command matches `matches` finish with `exit_code`
    pub fn exec_result_when<F>(&self, matches: F, exit_code: i64, output: &str)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.state().exec_rules.push(ExecRule {
            matches: Box::new(matches),
            exit_code,
            output: output.to_string(),
        });
    }

    /// Every later call of `operation` (the trait method name) fails with `error`
    pub fn fail(&self, operation: &'static str, error: RuntimeError) {
        self.state().failures.insert(operation, error);
    }

    /// Add a container that was not created through this runtime
    pub fn insert_container(
        &self,
        name: &str,
        status: ContainerStatus,
        labels: HashMap<String, String>,
    ) {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id,
                name: name.to_string(),
                spec: None,
                status,
                labels,
                exit_code: 0,
                logs: String::new(),
            },
        );
    }

    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        if let Some(container) = self.state().find_mut(name) {
            container.status = status;
        }
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// The specification a container was created from
    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state().find(name).and_then(|c| c.spec.clone())
    }

    pub fn container_status(&self, name: &str) -> Option<ContainerStatus> {
        self.state().find(name).map(|c| c.status)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state()
            .images
            .contains_key(&image_reference_with_tag(image))
    }

    pub fn networks(&self) -> Vec<String> {
        self.state().networks.keys().cloned().collect()
    }

    pub fn add_network(&self, name: &str) {
        self.state()
            .networks
            .insert(name.to_string(), HashMap::new());
    }

    /// Containers connected to `network`, with their aliases
    pub fn network_members(&self, network: &str) -> Vec<(String, Vec<String>)> {
        self.state()
            .members
            .get(network)
            .cloned()
            .unwrap_or_default()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    /// Host ports published by containers that have not exited
    pub fn published_ports(&self) -> HashSet<u16> {
        self.state().published_ports()
    }
}

impl PortProbe for InMemoryRuntime {
    fn is_free(&self, port: u16) -> bool {
        !self.published_ports().contains(&port)
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.state().check("ping")
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let state = self.state();
        state.check("image_exists")?;
        Ok(state.images.contains_key(&image_reference_with_tag(image)))
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageConfig, RuntimeError> {
        let state = self.state();
        state.check("inspect_image")?;
        state
            .images
            .get(&image_reference_with_tag(image))
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {}", image)))
    }

    fn pull_image(&self, image: &str, _platform: Option<&str>) -> PullStream {
        let reference = image_reference_with_tag(image);
        let mut state = self.state();
        state.calls.push(RuntimeCall::PullImage(reference.clone()));

        if let Err(err) = state.check("pull_image") {
            return futures_util::stream::iter(vec![Err(err)]).boxed();
        }

        let Some(config) = state.remote_images.get(&reference).cloned() else {
            let err = RuntimeError::NotFound(format!(
                "pull access denied for {}, repository does not exist",
                reference
            ));
            return futures_util::stream::iter(vec![Err(err)]).boxed();
        };
        state.images.insert(reference.clone(), config);

        let lines = vec![
            Ok(PullProgress {
                status: format!("Pulling from {}", reference),
                progress: None,
            }),
            Ok(PullProgress {
                status: "Downloading".to_string(),
                progress: Some("[=========>         ]".to_string()),
            }),
            Ok(PullProgress {
                status: "Pull complete".to_string(),
                progress: None,
            }),
        ];
        futures_util::stream::iter(lines).boxed()
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let state = self.state();
        state.check("inspect_container")?;
        Ok(state.find(name).map(|c| ContainerInfo {
            id: c.id.clone(),
            name: c.name.clone(),
            status: c.status,
            labels: c.labels.clone(),
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let name = spec.name.clone().unwrap_or_default();
        state.calls.push(RuntimeCall::CreateContainer(name.clone()));
        state.check("create_container")?;

        if !state
            .images
            .contains_key(&image_reference_with_tag(&spec.image))
        {
            return Err(RuntimeError::NotFound(format!(
                "No such image: {}",
                spec.image
            )));
        }
        if state.containers.contains_key(&name) {
            return Err(RuntimeError::Conflict(format!(
                "The container name \"/{}\" is already in use",
                name
            )));
        }
        if let Some(network) = &spec.network {
            if !state.networks.contains_key(network) {
                return Err(RuntimeError::NotFound(format!("network {} not found", network)));
            }
        }

        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let name = if name.is_empty() { id.clone() } else { name };
        if let Some(network) = &spec.network {
            state
                .members
                .entry(network.clone())
                .or_default()
                .push((name.clone(), Vec::new()));
        }
        state.containers.insert(
            name.clone(),
            FakeContainer {
                id: id.clone(),
                name,
                spec: Some(spec.clone()),
                status: ContainerStatus::Created,
                labels: spec
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                exit_code: 0,
                logs: String::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::StartContainer(name.to_string()));
        state.check("start_container")?;

        let container = state.find(name).ok_or_else(|| no_such_container(name))?;
        if container.status == ContainerStatus::Running {
            return Ok(());
        }
        let spec = container.spec.clone();
        let published = state.bound_ports(&container.name);

        if let Some(spec) = &spec {
            if let Some(port) = spec.ports.values().find(|p| published.contains(p)) {
                return Err(RuntimeError::Api {
                    status: 500,
                    message: format!(
                        "Bind for 0.0.0.0:{} failed: port is already allocated",
                        port
                    ),
                });
            }
        }

        let exit = spec.as_ref().and_then(|spec| {
            state
                .exit_rules
                .iter()
                .find(|rule| (rule.matches)(spec))
                .map(|rule| (rule.exit_code, rule.logs.clone()))
        });

        if let Some(container) = state.find_mut(name) {
            match exit {
                Some((exit_code, logs)) => {
                    container.status = ContainerStatus::Exited;
                    container.exit_code = exit_code;
                    container.logs = logs;
                }
                None => container.status = ContainerStatus::Running,
            }
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::StopContainer(name.to_string()));
        state.check("stop_container")?;

        let container = state.find_mut(name).ok_or_else(|| no_such_container(name))?;
        if container.status.is_started() {
            container.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::RemoveContainer(name.to_string()));
        state.check("remove_container")?;

        let container = state.find(name).ok_or_else(|| no_such_container(name))?;
        if container.status.is_started() && !force {
            return Err(RuntimeError::Conflict(format!(
                "You cannot remove a running container {}. Stop the container before attempting removal or force remove",
                container.id
            )));
        }

        let key = container.name.clone();
        state.containers.shift_remove(&key);
        for members in state.members.values_mut() {
            members.retain(|(member, _)| member != &key);
        }
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64, RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::WaitContainer(name.to_string()));
        state.check("wait_container")?;

        let container = state.find_mut(name).ok_or_else(|| no_such_container(name))?;
        if container.status.is_started() {
            container.status = ContainerStatus::Exited;
        }
        Ok(container.exit_code)
    }

    async fn container_logs(
        &self,
        name: &str,
        _streams: LogStreams,
    ) -> Result<String, RuntimeError> {
        let state = self.state();
        state.check("container_logs")?;
        state
            .find(name)
            .map(|c| c.logs.clone())
            .ok_or_else(|| no_such_container(name))
    }

    async fn exec(
        &self,
        container: &str,
        request: ExecRequest,
    ) -> Result<ExecOutcome, RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::Exec {
            container: container.to_string(),
            cmd: request.cmd.clone(),
            user: request.user.clone(),
        });
        state.check("exec")?;

        let target = state
            .find(container)
            .ok_or_else(|| no_such_container(container))?;
        if target.status != ContainerStatus::Running {
            return Err(RuntimeError::Conflict(format!(
                "Container {} is not running",
                target.id
            )));
        }

        Ok(state
            .exec_rules
            .iter()
            .find(|rule| (rule.matches)(&request.cmd))
            .map(|rule| ExecOutcome {
                exit_code: rule.exit_code,
                output: rule.output.clone(),
            })
            .unwrap_or(ExecOutcome {
                exit_code: 0,
                output: String::new(),
            }))
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let state = self.state();
        state.check("network_exists")?;
        Ok(state.networks.contains_key(name))
    }

    async fn list_networks(&self) -> Result<Vec<String>, RuntimeError> {
        let state = self.state();
        state.check("list_networks")?;
        Ok(state.networks.keys().cloned().collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::CreateNetwork(name.to_string()));
        state.check("create_network")?;

        if state.networks.contains_key(name) {
            return Err(RuntimeError::Conflict(format!(
                "network with name {} already exists",
                name
            )));
        }
        state.networks.insert(name.to_string(), labels);
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: Vec<String>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::ConnectNetwork {
            network: network.to_string(),
            container: container.to_string(),
            aliases: aliases.clone(),
        });
        state.check("connect_network")?;

        if !state.networks.contains_key(network) {
            return Err(RuntimeError::NotFound(format!("network {} not found", network)));
        }
        let name = state
            .find(container)
            .map(|c| c.name.clone())
            .ok_or_else(|| no_such_container(container))?;

        let members = state.members.entry(network.to_string()).or_default();
        if members.iter().any(|(member, _)| member == &name) {
            return Err(RuntimeError::Conflict(format!(
                "endpoint with name {} already exists in network {}",
                name, network
            )));
        }
        members.push((name, aliases));
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let state = self.state();
        state.check("volume_exists")?;
        Ok(state.volumes.contains_key(name))
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, RuntimeError> {
        let state = self.state();
        state.check("list_volumes")?;
        Ok(state
            .volumes
            .iter()
            .map(|(name, labels)| VolumeInfo {
                name: name.clone(),
                labels: labels.clone(),
            })
            .collect())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::CreateVolume(name.to_string()));
        state.check("create_volume")?;
        state.volumes.entry(name.to_string()).or_insert(labels);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::RemoveVolume(name.to_string()));
        state.check("remove_volume")?;

        state
            .volumes
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("no such volume: {}", name)))
    }
}
