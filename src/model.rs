//! Read-only view of the project documents the engine works from
//!
//! Loading and validating project files is the caller's job; these types only
//! carry what the engine reads.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// In-container path of the project source code
pub const CONTAINER_SRC_PATH: &str = "/src";

/// Role marking a service that mounts the project sources
pub const ROLE_SRC: &str = "src";
pub const ROLE_MAIN: &str = "main";

pub const DEFAULT_COMMAND_GROUP: &str = "default";

/// A command line, either in shell form or exec form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Exec(Vec<String>),
}

/// The command of a service, optionally split into named command groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceCommand {
    Single(CommandLine),
    Grouped(IndexMap<String, CommandLine>),
}

impl ServiceCommand {
    /// Command line for `group`, falling back to the default group
    pub fn for_group(&self, group: &str) -> Option<&CommandLine> {
        match self {
            ServiceCommand::Single(command) => Some(command),
            ServiceCommand::Grouped(groups) => groups
                .get(group)
                .or_else(|| groups.get(DEFAULT_COMMAND_GROUP)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MountMode {
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
}

impl MountMode {
    pub fn is_read_only(self) -> bool {
        self == MountMode::ReadOnly
    }
}

/// A declared volume, keyed by its host path in the owning document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    #[serde(alias = "bind")]
    pub container: String,
    #[serde(default)]
    pub mode: MountMode,
    /// When set, the volume may be backed by a named volume instead of the host path
    #[serde(default)]
    pub name: Option<String>,
}

impl VolumeDefinition {
    pub fn new(container: impl Into<String>, mode: MountMode) -> Self {
        Self {
            container: container.into(),
            mode,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSettings {
    #[serde(default)]
    pub dont_sync_named_volumes_with_host: bool,
    #[serde(default)]
    pub dont_sync_unimportant_src: bool,
}

/// Accessors shared by services and commands
pub trait ContainerSource {
    fn name(&self) -> &str;
    fn image(&self) -> &str;
    fn volumes(&self) -> &IndexMap<String, VolumeDefinition>;
    fn environment(&self) -> &IndexMap<String, String>;
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<ServiceCommand>,
    /// Container port of the main (HTTP) port, published on a free host port
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub additional_ports: IndexMap<u16, u16>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub volumes: IndexMap<String, VolumeDefinition>,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
    #[serde(default)]
    pub logging_commands: IndexMap<String, String>,
    #[serde(default)]
    pub pre_start: Vec<String>,
    #[serde(default)]
    pub post_start: Vec<String>,
    #[serde(default = "default_true")]
    pub run_as_current_user: bool,
    #[serde(default)]
    pub dont_create_user: bool,
    /// Defaults to `run_as_current_user`
    #[serde(default)]
    pub run_pre_start_as_current_user: Option<bool>,
    /// Defaults to `run_as_current_user`
    #[serde(default)]
    pub run_post_start_as_current_user: Option<bool>,
    #[serde(default)]
    pub allow_full_memlock: bool,
    #[serde(default)]
    pub use_host_network: bool,
}

impl Service {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: None,
            port: None,
            additional_ports: IndexMap::new(),
            roles: Vec::new(),
            working_directory: None,
            volumes: IndexMap::new(),
            environment: IndexMap::new(),
            logging_commands: IndexMap::new(),
            pre_start: Vec::new(),
            post_start: Vec::new(),
            run_as_current_user: true,
            dont_create_user: false,
            run_pre_start_as_current_user: None,
            run_post_start_as_current_user: None,
            allow_full_memlock: false,
            use_host_network: false,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn command_for_group(&self, group: &str) -> Option<CommandLine> {
        self.command
            .as_ref()
            .and_then(|command| command.for_group(group))
            .cloned()
    }

    /// Working directory inside the container; only services with the `src` role get one
    pub fn container_working_directory(&self) -> Option<String> {
        if !self.has_role(ROLE_SRC) {
            return None;
        }
        Some(match self.working_directory.as_deref() {
            Some(dir) if dir.starts_with('/') => dir.to_string(),
            Some(dir) if !dir.is_empty() && dir != "." => {
                format!("{}/{}", CONTAINER_SRC_PATH, dir.trim_end_matches('/'))
            }
            _ => CONTAINER_SRC_PATH.to_string(),
        })
    }

    pub fn run_pre_start_as_current_user(&self) -> bool {
        self.run_pre_start_as_current_user
            .unwrap_or(self.run_as_current_user)
    }

    pub fn run_post_start_as_current_user(&self) -> bool {
        self.run_post_start_as_current_user
            .unwrap_or(self.run_as_current_user)
    }
}

impl ContainerSource for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn volumes(&self) -> &IndexMap<String, VolumeDefinition> {
        &self.volumes
    }

    fn environment(&self) -> &IndexMap<String, String> {
        &self.environment
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub volumes: IndexMap<String, VolumeDefinition>,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
}

impl Command {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: None,
            volumes: IndexMap::new(),
            environment: IndexMap::new(),
        }
    }
}

impl ContainerSource for Command {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn volumes(&self) -> &IndexMap<String, VolumeDefinition> {
        &self.volumes
    }

    fn environment(&self) -> &IndexMap<String, String> {
        &self.environment
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Other projects whose networks containers of this project join
    #[serde(default)]
    pub links: Vec<String>,
    /// Source paths (relative to the project sources) not synced with the host
    #[serde(default)]
    pub unimportant_paths: Vec<String>,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub services: IndexMap<String, Service>,
    #[serde(default)]
    pub commands: IndexMap<String, Command>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a project document; service and command names come from their keys
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut project: Project = serde_json::from_str(json)?;
        for (name, service) in project.services.iter_mut() {
            service.name = name.clone();
        }
        for (name, command) in project.commands.iter_mut() {
            command.name = name.clone();
        }
        Ok(project)
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.insert(service.name.clone(), service);
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.insert(command.name.clone(), command);
        self
    }

    /// Unimportant paths as absolute in-container paths, if the performance setting asks for it
    pub fn overlay_targets(&self) -> Vec<String> {
        if !self.performance.dont_sync_unimportant_src {
            return Vec::new();
        }
        self.unimportant_paths
            .iter()
            .map(|path| {
                format!(
                    "{}/{}",
                    CONTAINER_SRC_PATH,
                    path.trim_start_matches("./").trim_start_matches('/')
                )
            })
            .collect()
    }
}

/// Entrypoint declared by an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntrypointDeclaration {
    Shell(String),
    Exec(Vec<String>),
}

/// The parts of an image's configuration the engine consumes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<EntrypointDeclaration>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ImageConfig {
    pub fn default_command(&self) -> Option<CommandLine> {
        self.cmd.clone().map(CommandLine::Exec)
    }
}
