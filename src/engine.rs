//! Project level entry point
//!
//! [`DockerEngine`] owns the runtime connection and the components built on
//! it, and exposes the operations callers work with: starting and stopping
//! the services of a project, status and address lookups, image pulls, named
//! volumes and commands.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::command::{
    CommandRunner, ExecOptions, ForegroundOutcome, ForegroundTarget, InteractiveLauncher,
    ProcessLauncher, RunOptions, DEFAULT_EXEC_SHELL,
};
use crate::config::EngineConfig;
use crate::container::entrypoint::{quote_all, HostUser};
use crate::container::{HostEnvironment, VolumeStore};
use crate::error::EngineError;
use crate::model::{CommandLine, Project};
use crate::names::service_container_name;
use crate::network::NetworkFabric;
use crate::ports::PortAllocator;
use crate::progress::{ProgressFailure, ProjectProgress};
use crate::runtime::{image_reference_with_tag, pull_with_progress, ContainerRuntime, DockerRuntime};
use crate::service::{ServiceOrchestrator, StartOptions};

/// Performance settings that default to on when the host is not Linux
const AUTO_PERFORMANCE_KEYS: [&str; 2] = ["dont_sync_named_volumes_with_host", "dont_sync_unimportant_src"];

#[derive(Clone)]
pub struct DockerEngine {
    runtime: Arc<dyn ContainerRuntime>,
    config: EngineConfig,
    services: ServiceOrchestrator,
    commands: CommandRunner,
    volumes: VolumeStore,
}

impl DockerEngine {
    /// Connect to the local daemon and install the entrypoint script
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let runtime = DockerRuntime::connect()?;
        runtime.ping().await?;
        log::info!("Connected to Docker daemon");

        crate::assets::install_entrypoint(&config.entrypoint_script)?;
        Ok(Self::with_runtime(Arc::new(runtime), config))
    }

    /// Engine over `runtime` with host facts detected from the running process
    pub fn with_runtime(runtime: Arc<dyn ContainerRuntime>, config: EngineConfig) -> Self {
        let ports = PortAllocator::new(config.port_range_start);
        let host = HostEnvironment::from_config(&config);
        Self::with_components(
            runtime,
            config,
            ports,
            Arc::new(ProcessLauncher),
            host,
            HostUser::current(),
        )
    }

    pub fn with_components(
        runtime: Arc<dyn ContainerRuntime>,
        config: EngineConfig,
        ports: PortAllocator,
        launcher: Arc<dyn InteractiveLauncher>,
        host: HostEnvironment,
        host_user: HostUser,
    ) -> Self {
        let services = ServiceOrchestrator::new(runtime.clone(), config.clone(), ports.clone())
            .with_host(host.clone(), host_user);
        let network = NetworkFabric::new(
            runtime.clone(),
            config.link_poll_interval,
            config.link_poll_attempts,
        );
        let commands = CommandRunner::new(
            runtime.clone(),
            network,
            ports,
            host.clone(),
            host_user,
            launcher,
        );
        let volumes = VolumeStore::new(runtime.clone(), config.helper_image.clone(), host);

        Self {
            runtime,
            config,
            services,
            commands,
            volumes,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        Ok(self.runtime.ping().await?)
    }

    /// Start `services` of `project` concurrently.
    ///
    /// Fails only if the project network cannot be set up; everything else is
    /// reported per service through the returned progress.
    pub async fn start_project(
        &self,
        project: Arc<Project>,
        services: &[String],
        options: StartOptions,
    ) -> Result<ProjectProgress, EngineError> {
        self.services
            .network()
            .ensure_project_network(&project.name)
            .await?;

        let mut progress = ProjectProgress::new();
        for name in services {
            match project.services.get(name) {
                Some(service) => progress.insert(
                    name.clone(),
                    self.services
                        .spawn_start(project.clone(), service.clone(), options.clone()),
                ),
                None => progress.insert_failure(name.clone(), ProgressFailure::new("Service not found.")),
            }
        }
        Ok(progress)
    }

    /// Stop `services` of `project` concurrently
    pub fn stop_project(&self, project: &Project, services: &[String]) -> ProjectProgress {
        let mut progress = ProjectProgress::new();
        for name in services {
            progress.insert(name.clone(), self.services.spawn_stop(&project.name, name));
        }
        progress
    }

    /// Running state of every service of `project`
    pub async fn status(&self, project: &Project) -> Result<IndexMap<String, bool>, EngineError> {
        let mut status = IndexMap::new();
        for name in project.services.keys() {
            status.insert(name.clone(), self.services.status(&project.name, name).await?);
        }
        Ok(status)
    }

    pub async fn service_status(&self, project: &Project, service_name: &str) -> Result<bool, EngineError> {
        self.services.status(&project.name, service_name).await
    }

    pub fn container_name_for(&self, project: &Project, service_name: &str) -> String {
        service_container_name(&project.name, service_name)
    }

    pub async fn address_for(
        &self,
        project: &Project,
        service_name: &str,
    ) -> Result<Option<(String, u16)>, EngineError> {
        self.services.address_for(project, service_name).await
    }

    /// Pull the images of all services and commands, reporting each line to `on_line`
    pub async fn pull_images<F>(&self, project: &Project, mut on_line: F) -> Result<(), EngineError>
    where
        F: FnMut(&str) + Send,
    {
        let images = project
            .services
            .iter()
            .map(|(name, service)| (format!("service/{}", name), service.image.as_str()))
            .chain(
                project
                    .commands
                    .iter()
                    .map(|(name, command)| (format!("command/{}", name), command.image.as_str())),
            )
            .collect::<Vec<_>>();

        for (owner, image) in images {
            let reference = image_reference_with_tag(image);
            on_line(&format!("[{}] Pulling '{}':", owner, image));
            let pulled = pull_with_progress(
                self.runtime.as_ref(),
                &reference,
                self.config.image_platform.as_deref(),
                |line| on_line(&line.to_string()),
            )
            .await;
            match pulled {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    log::warn!("Image {} not found in repository: {}", reference, e);
                    on_line("    Warning: Image not found in repository.");
                }
                Err(e) => return Err(e.into()),
            }
        }

        on_line("Done!");
        Ok(())
    }

    pub async fn list_named_volumes(&self) -> Result<Vec<String>, EngineError> {
        self.volumes.list().await
    }

    pub async fn exists_named_volume(&self, name: &str) -> Result<bool, EngineError> {
        self.volumes.exists(name).await
    }

    pub async fn create_named_volume(&self, name: &str) -> Result<(), EngineError> {
        self.volumes.create(name).await
    }

    pub async fn delete_named_volume(&self, name: &str) -> Result<(), EngineError> {
        self.volumes.delete(name).await
    }

    pub async fn copy_named_volume(&self, from: &str, to: &str) -> Result<(), EngineError> {
        self.volumes.copy(from, to).await
    }

    /// Run the command `command_name` in the foreground
    pub async fn cmd(
        &self,
        project: &Project,
        command_name: &str,
        options: &RunOptions,
    ) -> Result<ForegroundOutcome, EngineError> {
        let Some(command) = project.commands.get(command_name) else {
            return Err(EngineError::User("Command not found.".to_string()));
        };
        self.services
            .network()
            .ensure_project_network(&project.name)
            .await?;
        self.commands
            .run_foreground(project, ForegroundTarget::Command(command), options)
            .await
    }

    /// Run the command `command_name` without a terminal
    pub async fn cmd_detached(
        &self,
        project: &Project,
        command_name: &str,
        run_as_root: bool,
    ) -> Result<(i64, String), EngineError> {
        let Some(command) = project.commands.get(command_name) else {
            return Err(EngineError::User("Command not found.".to_string()));
        };
        self.services
            .network()
            .ensure_project_network(&project.name)
            .await?;
        self.commands.run_detached(project, command, run_as_root).await
    }

    /// Run the command line of `command_name` inside the running container of `service_name`
    pub async fn cmd_in_service(
        &self,
        project: &Project,
        command_name: &str,
        service_name: &str,
        options: &RunOptions,
    ) -> Result<i32, EngineError> {
        let Some(command) = project.commands.get(command_name) else {
            return Err(EngineError::User("Command not found.".to_string()));
        };
        if !self.service_status(project, service_name).await? {
            return Err(EngineError::ServiceStopped(service_name.to_string()));
        }

        let mut line = match &command.command {
            Some(CommandLine::Shell(line)) => line.clone(),
            Some(CommandLine::Exec(words)) => quote_all(words),
            None => {
                return Err(EngineError::User(format!(
                    "Command {} has no command line to run in a service.",
                    command_name
                )))
            }
        };
        if !options.args.is_empty() {
            line = format!("{} {}", line, quote_all(&options.args));
        }

        let exec = ExecOptions {
            working_directory: options.working_directory.clone(),
            ..Default::default()
        };
        self.commands
            .exec_foreground(project, service_name, &line, &exec)
            .await
    }

    /// Open `cmd` (an interactive shell if `None`) in a running service container
    pub async fn exec(
        &self,
        project: &Project,
        service_name: &str,
        cmd: Option<&str>,
        options: &ExecOptions,
    ) -> Result<i32, EngineError> {
        self.commands
            .exec_foreground(project, service_name, cmd.unwrap_or(DEFAULT_EXEC_SHELL), options)
            .await
    }

    /// Run a service in the foreground instead of starting it in the background
    pub async fn service_fg(
        &self,
        project: &Project,
        service_name: &str,
        options: &RunOptions,
    ) -> Result<ForegroundOutcome, EngineError> {
        let Some(service) = project.services.get(service_name) else {
            return Err(EngineError::User("Service not found.".to_string()));
        };
        self.services
            .network()
            .ensure_project_network(&project.name)
            .await?;
        self.commands
            .run_foreground(project, ForegroundTarget::Service(service), options)
            .await
    }

    /// Labels declared by `image`, `None` if the image is not present locally
    pub async fn image_labels(
        &self,
        image: &str,
    ) -> Result<Option<HashMap<String, String>>, EngineError> {
        match self.runtime.inspect_image(image).await {
            Ok(config) => Ok(Some(config.labels)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Value of a performance setting left on `auto` for the host `platform`
    pub fn performance_value_for_auto(&self, key: &str, platform: &str) -> bool {
        platform != "linux" && AUTO_PERFORMANCE_KEYS.contains(&key)
    }
}
