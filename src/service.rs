//! Service start and stop
//!
//! A start walks a fixed sequence of steps and reports each one: check for an
//! existing container, make sure the image is there, prepare the container
//! specification, run pre-start commands in throwaway containers, create and
//! start the service container, verify it survived its first seconds and
//! finally exec the post-start commands inside it. Every start and stop ends
//! with exactly one success or error event.

use indexmap::IndexMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::container::entrypoint::{
    HostUser, EENV_GROUP, EENV_NO_STDOUT_REDIRECT, EENV_ORIGINAL_ENTRYPOINT,
    EENV_RUN_MAIN_CMD_AS_USER, EENV_USER,
};
use crate::container::{HostEnvironment, SpecBuilder};
use crate::error::{EngineError, RuntimeError};
use crate::model::{Project, Service, DEFAULT_COMMAND_GROUP};
use crate::names::{
    network_name, pre_start_container_name, service_container_name, LABEL_HTTP_PORT,
    LABEL_IS_RIPTIDE,
};
use crate::network::NetworkFabric;
use crate::ports::PortAllocator;
use crate::progress::{progress_channel, ProgressFailure, ProgressSink, ProgressStream};
use crate::runtime::{pull_with_progress, ContainerRuntime, ExecRequest, LogStreams};

/// Steps of a start without pre- and post-start commands
const BASE_START_STEPS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    /// Skip pre-start and post-start commands
    pub quick: bool,
    pub command_group: String,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            quick: false,
            command_group: DEFAULT_COMMAND_GROUP.to_string(),
        }
    }
}

/// What was found under the service container name before starting
enum Existing {
    Started,
    Absent,
}

#[derive(Clone)]
pub struct ServiceOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    network: NetworkFabric,
    ports: PortAllocator,
    config: Arc<EngineConfig>,
    host: HostEnvironment,
    host_user: HostUser,
}

impl ServiceOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: EngineConfig, ports: PortAllocator) -> Self {
        let network = NetworkFabric::new(
            runtime.clone(),
            config.link_poll_interval,
            config.link_poll_attempts,
        );
        let host = HostEnvironment::from_config(&config);
        Self {
            runtime,
            network,
            ports,
            config: Arc::new(config),
            host,
            host_user: HostUser::current(),
        }
    }

    /// Override the detected host facts
    pub fn with_host(mut self, host: HostEnvironment, host_user: HostUser) -> Self {
        self.host = host;
        self.host_user = host_user;
        self
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn network(&self) -> &NetworkFabric {
        &self.network
    }

    pub fn host(&self) -> &HostEnvironment {
        &self.host
    }

    pub fn host_user(&self) -> HostUser {
        self.host_user
    }

    /// Start `service` in a background task and return its progress
    pub fn spawn_start(
        &self,
        project: Arc<Project>,
        service: Service,
        options: StartOptions,
    ) -> ProgressStream {
        let (mut sink, stream) = progress_channel();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .start(&project, &service, &options, &mut sink)
                .await;
        });
        stream
    }

    /// Stop `service_name` in a background task and return its progress
    pub fn spawn_stop(&self, project_name: &str, service_name: &str) -> ProgressStream {
        let (mut sink, stream) = progress_channel();
        let orchestrator = self.clone();
        let project_name = project_name.to_string();
        let service_name = service_name.to_string();
        tokio::spawn(async move {
            orchestrator
                .stop(&project_name, &service_name, &mut sink)
                .await;
        });
        stream
    }

    pub async fn start(
        &self,
        project: &Project,
        service: &Service,
        options: &StartOptions,
        progress: &mut ProgressSink,
    ) {
        let name = service_container_name(&project.name, &service.name);
        log::info!("Starting service {} ({})", service.name, name);

        // 1. Existing container
        progress.step(1, None, "Checking...");
        match self.clear_existing(&name).await {
            Ok(Existing::Started) => {
                progress.step(2, Some(2), "Already started!");
                progress.succeed();
                return;
            }
            Ok(Existing::Absent) => {}
            Err(e) => {
                progress.fail(
                    ProgressFailure::new("ERROR checking container status.").with_cause(&e.into()),
                );
                self.stop_quietly(&project.name, &service.name).await;
                return;
            }
        }

        let total = if options.quick {
            BASE_START_STEPS
        } else {
            BASE_START_STEPS + (service.pre_start.len() + service.post_start.len()) as u32
        };
        let mut step = 2;

        // 2. Image
        progress.step(step, Some(total), "Checking image...");
        if let Err(e) = self.ensure_image(&service.image, step, total, progress).await {
            progress.fail(ProgressFailure::new("ERROR pulling image.").with_cause(&e));
            self.stop_quietly(&project.name, &service.name).await;
            return;
        }

        // 3. Container specification
        let mut builder = match self.prepare(project, service, &options.command_group).await {
            Ok(builder) => builder,
            Err(e) => {
                progress.fail(ProgressFailure::new("ERROR preparing container.").with_cause(&e));
                return;
            }
        };

        // 4. Pre-start commands
        if !options.quick {
            for (ordinal, cmd) in service.pre_start.iter().enumerate() {
                step += 1;
                progress.step(step, Some(total), format!("Pre Start: {}", cmd));
                if let Err(e) = self
                    .run_pre_start(project, service, &builder, ordinal, cmd)
                    .await
                {
                    progress.fail(
                        ProgressFailure::new(format!("ERROR running pre start command '{}'.", cmd))
                            .with_cause(&e),
                    );
                    self.stop_quietly(&project.name, &service.name).await;
                    return;
                }
            }
        }

        // 5. Main container
        step += 1;
        progress.step(step, Some(total), "Starting Container...");
        if let Err(e) = self
            .create_and_start(project, service, &name, &mut builder)
            .await
        {
            progress.fail(ProgressFailure::new("ERROR starting container.").with_cause(&e));
            return;
        }

        // 6. Did it survive?
        step += 1;
        progress.step(step, Some(total), "Checking...");
        tokio::time::sleep(self.config.post_start_grace).await;
        match self.runtime.inspect_container(&name).await {
            Ok(Some(info)) if info.status.is_finished() => {
                let logs = self
                    .runtime
                    .container_logs(&name, LogStreams::Both)
                    .await
                    .unwrap_or_else(|e| format!("Could not read container logs: {}", e));
                let hint = if service.run_as_current_user {
                    " Try 'run_as_current_user': false"
                } else {
                    ""
                };
                let crash = EngineError::Crashed {
                    message: format!("ERROR: Container crashed.{}", hint),
                    logs,
                };
                progress.fail(ProgressFailure::from_error(&crash));
                if let Err(e) = self.runtime.remove_container(&name, true).await {
                    log::warn!("Failed to remove crashed container {}: {}", name, e);
                }
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                progress.fail(ProgressFailure::new("ERROR: Container went missing."));
                return;
            }
            Err(e) => {
                progress.fail(
                    ProgressFailure::new("ERROR checking container status.").with_cause(&e.into()),
                );
                return;
            }
        }

        // 7. Post-start commands
        if !options.quick {
            for cmd in &service.post_start {
                step += 1;
                progress.step(step, Some(total), format!("Post Start: {}", cmd));
                if let Err(e) = self.run_post_start(service, &name, cmd).await {
                    progress.fail(
                        ProgressFailure::new(format!("ERROR running post start command '{}'.", cmd))
                            .with_cause(&e),
                    );
                    self.stop_quietly(&project.name, &service.name).await;
                    return;
                }
            }
        }

        step += 1;
        progress.step(step, Some(total), "Started!");
        progress.succeed();
        log::info!("Service {} started", service.name);
    }

    pub async fn stop(&self, project_name: &str, service_name: &str, progress: &mut ProgressSink) {
        let name = service_container_name(project_name, service_name);

        progress.step(1, None, "Checking...");
        match self.runtime.inspect_container(&name).await {
            Ok(None) => {
                progress.step(2, Some(2), "Already stopped!");
                progress.succeed();
            }
            Ok(Some(_)) => {
                progress.step(2, Some(3), "Stopping...");
                match self.stop_and_remove(&name).await {
                    Ok(()) => {
                        log::info!("Service {} stopped", service_name);
                        progress.step(3, Some(3), "Stopped!");
                        progress.succeed();
                    }
                    Err(e) => progress.fail(
                        ProgressFailure::new("ERROR checking container status.")
                            .with_cause(&e.into()),
                    ),
                }
            }
            Err(e) => progress.fail(
                ProgressFailure::new("ERROR checking container status.").with_cause(&e.into()),
            ),
        }
    }

    /// Whether the service container exists and has not exited
    pub async fn status(&self, project_name: &str, service_name: &str) -> Result<bool, EngineError> {
        let name = service_container_name(project_name, service_name);
        let info = self.runtime.inspect_container(&name).await?;
        Ok(info.is_some_and(|info| !info.status.is_finished()))
    }

    /// Host address of the main port of a running service
    pub async fn address_for(
        &self,
        project: &Project,
        service_name: &str,
    ) -> Result<Option<(String, u16)>, EngineError> {
        let Some(service) = project.services.get(service_name) else {
            return Ok(None);
        };
        if service.port.is_none() {
            return Ok(None);
        }

        let name = service_container_name(&project.name, service_name);
        let info = match self.runtime.inspect_container(&name).await {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(None),
            Err(e) => {
                log::debug!("Could not inspect {}: {}", name, e);
                return Ok(None);
            }
        };
        if info.status != crate::runtime::ContainerStatus::Running {
            return Ok(None);
        }

        Ok(info
            .labels
            .get(LABEL_HTTP_PORT)
            .and_then(|port| port.parse::<u16>().ok())
            .map(|port| ("127.0.0.1".to_string(), port)))
    }

    /// Resolve what is already there under the container name. Finished
    /// containers are removed; transient ones are waited out first.
    async fn clear_existing(&self, name: &str) -> Result<Existing, RuntimeError> {
        let mut waited = 0;
        loop {
            let Some(info) = self.runtime.inspect_container(name).await? else {
                return Ok(Existing::Absent);
            };

            if info.status.is_started() {
                return Ok(Existing::Started);
            }
            if info.status.is_transient() && waited < self.config.transient_poll_attempts {
                waited += 1;
                log::debug!("Container {} is {:?}, waiting", name, info.status);
                tokio::time::sleep(self.config.transient_poll_interval).await;
                continue;
            }

            log::info!("Removing leftover container {} ({:?})", name, info.status);
            return match self.runtime.remove_container(name, true).await {
                Ok(()) => Ok(Existing::Absent),
                Err(RuntimeError::NotFound(_)) => Ok(Existing::Absent),
                Err(e) => Err(e),
            };
        }
    }

    async fn ensure_image(
        &self,
        image: &str,
        step: u32,
        total: u32,
        progress: &mut ProgressSink,
    ) -> Result<(), EngineError> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }

        progress.step(step, Some(total), "Pulling image...");
        pull_with_progress(
            self.runtime.as_ref(),
            image,
            self.host.platform.as_deref(),
            |line| progress.step(step, Some(total), format!("Pulling image... {}", line)),
        )
        .await?;
        Ok(())
    }

    async fn prepare(
        &self,
        project: &Project,
        service: &Service,
        command_group: &str,
    ) -> Result<SpecBuilder, EngineError> {
        let image_config = self.runtime.inspect_image(&service.image).await?;
        let command = match &service.command {
            Some(_) => service.command_for_group(command_group),
            None => image_config.default_command(),
        };

        let mut builder = SpecBuilder::for_host(&service.image, command, self.host.clone());
        builder
            .set_name(service_container_name(&project.name, &service.name))
            .init_from_service(service, project, &image_config, self.host_user)
            .set_hostname(&service.name);
        if let Some(work_dir) = service.container_working_directory() {
            builder.set_workdir(work_dir);
        }
        Ok(builder)
    }

    async fn run_pre_start(
        &self,
        project: &Project,
        service: &Service,
        builder: &SpecBuilder,
        ordinal: usize,
        cmd: &str,
    ) -> Result<(), EngineError> {
        let service_name = service_container_name(&project.name, &service.name);
        let helper = pre_start_container_name(&service_name, ordinal);

        // Leftover from an earlier start
        if let Err(e) = self.runtime.stop_container(&helper).await {
            log::debug!("No stale pre start container {}: {}", helper, e);
        }
        if let Err(e) = self.runtime.remove_container(&helper, true).await {
            log::debug!("No stale pre start container {}: {}", helper, e);
        }

        let mut spec = builder.render();
        spec.name = Some(helper.clone());
        if spec.network_mode.is_none() {
            spec.network = Some(network_name(&project.name));
        }
        spec.ports.clear();
        spec.labels = IndexMap::from([(LABEL_IS_RIPTIDE.to_string(), "1".to_string())]);

        let env = &mut spec.environment;
        let as_user = service.run_pre_start_as_current_user();
        if as_user && !env.contains_key(EENV_RUN_MAIN_CMD_AS_USER) {
            env.insert(EENV_RUN_MAIN_CMD_AS_USER.to_string(), "yes".to_string());
            env.insert(EENV_USER.to_string(), self.host_user.uid.to_string());
            env.insert(EENV_GROUP.to_string(), self.host_user.gid.to_string());
        } else if !as_user {
            env.shift_remove(EENV_RUN_MAIN_CMD_AS_USER);
        }
        env.insert(EENV_NO_STDOUT_REDIRECT.to_string(), "1".to_string());
        env.insert(
            EENV_ORIGINAL_ENTRYPOINT.to_string(),
            format!("/bin/sh -c \"{}\"", cmd),
        );

        self.runtime.create_container(&spec).await?;
        self.network.attach_links(&helper, None, &project.links).await?;
        self.runtime.start_container(&helper).await?;
        let exit_code = self.runtime.wait_container(&helper).await?;

        if exit_code != 0 {
            let stderr = self
                .runtime
                .container_logs(&helper, LogStreams::StdErr)
                .await
                .unwrap_or_default();
            return Err(EngineError::execution(
                format!(
                    "Command '{}' in image '{}' returned non-zero exit status {}",
                    cmd, service.image, exit_code
                ),
                stderr,
            ));
        }
        Ok(())
    }

    async fn create_and_start(
        &self,
        project: &Project,
        service: &Service,
        name: &str,
        builder: &mut SpecBuilder,
    ) -> Result<(), EngineError> {
        // Port discovery through container start must not interleave with other starts
        let lease = self.ports.lock().await;
        if let Some(container_port) = service.port {
            let host_port = lease.find_free_port()?;
            log::debug!("Publishing {}:{} for {}", host_port, container_port, name);
            builder.set_main_port(container_port, host_port);
        }

        self.runtime.create_container(&builder.render()).await?;
        self.network
            .attach_links(name, Some(&service.name), &project.links)
            .await?;
        if !service.use_host_network {
            self.network
                .connect(&network_name(&project.name), name, &service.name)
                .await?;
        }
        self.runtime.start_container(name).await?;
        drop(lease);
        Ok(())
    }

    async fn run_post_start(&self, service: &Service, name: &str, cmd: &str) -> Result<(), EngineError> {
        let request = ExecRequest {
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()],
            user: service
                .run_post_start_as_current_user()
                .then(|| self.host_user.uid.to_string()),
            tty: true,
        };

        let outcome = self.runtime.exec(name, request).await?;
        if outcome.exit_code != 0 {
            return Err(EngineError::execution(
                format!(
                    "Command '{}' returned non-zero exit status {}",
                    cmd, outcome.exit_code
                ),
                outcome.output,
            ));
        }
        Ok(())
    }

    async fn stop_and_remove(&self, name: &str) -> Result<(), RuntimeError> {
        let result = async {
            self.runtime.stop_container(name).await?;
            self.runtime.remove_container(name, false).await
        }
        .await;

        match result {
            // Removed between inspect and stop
            Err(RuntimeError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn stop_quietly(&self, project_name: &str, service_name: &str) {
        self.stop(project_name, service_name, &mut ProgressSink::detached())
            .await;
    }
}
