//! One-shot containers: foreground commands, detached commands and exec
//!
//! Foreground runs hand a rendered `docker run` / `docker exec` command line to
//! an [`InteractiveLauncher`], which owns the terminal for the duration of the
//! run. Detached runs go through the runtime API and return the captured
//! output.

use indexmap::IndexMap;
use std::process::Stdio;
use std::sync::Arc;

use crate::container::entrypoint::{
    HostUser, EENV_GROUP, EENV_NO_STDOUT_REDIRECT, EENV_RUN_MAIN_CMD_AS_USER, EENV_USER,
};
use crate::container::{HostEnvironment, SpecBuilder};
use crate::error::{EngineError, RuntimeError};
use crate::model::{
    Command, ImageConfig, Project, Service, VolumeDefinition, CONTAINER_SRC_PATH,
    DEFAULT_COMMAND_GROUP, ROLE_SRC,
};
use crate::names::{
    cmd_container_name, detached_cmd_container_name, network_name, service_container_name,
};
use crate::network::{LinkOutcome, NetworkFabric};
use crate::ports::PortAllocator;
use crate::runtime::{pull_with_progress, ContainerRuntime, LogStreams};

/// Shell opened by [`CommandRunner::exec_foreground`] when no command is given
pub const DEFAULT_EXEC_SHELL: &str = "if command -v bash >> /dev/null; then bash; else sh; fi";

/// Runs an interactive command line with the caller's terminal attached
#[async_trait::async_trait]
pub trait InteractiveLauncher: Send + Sync {
    /// Run `argv` to completion and return its exit code
    async fn launch(&self, argv: Vec<String>) -> std::io::Result<i32>;
}

/// Spawns the command line as a child process with inherited stdio
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait::async_trait]
impl InteractiveLauncher for ProcessLauncher {
    async fn launch(&self, argv: Vec<String>) -> std::io::Result<i32> {
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            ));
        };

        log::debug!("Launching {:?}", argv);
        let status = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        Ok(exit_code_of(status))
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// What a foreground run executes
#[derive(Debug, Clone, Copy)]
pub enum ForegroundTarget<'a> {
    Command(&'a Command),
    Service(&'a Service),
}

impl ForegroundTarget<'_> {
    fn image(&self) -> &str {
        match self {
            ForegroundTarget::Command(command) => &command.image,
            ForegroundTarget::Service(service) => &service.image,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub args: Vec<String>,
    /// Current directory relative to the project sources
    pub working_directory: Option<String>,
    /// Additional bind mounts, keyed by host path
    pub extra_volumes: IndexMap<String, VolumeDefinition>,
    /// Command group of a service target
    pub command_group: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            working_directory: None,
            extra_volumes: IndexMap::new(),
            command_group: DEFAULT_COMMAND_GROUP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cols: Option<u16>,
    pub lines: Option<u16>,
    /// Run as root instead of the host user
    pub root: bool,
    /// Current directory relative to the project sources
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundOutcome {
    pub exit_code: i32,
    pub links: LinkOutcome,
}

/// Absolute in-container path of a directory relative to the project sources
pub fn src_working_directory(relative: Option<&str>) -> String {
    match relative.map(|r| r.trim_start_matches("./").trim_matches('/')) {
        Some(relative) if !relative.is_empty() && relative != "." => {
            format!("{}/{}", CONTAINER_SRC_PATH, relative)
        }
        _ => CONTAINER_SRC_PATH.to_string(),
    }
}

/// `docker exec` command line opening `cmd` in a running service container
pub fn render_exec_cli(
    docker_binary: &str,
    container: &str,
    service: &Service,
    cmd: &str,
    user: HostUser,
    options: &ExecOptions,
) -> Vec<String> {
    let mut shell = vec![
        docker_binary.to_string(),
        "exec".to_string(),
        "-it".to_string(),
    ];
    if !options.root {
        shell.push("-u".to_string());
        shell.push(format!("{}:{}", user.uid, user.gid));
    }
    if let (Some(cols), Some(lines)) = (options.cols, options.lines) {
        shell.push("-e".to_string());
        shell.push(format!("COLUMNS={}", cols));
        shell.push("-e".to_string());
        shell.push(format!("LINES={}", lines));
    }
    if service.has_role(ROLE_SRC) {
        shell.push("-w".to_string());
        shell.push(src_working_directory(options.working_directory.as_deref()));
    }
    shell.extend([
        container.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        cmd.to_string(),
    ]);
    shell
}

#[derive(Clone)]
pub struct CommandRunner {
    runtime: Arc<dyn ContainerRuntime>,
    network: NetworkFabric,
    ports: PortAllocator,
    host: HostEnvironment,
    host_user: HostUser,
    launcher: Arc<dyn InteractiveLauncher>,
}

impl CommandRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        network: NetworkFabric,
        ports: PortAllocator,
        host: HostEnvironment,
        host_user: HostUser,
        launcher: Arc<dyn InteractiveLauncher>,
    ) -> Self {
        Self {
            runtime,
            network,
            ports,
            host,
            host_user,
            launcher,
        }
    }

    /// Run a command or service in the foreground and return its exit code.
    ///
    /// Linked networks are attached in the background as soon as the
    /// container shows up.
    pub async fn run_foreground(
        &self,
        project: &Project,
        target: ForegroundTarget<'_>,
        options: &RunOptions,
    ) -> Result<ForegroundOutcome, EngineError> {
        let image_config = self.ensure_image(target.image()).await?;

        let (name, command) = match target {
            ForegroundTarget::Command(command) => (
                cmd_container_name(&project.name, &command.name),
                command.command.clone(),
            ),
            ForegroundTarget::Service(service) => (
                service_container_name(&project.name, &service.name),
                service.command_for_group(&options.command_group),
            ),
        };
        let command = command.or_else(|| image_config.default_command());

        let mut builder = SpecBuilder::for_host(target.image(), command, self.host.clone());
        builder
            .set_workdir(src_working_directory(options.working_directory.as_deref()))
            .set_name(&name)
            .set_network(network_name(&project.name))
            .set_env(EENV_NO_STDOUT_REDIRECT, "yes")
            .set_args(options.args.clone());

        match target {
            ForegroundTarget::Service(service) => {
                builder.init_from_service(service, project, &image_config, self.host_user);
                if let Some(container_port) = service.port {
                    // The port is only reserved until the daemon binds it
                    let lease = self.ports.lock().await;
                    builder.set_main_port(container_port, lease.find_free_port()?);
                }
            }
            ForegroundTarget::Command(command) => {
                builder.init_from_command(command, project, &image_config);
                self.run_as_host_user(&mut builder);
            }
        }

        for (host_path, volume) in &options.extra_volumes {
            builder.set_bind_mount(host_path.clone(), volume.container.clone(), volume.mode);
        }

        let links = self.network.attach_links_when_ready(&name, &project.links);
        let launched = self.launcher.launch(builder.render_cli()).await;

        if !links.is_finished() {
            links.abort();
        }
        let links = links.outcome().await;
        if let LinkOutcome::Failed(reason) = &links {
            log::warn!("Could not attach linked networks to {}: {}", name, reason);
        }

        Ok(ForegroundOutcome {
            exit_code: launched?,
            links,
        })
    }

    /// Run `command` without a terminal and return its exit code and output
    pub async fn run_detached(
        &self,
        project: &Project,
        command: &Command,
        run_as_root: bool,
    ) -> Result<(i64, String), EngineError> {
        let image_config = self.ensure_image(&command.image).await?;
        let name = detached_cmd_container_name(&project.name);

        let mut builder = SpecBuilder::for_host(
            &command.image,
            command.command.clone().or_else(|| image_config.default_command()),
            self.host.clone(),
        );
        builder
            .set_name(&name)
            .set_network(network_name(&project.name))
            .set_env(EENV_NO_STDOUT_REDIRECT, "yes")
            .init_from_command(command, project, &image_config);
        if !run_as_root {
            self.run_as_host_user(&mut builder);
        }

        let result = self.run_to_completion(project, &name, &builder).await;

        if let Err(e) = self.runtime.remove_container(&name, true).await {
            if !e.is_not_found() {
                log::warn!("Failed to remove detached command container {}: {}", name, e);
            }
        }
        result
    }

    /// Open `cmd` interactively inside a running service container
    pub async fn exec_foreground(
        &self,
        project: &Project,
        service_name: &str,
        cmd: &str,
        options: &ExecOptions,
    ) -> Result<i32, EngineError> {
        let Some(service) = project.services.get(service_name) else {
            return Err(EngineError::User("Service not found.".to_string()));
        };

        let name = service_container_name(&project.name, service_name);
        let not_running = || EngineError::User("The service is not running. Try starting it first.".to_string());
        match self.runtime.inspect_container(&name).await? {
            None => return Err(not_running()),
            Some(info) if info.status.is_finished() => {
                if let Err(e) = self.runtime.remove_container(&name, false).await {
                    log::warn!("Failed to remove exited container {}: {}", name, e);
                }
                return Err(not_running());
            }
            Some(_) => {}
        }

        let argv = render_exec_cli(
            &self.host.docker_binary,
            &name,
            service,
            cmd,
            self.host_user,
            options,
        );
        Ok(self.launcher.launch(argv).await?)
    }

    fn run_as_host_user(&self, builder: &mut SpecBuilder) {
        builder
            .set_env(EENV_RUN_MAIN_CMD_AS_USER, "yes")
            .set_env(EENV_USER, self.host_user.uid.to_string())
            .set_env(EENV_GROUP, self.host_user.gid.to_string());
    }

    async fn ensure_image(&self, image: &str) -> Result<ImageConfig, EngineError> {
        if !self.runtime.image_exists(image).await? {
            log::info!("Pulling image {}... The command will run after that.", image);
            pull_with_progress(
                self.runtime.as_ref(),
                image,
                self.host.platform.as_deref(),
                |line| log::debug!("{}", line),
            )
            .await?;
        }
        Ok(self.runtime.inspect_image(image).await?)
    }

    async fn run_to_completion(
        &self,
        project: &Project,
        name: &str,
        builder: &SpecBuilder,
    ) -> Result<(i64, String), EngineError> {
        self.runtime.create_container(&builder.render()).await?;
        self.network.attach_links(name, None, &project.links).await?;
        self.runtime.start_container(name).await?;
        let exit_code = self.runtime.wait_container(name).await?;
        let output = match self.runtime.container_logs(name, LogStreams::Both).await {
            Ok(output) => output,
            Err(RuntimeError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok((exit_code, output))
    }
}
