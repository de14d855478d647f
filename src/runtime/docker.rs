use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, Mount, MountTypeEnum, MountVolumeOptions,
    NetworkConnectRequest, NetworkCreateRequest, PortBinding, ResourcesUlimits,
    VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    InspectNetworkOptions, ListNetworksOptions, ListVolumesOptions, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveVolumeOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;

use super::{
    image_reference_with_tag, ContainerInfo, ContainerRuntime, ContainerStatus, ExecOutcome,
    ExecRequest, LogStreams, PullProgress, PullStream, VolumeInfo,
};
use crate::container::{ContainerSpec, MountKind, RenderedCommand};
use crate::error::RuntimeError;
use crate::model::{EntrypointDeclaration, ImageConfig};
use crate::names::LABEL_IS_RIPTIDE;

/// [`ContainerRuntime`] backed by a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect using the local defaults (`DOCKER_HOST` or the default socket)
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

fn not_modified(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn command_words(command: &RenderedCommand) -> Vec<String> {
    match command {
        RenderedCommand::Exec(words) => words.clone(),
        RenderedCommand::Shell(line) => shlex::split(line)
            .unwrap_or_else(|| line.split_whitespace().map(String::from).collect()),
    }
}

fn to_mount(mount: &crate::container::MountSpec) -> Mount {
    match mount.kind {
        MountKind::Bind => Mount {
            target: Some(mount.target.clone()),
            source: Some(mount.source.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(mount.read_only),
            consistency: Some("delegated".to_string()),
            ..Default::default()
        },
        MountKind::Volume => Mount {
            target: Some(mount.target.clone()),
            source: Some(mount.source.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(mount.read_only),
            volume_options: Some(MountVolumeOptions {
                labels: Some(HashMap::from([(
                    LABEL_IS_RIPTIDE.to_string(),
                    "1".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

/// Translate a rendered specification into a create request body
fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (container_port, host_port) in &spec.ports {
        let key = format!("{}/tcp", container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let ulimits: Vec<ResourcesUlimits> = spec
        .ulimits
        .iter()
        .map(|u| ResourcesUlimits {
            name: Some(u.name.clone()),
            soft: Some(u.soft),
            hard: Some(u.hard),
        })
        .collect();

    let host_config = HostConfig {
        mounts: Some(spec.mounts.iter().map(to_mount).collect()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        network_mode: spec.network_mode.clone().or_else(|| spec.network.clone()),
        ulimits: (!ulimits.is_empty()).then_some(ulimits),
        cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
        security_opt: (!spec.security_opt.is_empty()).then(|| spec.security_opt.clone()),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: spec.command.as_ref().map(command_words),
        entrypoint: spec.entrypoint.clone(),
        env: Some(
            spec.environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        labels: Some(
            spec.labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        hostname: spec.hostname.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match RuntimeError::from(e) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageConfig, RuntimeError> {
        let inspect = self.docker.inspect_image(image).await?;
        let Some(config) = inspect.config else {
            return Ok(ImageConfig::default());
        };

        Ok(ImageConfig {
            cmd: config.cmd,
            entrypoint: config.entrypoint.map(EntrypointDeclaration::Exec),
            user: config.user,
            labels: config.labels.unwrap_or_default(),
        })
    }

    fn pull_image(&self, image: &str, platform: Option<&str>) -> PullStream {
        let reference = image_reference_with_tag(image);
        log::info!("Pulling image {}", reference);

        let mut options = CreateImageOptionsBuilder::default().from_image(&reference);
        if let Some(platform) = platform {
            options = options.platform(platform);
        }

        Box::pin(
            self.docker
                .create_image(Some(options.build()), None, None)
                .map(|line| {
                    line.map(|info| PullProgress {
                        status: info.status.unwrap_or_default(),
                        progress: info.progress.filter(|p| !p.is_empty()),
                    })
                    .map_err(RuntimeError::from)
                }),
        )
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let inspect = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) => {
                return match RuntimeError::from(e) {
                    RuntimeError::NotFound(_) => Ok(None),
                    other => Err(other),
                }
            }
        };

        let status = inspect
            .state
            .and_then(|state| state.status)
            .map(|status| ContainerStatus::parse(&status.to_string()))
            .unwrap_or(ContainerStatus::Unknown);

        Ok(Some(ContainerInfo {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            status,
            labels: inspect
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut options = CreateContainerOptionsBuilder::default();
        if let Some(name) = &spec.name {
            options = options.name(name);
        }
        if let Some(platform) = &spec.platform {
            options = options.platform(platform);
        }

        log::debug!("Creating container {:?} from image {}", spec.name, spec.image);
        let response = self
            .docker
            .create_container(Some(options.build()), create_body(spec))
            .await?;

        for warning in &response.warnings {
            log::warn!("Docker warning while creating {:?}: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::default().force(force).build();
        self.docker.remove_container(name, Some(options)).await?;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64, RuntimeError> {
        let mut stream = Box::pin(
            self.docker
                .wait_container(name, None::<WaitContainerOptions>),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits are reported as errors by bollard
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Transport(format!(
                "Wait stream for container {} ended without a status",
                name
            ))),
        }
    }

    async fn container_logs(
        &self,
        name: &str,
        streams: LogStreams,
    ) -> Result<String, RuntimeError> {
        let options = LogsOptionsBuilder::default()
            .stdout(streams == LogStreams::Both)
            .stderr(true)
            .build();

        let mut stream = Box::pin(self.docker.logs(name, Some(options)));
        let mut output = String::new();
        while let Some(msg) = stream.next().await {
            match msg? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok(output)
    }

    async fn exec(
        &self,
        container: &str,
        request: ExecRequest,
    ) -> Result<ExecOutcome, RuntimeError> {
        log::debug!("Executing in container {}: {:?}", container, request.cmd);

        let exec_config = CreateExecOptions {
            cmd: Some(request.cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(request.tty),
            user: request.user,
            ..Default::default()
        };
        let exec = self.docker.create_exec(container, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            tty: request.tty,
            ..Default::default()
        };

        let mut output = String::new();
        match self.docker.start_exec(&exec.id, Some(start_config)).await? {
            StartExecResults::Attached {
                output: mut output_stream,
                ..
            } => {
                while let Some(Ok(msg)) = output_stream.next().await {
                    match msg {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Transport(format!(
                    "Unexpected detached execution for exec {}",
                    exec.id
                )));
            }
        }

        let exec_inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = exec_inspect.exit_code.unwrap_or(-1);
        log::debug!("Exec {} completed with exit code {}", exec.id, exit_code);

        Ok(ExecOutcome { exit_code, output })
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match RuntimeError::from(e) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list_networks(&self) -> Result<Vec<String>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            attachable: Some(true),
            labels: Some(labels),
            ..Default::default()
        };
        self.docker.create_network(request).await?;
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: Vec<String>,
    ) -> Result<(), RuntimeError> {
        let request = NetworkConnectRequest {
            container: Some(container.to_string()),
            endpoint_config: Some(EndpointSettings {
                aliases: (!aliases.is_empty()).then_some(aliases),
                ..Default::default()
            }),
        };
        self.docker.connect_network(network, request).await?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) => match RuntimeError::from(e) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, RuntimeError> {
        let response = self.docker.list_volumes(None::<ListVolumesOptions>).await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| VolumeInfo {
                name: volume.name,
                labels: volume.labels,
            })
            .collect())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let options = VolumeCreateOptions {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await?;
        Ok(())
    }
}
