//! Container specification builder
//!
//! Collects the configuration of one container and renders it either as a
//! structured create call ([`ContainerSpec`], consumed by a
//! [`ContainerRuntime`](crate::runtime::ContainerRuntime)) or as an equivalent
//! `docker run` command line for interactive use. Both renderings describe the
//! same container.

use indexmap::IndexMap;
use std::path::PathBuf;

use super::entrypoint::{
    encode_entrypoint, entrypoint_user_settings, logging_command_settings, quote,
    quote_all, HostUser, EENV_HOST_SYSTEM_HOSTNAMES, EENV_NAMED_VOLUMES, EENV_ON_LINUX,
    EENV_OVERLAY_TARGETS,
};
use crate::assets::ENTRYPOINT_CONTAINER_PATH;
use crate::config::EngineConfig;
use crate::model::{
    CommandLine, ContainerSource, EntrypointDeclaration, ImageConfig, MountMode, Project, Service,
    ROLE_MAIN,
};
use crate::names::{
    named_volume_name, LABEL_HTTP_PORT, LABEL_IS_RIPTIDE, LABEL_MAIN, LABEL_PROJECT, LABEL_SERVICE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Other,
}

impl HostOs {
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            HostOs::Linux
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else {
            HostOs::Other
        }
    }
}

/// Facts about the host that end up in every container specification
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    pub os: HostOs,
    pub entrypoint_script: PathBuf,
    pub host_system_hostnames: Vec<String>,
    pub platform: Option<String>,
    pub docker_binary: String,
    /// Whether the interactive command line allocates a terminal
    pub tty: bool,
}

impl HostEnvironment {
    pub fn from_config(config: &EngineConfig) -> Self {
        use std::io::IsTerminal;

        Self {
            os: HostOs::detect(),
            entrypoint_script: config.entrypoint_script.clone(),
            host_system_hostnames: config.host_system_hostnames.clone(),
            platform: config.image_platform.clone(),
            docker_binary: config.docker_binary.clone(),
            tty: std::io::stdin().is_terminal(),
        }
    }
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path for bind mounts, physical volume name for volume mounts
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub kind: MountKind,
}

impl MountSpec {
    /// `--mount` value of this mount
    pub fn to_cli(&self, os: HostOs) -> String {
        let ro = if self.read_only { "1" } else { "0" };
        match self.kind {
            MountKind::Bind => {
                let delegated = if os == HostOs::MacOs {
                    ",consistency=delegated"
                } else {
                    ""
                };
                format!(
                    "type=bind,dst={},src={},ro={}{}",
                    self.target, self.source, ro, delegated
                )
            }
            MountKind::Volume => format!(
                "type=volume,target={},src={},ro={},volume-label={}=1",
                self.target, self.source, ro, LABEL_IS_RIPTIDE
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedCommand {
    /// Split into words by the runtime
    Shell(String),
    Exec(Vec<String>),
}

impl RenderedCommand {
    /// The command as a single command line string
    pub fn to_command_line(&self) -> String {
        match self {
            RenderedCommand::Shell(line) => line.clone(),
            RenderedCommand::Exec(words) => words.join(" "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// Structured form of a container, ready for a create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    /// `None` runs the image default command
    pub command: Option<RenderedCommand>,
    pub entrypoint: Option<Vec<String>>,
    pub network: Option<String>,
    pub network_mode: Option<String>,
    pub ports: IndexMap<u16, u16>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub ulimits: Vec<Ulimit>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub environment: IndexMap<String, String>,
    pub labels: IndexMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub platform: Option<String>,
}

fn quote_if_spaced(word: &str) -> String {
    if word.contains(' ') {
        quote(word)
    } else {
        word.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SpecBuilder {
    image: String,
    command: Option<CommandLine>,
    args: Vec<String>,
    env: IndexMap<String, String>,
    labels: IndexMap<String, String>,
    mounts: IndexMap<String, MountSpec>,
    ports: IndexMap<u16, u16>,
    network: Option<String>,
    use_host_network: bool,
    name: Option<String>,
    entrypoint: Option<String>,
    work_dir: Option<String>,
    hostname: Option<String>,
    run_as_root: bool,
    allow_full_memlock: bool,
    cap_sys_admin: bool,
    named_volumes_in_container: Vec<String>,
    host: HostEnvironment,
}

impl SpecBuilder {
    /// New builder for `image`; `None` as command keeps the image default
    pub fn new(image: impl Into<String>, command: Option<CommandLine>) -> Self {
        Self::for_host(image, command, HostEnvironment::default())
    }

    pub fn for_host(
        image: impl Into<String>,
        command: Option<CommandLine>,
        host: HostEnvironment,
    ) -> Self {
        let mut builder = Self {
            image: image.into(),
            command,
            args: Vec::new(),
            env: IndexMap::new(),
            labels: IndexMap::new(),
            mounts: IndexMap::new(),
            ports: IndexMap::new(),
            network: None,
            use_host_network: false,
            name: None,
            entrypoint: None,
            work_dir: None,
            hostname: None,
            run_as_root: false,
            allow_full_memlock: false,
            cap_sys_admin: false,
            named_volumes_in_container: Vec::new(),
            host,
        };
        builder.set_label(LABEL_IS_RIPTIDE, "1");
        let on_linux = if builder.host.os == HostOs::Linux { "1" } else { "0" };
        builder.set_env(EENV_ON_LINUX, on_linux);
        builder
    }

    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn set_bind_mount(
        &mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
        mode: MountMode,
    ) -> &mut Self {
        let host_path = host_path.into();
        self.mounts.insert(
            host_path.clone(),
            MountSpec {
                source: host_path,
                target: container_path.into(),
                read_only: mode.is_read_only(),
                kind: MountKind::Bind,
            },
        );
        self
    }

    /// Mount the named volume `name`; the physical volume name gets the internal prefix
    pub fn set_named_volume_mount(
        &mut self,
        name: &str,
        container_path: impl Into<String>,
        mode: MountMode,
    ) -> &mut Self {
        let container_path = container_path.into();
        self.mounts.insert(
            name.to_string(),
            MountSpec {
                source: named_volume_name(name),
                target: container_path.clone(),
                read_only: mode.is_read_only(),
                kind: MountKind::Volume,
            },
        );
        self.named_volumes_in_container.push(container_path);
        self
    }

    pub fn set_port(&mut self, container_port: u16, host_port: u16) -> &mut Self {
        self.ports.insert(container_port, host_port);
        self
    }

    pub fn set_network(&mut self, network: impl Into<String>) -> &mut Self {
        self.network = Some(network.into());
        self
    }

    /// Host networking takes precedence over ports and network when rendering
    pub fn set_host_networking(&mut self, flag: bool) -> &mut Self {
        self.use_host_network = flag;
        self
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_entrypoint(&mut self, entrypoint: impl Into<String>) -> &mut Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn set_args(&mut self, args: Vec<String>) -> &mut Self {
        self.args = args;
        self
    }

    pub fn set_workdir(&mut self, work_dir: impl Into<String>) -> &mut Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn set_allow_full_memlock(&mut self, flag: bool) -> &mut Self {
        self.allow_full_memlock = flag;
        self
    }

    pub fn set_tty(&mut self, flag: bool) -> &mut Self {
        self.host.tty = flag;
        self
    }

    /// Replace the image entrypoint with the injected entrypoint script.
    ///
    /// The script runs as root and drops privileges itself before running the
    /// original entrypoint.
    pub fn enable_injected_entrypoint(
        &mut self,
        original: Option<&EntrypointDeclaration>,
    ) -> &mut Self {
        self.run_as_root = true;
        let script = self.host.entrypoint_script.to_string_lossy().into_owned();
        self.set_bind_mount(script, ENTRYPOINT_CONTAINER_PATH, MountMode::ReadOnly);

        for (key, value) in encode_entrypoint(original) {
            self.set_env(key, value);
        }

        self.set_entrypoint(ENTRYPOINT_CONTAINER_PATH)
    }

    /// Configuration shared by services and commands: entrypoint, host names,
    /// volumes, environment and overlay targets
    pub fn apply_common_config(
        &mut self,
        source: &dyn ContainerSource,
        image_config: &ImageConfig,
        use_named_volumes: bool,
        unimportant_paths: &[String],
    ) -> &mut Self {
        self.enable_injected_entrypoint(image_config.entrypoint.as_ref());

        let hostnames = self.host.host_system_hostnames.join(" ");
        self.set_env(EENV_HOST_SYSTEM_HOSTNAMES, hostnames);

        for (host_path, volume) in source.volumes() {
            match (&volume.name, use_named_volumes) {
                (Some(name), true) => {
                    self.set_named_volume_mount(name, volume.container.clone(), volume.mode)
                }
                _ => self.set_bind_mount(host_path.clone(), volume.container.clone(), volume.mode),
            };
        }

        for (key, value) in source.environment() {
            self.set_env(key.clone(), value.clone());
        }

        self.set_env(EENV_OVERLAY_TARGETS, unimportant_paths.join(":"));
        // Mounting overlay filesystems needs SYS_ADMIN
        if !unimportant_paths.is_empty() {
            self.cap_sys_admin = true;
        }

        self
    }

    /// Initialize from a service document. The main port is added separately
    /// with [`SpecBuilder::set_main_port`], under the port allocation lock.
    pub fn init_from_service(
        &mut self,
        service: &Service,
        project: &Project,
        image_config: &ImageConfig,
        user: HostUser,
    ) -> &mut Self {
        let overlay_targets = project.overlay_targets();
        self.apply_common_config(
            service,
            image_config,
            project.performance.dont_sync_named_volumes_with_host,
            &overlay_targets,
        );

        let mut environment = logging_command_settings(service);
        environment.extend(entrypoint_user_settings(service, user, image_config));
        for (key, value) in environment {
            self.set_env(key, value);
        }

        for (key, value) in service_labels(service, &project.name) {
            self.set_label(key, value);
        }

        for (container_port, host_port) in &service.additional_ports {
            self.set_port(*container_port, *host_port);
        }

        if service.allow_full_memlock {
            self.set_allow_full_memlock(true);
        }
        if service.use_host_network {
            self.set_host_networking(true);
        }

        self
    }

    pub fn init_from_command(
        &mut self,
        command: &crate::model::Command,
        project: &Project,
        image_config: &ImageConfig,
    ) -> &mut Self {
        let overlay_targets = project.overlay_targets();
        self.apply_common_config(
            command,
            image_config,
            project.performance.dont_sync_named_volumes_with_host,
            &overlay_targets,
        )
    }

    /// Publish the main service port and record it in the port label
    pub fn set_main_port(&mut self, container_port: u16, host_port: u16) -> &mut Self {
        self.set_label(LABEL_HTTP_PORT, host_port.to_string());
        self.set_port(container_port, host_port)
    }

    fn rendered_command(&self) -> Option<RenderedCommand> {
        match &self.command {
            None if self.args.is_empty() => None,
            None => Some(RenderedCommand::Exec(
                self.args.iter().map(|a| quote_if_spaced(a)).collect(),
            )),
            Some(CommandLine::Shell(line)) if self.args.is_empty() => {
                Some(RenderedCommand::Shell(line.clone()))
            }
            Some(CommandLine::Shell(line)) => Some(RenderedCommand::Shell(format!(
                "{} {}",
                line,
                quote_all(&self.args)
            ))),
            // Arguments containing spaces must be quoted for the entrypoint script
            Some(CommandLine::Exec(words)) => Some(RenderedCommand::Exec(
                words
                    .iter()
                    .chain(self.args.iter())
                    .map(|w| quote_if_spaced(w))
                    .collect(),
            )),
        }
    }

    fn rendered_environment(&self) -> IndexMap<String, String> {
        let mut environment = self.env.clone();
        if !self.named_volumes_in_container.is_empty() {
            environment.insert(
                EENV_NAMED_VOLUMES.to_string(),
                self.named_volumes_in_container.join(":"),
            );
        }
        environment
    }

    /// Structured create call
    pub fn render(&self) -> ContainerSpec {
        let (network, network_mode, ports) = if self.use_host_network {
            (None, Some("host".to_string()), IndexMap::new())
        } else {
            (self.network.clone(), None, self.ports.clone())
        };

        let mut ulimits = Vec::new();
        if self.allow_full_memlock {
            ulimits.push(Ulimit {
                name: "memlock".to_string(),
                soft: -1,
                hard: -1,
            });
        }

        let mut cap_add = Vec::new();
        let mut security_opt = Vec::new();
        if self.cap_sys_admin {
            cap_add.push("SYS_ADMIN".to_string());
            if self.host.os == HostOs::Linux {
                security_opt.push("apparmor:unconfined".to_string());
            }
        }

        ContainerSpec {
            image: self.image.clone(),
            name: self.name.clone(),
            command: self.rendered_command(),
            entrypoint: self.entrypoint.clone().map(|e| vec![e]),
            network,
            network_mode,
            ports,
            working_dir: self.work_dir.clone(),
            user: self.run_as_root.then(|| "0".to_string()),
            hostname: self.hostname.clone(),
            ulimits,
            cap_add,
            security_opt,
            environment: self.rendered_environment(),
            labels: self.labels.clone(),
            mounts: self.mounts.values().cloned().collect(),
            platform: self.host.platform.clone(),
        }
    }

    /// Equivalent interactive `docker run` invocation
    pub fn render_cli(&self) -> Vec<String> {
        let mut shell: Vec<String> = vec![
            self.host.docker_binary.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
        ];
        fn flag(shell: &mut Vec<String>, name: &str, value: String) {
            shell.push(name.to_string());
            shell.push(value);
        }

        if self.host.tty {
            shell.push("-t".to_string());
        }
        if let Some(name) = &self.name {
            flag(&mut shell, "--name", name.clone());
        }

        if self.use_host_network {
            flag(&mut shell, "--network", "host".to_string());
        } else {
            if let Some(network) = &self.network {
                flag(&mut shell, "--network", network.clone());
            }
            for (container_port, host_port) in &self.ports {
                flag(&mut shell, "-p", format!("{}:{}", host_port, container_port));
            }
        }

        if let Some(entrypoint) = &self.entrypoint {
            flag(&mut shell, "--entrypoint", entrypoint.clone());
        }
        if let Some(work_dir) = &self.work_dir {
            flag(&mut shell, "-w", work_dir.clone());
        }
        if self.run_as_root {
            flag(&mut shell, "-u", "0".to_string());
        }
        if let Some(hostname) = &self.hostname {
            flag(&mut shell, "--hostname", hostname.clone());
        }

        for (key, value) in self.rendered_environment() {
            flag(&mut shell, "-e", format!("{}={}", key, value));
        }
        for (key, value) in &self.labels {
            flag(&mut shell, "--label", format!("{}={}", key, value));
        }
        for mount in self.mounts.values() {
            flag(&mut shell, "--mount", mount.to_cli(self.host.os));
        }

        if self.allow_full_memlock {
            flag(&mut shell, "--ulimit", "memlock=-1:-1".to_string());
        }
        if self.cap_sys_admin {
            shell.push("--cap-add=SYS_ADMIN".to_string());
            if self.host.os == HostOs::Linux {
                shell.push("--security-opt".to_string());
                shell.push("apparmor:unconfined".to_string());
            }
        }
        if let Some(platform) = &self.host.platform {
            shell.push(format!("--platform={}", platform));
        }

        shell.push(self.image.clone());
        if let Some(command) = self.rendered_command() {
            let line = command.to_command_line();
            if !line.is_empty() {
                shell.push(line);
            }
        }

        shell
    }
}

/// Labels identifying a service container
pub fn service_labels(service: &Service, project_name: &str) -> IndexMap<String, String> {
    let mut labels = IndexMap::new();
    labels.insert(LABEL_IS_RIPTIDE.to_string(), "1".to_string());
    labels.insert(LABEL_PROJECT.to_string(), project_name.to_string());
    labels.insert(LABEL_SERVICE.to_string(), service.name.clone());
    let main = if service.has_role(ROLE_MAIN) { "1" } else { "0" };
    labels.insert(LABEL_MAIN.to_string(), main.to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::entrypoint::{
        EENV_COMMAND_LOG_PREFIX, EENV_DONT_RUN_CMD, EENV_GROUP, EENV_ORIGINAL_ENTRYPOINT,
        EENV_RUN_MAIN_CMD_AS_USER, EENV_USER,
    };
    use crate::model::VolumeDefinition;

    const IMAGE: &str = "unit/testimage";
    const COMMAND: &str = "test_command";
    const SCRIPT: &str = "/assets/entrypoint.sh";

    fn linux_host() -> HostEnvironment {
        HostEnvironment {
            os: HostOs::Linux,
            entrypoint_script: PathBuf::from(SCRIPT),
            host_system_hostnames: vec!["dummy1".to_string(), "dummy2".to_string()],
            platform: None,
            docker_binary: "docker".to_string(),
            tty: false,
        }
    }

    fn builder(command: Option<CommandLine>) -> SpecBuilder {
        SpecBuilder::for_host(IMAGE, command, linux_host())
    }

    fn shell(line: &str) -> Option<CommandLine> {
        Some(CommandLine::Shell(line.to_string()))
    }

    fn exec(words: &[&str]) -> Option<CommandLine> {
        Some(CommandLine::Exec(words.iter().map(|w| w.to_string()).collect()))
    }

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    fn cli(middle: &[&str]) -> Vec<String> {
        let mut expected = strings(&["docker", "run", "--rm", "-i"]);
        expected.extend(strings(middle));
        expected
    }

    #[test]
    fn test_simple() {
        let spec = builder(shell(COMMAND)).render();
        assert_eq!(spec.image, IMAGE);
        assert_eq!(spec.command, Some(RenderedCommand::Shell(COMMAND.to_string())));
        assert_eq!(spec.environment.len(), 1);
        assert_eq!(spec.environment[EENV_ON_LINUX], "1");
        assert_eq!(spec.labels.len(), 1);
        assert_eq!(spec.labels["riptide"], "1");
        assert!(spec.mounts.is_empty());
        assert!(spec.ports.is_empty());
        assert_eq!(spec.user, None);

        assert_eq!(
            builder(shell(COMMAND)).render_cli(),
            cli(&[
                "-e",
                "RIPTIDE__DOCKER_ON_LINUX=1",
                "--label",
                "riptide=1",
                IMAGE,
                COMMAND
            ])
        );
    }

    #[test]
    fn test_tty_and_platform() {
        let mut host = linux_host();
        host.platform = Some("linux/arm64".to_string());
        let mut b = SpecBuilder::for_host(IMAGE, shell(COMMAND), host);
        b.set_tty(true);

        assert_eq!(b.render().platform, Some("linux/arm64".to_string()));
        assert_eq!(
            b.render_cli(),
            cli(&[
                "-t",
                "-e",
                "RIPTIDE__DOCKER_ON_LINUX=1",
                "--label",
                "riptide=1",
                "--platform=linux/arm64",
                IMAGE,
                COMMAND
            ])
        );
    }

    #[test]
    fn test_command_list_with_spaces_and_args() {
        let mut b = builder(exec(&["cmd", "a b"]));
        b.set_args(strings(&["x"]));

        assert_eq!(
            b.render().command,
            Some(RenderedCommand::Exec(strings(&["cmd", "\"a b\"", "x"])))
        );
        assert_eq!(b.render_cli().last().unwrap(), "cmd \"a b\" x");
    }

    #[test]
    fn test_command_string_with_args() {
        let mut b = builder(shell("cmd"));
        b.set_args(strings(&["a", "b c"]));

        assert_eq!(
            b.render().command,
            Some(RenderedCommand::Shell("cmd \"a\" \"b c\"".to_string()))
        );
        assert_eq!(b.render_cli().last().unwrap(), "cmd \"a\" \"b c\"");
    }

    #[test]
    fn test_command_string_keeps_own_quoting() {
        let line = "elem1 elem2 \"elem4a elem4b\" 'elem5a elem5b'";
        let b = builder(shell(line));
        assert_eq!(b.render().command, Some(RenderedCommand::Shell(line.to_string())));
        assert_eq!(b.render_cli().last().unwrap(), line);
    }

    #[test]
    fn test_command_none() {
        let b = builder(None);
        assert_eq!(b.render().command, None);
        assert_eq!(b.render_cli().last().unwrap(), IMAGE);

        let mut b = builder(None);
        b.set_args(strings(&["--verbose", "two words"]));
        assert_eq!(
            b.render().command,
            Some(RenderedCommand::Exec(strings(&["--verbose", "\"two words\""])))
        );
    }

    #[test]
    fn test_env_insertion_order_and_last_write_wins() {
        let mut b = builder(shell(COMMAND));
        b.set_env("B", "1").set_env("A", "2").set_env("B", "3");

        let env: Vec<(String, String)> = b.render().environment.into_iter().collect();
        assert_eq!(
            env,
            vec![
                (EENV_ON_LINUX.to_string(), "1".to_string()),
                ("B".to_string(), "3".to_string()),
                ("A".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_mounts() {
        let mut b = builder(shell(COMMAND));
        b.set_bind_mount("/host/a", "/cnt/a", MountMode::ReadWrite)
            .set_named_volume_mount("cache", "/cnt/cache", MountMode::ReadOnly);

        let spec = b.render();
        assert_eq!(
            spec.mounts,
            vec![
                MountSpec {
                    source: "/host/a".to_string(),
                    target: "/cnt/a".to_string(),
                    read_only: false,
                    kind: MountKind::Bind,
                },
                MountSpec {
                    source: "riptide__cache".to_string(),
                    target: "/cnt/cache".to_string(),
                    read_only: true,
                    kind: MountKind::Volume,
                },
            ]
        );
        assert_eq!(spec.environment[EENV_NAMED_VOLUMES], "/cnt/cache");

        assert_eq!(
            b.render_cli(),
            cli(&[
                "-e",
                "RIPTIDE__DOCKER_ON_LINUX=1",
                "-e",
                "RIPTIDE__DOCKER_NAMED_VOLUMES=/cnt/cache",
                "--label",
                "riptide=1",
                "--mount",
                "type=bind,dst=/cnt/a,src=/host/a,ro=0",
                "--mount",
                "type=volume,target=/cnt/cache,src=riptide__cache,ro=1,volume-label=riptide=1",
                IMAGE,
                COMMAND
            ])
        );
    }

    #[test]
    fn test_bind_mount_on_mac_is_delegated() {
        let mount = MountSpec {
            source: "/h".to_string(),
            target: "/c".to_string(),
            read_only: false,
            kind: MountKind::Bind,
        };
        assert_eq!(
            mount.to_cli(HostOs::MacOs),
            "type=bind,dst=/c,src=/h,ro=0,consistency=delegated"
        );
    }

    #[test]
    fn test_ports_network_and_host_network_precedence() {
        let mut b = builder(shell(COMMAND));
        b.set_network("riptide__shop").set_port(80, 30000);

        let spec = b.render();
        assert_eq!(spec.network, Some("riptide__shop".to_string()));
        assert_eq!(spec.ports.get(&80), Some(&30000));
        let args = b.render_cli();
        assert!(args.windows(2).any(|w| w == ["--network", "riptide__shop"]));
        assert!(args.windows(2).any(|w| w == ["-p", "30000:80"]));

        b.set_host_networking(true);
        let spec = b.render();
        assert_eq!(spec.network, None);
        assert_eq!(spec.network_mode, Some("host".to_string()));
        assert!(spec.ports.is_empty());
        let args = b.render_cli();
        assert!(args.windows(2).any(|w| w == ["--network", "host"]));
        assert!(!args.iter().any(|a| a == "-p"));
    }

    #[test]
    fn test_name_workdir_hostname_order() {
        let mut b = builder(shell(COMMAND));
        b.set_hostname("dubdub")
            .set_workdir("/tmp/blubbel")
            .set_name("riptide__shop__www");

        assert_eq!(
            b.render_cli(),
            cli(&[
                "--name",
                "riptide__shop__www",
                "-w",
                "/tmp/blubbel",
                "--hostname",
                "dubdub",
                "-e",
                "RIPTIDE__DOCKER_ON_LINUX=1",
                "--label",
                "riptide=1",
                IMAGE,
                COMMAND
            ])
        );
    }

    #[test]
    fn test_enable_injected_entrypoint_exec_form() {
        let mut b = builder(shell(COMMAND));
        let original = EntrypointDeclaration::Exec(strings(&["cmd", "arg1", "arg2 with space"]));
        b.enable_injected_entrypoint(Some(&original));

        let spec = b.render();
        assert_eq!(spec.user, Some("0".to_string()));
        assert_eq!(spec.entrypoint, Some(vec![ENTRYPOINT_CONTAINER_PATH.to_string()]));
        assert_eq!(
            spec.mounts,
            vec![MountSpec {
                source: SCRIPT.to_string(),
                target: ENTRYPOINT_CONTAINER_PATH.to_string(),
                read_only: true,
                kind: MountKind::Bind,
            }]
        );
        assert_eq!(
            spec.environment[EENV_ORIGINAL_ENTRYPOINT],
            "cmd \"arg1\" \"arg2 with space\""
        );

        assert_eq!(
            b.render_cli(),
            cli(&[
                "--entrypoint",
                ENTRYPOINT_CONTAINER_PATH,
                "-u",
                "0",
                "-e",
                "RIPTIDE__DOCKER_ON_LINUX=1",
                "-e",
                "RIPTIDE__DOCKER_ORIGINAL_ENTRYPOINT=cmd \"arg1\" \"arg2 with space\"",
                "--label",
                "riptide=1",
                "--mount",
                "type=bind,dst=/entrypoint_riptide.sh,src=/assets/entrypoint.sh,ro=1",
                IMAGE,
                COMMAND
            ])
        );
    }

    #[test]
    fn test_enable_injected_entrypoint_shell_form() {
        let mut b = builder(shell(COMMAND));
        let original = EntrypointDeclaration::Shell("entrypoint is a string".to_string());
        b.enable_injected_entrypoint(Some(&original));

        let spec = b.render();
        assert_eq!(
            spec.environment[EENV_ORIGINAL_ENTRYPOINT],
            "/bin/sh -c entrypoint is a string"
        );
        assert_eq!(spec.environment[EENV_DONT_RUN_CMD], "true");
    }

    fn service_fixture() -> (Service, Project) {
        let mut service = Service::new("SERVICENAME", IMAGE);
        service
            .logging_commands
            .insert("name2".to_string(), "command2".to_string());
        service
            .logging_commands
            .insert("name1".to_string(), "command1".to_string());
        service.additional_ports.insert(1234, 5678);
        service.volumes.insert(
            "host1".to_string(),
            VolumeDefinition::new("bind1", MountMode::ReadOnly).named("namedvolume"),
        );
        service.volumes.insert(
            "host2".to_string(),
            VolumeDefinition::new("bind2", MountMode::ReadWrite),
        );
        service
            .environment
            .insert("key1".to_string(), "value1".to_string());
        (service, Project::new("PROJECTNAME"))
    }

    #[test]
    fn test_init_from_service() {
        let (service, project) = service_fixture();
        let image = ImageConfig {
            user: Some("12345".to_string()),
            ..Default::default()
        };

        let mut b = builder(shell(COMMAND));
        b.init_from_service(&service, &project, &image, HostUser { uid: 9898, gid: 8989 });
        let spec = b.render();

        let env: Vec<&str> = spec.environment.keys().map(|k| k.as_str()).collect();
        let log1 = format!("{}name1", EENV_COMMAND_LOG_PREFIX);
        let log2 = format!("{}name2", EENV_COMMAND_LOG_PREFIX);
        assert_eq!(
            env,
            vec![
                EENV_ON_LINUX,
                EENV_ORIGINAL_ENTRYPOINT,
                EENV_HOST_SYSTEM_HOSTNAMES,
                "key1",
                EENV_OVERLAY_TARGETS,
                log1.as_str(),
                log2.as_str(),
                EENV_USER,
                EENV_GROUP,
                EENV_RUN_MAIN_CMD_AS_USER,
            ]
        );
        assert_eq!(spec.environment[EENV_HOST_SYSTEM_HOSTNAMES], "dummy1 dummy2");
        assert_eq!(spec.environment[EENV_OVERLAY_TARGETS], "");
        assert_eq!(spec.environment[EENV_USER], "9898");

        let labels: Vec<(&str, &str)> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("riptide", "1"),
                ("riptide_project", "PROJECTNAME"),
                ("riptide_service", "SERVICENAME"),
                ("riptide_main", "0"),
            ]
        );

        // Named volumes are only used when the performance setting asks for them
        assert_eq!(spec.mounts[1].kind, MountKind::Bind);
        assert_eq!(spec.mounts[1].source, "host1");
        assert!(spec.mounts[1].read_only);
        assert_eq!(spec.ports.get(&1234), Some(&5678));
        assert!(spec.cap_add.is_empty());
    }

    #[test]
    fn test_init_from_service_named_volumes_and_overlays() {
        let (mut service, mut project) = service_fixture();
        service.roles.push(ROLE_MAIN.to_string());
        service.allow_full_memlock = true;
        project.performance.dont_sync_named_volumes_with_host = true;
        project.performance.dont_sync_unimportant_src = true;
        project.unimportant_paths = strings(&["unimportant_1", "unimportant_2/subpath"]);

        let mut b = builder(shell(COMMAND));
        b.init_from_service(
            &service,
            &project,
            &ImageConfig::default(),
            HostUser { uid: 1, gid: 1 },
        );
        let spec = b.render();

        assert_eq!(spec.labels["riptide_main"], "1");
        assert_eq!(spec.mounts[1].kind, MountKind::Volume);
        assert_eq!(spec.mounts[1].source, "riptide__namedvolume");
        assert_eq!(spec.environment[EENV_NAMED_VOLUMES], "bind1");
        assert_eq!(
            spec.environment[EENV_OVERLAY_TARGETS],
            "/src/unimportant_1:/src/unimportant_2/subpath"
        );
        assert_eq!(spec.cap_add, strings(&["SYS_ADMIN"]));
        assert_eq!(spec.security_opt, strings(&["apparmor:unconfined"]));
        assert_eq!(
            spec.ulimits,
            vec![Ulimit {
                name: "memlock".to_string(),
                soft: -1,
                hard: -1
            }]
        );

        let args = b.render_cli();
        let tail: Vec<&str> = args[args.len() - 7..].iter().map(|a| a.as_str()).collect();
        assert_eq!(
            tail,
            vec![
                "--ulimit",
                "memlock=-1:-1",
                "--cap-add=SYS_ADMIN",
                "--security-opt",
                "apparmor:unconfined",
                IMAGE,
                COMMAND
            ]
        );
    }

    #[test]
    fn test_capabilities_off_linux() {
        let mut host = linux_host();
        host.os = HostOs::MacOs;
        let mut project = Project::new("p");
        project.performance.dont_sync_unimportant_src = true;
        project.unimportant_paths = strings(&["vendor"]);
        let command = crate::model::Command::new("c", IMAGE);

        let mut b = SpecBuilder::for_host(IMAGE, None, host);
        b.init_from_command(&command, &project, &ImageConfig::default());
        let spec = b.render();

        assert_eq!(spec.environment[EENV_ON_LINUX], "0");
        assert_eq!(spec.cap_add, strings(&["SYS_ADMIN"]));
        assert!(spec.security_opt.is_empty());
    }

    #[test]
    fn test_set_main_port() {
        let mut b = builder(shell(COMMAND));
        b.set_main_port(4536, 9876);

        let spec = b.render();
        assert_eq!(spec.ports.get(&4536), Some(&9876));
        assert_eq!(spec.labels[LABEL_HTTP_PORT], "9876");
        assert_eq!(
            b.render_cli(),
            cli(&[
                "-p",
                "9876:4536",
                "-e",
                "RIPTIDE__DOCKER_ON_LINUX=1",
                "--label",
                "riptide=1",
                "--label",
                "riptide_port=9876",
                IMAGE,
                COMMAND
            ])
        );
    }
}
