use std::path::PathBuf;
use std::time::Duration;

pub const ENV_DOCKER_DEFAULT_PLATFORM: &str = "DOCKER_DEFAULT_PLATFORM";
pub const ENV_DOCKER_BINARY: &str = "RIPTIDE_DOCKER_BINARY";
pub const ENV_PORT_START: &str = "RIPTIDE_ENGINE_PORT_START";
pub const ENV_ASSETS_DIR: &str = "RIPTIDE_ENGINE_ASSETS_DIR";

/// Main service ports are published on host ports starting here
pub const HTTP_PORT_BIND_START: u16 = 30000;

/// Runtime configuration of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// First host port probed for main service ports
    pub port_range_start: u16,
    /// How long to wait after starting a service before checking it is still alive
    pub post_start_grace: Duration,
    /// Delay between existence checks when attaching links to a foreground container
    pub link_poll_interval: Duration,
    pub link_poll_attempts: u32,
    /// Delay between checks while a container sits in a transient state ("created")
    pub transient_poll_interval: Duration,
    pub transient_poll_attempts: u32,
    /// Image of the throwaway containers used for volume copies
    pub helper_image: String,
    /// Host path of the injected entrypoint script
    pub entrypoint_script: PathBuf,
    /// Hostnames that must resolve to the host machine inside containers
    pub host_system_hostnames: Vec<String>,
    /// Platform passed to image pulls and container creation
    pub image_platform: Option<String>,
    /// Docker CLI used for interactive invocations
    pub docker_binary: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port_range_start: HTTP_PORT_BIND_START,
            post_start_grace: Duration::from_secs(3),
            link_poll_interval: Duration::from_millis(10),
            link_poll_attempts: 3000, // ~30 seconds
            transient_poll_interval: Duration::from_millis(500),
            transient_poll_attempts: 10,
            helper_image: "alpine".to_string(),
            entrypoint_script: default_assets_dir().join(crate::assets::ENTRYPOINT_SH),
            host_system_hostnames: vec!["host.riptide.internal".to_string()],
            image_platform: None,
            docker_binary: "docker".to_string(),
        }
    }
}

impl EngineConfig {
    /// Default configuration with overrides taken from the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(platform) = std::env::var(ENV_DOCKER_DEFAULT_PLATFORM) {
            if !platform.is_empty() {
                config.image_platform = Some(platform);
            }
        }

        if let Ok(binary) = std::env::var(ENV_DOCKER_BINARY) {
            if !binary.is_empty() {
                config.docker_binary = binary;
            }
        }

        if let Ok(start) = std::env::var(ENV_PORT_START) {
            match start.parse::<u16>() {
                Ok(port) => config.port_range_start = port,
                Err(e) => log::warn!("Ignoring invalid {}='{}': {}", ENV_PORT_START, start, e),
            }
        }

        if let Ok(dir) = std::env::var(ENV_ASSETS_DIR) {
            if !dir.is_empty() {
                config.entrypoint_script = PathBuf::from(dir).join(crate::assets::ENTRYPOINT_SH);
            }
        }

        config
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.entrypoint_script
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(default_assets_dir)
    }
}

fn default_assets_dir() -> PathBuf {
    std::env::temp_dir().join("riptide-engine-docker")
}
