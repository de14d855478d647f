//! Deterministic names and labels for everything the engine creates on the daemon
//!
//! Other tools locate containers, networks and volumes by these names, so the
//! formats must not change.

pub const PREFIX: &str = "riptide";

/// Prefix of the physical name of every named volume
pub const NAMED_VOLUME_PREFIX: &str = "riptide__";

pub const LABEL_IS_RIPTIDE: &str = "riptide";
pub const LABEL_SERVICE: &str = "riptide_service";
pub const LABEL_PROJECT: &str = "riptide_project";
pub const LABEL_MAIN: &str = "riptide_main";
pub const LABEL_HTTP_PORT: &str = "riptide_port";

pub fn service_container_name(project_name: &str, service_name: &str) -> String {
    format!("{}__{}__{}", PREFIX, project_name, service_name)
}

pub fn cmd_container_name(project_name: &str, command_name: &str) -> String {
    format!(
        "{}__{}__cmd__{}__{}",
        PREFIX,
        project_name,
        command_name,
        std::process::id()
    )
}

pub fn detached_cmd_container_name(project_name: &str) -> String {
    format!(
        "{}__{}__detached_cmd__{}",
        PREFIX,
        project_name,
        std::process::id()
    )
}

pub fn pre_start_container_name(service_container_name: &str, ordinal: usize) -> String {
    format!("{}__pre_start{}", service_container_name, ordinal)
}

pub fn network_name(project_name: &str) -> String {
    format!("{}__{}", PREFIX, project_name)
}

pub fn named_volume_name(name: &str) -> String {
    format!("{}{}", NAMED_VOLUME_PREFIX, name)
}

/// Logical name of a physical volume name, as shown to users
pub fn strip_named_volume_prefix(physical: &str) -> &str {
    physical
        .strip_prefix(NAMED_VOLUME_PREFIX)
        .unwrap_or(physical)
}
