//! Files mounted into managed containers

use std::path::{Path, PathBuf};

pub const ENTRYPOINT_SH: &str = "entrypoint.sh";

/// In-container path of the injected entrypoint script
pub const ENTRYPOINT_CONTAINER_PATH: &str = "/entrypoint_riptide.sh";

const ENTRYPOINT_SCRIPT: &str = include_str!("../assets/entrypoint.sh");

/// Write the entrypoint script to `path` so it can be bind-mounted.
///
/// The file is only rewritten when its content differs, so running containers
/// keep a stable mount source.
pub fn install_entrypoint(path: &Path) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let up_to_date = std::fs::read_to_string(path)
        .map(|current| current == ENTRYPOINT_SCRIPT)
        .unwrap_or(false);

    if !up_to_date {
        log::debug!("Installing entrypoint script to {}", path.display());
        std::fs::write(path, ENTRYPOINT_SCRIPT)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(path.to_path_buf())
}
