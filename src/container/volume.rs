//! Named volume management
//!
//! Named volumes are addressed by their logical name everywhere in the public
//! API. The physical volume on the daemon carries the internal prefix and the
//! ownership label, which is how [`VolumeStore::list`] tells managed volumes
//! apart from foreign ones.

use std::collections::HashMap;
use std::sync::Arc;

use super::builder::{HostEnvironment, SpecBuilder};
use crate::error::{EngineError, RuntimeError};
use crate::model::{CommandLine, MountMode};
use crate::names::{named_volume_name, strip_named_volume_prefix, LABEL_IS_RIPTIDE, PREFIX};
use crate::runtime::{pull_with_progress, ContainerRuntime, LogStreams};

const COPY_FROM: &str = "/copy_from";
const COPY_TO: &str = "/copy_to";

/// Check that `name` can be used as a logical volume name.
///
/// Docker volume names allow alphanumerics, `-`, `_` and `.`; the first
/// character must be alphanumeric.
pub fn validate_volume_name(name: &str) -> Result<(), EngineError> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(EngineError::User("Volume name cannot be empty".to_string())),
        Some(first) if !first.is_ascii_alphanumeric() => {
            return Err(EngineError::User(format!(
                "Volume name '{}' must start with a letter or digit",
                name
            )))
        }
        Some(_) => {}
    }

    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(EngineError::User(format!(
            "Volume name '{}' contains invalid characters. Only alphanumeric, hyphens, underscores, and periods are allowed",
            name
        )));
    }
    Ok(())
}

/// Name of the throwaway container used by [`VolumeStore::copy`]
pub fn copy_helper_name() -> String {
    format!("{}__volume_copy__{}", PREFIX, uuid::Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct VolumeStore {
    runtime: Arc<dyn ContainerRuntime>,
    helper_image: String,
    host: HostEnvironment,
}

impl VolumeStore {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, helper_image: impl Into<String>, host: HostEnvironment) -> Self {
        Self {
            runtime,
            helper_image: helper_image.into(),
            host,
        }
    }

    /// Logical names of all managed named volumes
    pub async fn list(&self) -> Result<Vec<String>, EngineError> {
        let volumes = self.runtime.list_volumes().await?;
        Ok(volumes
            .into_iter()
            .filter(|volume| volume.labels.contains_key(LABEL_IS_RIPTIDE))
            .map(|volume| strip_named_volume_prefix(&volume.name).to_string())
            .collect())
    }

    pub async fn exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.runtime.volume_exists(&named_volume_name(name)).await?)
    }

    /// Create the named volume `name`; fails if it already exists
    pub async fn create(&self, name: &str) -> Result<(), EngineError> {
        validate_volume_name(name)?;
        if self.exists(name).await? {
            return Err(EngineError::User(format!(
                "The named volume {} already exists.",
                name
            )));
        }

        let labels = HashMap::from([(LABEL_IS_RIPTIDE.to_string(), "1".to_string())]);
        self.runtime
            .create_volume(&named_volume_name(name), labels)
            .await?;
        log::info!("Created named volume {}", name);
        Ok(())
    }

    /// Delete the named volume `name`; deleting a missing volume succeeds
    pub async fn delete(&self, name: &str) -> Result<(), EngineError> {
        match self.runtime.remove_volume(&named_volume_name(name)).await {
            Ok(()) => {
                log::info!("Deleted named volume {}", name);
                Ok(())
            }
            Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy the contents of `from` into the new named volume `to`.
    ///
    /// The copy runs in a helper container that mounts `from` read-only and
    /// `to` writable. The helper is removed whatever the outcome.
    pub async fn copy(&self, from: &str, to: &str) -> Result<(), EngineError> {
        validate_volume_name(to)?;
        if !self.exists(from).await? {
            return Err(EngineError::User(format!(
                "The named volume {} does not exist.",
                from
            )));
        }
        if self.exists(to).await? {
            return Err(EngineError::User(format!(
                "The named volume {} already exists.",
                to
            )));
        }

        if !self.runtime.image_exists(&self.helper_image).await? {
            log::info!("Pulling helper image {}", self.helper_image);
            pull_with_progress(
                self.runtime.as_ref(),
                &self.helper_image,
                self.host.platform.as_deref(),
                |line| log::debug!("{}", line),
            )
            .await?;
        }

        let labels = HashMap::from([(LABEL_IS_RIPTIDE.to_string(), "1".to_string())]);
        self.runtime
            .create_volume(&named_volume_name(to), labels)
            .await?;

        let helper = copy_helper_name();
        let command = CommandLine::Exec(vec![
            "cp".to_string(),
            "-a".to_string(),
            format!("{}/.", COPY_FROM),
            format!("{}/", COPY_TO),
        ]);
        let mut builder = SpecBuilder::for_host(&self.helper_image, Some(command), self.host.clone());
        builder
            .set_name(&helper)
            .set_named_volume_mount(from, COPY_FROM, MountMode::ReadOnly)
            .set_named_volume_mount(to, COPY_TO, MountMode::ReadWrite);

        log::info!("Copying named volume {} to {}", from, to);
        let result = self.run_copy(&helper, &builder).await;

        if let Err(e) = self.runtime.remove_container(&helper, true).await {
            if !e.is_not_found() {
                log::warn!("Failed to remove volume copy helper {}: {}", helper, e);
            }
        }
        if result.is_err() {
            if let Err(e) = self.runtime.remove_volume(&named_volume_name(to)).await {
                log::warn!("Failed to remove incomplete volume {}: {}", to, e);
            }
        }

        result.map_err(|e| match e {
            EngineError::Runtime(err) => EngineError::execution(
                format!("Error copying the named volume {} -> {}: {}", from, to, err),
                String::new(),
            ),
            other => other,
        })
    }

    async fn run_copy(&self, helper: &str, builder: &SpecBuilder) -> Result<(), EngineError> {
        self.runtime.create_container(&builder.render()).await?;
        self.runtime.start_container(helper).await?;
        let exit_code = self.runtime.wait_container(helper).await?;

        if exit_code != 0 {
            let output = self
                .runtime
                .container_logs(helper, LogStreams::Both)
                .await
                .unwrap_or_default();
            return Err(EngineError::execution(
                format!("Copying the named volume failed with exit status {}", exit_code),
                output,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageConfig;
    use crate::runtime::{InMemoryRuntime, RuntimeCall};

    fn store(runtime: Arc<InMemoryRuntime>) -> VolumeStore {
        VolumeStore::new(runtime, "alpine", HostEnvironment::default())
    }

    #[test]
    fn test_validate_volume_name() {
        assert!(validate_volume_name("cache").is_ok());
        assert!(validate_volume_name("db-data_1.bak").is_ok());

        assert!(validate_volume_name("").is_err());
        assert!(validate_volume_name("-cache").is_err());
        assert!(validate_volume_name("my cache").is_err());
        assert!(validate_volume_name("a/b").is_err());
    }

    #[test]
    fn test_copy_helper_name_is_unique() {
        let first = copy_helper_name();
        assert!(first.starts_with("riptide__volume_copy__"));
        assert_ne!(first, copy_helper_name());
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime
            .create_volume("foreign", HashMap::new())
            .await
            .unwrap();
        let store = store(runtime.clone());

        store.create("cache").await.unwrap();
        assert!(store.exists("cache").await.unwrap());
        assert!(runtime.volumes().contains(&"riptide__cache".to_string()));
        assert_eq!(store.list().await.unwrap(), vec!["cache".to_string()]);

        let err = store.create("cache").await.unwrap_err();
        assert!(matches!(err, EngineError::User(_)));

        store.delete("cache").await.unwrap();
        store.delete("cache").await.unwrap();
        assert!(!store.exists("cache").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_mounts_source_read_only() {
        let runtime = Arc::new(InMemoryRuntime::new().with_image("alpine", ImageConfig::default()));
        let store = store(runtime.clone());
        store.create("db").await.unwrap();

        store.copy("db", "db_backup").await.unwrap();

        let creates: Vec<String> = runtime
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::CreateContainer(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(creates.len(), 1);
        assert!(store.exists("db_backup").await.unwrap());
        // Removed afterwards
        assert!(runtime.container_names().is_empty());
        assert!(runtime
            .calls()
            .contains(&RuntimeCall::RemoveContainer(creates[0].clone())));
    }

    #[tokio::test]
    async fn test_copy_failure_carries_output() {
        let runtime = Arc::new(InMemoryRuntime::new().with_image("alpine", ImageConfig::default()));
        runtime.exit_when(
            |spec| {
                spec.mounts
                    .iter()
                    .any(|m| m.target == COPY_FROM && m.read_only)
            },
            1,
            "cp: can't create directory",
        );
        let store = store(runtime.clone());
        store.create("db").await.unwrap();

        let err = store.copy("db", "db_backup").await.unwrap_err();
        assert_eq!(err.details(), Some("cp: can't create directory"));
        assert!(!store.exists("db_backup").await.unwrap());
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_copy_preconditions() {
        let runtime = Arc::new(InMemoryRuntime::new().with_image("alpine", ImageConfig::default()));
        let store = store(runtime.clone());

        let err = store.copy("missing", "target").await.unwrap_err();
        assert_eq!(err.to_string(), "The named volume missing does not exist.");

        store.create("a").await.unwrap();
        store.create("b").await.unwrap();
        let err = store.copy("a", "b").await.unwrap_err();
        assert_eq!(err.to_string(), "The named volume b already exists.");
        assert!(!runtime
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::CreateContainer(_))));
    }
}
