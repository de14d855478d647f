//! Container specifications and named volumes
//!
//! This module turns services and commands into concrete container
//! specifications and manages the named volumes they mount.

pub mod builder;
pub mod entrypoint;
pub mod volume;

pub use builder::{
    service_labels, ContainerSpec, HostEnvironment, HostOs, MountKind, MountSpec,
    RenderedCommand, SpecBuilder, Ulimit,
};
pub use entrypoint::HostUser;
pub use volume::{validate_volume_name, VolumeStore};
