//! Docker engine for riptide projects
//!
//! Turns the services and commands of a project into containers and drives
//! them through their lifecycle against a Docker daemon.

pub mod assets;
pub mod command;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod model;
pub mod names;
pub mod network;
pub mod ports;
pub mod progress;
pub mod runtime;
pub mod service;

pub use command::{
    CommandRunner, ExecOptions, ForegroundOutcome, ForegroundTarget, InteractiveLauncher,
    ProcessLauncher, RunOptions,
};
pub use config::EngineConfig;
pub use container::{ContainerSpec, HostEnvironment, HostUser, SpecBuilder, VolumeStore};
pub use engine::DockerEngine;
pub use error::{EngineError, RuntimeError};
pub use model::{Command, CommandLine, Project, Service};
pub use network::{LinkOutcome, NetworkFabric};
pub use ports::{PortAllocator, PortProbe};
pub use progress::{ProgressEvent, ProgressFailure, ProgressSink, ProjectProgress};
pub use runtime::{ContainerRuntime, DockerRuntime, InMemoryRuntime};
pub use service::{ServiceOrchestrator, StartOptions};
