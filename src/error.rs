/// Errors reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime) implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Docker API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Docker transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RuntimeError::Conflict(_))
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => RuntimeError::NotFound(message),
                409 => RuntimeError::Conflict(message),
                403 if message.contains("already exists") => RuntimeError::Conflict(message),
                status => RuntimeError::Api { status, message },
            },
            other => RuntimeError::Transport(other.to_string()),
        }
    }
}

/// Errors that can occur while driving containers through their lifecycle
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// A container ran and exited non-zero
    #[error("{message}")]
    Execution { message: String, output: String },
    /// The request itself is invalid; nothing was touched
    #[error("{0}")]
    User(String),
    #[error("{message}")]
    Crashed { message: String, logs: String },
    #[error("No free host port found at or above {0}")]
    PortsExhausted(u16),
    #[error("Service {0} must be running to use this command.")]
    ServiceStopped(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn execution(message: impl Into<String>, output: impl Into<String>) -> Self {
        EngineError::Execution {
            message: message.into(),
            output: output.into(),
        }
    }

    /// Captured container output attached to this error, if any
    pub fn details(&self) -> Option<&str> {
        match self {
            EngineError::Execution { output, .. } => Some(output),
            EngineError::Crashed { logs, .. } => Some(logs),
            _ => None,
        }
    }
}
