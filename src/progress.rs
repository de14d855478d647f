//! Progress reporting for service start and stop
//!
//! Each service operation reports into its own channel through a
//! [`ProgressSink`]. A sink delivers exactly one terminal event and drops
//! everything reported after it. [`ProjectProgress`] multiplexes the channels
//! of all services of one project operation.

use indexmap::IndexMap;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt, StreamMap};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUpdate {
    pub current: u32,
    /// `None` while the number of steps is not known yet
    pub total: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressFailure {
    pub message: String,
    pub cause: Option<String>,
    /// Captured container output
    pub details: Option<String>,
}

impl ProgressFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            details: None,
        }
    }

    pub fn with_cause(mut self, cause: &EngineError) -> Self {
        self.cause = Some(cause.to_string());
        if let Some(details) = cause.details() {
            self.details = Some(details.to_string());
        }
        self
    }

    /// Failure reported as `error` itself, carrying its captured output
    pub fn from_error(error: &EngineError) -> Self {
        Self {
            message: error.to_string(),
            cause: None,
            details: error.details().map(String::from),
        }
    }
}

impl std::fmt::Display for ProgressFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Step(StepUpdate),
    Succeeded,
    Failed(ProgressFailure),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Step(_))
    }
}

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Reporting end of a progress channel
#[derive(Debug)]
pub struct ProgressSink {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink nobody listens to
    pub fn detached() -> Self {
        Self { sender: None }
    }

    fn send(&mut self, event: ProgressEvent) {
        let terminal = event.is_terminal();
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                log::debug!("Progress receiver dropped");
            }
        }
        if terminal {
            self.sender = None;
        }
    }

    pub fn step(&mut self, current: u32, total: Option<u32>, text: impl Into<String>) {
        let text = text.into();
        log::debug!("[{}/{}] {}", current, total.map_or("?".to_string(), |t| t.to_string()), text);
        self.send(ProgressEvent::Step(StepUpdate {
            current,
            total,
            text,
        }));
    }

    pub fn succeed(&mut self) {
        self.send(ProgressEvent::Succeeded);
    }

    pub fn fail(&mut self, failure: ProgressFailure) {
        log::warn!("{}", failure);
        self.send(ProgressEvent::Failed(failure));
    }

    /// True once a terminal event was sent, or when there is no listener
    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

pub fn progress_channel() -> (ProgressSink, ProgressStream) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ProgressSink {
            sender: Some(sender),
        },
        Box::pin(UnboundedReceiverStream::new(receiver)),
    )
}

/// Progress of one operation over several services
#[derive(Default)]
pub struct ProjectProgress {
    streams: StreamMap<String, ProgressStream>,
}

impl std::fmt::Debug for ProjectProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectProgress")
            .field("services", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProjectProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: impl Into<String>, stream: ProgressStream) {
        self.streams.insert(service.into(), stream);
    }

    /// A service that fails before any work starts
    pub fn insert_failure(&mut self, service: impl Into<String>, failure: ProgressFailure) {
        let (mut sink, stream) = progress_channel();
        sink.fail(failure);
        self.insert(service, stream);
    }

    pub fn services(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    /// Next event of any service; `None` once every service has finished
    pub async fn next(&mut self) -> Option<(String, ProgressEvent)> {
        self.streams.next().await
    }

    /// Drain all events and return each service's outcome.
    ///
    /// A channel that closes without a terminal event counts as a failure.
    pub async fn collect_outcomes(mut self) -> IndexMap<String, Result<(), ProgressFailure>> {
        let mut outcomes: IndexMap<String, Result<(), ProgressFailure>> = self
            .services()
            .into_iter()
            .map(|service| {
                let unfinished = ProgressFailure::new("Operation ended without a result.");
                (service, Err(unfinished))
            })
            .collect();

        while let Some((service, event)) = self.next().await {
            match event {
                ProgressEvent::Step(_) => {}
                ProgressEvent::Succeeded => {
                    outcomes.insert(service, Ok(()));
                }
                ProgressEvent::Failed(failure) => {
                    outcomes.insert(service, Err(failure));
                }
            }
        }
        outcomes
    }
}
