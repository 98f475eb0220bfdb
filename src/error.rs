use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Boxed error returned by stage functions, components and sources
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared form of a user error, so one failure can be observed by many waiters
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors that settle a pipeline run
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Pipeline was started without any stage
    #[error("Cannot start pipeline with no stages")]
    NoStages,

    /// A stage function, component or structural stage failed
    #[error("Stage {index} ({stage}) failed: {source}")]
    Stage {
        index: usize,
        stage: String,
        #[source]
        source: SharedError,
    },

    /// The item source signalled an error
    #[error("Source failed: {source}")]
    Source {
        #[source]
        source: SharedError,
    },

    /// Configuration or stage options are invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Start was requested outside of a tokio runtime
    #[error("No tokio runtime available to start the pipeline")]
    RuntimeUnavailable,

    /// The pipeline was torn down before reaching a terminal outcome
    #[error("Pipeline shut down before it settled")]
    Shutdown,
}

impl PipelineError {
    pub(crate) fn stage_failure(index: usize, stage: impl Into<String>, source: BoxError) -> Self {
        Self::Stage {
            index,
            stage: stage.into(),
            source: Arc::from(source),
        }
    }

    pub(crate) fn source_failure(source: BoxError) -> Self {
        Self::Source {
            source: Arc::from(source),
        }
    }

    /// The user error that caused the failure, exactly as it was raised
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Stage { source, .. } | Self::Source { source } => Some(&**source),
            _ => None,
        }
    }

    /// Downcast the original user error
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause()?.downcast_ref::<E>()
    }

    /// Index of the failing stage, if a stage failed
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            Self::Stage { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// A stage function or component panicked
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("panicked: {message}")]
pub struct PanicError {
    pub message: String,
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self { message }
    }
}
