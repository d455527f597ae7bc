use thiserror::Error;

use crate::feed::FeedError;
use crate::record::RecordError;

/// Result type for feed pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while driving stages, merges and the ingestion bridge
#[derive(Error, Debug)]
pub enum PipelineError {
    /// An item or signal was delivered to a stage after it was closed
    #[error("stage `{stage}` is closed")]
    Closed { stage: String },

    /// Reading input or writing output failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be built from its input line
    #[error("malformed record: {0}")]
    Record(#[from] RecordError),

    /// A date/time template could not be applied
    #[error("invalid time template `{template}`: {reason}")]
    Template { template: String, reason: String },

    /// The external feed failed in a way the caller has to see
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    /// The queue stayed full for longer than the enqueue timeout
    #[error("queue is full")]
    QueueFull,

    /// The other end of the queue has gone away
    #[error("queue is disconnected")]
    QueueDisconnected,

    /// The run was cancelled through its shutdown handle
    #[error("interrupted")]
    Interrupted,

    /// Thread spawn or join error
    #[error("thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    pub(crate) fn closed(stage: &str) -> Self {
        PipelineError::Closed {
            stage: stage.to_owned(),
        }
    }

    /// Whether this error only reports that the run was cancelled
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PipelineError::Interrupted)
    }
}
