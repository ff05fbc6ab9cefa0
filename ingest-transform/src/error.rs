use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Why a raw payload could not be turned into a canonical event.
/// These records are dropped, they are not business-shaped enough to dead-letter.
#[derive(Error, Debug)]
pub enum ParseFailure {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
    #[error("payload has malformed fields: {0}")]
    Fields(#[source] serde_json::Error),
}

/// Errors decoding the body of a push subscription request.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("no message in request")]
    MissingMessage,
    #[error("no data in message")]
    MissingData,
    #[error("message data is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Errors returned by the analytical sink on a bulk write.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink is unavailable: {0}")]
    Unavailable(String),
    #[error("sink write timed out after {0:?}")]
    Timeout(Duration),
    #[error("sink rejected rows in a batch of {rows}: {reason}")]
    RowsRejected { rows: usize, reason: String },
    #[error("sink refused the write and it cannot succeed on retry: {0}")]
    Misconfigured(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SinkError::Misconfigured(_))
    }
}

/// Errors publishing an invalid record to the dead-letter channel.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to serialize dead-letter record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to publish dead-letter record: {0}")]
    Publish(#[from] KafkaError),
    #[error("dead-letter publish was canceled before delivery")]
    Canceled,
}

impl DeadLetterError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeadLetterError::Serialization(_))
    }
}

/// The stage of the pipeline a bundle failed in.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

/// Outcome of a failed bundle. The caller decides what to do with it:
/// a retryable failure means the whole bundle must be redelivered.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("bundle failed and must be redelivered: {0}")]
    Retryable(#[source] StageError),
    #[error("bundle failed permanently: {0}")]
    Fatal(#[source] StageError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Retryable(_))
    }

    pub fn stage(&self) -> &'static str {
        let (PipelineError::Retryable(stage) | PipelineError::Fatal(stage)) = self;
        match stage {
            StageError::Sink(_) => "sink",
            StageError::DeadLetter(_) => "dead_letter",
        }
    }
}

impl From<SinkError> for PipelineError {
    fn from(error: SinkError) -> Self {
        if error.is_retryable() {
            PipelineError::Retryable(error.into())
        } else {
            PipelineError::Fatal(error.into())
        }
    }
}

impl From<DeadLetterError> for PipelineError {
    fn from(error: DeadLetterError) -> Self {
        if error.is_retryable() {
            PipelineError::Retryable(error.into())
        } else {
            PipelineError::Fatal(error.into())
        }
    }
}

/// Errors that stop the bundle consumer loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("a bundle failed with a non-retryable error: {0}")]
    Pipeline(#[from] PipelineError),
}
