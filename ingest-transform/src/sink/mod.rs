use async_trait::async_trait;

use crate::batch::Batch;
use crate::error::SinkError;

pub mod postgres;
pub mod print;

pub use postgres::PgSink;
pub use print::PrintSink;

/// The analytical store the pipeline writes to.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Write a whole batch in a single bulk call. Each row carries an optional
    /// idempotency key: re-submitting a row with a key the sink has already seen
    /// must be a silent no-op. Returns the number of rows actually inserted.
    async fn bulk_insert(&self, batch: Batch) -> Result<u64, SinkError>;
}
