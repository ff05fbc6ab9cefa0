use async_trait::async_trait;
use tracing::info;

use crate::batch::Batch;
use crate::error::SinkError;
use crate::sink::RowSink;

/// Logs rows instead of writing them, for local runs without a database.
pub struct PrintSink {}

#[async_trait]
impl RowSink for PrintSink {
    async fn bulk_insert(&self, batch: Batch) -> Result<u64, SinkError> {
        info!(rows = batch.len(), "printing batch");
        for (event, key) in batch.events().iter().zip(batch.keys()) {
            info!(insert_id = ?key, "row: {:?}", event);
        }

        Ok(batch.len() as u64)
    }
}
