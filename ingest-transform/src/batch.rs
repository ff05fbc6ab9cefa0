use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::error::SinkError;
use crate::event::CanonicalEvent;
use crate::metrics_consts::{BATCH_DISCARDED, BATCH_FLUSHES, BATCH_FLUSH_FAILED, BATCH_SIZE};
use crate::sink::RowSink;

/// Events waiting to be written, with one idempotency key slot per event.
/// A `None` key means the sink should not deduplicate that row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    events: Vec<CanonicalEvent>,
    keys: Vec<Option<String>>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, event: CanonicalEvent, key: Option<String>) {
        self.events.push(event);
        self.keys.push(key);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[CanonicalEvent] {
        &self.events
    }

    pub fn keys(&self) -> &[Option<String>] {
        &self.keys
    }

    pub fn into_parts(self) -> (Vec<CanonicalEvent>, Vec<Option<String>>) {
        (self.events, self.keys)
    }
}

/// What a flush (or all flushes of a bundle) handed to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Rows submitted to the sink.
    pub submitted: usize,
    /// Rows the sink actually inserted, duplicates of already-written keys excluded.
    pub inserted: u64,
}

impl std::ops::AddAssign for FlushOutcome {
    fn add_assign(&mut self, other: Self) {
        self.submitted += other.submitted;
        self.inserted += other.inserted;
    }
}

/// Buffers events for one worker instance and writes them in bulk.
///
/// The buffer is owned by this instance only. It is flushed when it reaches
/// `batch_size`, and by `close` at the end of a bundle. A failed flush leaves
/// the buffer empty: recovery is redelivering the bundle, and the sink's
/// idempotency keys absorb rows that were already written.
pub struct BatchingSink {
    sink: Arc<dyn RowSink>,
    batch_size: usize,
    buffer: Batch,
    totals: FlushOutcome,
}

impl BatchingSink {
    pub fn open(sink: Arc<dyn RowSink>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            batch_size,
            buffer: Batch::with_capacity(batch_size),
            totals: FlushOutcome::default(),
        }
    }

    /// Buffer an event, flushing if the size threshold is reached.
    /// A missing or blank key defaults to the event_id.
    pub async fn accept(
        &mut self,
        event: CanonicalEvent,
        idempotency_key: Option<String>,
    ) -> Result<(), SinkError> {
        let key = idempotency_key
            .filter(|key| !key.is_empty())
            .or_else(|| event.event_id.clone());
        self.buffer.push(event, key);

        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }

        Ok(())
    }

    /// Write everything buffered in a single bulk call.
    pub async fn flush(&mut self) -> Result<FlushOutcome, SinkError> {
        if self.buffer.is_empty() {
            return Ok(FlushOutcome::default());
        }

        let batch = std::mem::replace(&mut self.buffer, Batch::with_capacity(self.batch_size));
        let submitted = batch.len();
        let start = Instant::now();

        match self.sink.bulk_insert(batch).await {
            Ok(inserted) => {
                metrics::counter!(BATCH_FLUSHES).increment(1);
                metrics::histogram!(BATCH_SIZE).record(submitted as f64);
                debug!(
                    submitted,
                    inserted,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "flushed batch"
                );

                let outcome = FlushOutcome {
                    submitted,
                    inserted,
                };
                self.totals += outcome;
                Ok(outcome)
            }
            Err(e) => {
                metrics::counter!(BATCH_FLUSH_FAILED, "retryable" => e.is_retryable().to_string())
                    .increment(1);
                error!(submitted, "failed to flush batch: {}", e);
                Err(e)
            }
        }
    }

    /// Flush the remainder at the end of a bundle and return what was written overall.
    pub async fn close(&mut self) -> Result<FlushOutcome, SinkError> {
        self.flush().await?;
        Ok(self.totals)
    }

    /// Drop anything still buffered, returning how many rows were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            warn!(dropped, "discarding buffered rows, bundle will be redelivered");
            metrics::counter!(BATCH_DISCARDED).increment(dropped as u64);
            self.buffer = Batch::with_capacity(self.batch_size);
        }
        dropped
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{event, MemorySink};

    #[tokio::test]
    async fn flushes_when_threshold_is_reached() {
        let sink = Arc::new(MemorySink::new());
        let mut batching = BatchingSink::open(sink.clone(), 2);

        batching.accept(event("a", "T1"), None).await.unwrap();
        assert_eq!(sink.calls(), 0);
        assert_eq!(batching.buffered(), 1);

        batching.accept(event("b", "T1"), None).await.unwrap();
        assert_eq!(sink.calls(), 1);
        assert_eq!(batching.buffered(), 0);

        batching.accept(event("c", "T1"), None).await.unwrap();
        let totals = batching.close().await.unwrap();
        assert_eq!(sink.calls(), 2);
        assert_eq!(
            totals,
            FlushOutcome {
                submitted: 3,
                inserted: 3
            }
        );
    }

    #[tokio::test]
    async fn keys_default_to_event_id() {
        let sink = Arc::new(MemorySink::new());
        let mut batching = BatchingSink::open(sink.clone(), 10);

        batching.accept(event("a", "T1"), None).await.unwrap();
        batching
            .accept(event("b", "T1"), Some("token-b".to_string()))
            .await
            .unwrap();
        batching
            .accept(event("c", "T1"), Some(String::new()))
            .await
            .unwrap();
        batching.close().await.unwrap();

        assert_eq!(
            sink.keys(),
            vec![
                Some("a".to_string()),
                Some("token-b".to_string()),
                Some("c".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn redelivered_rows_are_not_duplicated() {
        let sink = Arc::new(MemorySink::new());

        for _ in 0..2 {
            let mut batching = BatchingSink::open(sink.clone(), 10);
            batching
                .accept(event("a", "T1"), Some("k1".to_string()))
                .await
                .unwrap();
            batching.close().await.unwrap();
        }

        assert_eq!(sink.calls(), 2);
        assert_eq!(sink.rows().len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_leaves_buffer_empty() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(SinkError::Timeout(Duration::from_secs(5)));
        let mut batching = BatchingSink::open(sink.clone(), 10);

        batching.accept(event("a", "T1"), None).await.unwrap();
        batching.accept(event("b", "T1"), None).await.unwrap();

        let err = batching.close().await.expect_err("flush should fail");
        assert!(err.is_retryable());
        assert_eq!(batching.buffered(), 0);
        assert!(sink.rows().is_empty());

        // Nothing left to write, closing again is a no-op
        assert_eq!(batching.flush().await.unwrap(), FlushOutcome::default());
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn threshold_flush_failure_surfaces_from_accept() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(SinkError::Unavailable("connection refused".to_string()));
        let mut batching = BatchingSink::open(sink.clone(), 1);

        assert!(batching.accept(event("a", "T1"), None).await.is_err());
        assert_eq!(batching.buffered(), 0);
    }

    #[tokio::test]
    async fn discard_drops_buffered_rows() {
        let sink = Arc::new(MemorySink::new());
        let mut batching = BatchingSink::open(sink.clone(), 10);

        batching.accept(event("a", "T1"), None).await.unwrap();
        assert_eq!(batching.discard(), 1);
        assert_eq!(batching.close().await.unwrap(), FlushOutcome::default());
        assert_eq!(sink.calls(), 0);
    }
}
