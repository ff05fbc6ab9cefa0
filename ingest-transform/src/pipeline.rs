use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::batch::BatchingSink;
use crate::dead_letter::{DeadLetterRouter, RouteOutcome};
use crate::dedup::dedupe_records;
use crate::error::PipelineError;
use crate::event::{KeyedEvent, RawMessage};
use crate::metrics_consts::{
    EVENTS_DEDUPLICATED, EVENTS_INVALID, MESSAGES_RECEIVED, MESSAGES_UNPARSEABLE,
};
use crate::normalize::normalize_message;
use crate::sink::RowSink;
use crate::validate::partition;

/// Counts for one processed bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BundleReport {
    pub received: usize,
    /// Dropped because the payload could not be parsed.
    pub unparseable: usize,
    pub invalid: usize,
    pub dead_lettered: usize,
    /// Invalid events dropped because no dead-letter channel is configured.
    pub dead_letter_dropped: usize,
    /// Events replaced by a later version of the same event_id in this bundle.
    pub duplicates: usize,
    pub submitted: usize,
    /// Rows actually written, redelivered rows excluded.
    pub inserted: u64,
}

/// The shared, cheaply clonable part of the pipeline: where rows and rejects go.
#[derive(Clone)]
pub struct TransformPipeline {
    sink: Arc<dyn RowSink>,
    dead_letter: DeadLetterRouter,
    batch_size: usize,
}

impl TransformPipeline {
    pub fn new(sink: Arc<dyn RowSink>, dead_letter: DeadLetterRouter, batch_size: usize) -> Self {
        Self {
            sink,
            dead_letter,
            batch_size,
        }
    }

    /// Start a worker for one bundle. Each worker owns its own sink buffer.
    pub fn open(&self) -> BundleWorker {
        BundleWorker {
            sink: BatchingSink::open(self.sink.clone(), self.batch_size),
            dead_letter: self.dead_letter.clone(),
            events: Vec::new(),
            report: BundleReport::default(),
        }
    }

    pub async fn process_bundle(
        &self,
        messages: impl IntoIterator<Item = RawMessage>,
    ) -> Result<BundleReport, PipelineError> {
        let mut worker = self.open();
        for message in messages {
            worker.process(&message);
        }
        worker.close().await
    }
}

/// Processes a single bundle: messages are parsed as they arrive, everything
/// else happens on `close`.
pub struct BundleWorker {
    sink: BatchingSink,
    dead_letter: DeadLetterRouter,
    events: Vec<KeyedEvent>,
    report: BundleReport,
}

impl BundleWorker {
    pub fn process(&mut self, message: &RawMessage) {
        self.report.received += 1;
        metrics::counter!(MESSAGES_RECEIVED).increment(1);

        match normalize_message(message) {
            Ok(keyed) => self.events.push(keyed),
            Err(e) => {
                self.report.unparseable += 1;
                metrics::counter!(MESSAGES_UNPARSEABLE).increment(1);
                warn!(position = ?message.position, "dropping unparseable message: {}", e);
            }
        }
    }

    /// Dead-letter the invalid events, then write the deduplicated valid ones.
    /// On failure nothing stays buffered and the whole bundle must be redelivered.
    pub async fn close(mut self) -> Result<BundleReport, PipelineError> {
        match self.finish().await {
            Ok(()) => {
                debug!(report = ?self.report, "bundle processed");
                Ok(self.report)
            }
            Err(e) => {
                self.sink.discard();
                Err(e)
            }
        }
    }

    async fn finish(&mut self) -> Result<(), PipelineError> {
        let (valid, invalid) = partition(std::mem::take(&mut self.events));

        self.report.invalid = invalid.len();
        metrics::counter!(EVENTS_INVALID).increment(invalid.len() as u64);
        let routed = join_all(invalid.iter().map(|record| self.dead_letter.route(record))).await;
        for outcome in routed {
            match outcome? {
                RouteOutcome::Published => self.report.dead_lettered += 1,
                RouteOutcome::Dropped => self.report.dead_letter_dropped += 1,
            }
        }

        let candidates = valid.len();
        let unique = dedupe_records(valid);
        self.report.duplicates = candidates - unique.len();
        metrics::counter!(EVENTS_DEDUPLICATED).increment(self.report.duplicates as u64);

        for keyed in unique {
            self.sink.accept(keyed.event, keyed.insert_id).await?;
        }

        let totals = self.sink.close().await?;
        self.report.submitted = totals.submitted;
        self.report.inserted = totals.inserted;

        Ok(())
    }
}
