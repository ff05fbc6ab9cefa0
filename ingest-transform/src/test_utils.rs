//! In-memory doubles for the sink and the dead-letter channel.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::batch::Batch;
use crate::dead_letter::DeadLetterPublisher;
use crate::error::{DeadLetterError, SinkError};
use crate::event::{CanonicalEvent, RawMessage};
use crate::sink::RowSink;
use crate::validate::InvalidEvent;

/// A canonical, valid event with the given id and timestamp.
pub fn event(event_id: &str, timestamp: &str) -> CanonicalEvent {
    CanonicalEvent {
        event_id: Some(event_id.to_string()),
        timestamp: Some(timestamp.to_string()),
        event_type: Some("purchase".to_string()),
        source_platform: Some("web".to_string()),
        ..Default::default()
    }
}

/// A raw bus message for a valid event.
pub fn message(event_id: &str, timestamp: &str) -> RawMessage {
    RawMessage::new(
        json!({
            "event_id": event_id,
            "timestamp": timestamp,
            "event_type": "purchase",
            "source_platform": "web",
        })
        .to_string(),
    )
}

enum InjectedFailure {
    /// Fail without writing anything.
    Before(SinkError),
    /// Write the batch, then report a failure, like a partial row-level error.
    After(SinkError),
}

#[derive(Default)]
struct MemoryTable {
    rows: Vec<CanonicalEvent>,
    keys: Vec<Option<String>>,
    seen: HashSet<String>,
    calls: usize,
}

/// A sink honoring idempotency keys, with failure injection.
#[derive(Default)]
pub struct MemorySink {
    table: Mutex<MemoryTable>,
    failures: Mutex<VecDeque<InjectedFailure>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next bulk write before anything is written.
    pub fn fail_next(&self, error: SinkError) {
        self.failures
            .lock()
            .unwrap()
            .push_back(InjectedFailure::Before(error));
    }

    /// Write the next batch but report it as failed.
    pub fn fail_next_after_write(&self, error: SinkError) {
        self.failures
            .lock()
            .unwrap()
            .push_back(InjectedFailure::After(error));
    }

    pub fn rows(&self) -> Vec<CanonicalEvent> {
        self.table.lock().unwrap().rows.clone()
    }

    pub fn keys(&self) -> Vec<Option<String>> {
        self.table.lock().unwrap().keys.clone()
    }

    pub fn calls(&self) -> usize {
        self.table.lock().unwrap().calls
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn bulk_insert(&self, batch: Batch) -> Result<u64, SinkError> {
        let failure = self.failures.lock().unwrap().pop_front();
        let mut table = self.table.lock().unwrap();
        table.calls += 1;

        let late_failure = match failure {
            Some(InjectedFailure::Before(error)) => return Err(error),
            Some(InjectedFailure::After(error)) => Some(error),
            None => None,
        };

        let mut inserted = 0;
        let (events, keys) = batch.into_parts();
        for (event, key) in events.into_iter().zip(keys) {
            if let Some(key) = &key {
                if !table.seen.insert(key.clone()) {
                    continue;
                }
            }
            table.rows.push(event);
            table.keys.push(key);
            inserted += 1;
        }

        match late_failure {
            Some(error) => Err(error),
            None => Ok(inserted),
        }
    }
}

/// Records every published dead-letter record, with failure injection.
#[derive(Default)]
pub struct RecordingDeadLetter {
    published: Mutex<Vec<InvalidEvent>>,
    failures: Mutex<usize>,
}

impl RecordingDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes.
    pub fn fail_next(&self, count: usize) {
        *self.failures.lock().unwrap() += count;
    }

    pub fn published(&self) -> Vec<InvalidEvent> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterPublisher for RecordingDeadLetter {
    async fn publish(&self, record: &InvalidEvent) -> Result<(), DeadLetterError> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(DeadLetterError::Canceled);
        }
        self.published.lock().unwrap().push(record.clone());
        Ok(())
    }
}
