//! Window-scoped, latest-wins deduplication.
//!
//! Deduplication only covers the records of one bundle. Uniqueness across
//! bundles and restarts comes from the sink's idempotency keys.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::event::{CanonicalEvent, KeyedEvent};

/// A record that can be deduplicated by business key and ordered by timestamp.
pub trait DedupRecord {
    fn dedup_key(&self) -> Option<&str>;
    fn timestamp(&self) -> Option<&str>;
}

impl DedupRecord for CanonicalEvent {
    fn dedup_key(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }
}

impl DedupRecord for KeyedEvent {
    fn dedup_key(&self) -> Option<&str> {
        self.event.dedup_key()
    }

    fn timestamp(&self) -> Option<&str> {
        DedupRecord::timestamp(&self.event)
    }
}

/// Total order over timestamp strings. RFC 3339 values compare by instant and
/// rank above anything unparseable, which falls back to string order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum TimestampRank<'a> {
    Missing,
    Unparsed(&'a str),
    Parsed(DateTime<Utc>),
}

fn rank(timestamp: Option<&str>) -> TimestampRank<'_> {
    match timestamp {
        None => TimestampRank::Missing,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => TimestampRank::Parsed(parsed.with_timezone(&Utc)),
            Err(_) => TimestampRank::Unparsed(raw),
        },
    }
}

/// Keep only the most recent event per event_id.
pub fn dedupe(events: Vec<CanonicalEvent>) -> Vec<CanonicalEvent> {
    dedupe_records(events)
}

/// Keep one record per key: the one with the latest timestamp, and on equal
/// timestamps the one seen last. Output follows the first appearance of each
/// key. Records without a key pass through untouched.
pub fn dedupe_records<R: DedupRecord>(records: Vec<R>) -> Vec<R> {
    let mut kept: Vec<R> = Vec::with_capacity(records.len());
    let mut groups: HashMap<String, usize> = HashMap::with_capacity(records.len());

    for record in records {
        let Some(key) = record.dedup_key() else {
            kept.push(record);
            continue;
        };

        match groups.get(key) {
            Some(&index) => {
                if rank(record.timestamp()) >= rank(kept[index].timestamp()) {
                    kept[index] = record;
                }
            }
            None => {
                groups.insert(key.to_owned(), kept.len());
                kept.push(record);
            }
        }
    }

    kept
}
