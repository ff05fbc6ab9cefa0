//! Streaming ingestion transform.
//!
//! Raw event messages are read from Kafka in bundles, normalized into the
//! canonical event shape and validated. Invalid events go to a dead-letter
//! topic, valid ones are deduplicated per bundle and bulk-written to Postgres
//! under idempotency keys, so a redelivered bundle never produces duplicate rows.

pub mod api;
pub mod batch;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod dedup;
pub mod error;
pub mod event;
pub mod health;
pub mod kafka;
pub mod metrics_consts;
pub mod normalize;
pub mod pipeline;
pub mod serve_metrics;
pub mod sink;
pub mod test_utils;
pub mod validate;
