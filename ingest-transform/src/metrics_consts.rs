pub const MESSAGES_RECEIVED: &str = "ingest_transform_messages_received";
pub const MESSAGES_UNPARSEABLE: &str = "ingest_transform_messages_unparseable";
pub const EVENTS_INVALID: &str = "ingest_transform_events_invalid";
pub const EVENTS_DEDUPLICATED: &str = "ingest_transform_events_deduplicated";
pub const DEAD_LETTER_PUBLISHED: &str = "ingest_transform_dead_letter_published";
pub const DEAD_LETTER_DROPPED: &str = "ingest_transform_dead_letter_dropped";
pub const DEAD_LETTER_FAILED: &str = "ingest_transform_dead_letter_failed";
pub const BATCH_FLUSHES: &str = "ingest_transform_batch_flushes";
pub const BATCH_FLUSH_FAILED: &str = "ingest_transform_batch_flush_failed";
pub const BATCH_SIZE: &str = "ingest_transform_batch_size";
pub const BATCH_DISCARDED: &str = "ingest_transform_batch_discarded_rows";
pub const SINK_WRITE_TIME: &str = "ingest_transform_sink_write_time_ms";
pub const SINK_ROWS_INSERTED: &str = "ingest_transform_sink_rows_inserted";
pub const SINK_ROWS_SKIPPED: &str = "ingest_transform_sink_rows_skipped";
pub const BUNDLE_SIZE: &str = "ingest_transform_bundle_size";
pub const BUNDLE_PROCESSING_TIME: &str = "ingest_transform_bundle_processing_time_ms";
pub const BUNDLES_COMPLETED: &str = "ingest_transform_bundles_completed";
pub const BUNDLES_REDELIVERED: &str = "ingest_transform_bundles_redelivered";
pub const BUNDLES_FAILED: &str = "ingest_transform_bundles_failed";
pub const CONSUMER_RECV_ERROR: &str = "ingest_transform_consumer_recv_error";
pub const PUSH_REQUESTS: &str = "ingest_transform_push_requests";
