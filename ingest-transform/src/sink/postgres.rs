use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::batch::Batch;
use crate::error::SinkError;
use crate::metrics_consts::{SINK_ROWS_INSERTED, SINK_ROWS_SKIPPED, SINK_WRITE_TIME};
use crate::sink::RowSink;

/// Rows are keyed on `insert_id`, a conflicting key is skipped rather than rewritten.
/// Rows without a key never conflict.
const INSERT_EVENTS: &str = r#"
    INSERT INTO standard_events (
        insert_id, event_id, user_anonymous_id, user_id, "timestamp", event_type,
        source_platform, marketing_channel, campaign_id, revenue_usd, properties)
        (SELECT * FROM UNNEST(
            $1::text[],
            $2::text[],
            $3::text[],
            $4::text[],
            $5::text[],
            $6::text[],
            $7::text[],
            $8::text[],
            $9::text[],
            $10::float8[],
            $11::text[]))
    ON CONFLICT (insert_id) DO NOTHING"#;

/// Bulk-inserts batches into the `standard_events` table.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
    write_timeout: Duration,
}

impl PgSink {
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        write_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(write_timeout)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to sink database");

        Ok(Self::from_pool(pool, write_timeout))
    }

    pub fn from_pool(pool: PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }
}

/// Column-major view of a batch, one array per UNNEST parameter.
#[derive(Default)]
struct Columns {
    insert_ids: Vec<Option<String>>,
    event_ids: Vec<Option<String>>,
    user_anonymous_ids: Vec<Option<String>>,
    user_ids: Vec<Option<String>>,
    timestamps: Vec<Option<String>>,
    event_types: Vec<Option<String>>,
    source_platforms: Vec<Option<String>>,
    marketing_channels: Vec<Option<String>>,
    campaign_ids: Vec<Option<String>>,
    revenues: Vec<Option<f64>>,
    properties: Vec<Option<String>>,
}

impl From<Batch> for Columns {
    fn from(batch: Batch) -> Self {
        let (events, keys) = batch.into_parts();
        let mut columns = Columns {
            insert_ids: keys,
            ..Default::default()
        };

        for event in events {
            columns.event_ids.push(event.event_id);
            columns.user_anonymous_ids.push(event.user_anonymous_id);
            columns.user_ids.push(event.user_id);
            columns.timestamps.push(event.timestamp);
            columns.event_types.push(event.event_type);
            columns.source_platforms.push(event.source_platform);
            columns.marketing_channels.push(event.marketing_channel);
            columns.campaign_ids.push(event.campaign_id);
            columns.revenues.push(event.revenue_usd);
            columns.properties.push(event.properties);
        }

        columns
    }
}

#[async_trait]
impl RowSink for PgSink {
    async fn bulk_insert(&self, batch: Batch) -> Result<u64, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let rows = batch.len();
        let columns = Columns::from(batch);
        let start = Instant::now();

        let write = sqlx::query(INSERT_EVENTS)
            .bind(&columns.insert_ids)
            .bind(&columns.event_ids)
            .bind(&columns.user_anonymous_ids)
            .bind(&columns.user_ids)
            .bind(&columns.timestamps)
            .bind(&columns.event_types)
            .bind(&columns.source_platforms)
            .bind(&columns.marketing_channels)
            .bind(&columns.campaign_ids)
            .bind(&columns.revenues)
            .bind(&columns.properties)
            .execute(&self.pool);

        let result = match tokio::time::timeout(self.write_timeout, write).await {
            Err(_) => return Err(SinkError::Timeout(self.write_timeout)),
            Ok(result) => result.map_err(|e| classify_error(e, rows))?,
        };

        metrics::histogram!(SINK_WRITE_TIME).record(start.elapsed().as_millis() as f64);

        let inserted = result.rows_affected();
        let skipped = (rows as u64).saturating_sub(inserted);
        metrics::counter!(SINK_ROWS_INSERTED).increment(inserted);
        metrics::counter!(SINK_ROWS_SKIPPED).increment(skipped);
        if skipped > 0 {
            info!(rows, skipped, "sink skipped rows with already-written idempotency keys");
        }

        Ok(inserted)
    }
}

/// Decide whether a failed write can succeed on redelivery.
/// Data and constraint errors (classes 22 and 23) are row-level rejections and
/// go back through redelivery like any transient failure. Schema, syntax and
/// auth errors (classes 42 and 28) will fail the same way every time.
fn classify_error(error: sqlx::Error, rows: usize) -> SinkError {
    let code = match &error {
        sqlx::Error::Database(db_error) => db_error.code().map(|c| c.into_owned()),
        sqlx::Error::Configuration(_) => return SinkError::Misconfigured(error.to_string()),
        _ => None,
    };

    match code.as_deref().and_then(|c| c.get(..2)) {
        Some("22") | Some("23") => {
            warn!(rows, "sink rejected rows: {}", error);
            SinkError::RowsRejected {
                rows,
                reason: error.to_string(),
            }
        }
        Some("42") | Some("28") => SinkError::Misconfigured(error.to_string()),
        _ => SinkError::Unavailable(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::event;

    #[test]
    fn batch_becomes_parallel_columns() {
        let mut batch = Batch::with_capacity(2);
        let mut first = event("a", "2025-01-01T00:00:00Z");
        first.revenue_usd = Some(9.5);
        batch.push(first, Some("tok-a".to_string()));
        batch.push(event("b", "2025-01-02T00:00:00Z"), None);

        let columns = Columns::from(batch);

        assert_eq!(columns.insert_ids, vec![Some("tok-a".to_string()), None]);
        assert_eq!(
            columns.event_ids,
            vec![Some("a".to_string()), Some("b".to_string())]
        );
        assert_eq!(columns.revenues, vec![Some(9.5), None]);
        assert_eq!(columns.properties, vec![None, None]);
    }

    #[test]
    fn connection_problems_are_retryable() {
        let err = classify_error(sqlx::Error::PoolTimedOut, 3);
        assert!(matches!(err, SinkError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn bad_configuration_is_fatal() {
        let err = classify_error(sqlx::Error::Configuration("invalid port".into()), 3);
        assert!(matches!(err, SinkError::Misconfigured(_)));
        assert!(!err.is_retryable());
    }
}
