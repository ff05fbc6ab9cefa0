use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, error, warn};

use crate::error::DeadLetterError;
use crate::kafka::KafkaContext;
use crate::metrics_consts::{DEAD_LETTER_DROPPED, DEAD_LETTER_FAILED, DEAD_LETTER_PUBLISHED};
use crate::validate::InvalidEvent;

/// Header listing the required fields a dead-lettered record was missing.
pub const MISSING_FIELDS_HEADER: &str = "missing_fields";

/// A channel that accepts records the pipeline could not write.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish one record, returning once the channel has acknowledged it.
    async fn publish(&self, record: &InvalidEvent) -> Result<(), DeadLetterError>;
}

pub struct KafkaDeadLetter {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetter {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl DeadLetterPublisher for KafkaDeadLetter {
    async fn publish(&self, record: &InvalidEvent) -> Result<(), DeadLetterError> {
        // The record goes out exactly as it was normalized, in the same shape as a sink row
        let payload = serde_json::to_string(&record.event)?;
        let missing = record.missing.join(",");
        let headers = OwnedHeaders::new().insert(Header {
            key: MISSING_FIELDS_HEADER,
            value: Some(&missing),
        });

        let delivery = self
            .producer
            .send_result(FutureRecord {
                topic: &self.topic,
                key: record.event.event_id.as_deref(),
                payload: Some(&payload),
                timestamp: None,
                partition: None,
                headers: Some(headers),
            })
            .map_err(|(e, _)| DeadLetterError::Publish(e))?;

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(DeadLetterError::Publish(e)),
            Err(_) => Err(DeadLetterError::Canceled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Published,
    /// No dead-letter channel is configured, the record was logged and dropped.
    Dropped,
}

/// Sends invalid records to the dead-letter channel, if there is one.
///
/// Publishing is not retried here: a failure fails the bundle, which is then
/// redelivered as a whole.
#[derive(Clone)]
pub struct DeadLetterRouter {
    publisher: Option<Arc<dyn DeadLetterPublisher>>,
}

impl DeadLetterRouter {
    pub fn new(publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        Self {
            publisher: Some(publisher),
        }
    }

    pub fn disabled() -> Self {
        Self { publisher: None }
    }

    pub async fn route(&self, record: &InvalidEvent) -> Result<RouteOutcome, DeadLetterError> {
        let Some(publisher) = &self.publisher else {
            warn!(
                event_id = record.event.event_id.as_deref().unwrap_or_default(),
                missing = ?record.missing,
                "no dead-letter topic configured, dropping invalid event"
            );
            metrics::counter!(DEAD_LETTER_DROPPED).increment(1);
            return Ok(RouteOutcome::Dropped);
        };

        match publisher.publish(record).await {
            Ok(()) => {
                metrics::counter!(DEAD_LETTER_PUBLISHED).increment(1);
                debug!(
                    event_id = record.event.event_id.as_deref().unwrap_or_default(),
                    "dead-lettered invalid event"
                );
                Ok(RouteOutcome::Published)
            }
            Err(e) => {
                metrics::counter!(DEAD_LETTER_FAILED).increment(1);
                error!("failed to dead-letter invalid event: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::mocking::MockCluster;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};

    use super::*;
    use crate::config::KafkaConfig;
    use crate::health::HealthRegistry;
    use crate::kafka::create_kafka_producer;
    use crate::test_utils::{event, RecordingDeadLetter};

    fn invalid(event_id: &str) -> InvalidEvent {
        let mut event = event(event_id, "2025-01-01T00:00:00Z");
        event.event_type = None;
        InvalidEvent {
            event,
            missing: vec!["event_type"],
        }
    }

    #[tokio::test]
    async fn disabled_router_drops() {
        let router = DeadLetterRouter::disabled();
        let outcome = router.route(&invalid("b")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Dropped);
    }

    #[tokio::test]
    async fn publishes_record_unmodified() {
        let publisher = Arc::new(RecordingDeadLetter::new());
        let router = DeadLetterRouter::new(publisher.clone());

        let record = invalid("b");
        let outcome = router.route(&record).await.unwrap();

        assert_eq!(outcome, RouteOutcome::Published);
        assert_eq!(publisher.published(), vec![record]);
    }

    #[tokio::test]
    async fn publish_failures_are_surfaced_once() {
        let publisher = Arc::new(RecordingDeadLetter::new());
        publisher.fail_next(1);
        let router = DeadLetterRouter::new(publisher.clone());

        let err = router.route(&invalid("b")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(publisher.published().is_empty());

        // No internal retries: the next call is a fresh attempt
        router.route(&invalid("b")).await.unwrap();
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn kafka_dead_letter_error_handling() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("dead_letter_producer", time::Duration::seconds(30));
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
        };
        let producer = create_kafka_producer(&config, handle)
            .await
            .expect("failed to create mocked kafka producer");
        let dead_letter = KafkaDeadLetter::new(producer, "events-dlq");
        let record = invalid("b");

        // Wait for producer to be healthy, to keep kafka_message_timeout_ms short and tests faster
        for _ in 0..20 {
            if dead_letter.publish(&record).await.is_ok() {
                break;
            }
        }

        dead_letter
            .publish(&record)
            .await
            .expect("failed to publish dead-letter record");

        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match dead_letter.publish(&record).await {
            Err(e @ DeadLetterError::Publish(_)) => assert!(e.is_retryable()),
            Err(err) => panic!("wrong error: {}", err),
            Ok(()) => panic!("should have errored"),
        };
    }
}
