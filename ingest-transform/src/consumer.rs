use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rdkafka::consumer::{
    CommitMode, Consumer, DefaultConsumerContext, MessageStream, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::ConsumerError;
use crate::event::{MessagePosition, RawMessage};
use crate::health::HealthHandle;
use crate::kafka::create_kafka_consumer;
use crate::metrics_consts::{
    BUNDLES_COMPLETED, BUNDLES_FAILED, BUNDLES_REDELIVERED, BUNDLE_PROCESSING_TIME, BUNDLE_SIZE,
    CONSUMER_RECV_ERROR,
};
use crate::pipeline::TransformPipeline;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct BundleSettings {
    pub bundle_size: usize,
    pub bundle_timeout: Duration,
    pub redelivery_backoff: Duration,
}

/// Reads the source topic in bundles and runs each one through the pipeline.
///
/// Offsets are committed only after a bundle has been fully written. When a
/// bundle fails with a retryable error, every partition it touched is rewound
/// to the first offset of the bundle, so the same messages are read again.
pub struct BundleConsumer {
    consumer: StreamConsumer,
    topic: String,
    pipeline: TransformPipeline,
    settings: BundleSettings,
    liveness: HealthHandle,
}

impl BundleConsumer {
    pub fn new(
        kafka: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        pipeline: TransformPipeline,
        settings: BundleSettings,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let consumer = create_kafka_consumer(kafka, consumer_config)?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            consumer,
            topic: consumer_config.kafka_consumer_topic.clone(),
            pipeline,
            settings,
            liveness,
        })
    }

    /// Consume until `shutdown` fires. The bundle in progress is finished first.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<(), ConsumerError> {
        info!(topic = %self.topic, "starting bundle consumption");
        let mut stream = self.consumer.stream();

        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                info!("shutdown signal received, stopping bundle consumption");
                break;
            }
            self.liveness.report_healthy();

            let bundle = collect_bundle(
                &mut stream,
                self.settings.bundle_size,
                self.settings.bundle_timeout,
            )
            .await?;
            if bundle.is_empty() {
                continue;
            }

            self.handle_bundle(bundle).await?;
        }

        Ok(())
    }

    async fn handle_bundle(&self, bundle: Vec<RawMessage>) -> Result<(), ConsumerError> {
        let offsets = BundleOffsets::from_messages(&bundle);
        let size = bundle.len();
        metrics::histogram!(BUNDLE_SIZE).record(size as f64);

        let start = Instant::now();
        let result = self.pipeline.process_bundle(bundle).await;
        metrics::histogram!(BUNDLE_PROCESSING_TIME).record(start.elapsed().as_millis() as f64);

        match result {
            Ok(report) => {
                metrics::counter!(BUNDLES_COMPLETED).increment(1);
                debug!(?report, "bundle completed");
                self.commit(&offsets);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                metrics::counter!(BUNDLES_REDELIVERED, "stage" => e.stage()).increment(1);
                warn!(size, "bundle failed, redelivering: {}", e);
                self.rewind(&offsets)?;
                tokio::time::sleep(self.settings.redelivery_backoff).await;
                Ok(())
            }
            Err(e) => {
                metrics::counter!(BUNDLES_FAILED, "stage" => e.stage()).increment(1);
                error!(size, "bundle failed permanently: {}", e);
                Err(e.into())
            }
        }
    }

    fn commit(&self, offsets: &BundleOffsets) {
        let list = match offsets.commit_list(&self.topic) {
            Ok(list) => list,
            Err(e) => {
                error!("failed to build offset list: {}", e);
                return;
            }
        };

        // A failed commit is covered by the next one, at worst the bundle is read twice
        if let Err(e) = self.consumer.commit(&list, CommitMode::Async) {
            warn!("failed to commit bundle offsets: {}", e);
        }
    }

    /// A failed seek is returned as an error: continuing would let a later
    /// commit skip past the failed messages.
    fn rewind(&self, offsets: &BundleOffsets) -> Result<(), KafkaError> {
        for (partition, offset) in offsets.first_offsets() {
            self.consumer
                .seek(&self.topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
        }
        Ok(())
    }
}

/// Collect up to `size` messages, or whatever arrived before `timeout`.
async fn collect_bundle(
    stream: &mut MessageStream<'_, DefaultConsumerContext>,
    size: usize,
    timeout: Duration,
) -> Result<Vec<RawMessage>, KafkaError> {
    let mut bundle = Vec::with_capacity(size);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while bundle.len() < size {
        tokio::select! {
            _ = &mut deadline => break,
            next = stream.next() => match next {
                Some(Ok(message)) => bundle.push(to_raw_message(&message)),
                Some(Err(KafkaError::MessageConsumptionFatal(code))) => {
                    metrics::counter!(CONSUMER_RECV_ERROR, "level" => "fatal").increment(1);
                    error!("fatal Kafka consumer error: {:?}", code);
                    return Err(KafkaError::MessageConsumptionFatal(code));
                }
                Some(Err(e)) => {
                    metrics::counter!(CONSUMER_RECV_ERROR, "level" => "warn").increment(1);
                    warn!("Kafka consumer error: {}", e);
                }
                None => break,
            }
        }
    }

    Ok(bundle)
}

/// Headers become transport attributes. Non UTF-8 header values are skipped.
pub fn to_raw_message<M: Message>(message: &M) -> RawMessage {
    let mut raw = RawMessage::new(message.payload().unwrap_or_default());
    raw.position = Some(MessagePosition {
        partition: message.partition(),
        offset: message.offset(),
    });

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            match header.value.map(std::str::from_utf8) {
                Some(Ok(value)) => {
                    raw.attributes.insert(header.key.to_owned(), value.to_owned());
                }
                _ => debug!(key = header.key, "skipping header without a UTF-8 value"),
            }
        }
    }

    raw
}

/// First and last offset read from each partition in a bundle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BundleOffsets {
    ranges: BTreeMap<i32, (i64, i64)>,
}

impl BundleOffsets {
    pub fn from_messages(messages: &[RawMessage]) -> Self {
        let mut ranges: BTreeMap<i32, (i64, i64)> = BTreeMap::new();
        for position in messages.iter().filter_map(|m| m.position) {
            ranges
                .entry(position.partition)
                .and_modify(|(first, last)| {
                    *first = (*first).min(position.offset);
                    *last = (*last).max(position.offset);
                })
                .or_insert((position.offset, position.offset));
        }
        Self { ranges }
    }

    /// Where each partition must be rewound to for the bundle to be read again.
    pub fn first_offsets(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.ranges
            .iter()
            .map(|(partition, (first, _))| (*partition, *first))
    }

    /// The committed offset is the next one to read, one past the last processed.
    pub fn next_offsets(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.ranges
            .iter()
            .map(|(partition, (_, last))| (*partition, *last + 1))
    }

    pub fn commit_list(&self, topic: &str) -> Result<TopicPartitionList, KafkaError> {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in self.next_offsets() {
            list.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        }
        Ok(list)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage, Timestamp};

    use super::*;
    use crate::event::INSERT_ID_ATTRIBUTE;
    use crate::test_utils::message;

    #[test]
    fn offsets_track_each_partition() {
        let bundle = vec![
            message("a", "T1").at(0, 12),
            message("b", "T1").at(1, 3),
            message("c", "T1").at(0, 10),
            message("d", "T1").at(0, 11),
            message("e", "T1"),
        ];
        let offsets = BundleOffsets::from_messages(&bundle);

        assert_eq!(
            offsets.first_offsets().collect::<Vec<_>>(),
            vec![(0, 10), (1, 3)]
        );
        assert_eq!(
            offsets.next_offsets().collect::<Vec<_>>(),
            vec![(0, 13), (1, 4)]
        );
    }

    #[test]
    fn commit_list_points_past_the_bundle() {
        let bundle = vec![message("a", "T1").at(2, 41), message("b", "T1").at(2, 42)];
        let list = BundleOffsets::from_messages(&bundle)
            .commit_list("raw-events")
            .unwrap();

        let element = list.find_partition("raw-events", 2).unwrap();
        assert_eq!(element.offset(), Offset::Offset(43));
        assert_eq!(list.count(), 1);
    }

    #[test]
    fn messages_without_position_have_no_offsets() {
        let offsets = BundleOffsets::from_messages(&[message("a", "T1")]);
        assert!(offsets.is_empty());
    }

    #[test]
    fn headers_become_attributes() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: INSERT_ID_ATTRIBUTE,
                value: Some("tok-1"),
            })
            .insert(Header {
                key: "binary",
                value: Some(&[0xffu8, 0xfe][..]),
            });
        let kafka_message = OwnedMessage::new(
            Some(br#"{"event_id": "a"}"#.to_vec()),
            None,
            "raw-events".to_string(),
            Timestamp::NotAvailable,
            3,
            7,
            Some(headers),
        );

        let raw = to_raw_message(&kafka_message);

        assert_eq!(raw.payload, br#"{"event_id": "a"}"#.to_vec());
        assert_eq!(raw.insert_id(), Some("tok-1"));
        assert!(!raw.attributes.contains_key("binary"));
        assert_eq!(
            raw.position,
            Some(MessagePosition {
                partition: 3,
                offset: 7
            })
        );
    }

    #[test]
    fn missing_payload_is_empty() {
        let kafka_message = OwnedMessage::new(
            None,
            None,
            "raw-events".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            None,
        );
        assert!(to_raw_message(&kafka_message).payload.is_empty());
    }
}
