//! rdkafka-backed transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConsumedMessage, ConsumerClient, MessageCallback, ProducerClient, TopicAdmin};
use crate::config::KafkaSettings;
use crate::error::{TransportError, TransportResult};

fn base_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", settings.bootstrap_servers())
        .set("client.id", &settings.client_id)
        .set(
            "socket.timeout.ms",
            settings.request_timeout().as_millis().to_string(),
        );
    config
}

/// [`ProducerClient`] over an idempotent `FutureProducer`.
#[derive(Clone)]
pub struct KafkaProducerClient {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaProducerClient {
    pub fn new(settings: &KafkaSettings) -> TransportResult<Self> {
        let producer: FutureProducer = base_config(settings)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set(
                "message.timeout.ms",
                settings.delivery_timeout().as_millis().to_string(),
            )
            .create()?;

        Ok(Self {
            producer,
            delivery_timeout: settings.delivery_timeout(),
        })
    }

    async fn send(
        &self,
        record: FutureRecord<'_, str, str>,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let topic = record.topic.to_string();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            delivery = self.producer.send(record, self.delivery_timeout) => {
                let (partition, offset) = delivery.map_err(|(err, _)| TransportError::Kafka(err))?;
                debug!(topic = %topic, partition, offset, "Record delivered");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let record = FutureRecord::to(topic).key(key).payload(value);
        self.send(record, cancel).await
    }

    async fn produce_to_partition(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let record = FutureRecord::to(topic)
            .partition(partition)
            .key(key)
            .payload(value);
        self.send(record, cancel).await
    }
}

/// [`ConsumerClient`] over a `StreamConsumer` with manual async commits.
pub struct KafkaConsumerClient {
    consumer: StreamConsumer,
    receive_backoff: Duration,
}

impl KafkaConsumerClient {
    pub fn new(settings: &KafkaSettings) -> TransportResult<Self> {
        let consumer: StreamConsumer = base_config(settings)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        Ok(Self {
            consumer,
            receive_backoff: settings.receive_backoff(),
        })
    }

    /// Next record, or `None` once `cancel` fires.
    async fn next_record(
        &self,
        cancel: &CancellationToken,
    ) -> Option<KafkaResult<ConsumedMessage>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            received = self.consumer.recv() => Some(received.map(|msg| to_record(&msg))),
        }
    }

    fn commit(&self, record: &ConsumedMessage) -> KafkaResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&tpl, CommitMode::Async)
    }
}

fn to_record(msg: &BorrowedMessage<'_>) -> ConsumedMessage {
    let text = |bytes: Option<&[u8]>| {
        bytes
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    };

    ConsumedMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: text(msg.key()),
        value: text(msg.payload()),
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn consume_in_loop(
        &self,
        topics: &[String],
        on_message: &MessageCallback,
        cancel: CancellationToken,
    ) -> TransportResult<()> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)?;
        info!(topics = ?topics, "Kafka consumer subscribed");

        while let Some(received) = self.next_record(&cancel).await {
            let record = match received {
                Ok(record) => record,
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.receive_backoff) => continue,
                    }
                }
            };

            if let Err(e) = on_message(record.clone()).await {
                debug!(
                    topic = %record.topic,
                    offset = record.offset,
                    error = %e,
                    "Record handler returned error"
                );
            }

            if let Err(e) = self.commit(&record) {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to commit offset"
                );
            }
        }

        self.consumer.unsubscribe();
        info!("Kafka consumer stopped");
        Ok(())
    }
}

/// [`TopicAdmin`] over an rdkafka `AdminClient`.
#[derive(Clone)]
pub struct KafkaTopicAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
    partitions: i32,
    replication_factor: i32,
    request_timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(settings: &KafkaSettings) -> TransportResult<Self> {
        let admin: AdminClient<DefaultClientContext> = base_config(settings).create()?;

        Ok(Self {
            admin: Arc::new(admin),
            partitions: settings.partitions,
            replication_factor: settings.replication_factor,
            request_timeout: settings.request_timeout(),
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn topic_exists(&self, topic: &str) -> TransportResult<bool> {
        let admin = self.admin.clone();
        let topic = topic.to_string();
        let timeout = self.request_timeout;

        // fetch_metadata blocks the calling thread
        tokio::task::spawn_blocking(move || -> TransportResult<bool> {
            let metadata = admin.inner().fetch_metadata(None, timeout)?;
            Ok(metadata.topics().iter().any(|t| t.name() == topic))
        })
        .await
        .map_err(|e| TransportError::Other(anyhow::anyhow!("Failed to join metadata task: {}", e)))?
    }

    async fn create_topic(&self, topic: &str) -> TransportResult<()> {
        let new_topic = NewTopic::new(
            topic,
            self.partitions,
            TopicReplication::Fixed(self.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.request_timeout));

        let results = self.admin.create_topics(&[new_topic], &options).await?;

        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "Topic creation acknowledged"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(TransportError::TopicAlreadyExists(name))
                }
                Err((name, code)) => {
                    return Err(TransportError::CreateTopicFailed {
                        topic: name,
                        reason: code.to_string(),
                    })
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_build_without_broker() {
        // librdkafka connects lazily, so construction succeeds offline
        let settings = KafkaSettings::default();

        assert!(KafkaProducerClient::new(&settings).is_ok());
        assert!(KafkaConsumerClient::new(&settings).is_ok());
        assert!(KafkaTopicAdmin::new(&settings).is_ok());
    }

    #[tokio::test]
    #[ignore = "requires a running Kafka broker on localhost:9092"]
    async fn test_topic_roundtrip_against_broker() {
        let settings = KafkaSettings::default();
        let admin = KafkaTopicAdmin::new(&settings).unwrap();
        let topic = format!("kafka-ops-it-{}", std::process::id());

        crate::transport::ensure_topics(&admin, &[topic.clone()])
            .await
            .unwrap();

        assert!(admin.topic_exists(&topic).await.unwrap());
    }
}
