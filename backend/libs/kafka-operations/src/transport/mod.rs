//! Transport collaborators: producer, consumer and topic administration.
//!
//! The services in this crate only talk to these traits. [`memory`] provides
//! an in-process broker; the `kafka` feature adds rdkafka-backed clients.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::envelope::{OperationKind, OperationMessage};
use crate::error::{HandlerResult, TransportError, TransportResult};
use crate::handler::DispatchOutcome;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

/// A record received from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Record key, empty when the record has none
    pub key: String,
    /// Record value, empty when the record has none
    pub value: String,
}

/// Callback invoked by [`ConsumerClient::consume_in_loop`] for every record.
pub type MessageCallback =
    dyn Fn(ConsumedMessage) -> BoxFuture<'static, HandlerResult<DispatchOutcome>> + Send + Sync;

/// Sends records to topics.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Send `value` to `topic`; the partition is chosen by the transport.
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()>;

    /// Send `value` to a specific `partition` of `topic`.
    async fn produce_to_partition(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()>;
}

/// Receives records from a set of topics.
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Subscribe to `topics` and call `on_message` for every record until
    /// `cancel` fires.
    ///
    /// Callback errors are the caller's concern; they never end the loop.
    /// Returns `Err` only for fatal transport failures.
    async fn consume_in_loop(
        &self,
        topics: &[String],
        on_message: &MessageCallback,
        cancel: CancellationToken,
    ) -> TransportResult<()>;
}

/// Topic administration.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> TransportResult<bool>;

    /// Create `topic`. Fails with [`TransportError::TopicAlreadyExists`] if it
    /// is already there.
    async fn create_topic(&self, topic: &str) -> TransportResult<()>;
}

/// Make sure every topic in `topics` exists, creating the missing ones.
///
/// The existence check and the creation are separate calls, so another
/// instance may create the topic in between; an "already exists" answer to
/// the create call is treated as success.
pub async fn ensure_topics(admin: &dyn TopicAdmin, topics: &[String]) -> TransportResult<()> {
    for topic in topics {
        if admin.topic_exists(topic).await? {
            debug!(topic = %topic, "Topic already exists");
            continue;
        }

        match admin.create_topic(topic).await {
            Ok(()) => info!(topic = %topic, "Topic created"),
            Err(TransportError::TopicAlreadyExists(_)) => {
                debug!(topic = %topic, "Topic created concurrently by another instance")
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Encode an [`OperationMessage`] for `dto` and send it to `topic`.
pub async fn produce_operation<D: Serialize + Sync>(
    producer: &dyn ProducerClient,
    topic: &str,
    key: &str,
    operation: OperationKind,
    dto: &D,
    cancel: &CancellationToken,
) -> TransportResult<()> {
    let value = OperationMessage::new(operation, dto).encode().map_err(|e| {
        TransportError::Other(anyhow::Error::new(e).context("Failed to encode OperationMessage"))
    })?;

    producer.produce(topic, key, &value, cancel).await
}
