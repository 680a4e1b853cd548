//! In-process broker implementing every transport trait.
//!
//! Records are kept in a single append-only log in produce order. A consume
//! loop starts from the beginning of the log and only sees records of the
//! topics it subscribed to. Topics must be created before producing to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ConsumedMessage, ConsumerClient, MessageCallback, ProducerClient, TopicAdmin};
use crate::error::{TransportError, TransportResult};

#[derive(Default)]
struct BrokerState {
    topics: Vec<String>,
    log: Vec<ConsumedMessage>,
    offsets: HashMap<(String, i32), i64>,
    create_calls: usize,
    failure: Option<String>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    appended: Notify,
}

/// Cheaply cloneable handle to a shared in-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing topics in creation order.
    pub fn topics(&self) -> Vec<String> {
        self.inner.state.lock().topics.clone()
    }

    /// Every record produced so far, in produce order.
    pub fn produced(&self) -> Vec<ConsumedMessage> {
        self.inner.state.lock().log.clone()
    }

    /// Records produced to `topic`.
    pub fn produced_to(&self, topic: &str) -> Vec<ConsumedMessage> {
        self.inner
            .state
            .lock()
            .log
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of `create_topic` calls, including rejected ones.
    pub fn create_calls(&self) -> usize {
        self.inner.state.lock().create_calls
    }

    /// Make every running and future consume loop fail with
    /// [`TransportError::Closed`].
    pub fn fail_consumers(&self, reason: impl Into<String>) {
        self.inner.state.lock().failure = Some(reason.into());
        self.inner.appended.notify_waiters();
    }

    fn append(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        {
            let mut state = self.inner.state.lock();
            if !state.topics.iter().any(|t| t == topic) {
                return Err(TransportError::UnknownTopic(topic.to_string()));
            }

            let next = state
                .offsets
                .entry((topic.to_string(), partition))
                .or_insert(0);
            let offset = *next;
            *next += 1;

            state.log.push(ConsumedMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        self.inner.appended.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl ProducerClient for InMemoryBroker {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        self.append(topic, 0, key, value, cancel)
    }

    async fn produce_to_partition(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        self.append(topic, partition, key, value, cancel)
    }
}

#[async_trait]
impl ConsumerClient for InMemoryBroker {
    async fn consume_in_loop(
        &self,
        topics: &[String],
        on_message: &MessageCallback,
        cancel: CancellationToken,
    ) -> TransportResult<()> {
        let mut cursor = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            // Registered before reading the log so an append in between is not missed.
            let appended = self.inner.appended.notified();

            let next = {
                let state = self.inner.state.lock();
                if let Some(reason) = &state.failure {
                    return Err(TransportError::Closed(reason.clone()));
                }
                state.log.get(cursor).cloned()
            };

            match next {
                Some(record) => {
                    cursor += 1;
                    if !topics.contains(&record.topic) {
                        continue;
                    }
                    let offset = record.offset;
                    let topic = record.topic.clone();
                    if let Err(e) = on_message(record).await {
                        debug!(topic = %topic, offset, error = %e, "Record handler returned error");
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = appended => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn topic_exists(&self, topic: &str) -> TransportResult<bool> {
        Ok(self.inner.state.lock().topics.iter().any(|t| t == topic))
    }

    async fn create_topic(&self, topic: &str) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        state.create_calls += 1;
        if state.topics.iter().any(|t| t == topic) {
            return Err(TransportError::TopicAlreadyExists(topic.to_string()));
        }
        state.topics.push(topic.to_string());
        Ok(())
    }
}
