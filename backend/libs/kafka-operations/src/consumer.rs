//! Consume loop: topic bootstrap, then one fresh handler per record.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, HandlerError, HandlerResult, ServiceResult};
use crate::handler::{DispatchOutcome, MessageHandlerFactory};
use crate::metrics::OperationMetrics;
use crate::transport::{ensure_topics, ConsumedMessage, ConsumerClient, TopicAdmin};

/// Drives a [`ConsumerClient`] and dispatches every record to a handler
/// created for it by a [`MessageHandlerFactory`].
///
/// Each dispatch runs on its own task. A failing or panicking handler is
/// logged and counted; it never ends the loop. Only fatal transport errors
/// and topic bootstrap failures end [`run`](Self::run) with an error.
pub struct ConsumerService {
    consumer: Arc<dyn ConsumerClient>,
    admin: Arc<dyn TopicAdmin>,
    factory: Arc<dyn MessageHandlerFactory>,
    topics: Vec<String>,
    metrics: Option<OperationMetrics>,
}

impl ConsumerService {
    pub fn new(
        consumer: Arc<dyn ConsumerClient>,
        admin: Arc<dyn TopicAdmin>,
        factory: Arc<dyn MessageHandlerFactory>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            consumer,
            admin,
            factory,
            topics,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OperationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Ensure the topics exist, then consume until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> ServiceResult<()> {
        ensure_topics(self.admin.as_ref(), &self.topics).await?;

        let factory = self.factory.clone();
        let metrics = self.metrics.clone();
        let dispatch_cancel = cancel.clone();
        let on_message =
            move |record: ConsumedMessage| -> BoxFuture<'static, HandlerResult<DispatchOutcome>> {
                dispatch(
                    factory.clone(),
                    metrics.clone(),
                    dispatch_cancel.clone(),
                    record,
                )
                .boxed()
            };

        info!(topics = ?self.topics, "Starting consume loop");

        match self
            .consumer
            .consume_in_loop(&self.topics, &on_message, cancel)
            .await
        {
            Ok(()) => {
                info!("Consume loop stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Consume loop terminated by transport error");
                Err(e.into())
            }
        }
    }

    /// Run the service on a background task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<ServiceResult<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

async fn dispatch(
    factory: Arc<dyn MessageHandlerFactory>,
    metrics: Option<OperationMetrics>,
    cancel: CancellationToken,
    record: ConsumedMessage,
) -> HandlerResult<DispatchOutcome> {
    let topic = record.topic.clone();
    let offset = record.offset;

    debug!(
        topic = %topic,
        partition = record.partition,
        offset,
        key = %record.key,
        "Record received"
    );

    let result = match factory.create(&topic) {
        Ok(handler) => {
            let task = tokio::spawn(async move {
                handler
                    .on_message_received(&record.key, &record.value, &cancel)
                    .await
            });

            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    let message = if join_error.is_panic() {
                        panic_message(&*join_error.into_panic())
                    } else {
                        join_error.to_string()
                    };
                    Err(HandlerError::Panicked {
                        topic: topic.clone(),
                        message,
                    })
                }
            }
        }
        Err(e) => Err(e),
    };

    let label = match &result {
        Ok(outcome) => {
            debug!(topic = %topic, offset, outcome = outcome.as_str(), "Record handled");
            outcome.as_str()
        }
        Err(e) => {
            let label = error_label(e);
            match e {
                HandlerError::Validation(_) => {
                    warn!(topic = %topic, offset, error = %e, "Record rejected")
                }
                _ => error!(topic = %topic, offset, error = %e, "Record handling failed"),
            }
            label
        }
    };

    if let Some(metrics) = &metrics {
        metrics.record_message(&topic, label);
    }

    result
}

fn error_label(error: &HandlerError) -> &'static str {
    match error {
        HandlerError::Validation(_) => "invalid",
        HandlerError::Mapping(_) | HandlerError::Operation { .. } => "failed",
        HandlerError::UnknownTopic(_) => "unknown_topic",
        HandlerError::Panicked { .. } => "panicked",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::OperationKind;
    use crate::error::{ServiceError, TransportError, TransportResult};
    use crate::handler::testing::RecordingHandler;
    use crate::handler::{MessageHandler, OperationMessageHandler, TopicHandlerRegistry};
    use crate::transport::memory::InMemoryBroker;
    use crate::transport::ProducerClient;
    use async_trait::async_trait;
    use prometheus::Registry;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct UserDto {
        id: u32,
    }

    struct PanickingHandler;

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        async fn on_message_received(
            &self,
            _key: &str,
            message: &str,
            _cancel: &CancellationToken,
        ) -> HandlerResult<DispatchOutcome> {
            panic!("handler blew up on {}", message);
        }
    }

    struct BrokenAdmin;

    #[async_trait]
    impl TopicAdmin for BrokenAdmin {
        async fn topic_exists(&self, _topic: &str) -> TransportResult<bool> {
            Err(TransportError::Closed("admin unreachable".to_string()))
        }

        async fn create_topic(&self, _topic: &str) -> TransportResult<()> {
            unreachable!()
        }
    }

    fn service(
        broker: &InMemoryBroker,
        registry: TopicHandlerRegistry,
        topics: &[&str],
        metrics: &OperationMetrics,
    ) -> Arc<ConsumerService> {
        Arc::new(
            ConsumerService::new(
                Arc::new(broker.clone()),
                Arc::new(broker.clone()),
                Arc::new(registry),
                topics.iter().map(|t| t.to_string()).collect(),
            )
            .with_metrics(metrics.clone()),
        )
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_dispatches_valid_records_and_survives_bad_ones() {
        let broker = InMemoryBroker::new();
        let recorder = RecordingHandler::<UserDto>::new();
        let registry = TopicHandlerRegistry::new().register("users", {
            let recorder = recorder.clone();
            move || OperationMessageHandler::new(recorder.clone())
        });
        let metrics = OperationMetrics::with_registry(&Registry::new());
        let service = service(&broker, registry, &["users"], &metrics);

        let cancel = CancellationToken::new();
        let running = service.clone().spawn(cancel.clone());
        wait_until(|| broker.topics() == vec!["users"]).await;

        let none = CancellationToken::new();
        for value in [
            r#"{"operation":"Insert","dto":{"id":1}}"#,
            "   ",
            "{broken",
            r#"{"operation":"Upsert","dto":{"id":2}}"#,
            r#"{"operation":"Delete","dto":{"id":3}}"#,
        ] {
            broker.produce("users", "k", value, &none).await.unwrap();
        }

        wait_until(|| metrics.messages_total("users", "executed") == 2).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(
            recorder.calls(),
            vec![
                (OperationKind::Insert, UserDto { id: 1 }),
                (OperationKind::Delete, UserDto { id: 3 })
            ]
        );
        assert_eq!(metrics.messages_total("users", "discarded_blank"), 1);
        assert_eq!(metrics.messages_total("users", "discarded_malformed"), 1);
        assert_eq!(metrics.messages_total("users", "invalid"), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_loop() {
        let broker = InMemoryBroker::new();
        let recorder = RecordingHandler::<UserDto>::new();
        let registry = TopicHandlerRegistry::new()
            .register("audit", || PanickingHandler)
            .register("users", {
                let recorder = recorder.clone();
                move || OperationMessageHandler::new(recorder.clone())
            });
        let metrics = OperationMetrics::with_registry(&Registry::new());
        let service = service(&broker, registry, &["audit", "users"], &metrics);

        let cancel = CancellationToken::new();
        let running = service.clone().spawn(cancel.clone());
        wait_until(|| broker.topics().len() == 2).await;

        let none = CancellationToken::new();
        broker.produce("audit", "a", "boom", &none).await.unwrap();
        broker
            .produce("users", "u", r#"{"operation":"Update","dto":{"id":7}}"#, &none)
            .await
            .unwrap();

        wait_until(|| recorder.calls().len() == 1).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(metrics.messages_total("audit", "panicked"), 1);
        assert_eq!(metrics.messages_total("users", "executed"), 1);
    }

    #[tokio::test]
    async fn test_unregistered_topic_is_counted_and_skipped() {
        let broker = InMemoryBroker::new();
        let metrics = OperationMetrics::with_registry(&Registry::new());
        let service = service(&broker, TopicHandlerRegistry::new(), &["orphans"], &metrics);

        let cancel = CancellationToken::new();
        let running = service.clone().spawn(cancel.clone());
        wait_until(|| broker.topics() == vec!["orphans"]).await;

        broker
            .produce("orphans", "k", "{}", &CancellationToken::new())
            .await
            .unwrap();

        wait_until(|| metrics.messages_total("orphans", "unknown_topic") == 1).await;
        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_operation_failure_is_counted() {
        let broker = InMemoryBroker::new();
        let registry = TopicHandlerRegistry::new().register("users", || {
            OperationMessageHandler::new(RecordingHandler::<UserDto>::failing("db down"))
        });
        let metrics = OperationMetrics::with_registry(&Registry::new());
        let service = service(&broker, registry, &["users"], &metrics);

        let cancel = CancellationToken::new();
        let running = service.clone().spawn(cancel.clone());
        wait_until(|| broker.topics() == vec!["users"]).await;

        broker
            .produce(
                "users",
                "k",
                r#"{"operation":"Insert","dto":{"id":1}}"#,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        wait_until(|| metrics.messages_total("users", "failed") == 1).await;
        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_transport_error_ends_run() {
        let broker = InMemoryBroker::new();
        let metrics = OperationMetrics::with_registry(&Registry::new());
        let service = service(&broker, TopicHandlerRegistry::new(), &["users"], &metrics);
        broker.fail_consumers("connection lost");

        let result = service.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(ServiceError::Transport(TransportError::Closed(_)))
        ));
    }

    #[tokio::test]
    async fn test_topic_bootstrap_failure_ends_run() {
        let broker = InMemoryBroker::new();
        let service = ConsumerService::new(
            Arc::new(broker.clone()),
            Arc::new(BrokenAdmin),
            Arc::new(TopicHandlerRegistry::new()),
            vec!["users".to_string()],
        );

        let result = service.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(ServiceError::Transport(_))));
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_records_stops_cleanly() {
        let broker = InMemoryBroker::new();
        let metrics = OperationMetrics::with_registry(&Registry::new());
        let service = service(&broker, TopicHandlerRegistry::new(), &["users"], &metrics);
        let cancel = CancellationToken::new();
        cancel.cancel();

        service.run(cancel).await.unwrap();

        assert_eq!(service.topics(), ["users".to_string()]);
    }
}
