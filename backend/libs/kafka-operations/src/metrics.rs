use prometheus::{IntCounterVec, Opts, Registry};
use tracing::warn;

/// Counters for consumed records and producer cycles.
#[derive(Clone)]
pub struct OperationMetrics {
    pub messages: IntCounterVec,
    pub producer_cycles: IntCounterVec,
}

impl OperationMetrics {
    /// Metrics registered on the process-wide default registry.
    pub fn new() -> Self {
        Self::with_registry(prometheus::default_registry())
    }

    /// Metrics registered on `registry`.
    ///
    /// Registration failures (usually a second instance on the same registry)
    /// are logged; the returned counters still work but are not exported.
    pub fn with_registry(registry: &Registry) -> Self {
        let messages = IntCounterVec::new(
            Opts::new(
                "kafka_ops_messages_total",
                "Records handled by the consumer, by topic and outcome",
            ),
            &["topic", "outcome"],
        )
        .expect("valid metric opts for kafka_ops_messages_total");

        let producer_cycles = IntCounterVec::new(
            Opts::new(
                "kafka_ops_producer_cycles_total",
                "Producer operation cycles, by service and outcome",
            ),
            &["service", "outcome"],
        )
        .expect("valid metric opts for kafka_ops_producer_cycles_total");

        for metric in [
            Box::new(messages.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(producer_cycles.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register kafka-operations metric: {}", e);
            }
        }

        Self {
            messages,
            producer_cycles,
        }
    }

    pub fn record_message(&self, topic: &str, outcome: &str) {
        self.messages.with_label_values(&[topic, outcome]).inc();
    }

    pub fn record_cycle(&self, service: &str, outcome: &str) {
        self.producer_cycles
            .with_label_values(&[service, outcome])
            .inc();
    }

    pub fn messages_total(&self, topic: &str, outcome: &str) -> u64 {
        self.messages.with_label_values(&[topic, outcome]).get()
    }

    pub fn cycles_total(&self, service: &str, outcome: &str) -> u64 {
        self.producer_cycles
            .with_label_values(&[service, outcome])
            .get()
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_label() {
        let metrics = OperationMetrics::with_registry(&Registry::new());

        metrics.record_message("users", "executed");
        metrics.record_message("users", "executed");
        metrics.record_message("users", "failed");
        metrics.record_cycle("sync", "succeeded");

        assert_eq!(metrics.messages_total("users", "executed"), 2);
        assert_eq!(metrics.messages_total("users", "failed"), 1);
        assert_eq!(metrics.messages_total("orders", "executed"), 0);
        assert_eq!(metrics.cycles_total("sync", "succeeded"), 1);
    }

    #[test]
    fn test_registered_on_registry() {
        let registry = Registry::new();
        let metrics = OperationMetrics::with_registry(&registry);
        metrics.record_cycle("sync", "failed");

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"kafka_ops_producer_cycles_total".to_string()));
    }

    #[test]
    fn test_duplicate_registration_is_tolerated() {
        let registry = Registry::new();
        let _first = OperationMetrics::with_registry(&registry);
        let second = OperationMetrics::with_registry(&registry);

        second.record_message("t", "executed");
        assert_eq!(second.messages_total("t", "executed"), 1);
    }
}
