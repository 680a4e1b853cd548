use std::collections::HashMap;
use std::sync::Arc;

use super::MessageHandler;
use crate::error::{HandlerError, HandlerResult};

/// Resolves a handler for the topic a record was received from.
///
/// Called once per record. Implementations must return a new handler each
/// time so that no state leaks from one message to the next.
pub trait MessageHandlerFactory: Send + Sync {
    fn create(&self, topic: &str) -> HandlerResult<Box<dyn MessageHandler>>;
}

type HandlerConstructor = Arc<dyn Fn() -> Box<dyn MessageHandler> + Send + Sync>;

/// [`MessageHandlerFactory`] backed by a topic → constructor table.
#[derive(Clone, Default)]
pub struct TopicHandlerRegistry {
    constructors: HashMap<String, HandlerConstructor>,
}

impl TopicHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` for `topic`, replacing any previous entry.
    pub fn register<F, H>(mut self, topic: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: MessageHandler + 'static,
    {
        self.constructors.insert(
            topic.into(),
            Arc::new(move || Box::new(constructor()) as Box<dyn MessageHandler>),
        );
        self
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.constructors.contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.constructors.keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl MessageHandlerFactory for TopicHandlerRegistry {
    fn create(&self, topic: &str) -> HandlerResult<Box<dyn MessageHandler>> {
        self.constructors
            .get(topic)
            .map(|constructor| constructor())
            .ok_or_else(|| HandlerError::UnknownTopic(topic.to_string()))
    }
}
