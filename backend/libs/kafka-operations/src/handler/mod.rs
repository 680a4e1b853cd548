//! Message handlers: raw record → validated envelope → Insert/Update/Delete.
//!
//! ```text
//! raw payload ─▶ OperationMessageHandler ─▶ OperationHandler<D>
//!                 (decode + validate)         insert / update / delete
//!                                    └─▶ MappedOperationHandler<S, T>
//!                                         (map S → T) ─▶ OperationHandler<T>
//! ```

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelope::OperationKind;
use crate::error::HandlerResult;

mod dispatcher;
mod factory;
mod mapping;

pub use dispatcher::OperationMessageHandler;
pub use factory::{MessageHandlerFactory, TopicHandlerRegistry};
pub use mapping::{DtoMapper, MappedOperationHandler};

/// What a handler did with a received record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The envelope was valid and the operation ran
    Executed(OperationKind),

    /// Empty or whitespace payload, dropped
    DiscardedBlank,

    /// Payload could not be decoded as an operation message, dropped
    DiscardedMalformed,
}

impl DispatchOutcome {
    /// Label used for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Executed(_) => "executed",
            DispatchOutcome::DiscardedBlank => "discarded_blank",
            DispatchOutcome::DiscardedMalformed => "discarded_malformed",
        }
    }
}

/// Handler for a single raw record received from a topic.
///
/// A fresh instance is created for every record by a
/// [`MessageHandlerFactory`], so implementations may keep per-message state.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message_received(
        &self,
        key: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> HandlerResult<DispatchOutcome>;
}

/// Domain operations invoked for a validated envelope.
#[async_trait]
pub trait OperationHandler<D>: Send + Sync
where
    D: Send + 'static,
{
    /// Insert the model built from `dto`.
    async fn insert(&self, dto: D, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Update the model built from `dto`.
    async fn update(&self, dto: D, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Delete the model identified by `dto`.
    async fn delete(&self, dto: D, cancel: &CancellationToken) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every call made to it.
    #[derive(Clone)]
    pub struct RecordingHandler<D> {
        pub calls: Arc<Mutex<Vec<(OperationKind, D)>>>,
        pub fail_with: Option<&'static str>,
    }

    impl<D: Clone> RecordingHandler<D> {
        pub fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_with: None,
            }
        }

        pub fn failing(message: &'static str) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_with: Some(message),
            }
        }

        pub fn calls(&self) -> Vec<(OperationKind, D)> {
            self.calls.lock().clone()
        }

        fn record(&self, operation: OperationKind, dto: D) -> anyhow::Result<()> {
            self.calls.lock().push((operation, dto));
            match self.fail_with {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl<D> OperationHandler<D> for RecordingHandler<D>
    where
        D: Clone + Send + Sync + 'static,
    {
        async fn insert(&self, dto: D, _cancel: &CancellationToken) -> anyhow::Result<()> {
            self.record(OperationKind::Insert, dto)
        }

        async fn update(&self, dto: D, _cancel: &CancellationToken) -> anyhow::Result<()> {
            self.record(OperationKind::Update, dto)
        }

        async fn delete(&self, dto: D, _cancel: &CancellationToken) -> anyhow::Result<()> {
            self.record(OperationKind::Delete, dto)
        }
    }
}
