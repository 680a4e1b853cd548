//! Producer schedulers.
//!
//! Both schedulers drive a user-supplied [`ProducerOperations`] callback that
//! produces one batch per call:
//!
//! - [`PeriodicProducer`]: single-shot timer, rearmed only after the previous
//!   cycle completed, so cycles never overlap even if one overruns the period
//! - [`SignalDrivenProducer`]: runs once immediately, then again every time an
//!   external subscription completes a [`CompletionSignal`]
//!
//! Errors and panics raised by `operations` are caught at the cycle boundary
//! and logged; the next cycle is scheduled normally.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::panic_message;
use crate::metrics::OperationMetrics;

mod periodic;
mod subscription;

pub use periodic::{PeriodicProducer, PeriodicState};
pub use subscription::{CompletionSignal, SignalDrivenProducer, SignalState, Subscription};

/// One batch of producer work.
#[async_trait]
pub trait ProducerOperations: Send + Sync + 'static {
    /// Produce one batch. `cancel` fires when the scheduler is stopped.
    async fn operations(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Producer whose next batch is triggered by an external event.
pub trait SubscriptionProducer: ProducerOperations {
    /// Register interest in the next event and complete `signal` when it
    /// happens. The returned [`Subscription`] is released at the end of the
    /// iteration.
    fn subscribe(&self, signal: CompletionSignal) -> Subscription;
}

/// How a single `operations` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded,
    Failed,
    Panicked,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Succeeded => "succeeded",
            CycleOutcome::Failed => "failed",
            CycleOutcome::Panicked => "panicked",
        }
    }
}

/// Run one cycle, catching errors and panics.
pub(crate) async fn run_cycle<O>(
    operations: &O,
    cancel: CancellationToken,
    service: &str,
    metrics: Option<&OperationMetrics>,
) -> CycleOutcome
where
    O: ProducerOperations + ?Sized,
{
    debug!(service, "Running producer operations");

    let outcome = match AssertUnwindSafe(operations.operations(cancel))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            debug!(service, "Producer operations completed");
            CycleOutcome::Succeeded
        }
        Ok(Err(e)) => {
            error!(service, error = %e, "Producer operations failed");
            CycleOutcome::Failed
        }
        Err(panic) => {
            error!(
                service,
                panic = %panic_message(&*panic),
                "Producer operations panicked"
            );
            CycleOutcome::Panicked
        }
    };

    if let Some(metrics) = metrics {
        metrics.record_cycle(service, outcome.as_str());
    }

    outcome
}
