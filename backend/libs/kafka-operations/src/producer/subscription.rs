use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{run_cycle, SubscriptionProducer};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::OperationMetrics;
use crate::transport::{ensure_topics, TopicAdmin};

/// One-shot "new work is available" notification.
///
/// Clones share the same slot; the first [`complete`](Self::complete) wins.
/// Dropping every clone without completing leaves the scheduler waiting for
/// cancellation.
#[derive(Clone)]
pub struct CompletionSignal {
    sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl CompletionSignal {
    /// A fresh signal and the receiver that resolves when it completes.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let signal = Self {
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        (signal, rx)
    }

    /// Complete the signal. Returns `false` if it was already completed.
    pub fn complete(&self) -> bool {
        match self.sender.lock().take() {
            // The receiver may be gone if the scheduler stopped meanwhile
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Handle for an event registration, released when dropped.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Run `release` when the subscription is dropped.
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Abort `task` when the subscription is dropped.
    pub fn from_task<T: Send + 'static>(task: JoinHandle<T>) -> Self {
        Self::new(move || task.abort())
    }

    /// Subscription with nothing to release.
    pub fn empty() -> Self {
        Self { release: None }
    }

    /// Release now instead of on drop.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Lifecycle of a [`SignalDrivenProducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    /// Subscribed, running `operations`
    Ready,
    AwaitingSignal,
    Stopped,
}

/// Runs [`ProducerOperations::operations`](super::ProducerOperations::operations)
/// once on start and again each time the current [`CompletionSignal`] completes.
///
/// Every iteration subscribes first and runs `operations` before waiting, so a
/// restart drains any backlog without waiting for a new event. The loop runs
/// in its own task; a fault of that task is logged as critical and never
/// propagated to the caller.
pub struct SignalDrivenProducer<P> {
    name: String,
    producer: Arc<P>,
    topics: Vec<String>,
    admin: Option<Arc<dyn TopicAdmin>>,
    metrics: Option<OperationMetrics>,
    state: Arc<Mutex<SignalState>>,
    cancel: CancellationToken,
    started: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<P: SubscriptionProducer> SignalDrivenProducer<P> {
    pub fn new(name: impl Into<String>, producer: Arc<P>) -> Self {
        Self {
            name: name.into(),
            producer,
            topics: Vec::new(),
            admin: None,
            metrics: None,
            state: Arc::new(Mutex::new(SignalState::Ready)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    /// Make sure `topics` exist before the loop starts.
    pub fn with_topics(mut self, admin: Arc<dyn TopicAdmin>, topics: Vec<String>) -> Self {
        self.admin = Some(admin);
        self.topics = topics;
        self
    }

    pub fn with_metrics(mut self, metrics: OperationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SignalState {
        *self.state.lock()
    }

    /// Ensure topics exist, then spawn the loop.
    ///
    /// Fails with [`ServiceError::AlreadyStarted`] on a second call.
    pub async fn start(&self) -> ServiceResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyStarted(self.name.clone()));
        }

        if let Some(admin) = &self.admin {
            if let Err(e) = ensure_topics(admin.as_ref(), &self.topics).await {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        info!(service = %self.name, "Starting signal-driven producer");

        let worker = tokio::spawn(signal_loop(
            self.name.clone(),
            self.producer.clone(),
            self.state.clone(),
            self.cancel.clone(),
            self.metrics.clone(),
        ));

        let name = self.name.clone();
        let state = self.state.clone();
        let supervisor = tokio::spawn(async move {
            if let Err(e) = worker.await {
                error!(
                    severity = "critical",
                    service = %name,
                    error = %e,
                    "Signal-driven producer loop terminated unexpectedly"
                );
                *state.lock() = SignalState::Stopped;
            }
        });
        *self.supervisor.lock() = Some(supervisor);

        Ok(())
    }

    /// Cancel the loop and wait for it to settle.
    ///
    /// With a `deadline`, fails with [`ServiceError::StopTimedOut`] if the
    /// current `operations` call does not return in time.
    pub async fn stop(&self, deadline: Option<Duration>) -> ServiceResult<()> {
        self.started.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        info!(service = %self.name, "Stopping signal-driven producer");

        let handle = self.supervisor.lock().take();
        if let Some(mut handle) = handle {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        *self.supervisor.lock() = Some(handle);
                        return Err(ServiceError::StopTimedOut {
                            service: self.name.clone(),
                            deadline,
                        });
                    }
                },
                None => handle.await,
            };

            if let Err(e) = joined {
                error!(service = %self.name, error = %e, "Signal-driven producer supervisor failed");
            }
        }

        *self.state.lock() = SignalState::Stopped;
        info!(service = %self.name, "Signal-driven producer stopped");

        Ok(())
    }
}

impl<P> Drop for SignalDrivenProducer<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn signal_loop<P: SubscriptionProducer>(
    name: String,
    producer: Arc<P>,
    state: Arc<Mutex<SignalState>>,
    cancel: CancellationToken,
    metrics: Option<OperationMetrics>,
) {
    while !cancel.is_cancelled() {
        let (signal, completed) = CompletionSignal::channel();
        let subscription = producer.subscribe(signal);
        *state.lock() = SignalState::Ready;

        run_cycle(producer.as_ref(), cancel.clone(), &name, metrics.as_ref()).await;

        *state.lock() = SignalState::AwaitingSignal;
        debug!(service = %name, "Waiting for completion signal");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            result = completed => match result {
                Ok(()) => debug!(service = %name, "Completion signal received"),
                Err(_) => {
                    warn!(
                        service = %name,
                        "Completion signal dropped without completing, waiting for cancellation"
                    );
                    cancel.cancelled().await;
                }
            },
        }

        drop(subscription);
    }

    *state.lock() = SignalState::Stopped;
    debug!(service = %name, "Signal-driven producer loop exited");
}
