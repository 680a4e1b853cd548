use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{run_cycle, ProducerOperations};
use crate::config::ProducerSchedule;
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::OperationMetrics;
use crate::transport::{ensure_topics, TopicAdmin};

/// Lifecycle of a [`PeriodicProducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicState {
    /// Timer armed, no cycle in flight
    Idle,
    Running,
    /// Timer disarmed, waiting for the in-flight cycle
    Stopping,
    Stopped,
}

struct Shared {
    state: Mutex<PeriodicState>,
    /// Cancelled by `stop`; no cycle starts afterwards
    disarm: CancellationToken,
    /// Handed to `operations`
    cycle: CancellationToken,
}

/// Runs [`ProducerOperations::operations`] on a single-shot timer.
///
/// The first cycle fires `delay` after [`start`](Self::start); each following
/// cycle fires `interval` after the previous one completed. The timer is only
/// rearmed from the completion of a cycle, so at most one cycle is in flight.
///
/// A stopped producer cannot be started again.
pub struct PeriodicProducer<O> {
    name: String,
    operations: Arc<O>,
    delay: Duration,
    interval: Duration,
    topics: Vec<String>,
    admin: Option<Arc<dyn TopicAdmin>>,
    metrics: Option<OperationMetrics>,
    shared: Arc<Shared>,
    started: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<O: ProducerOperations> PeriodicProducer<O> {
    pub fn new(name: impl Into<String>, operations: Arc<O>, schedule: &ProducerSchedule) -> Self {
        Self {
            name: name.into(),
            operations,
            delay: schedule.delay(),
            interval: schedule.interval(),
            topics: Vec::new(),
            admin: None,
            metrics: None,
            shared: Arc::new(Shared {
                state: Mutex::new(PeriodicState::Idle),
                disarm: CancellationToken::new(),
                cycle: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    /// Make sure `topics` exist before the timer is armed.
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

    pub fn state(&self) -> PeriodicState {
        *self.shared.state.lock()
    }

    /// Ensure topics exist, then arm the timer for the initial delay.
    ///
    /// Fails with [`ServiceError::AlreadyStarted`] on a second call. If topic
    /// creation fails the producer stays unstarted and `start` may be retried.
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

        info!(
            service = %self.name,
            delay_secs = self.delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting periodic producer"
        );

        let handle = tokio::spawn(drive(
            self.name.clone(),
            self.operations.clone(),
            self.shared.clone(),
            self.delay,
            self.interval,
            self.metrics.clone(),
        ));
        *self.driver.lock() = Some(handle);

        Ok(())
    }

    /// Disarm the timer and wait for the in-flight cycle, if any.
    ///
    /// A running cycle has its cancellation token fired. Without a `deadline`
    /// this waits as long as the cycle takes. When the deadline passes first
    /// [`ServiceError::StopTimedOut`] is returned, the producer stays in
    /// `Stopping` and `stop` may be called again.
    pub async fn stop(&self, deadline: Option<Duration>) -> ServiceResult<()> {
        {
            let mut state = self.shared.state.lock();
            if *state == PeriodicState::Stopped {
                return Ok(());
            }
            let was_running = *state == PeriodicState::Running;
            *state = PeriodicState::Stopping;
            self.shared.disarm.cancel();
            if was_running {
                debug!(service = %self.name, "Cancelling in-flight cycle");
                self.shared.cycle.cancel();
            }
        }
        // Nothing can start after a stop
        self.started.store(true, Ordering::SeqCst);

        info!(service = %self.name, "Stopping periodic producer");

        let handle = self.driver.lock().take();
        if let Some(mut handle) = handle {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            service = %self.name,
                            deadline_ms = deadline.as_millis() as u64,
                            "In-flight cycle did not finish before the stop deadline"
                        );
                        *self.driver.lock() = Some(handle);
                        return Err(ServiceError::StopTimedOut {
                            service: self.name.clone(),
                            deadline,
                        });
                    }
                },
                None => handle.await,
            };

            if let Err(e) = joined {
                error!(service = %self.name, error = %e, "Periodic producer task failed");
            }
        }

        *self.shared.state.lock() = PeriodicState::Stopped;
        info!(service = %self.name, "Periodic producer stopped");

        Ok(())
    }
}

impl<O> Drop for PeriodicProducer<O> {
    fn drop(&mut self) {
        self.shared.disarm.cancel();
        self.shared.cycle.cancel();
    }
}

async fn drive<O: ProducerOperations>(
    name: String,
    operations: Arc<O>,
    shared: Arc<Shared>,
    delay: Duration,
    interval: Duration,
    metrics: Option<OperationMetrics>,
) {
    let mut due = delay;

    loop {
        tokio::select! {
            biased;
            _ = shared.disarm.cancelled() => break,
            _ = tokio::time::sleep(due) => {}
        }

        {
            let mut state = shared.state.lock();
            // stop() may have won the race with the timer
            if shared.disarm.is_cancelled() {
                break;
            }
            *state = PeriodicState::Running;
        }

        run_cycle(
            operations.as_ref(),
            shared.cycle.clone(),
            &name,
            metrics.as_ref(),
        )
        .await;

        {
            let mut state = shared.state.lock();
            if *state == PeriodicState::Running {
                *state = PeriodicState::Idle;
            }
        }

        due = interval;
        debug!(service = %name, next_in_secs = due.as_secs(), "Producer timer rearmed");
    }

    debug!(service = %name, "Producer timer disarmed");
}
