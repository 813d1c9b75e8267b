//! Step deadlines with cooperative cancellation.
//!
//! A step wrapped by [`TimeoutManager::run_step`] never leaves its session
//! half-updated. If the deadline passes or the step is cancelled before the
//! session operation started, the operation is skipped and the session is
//! unchanged. If it had already started, the session is aborted to FAILED
//! once the operation returns.

use alloc::{format, string::String, sync::Arc};
use core::{future::Future, time::Duration};
use std::collections::{hash_map::Entry, HashMap};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, trace, warn};

use super::CorrelationId;
use crate::{
    error::SimulatorError,
    session::{HandshakeSession, SessionHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub step_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub const fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }
}

/// How a wrapped step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    Completed(T),
    /// The step ran and returned an error.
    Failed(SimulatorError),
    /// The deadline passed, carries `SimulatorError::Timeout`.
    TimedOut(SimulatorError),
    /// Cancelled through [`TimeoutManager::cancel`], carries `SimulatorError::Cancelled`.
    Cancelled(SimulatorError),
}

impl<T> StepOutcome<T> {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Collapses the outcome into a `Result`.
    ///
    /// # Errors
    ///
    /// The carried `SimulatorError` for every outcome but `Completed`.
    pub fn into_result(self) -> Result<T, SimulatorError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(err) | Self::TimedOut(err) | Self::Cancelled(err) => Err(err),
        }
    }
}

/// Progress of a session operation handed to the blocking pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepGuard {
    Pending,
    Done,
    Abandoned,
}

/// Cancellation channel of a correlation id, shared by every operation
/// running under it.
#[derive(Debug)]
struct Registration {
    cancel: watch::Sender<bool>,
    holders: usize,
}

type ActiveOperations = Mutex<HashMap<CorrelationId, Registration>>;

/// Releases one hold on a registration, also when the awaiting future is
/// dropped.
struct Deregister<'a> {
    active: &'a ActiveOperations,
    id: CorrelationId,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.active.lock().entry(self.id) {
            entry.get_mut().holders -= 1;
            if entry.get().holders == 0 {
                entry.remove();
            }
        }
    }
}

/// Runs futures and session steps under a deadline.
#[derive(Debug, Default)]
pub struct TimeoutManager {
    config: TimeoutConfig,
    active: ActiveOperations,
}

impl TimeoutManager {
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Requests cancellation of the operations registered under `id`.
    ///
    /// Returns `false` if no such operation is running.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        match self.active.lock().get(id) {
            Some(registration) => {
                info!("Cancelling operation {id}");
                registration.cancel.send_replace(true);
                true
            }
            None => {
                trace!("No running operation {id} to cancel");
                false
            }
        }
    }

    /// Number of operations currently running under a deadline.
    #[must_use]
    pub fn active_operations(&self) -> usize {
        self.active
            .lock()
            .values()
            .map(|registration| registration.holders)
            .sum()
    }

    fn register(&self, id: CorrelationId) -> watch::Receiver<bool> {
        let mut active = self.active.lock();
        let registration = active.entry(id).or_insert_with(|| Registration {
            cancel: watch::channel(false).0,
            holders: 0,
        });
        if registration.holders > 0 {
            warn!("Correlation id {id} is already in use, its operations share cancellation");
        }
        registration.holders += 1;
        registration.cancel.subscribe()
    }

    /// Awaits `future` until it completes, the step timeout passes or the
    /// operation is cancelled, whichever happens first.
    pub async fn with_timeout<T, F>(
        &self,
        operation: &str,
        id: CorrelationId,
        future: F,
    ) -> StepOutcome<T>
    where
        F: Future<Output = Result<T, SimulatorError>>,
    {
        let mut cancelled = self.register(id);
        let _registration = Deregister {
            active: &self.active,
            id,
        };
        let after = self.config.step_timeout;
        trace!("Running {operation} ({id}) with a deadline of {after:?}");

        let outcome = tokio::select! {
            biased;
            Ok(_) = cancelled.wait_for(|cancelled| *cancelled) => {
                StepOutcome::Cancelled(SimulatorError::Cancelled { correlation_id: id })
            }
            result = tokio::time::timeout(after, future) => match result {
                Ok(Ok(value)) => StepOutcome::Completed(value),
                Ok(Err(err)) => StepOutcome::Failed(err),
                Err(_) => {
                    warn!("{operation} ({id}) did not complete within {after:?}");
                    StepOutcome::TimedOut(SimulatorError::Timeout {
                        operation: String::from(operation),
                        after,
                    })
                }
            },
        };
        outcome
    }

    /// Runs `step` on the session behind `handle` under a deadline.
    ///
    /// The step executes on the blocking pool while holding the session lock.
    pub async fn run_step<S, T, F>(
        &self,
        handle: &SessionHandle<S>,
        operation: &str,
        id: CorrelationId,
        step: F,
    ) -> StepOutcome<T>
    where
        S: HandshakeSession + Send + 'static,
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T, SimulatorError> + Send + 'static,
    {
        let guard = Arc::new(Mutex::new(StepGuard::Pending));

        let session = Arc::clone(handle.shared());
        let task_guard = Arc::clone(&guard);
        let task = tokio::task::spawn_blocking(move || {
            let mut session = session.lock();
            {
                let mut guard = task_guard.lock();
                if *guard == StepGuard::Abandoned {
                    return None;
                }
                *guard = StepGuard::Done;
            }
            Some(step(&mut *session))
        });

        let outcome = self
            .with_timeout(operation, id, async move {
                match task.await {
                    Ok(Some(result)) => result,
                    Ok(None) => Err(SimulatorError::Internal {
                        reason: String::from("step was abandoned while still awaited"),
                    }),
                    Err(err) => {
                        error!("Session step panicked: {err}");
                        Err(SimulatorError::Internal {
                            reason: format!("session step failed to complete: {err}"),
                        })
                    }
                }
            })
            .await;

        if matches!(outcome, StepOutcome::TimedOut(_) | StepOutcome::Cancelled(_)) {
            let started = {
                let mut guard = guard.lock();
                if *guard == StepGuard::Pending {
                    *guard = StepGuard::Abandoned;
                    false
                } else {
                    true
                }
            };
            if started {
                // The step holds the session lock until it returns.
                let session = Arc::clone(handle.shared());
                match tokio::task::spawn_blocking(move || session.lock().abort()).await {
                    Ok(()) => warn!("{operation} ({id}) had already run, session aborted"),
                    Err(err) => error!("Failed to abort session after {operation} ({id}): {err}"),
                }
            } else {
                info!("{operation} ({id}) abandoned before it started, session unchanged");
            }
        }
        outcome
    }
}
