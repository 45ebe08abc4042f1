//! Countdown join barrier with continuation registration.
//!
//! A [`JoinBarrier`] expects a fixed number of arrivals. The arrival that
//! brings the count to zero releases the barrier exactly once: it sees
//! [`Arrival::Released`], every registered continuation runs, and every
//! pending [`JoinBarrier::wait`] resolves. Release is sticky, so waiting or
//! registering after the fact resolves immediately.

use crate::core::errors::{FlowError, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

const POISON_BIT: usize = 1;

/// How a barrier was released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Every contributor arrived normally
    Complete,
    /// At least one contributor arrived with an error
    Poisoned,
}

impl Release {
    pub fn is_poisoned(self) -> bool {
        matches!(self, Release::Poisoned)
    }
}

/// Outcome of a single arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// More contributors are still outstanding
    Pending { remaining: usize },
    /// This arrival released the barrier
    Released(Release),
}

type Continuation = Box<dyn FnOnce(Release) + Send + 'static>;

struct ReleaseState {
    released: Option<Release>,
    continuations: Vec<Continuation>,
}

pub struct JoinBarrier {
    name: String,
    expected: usize,
    // remaining count shifted left by one, low bit marks a failed contributor
    packed: AtomicUsize,
    extra_arrivals: AtomicUsize,
    state: Mutex<ReleaseState>,
    notify: Notify,
}

impl fmt::Debug for JoinBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinBarrier")
            .field("name", &self.name)
            .field("expected", &self.expected)
            .field("remaining", &self.remaining())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

impl JoinBarrier {
    /// Create a barrier expecting exactly `expected` arrivals
    pub fn new<S: Into<String>>(name: S, expected: usize) -> Result<Self> {
        let name = name.into();
        if expected == 0 {
            return Err(FlowError::configuration(format!(
                "barrier '{}' must expect at least one arrival",
                name
            )));
        }

        Ok(Self {
            name,
            expected,
            packed: AtomicUsize::new(expected << 1),
            extra_arrivals: AtomicUsize::new(0),
            state: Mutex::new(ReleaseState {
                released: None,
                continuations: Vec::new(),
            }),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn remaining(&self) -> usize {
        self.packed.load(Ordering::Acquire) >> 1
    }

    pub fn is_poisoned(&self) -> bool {
        self.packed.load(Ordering::Acquire) & POISON_BIT != 0
    }

    pub fn is_released(&self) -> bool {
        self.released().is_some()
    }

    /// The release outcome, if the barrier has released
    pub fn released(&self) -> Option<Release> {
        self.lock_state().released
    }

    /// Signal a normal completion
    pub fn arrive(&self) -> Result<Arrival> {
        self.arrive_inner(false)
    }

    /// Signal a failed completion; the barrier still counts it so the
    /// release is never lost, but releases as [`Release::Poisoned`]
    pub fn arrive_failed(&self) -> Result<Arrival> {
        self.arrive_inner(true)
    }

    fn arrive_inner(&self, failed: bool) -> Result<Arrival> {
        let poison = if failed { POISON_BIT } else { 0 };
        let previous = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let remaining = packed >> 1;
                if remaining == 0 {
                    None
                } else {
                    Some(((remaining - 1) << 1) | (packed & POISON_BIT) | poison)
                }
            });

        let previous = match previous {
            Ok(previous) => previous,
            Err(_) => {
                let extra = self.extra_arrivals.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    "Barrier '{}' received arrival {} but expects {}",
                    self.name,
                    self.expected + extra,
                    self.expected
                );
                return Err(FlowError::barrier_misuse(
                    self.expected,
                    self.expected + extra,
                ));
            }
        };

        let remaining = (previous >> 1) - 1;
        if remaining > 0 {
            debug!("Barrier '{}' waiting on {} more", self.name, remaining);
            return Ok(Arrival::Pending { remaining });
        }

        let release = if (previous & POISON_BIT) | poison != 0 {
            Release::Poisoned
        } else {
            Release::Complete
        };
        self.release(release);
        Ok(Arrival::Released(release))
    }

    fn release(&self, release: Release) {
        let continuations = {
            let mut state = self.lock_state();
            state.released = Some(release);
            std::mem::take(&mut state.continuations)
        };

        debug!(
            "Barrier '{}' released ({:?}), running {} continuations",
            self.name,
            release,
            continuations.len()
        );
        self.notify.notify_waiters();
        for continuation in continuations {
            continuation(release);
        }
    }

    /// Register a continuation to run once the barrier releases.
    ///
    /// Runs on the releasing thread, or right away on the caller if the
    /// barrier has already released.
    pub fn on_release<F>(&self, continuation: F)
    where
        F: FnOnce(Release) + Send + 'static,
    {
        let mut state = self.lock_state();
        let released = state.released;
        match released {
            Some(release) => {
                drop(state);
                continuation(release);
            }
            None => state.continuations.push(Box::new(continuation)),
        }
    }

    /// Suspend until the barrier releases
    pub async fn wait(&self) -> Release {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Some(release) = self.released() {
                return release;
            }
            notified.await;
        }
    }

    /// Suspend until the barrier releases or the timeout elapses
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Release> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| {
                FlowError::timeout(format!("wait:{}", self.name), timeout.as_millis() as u64)
            })
    }

    fn lock_state(&self) -> MutexGuard<'_, ReleaseState> {
        // Continuations never run under the lock, so a poisoned mutex still
        // holds consistent state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
