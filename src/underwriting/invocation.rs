use super::events::{EventSink, FlowEvent, FlowEventEnvelope};
use super::model::Coverage;
use crate::core::errors::{FlowError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The six external steps of the underwriting graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    FetchAssets,
    FetchLiabilities,
    FetchHealthHistory,
    ScoreCredit,
    ScoreHealth,
    Decide,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::FetchAssets => "fetch_assets",
            Step::FetchLiabilities => "fetch_liabilities",
            Step::FetchHealthHistory => "fetch_health_history",
            Step::ScoreCredit => "score_credit",
            Step::ScoreHealth => "score_health",
            Step::Decide => "decide",
        }
    }

    /// Wrap an external failure in the error kind for this step
    pub fn error(self, source: anyhow::Error) -> FlowError {
        match self {
            Step::FetchAssets | Step::FetchLiabilities | Step::FetchHealthHistory => {
                FlowError::fetch(self.name(), source)
            }
            Step::ScoreCredit | Step::ScoreHealth => FlowError::scoring(self.name(), source),
            Step::Decide => FlowError::decision(source),
        }
    }
}

/// Lifecycle of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InvocationState {
    Pending,
    BranchesRunning,
    /// Assets and liabilities both arrived
    CreditJoined,
    /// One score is written, the other is outstanding
    ScoresPending,
    ScoresJoined,
    Deciding,
    Completed,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationState::Completed | InvocationState::Failed)
    }

    /// Progress only moves forward; `Failed` is reachable from any
    /// non-terminal state and terminal states accept nothing.
    pub fn can_transition_to(self, next: InvocationState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == InvocationState::Failed || next > self
    }
}

/// Counters and in-flight registry shared by every invocation of one
/// orchestrator
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    active: DashMap<Uuid, String>,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl Ledger {
    pub(crate) fn in_flight(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn snapshot(&self) -> OrchestratorStats {
        OrchestratorStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Orchestrator-wide invocation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    /// Late results and errors dropped after an invocation finished
    pub discarded: u64,
    pub in_flight: usize,
}

pub type OnComplete = Box<dyn FnOnce(Result<Coverage>) + Send + 'static>;

struct Outcome {
    state: InvocationState,
    on_complete: Option<OnComplete>,
}

/// One call to the orchestrator.
///
/// Owns the terminal callback and hands it out exactly once, to whichever
/// of [`complete`](Self::complete) or [`fail`](Self::fail) gets there first.
pub struct Invocation {
    id: Uuid,
    person_id: String,
    started: Instant,
    outcome: Mutex<Outcome>,
    discarded: Mutex<Vec<String>>,
    events: Arc<dyn EventSink>,
    ledger: Arc<Ledger>,
}

impl Invocation {
    pub(crate) fn new(
        person_id: String,
        on_complete: OnComplete,
        events: Arc<dyn EventSink>,
        ledger: Arc<Ledger>,
    ) -> Self {
        let id = Uuid::new_v4();
        ledger.active.insert(id, person_id.clone());
        ledger.started.fetch_add(1, Ordering::Relaxed);

        Self {
            id,
            person_id,
            started: Instant::now(),
            outcome: Mutex::new(Outcome {
                state: InvocationState::Pending,
                on_complete: Some(on_complete),
            }),
            discarded: Mutex::new(Vec::new()),
            events,
            ledger,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> InvocationState {
        self.lock_outcome().state
    }

    pub fn is_failed(&self) -> bool {
        self.state() == InvocationState::Failed
    }

    /// Diagnostics for results that arrived after the outcome was fixed
    pub fn discarded(&self) -> Vec<String> {
        self.discarded
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub(crate) fn emit(&self, event: FlowEvent) {
        self.events.emit(&FlowEventEnvelope::new(self.id, event));
    }

    /// Move forward to `next`; backward or terminal moves are ignored
    pub(crate) fn advance(&self, next: InvocationState) -> bool {
        debug_assert!(!next.is_terminal(), "terminal states go through complete/fail");
        let mut outcome = self.lock_outcome();
        if !outcome.state.can_transition_to(next) {
            return false;
        }
        debug!(
            "Invocation {} {:?} -> {:?}",
            self.id, outcome.state, next
        );
        outcome.state = next;
        true
    }

    /// Deliver the coverage decision; returns false if the outcome was
    /// already fixed, in which case the decision is discarded
    pub(crate) fn complete(&self, coverage: Coverage) -> bool {
        let Some(on_complete) = self.finish(InvocationState::Completed) else {
            self.discard("decide", "invocation already finished");
            return false;
        };

        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            "Invocation {} for {} completed in {}ms (approved: {})",
            self.id, self.person_id, duration_ms, coverage.approved
        );
        self.ledger.completed.fetch_add(1, Ordering::Relaxed);
        self.emit(FlowEvent::InvocationCompleted {
            approved: coverage.approved,
            duration_ms,
        });
        on_complete(Ok(coverage));
        true
    }

    /// Report a failure; only the first error of an invocation is
    /// delivered, later ones are discarded
    pub(crate) fn fail(&self, error: FlowError) -> bool {
        let Some(on_complete) = self.finish(InvocationState::Failed) else {
            self.discard(error.category(), error.to_string());
            return false;
        };

        warn!(
            "Invocation {} for {} failed: {}",
            self.id, self.person_id, error
        );
        self.ledger.failed.fetch_add(1, Ordering::Relaxed);
        self.emit(FlowEvent::InvocationFailed {
            category: error.category().to_string(),
            error: error.to_string(),
        });
        on_complete(Err(error));
        true
    }

    /// Record a result or error that will never be delivered
    pub(crate) fn discard<S: Into<String>, R: Into<String>>(&self, source: S, reason: R) {
        let source = source.into();
        let reason = reason.into();
        debug!(
            "Invocation {} discarded result from {}: {}",
            self.id, source, reason
        );

        match self.discarded.lock() {
            Ok(mut entries) => entries.push(format!("{}: {}", source, reason)),
            Err(poisoned) => poisoned
                .into_inner()
                .push(format!("{}: {}", source, reason)),
        }
        self.ledger.discarded.fetch_add(1, Ordering::Relaxed);
        self.emit(FlowEvent::ResultDiscarded { source, reason });
    }

    fn finish(&self, terminal: InvocationState) -> Option<OnComplete> {
        let on_complete = {
            let mut outcome = self.lock_outcome();
            if outcome.state.is_terminal() {
                return None;
            }
            outcome.state = terminal;
            outcome.on_complete.take()
        };
        self.ledger.active.remove(&self.id);
        on_complete
    }

    fn lock_outcome(&self) -> MutexGuard<'_, Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::underwriting::events::BufferingEventSink;
    use crate::underwriting::model::{CreditScore, HealthScore};
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    fn coverage() -> Coverage {
        Coverage {
            approved: true,
            credit: CreditScore(700),
            health: HealthScore(90),
            premium_cents: 60_000,
        }
    }

    fn invocation(calls: Arc<AtomicUsize>) -> (Invocation, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::default());
        let invocation = Invocation::new(
            "p-1".to_string(),
            Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(BufferingEventSink::new()),
            ledger.clone(),
        );
        (invocation, ledger)
    }

    #[test]
    fn test_state_transitions() {
        use InvocationState::*;
        assert!(Pending.can_transition_to(BranchesRunning));
        assert!(CreditJoined.can_transition_to(Failed));
        assert!(!ScoresJoined.can_transition_to(CreditJoined));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_first_error_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (invocation, ledger) = invocation(calls.clone());
        assert_eq!(ledger.in_flight(), 1);

        assert!(invocation.fail(Step::FetchLiabilities.error(anyhow!("down"))));
        assert!(!invocation.fail(Step::ScoreHealth.error(anyhow!("late"))));
        assert!(!invocation.complete(coverage()));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(invocation.state(), InvocationState::Failed);
        assert_eq!(invocation.discarded().len(), 2);

        let stats = ledger.snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (invocation, _) = invocation(Arc::new(AtomicUsize::new(0)));
        assert!(invocation.advance(InvocationState::ScoresPending));
        assert!(!invocation.advance(InvocationState::CreditJoined));
        assert!(invocation.complete(coverage()));
        assert!(!invocation.advance(InvocationState::Deciding));
    }

    #[test]
    fn test_step_error_kinds() {
        assert_eq!(Step::FetchAssets.error(anyhow!("x")).category(), "fetch");
        assert_eq!(Step::ScoreCredit.error(anyhow!("x")).category(), "scoring");
        assert_eq!(Step::Decide.error(anyhow!("x")).category(), "decision");
    }
}
