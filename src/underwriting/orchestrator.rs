//! Fixed two-level fan-out/fan-in underwriting graph.
//!
//! ```text
//! fetch_assets ──┐
//!                ├─ credit_inputs(2) ─ score_credit ─┐
//! fetch_liabilities ┘                                ├─ scores(2) ─ decide ─ on_complete
//! fetch_health_history ─ score_health ───────────────┘
//! ```
//!
//! No task ever parks on a join. Each producer publishes into its slot and
//! arrives; the arrival that releases a join carries on with the dependent
//! step, either inline or as a newly submitted task.

use super::events::{EventSink, FlowEvent, LoggingEventSink};
use super::invocation::{Invocation, InvocationState, Ledger, OrchestratorStats, Step};
use super::model::{Assets, Coverage, CreditScore, HealthHistory, HealthScore, Liabilities, Person};
use super::services::UnderwritingServices;
use crate::core::barrier::{Arrival, JoinBarrier, Release};
use crate::core::config::{Dispatch, FlowConfig};
use crate::core::errors::{FlowError, Result};
use crate::core::slot::ResultSlot;
use crate::executor::ExecutionFacility;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const CREDIT_INPUTS_JOIN: &str = "credit_inputs";
pub const SCORES_JOIN: &str = "scores";

pub struct Orchestrator {
    facility: Arc<dyn ExecutionFacility>,
    services: Arc<dyn UnderwritingServices>,
    config: FlowConfig,
    events: Arc<dyn EventSink>,
    ledger: Arc<Ledger>,
}

impl Orchestrator {
    pub fn new(
        facility: Arc<dyn ExecutionFacility>,
        services: Arc<dyn UnderwritingServices>,
        config: FlowConfig,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            facility,
            services,
            config,
            events: Arc::new(LoggingEventSink),
            ledger: Arc::new(Ledger::default()),
        })
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Underwrite `person`; `on_complete` runs exactly once with the
    /// coverage decision or the first error encountered
    pub fn run<F>(&self, person: Person, on_complete: F)
    where
        F: FnOnce(Result<Coverage>) + Send + 'static,
    {
        self.launch(person, on_complete);
    }

    /// Same as [`run`](Self::run), returning the invocation id used in
    /// emitted events
    pub fn launch<F>(&self, person: Person, on_complete: F) -> Uuid
    where
        F: FnOnce(Result<Coverage>) + Send + 'static,
    {
        let invocation = Arc::new(Invocation::new(
            person.id.clone(),
            Box::new(on_complete),
            self.events.clone(),
            self.ledger.clone(),
        ));
        let id = invocation.id();
        info!("Invocation {} started for {}", id, person.id);
        invocation.emit(FlowEvent::InvocationStarted {
            person_id: person.id.clone(),
        });

        let flow = match Flow::new(
            invocation.clone(),
            person,
            self.services.clone(),
            self.facility.clone(),
            self.config.clone(),
        ) {
            Ok(flow) => Arc::new(flow),
            Err(e) => {
                invocation.fail(e);
                return id;
            }
        };

        flow.observe_joins();
        invocation.advance(InvocationState::BranchesRunning);

        let branch = flow.clone();
        flow.submit(Step::FetchAssets, async move { branch.fetch_assets().await });
        let branch = flow.clone();
        flow.submit(Step::FetchLiabilities, async move {
            branch.fetch_liabilities().await
        });
        let branch = flow.clone();
        flow.submit(Step::FetchHealthHistory, async move {
            branch.fetch_health_history().await
        });

        id
    }

    /// Await the outcome instead of passing a callback
    pub async fn run_async(&self, person: Person) -> Result<Coverage> {
        let (tx, rx) = oneshot::channel();
        self.run(person, move |result| {
            let _ = tx.send(result);
        });

        rx.await.map_err(|_| {
            FlowError::cancelled("run_async").with_reason("invocation dropped without an outcome")
        })?
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.ledger.snapshot()
    }

    /// Invocations whose callback has not run yet
    pub fn in_flight(&self) -> usize {
        self.ledger.in_flight()
    }
}

/// Slots and joins of one invocation
struct Flow {
    invocation: Arc<Invocation>,
    person: Person,
    services: Arc<dyn UnderwritingServices>,
    facility: Arc<dyn ExecutionFacility>,
    config: FlowConfig,
    assets: ResultSlot<Assets>,
    liabilities: ResultSlot<Liabilities>,
    credit_inputs: JoinBarrier,
    credit: ResultSlot<CreditScore>,
    health: ResultSlot<HealthScore>,
    scores: JoinBarrier,
}

impl Flow {
    fn new(
        invocation: Arc<Invocation>,
        person: Person,
        services: Arc<dyn UnderwritingServices>,
        facility: Arc<dyn ExecutionFacility>,
        config: FlowConfig,
    ) -> Result<Self> {
        Ok(Self {
            invocation,
            person,
            services,
            facility,
            config,
            assets: ResultSlot::new("assets"),
            liabilities: ResultSlot::new("liabilities"),
            credit_inputs: JoinBarrier::new(CREDIT_INPUTS_JOIN, 2)?,
            credit: ResultSlot::new("credit"),
            health: ResultSlot::new("health"),
            scores: JoinBarrier::new(SCORES_JOIN, 2)?,
        })
    }

    fn observe_joins(&self) {
        for join in [&self.credit_inputs, &self.scores] {
            let invocation = self.invocation.clone();
            let name = join.name().to_string();
            join.on_release(move |release| {
                invocation.emit(FlowEvent::JoinReleased {
                    join: name,
                    poisoned: release.is_poisoned(),
                });
            });
        }
    }

    async fn fetch_assets(self: Arc<Self>) {
        let result = self
            .call(
                Step::FetchAssets,
                self.config.fetch_timeout(),
                self.services.fetch_assets(&self.person),
            )
            .await;
        self.settle_credit_input(Step::FetchAssets, &self.assets, result)
            .await;
    }

    async fn fetch_liabilities(self: Arc<Self>) {
        let result = self
            .call(
                Step::FetchLiabilities,
                self.config.fetch_timeout(),
                self.services.fetch_liabilities(&self.person),
            )
            .await;
        self.settle_credit_input(Step::FetchLiabilities, &self.liabilities, result)
            .await;
    }

    async fn settle_credit_input<T>(self: &Arc<Self>, step: Step, slot: &ResultSlot<T>, result: Result<T>) {
        let Some(release) = self.publish(step, slot, &self.credit_inputs, result) else {
            return;
        };

        self.invocation.advance(InvocationState::CreditJoined);
        let flow = self.clone();
        self.dispatch(self.config.score_dispatch, Step::ScoreCredit, async move {
            flow.score_credit(release).await
        })
        .await;
    }

    async fn score_credit(self: Arc<Self>, release: Release) {
        if release.is_poisoned() || self.invocation.is_failed() {
            debug!(
                "Invocation {} skipping credit scoring",
                self.invocation.id()
            );
            self.skip(Step::ScoreCredit, &self.credit, &self.scores);
            return;
        }

        let result = match self.credit_inputs() {
            Ok((assets, liabilities)) => {
                self.call(
                    Step::ScoreCredit,
                    self.config.scoring_timeout(),
                    self.services.score_credit(&assets, &liabilities),
                )
                .await
            }
            Err(e) => Err(e),
        };
        self.settle_score(Step::ScoreCredit, &self.credit, result)
            .await;
    }

    fn credit_inputs(&self) -> Result<(Assets, Liabilities)> {
        Ok((self.assets.take()?, self.liabilities.take()?))
    }

    async fn fetch_health_history(self: Arc<Self>) {
        let result = self
            .call(
                Step::FetchHealthHistory,
                self.config.fetch_timeout(),
                self.services.fetch_health_history(&self.person),
            )
            .await;

        match result {
            Ok(history) => {
                let flow = self.clone();
                self.dispatch(self.config.score_dispatch, Step::ScoreHealth, async move {
                    flow.score_health(history).await
                })
                .await;
            }
            Err(e) => {
                self.settle_score(Step::FetchHealthHistory, &self.health, Err(e))
                    .await
            }
        }
    }

    async fn score_health(self: Arc<Self>, history: HealthHistory) {
        if self.invocation.is_failed() {
            debug!(
                "Invocation {} skipping health scoring",
                self.invocation.id()
            );
            self.skip(Step::ScoreHealth, &self.health, &self.scores);
            return;
        }

        let result = self
            .call(
                Step::ScoreHealth,
                self.config.scoring_timeout(),
                self.services.score_health(&history),
            )
            .await;
        self.settle_score(Step::ScoreHealth, &self.health, result)
            .await;
    }

    async fn settle_score<T>(self: &Arc<Self>, step: Step, slot: &ResultSlot<T>, result: Result<T>) {
        match self.publish(step, slot, &self.scores, result) {
            Some(release) => self.scores_joined(release).await,
            None => {
                self.invocation.advance(InvocationState::ScoresPending);
            }
        }
    }

    async fn scores_joined(self: &Arc<Self>, release: Release) {
        if release.is_poisoned() || self.invocation.is_failed() {
            if !release.is_poisoned() {
                self.invocation
                    .discard(SCORES_JOIN, "invocation already finished");
            }
            return;
        }

        self.invocation.advance(InvocationState::ScoresJoined);
        let flow = self.clone();
        self.dispatch(self.config.decision_dispatch, Step::Decide, async move {
            flow.decide().await
        })
        .await;
    }

    async fn decide(self: Arc<Self>) {
        if self.invocation.is_failed() {
            self.invocation
                .discard(Step::Decide.name(), "invocation already finished");
            return;
        }
        self.invocation.advance(InvocationState::Deciding);

        let scores = self
            .credit
            .take()
            .and_then(|credit| Ok((credit, self.health.take()?)));
        let result = match scores {
            Ok((credit, health)) => {
                self.call(
                    Step::Decide,
                    self.config.decision_timeout(),
                    self.services.decide(&credit, &health),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(coverage) => {
                self.invocation.complete(coverage);
            }
            Err(e) => {
                self.invocation.fail(e);
            }
        }
    }

    /// Run one external step under its deadline
    async fn call<T, F>(&self, step: Step, timeout: Option<Duration>, operation: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.invocation.emit(FlowEvent::StepStarted { step });
        let started = Instant::now();

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, operation).await {
                Ok(result) => result.map_err(|e| step.error(e)),
                Err(_) => Err(FlowError::timeout(step.name(), limit.as_millis() as u64)),
            },
            None => operation.await.map_err(|e| step.error(e)),
        };

        self.invocation.emit(FlowEvent::StepCompleted {
            step,
            success: result.is_ok(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        result
    }

    /// Publish a step result into its slot and arrive at the join that
    /// guards the consumer. Returns the release if this arrival was last.
    ///
    /// A failure fails the invocation before arriving, so whoever observes
    /// the release already sees the invocation as failed.
    fn publish<T>(
        &self,
        step: Step,
        slot: &ResultSlot<T>,
        join: &JoinBarrier,
        result: Result<T>,
    ) -> Option<Release> {
        let arrival = match result {
            Ok(value) => {
                if self.invocation.is_failed() {
                    self.invocation
                        .discard(step.name(), "invocation already finished");
                }
                match slot.put(value) {
                    Ok(()) => join.arrive(),
                    Err(misuse) => {
                        self.invocation.fail(misuse);
                        join.arrive_failed()
                    }
                }
            }
            Err(e) => {
                if let Err(misuse) = slot.fail(&e) {
                    error!("Invocation {}: {}", self.invocation.id(), misuse);
                }
                self.invocation.fail(e);
                join.arrive_failed()
            }
        };

        match arrival {
            Ok(Arrival::Released(release)) => Some(release),
            Ok(Arrival::Pending { .. }) => None,
            Err(misuse) => {
                self.invocation.fail(misuse);
                None
            }
        }
    }

    /// Settle a step that will not run so its join still releases
    fn skip<T>(&self, step: Step, slot: &ResultSlot<T>, join: &JoinBarrier) -> Option<Release> {
        let skipped = FlowError::cancelled(step.name()).with_reason("upstream failed");
        if let Err(misuse) = slot.fail(&skipped) {
            debug!("Invocation {}: {}", self.invocation.id(), misuse);
        }
        match join.arrive_failed() {
            Ok(Arrival::Released(release)) => Some(release),
            Ok(Arrival::Pending { .. }) => None,
            Err(misuse) => {
                debug!("Invocation {}: {}", self.invocation.id(), misuse);
                None
            }
        }
    }

    /// Fail the invocation on behalf of a step that never finished and
    /// settle every join downstream of it
    fn abandon(&self, step: Step, error: FlowError) {
        self.invocation.fail(error);
        match step {
            Step::FetchAssets => self.abandon_credit_input(step, &self.assets),
            Step::FetchLiabilities => self.abandon_credit_input(step, &self.liabilities),
            Step::FetchHealthHistory | Step::ScoreHealth => {
                self.skip(step, &self.health, &self.scores);
            }
            Step::ScoreCredit => {
                self.skip(step, &self.credit, &self.scores);
            }
            Step::Decide => {}
        }
    }

    fn abandon_credit_input<T>(&self, step: Step, slot: &ResultSlot<T>) {
        if self.skip(step, slot, &self.credit_inputs).is_some() {
            self.skip(Step::ScoreCredit, &self.credit, &self.scores);
        }
    }

    async fn dispatch<F>(self: &Arc<Self>, dispatch: Dispatch, step: Step, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match dispatch {
            Dispatch::Inline => self.guard(step, work).await,
            Dispatch::Submit => self.submit(step, work),
        }
    }

    /// Hand a step to the execution facility. A rejected submission fails
    /// the invocation instead of leaving its joins unreleased.
    fn submit<F>(self: &Arc<Self>, step: Step, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = self.facility.submit(self.guard(step, work).boxed()) {
            error!(
                "Invocation {}: could not submit {}: {}",
                self.invocation.id(),
                step.name(),
                e
            );
            self.abandon(step, e);
        }
    }

    /// Wrap `work` so a panic inside it abandons `step` itself, whichever
    /// task it ends up running on
    fn guard<F>(self: &Arc<Self>, step: Step, work: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let flow = self.clone();
        async move {
            if AssertUnwindSafe(work).catch_unwind().await.is_err() {
                error!(
                    "Invocation {}: {} panicked",
                    flow.invocation.id(),
                    step.name()
                );
                flow.abandon(
                    step,
                    FlowError::cancelled(step.name()).with_reason("task panicked"),
                );
            }
        }
    }
}
