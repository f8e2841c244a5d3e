//! Convergence loop.
//!
//! Each tick re-reads both record sets from the store, plans every desired
//! VM, dispatches the resulting commands to the agent on a bounded worker
//! pool and writes the outcome back to the observed set. Nothing is cached
//! between ticks.

pub mod planner;

pub use planner::{plan, Action, Decision};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::{AgentClient, CallContext};
use crate::error::{AgentError, ReconcileError, StoreError, StoreResult};
use crate::logging::OpTimer;
use crate::report::merge_observations;
use crate::store::StateStore;
use crate::vm::{RecordSet, VmRecord, VmState};

/// Tuning knobs for the loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between tick starts.
    pub interval: Duration,
    /// Deadline for each agent call.
    pub call_timeout: Duration,
    /// Maximum agent calls in flight within one tick.
    pub max_concurrency: usize,
    /// How long an observed `Requested`/`Provisioning` record may sit
    /// unchanged before the action is issued again.
    pub stall_after: Duration,
    /// Pull `fetch_state` from the agent at the start of every tick.
    pub refresh_from_agent: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            max_concurrency: 4,
            stall_after: Duration::from_secs(60),
            refresh_from_agent: false,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Desired records considered.
    pub examined: usize,
    pub in_sync: usize,
    pub in_progress: usize,
    /// Desired records whose observed state is already `Destroyed` while the
    /// operator asks for something else.
    pub terminal: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Desired records naming a state with no target.
    pub invalid: usize,
    /// Actions abandoned because the loop was stopped.
    pub cancelled: usize,
}

impl TickReport {
    /// Commands issued to the agent during the tick.
    pub fn dispatched(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Drives observed state toward desired state.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    agent: Arc<dyn AgentClient>,
    config: ReconcilerConfig,
    ticks: AtomicU64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        agent: Arc<dyn AgentClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            agent,
            config,
            ticks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one reconciliation tick.
    ///
    /// Agent failures are recorded on the affected VM and never fail the
    /// tick.
    ///
    /// # Errors
    ///
    /// `ReconcileError::Store` when the store fails. A failed read aborts
    /// the tick before anything is dispatched; a failed write stops further
    /// dispatch and lets in-flight VMs finish first.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, ReconcileError> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let span = tracing::info_span!("reconcile_tick", tick);
        self.run_tick(cancel).instrument(span).await
    }

    async fn run_tick(&self, cancel: &CancellationToken) -> Result<TickReport, ReconcileError> {
        let timer = OpTimer::new("reconciler", "tick");

        if self.config.refresh_from_agent {
            self.refresh_from_agent(cancel).await?;
        }

        let desired = self.store.list(RecordSet::Desired, cancel).await?;
        let mut observed: HashMap<String, VmRecord> = self
            .store
            .list(RecordSet::Observed, cancel)
            .await?
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();

        let now = Utc::now();
        let mut report = TickReport {
            examined: desired.len(),
            ..TickReport::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let store_failed = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        for desired in desired {
            if store_failed.load(Ordering::SeqCst) || cancel.is_cancelled() {
                break;
            }

            let current = observed.remove(&desired.name);
            let action = match plan(&desired, current.as_ref(), now, self.config.stall_after) {
                Decision::InSync => {
                    report.in_sync += 1;
                    continue;
                }
                Decision::InProgress => {
                    tracing::debug!(vm = %desired.name, "Previous action still in progress");
                    report.in_progress += 1;
                    continue;
                }
                Decision::Terminal => {
                    tracing::warn!(
                        vm = %desired.name,
                        desired = %desired.state,
                        "VM is destroyed; prune its observed record before reusing the name"
                    );
                    report.terminal += 1;
                    continue;
                }
                Decision::Invalid(state) => {
                    let err = ReconcileError::InvalidDesiredState {
                        name: desired.name.clone(),
                        state,
                    };
                    tracing::warn!(vm = %desired.name, error = %err, "Skipping VM");
                    report.invalid += 1;
                    continue;
                }
                Decision::Act(action) => action,
            };

            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                },
            };
            // A worker may have failed a write while this one waited
            if store_failed.load(Ordering::SeqCst) {
                break;
            }

            let store = Arc::clone(&self.store);
            let agent = Arc::clone(&self.agent);
            let ctx = CallContext::new(self.config.call_timeout, cancel.clone());
            let store_failed = Arc::clone(&store_failed);
            let span = tracing::info_span!("converge", vm = %desired.name, action = action.kind());

            workers.spawn(
                async move {
                    let _permit = permit;
                    let result =
                        converge_one(store.as_ref(), agent.as_ref(), &ctx, &desired, current, &action)
                            .await;
                    if result.is_err() {
                        store_failed.store(true, Ordering::SeqCst);
                    }
                    result
                }
                .instrument(span),
            );
        }

        let mut store_error: Option<StoreError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(Outcome::Succeeded)) => report.succeeded += 1,
                Ok(Ok(Outcome::Failed)) => report.failed += 1,
                Ok(Ok(Outcome::Cancelled)) => report.cancelled += 1,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Write-back failed");
                    store_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "VM worker panicked");
                    report.failed += 1;
                }
            }
        }

        if let Some(e) = store_error {
            timer.finish_with_result::<(), _>(Err(&e));
            return Err(e.into());
        }

        tracing::info!(
            examined = report.examined,
            in_sync = report.in_sync,
            in_progress = report.in_progress,
            terminal = report.terminal,
            succeeded = report.succeeded,
            failed = report.failed,
            invalid = report.invalid,
            cancelled = report.cancelled,
            "Reconciliation tick complete"
        );
        timer.finish();
        Ok(report)
    }

    /// Merge the agent's own view into the observed set. An agent failure
    /// only costs freshness; the tick goes on with what is stored.
    async fn refresh_from_agent(&self, cancel: &CancellationToken) -> StoreResult<()> {
        let ctx = CallContext::new(self.config.call_timeout, cancel.clone());
        match self.agent.fetch_state(&ctx).await {
            Ok(vms) => {
                let summary =
                    merge_observations(self.store.as_ref(), &vms, Utc::now(), cancel).await?;
                tracing::debug!(
                    merged = summary.merged,
                    stale = summary.stale,
                    skipped = summary.skipped,
                    "Observed state refreshed from agent"
                );
            }
            Err(AgentError::Cancelled) => return Err(StoreError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh state from agent; using stored view");
            }
        }
        Ok(())
    }

    /// Tick on `config.interval` until `cancel` fires.
    ///
    /// Ticks run inline, so a slow tick delays the next one instead of
    /// overlapping it; missed timer slots are skipped. Cancelling aborts
    /// in-flight agent calls, waits for the current tick to unwind and
    /// returns.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = self.config.interval.as_millis(),
            call_timeout_ms = self.config.call_timeout.as_millis(),
            max_concurrency = self.config.max_concurrency,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(&cancel).await {
                Ok(_) => {}
                Err(ReconcileError::Store(StoreError::Cancelled)) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Reconciliation tick aborted; retrying next tick");
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }

    /// Run the loop on a background task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

/// Issue one action and record its outcome.
///
/// A create is preceded by a `Provisioning` marker so a crash mid-call is
/// later picked up by the stall rule. A cancelled call writes nothing.
async fn converge_one(
    store: &dyn StateStore,
    agent: &dyn AgentClient,
    ctx: &CallContext,
    desired: &VmRecord,
    observed: Option<VmRecord>,
    action: &Action,
) -> StoreResult<Outcome> {
    if matches!(action, Action::Create(_)) {
        let previous_error = observed.and_then(|o| o.last_error);
        store
            .put(
                RecordSet::Observed,
                desired.observed_as(VmState::Provisioning, previous_error),
            )
            .await?;
    }

    let result = match action {
        Action::Create(spec) => agent.create_vm(spec, ctx).await,
        Action::Stop(name) => agent.stop_vm(name, ctx).await,
        Action::Destroy(name) => agent.destroy_vm(name, ctx).await,
    };

    match result {
        Ok(ack) => {
            let state = action.expected_state();
            store
                .put(RecordSet::Observed, desired.observed_as(state, None))
                .await?;
            tracing::info!(state = %state, message = %ack.message, "Action succeeded");
            Ok(Outcome::Succeeded)
        }
        Err(AgentError::Cancelled) => {
            tracing::info!("Action cancelled");
            Ok(Outcome::Cancelled)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Action failed");
            store
                .put(
                    RecordSet::Observed,
                    desired.observed_as(VmState::Failed, Some(e.to_string())),
                )
                .await?;
            Ok(Outcome::Failed)
        }
    }
}
