//! Periodic sweep that detects step timeouts and recovers lost emissions.
//!
//! Nothing in the state machine waits on a timer. Every write stamps the
//! instance with a deadline: the current step's timeout once its command is
//! published, a short grace period while the publish is unconfirmed. The
//! sweep only loads instances whose deadline has passed, so long-running
//! steps never crowd out overdue ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use messaging::EventEmitter;
use saga_store::{SagaInstance, SagaQuery, SagaStatus, SagaStore};
use tokio::sync::watch;

use crate::{Orchestrator, Result};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Maximum instances loaded per query, least recently updated first.
    pub batch_size: usize,
    /// How long an instance may stay pending before it is started.
    pub pending_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            pending_timeout: Duration::from_secs(10),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub resumed: usize,
    pub redispatched: usize,
    pub timed_out: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Resume,
    Redispatch,
    TimeOut,
}

pub struct Reconciler<S, E> {
    orchestrator: Arc<Orchestrator<S, E>>,
    config: ReconcilerConfig,
}

impl<S, E> Reconciler<S, E>
where
    S: SagaStore,
    E: EventEmitter,
{
    pub fn new(orchestrator: Arc<Orchestrator<S, E>>, config: ReconcilerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Acts on every instance that is overdue as of `now`.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for instance in self.stale_pending(now).await? {
            report.scanned += 1;
            let outcome = self.orchestrator.resume_pending(&instance.saga_id).await;
            tally(&mut report, &instance, Action::Resume, outcome);
        }

        let due = self
            .orchestrator
            .list_sagas(
                SagaQuery::in_flight()
                    .due_before(now)
                    .limit(self.config.batch_size),
            )
            .await?;

        for instance in due {
            report.scanned += 1;
            let Some(record) = instance.in_flight() else {
                continue;
            };

            let key = &instance.saga_id;
            let index = instance.current_step_index;
            let (action, outcome) = if !record.dispatched {
                (Action::Redispatch, self.orchestrator.redispatch(key).await)
            } else if instance.status == SagaStatus::Compensating {
                (
                    Action::TimeOut,
                    self.orchestrator.handle_compensation_timeout(key, index).await,
                )
            } else {
                (
                    Action::TimeOut,
                    self.orchestrator.handle_step_timeout(key, index).await,
                )
            };
            tally(&mut report, &instance, action, outcome);
        }

        if report.resumed + report.redispatched + report.timed_out + report.errors > 0 {
            tracing::info!(?report, "reconciliation sweep finished");
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep(Utc::now()).await {
                        tracing::warn!(error = %err, "reconciliation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    async fn stale_pending(&self, now: DateTime<Utc>) -> Result<Vec<SagaInstance>> {
        let cutoff = chrono::Duration::from_std(self.config.pending_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout));
        let Some(cutoff) = cutoff else {
            return Ok(Vec::new());
        };

        self.orchestrator
            .list_sagas(
                SagaQuery::with_status(SagaStatus::Pending)
                    .updated_before(cutoff)
                    .limit(self.config.batch_size),
            )
            .await
    }
}

fn tally(
    report: &mut SweepReport,
    instance: &SagaInstance,
    action: Action,
    outcome: Result<SagaInstance>,
) {
    let key = &instance.saga_id;
    match outcome {
        Ok(_) => match action {
            Action::Resume => report.resumed += 1,
            Action::Redispatch => {
                report.redispatched += 1;
                metrics::counter!("reconciler_redispatches_total").increment(1);
            }
            Action::TimeOut => {
                report.timed_out += 1;
                metrics::counter!("reconciler_timeouts_total").increment(1);
                tracing::info!(
                    saga_id = %key,
                    step_index = instance.current_step_index,
                    status = %instance.status,
                    "step timed out"
                );
            }
        },
        // Raced with a result that arrived meanwhile.
        Err(err) if err.is_benign() => {}
        Err(err) => {
            report.errors += 1;
            tracing::warn!(saga_id = %key, error = %err, ?action, "reconciliation failed");
        }
    }
}
