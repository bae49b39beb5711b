//! Executor
//!
//! Runs one plan as one operation record: the record is opened as
//! `running`, commands run strictly in order under a per-command deadline,
//! and the record is closed as `completed`, `error` or `cancelled`. Every
//! record write is guarded by the leader key, and nothing is written once
//! the session is lost.
//!
//! A close that keeps failing is retried a few times and then reported as
//! an error. Whatever record it left `running` is cancelled before the next
//! one is opened, so at most one record is ever running.

use crate::backoff::FibonacciBackoff;
use crate::commands::RunContext;
use crate::error::{CommandError, ControllerError};
use crate::infrastructure::Infrastructure;
use crate::metrics::Metrics;
use crate::operators::Plan;
use crate::storage::Storage;
use cluster_model::Record;
use kv_client::{LeaderKey, Session};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts at writing the closing state of a record
const CLOSE_ATTEMPTS: u32 = 4;

/// First wait between close attempts
const CLOSE_RETRY_STEP: Duration = Duration::from_millis(100);

/// How a plan ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every command succeeded
    Completed,
    /// A command failed; the message is stored in the record
    Failed(String),
    /// Shutdown or an admin cancel interrupted the run
    Cancelled,
    /// The session was lost; the record was left as it was
    LeadershipLost,
}

impl Outcome {
    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed(_) => "error",
            Outcome::Cancelled => "cancelled",
            Outcome::LeadershipLost => "leadership_lost",
        }
    }
}

/// Result of one execution
#[derive(Debug, Clone)]
pub struct Execution {
    /// Record as last written
    pub record: Record,
    pub outcome: Outcome,
}

/// Executes plans on behalf of the leader
pub struct Executor {
    storage: Arc<Storage>,
    infra: Arc<dyn Infrastructure>,
    metrics: Metrics,
    command_timeout: Duration,
    max_parallelism: usize,
    running: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("command_timeout", &self.command_timeout)
            .field("max_parallelism", &self.max_parallelism)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        infra: Arc<dyn Infrastructure>,
        metrics: Metrics,
        command_timeout: Duration,
        max_parallelism: usize,
    ) -> Self {
        Self {
            storage: infra.storage(),
            infra,
            metrics,
            command_timeout,
            max_parallelism,
            running: Mutex::new(None),
        }
    }

    fn set_running(&self, token: Option<CancellationToken>) {
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Cancel the plan in flight; returns whether one was running
    pub fn cancel_running(&self) -> bool {
        match self.running.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) => {
                info!("Cancelling the running operation on request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `plan` as a new operation record
    ///
    /// `deadline` is the end of the tick; each command gets the smaller of
    /// the command timeout and the time left. Errors are returned when the
    /// record could not be opened or closed.
    pub async fn execute(
        &self,
        plan: &Plan,
        operator: &str,
        session: &Session,
        guard: &LeaderKey,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Execution, ControllerError> {
        if !session.is_alive() {
            return Err(ControllerError::LeadershipLost);
        }
        self.cancel_stale(guard).await?;
        let opened = Record::new(plan.name.clone(), plan.descriptors(), session.id(), self.infra.now());
        let record = self.storage.append_record(opened, guard).await?;
        info!("Operation {} started: {} ({} commands)", record.id, plan.name, plan.commands.len());

        let run = cancel.child_token();
        self.set_running(Some(run.clone()));
        let outcome = self.run_commands(plan, session, guard, deadline, &run).await;
        self.set_running(None);

        let execution = self.close(record, outcome, session, guard).await?;
        match &execution.outcome {
            Outcome::Completed => info!("Operation {} completed: {}", execution.record.id, plan.name),
            Outcome::Failed(message) => {
                self.metrics.operator_failed(operator);
                error!("Operation {} failed: {}: {}", execution.record.id, plan.name, message);
            }
            Outcome::Cancelled => warn!("Operation {} cancelled: {}", execution.record.id, plan.name),
            Outcome::LeadershipLost => warn!("Leadership lost during operation {}", execution.record.id),
        }
        Ok(execution)
    }

    async fn run_commands(
        &self,
        plan: &Plan,
        session: &Session,
        guard: &LeaderKey,
        deadline: Instant,
        run: &CancellationToken,
    ) -> Outcome {
        let lost = session.lost();
        for command in &plan.commands {
            let descriptor = command.descriptor();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Outcome::Failed(format!("{}: tick deadline exceeded", descriptor.name));
            }
            let budget = self.command_timeout.min(remaining);

            let ctx = RunContext {
                infra: Arc::clone(&self.infra),
                cancel: run.child_token(),
                max_parallelism: self.max_parallelism,
                guard: guard.clone(),
            };
            debug!("Running {} on {}", descriptor.name, descriptor.target);

            let result = tokio::select! {
                () = lost.cancelled() => {
                    ctx.cancel.cancel();
                    return Outcome::LeadershipLost;
                }
                () = run.cancelled() => Err(CommandError::Cancelled),
                result = tokio::time::timeout(budget, command.run(&ctx)) => match result {
                    Ok(result) => result,
                    Err(_) => {
                        ctx.cancel.cancel();
                        Err(CommandError::Timeout(format!("{} after {:?}", descriptor.name, budget)))
                    }
                },
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_leadership_lost() => return Outcome::LeadershipLost,
                Err(e) if e.is_cancelled() => return Outcome::Cancelled,
                Err(e) => return Outcome::Failed(format!("{}: {}", descriptor.name, e)),
            }
        }
        Outcome::Completed
    }

    /// Cancel every record still `running`; returns how many were closed
    ///
    /// The leader runs one plan at a time, so a running record found here
    /// was left by a previous leader or by a close that failed.
    pub async fn cancel_stale(&self, guard: &LeaderKey) -> Result<usize, ControllerError> {
        let stale = self.storage.running_records().await?;
        for record in &stale {
            warn!(
                "Cancelling operation {} ({}) left running by session {}",
                record.id, record.operation, record.leader
            );
            let now = self.infra.now();
            self.storage.update_record(record.id, guard, |r| r.cancel(now)).await?;
        }
        Ok(stale.len())
    }

    async fn close(
        &self,
        record: Record,
        outcome: Outcome,
        session: &Session,
        guard: &LeaderKey,
    ) -> Result<Execution, ControllerError> {
        if outcome == Outcome::LeadershipLost || !session.is_alive() {
            return Ok(Execution {
                record,
                outcome: Outcome::LeadershipLost,
            });
        }

        let mut backoff = FibonacciBackoff::new(CLOSE_RETRY_STEP, CLOSE_RETRY_STEP * 8);
        let mut attempt = 1;
        loop {
            let now = self.infra.now();
            let closing = outcome.clone();
            let result = self
                .storage
                .update_record(record.id, guard, move |r| match closing {
                    Outcome::Completed => r.complete(now),
                    Outcome::Failed(message) => r.fail(message, now),
                    Outcome::Cancelled | Outcome::LeadershipLost => r.cancel(now),
                })
                .await;
            match result {
                Ok(record) => return Ok(Execution { record, outcome }),
                Err(ControllerError::LeadershipLost) => {
                    return Ok(Execution {
                        record,
                        outcome: Outcome::LeadershipLost,
                    });
                }
                Err(_) if !session.is_alive() => {
                    return Ok(Execution {
                        record,
                        outcome: Outcome::LeadershipLost,
                    });
                }
                Err(e) if attempt < CLOSE_ATTEMPTS => {
                    let wait = backoff.next_backoff();
                    warn!(
                        "Failed to close operation {} (attempt {}): {}; retrying in {:?}",
                        record.id, attempt, e, wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Failed to close operation {}: {}", record.id, e);
                    return Err(e);
                }
            }
        }
    }
}
