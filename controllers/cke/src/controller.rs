//! Leader loop.
//!
//! The `Controller` campaigns for leadership and, while it holds it, runs
//! ticks: read the cluster document and resources, probe, plan, execute at
//! most one plan, truncate old records. Between ticks it waits for the
//! interval, a store wake, the certificate GC timer, shutdown or loss of
//! the session, whichever comes first.

use crate::backoff::FibonacciBackoff;
use crate::config::Settings;
use crate::error::{ControllerError, ErrorKind};
use crate::executor::{Executor, Outcome};
use crate::infrastructure::Infrastructure;
use crate::metrics::Metrics;
use crate::operators::{CertsGcOperator, Operator};
use crate::planner::{Decision, Planner};
use crate::prober::Prober;
use crate::storage::Storage;
use crate::watcher::{self, Wake};
use kv_client::{Election, KvError, LeaderKey, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First step of the backoff after a failed tick or term
const BACKOFF_STEP: Duration = Duration::from_secs(1);

/// What one tick did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Operator that produced the executed plan
    pub operator: Option<&'static str>,
    /// Name of the executed plan
    pub operation: Option<String>,
    /// How the executed plan ended
    pub outcome: Option<Outcome>,
    /// Whether the certificate GC check was consumed by this tick
    pub gc_checked: bool,
    /// No cluster document was stored
    pub idle: bool,
}

impl TickReport {
    /// The tick ran a plan that did not complete
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Failed(_) | Outcome::Cancelled))
    }

    fn label(&self) -> &'static str {
        match &self.outcome {
            Some(outcome) => outcome.as_str(),
            None if self.idle => "idle",
            None => "converged",
        }
    }
}

/// Cluster lifecycle controller.
pub struct Controller {
    storage: Arc<Storage>,
    settings: Settings,
    prober: Prober,
    planner: Planner,
    executor: Arc<Executor>,
    metrics: Metrics,
    /// Value published under the election key
    name: String,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("planner", &self.planner)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller over `infra` with the default operator registry
    pub fn new(infra: Arc<dyn Infrastructure>, settings: Settings, metrics: Metrics, name: impl Into<String>) -> Self {
        Self::with_planner(infra, settings, metrics, name, Planner::default())
    }

    /// Creates a controller with an explicit planner
    pub fn with_planner(
        infra: Arc<dyn Infrastructure>,
        settings: Settings,
        metrics: Metrics,
        name: impl Into<String>,
        planner: Planner,
    ) -> Self {
        let name = name.into();
        info!("Initializing CKE controller {}", name);
        let prober = Prober::new(Arc::clone(&infra), settings.max_parallelism, settings.probe_timeout);
        let executor = Arc::new(Executor::new(
            Arc::clone(&infra),
            metrics.clone(),
            settings.command_timeout,
            settings.max_parallelism,
        ));
        Self {
            storage: infra.storage(),
            settings,
            prober,
            planner,
            executor,
            metrics,
            name,
        }
    }

    /// Executor handle, used by the HTTP surface to cancel a running operation
    pub fn executor(&self) -> Arc<Executor> {
        Arc::clone(&self.executor)
    }

    /// Runs until `cancel` fires.
    ///
    /// Each iteration is one leadership term: campaign, lead, step down.
    /// A term that ends in error is retried after a backoff.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting CKE controller");
        let watch_cancel = cancel.child_token();
        let (mut wakes, watchers) = watcher::spawn(Arc::clone(&self.storage), watch_cancel.clone());

        let mut backoff = FibonacciBackoff::new(BACKOFF_STEP, self.settings.interval);
        while !cancel.is_cancelled() {
            match self.lead(&mut wakes, &cancel).await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    let wait = backoff.next_backoff();
                    warn!("Leadership term ended: {}; retrying in {:?}", e, wait);
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        watch_cancel.cancel();
        for handle in watchers {
            if let Err(e) = handle.await {
                warn!("Watcher task failed: {}", e);
            }
        }
        info!("CKE controller stopped");
        Ok(())
    }

    /// One leadership term
    async fn lead(&self, wakes: &mut mpsc::Receiver<Wake>, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let session = Session::new(self.storage.client(), self.settings.session_ttl).await?;
        let election = Election::new(self.storage.client(), self.storage.leader_prefix());

        info!("Campaigning for leadership as {} (session {})", self.name, session.id());
        let leader = match election.campaign(&session, &self.name, cancel).await {
            Ok(leader) => leader,
            Err(KvError::Cancelled) => {
                close_session(session).await;
                return Ok(());
            }
            Err(e) => {
                close_session(session).await;
                return Err(e.into());
            }
        };
        info!("Elected leader (session {})", session.id());
        self.metrics.set_leader(true);

        let result = match self.cancel_orphans(&leader).await {
            Ok(()) => self.term(&session, &leader, wakes, cancel).await,
            Err(e) => Err(e),
        };

        self.metrics.set_leader(false);
        if session.is_alive() {
            if let Err(e) = election.resign(&leader).await {
                warn!("Failed to resign leadership: {}", e);
            } else {
                info!("Resigned leadership");
            }
        }
        close_session(session).await;
        result
    }

    /// Close records left running by previous leaders
    async fn cancel_orphans(&self, leader: &LeaderKey) -> Result<(), ControllerError> {
        let cancelled = self.executor.cancel_stale(leader).await?;
        if cancelled > 0 {
            info!("Cancelled {} orphaned operations", cancelled);
        }
        Ok(())
    }

    /// Tick until shutdown or loss of leadership
    async fn term(
        &self,
        session: &Session,
        leader: &LeaderKey,
        wakes: &mut mpsc::Receiver<Wake>,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let lost = session.lost();
        let gc_period = self.settings.certs_gc_interval;
        let mut gc_timer = tokio::time::interval_at(Instant::now() + gc_period, gc_period);
        gc_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gc_due = false;
        let mut failures: u32 = 0;
        let mut wakes_open = true;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if lost.is_cancelled() || !session.is_alive() {
                return Err(ControllerError::LeadershipLost);
            }

            // Wakes queued before this tick are covered by it.
            while wakes.try_recv().is_ok() {}

            let succeeded = match self.tick(session, leader, gc_due, cancel).await {
                Ok(report) => {
                    if report.gc_checked {
                        gc_due = false;
                    }
                    !report.is_failure()
                }
                Err(e) => match e.kind() {
                    ErrorKind::LeadershipLost => return Err(e),
                    ErrorKind::Cancelled if cancel.is_cancelled() => return Ok(()),
                    _ => {
                        error!("Tick failed: {}", e);
                        false
                    }
                },
            };

            let wait = if succeeded {
                failures = 0;
                self.settings.interval
            } else {
                failures = failures.saturating_add(1);
                FibonacciBackoff::calculate_for_error_count(failures, BACKOFF_STEP, self.settings.interval)
            };
            debug!("Next tick in at most {:?}", wait);

            let until = Instant::now() + wait;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = lost.cancelled() => return Err(ControllerError::LeadershipLost),
                    () = tokio::time::sleep_until(until) => break,
                    _ = gc_timer.tick() => {
                        gc_due = true;
                        break;
                    }
                    wake = wakes.recv(), if wakes_open => match wake {
                        Some(Wake::Cluster) => {
                            debug!("Cluster changed, ticking early");
                            break;
                        }
                        // Record changes drive the next step only after a clean tick.
                        Some(Wake::Records) if succeeded => break,
                        Some(Wake::Records) => {}
                        None => wakes_open = false,
                    },
                }
            }
        }
    }

    /// Run one tick as the holder of `leader`
    pub(crate) async fn tick(
        &self,
        session: &Session,
        leader: &LeaderKey,
        gc_due: bool,
        cancel: &CancellationToken,
    ) -> Result<TickReport, ControllerError> {
        let started = Instant::now();
        let result = self.tick_inner(session, leader, gc_due, cancel, started).await;
        match &result {
            Ok(report) => self.metrics.tick_finished(report.label(), started.elapsed()),
            Err(e) => self.metrics.tick_finished(e.kind().as_str(), started.elapsed()),
        }
        result
    }

    async fn tick_inner(
        &self,
        session: &Session,
        leader: &LeaderKey,
        gc_due: bool,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<TickReport, ControllerError> {
        let deadline = started + self.settings.tick_timeout;

        let Some((cluster, revision)) = self.storage.get_cluster().await? else {
            debug!("No cluster configured");
            return Ok(TickReport {
                idle: true,
                ..TickReport::default()
            });
        };
        cluster.validate()?;
        let resources = self.storage.resources().await?;
        debug!("Tick on cluster {} at revision {}", cluster.name, revision);

        let status = self.prober.probe(&cluster, &resources, cancel).await?;
        self.metrics.observe_status(&status, status.probed_at);

        let mut report = TickReport {
            gc_checked: gc_due,
            ..TickReport::default()
        };
        let gc = if gc_due {
            CertsGcOperator
                .next_commands(&cluster, &status, &resources)
                .map(|plan| Decision {
                    operator: CertsGcOperator.name(),
                    plan,
                })
        } else {
            None
        };
        let Some(decision) = gc.or_else(|| self.planner.plan(&cluster, &status, &resources)) else {
            debug!("Cluster {} is converged", cluster.name);
            return Ok(report);
        };

        info!("Operator {} planned {}", decision.operator, decision.plan.name);
        self.metrics.set_last_operator(decision.operator);
        let execution = self
            .executor
            .execute(&decision.plan, decision.operator, session, leader, deadline, cancel)
            .await?;
        if execution.outcome == Outcome::LeadershipLost {
            return Err(ControllerError::LeadershipLost);
        }
        report.operator = Some(decision.operator);
        report.operation = Some(decision.plan.name.clone());
        report.outcome = Some(execution.outcome);

        let retention = self.settings.records_retention;
        let deleted = self.storage.truncate_records(retention, leader).await?;
        if deleted > 0 {
            debug!("Truncated {} old records", deleted);
        }
        let kept = self.storage.records(retention).await?.len();
        self.metrics.set_records(kept);

        Ok(report)
    }
}

async fn close_session(session: Session) {
    if let Err(e) = session.close().await {
        debug!("Failed to close session: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Command, RunContext};
    use crate::error::CommandError;
    use crate::operators::Plan;
    use crate::test_utils::{SimulatedCluster, elect, sample_cluster};
    use cluster_model::{Cluster, ClusterStatus, CommandDescriptor, Record, RecordStatus, Resources};

    /// Blocks until its run is cancelled
    #[derive(Debug)]
    struct Hang;

    #[async_trait::async_trait]
    impl Command for Hang {
        fn descriptor(&self) -> CommandDescriptor {
            CommandDescriptor::new("hang", "")
        }

        async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
            ctx.cancel.cancelled().await;
            Err(CommandError::Cancelled)
        }
    }

    #[derive(Debug)]
    struct AlwaysHang;

    impl Operator for AlwaysHang {
        fn name(&self) -> &'static str {
            "always-hang"
        }

        fn priority(&self) -> u32 {
            0
        }

        fn next_commands(&self, _cluster: &Cluster, _status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
            Some(Plan::new("hang", vec![Arc::new(Hang) as Arc<dyn Command>]))
        }
    }

    fn fast_settings() -> Settings {
        Settings {
            interval: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
            tick_timeout: Duration::from_secs(30),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_tick_without_cluster_is_idle() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::unconfigured(&cluster).await;
        let controller = Controller::new(sim.infra(), fast_settings(), Metrics::new().unwrap(), "test");
        let (session, leader) = elect(&sim.storage).await;

        let report = controller
            .tick(&session, &leader, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.outcome.is_none());
        assert_eq!(report.label(), "idle");
        assert!(sim.storage.records(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_runs_one_plan() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        let metrics = Metrics::new().unwrap();
        let controller = Controller::new(sim.infra(), fast_settings(), metrics.clone(), "test");
        let (session, leader) = elect(&sim.storage).await;

        let report = controller
            .tick(&session, &leader, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.operator, Some("ca-bootstrap"));
        assert_eq!(report.outcome, Some(Outcome::Completed));
        assert_eq!(metrics.outcome_count("completed"), 1);

        let records = sim.storage.records(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Completed);
        assert_eq!(records[0].leader, session.id());
    }

    #[tokio::test]
    async fn test_new_leader_cancels_orphan_records() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        let (old_session, old_leader) = elect(&sim.storage).await;
        let orphan = sim
            .storage
            .append_record(
                Record::new("etcd-bootstrap", vec![], old_session.id(), chrono::Utc::now()),
                &old_leader,
            )
            .await
            .unwrap();
        sim.kv.expire_lease(old_session.lease_id());

        let controller = Controller::new(sim.infra(), fast_settings(), Metrics::new().unwrap(), "test");
        let (_session, leader) = elect(&sim.storage).await;
        controller.cancel_orphans(&leader).await.unwrap();

        let record = sim.storage.record(orphan.id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Cancelled);
        assert!(sim.storage.running_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_elects_and_stops_on_cancel() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        let metrics = Metrics::new().unwrap();
        let controller = Arc::new(Controller::new(sim.infra(), fast_settings(), metrics.clone(), "cke-1"));
        let cancel = CancellationToken::new();

        let handle = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while metrics.ticks() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(metrics.ticks() > 0);
        assert_eq!(sim.storage.leader().await.unwrap().as_deref(), Some("cke-1"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sim.storage.leader().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_the_running_operation() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        let controller = Arc::new(Controller::with_planner(
            sim.infra(),
            fast_settings(),
            Metrics::new().unwrap(),
            "cke-1",
            Planner::new(vec![Box::new(AlwaysHang)]),
        ));
        let cancel = CancellationToken::new();
        let handle = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while sim.storage.running_records().await.unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sim.storage.running_records().await.unwrap().len(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let records = sim.storage.records(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, "hang");
        assert_eq!(records[0].status, RecordStatus::Cancelled);
        assert_eq!(sim.storage.leader().await.unwrap(), None);
    }
}
