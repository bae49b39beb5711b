//! Prometheus metrics
//!
//! All collectors live in one `Registry` owned by `Metrics`, which is shared
//! by the leader loop, the executor and the HTTP surface.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use cluster_model::ClusterStatus;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Buckets of remaining certificate lifetime, one hour to one year
const EXPIRY_BUCKETS: &[f64] = &[
    3_600.0,
    21_600.0,
    86_400.0,
    604_800.0,
    2_592_000.0,
    7_776_000.0,
    15_552_000.0,
    31_536_000.0,
];

/// Controller metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    leader: Gauge,
    ticks_total: IntCounter,
    last_tick_duration: Gauge,
    last_operator: GaugeVec,
    tick_outcomes: IntCounterVec,
    operator_errors: IntCounterVec,
    records: Gauge,
    node_reachable: GaugeVec,
    certificate_expiry: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register every collector in a fresh registry
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let leader = Gauge::with_opts(Opts::new("cke_leader", "1 if this instance is the leader"))?;
        registry.register(Box::new(leader.clone()))?;

        let ticks_total = IntCounter::with_opts(Opts::new("cke_ticks_total", "Ticks run as leader"))?;
        registry.register(Box::new(ticks_total.clone()))?;

        let last_tick_duration = Gauge::with_opts(Opts::new(
            "cke_last_tick_duration_seconds",
            "Wall-clock duration of the last tick",
        ))?;
        registry.register(Box::new(last_tick_duration.clone()))?;

        let last_operator = GaugeVec::new(
            Opts::new("cke_last_operator", "1 for the operator that produced the last plan"),
            &["operator"],
        )?;
        registry.register(Box::new(last_operator.clone()))?;

        let tick_outcomes = IntCounterVec::new(
            Opts::new("cke_tick_outcomes_total", "Tick outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(tick_outcomes.clone()))?;

        let operator_errors = IntCounterVec::new(
            Opts::new("cke_operator_errors_total", "Failed operations by operator"),
            &["operator"],
        )?;
        registry.register(Box::new(operator_errors.clone()))?;

        let records = Gauge::with_opts(Opts::new("cke_records", "Operation records kept in the store"))?;
        registry.register(Box::new(records.clone()))?;

        let node_reachable = GaugeVec::new(
            Opts::new("cke_node_reachable", "1 if the last probe reached the node"),
            &["address"],
        )?;
        registry.register(Box::new(node_reachable.clone()))?;

        let certificate_expiry = Histogram::with_opts(
            HistogramOpts::new(
                "cke_certificate_expiry_seconds",
                "Remaining lifetime of live certificates at probe time",
            )
            .buckets(EXPIRY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(certificate_expiry.clone()))?;

        Ok(Self {
            registry,
            leader,
            ticks_total,
            last_tick_duration,
            last_operator,
            tick_outcomes,
            operator_errors,
            records,
            node_reachable,
            certificate_expiry,
        })
    }

    /// Leadership gained or lost
    pub fn set_leader(&self, leader: bool) {
        self.leader.set(if leader { 1.0 } else { 0.0 });
    }

    /// A tick finished with `outcome` after `elapsed`
    pub fn tick_finished(&self, outcome: &str, elapsed: Duration) {
        self.ticks_total.inc();
        self.last_tick_duration.set(elapsed.as_secs_f64());
        self.tick_outcomes.with_label_values(&[outcome]).inc();
    }

    /// The operator whose plan ran last
    pub fn set_last_operator(&self, operator: &str) {
        self.last_operator.reset();
        self.last_operator.with_label_values(&[operator]).set(1.0);
    }

    /// An operation of `operator` ended in error
    pub fn operator_failed(&self, operator: &str) {
        self.operator_errors.with_label_values(&[operator]).inc();
    }

    /// Records kept after truncation
    pub fn set_records(&self, count: usize) {
        self.records.set(count as f64);
    }

    /// Reachability and certificate lifetimes of a fresh status
    pub fn observe_status(&self, status: &ClusterStatus, now: DateTime<Utc>) {
        self.node_reachable.reset();
        for (address, node) in &status.nodes {
            self.node_reachable
                .with_label_values(&[address.as_str()])
                .set(if node.reachable { 1.0 } else { 0.0 });
        }
        for metadata in status.certificates.issued.values() {
            self.certificate_expiry
                .observe(metadata.remaining_seconds(now).max(0) as f64);
        }
    }

    /// Number of ticks counted so far
    pub fn ticks(&self) -> u64 {
        self.ticks_total.get()
    }

    /// Count of ticks that ended with `outcome`
    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.tick_outcomes.with_label_values(&[outcome]).get()
    }

    /// Count of failed operations of `operator`
    pub fn operator_error_count(&self, operator: &str) -> u64 {
        self.operator_errors.with_label_values(&[operator]).get()
    }

    /// Prometheus text exposition of every collector
    pub fn encode_text(&self) -> Result<String, ControllerError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Http(format!("metrics are not UTF-8: {e}")))
    }
}
