//! Prometheus metrics (§14 ambient stack), grounded in
//! `node/src/system_metrics.rs`'s gauge-registration pattern and
//! `node/src/main.rs`'s `/metrics` endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::time::Duration;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use sysinfo::{Pid, System};
use tracing::Instrument;

const PROCESS_METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Lightweight counters/gauges threaded through every participant actor.
/// Cloning is cheap (each metric type is an `Arc`-backed atomic internally).
#[derive(Clone)]
pub struct PipelineMetrics {
    pub messages_produced: Counter<u64, AtomicU64>,
    pub views_recorded: Counter<u64, AtomicU64>,
    pub users_dispatched: Counter<u64, AtomicU64>,
    pub policy_strikes: Counter<u64, AtomicU64>,
    pub policy_suspensions: Counter<u64, AtomicU64>,
    pub policy_terminations: Counter<u64, AtomicU64>,
    pub firehose_depth: Gauge<i64, AtomicI64>,
    pub global_inventory_depth: Gauge<i64, AtomicI64>,
    pub convergence_metric: Gauge<f64, AtomicU64>,
    pub process_rss_bytes: Gauge<i64, AtomicI64>,
    pub process_cpu_percent: Gauge<f64, AtomicU64>,
}

impl PipelineMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            messages_produced: Counter::default(),
            views_recorded: Counter::default(),
            users_dispatched: Counter::default(),
            policy_strikes: Counter::default(),
            policy_suspensions: Counter::default(),
            policy_terminations: Counter::default(),
            firehose_depth: Gauge::default(),
            global_inventory_depth: Gauge::default(),
            convergence_metric: Gauge::default(),
            process_rss_bytes: Gauge::default(),
            process_cpu_percent: Gauge::default(),
        };

        registry.register(
            "simsom_messages_produced",
            "Messages produced by Agent Workers.",
            metrics.messages_produced.clone(),
        );
        registry.register(
            "simsom_views_recorded",
            "Passive views recorded by Agent Workers.",
            metrics.views_recorded.clone(),
        );
        registry.register(
            "simsom_users_dispatched",
            "Users dispatched by the Data Manager.",
            metrics.users_dispatched.clone(),
        );
        registry.register(
            "simsom_policy_strikes",
            "Moderation strikes recorded by the Policy Evaluator.",
            metrics.policy_strikes.clone(),
        );
        registry.register(
            "simsom_policy_suspensions",
            "User suspensions issued by the Policy Evaluator.",
            metrics.policy_suspensions.clone(),
        );
        registry.register(
            "simsom_policy_terminations",
            "User terminations issued by the Policy Evaluator.",
            metrics.policy_terminations.clone(),
        );
        registry.register(
            "simsom_firehose_depth",
            "Current firehose buffer depth at the Data Manager.",
            metrics.firehose_depth.clone(),
        );
        registry.register(
            "simsom_global_inventory_depth",
            "Current global message inventory depth at the Recommender.",
            metrics.global_inventory_depth.clone(),
        );
        registry.register(
            "simsom_convergence_metric",
            "Latest convergence monitor sample (method-specific units).",
            metrics.convergence_metric.clone(),
        );
        registry.register(
            "simsom_process_rss_bytes",
            "Resident set size in bytes.",
            metrics.process_rss_bytes.clone(),
        );
        registry.register(
            "simsom_process_cpu_percent",
            "Process CPU usage percentage.",
            metrics.process_cpu_percent.clone(),
        );

        metrics
    }
}

/// Periodically samples this process's RSS/CPU into the registry, mirroring
/// `node/src/system_metrics.rs::spawn_process_metrics` with a plain
/// `tokio::spawn` in place of the teacher's runtime-context spawn.
pub fn spawn_process_metrics(metrics: PipelineMetrics) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            let pid = Pid::from_u32(std::process::id());
            let mut system = System::new();
            loop {
                system.refresh_cpu_usage();
                system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
                if let Some(process) = system.process(pid) {
                    metrics
                        .process_rss_bytes
                        .set(process.memory().saturating_mul(1024) as i64);
                    metrics.process_cpu_percent.set(process.cpu_usage() as f64);
                }
                tokio::time::sleep(PROCESS_METRICS_INTERVAL).await;
            }
        }
        .instrument(tracing::info_span!("system_metrics")),
    )
}
