//! Top-level orchestration (§14): wires the six core participants plus N
//! Agent Workers as `tokio::task`s connected by bounded `tokio::sync::mpsc`
//! channels, then awaits whichever exits first via
//! `futures::future::select_all` — mirroring `node/src/engine.rs`'s
//! `NamedTask` + `select_all` shutdown pattern, with a plain `tokio::spawn`
//! in place of the teacher's custom runtime `Spawner`/`Handle`. Per spec.md
//! §5's "peer crash terminates the whole run" framing, there is no restart:
//! the first participant to exit (STOP-triggered or otherwise) causes every
//! other task to be aborted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use prometheus_client::registry::Registry;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tokio::sync::{mpsc, Barrier, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use simsom_types::{ActionGenerator, Envelope, ProtocolError, User};

use crate::activity::ActivityModel;
use crate::agent_pool_manager::{self, AgentPoolManagerConfig};
use crate::analyzer::{self, AnalyzerConfig};
use crate::config::ValidatedSimulatorConfig;
use crate::data_manager::{self, DataManagerConfig, DataManagerState};
use crate::messages::WorkerPayload;
use crate::metrics::PipelineMetrics;
use crate::policy_evaluator::{self, PolicyEvaluatorConfig};
use crate::protocol::StopSignal;
use crate::recommender::{self, GlobalInventory, RecommenderConfig};
use crate::worker;

/// Bound on every inter-participant mailbox, matching spec.md §5's "bounded
/// in-flight requests" framing. [`crate::protocol::Outbox`] is what makes a
/// full mailbox non-blocking for the sender.
const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("at least one agent worker is required")]
    NoWorkers,
    #[error("participant {name} failed: {source}")]
    ParticipantFailed {
        name: &'static str,
        #[source]
        source: ProtocolError,
    },
    #[error("participant {name} task panicked: {source}")]
    ParticipantPanicked {
        name: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

pub struct EngineConfig {
    pub num_workers: usize,
    pub output_dir: PathBuf,
    pub seed: u64,
}

/// Owns the registered [`PipelineMetrics`] and the `Registry` they were
/// registered into. `registry` is `Arc<Mutex<_>>` (rather than a bare
/// `Registry`) so a caller can clone the handle and serve it over an
/// optional `/metrics` endpoint concurrently with `run`, without the engine
/// knowing about axum.
pub struct Engine {
    pub metrics: PipelineMetrics,
    pub registry: Arc<Mutex<Registry>>,
    cfg: EngineConfig,
    simulator: ValidatedSimulatorConfig,
}

impl Engine {
    pub fn new(cfg: EngineConfig, simulator: ValidatedSimulatorConfig) -> Result<Self, EngineError> {
        if cfg.num_workers == 0 {
            return Err(EngineError::NoWorkers);
        }
        let mut registry = Registry::default();
        let metrics = PipelineMetrics::new(&mut registry);
        Ok(Self {
            metrics,
            registry: Arc::new(Mutex::new(registry)),
            cfg,
            simulator,
        })
    }

    /// Builds every mailbox, spawns every participant, and runs the pipeline
    /// to completion (convergence, quiescence escalation, or a protocol
    /// fault — all surfaced identically per spec.md §7's uniform-STOP
    /// propagation policy).
    pub async fn run(&self, users: Vec<User>) -> Result<(), EngineError> {
        let metrics = self.metrics.clone();
        let cfg = &self.cfg;
        let simulator = &self.simulator;

        let stop = StopSignal::new();
        let barrier = Arc::new(Barrier::new(5 + cfg.num_workers));
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);

        let (data_manager_tx, data_manager_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (recommender_tx, recommender_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (pool_manager_tx, pool_manager_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (policy_eval_tx, policy_eval_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (analyzer_tx, analyzer_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let mut worker_txs = Vec::with_capacity(cfg.num_workers);
        let mut worker_rxs = Vec::with_capacity(cfg.num_workers);
        for _ in 0..cfg.num_workers {
            let (tx, rx) = mpsc::channel::<Envelope<WorkerPayload>>(MAILBOX_CAPACITY);
            worker_txs.push(tx);
            worker_rxs.push(rx);
        }

        let population_size = users.len();
        let activity = ActivityModel::markov(
            simulator.markov_p_active_to_active,
            simulator.markov_p_dormant_to_active,
        );
        let dm_cfg = DataManagerConfig {
            batch_size: simulator.data_manager_batchsize,
            firehose_high_water: simulator.firehose_high_water,
            firehose_low_water: simulator.firehose_low_water,
            lurker_fraction: simulator.lurker_fraction,
            probe_timeout: simulator.probe_timeout,
            send_high_water_mark: simulator.send_high_water_mark,
        };
        let dm_state = DataManagerState::new(users, activity, &dm_cfg, &mut rng);

        let mut names: Vec<&'static str> = Vec::with_capacity(5 + cfg.num_workers);
        let mut handles: Vec<JoinHandle<Result<(), ProtocolError>>> =
            Vec::with_capacity(5 + cfg.num_workers);

        names.push("data_manager");
        handles.push(tokio::spawn(data_manager::run(
            dm_state,
            data_manager_rx,
            recommender_tx.clone(),
            stop.clone(),
            barrier.clone(),
            simulator.probe_timeout,
            simulator.send_high_water_mark,
            metrics.clone(),
            ChaCha8Rng::seed_from_u64(cfg.seed.wrapping_add(1)),
        )));

        let recommender_cfg = RecommenderConfig {
            global_inventory_high_water: simulator.global_inventory_high_water,
            global_inventory_low_water: simulator.global_inventory_low_water,
            p_in: simulator.p_in,
            p_out: simulator.p_out,
            probe_timeout: simulator.probe_timeout,
            send_high_water_mark: simulator.send_high_water_mark,
            filter_shadow_authors: true,
        };
        let inventory = GlobalInventory::new(
            simulator.global_inventory_high_water,
            simulator.global_inventory_low_water,
        );
        names.push("recommender");
        handles.push(tokio::spawn(recommender::run(
            inventory,
            recommender_rx,
            data_manager_tx.clone(),
            analyzer_tx.clone(),
            pool_manager_tx.clone(),
            stop.clone(),
            barrier.clone(),
            recommender_cfg,
            metrics.clone(),
        )));

        names.push("agent_pool_manager");
        handles.push(tokio::spawn(agent_pool_manager::run(
            pool_manager_rx,
            recommender_tx.clone(),
            worker_txs.clone(),
            stop.clone(),
            barrier.clone(),
            AgentPoolManagerConfig {
                probe_timeout: simulator.probe_timeout,
                send_high_water_mark: simulator.send_high_water_mark,
            },
            ChaCha8Rng::seed_from_u64(cfg.seed.wrapping_add(2)),
        )));

        names.push("policy_evaluator");
        handles.push(tokio::spawn(policy_evaluator::run(
            policy_eval_rx,
            data_manager_tx.clone(),
            stop.clone(),
            barrier.clone(),
            PolicyEvaluatorConfig {
                strike_window_days: simulator.strike_window_days,
                probe_timeout: simulator.probe_timeout,
                send_high_water_mark: simulator.send_high_water_mark,
            },
            metrics.clone(),
        )));

        names.push("analyzer");
        handles.push(tokio::spawn(analyzer::run(
            analyzer_rx,
            stop.clone(),
            barrier.clone(),
            cfg.output_dir.clone(),
            AnalyzerConfig {
                convergence_method: simulator.convergence_method,
                target_days: simulator.target_days,
                sliding_window_size: simulator.sliding_window_size,
                sliding_window_threshold: simulator.sliding_window_threshold,
                ema_quality_convergence: simulator.ema_quality_convergence,
                ema_user_batch: population_size,
                save_active_interactions: simulator.save_active_interactions,
                save_passive_interactions: simulator.save_passive_interactions,
                probe_timeout: simulator.probe_timeout,
                send_high_water_mark: simulator.send_high_water_mark,
            },
            metrics.clone(),
        )));

        for (rank, worker_rx) in worker_rxs.into_iter().enumerate() {
            let action_generator: Box<dyn ActionGenerator<ChaCha8Rng>> =
                Box::new(simsom_types::DefaultActionGenerator::default());
            names.push("agent_worker");
            handles.push(tokio::spawn(worker::run(
                worker_rx,
                data_manager_tx.clone(),
                policy_eval_tx.clone(),
                stop.clone(),
                barrier.clone(),
                worker::WorkerConfig {
                    rank,
                    num_workers: cfg.num_workers,
                    batch_threshold: simulator.worker_batch_threshold,
                    probe_timeout: simulator.probe_timeout,
                    send_high_water_mark: simulator.send_high_water_mark,
                },
                action_generator,
                ChaCha8Rng::seed_from_u64(cfg.seed.wrapping_add(10 + rank as u64)),
            )));
        }
        drop(data_manager_tx);
        drop(recommender_tx);
        drop(pool_manager_tx);
        drop(policy_eval_tx);
        drop(analyzer_tx);
        drop(worker_txs);

        let (completed, index, remaining) = select_all(handles).await;
        for handle in &remaining {
            handle.abort();
        }
        // Give aborted tasks a moment to unwind past any in-progress await
        // point before the process that owns stdout/CSV handles moves on.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let name = names[index];
        match completed {
            Ok(Ok(())) => {
                info!(participant = name, "engine participant exited cleanly");
                Ok(())
            }
            Ok(Err(source)) => {
                warn!(participant = name, %source, "engine participant exited with a protocol error");
                Err(EngineError::ParticipantFailed { name, source })
            }
            Err(source) => {
                error!(participant = name, %source, "engine participant task panicked");
                Err(EngineError::ParticipantPanicked { name, source })
            }
        }
    }
}
