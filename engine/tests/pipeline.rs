//! End-to-end pipeline tests: spins up a full [`Engine`] over a small,
//! seeded population and drives it to completion. Complements the
//! per-module unit tests inside `src/`, which cover each participant's
//! algorithm in isolation; these exercise the wiring between them (§8's
//! seeded end-to-end scenarios).

use std::num::NonZeroUsize;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use simsom_engine::config::{ConvergenceMethod, ValidatedNetworkConfig, ValidatedSimulatorConfig};
use simsom_engine::engine::{Engine, EngineConfig, EngineError};
use simsom_engine::network::build_population;

fn network_config(net_size: usize) -> ValidatedNetworkConfig {
    ValidatedNetworkConfig {
        from_file: false,
        real_world_network: None,
        net_size: NonZeroUsize::new(net_size).unwrap(),
        probability_follow: 0.5,
        avg_n_friend: 3,
    }
}

/// A day-count target of `0.0` converges as soon as the first timestamped
/// message is observed, so these tests finish in well under the default
/// probe timeout without racing the clock.
fn fast_converging_simulator_config() -> ValidatedSimulatorConfig {
    ValidatedSimulatorConfig {
        data_manager_batchsize: 4,
        convergence_method: ConvergenceMethod::DayCount,
        target_days: 0.0,
        sliding_window_size: 50,
        sliding_window_threshold: 0.05,
        ema_quality_convergence: 0.05,
        log_level: tracing::Level::WARN,
        print_interval: 100,
        save_active_interactions: true,
        save_passive_interactions: true,
        probe_timeout: Duration::from_millis(200),
        send_high_water_mark: 50,
        worker_batch_threshold: 4,
        firehose_high_water: 500,
        firehose_low_water: 250,
        global_inventory_high_water: 500,
        global_inventory_low_water: 250,
        strike_window_days: 0.1,
        markov_p_active_to_active: 0.6,
        markov_p_dormant_to_active: 0.3,
        lurker_fraction: 0.3,
        n_topics: 10,
        p_in: 0.5,
        p_out: 0.5,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pipeline_converges_and_persists_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let users = build_population(&network_config(20), 10, (2.0, 4.0), &mut rng).unwrap();

    let engine_cfg = EngineConfig {
        num_workers: 2,
        output_dir: dir.path().to_path_buf(),
        seed: 7,
    };
    let engine = Engine::new(engine_cfg, fast_converging_simulator_config()).unwrap();

    let result = engine.run(users).await;
    assert!(result.is_ok(), "pipeline run failed: {result:?}");
    assert!(dir.path().join("activities.csv").exists());
    assert!(dir.path().join("passivities.csv").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn single_worker_run_also_converges() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let users = build_population(&network_config(12), 10, (2.0, 4.0), &mut rng).unwrap();

    let engine_cfg = EngineConfig {
        num_workers: 1,
        output_dir: dir.path().to_path_buf(),
        seed: 11,
    };
    let engine = Engine::new(engine_cfg, fast_converging_simulator_config()).unwrap();

    let result = engine.run(users).await;
    assert!(result.is_ok(), "pipeline run failed: {result:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn sliding_window_convergence_also_completes_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let users = build_population(&network_config(16), 10, (2.0, 4.0), &mut rng).unwrap();

    let mut simulator = fast_converging_simulator_config();
    simulator.convergence_method = ConvergenceMethod::SlidingWindow;
    simulator.sliding_window_size = 2;
    simulator.sliding_window_threshold = 1.0;

    let engine_cfg = EngineConfig {
        num_workers: 2,
        output_dir: dir.path().to_path_buf(),
        seed: 13,
    };
    let engine = Engine::new(engine_cfg, simulator).unwrap();

    let result = engine.run(users).await;
    assert!(result.is_ok(), "pipeline run failed: {result:?}");
}

#[test]
fn engine_construction_rejects_zero_workers() {
    let engine_cfg = EngineConfig {
        num_workers: 0,
        output_dir: std::env::temp_dir(),
        seed: 0,
    };
    let result = Engine::new(engine_cfg, fast_converging_simulator_config());
    assert!(matches!(result, Err(EngineError::NoWorkers)));
}
