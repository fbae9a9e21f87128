//! CLI entry point (§14): loads a network spec and a simulator spec, builds
//! the user population, and runs the pipeline to completion. Argument
//! parsing follows `simulator/src/main.rs`'s plain `#[derive(Parser)]` +
//! `#[tokio::main]` shape; the optional `/metrics` endpoint follows
//! `node/src/main.rs`'s `spawn_metrics_server`/`metrics_handler` pair, scaled
//! down to an unauthenticated single-registry `GET /metrics` since this
//! binary has no multi-tenant deployment story to protect.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{body::Body, http::StatusCode, response::Response, routing::get, Router};
use clap::Parser;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use simsom_engine::config::{NetworkConfig, SimulatorConfig};
use simsom_engine::engine::{Engine, EngineConfig};
use simsom_engine::metrics::spawn_process_metrics;
use simsom_engine::network::build_population;

/// A day's span of possible mean-activity rates sampled per user
/// (`original_source/libs/simsom/user.py`'s default `mean_num_action_per_day`
/// range). Not spec-configurable: the network spec only carries graph shape.
const MEAN_ACTION_PER_DAY_RANGE: (f64, f64) = (2.0, 6.0);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a SimSoM agent simulation", long_about = None)]
struct Args {
    /// Path to a JSON network-generation config.
    #[arg(long)]
    network_spec: PathBuf,

    /// Path to a JSON simulator config.
    #[arg(long)]
    simulator_spec: PathBuf,

    /// Number of Agent Worker tasks to run.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Directory activities.csv/passivities.csv are written to.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// RNG seed; fixing it makes a run reproducible.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Bind an unauthenticated `/metrics` endpoint on this port (disabled
    /// when omitted).
    #[arg(long)]
    metrics_port: Option<u16>,
}

async fn metrics_handler(registry: Arc<Mutex<Registry>>) -> Result<Response<Body>, StatusCode> {
    let registry = registry.lock().await;
    let mut buffer = String::new();
    encode(&mut buffer, &registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .expect("failed to build metrics response"))
}

fn spawn_metrics_server(registry: Arc<Mutex<Registry>>, port: u16) {
    tokio::spawn(async move {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%err, "failed to bind metrics server");
                return;
            }
        };
        let app = Router::new().route(
            "/metrics",
            get(move || metrics_handler(registry.clone())),
        );
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(%err, "metrics server exited");
        }
    });
}

fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn main() {
    if let Err(err) = main_result() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main_result() -> Result<()> {
    let args = Args::parse();

    let network_config: NetworkConfig = load_json(&args.network_spec)?;
    let simulator_config: SimulatorConfig = load_json(&args.simulator_spec)?;

    let network_config = network_config
        .validate()
        .context("invalid network spec")?;
    let simulator_config = simulator_config
        .validate()
        .context("invalid simulator spec")?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(simulator_config.log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let n_topics = simulator_config.n_topics;
    let engine_cfg = EngineConfig {
        num_workers: args.workers,
        output_dir: args.output_dir,
        seed: args.seed,
    };
    let engine = Engine::new(engine_cfg, simulator_config).context("invalid engine config")?;

    if let Some(port) = args.metrics_port {
        spawn_metrics_server(engine.registry.clone(), port);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed.wrapping_add(1_000));
    let users = build_population(&network_config, n_topics, MEAN_ACTION_PER_DAY_RANGE, &mut rng)
        .context("failed to build user population")?;
    info!(users = users.len(), "built user population");

    let process_metrics = spawn_process_metrics(engine.metrics.clone());

    let result = engine.run(users).await;
    process_metrics.abort();

    result.context("pipeline run failed")
}
