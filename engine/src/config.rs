use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

/// Raw, JSON-deserializable network generation config (`--network-spec`).
#[derive(Debug, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub from_file: bool,
    pub real_world_network: Option<PathBuf>,
    pub net_size: usize,
    pub probability_follow: f64,
    pub avg_n_friend: usize,
}

#[derive(Debug, Error)]
pub enum NetworkConfigError {
    #[error("net_size must be > 0")]
    ZeroNetSize,
    #[error("avg_n_friend ({avg_n_friend}) must be less than net_size ({net_size})")]
    FriendCountExceedsPopulation {
        avg_n_friend: usize,
        net_size: usize,
    },
    #[error("probability_follow must be within [0, 1] (got {0})")]
    ProbabilityOutOfRange(f64),
    #[error("from_file is set but real_world_network is missing")]
    MissingNetworkFile,
}

pub struct ValidatedNetworkConfig {
    pub from_file: bool,
    pub real_world_network: Option<PathBuf>,
    pub net_size: NonZeroUsize,
    pub probability_follow: f64,
    pub avg_n_friend: usize,
}

impl NetworkConfig {
    pub fn validate(self) -> Result<ValidatedNetworkConfig, NetworkConfigError> {
        let net_size =
            NonZeroUsize::new(self.net_size).ok_or(NetworkConfigError::ZeroNetSize)?;
        if self.avg_n_friend >= self.net_size {
            return Err(NetworkConfigError::FriendCountExceedsPopulation {
                avg_n_friend: self.avg_n_friend,
                net_size: self.net_size,
            });
        }
        if !(0.0..=1.0).contains(&self.probability_follow) {
            return Err(NetworkConfigError::ProbabilityOutOfRange(
                self.probability_follow,
            ));
        }
        if self.from_file && self.real_world_network.is_none() {
            return Err(NetworkConfigError::MissingNetworkFile);
        }
        Ok(ValidatedNetworkConfig {
            from_file: self.from_file,
            real_world_network: self.real_world_network,
            net_size,
            probability_follow: self.probability_follow,
            avg_n_friend: self.avg_n_friend,
        })
    }
}

/// Raw, JSON-deserializable simulator config (`--simulator-spec`).
///
/// Tunables the distilled spec left implicit (probe timeouts, watermarks,
/// Markov transition probabilities) carry `#[serde(default = ...)]` so a
/// spec-shaped minimal config file still loads.
#[derive(Debug, Deserialize, Serialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_batch_size")]
    pub data_manager_batchsize: usize,

    #[serde(default)]
    pub day_count_criterion: bool,
    #[serde(default)]
    pub sliding_window_method: bool,
    #[serde(default)]
    pub ema_quality_method: bool,

    #[serde(default = "default_target_days")]
    pub target_days: f64,
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,
    #[serde(default = "default_sliding_window_threshold")]
    pub sliding_window_threshold: f64,
    #[serde(default = "default_ema_quality_convergence")]
    pub ema_quality_convergence: f64,

    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_print_interval")]
    pub print_interval: usize,
    #[serde(default = "default_true")]
    pub save_active_interactions: bool,
    #[serde(default = "default_true")]
    pub save_passive_interactions: bool,

    // Ambient tunables (§12 of the expanded spec).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_send_high_water_mark")]
    pub send_high_water_mark: usize,
    #[serde(default = "default_worker_batch_threshold")]
    pub worker_batch_threshold: usize,
    #[serde(default = "default_firehose_high_water")]
    pub firehose_high_water: usize,
    #[serde(default = "default_firehose_low_water")]
    pub firehose_low_water: usize,
    #[serde(default = "default_global_inventory_high_water")]
    pub global_inventory_high_water: usize,
    #[serde(default = "default_global_inventory_low_water")]
    pub global_inventory_low_water: usize,
    #[serde(default = "default_strike_window_days")]
    pub strike_window_days: f64,
    #[serde(default = "default_markov_p_active_to_active")]
    pub markov_p_active_to_active: f64,
    #[serde(default = "default_markov_p_dormant_to_active")]
    pub markov_p_dormant_to_active: f64,
    #[serde(default = "default_lurker_fraction")]
    pub lurker_fraction: f64,
    #[serde(default = "default_n_topics")]
    pub n_topics: usize,
    #[serde(default = "default_p_in")]
    pub p_in: f64,
    #[serde(default = "default_p_out")]
    pub p_out: f64,
}

fn default_batch_size() -> usize {
    32
}
fn default_target_days() -> f64 {
    5.0
}
fn default_sliding_window_size() -> usize {
    500
}
fn default_sliding_window_threshold() -> f64 {
    0.001
}
fn default_ema_quality_convergence() -> f64 {
    0.01
}
fn default_print_interval() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
fn default_probe_timeout_ms() -> u64 {
    3_000
}
fn default_send_high_water_mark() -> usize {
    100
}
fn default_worker_batch_threshold() -> usize {
    32
}
fn default_firehose_high_water() -> usize {
    2_000
}
fn default_firehose_low_water() -> usize {
    1_000
}
fn default_global_inventory_high_water() -> usize {
    2_000
}
fn default_global_inventory_low_water() -> usize {
    1_000
}
fn default_strike_window_days() -> f64 {
    0.1
}
fn default_markov_p_active_to_active() -> f64 {
    0.6
}
fn default_markov_p_dormant_to_active() -> f64 {
    0.1
}
fn default_lurker_fraction() -> f64 {
    0.3
}
fn default_n_topics() -> usize {
    15
}
fn default_p_in() -> f64 {
    0.5
}
fn default_p_out() -> f64 {
    0.5
}

#[derive(Debug, Error)]
pub enum SimulatorConfigError {
    #[error("data_manager_batchsize must be > 0")]
    ZeroBatchSize,
    #[error("no convergence method enabled: set one of day_count_criterion, sliding_window_method, ema_quality_method")]
    NoConvergenceMethod,
    #[error("probe_timeout_ms must be > 0")]
    ZeroProbeTimeout,
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: usize },
    #[error("{field} must be within [0, 1] (got {value})")]
    ProbabilityOutOfRange { field: &'static str, value: f64 },
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
}

/// Which convergence method is active, resolved by the priority order
/// day-count > sliding-window > EMA (§9's exclusivity rule) rather than
/// erroring when more than one flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceMethod {
    DayCount,
    SlidingWindow,
    Ema,
}

pub struct ValidatedSimulatorConfig {
    pub data_manager_batchsize: usize,
    pub convergence_method: ConvergenceMethod,
    pub target_days: f64,
    pub sliding_window_size: usize,
    pub sliding_window_threshold: f64,
    pub ema_quality_convergence: f64,
    pub log_level: Level,
    pub print_interval: usize,
    pub save_active_interactions: bool,
    pub save_passive_interactions: bool,
    pub probe_timeout: Duration,
    pub send_high_water_mark: usize,
    pub worker_batch_threshold: usize,
    pub firehose_high_water: usize,
    pub firehose_low_water: usize,
    pub global_inventory_high_water: usize,
    pub global_inventory_low_water: usize,
    pub strike_window_days: f64,
    pub markov_p_active_to_active: f64,
    pub markov_p_dormant_to_active: f64,
    pub lurker_fraction: f64,
    pub n_topics: usize,
    pub p_in: f64,
    pub p_out: f64,
}

fn ensure_nonzero(field: &'static str, value: usize) -> Result<(), SimulatorConfigError> {
    if value == 0 {
        return Err(SimulatorConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn ensure_probability(field: &'static str, value: f64) -> Result<(), SimulatorConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SimulatorConfigError::ProbabilityOutOfRange { field, value });
    }
    Ok(())
}

impl SimulatorConfig {
    /// `verbose` maps to `debug`/`info` the way `node/src/lib.rs` maps its
    /// `log_level` string, overridable at the CLI boundary by `RUST_LOG`.
    pub fn validate(self) -> Result<ValidatedSimulatorConfig, SimulatorConfigError> {
        ensure_nonzero("data_manager_batchsize", self.data_manager_batchsize)?;
        if self.probe_timeout_ms == 0 {
            return Err(SimulatorConfigError::ZeroProbeTimeout);
        }
        ensure_nonzero("send_high_water_mark", self.send_high_water_mark)?;
        ensure_nonzero("worker_batch_threshold", self.worker_batch_threshold)?;
        ensure_nonzero("firehose_high_water", self.firehose_high_water)?;
        ensure_nonzero(
            "global_inventory_high_water",
            self.global_inventory_high_water,
        )?;
        ensure_nonzero("n_topics", self.n_topics)?;
        ensure_probability("lurker_fraction", self.lurker_fraction)?;
        ensure_probability("markov_p_active_to_active", self.markov_p_active_to_active)?;
        ensure_probability("markov_p_dormant_to_active", self.markov_p_dormant_to_active)?;
        ensure_probability("p_in", self.p_in)?;
        ensure_probability("p_out", self.p_out)?;

        let convergence_method = if self.day_count_criterion {
            ConvergenceMethod::DayCount
        } else if self.sliding_window_method {
            ConvergenceMethod::SlidingWindow
        } else if self.ema_quality_method {
            ConvergenceMethod::Ema
        } else {
            return Err(SimulatorConfigError::NoConvergenceMethod);
        };

        let log_level_str = if self.verbose { "debug" } else { "info" };
        let log_level =
            Level::from_str(log_level_str).map_err(|_| SimulatorConfigError::InvalidLogLevel {
                value: log_level_str.to_string(),
            })?;

        Ok(ValidatedSimulatorConfig {
            data_manager_batchsize: self.data_manager_batchsize,
            convergence_method,
            target_days: self.target_days,
            sliding_window_size: self.sliding_window_size,
            sliding_window_threshold: self.sliding_window_threshold,
            ema_quality_convergence: self.ema_quality_convergence,
            log_level,
            print_interval: self.print_interval,
            save_active_interactions: self.save_active_interactions,
            save_passive_interactions: self.save_passive_interactions,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            send_high_water_mark: self.send_high_water_mark,
            worker_batch_threshold: self.worker_batch_threshold,
            firehose_high_water: self.firehose_high_water,
            firehose_low_water: self.firehose_low_water,
            global_inventory_high_water: self.global_inventory_high_water,
            global_inventory_low_water: self.global_inventory_low_water,
            strike_window_days: self.strike_window_days,
            markov_p_active_to_active: self.markov_p_active_to_active,
            markov_p_dormant_to_active: self.markov_p_dormant_to_active,
            lurker_fraction: self.lurker_fraction,
            n_topics: self.n_topics,
            p_in: self.p_in,
            p_out: self.p_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_simulator_json() -> &'static str {
        r#"{
            "data_manager_batchsize": 32,
            "day_count_criterion": true,
            "target_days": 0.5
        }"#
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let cfg: SimulatorConfig = serde_json::from_str(minimal_simulator_json()).unwrap();
        let validated = cfg.validate().unwrap();
        assert_eq!(validated.convergence_method, ConvergenceMethod::DayCount);
        assert_eq!(validated.send_high_water_mark, 100);
    }

    #[test]
    fn day_count_wins_priority_over_other_methods() {
        let mut cfg: SimulatorConfig = serde_json::from_str(minimal_simulator_json()).unwrap();
        cfg.sliding_window_method = true;
        cfg.ema_quality_method = true;
        let validated = cfg.validate().unwrap();
        assert_eq!(validated.convergence_method, ConvergenceMethod::DayCount);
    }

    #[test]
    fn no_convergence_method_is_an_error() {
        let cfg = SimulatorConfig {
            day_count_criterion: false,
            sliding_window_method: false,
            ema_quality_method: false,
            ..serde_json::from_str(minimal_simulator_json()).unwrap()
        };
        assert!(matches!(
            cfg.validate(),
            Err(SimulatorConfigError::NoConvergenceMethod)
        ));
    }

    #[test]
    fn network_config_rejects_friend_count_above_population() {
        let cfg = NetworkConfig {
            from_file: false,
            real_world_network: None,
            net_size: 10,
            probability_follow: 0.5,
            avg_n_friend: 10,
        };
        assert!(matches!(
            cfg.validate(),
            Err(NetworkConfigError::FriendCountExceedsPopulation { .. })
        ));
    }
}
