//! Analyzer / Convergence Monitor (§4.7): persists activities and
//! passivities, runs the configured convergence method, and broadcasts STOP
//! to every other participant once it fires.

use std::path::Path;
use std::time::Duration;

use statrs::statistics::Statistics;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use simsom_types::{Envelope, ProtocolError, SenderRole};

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("failed to prepare analyzer output directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write CSV row: {0}")]
    Csv(#[from] csv::Error),
}

use crate::config::ConvergenceMethod;
use crate::messages::AnalyzerPayload;
use crate::metrics::PipelineMetrics;
use crate::protocol::{drain_ready, probe, Outbox, Probe, StopSignal};

const EMA_RHO: f64 = 0.8;

pub struct AnalyzerConfig {
    pub convergence_method: ConvergenceMethod,
    pub target_days: f64,
    pub sliding_window_size: usize,
    pub sliding_window_threshold: f64,
    pub ema_quality_convergence: f64,
    /// User-update batch size the EMA method evaluates over —
    /// `analyzer_process.py`'s `update_quality` uses the run's actual
    /// population size (`n_users`), not a fixed constant.
    pub ema_user_batch: usize,
    pub save_active_interactions: bool,
    pub save_passive_interactions: bool,
    pub probe_timeout: Duration,
    pub send_high_water_mark: usize,
}

struct ConvergenceState {
    method: ConvergenceMethod,
    target_days: f64,
    sliding_window_size: usize,
    sliding_window_threshold: f64,
    ema_quality_convergence: f64,

    max_time_seen: f64,
    window: Vec<f64>,
    previous_window_mean: Option<f64>,
    ema_quality: Option<f64>,
    quality_sum_since_ema: f64,
    users_since_ema: usize,
    ema_user_batch: usize,
}

impl ConvergenceState {
    fn new(cfg: &AnalyzerConfig) -> Self {
        Self {
            method: cfg.convergence_method,
            target_days: cfg.target_days,
            sliding_window_size: cfg.sliding_window_size,
            sliding_window_threshold: cfg.sliding_window_threshold,
            ema_quality_convergence: cfg.ema_quality_convergence,
            max_time_seen: 0.0,
            window: Vec::new(),
            previous_window_mean: None,
            ema_quality: None,
            quality_sum_since_ema: 0.0,
            users_since_ema: 0,
            ema_user_batch: cfg.ema_user_batch,
        }
    }

    /// Folds one batch's worth of data into the running convergence state
    /// and reports whether the active method has fired (§4.7's three
    /// mutually-exclusive methods).
    fn observe(&mut self, firehose: &[simsom_types::Message], activities: &[simsom_types::Message], metrics: &PipelineMetrics) -> bool {
        match self.method {
            ConvergenceMethod::DayCount => {
                for message in firehose {
                    if let Some(t) = message.time {
                        self.max_time_seen = self.max_time_seen.max(t);
                    }
                }
                metrics.convergence_metric.set(self.max_time_seen);
                self.max_time_seen >= self.target_days
            }
            ConvergenceMethod::SlidingWindow => {
                for message in activities {
                    self.window.push(message.quality);
                    if self.window.len() >= self.sliding_window_size {
                        let mean = self.window.as_slice().mean();
                        self.window.clear();
                        let converged = match self.previous_window_mean {
                            Some(prev) => (mean - prev).abs() <= self.sliding_window_threshold,
                            None => false,
                        };
                        self.previous_window_mean = Some(mean);
                        metrics.convergence_metric.set(mean);
                        if converged {
                            return true;
                        }
                    }
                }
                false
            }
            ConvergenceMethod::Ema => {
                if activities.is_empty() {
                    return false;
                }
                let batch_sum: f64 = activities.iter().map(|m| m.quality).sum();
                self.quality_sum_since_ema += batch_sum;
                self.users_since_ema += activities.len();
                let current = self
                    .ema_quality
                    .unwrap_or(self.quality_sum_since_ema / self.users_since_ema as f64);
                if self.users_since_ema < self.ema_user_batch {
                    self.ema_quality = Some(current);
                    return false;
                }
                let new_quality = EMA_RHO * current
                    + (1.0 - EMA_RHO) * (self.quality_sum_since_ema / self.users_since_ema as f64);
                self.quality_sum_since_ema = 0.0;
                self.users_since_ema = 0;
                metrics.convergence_metric.set(new_quality);
                let converged = current.abs() > f64::EPSILON
                    && ((new_quality - current).abs() / current.abs()) <= self.ema_quality_convergence;
                self.ema_quality = Some(new_quality);
                converged
            }
        }
    }
}

/// Single-writer CSV sinks for activities/passivities (§4.7's "opening /
/// closing is the Analyzer's responsibility; writes are row-at-a-time").
struct Persistence {
    activities: Option<csv::Writer<std::fs::File>>,
    passivities: Option<csv::Writer<std::fs::File>>,
}

impl Persistence {
    fn open(
        output_dir: &Path,
        save_active: bool,
        save_passive: bool,
    ) -> Result<Self, AnalyzerError> {
        std::fs::create_dir_all(output_dir)?;
        let activities = if save_active {
            let mut writer = csv::Writer::from_path(output_dir.join("activities.csv"))?;
            writer.write_record([
                "mid",
                "uid",
                "quality",
                "appeal",
                "reshared_id",
                "reshared_user_id",
                "reshared_original_id",
                "time",
            ])?;
            writer.flush()?;
            Some(writer)
        } else {
            None
        };
        let passivities = if save_passive {
            let mut writer = csv::Writer::from_path(output_dir.join("passivities.csv"))?;
            writer.write_record(["vid", "uid", "parent_mid", "parent_uid"])?;
            writer.flush()?;
            Some(writer)
        } else {
            None
        };
        Ok(Self {
            activities,
            passivities,
        })
    }

    fn write_activities(&mut self, messages: &[simsom_types::Message]) -> Result<(), AnalyzerError> {
        let Some(writer) = self.activities.as_mut() else {
            return Ok(());
        };
        for m in messages {
            writer.write_record([
                m.mid.to_string(),
                m.uid.to_string(),
                m.quality.to_string(),
                m.appeal.to_string(),
                m.reshared_id.map(|v| v.to_string()).unwrap_or_default(),
                m.reshared_user_id.map(|v| v.to_string()).unwrap_or_default(),
                m.reshared_original_id.map(|v| v.to_string()).unwrap_or_default(),
                m.time.map(|v| v.to_string()).unwrap_or_default(),
            ])?;
        }
        writer.flush()
    }

    fn write_passivities(&mut self, views: &[simsom_types::View]) -> Result<(), std::io::Error> {
        let Some(writer) = self.passivities.as_mut() else {
            return Ok(());
        };
        for v in views {
            writer.write_record([
                v.vid.to_string(),
                v.uid.to_string(),
                v.parent_mid.to_string(),
                v.parent_uid.to_string(),
            ])?;
        }
        writer.flush()
    }
}

/// Broadcasts STOP to every other participant and persists whatever this
/// batch already carried, then terminates this loop. The broadcast itself
/// is just `stop.trigger()`: every participant holds a clone of the same
/// [`StopSignal`], so there is no separate per-peer send to wait on the way
/// the source's one-process-per-participant STOP messages required (§4.7,
/// §5's shutdown barrier).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut mailbox: mpsc::Receiver<Envelope<AnalyzerPayload>>,
    mut stop: StopSignal,
    barrier: std::sync::Arc<tokio::sync::Barrier>,
    output_dir: std::path::PathBuf,
    cfg: AnalyzerConfig,
    metrics: PipelineMetrics,
) -> Result<(), ProtocolError> {
    let mut persistence = Persistence::open(
        &output_dir,
        cfg.save_active_interactions,
        cfg.save_passive_interactions,
    )
    .expect("analyzer output directory must be writable");
    let mut convergence = ConvergenceState::new(&cfg);
    let mut error = None;

    loop {
        match probe(&mut mailbox, &mut stop, cfg.probe_timeout).await {
            Probe::Message(envelope) => {
                if envelope.sender != SenderRole::RecSys {
                    warn!(sender = %envelope.sender, "analyzer protocol error, escalating to STOP");
                    error = Some(ProtocolError::UnexpectedSender {
                        sender: envelope.sender,
                    });
                    stop.trigger();
                    break;
                }
                let AnalyzerPayload {
                    users: _users,
                    activities,
                    passivities,
                    firehose,
                } = envelope.body;

                if let Err(err) = persistence.write_activities(&activities) {
                    warn!(%err, "failed to persist activities");
                }
                if let Err(err) = persistence.write_passivities(&passivities) {
                    warn!(%err, "failed to persist passivities");
                }

                if convergence.observe(&firehose, &activities, &metrics) {
                    info!("convergence criterion met, broadcasting STOP");
                    stop.trigger();
                    break;
                }
            }
            Probe::Quiescent => {
                warn!("analyzer observed quiescence; escalating STOP");
                stop.trigger();
                break;
            }
            Probe::Stopped => break,
        }
    }

    for envelope in drain_ready(&mut mailbox) {
        let _ = persistence.write_activities(&envelope.body.activities);
        let _ = persistence.write_passivities(&envelope.body.passivities);
    }
    info!("analyzer entering shutdown barrier");
    barrier.wait().await;

    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(method: ConvergenceMethod) -> AnalyzerConfig {
        AnalyzerConfig {
            convergence_method: method,
            target_days: 2.0,
            sliding_window_size: 3,
            sliding_window_threshold: 0.05,
            ema_quality_convergence: 0.05,
            ema_user_batch: 10,
            save_active_interactions: true,
            save_passive_interactions: true,
            probe_timeout: Duration::from_millis(50),
            send_high_water_mark: 10,
        }
    }

    fn msg(quality: f64, time: Option<f64>) -> simsom_types::Message {
        simsom_types::Message {
            mid: 1,
            uid: 1,
            quality,
            appeal: 0.5,
            topics: vec![],
            time,
            reshared_id: None,
            reshared_original_id: None,
            reshared_user_id: None,
        }
    }

    fn metrics() -> PipelineMetrics {
        PipelineMetrics::new(&mut prometheus_client::registry::Registry::default())
    }

    #[test]
    fn day_count_converges_once_target_reached() {
        let mut state = ConvergenceState::new(&cfg(ConvergenceMethod::DayCount));
        let metrics = metrics();
        assert!(!state.observe(&[msg(0.5, Some(1.0))], &[], &metrics));
        assert!(state.observe(&[msg(0.5, Some(2.5))], &[], &metrics));
    }

    #[test]
    fn sliding_window_converges_when_means_stabilize() {
        let mut state = ConvergenceState::new(&cfg(ConvergenceMethod::SlidingWindow));
        let metrics = metrics();
        let first_window = vec![msg(0.5, None), msg(0.5, None), msg(0.5, None)];
        assert!(!state.observe(&[], &first_window, &metrics));
        let second_window = vec![msg(0.51, None), msg(0.5, None), msg(0.49, None)];
        assert!(state.observe(&[], &second_window, &metrics));
    }

    #[test]
    fn ema_method_requires_a_full_user_batch_before_evaluating() {
        let mut state = ConvergenceState::new(&cfg(ConvergenceMethod::Ema));
        let metrics = metrics();
        let small_batch: Vec<_> = (0..5).map(|_| msg(0.5, None)).collect();
        assert!(!state.observe(&[], &small_batch, &metrics));
    }

    #[test]
    fn ema_quality_sum_accumulates_across_calls_instead_of_resetting() {
        // ema_user_batch is 10; two batches of 3 leave the method short of a
        // full batch, so both must still contribute to the running sum
        // rather than the second call discarding the first's contribution.
        let mut state = ConvergenceState::new(&cfg(ConvergenceMethod::Ema));
        let metrics = metrics();
        let first_batch: Vec<_> = (0..3).map(|_| msg(0.3, None)).collect();
        let second_batch: Vec<_> = (0..3).map(|_| msg(0.6, None)).collect();
        assert!(!state.observe(&[], &first_batch, &metrics));
        assert!(!state.observe(&[], &second_batch, &metrics));
        assert_eq!(state.users_since_ema, 6);
        assert!((state.quality_sum_since_ema - (0.3 * 3.0 + 0.6 * 3.0)).abs() < 1e-9);
    }
}
