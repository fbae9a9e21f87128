//! Policy Evaluator (§4.6): applies moderation rules per user — strike
//! windows, temporary suspension, termination on repeat offense. Never
//! creates messages and never blocks the main data flow; its updates are a
//! side channel reconciled lazily at the Data Manager.

use std::time::Duration;

use tokio::sync::{mpsc, Barrier};
use tracing::{info, warn};

use simsom_types::{Envelope, PolicyState, ProtocolError, SenderRole, Uid};

use crate::messages::{DataManagerPayload, PolicyEvalPayload, PolicyUpdate};
use crate::metrics::PipelineMetrics;
use crate::protocol::{drain_ready, enter_barrier, probe, Outbox, Probe, StopSignal};

pub struct PolicyEvaluatorConfig {
    pub strike_window_days: f64,
    pub probe_timeout: Duration,
    pub send_high_water_mark: usize,
}

/// Maps a strike count to a suspension duration in day-units: the
/// documented table for 1-2 strikes, falling back to `0.0002 * strikes`
/// for anything the table doesn't name (resolved Open Question; recorded in
/// DESIGN.md).
fn suspension_duration(strikes: usize) -> f64 {
    match strikes {
        1 => 1.0,
        2 => 2.0,
        n => 0.0002 * n as f64,
    }
}

/// Runs the full algorithm for one user against `current_time`, returning a
/// `PolicyUpdate` only when the user's policy state actually changed this
/// cycle (§4.6's algorithm, steps 1-4).
fn evaluate(
    uid: Uid,
    mut policy: PolicyState,
    current_time: f64,
    strike_window_days: f64,
    metrics: &PipelineMetrics,
) -> Option<PolicyUpdate> {
    if policy.is_terminated {
        return None;
    }

    let before_len = policy.strike_timestamps.len();
    policy
        .strike_timestamps
        .retain(|&t| current_time - t <= strike_window_days);
    let mut changed = policy.strike_timestamps.len() != before_len;

    let mut clear_newsfeed = false;
    if policy.is_suspended && current_time >= policy.suspension_lift_time {
        policy.is_suspended = false;
        changed = true;
    }

    if policy.bad_message_posting {
        policy.bad_message_posting = false;
        policy.strike_timestamps.push(current_time);
        changed = true;
        metrics.policy_strikes.inc();

        if policy.strike_timestamps.len() >= 3 {
            policy.is_terminated = true;
            metrics.policy_terminations.inc();
        } else {
            policy.is_suspended = true;
            policy.suspension_lift_time =
                current_time + suspension_duration(policy.strike_timestamps.len());
            clear_newsfeed = true;
            metrics.policy_suspensions.inc();
        }
    }

    if !changed {
        return None;
    }

    Some(PolicyUpdate {
        uid,
        policy,
        clear_newsfeed,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut mailbox: mpsc::Receiver<Envelope<PolicyEvalPayload>>,
    data_manager_tx: mpsc::Sender<Envelope<DataManagerPayload>>,
    mut stop: StopSignal,
    barrier: std::sync::Arc<Barrier>,
    cfg: PolicyEvaluatorConfig,
    metrics: PipelineMetrics,
) -> Result<(), ProtocolError> {
    let mut data_manager_out = Outbox::new(data_manager_tx, cfg.send_high_water_mark);
    let mut error = None;
    let mut clock = 0.0f64;

    loop {
        match probe(&mut mailbox, &mut stop, cfg.probe_timeout).await {
            Probe::Message(envelope) => {
                if let Err(err) =
                    handle_envelope(envelope, &mut data_manager_out, &cfg, &metrics, &mut clock)
                        .await
                {
                    warn!(%err, "policy evaluator protocol error, escalating to STOP");
                    error = Some(err);
                    stop.trigger();
                    break;
                }
            }
            Probe::Quiescent => {
                warn!("policy evaluator observed quiescence; escalating STOP");
                stop.trigger();
                break;
            }
            Probe::Stopped => break,
        }
    }

    for envelope in drain_ready(&mut mailbox) {
        let _ = handle_envelope(envelope, &mut data_manager_out, &cfg, &metrics, &mut clock).await;
    }
    data_manager_out.drain().await;
    info!("policy evaluator entering shutdown barrier");
    enter_barrier(&barrier).await;

    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn handle_envelope(
    envelope: Envelope<PolicyEvalPayload>,
    data_manager_out: &mut Outbox<Envelope<DataManagerPayload>>,
    cfg: &PolicyEvaluatorConfig,
    metrics: &PipelineMetrics,
    clock: &mut f64,
) -> Result<(), ProtocolError> {
    if !matches!(envelope.sender, SenderRole::Worker(_)) {
        return Err(ProtocolError::UnexpectedSender {
            sender: envelope.sender,
        });
    }
    for user in envelope.body.users {
        if let Some(time) = user.newsfeed.iter().filter_map(|m| m.time).fold(None, |acc, t| {
            Some(acc.map_or(t, |a: f64| a.max(t)))
        }) {
            *clock = clock.max(time);
        }
        if let Some(update) = evaluate(user.uid, user.policy, *clock, cfg.strike_window_days, metrics)
        {
            data_manager_out
                .send(Envelope::new(
                    SenderRole::PolicyEval,
                    DataManagerPayload::PolicyUpdate(update),
                ))
                .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;

    fn metrics() -> PipelineMetrics {
        PipelineMetrics::new(&mut Registry::default())
    }

    #[test]
    fn third_strike_terminates_instead_of_suspending() {
        let mut policy = PolicyState::default();
        policy.strike_timestamps = vec![0.0, 0.05];
        policy.bad_message_posting = true;
        let update = evaluate(1, policy, 0.08, 0.1, &metrics()).unwrap();
        assert!(update.policy.is_terminated);
        assert!(!update.policy.is_suspended);
    }

    #[test]
    fn first_strike_suspends_using_table_value() {
        let mut policy = PolicyState::default();
        policy.bad_message_posting = true;
        let update = evaluate(1, policy, 1.0, 0.1, &metrics()).unwrap();
        assert!(update.policy.is_suspended);
        assert_eq!(update.policy.suspension_lift_time, 2.0);
        assert!(update.clear_newsfeed);
    }

    #[test]
    fn strikes_outside_window_are_pruned() {
        let mut policy = PolicyState::default();
        policy.strike_timestamps = vec![0.0];
        let update = evaluate(1, policy, 5.0, 0.1, &metrics());
        assert!(update.unwrap().policy.strike_timestamps.is_empty());
    }

    #[test]
    fn terminated_users_are_never_reevaluated() {
        let mut policy = PolicyState::default();
        policy.is_terminated = true;
        policy.bad_message_posting = true;
        assert!(evaluate(1, policy, 1.0, 0.1, &metrics()).is_none());
    }

    #[test]
    fn suspension_lifts_once_current_time_passes_lift_time() {
        let mut policy = PolicyState::default();
        policy.is_suspended = true;
        policy.suspension_lift_time = 1.0;
        let update = evaluate(1, policy, 1.5, 0.1, &metrics()).unwrap();
        assert!(!update.policy.is_suspended);
    }
}
