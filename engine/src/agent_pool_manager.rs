//! Agent Pool Manager (§4.3): pulls user packs from the Recommender and
//! fans individual users out to Worker participants, balancing load via
//! uniform random choice with replacement.

use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, Barrier};
use tracing::{info, warn};

use simsom_types::{Envelope, ProtocolError, SenderRole};

use crate::messages::{AgentPoolManagerPayload, RecommenderPayload, WorkerPayload};
use crate::protocol::{drain_ready, enter_barrier, probe, Outbox, Probe, StopSignal};

pub struct AgentPoolManagerConfig {
    pub probe_timeout: Duration,
    pub send_high_water_mark: usize,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut mailbox: mpsc::Receiver<Envelope<AgentPoolManagerPayload>>,
    recommender_tx: mpsc::Sender<Envelope<RecommenderPayload>>,
    worker_txs: Vec<mpsc::Sender<Envelope<WorkerPayload>>>,
    mut stop: StopSignal,
    barrier: std::sync::Arc<Barrier>,
    cfg: AgentPoolManagerConfig,
    mut rng: ChaCha8Rng,
) -> Result<(), ProtocolError> {
    let mut recommender_out = Outbox::new(recommender_tx, cfg.send_high_water_mark);
    let mut worker_out: Vec<Outbox<Envelope<WorkerPayload>>> = worker_txs
        .into_iter()
        .map(|tx| Outbox::new(tx, cfg.send_high_water_mark))
        .collect();
    let mut error = None;
    let mut request_outstanding = false;

    loop {
        if !stop.is_stopped() && !request_outstanding {
            recommender_out
                .send(Envelope::new(SenderRole::AgntPoolMngr, RecommenderPayload::DataRequest))
                .await;
            request_outstanding = true;
        }

        match probe(&mut mailbox, &mut stop, cfg.probe_timeout).await {
            Probe::Message(envelope) => {
                request_outstanding = false;
                if let Err(err) =
                    handle_envelope(envelope, &mut worker_out, &mut rng).await
                {
                    warn!(%err, "agent pool manager protocol error, escalating to STOP");
                    error = Some(err);
                    stop.trigger();
                    break;
                }
            }
            Probe::Quiescent => {
                warn!("agent pool manager observed quiescence; escalating STOP");
                stop.trigger();
                break;
            }
            Probe::Stopped => break,
        }
    }

    for envelope in drain_ready(&mut mailbox) {
        let _ = handle_envelope(envelope, &mut worker_out, &mut rng).await;
    }
    recommender_out.drain().await;
    for outbox in &mut worker_out {
        outbox.drain().await;
    }
    info!("agent pool manager entering shutdown barrier");
    enter_barrier(&barrier).await;

    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn handle_envelope(
    envelope: Envelope<AgentPoolManagerPayload>,
    worker_out: &mut [Outbox<Envelope<WorkerPayload>>],
    rng: &mut ChaCha8Rng,
) -> Result<(), ProtocolError> {
    if envelope.sender != SenderRole::RecSys {
        return Err(ProtocolError::UnexpectedSender {
            sender: envelope.sender,
        });
    }
    if worker_out.is_empty() {
        return Ok(());
    }
    for user in envelope.body.users {
        let idx = rng.gen_range(0..worker_out.len());
        worker_out[idx]
            .send(Envelope::new(
                SenderRole::AgntPoolMngr,
                WorkerPayload { user },
            ))
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[tokio::test]
    async fn each_user_is_assigned_to_exactly_one_worker() {
        let (worker_tx, mut worker_rx) = mpsc::channel(16);
        let mut worker_out = vec![Outbox::new(worker_tx, 100)];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let user = simsom_types::User::new(0, HashSet::new(), HashSet::new(), 1.0, vec![], None);
        let envelope = Envelope::new(
            SenderRole::RecSys,
            AgentPoolManagerPayload { users: vec![user] },
        );
        handle_envelope(envelope, &mut worker_out, &mut rng)
            .await
            .unwrap();
        worker_out[0].drain().await;
        assert!(worker_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn wrong_sender_is_rejected() {
        let mut worker_out: Vec<Outbox<Envelope<WorkerPayload>>> = vec![];
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let envelope = Envelope::new(
            SenderRole::DataMngr,
            AgentPoolManagerPayload { users: vec![] },
        );
        assert!(handle_envelope(envelope, &mut worker_out, &mut rng)
            .await
            .is_err());
    }
}
