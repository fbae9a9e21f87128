//! Agent Worker (§4.4): drives one user at a time through `make_actions`,
//! batching the results before handing them to the Data Manager and Policy
//! Evaluator.

use std::time::Duration;

use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, Barrier};
use tracing::{info, warn};

use simsom_types::{ActionGenerator, Envelope, ProtocolError, SenderRole, WorkerRank};

use crate::messages::{DataManagerPayload, PolicyEvalPayload, ProcessedUser, WorkerPayload};
use crate::protocol::{drain_ready, enter_barrier, probe, Outbox, Probe, StopSignal};

pub struct WorkerConfig {
    pub rank: WorkerRank,
    pub num_workers: usize,
    pub batch_threshold: usize,
    pub probe_timeout: Duration,
    pub send_high_water_mark: usize,
}

/// Allocates mid/vid values partitioned by worker rank (`local_seq *
/// num_workers + rank`), so concurrent Workers never collide without a
/// shared atomic counter. The mid and vid sequences are kept as two
/// independent counters (rather than fields behind a single `&mut self`
/// method) so the two allocator closures the action trait requires can
/// each hold a disjoint mutable borrow.
struct PartitionedIdAllocator {
    rank: u64,
    num_workers: u64,
    next_mid_seq: u64,
    next_vid_seq: u64,
}

impl PartitionedIdAllocator {
    fn new(rank: WorkerRank, num_workers: usize) -> Self {
        Self {
            rank: rank as u64,
            num_workers: (num_workers.max(1)) as u64,
            next_mid_seq: 0,
            next_vid_seq: 0,
        }
    }
}

fn next_id(seq: &mut u64, rank: u64, num_workers: u64) -> u64 {
    let id = *seq * num_workers + rank;
    *seq += 1;
    id
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut mailbox: mpsc::Receiver<Envelope<WorkerPayload>>,
    data_manager_tx: mpsc::Sender<Envelope<DataManagerPayload>>,
    policy_eval_tx: mpsc::Sender<Envelope<PolicyEvalPayload>>,
    mut stop: StopSignal,
    barrier: std::sync::Arc<Barrier>,
    cfg: WorkerConfig,
    mut action_generator: Box<dyn ActionGenerator<ChaCha8Rng>>,
    mut rng: ChaCha8Rng,
) -> Result<(), ProtocolError> {
    let mut data_manager_out = Outbox::new(data_manager_tx, cfg.send_high_water_mark);
    let mut policy_eval_out = Outbox::new(policy_eval_tx, cfg.send_high_water_mark);
    let mut ids = PartitionedIdAllocator::new(cfg.rank, cfg.num_workers);
    let mut out_batch: Vec<ProcessedUser> = Vec::with_capacity(cfg.batch_threshold);
    let mut error = None;

    loop {
        match probe(&mut mailbox, &mut stop, cfg.probe_timeout).await {
            Probe::Message(envelope) => {
                if envelope.sender != SenderRole::AgntPoolMngr {
                    warn!(sender = %envelope.sender, "worker protocol error, escalating to STOP");
                    error = Some(ProtocolError::UnexpectedSender {
                        sender: envelope.sender,
                    });
                    stop.trigger();
                    break;
                }
                let mut user = envelope.body.user;
                let PartitionedIdAllocator {
                    rank,
                    num_workers,
                    next_mid_seq,
                    next_vid_seq,
                } = &mut ids;
                let mut mid_alloc = || next_id(next_mid_seq, *rank, *num_workers);
                let mut vid_alloc = || next_id(next_vid_seq, *rank, *num_workers);
                let (new_messages, passive_actions) =
                    action_generator.act(&mut user, &mut mid_alloc, &mut vid_alloc, &mut rng);
                out_batch.push(ProcessedUser {
                    user,
                    new_messages,
                    passive_actions,
                });
                if out_batch.len() >= cfg.batch_threshold {
                    flush_batch(
                        &mut out_batch,
                        &mut data_manager_out,
                        &mut policy_eval_out,
                        cfg.rank,
                    )
                    .await;
                }
            }
            Probe::Quiescent => {
                warn!("worker observed quiescence; escalating STOP");
                stop.trigger();
                break;
            }
            Probe::Stopped => break,
        }
    }

    for envelope in drain_ready(&mut mailbox) {
        if envelope.sender == SenderRole::AgntPoolMngr {
            let mut user = envelope.body.user;
            let PartitionedIdAllocator {
                rank,
                num_workers,
                next_mid_seq,
                next_vid_seq,
            } = &mut ids;
            let mut mid_alloc = || next_id(next_mid_seq, *rank, *num_workers);
            let mut vid_alloc = || next_id(next_vid_seq, *rank, *num_workers);
            let (new_messages, passive_actions) =
                action_generator.act(&mut user, &mut mid_alloc, &mut vid_alloc, &mut rng);
            out_batch.push(ProcessedUser {
                user,
                new_messages,
                passive_actions,
            });
        }
    }
    flush_batch(
        &mut out_batch,
        &mut data_manager_out,
        &mut policy_eval_out,
        cfg.rank,
    )
    .await;
    data_manager_out.drain().await;
    policy_eval_out.drain().await;
    info!(rank = cfg.rank, "worker entering shutdown barrier");
    enter_barrier(&barrier).await;

    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn flush_batch(
    out_batch: &mut Vec<ProcessedUser>,
    data_manager_out: &mut Outbox<Envelope<DataManagerPayload>>,
    policy_eval_out: &mut Outbox<Envelope<PolicyEvalPayload>>,
    rank: WorkerRank,
) {
    if out_batch.is_empty() {
        return;
    }
    let users: Vec<simsom_types::User> = out_batch.iter().map(|p| p.user.clone()).collect();
    let batch = std::mem::take(out_batch);
    data_manager_out
        .send(Envelope::new(
            SenderRole::Worker(rank),
            DataManagerPayload::WorkerBatch(batch),
        ))
        .await;
    policy_eval_out
        .send(Envelope::new(
            SenderRole::Worker(rank),
            PolicyEvalPayload { users },
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioned_ids_never_collide_across_workers() {
        let mut seq_a = 0u64;
        let mut seq_b = 0u64;
        let mut seq_c = 0u64;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            assert!(seen.insert(next_id(&mut seq_a, 0, 3)));
            assert!(seen.insert(next_id(&mut seq_b, 1, 3)));
            assert!(seen.insert(next_id(&mut seq_c, 2, 3)));
        }
    }
}
