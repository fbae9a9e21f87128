//! Data Manager (§4.2): the state of record. Owns `users_by_uid`, the
//! per-user outgoing staging queues, the firehose buffer, and the Clock.
//! Exclusively owned state per §5 — no other participant touches any of it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, Barrier};
use tracing::{info, warn};

use simsom_types::{Envelope, Message, ProtocolError, SenderRole, Uid, User, View};

use crate::activity::ActivityModel;
use crate::clock::PreMaterializedClock;
use crate::messages::{DataManagerPayload, RecommenderPayload, UserPackItem};
use crate::metrics::PipelineMetrics;
use crate::protocol::{drain_ready, enter_barrier, probe, Outbox, Probe, StopSignal};

pub struct DataManagerConfig {
    pub batch_size: usize,
    pub firehose_high_water: usize,
    pub firehose_low_water: usize,
    pub lurker_fraction: f64,
    pub probe_timeout: Duration,
    pub send_high_water_mark: usize,
}

/// The Data Manager's authoritative state. Split out from the actor
/// scaffolding so the selection/timestamping logic can be unit tested
/// without spinning up tokio tasks.
pub struct DataManagerState {
    users_by_uid: HashMap<Uid, User>,
    outgoing_active: HashMap<Uid, Vec<Message>>,
    outgoing_passive: HashMap<Uid, Vec<View>>,
    firehose_buffer: VecDeque<Vec<Message>>,
    sample_pool: Vec<Uid>,
    activity: ActivityModel,
    clock: PreMaterializedClock,
    batch_size: usize,
    firehose_high_water: usize,
    firehose_low_water: usize,
    lurker_fraction: f64,
}

impl DataManagerState {
    pub fn new(
        users: Vec<User>,
        activity: ActivityModel,
        cfg: &DataManagerConfig,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let mut users_by_uid = HashMap::with_capacity(users.len());
        for user in users {
            users_by_uid.insert(user.uid, user);
        }
        let mut state = Self {
            users_by_uid,
            outgoing_active: HashMap::new(),
            outgoing_passive: HashMap::new(),
            firehose_buffer: VecDeque::new(),
            sample_pool: Vec::new(),
            activity,
            clock: PreMaterializedClock::new(),
            batch_size: cfg.batch_size,
            firehose_high_water: cfg.firehose_high_water,
            firehose_low_water: cfg.firehose_low_water,
            lurker_fraction: cfg.lurker_fraction,
        };
        state.start_new_day(rng);
        state
    }

    /// Draws each user's daily action count (Markov or Poisson), builds the
    /// day's activity-sampled pool (all active users plus a `lurker_fraction`
    /// sample of the rest), and asks the Clock to materialize the day's
    /// timestamp schedule (§4.2, §9's "activity sampling layered on top" of
    /// round robin).
    fn start_new_day(&mut self, rng: &mut ChaCha8Rng) {
        let mut uids: Vec<Uid> = self.users_by_uid.keys().copied().collect();
        uids.sort_unstable();

        let mut counts = Vec::with_capacity(uids.len());
        let mut active_uids = Vec::new();
        let mut dormant_uids = Vec::new();
        for uid in &uids {
            let mean = self.users_by_uid[uid].mean_action_per_day;
            let count = self.activity.draw_count(*uid, mean, rng);
            counts.push(count);
            if count > 0 {
                active_uids.push(*uid);
            } else {
                dormant_uids.push(*uid);
            }
        }

        let n_lurkers = ((dormant_uids.len() as f64) * self.lurker_fraction).round() as usize;
        dormant_uids.shuffle(rng);
        active_uids.extend(dormant_uids.into_iter().take(n_lurkers));
        active_uids.shuffle(rng);
        self.sample_pool = active_uids;

        self.clock.start_new_day(&counts, rng);
    }

    /// `on(worker, processed_user_batch)` (§4.2): shuffles and timestamps
    /// each user's new messages, extends their outgoing queues, folds the
    /// returned user copy back into the authoritative record, and appends a
    /// freshly built firehose chunk.
    pub fn handle_worker_batch(
        &mut self,
        batch: Vec<crate::messages::ProcessedUser>,
        rng: &mut ChaCha8Rng,
        metrics: &PipelineMetrics,
    ) -> Vec<Message> {
        let mut chunk = Vec::new();
        for mut item in batch {
            item.new_messages.shuffle(rng);
            for mut message in item.new_messages {
                message.time = Some(self.clock.next_timestamp(rng));
                chunk.push(message.clone());
                self.outgoing_active
                    .entry(item.user.uid)
                    .or_default()
                    .push(message);
            }
            metrics
                .views_recorded
                .inc_by(item.passive_actions.len() as u64);
            self.outgoing_passive
                .entry(item.user.uid)
                .or_default()
                .extend(item.passive_actions);
            self.users_by_uid.insert(item.user.uid, item.user);
        }
        metrics.messages_produced.inc_by(chunk.len() as u64);
        if !chunk.is_empty() {
            self.firehose_buffer.push_back(chunk.clone());
            self.enforce_firehose_bound();
        }
        metrics
            .firehose_depth
            .set(self.total_firehose_messages() as i64);
        chunk
    }

    fn total_firehose_messages(&self) -> usize {
        self.firehose_buffer.iter().map(Vec::len).sum()
    }

    fn enforce_firehose_bound(&mut self) {
        while self.total_firehose_messages() > self.firehose_high_water {
            if self.firehose_buffer.pop_front().is_none() {
                break;
            }
            if self.total_firehose_messages() <= self.firehose_low_water {
                break;
            }
        }
    }

    /// `on(recSys, dataReq)` (§4.2): assembles up to `batch_size`
    /// `(user, outgoing_active, outgoing_passive)` tuples via uniform
    /// sampling of the current day's activity pool, starting a new day (and
    /// shrinking the batch) if the pool empties mid-draw (§8 boundary
    /// behavior). Returns the batch and the head of the firehose buffer.
    pub fn handle_data_request(
        &mut self,
        rng: &mut ChaCha8Rng,
        metrics: &PipelineMetrics,
    ) -> (Vec<UserPackItem>, Vec<Message>) {
        let mut batch = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            if self.sample_pool.is_empty() {
                self.start_new_day(rng);
                break;
            }
            let idx = rng.gen_range(0..self.sample_pool.len());
            let uid = self.sample_pool.swap_remove(idx);
            let Some(user) = self.users_by_uid.get(&uid).cloned() else {
                continue;
            };
            let active = self.outgoing_active.remove(&uid).unwrap_or_default();
            let passive = self.outgoing_passive.remove(&uid).unwrap_or_default();
            batch.push(UserPackItem {
                user,
                outgoing_active: active,
                outgoing_passive: passive,
            });
        }
        metrics.users_dispatched.inc_by(batch.len() as u64);
        let firehose = self.firehose_buffer.pop_front().unwrap_or_default();
        (batch, firehose)
    }

    /// `on(policyEval, *)` (§4.2, §4.6): applies a moderation outcome to the
    /// authoritative record. No reply.
    pub fn handle_policy_update(&mut self, update: crate::messages::PolicyUpdate) {
        if let Some(user) = self.users_by_uid.get_mut(&update.uid) {
            user.policy = update.policy;
            if update.clear_newsfeed {
                user.newsfeed.clear();
            }
        }
    }

    #[cfg(test)]
    pub fn outgoing_active_for(&self, uid: Uid) -> &[Message] {
        self.outgoing_active
            .get(&uid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[cfg(test)]
    pub fn user(&self, uid: Uid) -> Option<&User> {
        self.users_by_uid.get(&uid)
    }
}

/// Runs the Data Manager's messaging loop: probe, receive, act, repeat,
/// until STOP, draining outstanding sends and entering the barrier on exit
/// (§5).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut state: DataManagerState,
    mut mailbox: mpsc::Receiver<Envelope<DataManagerPayload>>,
    recommender_tx: mpsc::Sender<Envelope<RecommenderPayload>>,
    mut stop: StopSignal,
    barrier: std::sync::Arc<Barrier>,
    probe_timeout: Duration,
    send_high_water_mark: usize,
    metrics: PipelineMetrics,
    mut rng: ChaCha8Rng,
) -> Result<(), ProtocolError> {
    let mut recommender_out = Outbox::new(recommender_tx, send_high_water_mark);
    let mut error = None;

    loop {
        match probe(&mut mailbox, &mut stop, probe_timeout).await {
            Probe::Message(envelope) => {
                if let Err(err) =
                    handle_envelope(&mut state, envelope, &mut recommender_out, &mut rng, &metrics)
                        .await
                {
                    warn!(%err, "data manager protocol error, escalating to STOP");
                    error = Some(err);
                    stop.trigger();
                    break;
                }
            }
            Probe::Quiescent => {
                warn!("data manager observed quiescence; escalating STOP");
                stop.trigger();
                break;
            }
            Probe::Stopped => break,
        }
    }

    for envelope in drain_ready(&mut mailbox) {
        let _ = handle_envelope(&mut state, envelope, &mut recommender_out, &mut rng, &metrics).await;
    }
    recommender_out.drain().await;
    info!("data manager entering shutdown barrier");
    enter_barrier(&barrier).await;

    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn handle_envelope(
    state: &mut DataManagerState,
    envelope: Envelope<DataManagerPayload>,
    recommender_out: &mut Outbox<Envelope<RecommenderPayload>>,
    rng: &mut ChaCha8Rng,
    metrics: &PipelineMetrics,
) -> Result<(), ProtocolError> {
    match envelope.body {
        DataManagerPayload::WorkerBatch(batch) => {
            if !matches!(envelope.sender, SenderRole::Worker(_)) {
                return Err(ProtocolError::UnexpectedSender {
                    sender: envelope.sender,
                });
            }
            state.handle_worker_batch(batch, rng, metrics);
            Ok(())
        }
        DataManagerPayload::DataRequest => {
            if envelope.sender != SenderRole::RecSys {
                return Err(ProtocolError::UnexpectedSender {
                    sender: envelope.sender,
                });
            }
            let (batch, firehose) = state.handle_data_request(rng, metrics);
            recommender_out
                .send(Envelope::new(
                    SenderRole::DataMngr,
                    RecommenderPayload::DataReply { batch, firehose },
                ))
                .await;
            Ok(())
        }
        DataManagerPayload::PolicyUpdate(update) => {
            if envelope.sender != SenderRole::PolicyEval {
                return Err(ProtocolError::UnexpectedSender {
                    sender: envelope.sender,
                });
            }
            state.handle_policy_update(update);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn user(uid: Uid, mean: f64) -> User {
        User::new(uid, HashSet::new(), HashSet::new(), mean, vec![1.0], None)
    }

    fn cfg() -> DataManagerConfig {
        DataManagerConfig {
            batch_size: 4,
            firehose_high_water: 2000,
            firehose_low_water: 1000,
            lurker_fraction: 0.3,
            probe_timeout: Duration::from_millis(100),
            send_high_water_mark: 100,
        }
    }

    #[test]
    fn dispatch_clears_outgoing_queues_atomically() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let users = vec![user(0, 3.0), user(1, 3.0), user(2, 3.0)];
        let metrics = PipelineMetrics::new(&mut prometheus_client::registry::Registry::default());
        let mut state = DataManagerState::new(users, ActivityModel::poisson(), &cfg(), &mut rng);

        let batch = vec![crate::messages::ProcessedUser {
            user: user(0, 3.0),
            new_messages: vec![simsom_types::Message::new_post(
                1,
                0,
                vec![1.0],
                None,
                false,
                &mut rng,
            )],
            passive_actions: vec![],
        }];
        state.handle_worker_batch(batch, &mut rng, &metrics);
        assert_eq!(state.outgoing_active_for(0).len(), 1);

        let (pack, _firehose) = state.handle_data_request(&mut rng, &metrics);
        let dispatched_zero = pack.iter().find(|item| item.user.uid == 0);
        if dispatched_zero.is_some() {
            assert!(state.outgoing_active_for(0).is_empty());
        }
    }

    #[test]
    fn every_produced_message_is_timestamped_exactly_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let users = vec![user(0, 3.0)];
        let metrics = PipelineMetrics::new(&mut prometheus_client::registry::Registry::default());
        let mut state = DataManagerState::new(users, ActivityModel::poisson(), &cfg(), &mut rng);
        let batch = vec![crate::messages::ProcessedUser {
            user: user(0, 3.0),
            new_messages: vec![simsom_types::Message::new_post(
                1,
                0,
                vec![1.0],
                None,
                false,
                &mut rng,
            )],
            passive_actions: vec![],
        }];
        let chunk = state.handle_worker_batch(batch, &mut rng, &metrics);
        assert_eq!(chunk.len(), 1);
        assert!(chunk[0].time.is_some());
    }

    #[test]
    fn batch_shrinks_when_sample_pool_is_smaller_than_batch_size() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let users = vec![user(0, 0.0001), user(1, 0.0001)];
        let mut small_batch_cfg = cfg();
        small_batch_cfg.batch_size = 10;
        let metrics = PipelineMetrics::new(&mut prometheus_client::registry::Registry::default());
        let mut state =
            DataManagerState::new(users, ActivityModel::poisson(), &small_batch_cfg, &mut rng);
        let (batch, _) = state.handle_data_request(&mut rng, &metrics);
        assert!(batch.len() <= 2);
    }
}
