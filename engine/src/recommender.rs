//! Recommender (§4.5): builds each user's personalized newsfeed from a
//! bounded global inventory, de-duplicating reshare chains and ranking by
//! topic similarity.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, Barrier};
use tracing::{info, warn};

use simsom_types::{Envelope, Mid, Message, ProtocolError, SenderRole, Uid, View};

use crate::messages::{
    AgentPoolManagerPayload, AnalyzerPayload, DataManagerPayload, RecommenderPayload,
    UserPackItem,
};
use crate::metrics::PipelineMetrics;
use crate::protocol::{drain_ready, enter_barrier, probe, Outbox, Probe, StopSignal};

pub struct RecommenderConfig {
    pub global_inventory_high_water: usize,
    pub global_inventory_low_water: usize,
    pub p_in: f64,
    pub p_out: f64,
    pub probe_timeout: Duration,
    pub send_high_water_mark: usize,
    /// Suppress messages authored by a currently suspended/terminated user
    /// (§4.5's optional author-level post-filter).
    pub filter_shadow_authors: bool,
}

/// Global message inventory, kept here rather than in `DataManagerState`
/// since it is exclusively the Recommender's working set (§5's shared
/// resource partitioning).
pub struct GlobalInventory {
    messages: Vec<Message>,
    high_water: usize,
    low_water: usize,
    /// Authors the Recommender has seen flagged suspended/terminated in a
    /// User copy that passed through this cycle (§4.5's author-level
    /// post-filter — scoped to what the Recommender has actually observed,
    /// since it never round-trips to the Data Manager for this).
    shadow_authors: HashSet<Uid>,
}

impl GlobalInventory {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            messages: Vec::new(),
            high_water,
            low_water,
            shadow_authors: HashSet::new(),
        }
    }

    pub fn ingest(&mut self, batch: &[Message]) {
        self.messages.extend_from_slice(batch);
        if self.messages.len() > self.high_water {
            let keep_from = self.messages.len() - self.low_water;
            self.messages.drain(0..keep_from);
        }
    }

    pub fn note_author_policy(&mut self, uid: Uid, is_shadow: bool) {
        if is_shadow {
            self.shadow_authors.insert(uid);
        } else {
            self.shadow_authors.remove(&uid);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Splits `G` into messages authored by one of `friends` and everything
/// else (§4.5 step 2).
fn partition_in_out(
    inventory: &[Message],
    friends: &std::collections::HashSet<simsom_types::Uid>,
) -> (Vec<Message>, Vec<Message>) {
    inventory
        .iter()
        .cloned()
        .partition(|m| friends.contains(&m.uid))
}

/// De-duplicates reshare chains, weighting survivors by how many times their
/// root was seen (§4.5's `clean_feed`).
fn clean_feed(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by(|a, b| b.time.partial_cmp(&a.time).unwrap_or(std::cmp::Ordering::Equal));

    let mut weight: HashMap<Mid, usize> = HashMap::new();
    let mut seen_roots: HashMap<Mid, usize> = HashMap::new();
    let mut kept: Vec<(Message, usize)> = Vec::new();

    for message in messages.drain(..) {
        match message.reshared_original_id {
            None => kept.push((message, 0)),
            Some(root) => {
                *weight.entry(root).or_insert(0) += 1;
                if let std::collections::hash_map::Entry::Vacant(entry) = seen_roots.entry(root) {
                    entry.insert(kept.len());
                    kept.push((message, 0));
                }
            }
        }
    }

    for (message, slot_weight) in kept.iter_mut() {
        if let Some(root) = message.reshared_original_id {
            *slot_weight = *weight.get(&root).unwrap_or(&0);
        }
    }

    let mut indexed: Vec<(usize, Message, usize)> = kept
        .into_iter()
        .enumerate()
        .map(|(i, (m, w))| (i, m, w))
        .collect();
    indexed.sort_by(|a, b| {
        b.2.cmp(&a.2)
            .then_with(|| b.1.time.partial_cmp(&a.1.time).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.0.cmp(&b.0))
    });
    indexed.into_iter().map(|(_, m, _)| m).collect()
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Ranks by cosine similarity to `interests`, descending (§4.5).
fn rank_by_topic_similarity(mut messages: Vec<Message>, interests: &[f64]) -> Vec<Message> {
    if messages.is_empty() {
        return messages;
    }
    messages.sort_by(|a, b| {
        let sa = cosine_similarity(interests, &a.topics);
        let sb = cosine_similarity(interests, &b.topics);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
    messages
}

/// Builds one user's newsfeed from the current inventory snapshot (§4.5
/// steps 2-5).
fn build_feed(
    inventory: &[Message],
    shadow_authors: &HashSet<Uid>,
    item: &UserPackItem,
    cfg: &RecommenderConfig,
) -> Vec<Message> {
    let (in_messages, out_messages) = partition_in_out(inventory, &item.user.friends);

    let n_in = ((in_messages.len() as f64) * cfg.p_in).floor() as usize;
    let n_out = ((out_messages.len() as f64) * cfg.p_out).floor() as usize;

    let mut candidates: Vec<Message> = in_messages.into_iter().take(n_in).collect();
    candidates.extend(out_messages.into_iter().take(n_out));

    if cfg.filter_shadow_authors {
        candidates.retain(|m| !shadow_authors.contains(&m.uid));
    }

    let feed = clean_feed(candidates);
    let mut feed = rank_by_topic_similarity(feed, &item.user.topic_interest_vector);
    feed.truncate(item.user.cut_off);
    feed
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut inventory: GlobalInventory,
    mut mailbox: mpsc::Receiver<Envelope<RecommenderPayload>>,
    data_manager_tx: mpsc::Sender<Envelope<DataManagerPayload>>,
    analyzer_tx: mpsc::Sender<Envelope<AnalyzerPayload>>,
    pool_manager_tx: mpsc::Sender<Envelope<AgentPoolManagerPayload>>,
    mut stop: StopSignal,
    barrier: std::sync::Arc<Barrier>,
    cfg: RecommenderConfig,
    metrics: PipelineMetrics,
) -> Result<(), ProtocolError> {
    let mut data_manager_out = Outbox::new(data_manager_tx, cfg.send_high_water_mark);
    let mut analyzer_out = Outbox::new(analyzer_tx, cfg.send_high_water_mark);
    let mut pool_manager_out = Outbox::new(pool_manager_tx, cfg.send_high_water_mark);
    let mut error = None;

    loop {
        match probe(&mut mailbox, &mut stop, cfg.probe_timeout).await {
            Probe::Message(envelope) => {
                if let Err(err) = handle_envelope(
                    envelope,
                    &mut inventory,
                    &cfg,
                    &mut data_manager_out,
                    &mut analyzer_out,
                    &mut pool_manager_out,
                    &metrics,
                )
                .await
                {
                    warn!(%err, "recommender protocol error, escalating to STOP");
                    error = Some(err);
                    stop.trigger();
                    break;
                }
            }
            Probe::Quiescent => {
                warn!("recommender observed quiescence; escalating STOP");
                stop.trigger();
                break;
            }
            Probe::Stopped => break,
        }
    }

    for envelope in drain_ready(&mut mailbox) {
        let _ = handle_envelope(
            envelope,
            &mut inventory,
            &cfg,
            &mut data_manager_out,
            &mut analyzer_out,
            &mut pool_manager_out,
            &metrics,
        )
        .await;
    }
    data_manager_out.drain().await;
    analyzer_out.drain().await;
    pool_manager_out.drain().await;
    info!("recommender entering shutdown barrier");
    enter_barrier(&barrier).await;

    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_envelope(
    envelope: Envelope<RecommenderPayload>,
    inventory: &mut GlobalInventory,
    cfg: &RecommenderConfig,
    data_manager_out: &mut Outbox<Envelope<DataManagerPayload>>,
    analyzer_out: &mut Outbox<Envelope<AnalyzerPayload>>,
    pool_manager_out: &mut Outbox<Envelope<AgentPoolManagerPayload>>,
    metrics: &PipelineMetrics,
) -> Result<(), ProtocolError> {
    match envelope.body {
        RecommenderPayload::DataRequest => {
            if envelope.sender != SenderRole::AgntPoolMngr {
                return Err(ProtocolError::UnexpectedSender {
                    sender: envelope.sender,
                });
            }
            data_manager_out
                .send(Envelope::new(SenderRole::RecSys, DataManagerPayload::DataRequest))
                .await;
            Ok(())
        }
        RecommenderPayload::DataReply { batch, firehose } => {
            if envelope.sender != SenderRole::DataMngr {
                return Err(ProtocolError::UnexpectedSender {
                    sender: envelope.sender,
                });
            }
            let mut users = Vec::with_capacity(batch.len());
            let mut activities = Vec::new();
            let mut passivities: Vec<View> = Vec::new();
            for item in &batch {
                activities.extend(item.outgoing_active.iter().cloned());
                passivities.extend(item.outgoing_passive.iter().cloned());
            }

            // §4.5 step 1: append this cycle's active actions to `G`, not the
            // pass-through firehose chunk (that's forwarded to the Analyzer
            // verbatim, never ingested here).
            inventory.ingest(&activities);
            metrics.global_inventory_depth.set(inventory.len() as i64);

            for item in &batch {
                inventory.note_author_policy(item.user.uid, item.user.is_shadow());
            }
            let snapshot = inventory_snapshot(inventory);
            let shadow_authors = inventory.shadow_authors.clone();

            for mut item in batch {
                let feed = build_feed(&snapshot, &shadow_authors, &item, cfg);
                item.user.newsfeed = feed;
                users.push(item.user);
            }

            analyzer_out
                .send(Envelope::new(
                    SenderRole::RecSys,
                    AnalyzerPayload {
                        users: users.clone(),
                        activities,
                        passivities,
                        firehose,
                    },
                ))
                .await;
            pool_manager_out
                .send(Envelope::new(
                    SenderRole::RecSys,
                    AgentPoolManagerPayload { users },
                ))
                .await;
            Ok(())
        }
    }
}

fn inventory_snapshot(inventory: &GlobalInventory) -> Vec<Message> {
    inventory.messages.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    fn msg(mid: Mid, uid: simsom_types::Uid, time: f64, root: Option<Mid>) -> Message {
        Message {
            mid,
            uid,
            quality: 0.5,
            appeal: 0.5,
            topics: vec![1.0, 0.0],
            time: Some(time),
            reshared_id: root,
            reshared_original_id: root,
            reshared_user_id: if root.is_some() { Some(uid) } else { None },
        }
    }

    #[test]
    fn clean_feed_keeps_only_first_occurrence_per_reshare_root() {
        let messages = vec![
            msg(1, 0, 3.0, None),
            msg(2, 1, 2.0, Some(1)),
            msg(3, 2, 1.0, Some(1)),
        ];
        let cleaned = clean_feed(messages);
        let root_mids: Vec<Mid> = cleaned.iter().map(|m| m.mid).collect();
        assert!(root_mids.contains(&1));
        assert!(!(root_mids.contains(&2) && root_mids.contains(&3)));
    }

    #[test]
    fn rank_by_topic_similarity_sorts_descending() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut close = msg(1, 0, 1.0, None);
        close.topics = vec![1.0, 0.0];
        let mut far = msg(2, 0, 1.0, None);
        far.topics = vec![0.0, 1.0];
        let _ = &mut rng;
        let ranked = rank_by_topic_similarity(vec![far.clone(), close.clone()], &[1.0, 0.0]);
        assert_eq!(ranked[0].mid, close.mid);
    }

    #[test]
    fn empty_message_list_ranks_to_empty() {
        let ranked = rank_by_topic_similarity(vec![], &[1.0, 0.0]);
        assert!(ranked.is_empty());
    }

    #[test]
    fn global_inventory_truncates_to_low_water_on_overflow() {
        let mut inventory = GlobalInventory::new(4, 2);
        let batch: Vec<Message> = (0..6).map(|i| msg(i, 0, i as f64, None)).collect();
        inventory.ingest(&batch);
        assert!(inventory.len() <= 4);
    }

    #[test]
    fn partition_in_out_separates_by_author_friendship() {
        let mut friends = HashSet::new();
        friends.insert(1u64);
        let inventory = vec![msg(1, 1, 1.0, None), msg(2, 9, 1.0, None)];
        let (in_messages, out_messages) = partition_in_out(&inventory, &friends);
        assert_eq!(in_messages.len(), 1);
        assert_eq!(out_messages.len(), 1);
    }
}
