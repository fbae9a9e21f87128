use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    ids::Uid,
    message::QualityParams,
    policy::PolicyState,
    Message,
};

/// Authoritative record of a simulated user. Owned by the Data Manager;
/// copies travel through the pipeline with Workers and are reconciled back
/// on return (§4.2's "replace `users_by_uid`" rule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: Uid,
    pub friends: HashSet<Uid>,
    pub followers: HashSet<Uid>,
    pub mean_action_per_day: f64,
    pub cut_off: usize,
    pub topic_interest_vector: Vec<f64>,
    pub newsfeed: Vec<Message>,
    pub quality_params: Option<QualityParams>,

    pub post_count: u64,
    pub repost_count: u64,
    pub view_count: u64,

    pub policy: PolicyState,
}

impl User {
    pub fn new(
        uid: Uid,
        friends: HashSet<Uid>,
        followers: HashSet<Uid>,
        mean_action_per_day: f64,
        topic_interest_vector: Vec<f64>,
        quality_params: Option<QualityParams>,
    ) -> Self {
        let cut_off = (mean_action_per_day.ceil() as usize).max(15);
        Self {
            uid,
            friends,
            followers,
            mean_action_per_day,
            cut_off,
            topic_interest_vector,
            newsfeed: Vec::new(),
            quality_params,
            post_count: 0,
            repost_count: 0,
            view_count: 0,
            policy: PolicyState::default(),
        }
    }

    /// Whether `G`'s author-level post-filter (§4.5) should suppress this
    /// author's content from other users' feeds.
    pub fn is_shadow(&self) -> bool {
        self.policy.is_suspended || self.policy.is_terminated
    }
}

/// Draws a sparse, fixed-length interest vector over `n_topics`: each of
/// `n_active` randomly chosen topics gets a positive weight, the rest are 0.
/// Grounded in `user.py: generate_user_topics` — interests are sparse, not
/// dense-random, so topic-similarity ranking is meaningful.
pub fn generate_user_topics(n_topics: usize, n_active: usize, rng: &mut impl Rng) -> Vec<f64> {
    let mut topics = vec![0.0; n_topics];
    let n_active = n_active.min(n_topics);
    let mut indices: Vec<usize> = (0..n_topics).collect();
    for i in 0..n_active {
        let j = rng.gen_range(i..n_topics);
        indices.swap(i, j);
        topics[indices[i]] = rng.gen_range(0.1..=1.0);
    }
    topics
}

/// Derives a message's topic vector from its author's interests: mostly a
/// copy, with a small chance of drifting onto an out-of-interest topic so
/// in-network/out-of-network similarity isn't trivially 1.0.
/// Grounded in `message.py: generate_message_vector`.
pub fn generate_message_topics(
    author_topics: &[f64],
    noise_probability: f64,
    rng: &mut impl Rng,
) -> Vec<f64> {
    let mut topics = author_topics.to_vec();
    if rng.gen_bool(noise_probability) && !topics.is_empty() {
        let idx = rng.gen_range(0..topics.len());
        topics[idx] = rng.gen_range(0.1..=1.0);
    }
    topics
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn generated_topics_are_sparse() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let topics = generate_user_topics(15, 3, &mut rng);
        assert_eq!(topics.len(), 15);
        assert_eq!(topics.iter().filter(|&&w| w > 0.0).count(), 3);
    }

    #[test]
    fn cut_off_defaults_to_at_least_fifteen() {
        let user = User::new(0, HashSet::new(), HashSet::new(), 2.0, vec![], None);
        assert_eq!(user.cut_off, 15);
        let heavy = User::new(1, HashSet::new(), HashSet::new(), 40.0, vec![], None);
        assert_eq!(heavy.cut_off, 40);
    }
}
