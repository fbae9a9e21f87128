use rand::{Rng, RngCore};
use rand_distr::{Distribution, Poisson};

use crate::{
    ids::{Mid, Vid},
    user::generate_message_topics,
    Message, User, View,
};

/// External contract a Worker drives: given a user, produce the actions it
/// takes this cycle and mutate `user.newsfeed`/counters in place. Per §1 the
/// exact policy is an external collaborator of the pipeline — this crate
/// ships [`DefaultActionGenerator`] so the pipeline is runnable standalone,
/// but any implementation can be substituted.
pub trait ActionGenerator<R: RngCore>: Send {
    fn act(
        &mut self,
        user: &mut User,
        mid_alloc: &mut dyn FnMut() -> Mid,
        vid_alloc: &mut dyn FnMut() -> Vid,
        rng: &mut R,
    ) -> (Vec<Message>, Vec<View>);
}

/// Grounded in `user.py: make_actions` / `reshare_message` / `post_message`.
/// Each cycle, for a budget of actions drawn as `Poisson(mean_action_per_day)`
/// (floored at 1, mirroring `user.py`'s `post_per_day` loop bound), the user
/// either posts a new original (probability `mu`) or scans its newsfeed
/// recording a [`View`] per item until one clears a random appeal threshold
/// and is reshared (falling back to a uniform pick if none does).
pub struct DefaultActionGenerator {
    pub mu: f64,
    pub noise_probability: f64,
}

impl Default for DefaultActionGenerator {
    fn default() -> Self {
        Self {
            mu: 0.5,
            noise_probability: 0.1,
        }
    }
}

fn action_budget(mean_action_per_day: f64, rng: &mut impl Rng) -> usize {
    let mean = mean_action_per_day.max(f64::EPSILON);
    Poisson::new(mean)
        .map(|dist| dist.sample(rng).round() as usize)
        .unwrap_or(1)
        .max(1)
}

impl<R: RngCore> ActionGenerator<R> for DefaultActionGenerator {
    fn act(
        &mut self,
        user: &mut User,
        mid_alloc: &mut dyn FnMut() -> Mid,
        vid_alloc: &mut dyn FnMut() -> Vid,
        rng: &mut R,
    ) -> (Vec<Message>, Vec<View>) {
        let mut messages = Vec::new();
        let mut views = Vec::new();
        let is_shadow = user.is_shadow();
        let budget = action_budget(user.mean_action_per_day, rng);

        for _ in 0..budget {
            let post_roll: f64 = rng.gen();
            if post_roll < self.mu || user.newsfeed.is_empty() {
                let topics =
                    generate_message_topics(&user.topic_interest_vector, self.noise_probability, rng);
                let message = Message::new_post(
                    mid_alloc(),
                    user.uid,
                    topics,
                    user.quality_params,
                    is_shadow,
                    rng,
                );
                user.post_count += 1;
                messages.push(message);
                continue;
            }

            let threshold: f64 = rng.gen();
            let mut reshare_target = None;
            for item in &user.newsfeed {
                views.push(View {
                    vid: vid_alloc(),
                    uid: user.uid,
                    parent_mid: item.mid,
                    parent_uid: item.uid,
                });
                user.view_count += 1;
                if item.appeal >= threshold {
                    reshare_target = Some(item.clone());
                    break;
                }
            }
            let target = reshare_target.unwrap_or_else(|| {
                let idx = rng.gen_range(0..user.newsfeed.len());
                user.newsfeed[idx].clone()
            });
            let reshare = Message::new_reshare(mid_alloc(), user.uid, &target, is_shadow);
            user.repost_count += 1;
            messages.push(reshare);
        }

        (messages, views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    #[test]
    fn empty_newsfeed_always_posts() {
        // A near-zero mean keeps the Poisson-drawn action budget at its
        // floor of 1, so the single-post assertion below stays exact.
        let mut user = User::new(0, HashSet::new(), HashSet::new(), 1e-6, vec![1.0], None);
        let mut gen = DefaultActionGenerator {
            mu: 0.0,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut next_mid = 1u64;
        let mut next_vid = 1u64;
        let (messages, views) = ActionGenerator::<ChaCha8Rng>::act(
            &mut gen,
            &mut user,
            &mut || {
                let m = next_mid;
                next_mid += 1;
                m
            },
            &mut || {
                let v = next_vid;
                next_vid += 1;
                v
            },
            &mut rng,
        );
        assert_eq!(messages.len(), 1);
        assert!(views.is_empty());
        assert!(messages[0].is_original());
    }

    #[test]
    fn reshare_records_views_for_scanned_items() {
        // Same near-zero mean as above: pins the action budget to 1 so the
        // scan only sees the newsfeed once.
        let mut user = User::new(1, HashSet::new(), HashSet::new(), 1e-6, vec![1.0], None);
        let mut seed_rng = ChaCha8Rng::seed_from_u64(5);
        for i in 0..3 {
            user.newsfeed.push(Message::new_post(
                100 + i,
                2,
                vec![1.0],
                None,
                false,
                &mut seed_rng,
            ));
        }
        let mut gen = DefaultActionGenerator {
            mu: 0.0,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut next_mid = 1000u64;
        let mut next_vid = 1u64;
        let (messages, _views) = ActionGenerator::<ChaCha8Rng>::act(
            &mut gen,
            &mut user,
            &mut || {
                let m = next_mid;
                next_mid += 1;
                m
            },
            &mut || {
                let v = next_vid;
                next_vid += 1;
                v
            },
            &mut rng,
        );
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].is_original());
    }
}
