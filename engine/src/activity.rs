//! Per-day action-count model layered on top of the Data Manager's
//! activity-sampled scheduling (§4.2: "Markov activity-state model or
//! Poisson" daily sampling). The two-state Markov model's transition
//! probabilities are genuinely underspecified upstream — `original_source`
//! does not carry a complete Markov implementation — so the shape here is
//! decided by this crate and recorded in DESIGN.md.

use std::collections::HashMap;

use rand::Rng;
use rand_distr::{Distribution, Poisson};

use simsom_types::Uid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Active,
    Dormant,
}

/// Selects between the two-state Markov model and a plain unconditional
/// Poisson draw every day.
pub enum ActivityModel {
    Markov {
        state: HashMap<Uid, ActivityState>,
        p_active_to_active: f64,
        p_dormant_to_active: f64,
    },
    Poisson,
}

impl ActivityModel {
    pub fn markov(p_active_to_active: f64, p_dormant_to_active: f64) -> Self {
        Self::Markov {
            state: HashMap::new(),
            p_active_to_active: p_active_to_active.clamp(0.0, 1.0),
            p_dormant_to_active: p_dormant_to_active.clamp(0.0, 1.0),
        }
    }

    pub fn poisson() -> Self {
        Self::Poisson
    }

    /// Draws this user's action count for the upcoming day, advancing any
    /// Markov state in place. A Dormant day always yields 0; an Active day
    /// (Markov) or the Poisson fallback draws `Poisson(mean_action_per_day)`,
    /// floored at 1 for Markov-active users per §4.2.
    pub fn draw_count(&mut self, uid: Uid, mean_action_per_day: f64, rng: &mut impl Rng) -> usize {
        match self {
            ActivityModel::Poisson => sample_poisson(mean_action_per_day, rng),
            ActivityModel::Markov {
                state,
                p_active_to_active,
                p_dormant_to_active,
            } => {
                let current = *state.get(&uid).unwrap_or(&ActivityState::Active);
                let becomes_active = match current {
                    ActivityState::Active => rng.gen_bool(*p_active_to_active),
                    ActivityState::Dormant => rng.gen_bool(*p_dormant_to_active),
                };
                let next = if becomes_active {
                    ActivityState::Active
                } else {
                    ActivityState::Dormant
                };
                state.insert(uid, next);
                match next {
                    ActivityState::Active => sample_poisson(mean_action_per_day, rng).max(1),
                    ActivityState::Dormant => 0,
                }
            }
        }
    }
}

fn sample_poisson(mean: f64, rng: &mut impl Rng) -> usize {
    let mean = mean.max(f64::EPSILON);
    Poisson::new(mean)
        .map(|dist| dist.sample(rng).round() as usize)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn markov_dormant_day_has_zero_actions() {
        let mut model = ActivityModel::markov(0.0, 0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let first = model.draw_count(0, 3.0, &mut rng);
        let second = model.draw_count(0, 3.0, &mut rng);
        assert_eq!(first, 0);
        assert_eq!(second, 0);
    }

    #[test]
    fn markov_always_active_user_never_idles() {
        let mut model = ActivityModel::markov(1.0, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..20 {
            assert!(model.draw_count(7, 2.0, &mut rng) >= 1);
        }
    }

    #[test]
    fn poisson_model_stays_within_a_sane_range() {
        let mut model = ActivityModel::poisson();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..20 {
            assert!(model.draw_count(0, 2.0, &mut rng) < 50);
        }
    }
}
