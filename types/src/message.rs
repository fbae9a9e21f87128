use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::ids::{Mid, Uid};

/// Quality distribution parameters for a single author: `(alpha, beta, lower, upper)`.
///
/// Samples are drawn from `Beta(alpha, beta)` and rejected until one falls
/// within `[lower, upper]`.
pub type QualityParams = (f64, f64, f64, f64);

/// A value object carried through newsfeeds and the firehose.
///
/// `time` is unset until the Data Manager timestamps it; every other field is
/// fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub mid: Mid,
    pub uid: Uid,
    pub quality: f64,
    pub appeal: f64,
    pub topics: Vec<f64>,
    pub time: Option<f64>,
    pub reshared_id: Option<Mid>,
    pub reshared_original_id: Option<Mid>,
    pub reshared_user_id: Option<Uid>,
}

impl Message {
    /// Construct an original post. `is_shadow` forces `appeal = 0`, matching
    /// suspended authors never having their posts picked up for reshare.
    pub fn new_post(
        mid: Mid,
        uid: Uid,
        topics: Vec<f64>,
        quality_params: Option<QualityParams>,
        is_shadow: bool,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            mid,
            uid,
            quality: sample_quality(quality_params, rng),
            appeal: sample_appeal(is_shadow, rng),
            topics,
            time: None,
            reshared_id: None,
            reshared_original_id: None,
            reshared_user_id: None,
        }
    }

    /// Construct a reshare of `target`, authored by `uid`. Copies
    /// `quality`/`appeal`/`topics` from the target (reshares don't invent new
    /// content) and threads the chain's root forward.
    pub fn new_reshare(mid: Mid, uid: Uid, target: &Message, is_shadow: bool) -> Self {
        let reshared_original_id = target.reshared_original_id.unwrap_or(target.mid);
        Self {
            mid,
            uid,
            quality: target.quality,
            appeal: if is_shadow { 0.0 } else { target.appeal },
            topics: target.topics.clone(),
            time: None,
            reshared_id: Some(target.mid),
            reshared_original_id: Some(reshared_original_id),
            reshared_user_id: Some(target.uid),
        }
    }

    pub fn is_original(&self) -> bool {
        self.reshared_original_id.is_none()
    }

    /// Root of the reshare chain, or `self.mid` for an original.
    pub fn chain_root(&self) -> Mid {
        self.reshared_original_id.unwrap_or(self.mid)
    }
}

/// Right-skewed appeal via inverse-transform sampling: `a = 1 - (1-u)^(1/exponent)`.
/// Larger `exponent` means rarer high-appeal values. Shadow-banned authors
/// always get zero appeal so `reshare` scans never pick their posts up.
fn sample_appeal(is_shadow: bool, rng: &mut impl Rng) -> f64 {
    if is_shadow {
        return 0.0;
    }
    const EXPONENT: f64 = 5.0;
    let u: f64 = rng.gen();
    1.0 - (1.0 - u).powf(1.0 / EXPONENT)
}

/// Beta-distributed quality within an author's configured bounds, falling
/// back to an exponential-decay sampler when no params are configured.
fn sample_quality(params: Option<QualityParams>, rng: &mut impl Rng) -> f64 {
    match params {
        Some((alpha, beta, lower, upper)) => {
            let dist = Beta::new(alpha, beta).expect("quality beta params must be positive");
            loop {
                let quality = dist.sample(rng);
                if quality >= lower && quality <= upper {
                    return (quality * 100.0).round() / 100.0;
                }
            }
        }
        None => expon_quality(rng),
    }
}

/// `f(x) ~ C e^{-lambda x}`, 0<=x<=1, sampled via inverse-transform.
fn expon_quality(rng: &mut impl Rng) -> f64 {
    const LAMBDA: f64 = -5.0;
    let x: f64 = rng.gen();
    (1.0 - x + x * (-LAMBDA).exp()).ln() / -LAMBDA
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn shadow_authors_have_zero_appeal() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let m = Message::new_post(1, 9, vec![0.1, 0.2], None, true, &mut rng);
        assert_eq!(m.appeal, 0.0);
    }

    #[test]
    fn reshare_threads_chain_root_through_multiple_hops() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let original = Message::new_post(1, 0, vec![1.0], None, false, &mut rng);
        let hop1 = Message::new_reshare(2, 1, &original, false);
        let hop2 = Message::new_reshare(3, 2, &hop1, false);
        assert_eq!(hop2.reshared_original_id, Some(original.mid));
        assert_eq!(hop2.reshared_id, Some(hop1.mid));
        assert_eq!(hop2.chain_root(), original.mid);
    }

    #[test]
    fn beta_quality_respects_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let m = Message::new_post(1, 1, vec![], Some((2.0, 2.0, 0.2, 0.6)), false, &mut rng);
            assert!(m.quality >= 0.2 && m.quality <= 0.6);
        }
    }
}
