//! Clock / action-schedule generator (§4.1). Two equivalent designs,
//! grounded in `original_source/libs/simsom/clock_manager.py`: a per-day
//! pre-materialized schedule (Variant B, the default) and a rate-driven
//! inter-event generator (Variant A). Both satisfy the same contract:
//! `next_timestamp` is total, monotonically non-decreasing, and never
//! blocks.

use std::collections::VecDeque;

use rand::Rng;
use rand_distr::{Distribution, LogNormal};

const CIRCADIAN_GRID_POINTS: usize = 10_000;

/// Two-Gaussian-peak-plus-baseline circadian PDF, grounded in
/// `clock_manager.py: _circadian_pdf`.
fn circadian_pdf(t: f64) -> f64 {
    let morning = 0.6 * (-0.5 * ((t - 0.3) / 0.1).powi(2)).exp();
    let evening = 0.9 * (-0.5 * ((t - 0.7) / 0.15).powi(2)).exp();
    morning + evening + 0.2
}

/// Caches the circadian CDF on a fixed grid and inverse-samples it by linear
/// interpolation, avoiding rebuilding it on every timestamp draw.
struct CircadianCdf {
    grid: Vec<f64>,
    cdf: Vec<f64>,
    mean_density: f64,
}

impl CircadianCdf {
    fn build() -> Self {
        let n = CIRCADIAN_GRID_POINTS;
        let mut grid = Vec::with_capacity(n + 1);
        let mut density = Vec::with_capacity(n + 1);
        for i in 0..=n {
            let t = i as f64 / n as f64;
            grid.push(t);
            density.push(circadian_pdf(t));
        }
        let mean_density = density.iter().sum::<f64>() / density.len() as f64;

        let mut cdf = Vec::with_capacity(n + 1);
        let mut acc = 0.0;
        cdf.push(0.0);
        for i in 1..=n {
            acc += (density[i] + density[i - 1]) / 2.0 * (grid[i] - grid[i - 1]);
            cdf.push(acc);
        }
        let total = *cdf.last().unwrap();
        for v in &mut cdf {
            *v /= total;
        }

        Self {
            grid,
            cdf,
            mean_density,
        }
    }

    /// Inverse-CDF sample: finds the bracketing grid points for `u` and
    /// linearly interpolates within them.
    fn sample(&self, u: f64) -> f64 {
        match self.cdf.binary_search_by(|probe| probe.partial_cmp(&u).unwrap()) {
            Ok(idx) => self.grid[idx],
            Err(0) => self.grid[0],
            Err(idx) if idx >= self.cdf.len() => *self.grid.last().unwrap(),
            Err(idx) => {
                let (lo_cdf, hi_cdf) = (self.cdf[idx - 1], self.cdf[idx]);
                let (lo_t, hi_t) = (self.grid[idx - 1], self.grid[idx]);
                let span = hi_cdf - lo_cdf;
                if span <= f64::EPSILON {
                    lo_t
                } else {
                    lo_t + (u - lo_cdf) / span * (hi_t - lo_t)
                }
            }
        }
    }

    fn density_at(&self, t: f64) -> f64 {
        circadian_pdf(t.fract())
    }
}

/// Variant B — per-day pre-materialized schedule (the default).
pub struct PreMaterializedClock {
    day_index: u64,
    timestamps_today: VecDeque<f64>,
    pending_day_requests: VecDeque<Vec<usize>>,
    extra_overflow_count: u64,
    cdf: CircadianCdf,
}

impl PreMaterializedClock {
    pub fn new() -> Self {
        Self {
            day_index: 0,
            timestamps_today: VecDeque::new(),
            pending_day_requests: VecDeque::new(),
            extra_overflow_count: 0,
            cdf: CircadianCdf::build(),
        }
    }

    /// Enqueues a new day's schedule if the current day still has
    /// outstanding timestamps; otherwise materializes it immediately.
    pub fn start_new_day(&mut self, daily_action_counts: &[usize], rng: &mut impl Rng) {
        if !self.timestamps_today.is_empty() {
            self.pending_day_requests.push_back(daily_action_counts.to_vec());
            return;
        }
        self.materialize_day(daily_action_counts, rng);
    }

    fn materialize_day(&mut self, counts: &[usize], rng: &mut impl Rng) {
        let total: usize = counts.iter().sum();
        let base = self.day_index as f64;
        let mut timestamps: Vec<f64> = (0..total)
            .map(|_| base + self.cdf.sample(rng.gen::<f64>()))
            .collect();
        timestamps.sort_by(|a, b| a.partial_cmp(b).unwrap());
        self.timestamps_today = timestamps.into();
        self.day_index += 1;
        self.extra_overflow_count = 0;
    }

    /// Pops the next timestamp. When the current day is exhausted, starts
    /// the next queued day automatically; when none is queued, emits
    /// strictly increasing fallback values bounded just inside the
    /// previously exhausted day (`clock_manager.py: next_timestamp` Case 1).
    pub fn next_timestamp(&mut self, rng: &mut impl Rng) -> f64 {
        if let Some(t) = self.timestamps_today.pop_front() {
            return t;
        }
        if let Some(counts) = self.pending_day_requests.pop_front() {
            self.materialize_day(&counts, rng);
            return self.next_timestamp(rng);
        }
        self.extra_overflow_count += 1;
        let previous_day = self.day_index.saturating_sub(1) as f64;
        previous_day + 0.999_999 + self.extra_overflow_count as f64 * 1e-6
    }

    pub fn current_day(&self) -> u64 {
        self.day_index
    }
}

impl Default for PreMaterializedClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Variant A — rate-driven inter-event generator.
pub struct RateDrivenClock {
    n_users: usize,
    puda: f64,
    current_time: f64,
    log_normal_sigma: f64,
    spike_probability: f64,
    spike_factor_range: (f64, f64),
    spike_remaining: u32,
    spike_factor: f64,
    spike_is_burst: bool,
    cdf: CircadianCdf,
}

impl RateDrivenClock {
    pub fn new(n_users: usize, puda: f64) -> Self {
        Self {
            n_users: n_users.max(1),
            puda: puda.max(f64::EPSILON),
            current_time: 0.0,
            log_normal_sigma: 0.5,
            spike_probability: 0.01,
            spike_factor_range: (2.0, 5.0),
            spike_remaining: 0,
            spike_factor: 1.0,
            spike_is_burst: true,
            cdf: CircadianCdf::build(),
        }
    }

    fn expected_mean_delta(&self) -> f64 {
        1.0 / (self.n_users as f64 * self.puda)
    }

    fn draw_base_delta(&self, rng: &mut impl Rng) -> f64 {
        let mean = self.expected_mean_delta();
        let sigma = self.log_normal_sigma;
        let mu = mean.ln() - sigma * sigma / 2.0;
        LogNormal::new(mu, sigma)
            .expect("log-normal params derived from a positive mean")
            .sample(rng)
    }

    fn maybe_enter_spike(&mut self, rng: &mut impl Rng) {
        if self.spike_remaining > 0 {
            self.spike_remaining -= 1;
            if self.spike_remaining == 0 {
                self.spike_factor = 1.0;
            }
            return;
        }
        if rng.gen_bool(self.spike_probability) {
            self.spike_is_burst = rng.gen_bool(0.5);
            let (lo, hi) = self.spike_factor_range;
            let factor = rng.gen_range(lo..=hi);
            self.spike_factor = if self.spike_is_burst { 1.0 / factor } else { factor };
            self.spike_remaining = rng.gen_range(1..=5);
        }
    }

    fn circadian_factor(&self) -> f64 {
        self.cdf.density_at(self.current_time) / self.cdf.mean_density
    }

    /// Draws a base delta, applies any active spike regime and circadian
    /// modulation, advances the clock, and returns the pre-advance value.
    pub fn next_time(&mut self, rng: &mut impl Rng) -> f64 {
        self.maybe_enter_spike(rng);
        let delta = self.draw_base_delta(rng) * self.spike_factor * self.circadian_factor();
        let previous = self.current_time;
        self.current_time += delta.max(0.0);
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn pre_materialized_timestamps_are_sorted_within_a_day() {
        let mut clock = PreMaterializedClock::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        clock.start_new_day(&[3, 0, 5, 2], &mut rng);
        let mut last = f64::MIN;
        for _ in 0..10 {
            let t = clock.next_timestamp(&mut rng);
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn exhausted_day_with_no_queue_falls_back_strictly_increasing() {
        let mut clock = PreMaterializedClock::new();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        clock.start_new_day(&[1], &mut rng);
        let first = clock.next_timestamp(&mut rng);
        assert!(first < 1.0);
        let fallback_a = clock.next_timestamp(&mut rng);
        let fallback_b = clock.next_timestamp(&mut rng);
        assert!(fallback_b > fallback_a);
        assert!(fallback_a >= 0.999_999 && fallback_a < 1.0);
    }

    #[test]
    fn queued_next_day_starts_automatically_on_exhaustion() {
        let mut clock = PreMaterializedClock::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        clock.start_new_day(&[1], &mut rng);
        clock.start_new_day(&[2], &mut rng); // queued, since day 0 still has a timestamp
        let day0 = clock.next_timestamp(&mut rng);
        assert!(day0 < 1.0);
        let day1_a = clock.next_timestamp(&mut rng);
        let day1_b = clock.next_timestamp(&mut rng);
        assert!((1.0..2.0).contains(&day1_a));
        assert!((1.0..2.0).contains(&day1_b));
    }

    #[test]
    fn rate_driven_clock_is_monotonic() {
        let mut clock = RateDrivenClock::new(100, 2.0);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut last = 0.0;
        for _ in 0..500 {
            let t = clock.next_time(&mut rng);
            assert!(t >= last);
            last = t;
        }
    }
}
