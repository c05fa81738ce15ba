//! Damping and update-interval schedules
//!
//! Damping follows a modified Tikhonov scheme (arXiv:1811.12019): a two-value
//! list `[d0, d1]` starts at `d0` and relaxes log-linearly toward `d1` over the
//! warmup horizon. The factor update interval either stays constant or ramps
//! linearly between two bounds.

use crate::config::KfacConfig;
use serde::{Deserialize, Serialize};

/// Next damping value for a 1- or 2-element parameter list
///
/// With one element the value is constant. With two, the decay rate is
/// `alpha = 2 log10(p0 / p1) / warmup_steps` and the result is
/// `(1 - alpha) * previous + alpha * p1`.
pub fn advance_damping(previous: f64, params: &[f64], warmup_steps: f64) -> f64 {
    match params {
        [] => previous,
        [only] => *only,
        [start, target, ..] => {
            let alpha = 2.0 * (start / target).log10() / warmup_steps;
            (1.0 - alpha) * previous + alpha * target
        }
    }
}

/// Factor update interval at a given global step
///
/// Ramps linearly from `bounds[0]` at step 0 to `bounds[1]` at
/// `interval_steps`, truncating to an integer and holding `bounds[1]` after.
pub fn advance_interval(step: usize, bounds: &[usize], interval_steps: usize) -> usize {
    match bounds {
        [] => 1,
        [only] => *only,
        [start, end, ..] => {
            let progress = if interval_steps == 0 {
                1.0
            } else {
                (step as f64 / interval_steps as f64).min(1.0)
            };
            let value = *start as f64 + (*end as f64 - *start as f64) * progress;
            let (lo, hi) = if start <= end { (*start, *end) } else { (*end, *start) };
            (value as usize).clamp(lo, hi)
        }
    }
}

/// The four independently scheduled damping values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DampingState {
    pub act: f64,
    pub err: f64,
    pub bn_act: f64,
    pub bn_err: f64,
}

/// Damping and update-interval state, advanced once per training step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KfacScheduler {
    damping_act_params: Vec<f64>,
    damping_err_params: Vec<f64>,
    damping_bn_act_params: Vec<f64>,
    damping_bn_err_params: Vec<f64>,
    damping_warmup_steps: usize,
    update_intervals: Vec<usize>,
    update_interval_steps: usize,
    damping: DampingState,
    update_interval: usize,
}

impl KfacScheduler {
    pub fn new(config: &KfacConfig) -> Self {
        let first = |params: &[f64]| params.first().copied().unwrap_or(crate::config::DAMPING_DEFAULT);
        Self {
            damping: DampingState {
                act: first(&config.damping_act),
                err: first(&config.damping_err),
                bn_act: first(&config.damping_bn_act),
                bn_err: first(&config.damping_bn_err),
            },
            update_interval: config.update_intervals.first().copied().unwrap_or(1),
            damping_act_params: config.damping_act.clone(),
            damping_err_params: config.damping_err.clone(),
            damping_bn_act_params: config.damping_bn_act.clone(),
            damping_bn_err_params: config.damping_bn_err.clone(),
            damping_warmup_steps: config.damping_warmup_steps,
            update_intervals: config.update_intervals.clone(),
            update_interval_steps: config.update_interval_steps,
        }
    }

    /// Advance all damping values and recompute the update interval
    pub fn step(&mut self, global_step: usize) {
        let warmup = self.damping_warmup_steps as f64;
        self.damping = DampingState {
            act: advance_damping(self.damping.act, &self.damping_act_params, warmup),
            err: advance_damping(self.damping.err, &self.damping_err_params, warmup),
            bn_act: advance_damping(self.damping.bn_act, &self.damping_bn_act_params, warmup),
            bn_err: advance_damping(self.damping.bn_err, &self.damping_bn_err_params, warmup),
        };
        self.update_interval =
            advance_interval(global_step, &self.update_intervals, self.update_interval_steps).max(1);
    }

    pub fn damping(&self) -> DampingState {
        self.damping
    }

    pub fn update_interval(&self) -> usize {
        self.update_interval
    }

    /// Whether factors must be refreshed at this step
    pub fn is_update_step(&self, global_step: usize) -> bool {
        global_step % self.update_interval == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value_damping_is_constant() {
        for previous in [0.0, 0.5, 10.0] {
            for warmup in [1.0, 100.0, 1e6] {
                assert_eq!(advance_damping(previous, &[0.03], warmup), 0.03);
            }
        }
    }

    #[test]
    fn test_two_value_damping_converges() {
        let params = [4.0, 1.0];
        let warmup = 2.0 * 4.0_f64.log10();
        let mut value = params[0];
        let mut last = value;
        for _ in 0..(warmup.ceil() as usize) {
            value = advance_damping(value, &params, warmup);
            assert!(value <= last + 1e-12);
            assert!(value >= params[1] - 1e-12);
            last = value;
        }
        assert!((value - params[1]).abs() / params[1] < 0.01);
    }

    #[test]
    fn test_long_warmup_decays_monotonically() {
        let params = [1e-1, 1e-3];
        let warmup = 200.0;
        let mut value = params[0];
        for _ in 0..500 {
            let next = advance_damping(value, &params, warmup);
            assert!(next <= value);
            assert!(next > params[1]);
            value = next;
        }
        assert!((value - params[1]).abs() / params[1] < 0.01);
    }

    #[test]
    fn test_interval_ramp() {
        assert_eq!(advance_interval(0, &[1, 5], 8), 1);
        assert_eq!(advance_interval(4, &[1, 5], 8), 3);
        assert_eq!(advance_interval(8, &[1, 5], 8), 5);
        assert_eq!(advance_interval(1000, &[1, 5], 8), 5);
        assert_eq!(advance_interval(3, &[7], 8), 7);
        assert_eq!(advance_interval(3, &[1, 5], 0), 5);
    }

    #[test]
    fn test_scheduler_tracks_config() {
        let config = KfacConfig {
            damping_act: vec![0.5, 0.05],
            update_intervals: vec![2, 6],
            update_interval_steps: 4,
            ..KfacConfig::default()
        };
        let mut scheduler = KfacScheduler::new(&config);
        assert_eq!(scheduler.damping().act, 0.5);

        scheduler.step(0);
        assert!(scheduler.damping().act < 0.5);
        assert_eq!(scheduler.damping().err, config.damping_err[0]);
        assert_eq!(scheduler.update_interval(), 2);
        assert!(scheduler.is_update_step(0));

        scheduler.step(4);
        assert_eq!(scheduler.update_interval(), 6);
        assert!(!scheduler.is_update_step(4));
        assert!(scheduler.is_update_step(6));
    }
}
