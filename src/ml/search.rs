//! Tree-structured Parzen estimator search over booster hyperparameters.
//!
//! Each trial is a point in the unit cube, one coordinate per searched
//! parameter (log-scaled where the range spans decades). After a block of
//! seeded random trials, candidates are drawn from a Parzen density over the
//! best quarter of trials and ranked by the density ratio against the rest.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::gbm::BoosterParams;
use super::metrics::nan_safe;
use crate::error::{ForecastError, Result};
use crate::ml::CancelToken;

/// Share of trials forming the "good" density.
const GAMMA: f64 = 0.25;
const STARTUP_TRIALS: usize = 10;
const CANDIDATES: usize = 24;
const MIN_BANDWIDTH: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
enum Scale {
    Linear,
    Log,
}

#[derive(Debug, Clone, Copy)]
struct Dim {
    lo: f64,
    hi: f64,
    scale: Scale,
    integer: bool,
}

impl Dim {
    const fn linear(lo: f64, hi: f64) -> Self {
        Self { lo, hi, scale: Scale::Linear, integer: false }
    }

    const fn log(lo: f64, hi: f64) -> Self {
        Self { lo, hi, scale: Scale::Log, integer: false }
    }

    const fn int(lo: f64, hi: f64) -> Self {
        Self { lo, hi, scale: Scale::Linear, integer: true }
    }

    fn decode(&self, u: f64) -> f64 {
        let u = u.clamp(0.0, 1.0);
        let v = match self.scale {
            Scale::Linear => self.lo + u * (self.hi - self.lo),
            Scale::Log => (self.lo.ln() + u * (self.hi.ln() - self.lo.ln())).exp(),
        };
        if self.integer { v.round() } else { v }
    }
}

// max_depth, learning_rate, subsample, colsample, min_child_weight, reg_alpha, reg_lambda
const SPACE: [Dim; 7] = [
    Dim::int(3.0, 10.0),
    Dim::log(0.01, 0.3),
    Dim::linear(0.5, 1.0),
    Dim::linear(0.5, 1.0),
    Dim::log(1.0, 20.0),
    Dim::log(1e-3, 10.0),
    Dim::log(1e-3, 10.0),
];

fn decode(base: &BoosterParams, point: &[f64]) -> BoosterParams {
    let v: Vec<f64> = SPACE.iter().zip(point).map(|(d, u)| d.decode(*u)).collect();
    BoosterParams {
        max_depth: v[0] as usize,
        learning_rate: v[1],
        subsample: v[2],
        colsample: v[3],
        min_child_weight: v[4],
        reg_alpha: v[5],
        reg_lambda: v[6],
        ..base.clone()
    }
}

/// One evaluated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub params: BoosterParams,
    #[serde(with = "nan_safe")]
    pub loss: f64,
    #[serde(skip)]
    point: Vec<f64>,
}

/// Result of a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub best: BoosterParams,
    #[serde(with = "nan_safe")]
    pub best_loss: f64,
    pub trials: Vec<Trial>,
    /// The timeout stopped the search before the trial budget was used.
    pub budget_exceeded: bool,
}

pub struct TpeSearch {
    base: BoosterParams,
    trials: usize,
    timeout: Option<Duration>,
    rng: StdRng,
}

impl TpeSearch {
    pub fn new(base: BoosterParams, trials: usize, timeout: Option<Duration>, seed: u64) -> Self {
        Self {
            base,
            trials: trials.max(1),
            timeout,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Minimise `objective`. At least one trial always runs; the base
    /// parameters are that first trial.
    pub fn run<F>(mut self, cancel: &CancelToken, mut objective: F) -> Result<SearchOutcome>
    where
        F: FnMut(&BoosterParams) -> Result<f64>,
    {
        let started = Instant::now();
        let mut history: Vec<Trial> = Vec::with_capacity(self.trials);
        let mut budget_exceeded = false;

        for n in 0..self.trials {
            if cancel.is_cancelled() {
                return Err(ForecastError::Cancelled);
            }
            if n > 0 && self.timeout.is_some_and(|t| started.elapsed() >= t) {
                budget_exceeded = true;
                warn!(completed = n, budget = self.trials, "hyperparameter search timed out");
                break;
            }
            let (params, point) = if n == 0 {
                (self.base.clone(), Vec::new())
            } else {
                let point = if n < STARTUP_TRIALS.min(self.trials) {
                    self.random_point()
                } else {
                    self.suggest(&history)
                };
                (decode(&self.base, &point), point)
            };
            let loss = objective(&params)?;
            debug!(trial = n, loss, ?params, "search trial");
            history.push(Trial { params, loss, point });
        }

        let best = history
            .iter()
            .filter(|t| t.loss.is_finite())
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
            .cloned()
            .ok_or_else(|| ForecastError::Numerical("no search trial produced a finite loss".into()))?;
        info!(trials = history.len(), best_loss = best.loss, "hyperparameter search finished");
        Ok(SearchOutcome {
            best: best.params,
            best_loss: best.loss,
            trials: history,
            budget_exceeded,
        })
    }

    fn random_point(&mut self) -> Vec<f64> {
        (0..SPACE.len()).map(|_| self.rng.gen_range(0.0..1.0)).collect()
    }

    fn suggest(&mut self, history: &[Trial]) -> Vec<f64> {
        let mut ranked: Vec<&Trial> = history
            .iter()
            .filter(|t| !t.point.is_empty() && t.loss.is_finite())
            .collect();
        if ranked.len() < 2 {
            return self.random_point();
        }
        ranked.sort_by(|a, b| a.loss.total_cmp(&b.loss));
        let n_good = ((ranked.len() as f64 * GAMMA).ceil() as usize).clamp(1, ranked.len() - 1);
        let (good, bad) = ranked.split_at(n_good);

        let mut best_point = Vec::new();
        let mut best_score = f64::NEG_INFINITY;
        for _ in 0..CANDIDATES {
            let point: Vec<f64> = (0..SPACE.len())
                .map(|d| {
                    let column: Vec<f64> = good.iter().map(|t| t.point[d]).collect();
                    sample_parzen(&column, &mut self.rng)
                })
                .collect();
            let score: f64 = (0..SPACE.len())
                .map(|d| {
                    let g: Vec<f64> = good.iter().map(|t| t.point[d]).collect();
                    let b: Vec<f64> = bad.iter().map(|t| t.point[d]).collect();
                    parzen_density(&g, point[d]).ln() - parzen_density(&b, point[d]).ln()
                })
                .sum();
            if score > best_score {
                best_score = score;
                best_point = point;
            }
        }
        best_point
    }
}

fn bandwidth(points: &[f64]) -> f64 {
    let n = points.len() as f64;
    (n.powf(-0.2) * 0.5).max(MIN_BANDWIDTH)
}

/// Gaussian mixture over `points` plus a uniform prior component on [0, 1].
fn parzen_density(points: &[f64], x: f64) -> f64 {
    let bw = bandwidth(points);
    let norm = 1.0 / (bw * (2.0 * std::f64::consts::PI).sqrt());
    let kernels: f64 = points
        .iter()
        .map(|p| norm * (-0.5 * ((x - p) / bw).powi(2)).exp())
        .sum();
    (kernels + 1.0) / (points.len() as f64 + 1.0)
}

fn sample_parzen(points: &[f64], rng: &mut StdRng) -> f64 {
    let pick = rng.gen_range(0..=points.len());
    if pick == points.len() {
        return rng.gen_range(0.0..1.0);
    }
    let z: f64 = StandardNormal.sample(rng);
    (points[pick] + bandwidth(points) * z).clamp(0.0, 1.0)
}
