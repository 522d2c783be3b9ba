//! Fusion-weight governor.
//!
//! Compares the production track (AI factor off) with the experimental
//! track (AI factor on) over paired days and moves `w_AI` toward the
//! experimental setting only when the evidence clears every guardrail.
//!
//! ## Guardrails
//!
//! - at least `governor_min_days` paired days
//! - relative MAE improvement of at least `min_improvement`
//! - paired t-test p-value below `max_p_value`
//! - experimental win rate above `min_win_rate`
//!
//! Each update moves `w_AI` by at most `max_step` and the result is
//! projected back into the weight envelope.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::LearnerConfig;
use crate::error::{ForecastError, Result};
use crate::ml::{PredictionRecord, Track};
use crate::stats;

/// Convex combination weights for the base, weather and AI components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub w_base: f64,
    pub w_weather: f64,
    pub w_ai: f64,
}

impl FusionWeights {
    pub fn new(w_base: f64, w_weather: f64, w_ai: f64) -> Self {
        Self {
            w_base,
            w_weather,
            w_ai,
        }
    }

    pub fn initial(cfg: &LearnerConfig) -> Self {
        let [b, w, a] = cfg.initial_weights;
        Self::new(b, w, a).project(cfg)
    }

    pub fn sum(&self) -> f64 {
        self.w_base + self.w_weather + self.w_ai
    }

    /// Inside the envelope and on the simplex.
    pub fn is_valid(&self, cfg: &LearnerConfig) -> bool {
        (self.sum() - 1.0).abs() <= 1e-6
            && self.w_weather >= 0.0
            && (0.0..=cfg.w_ai_max).contains(&self.w_ai)
            && (cfg.w_base_min..=cfg.w_base_max).contains(&self.w_base)
    }

    /// Nearest weights satisfying the envelope. `w_AI` and `w_base` are
    /// clamped first; `w_weather` takes up the remainder.
    pub fn project(self, cfg: &LearnerConfig) -> Self {
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
        let w_ai = finite(self.w_ai).clamp(0.0, cfg.w_ai_max);
        let mut w_base = finite(self.w_base).clamp(cfg.w_base_min, cfg.w_base_max);
        let mut w_ai = w_ai;
        if w_base + w_ai > 1.0 {
            w_base = (1.0 - w_ai).max(cfg.w_base_min);
            w_ai = (1.0 - w_base).max(0.0);
        }
        Self::new(w_base, (1.0 - w_base - w_ai).max(0.0), w_ai)
    }

    /// Served weights: the AI share is folded into the base, and whatever
    /// lifts `w_base` past its ceiling goes to the weather term.
    pub fn production(self, cfg: &LearnerConfig) -> Self {
        Self::new(self.w_base + self.w_ai, self.w_weather, 0.0).project(cfg)
    }

    /// Weights logged on the experimental track: `w_AI` raised by
    /// `experimental_ai_step` at the expense of the base.
    pub fn experimental(self, cfg: &LearnerConfig) -> Self {
        let target = (self.w_ai + cfg.experimental_ai_step).min(cfg.w_ai_max);
        let delta = target - self.w_ai;
        Self::new(self.w_base - delta, self.w_weather, target).project(cfg)
    }
}

/// Statistics behind a governor decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorEvidence {
    pub days: usize,
    pub mae_production: f64,
    pub mae_experimental: f64,
    /// (MAE_prod − MAE_exp) / MAE_prod.
    pub improvement: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorDecision {
    Updated,
    Unchanged,
}

/// One governor run, persisted when the weights change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightUpdateRecord {
    pub version: u64,
    pub old: FusionWeights,
    pub new: FusionWeights,
    pub decision: GovernorDecision,
    pub evidence: Option<GovernorEvidence>,
    pub recommendation: String,
    pub updated_at: DateTime<FixedOffset>,
}

impl WeightUpdateRecord {
    /// Record standing in for "never updated".
    pub fn initial(cfg: &LearnerConfig, at: DateTime<FixedOffset>) -> Self {
        let w = FusionWeights::initial(cfg);
        Self {
            version: 0,
            old: w,
            new: w,
            decision: GovernorDecision::Unchanged,
            evidence: None,
            recommendation: "initial weights".into(),
            updated_at: at,
        }
    }
}

/// Absolute errors of both tracks on one day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairedDay {
    pub date: NaiveDate,
    pub production: f64,
    pub experimental: f64,
}

/// Pair the latest evaluated record of each track per date.
pub fn pair_tracks(records: &[PredictionRecord]) -> Vec<PairedDay> {
    let mut dates: Vec<NaiveDate> = records.iter().map(|r| r.target_date).collect();
    dates.sort();
    dates.dedup();
    let latest = |date: NaiveDate, track: Track| {
        records
            .iter()
            .filter(|r| r.target_date == date && r.track == track && r.error.is_some())
            .max_by_key(|r| r.predicted_at)
            .and_then(|r| r.error)
    };
    dates
        .into_iter()
        .filter_map(|d| {
            Some(PairedDay {
                date: d,
                production: latest(d, Track::Production)?.abs(),
                experimental: latest(d, Track::Experimental)?.abs(),
            })
        })
        .collect()
}

/// Paired comparison of absolute errors.
pub fn evidence(pairs: &[PairedDay]) -> Result<GovernorEvidence> {
    let n = pairs.len();
    if n < 2 {
        return Err(ForecastError::insufficient("paired days", 2, n));
    }
    let prod: Vec<f64> = pairs.iter().map(|p| p.production).collect();
    let exp: Vec<f64> = pairs.iter().map(|p| p.experimental).collect();
    // positive when the experimental track is closer
    let diffs: Vec<f64> = pairs.iter().map(|p| p.production - p.experimental).collect();
    let mae_production = stats::mean(&prod);
    let mae_experimental = stats::mean(&exp);
    let mean_diff = stats::mean(&diffs);
    let sd = stats::std_dev(&diffs);

    let (t_statistic, p_value) = if sd > 0.0 {
        let t = mean_diff / (sd / (n as f64).sqrt());
        (t, stats::student_t_two_sided_p(t, (n - 1) as f64))
    } else if mean_diff != 0.0 {
        (mean_diff.signum() * f64::INFINITY, 0.0)
    } else {
        (0.0, 1.0)
    };
    let improvement = if mae_production > 0.0 {
        (mae_production - mae_experimental) / mae_production
    } else {
        0.0
    };
    let wins = pairs.iter().filter(|p| p.experimental < p.production).count();
    Ok(GovernorEvidence {
        days: n,
        mae_production,
        mae_experimental,
        improvement,
        t_statistic,
        p_value,
        win_rate: wins as f64 / n as f64,
    })
}

/// Decide on new weights. `Unchanged` records must not be persisted.
pub fn govern(
    current: &WeightUpdateRecord,
    pairs: &[PairedDay],
    cfg: &LearnerConfig,
    now: DateTime<FixedOffset>,
) -> Result<WeightUpdateRecord> {
    let weights = current.new;
    let unchanged = |evidence: Option<GovernorEvidence>, recommendation: String| {
        info!(%recommendation, "fusion weights unchanged");
        WeightUpdateRecord {
            version: current.version,
            old: weights,
            new: weights,
            decision: GovernorDecision::Unchanged,
            evidence,
            recommendation,
            updated_at: now,
        }
    };

    if pairs.len() < cfg.governor_min_days {
        return Ok(unchanged(
            None,
            format!(
                "keep current weights: {} paired days, {} required",
                pairs.len(),
                cfg.governor_min_days
            ),
        ));
    }
    let ev = evidence(pairs)?;
    let mut failed = Vec::new();
    if ev.improvement < cfg.min_improvement {
        failed.push(format!(
            "improvement {:.1}% < {:.1}%",
            100.0 * ev.improvement,
            100.0 * cfg.min_improvement
        ));
    }
    if !(ev.p_value < cfg.max_p_value) {
        failed.push(format!("p = {:.3} >= {:.3}", ev.p_value, cfg.max_p_value));
    }
    if !(ev.win_rate > cfg.min_win_rate) {
        failed.push(format!(
            "win rate {:.0}% <= {:.0}%",
            100.0 * ev.win_rate,
            100.0 * cfg.min_win_rate
        ));
    }
    if !failed.is_empty() {
        return Ok(unchanged(
            Some(ev),
            format!("keep current weights: {}", failed.join(", ")),
        ));
    }

    let target = weights.experimental(cfg).w_ai;
    let step = (target - weights.w_ai).clamp(-cfg.max_step, cfg.max_step);
    let new = FusionWeights::new(weights.w_base - step, weights.w_weather, weights.w_ai + step)
        .project(cfg);
    if new == weights {
        return Ok(unchanged(
            Some(ev),
            "experimental track wins but w_AI is already at its ceiling".into(),
        ));
    }
    let recommendation = format!(
        "raise w_AI from {:.3} to {:.3}: experimental MAE {:.1} vs {:.1} over {} days \
         ({:.1}% better, p = {:.4}, win rate {:.0}%)",
        weights.w_ai,
        new.w_ai,
        ev.mae_experimental,
        ev.mae_production,
        ev.days,
        100.0 * ev.improvement,
        ev.p_value,
        100.0 * ev.win_rate
    );
    info!(%recommendation, "fusion weights updated");
    Ok(WeightUpdateRecord {
        version: current.version + 1,
        old: weights,
        new,
        decision: GovernorDecision::Updated,
        evidence: Some(ev),
        recommendation,
        updated_at: now,
    })
}
