//! Time-ordered splitting and sample weighting.
//!
//! All functions work on row positions of a date-ordered training matrix.
//! The test tail is cut first and is never filtered or re-weighted.

use std::ops::Range;

use chrono::NaiveDate;
use tracing::debug;

use crate::config::{DataWindow, ExclusionMode, TrainingConfig};
use crate::error::{ForecastError, Result};

/// Smallest validation block a walk-forward fold may have.
pub const MIN_FOLD_ROWS: usize = 7;

/// Row positions of one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPlan {
    /// Rows the booster is fitted on.
    pub fit: Vec<usize>,
    /// Last part of the training rows, monitored for early stopping.
    pub tail: Vec<usize>,
    pub test: Vec<usize>,
    /// Sample weight per row of `fit` followed by `tail`, mean 1.
    pub weights: Vec<f64>,
}

impl SplitPlan {
    /// `fit` followed by `tail`: every training row in date order.
    pub fn train(&self) -> Vec<usize> {
        self.fit.iter().chain(&self.tail).copied().collect()
    }

    pub fn fit_weights(&self) -> &[f64] {
        &self.weights[..self.fit.len()]
    }
}

/// Cut `dates` (ascending) into fit / early-stopping tail / test.
///
/// The sliding window, period exclusion and time decay are applied to the
/// training part only.
pub fn plan_split(dates: &[NaiveDate], cfg: &TrainingConfig) -> Result<SplitPlan> {
    let n = dates.len();
    let cut = (n as f64 * cfg.split_fraction).floor() as usize;
    if cut < 2 || cut >= n {
        return Err(ForecastError::insufficient("train/test split", 3, n));
    }
    let test: Vec<usize> = (cut..n).collect();
    let last_train = dates[cut - 1];

    let window_start = match cfg.data_window {
        DataWindow::All => None,
        DataWindow::LastNYears(years) => last_train.checked_sub_months(chrono::Months::new(12 * years)),
    };

    let mut train = Vec::with_capacity(cut);
    let mut period_weight = Vec::with_capacity(cut);
    for (i, date) in dates[..cut].iter().enumerate() {
        if window_start.is_some_and(|s| *date <= s) {
            continue;
        }
        let excluded = cfg.excluded_periods.iter().any(|p| p.contains(*date));
        match (excluded, cfg.exclusion_mode) {
            (true, ExclusionMode::Drop) => continue,
            (true, ExclusionMode::DownWeight(w)) => period_weight.push(w),
            (false, _) => period_weight.push(1.0),
        }
        train.push(i);
    }
    if train.len() < 2 {
        return Err(ForecastError::insufficient("training rows after filtering", 2, train.len()));
    }

    let raw: Vec<f64> = train
        .iter()
        .zip(&period_weight)
        .map(|(i, w)| {
            let age = (last_train - dates[*i]).num_days() as f64;
            (-cfg.time_decay_rate * age).exp() * w
        })
        .collect();
    let weights = normalise_mean_one(raw);

    let tail_len = ((train.len() as f64 * cfg.early_stopping_fraction).ceil() as usize)
        .clamp(1, train.len() - 1);
    let tail = train.split_off(train.len() - tail_len);
    let plan = SplitPlan {
        fit: train,
        tail,
        test,
        weights,
    };

    ensure_before(dates, &plan.fit, &plan.tail, "fit/tail")?;
    ensure_before(dates, &plan.train(), &plan.test, "train/test")?;
    debug!(
        fit = plan.fit.len(),
        tail = plan.tail.len(),
        test = plan.test.len(),
        "planned split"
    );
    Ok(plan)
}

fn normalise_mean_one(raw: Vec<f64>) -> Vec<f64> {
    let mean = raw.iter().sum::<f64>() / raw.len().max(1) as f64;
    if mean > 0.0 && mean.is_finite() {
        raw.into_iter().map(|w| w / mean).collect()
    } else {
        vec![1.0; raw.len()]
    }
}

/// One walk-forward fold over positions `0..n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Range<usize>,
    pub valid: Range<usize>,
}

/// Expanding-window folds: fold `i` trains on the first `i + 1` blocks and
/// validates on the next one. The last block absorbs the remainder.
pub fn walk_forward_folds(n: usize, k: usize) -> Result<Vec<Fold>> {
    if k == 0 {
        return Err(ForecastError::Config("at least one fold is required".into()));
    }
    let block = n / (k + 1);
    if block < MIN_FOLD_ROWS {
        return Err(ForecastError::insufficient(
            "walk-forward folds",
            (k + 1) * MIN_FOLD_ROWS,
            n,
        ));
    }
    Ok((0..k)
        .map(|i| {
            let end = block * (i + 1);
            let valid_end = if i + 1 == k { n } else { end + block };
            Fold {
                train: 0..end,
                valid: end..valid_end,
            }
        })
        .collect())
}

/// Every date in `earlier` must precede every date in `later`.
pub fn ensure_before(
    dates: &[NaiveDate],
    earlier: &[usize],
    later: &[usize],
    what: &str,
) -> Result<()> {
    let last = earlier.iter().map(|i| dates[*i]).max();
    let first = later.iter().map(|i| dates[*i]).min();
    if let (Some(last), Some(first)) = (last, first) {
        if last >= first {
            return Err(ForecastError::LeakageDetected(format!(
                "{} split: {} is not before {}",
                what, last, first
            )));
        }
    }
    Ok(())
}
