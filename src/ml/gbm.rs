//! Histogram gradient-boosted regression trees.
//!
//! Squared-error objective with per-row weights, L1/L2 leaf regularisation,
//! row and column subsampling, and early stopping on MAE over an evaluation
//! set. Missing values (NaN) are routed by a per-split default direction
//! learned during training, so NaN features are consumed natively.
//!
//! Trees are stored as flat node arrays; a split sends `value <= threshold`
//! to the left child.

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ForecastError, Result};

/// Bin index reserved for missing values.
const MISSING_BIN: u16 = u16::MAX;

/// Hyperparameters of the booster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoosterParams {
    /// Upper bound on boosting rounds; early stopping may keep fewer.
    pub n_rounds: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// Row fraction sampled per round.
    pub subsample: f64,
    /// Column fraction sampled per tree.
    pub colsample: f64,
    /// Minimum hessian (weight) sum in a child.
    pub min_child_weight: f64,
    /// L1 regularisation on leaf weights.
    pub reg_alpha: f64,
    /// L2 regularisation on leaf weights.
    pub reg_lambda: f64,
    /// Minimum gain to make a split.
    pub gamma: f64,
    pub max_bins: usize,
}

impl Default for BoosterParams {
    fn default() -> Self {
        Self {
            n_rounds: 800,
            max_depth: 6,
            learning_rate: 0.05,
            subsample: 0.8,
            colsample: 0.8,
            min_child_weight: 3.0,
            reg_alpha: 0.1,
            reg_lambda: 1.0,
            gamma: 0.0,
            max_bins: 256,
        }
    }
}

impl BoosterParams {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(ForecastError::Config(msg));
        if self.n_rounds == 0 || self.max_depth == 0 {
            return bad("n_rounds and max_depth must be positive".into());
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return bad(format!("learning_rate {} outside (0, 1]", self.learning_rate));
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0)
            || !(self.colsample > 0.0 && self.colsample <= 1.0)
        {
            return bad("subsample and colsample must be in (0, 1]".into());
        }
        if self.min_child_weight < 0.0 || self.reg_alpha < 0.0 || self.reg_lambda < 0.0 {
            return bad("regularisation terms must be non-negative".into());
        }
        if !(2..=4096).contains(&self.max_bins) {
            return bad(format!("max_bins {} outside [2, 4096]", self.max_bins));
        }
        Ok(())
    }
}

/// Anything that maps one feature row to a point prediction.
///
/// The rolling predictor only needs this, so simple models can stand in
/// for the booster.
pub trait Regressor: Send + Sync {
    fn n_features(&self) -> usize;

    fn predict_row(&self, row: &[f64]) -> f64;

    fn predict(&self, x: ArrayView2<'_, f64>) -> Vec<f64> {
        x.rows()
            .into_iter()
            .map(|row| match row.as_slice() {
                Some(s) => self.predict_row(s),
                None => self.predict_row(&row.to_vec()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        default_left: bool,
        gain: f64,
        left: usize,
        right: usize,
    },
}

/// One regression tree as a flat node array; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                    ..
                } => {
                    let v = row.get(*feature).copied().unwrap_or(f64::NAN);
                    let go_left = if v.is_nan() {
                        *default_left
                    } else {
                        v <= *threshold
                    };
                    idx = if go_left { *left } else { *right };
                }
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    fn add_gains(&self, into: &mut [f64]) {
        for node in &self.nodes {
            if let Node::Split { feature, gain, .. } = node {
                if let Some(slot) = into.get_mut(*feature) {
                    *slot += gain;
                }
            }
        }
    }
}

/// Quantile cut points per feature.
#[derive(Debug, Clone)]
struct BinMapper {
    cuts: Vec<Vec<f64>>,
}

impl BinMapper {
    fn fit(x: ArrayView2<'_, f64>, max_bins: usize) -> Self {
        let cuts = x
            .columns()
            .into_iter()
            .map(|col| {
                let mut values: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
                values.sort_by(f64::total_cmp);
                values.dedup();
                if values.len() < max_bins {
                    return values;
                }
                let mut cuts: Vec<f64> = (1..max_bins)
                    .map(|j| values[j * values.len() / max_bins - 1])
                    .collect();
                cuts.dedup();
                cuts
            })
            .collect();
        Self { cuts }
    }

    fn n_bins(&self, feature: usize) -> usize {
        self.cuts[feature].len() + 1
    }

    fn bin(&self, feature: usize, v: f64) -> u16 {
        if v.is_nan() {
            return MISSING_BIN;
        }
        self.cuts[feature].partition_point(|c| *c < v) as u16
    }

    /// Row-major binned copy of `x`.
    fn transform(&self, x: ArrayView2<'_, f64>) -> Vec<u16> {
        let mut out = Vec::with_capacity(x.len());
        for row in x.rows() {
            for (f, v) in row.iter().enumerate() {
                out.push(self.bin(f, *v));
            }
        }
        out
    }

    fn threshold(&self, feature: usize, bin: usize) -> f64 {
        self.cuts[feature][bin]
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GradPair {
    g: f64,
    h: f64,
}

impl std::ops::AddAssign for GradPair {
    fn add_assign(&mut self, other: Self) {
        self.g += other.g;
        self.h += other.h;
    }
}

impl std::ops::Sub for GradPair {
    type Output = GradPair;
    fn sub(self, other: Self) -> Self {
        GradPair {
            g: self.g - other.g,
            h: self.h - other.h,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    default_left: bool,
    gain: f64,
}

/// Evaluation data monitored for early stopping.
#[derive(Debug, Clone, Copy)]
pub struct EvalSet<'a> {
    pub x: ArrayView2<'a, f64>,
    pub y: &'a [f64],
}

/// Per-round evaluation trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalHistory {
    pub mae: Vec<f64>,
}

/// A trained ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booster {
    base_score: f64,
    learning_rate: f64,
    n_features: usize,
    trees: Vec<Tree>,
    /// Zero-based round with the best evaluation score.
    best_iteration: Option<usize>,
    best_score: Option<f64>,
}

impl Booster {
    /// Fit on `(x, y)` with optional row weights.
    ///
    /// With an evaluation set and `early_stopping_rounds > 0`, training stops
    /// once evaluation MAE has not improved for that many rounds and the
    /// ensemble is truncated to the best round.
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: &[f64],
        weights: Option<&[f64]>,
        params: &BoosterParams,
        seed: u64,
        eval: Option<EvalSet<'_>>,
        early_stopping_rounds: usize,
    ) -> Result<(Self, EvalHistory)> {
        params.validate()?;
        let (n_rows, n_features) = x.dim();
        if n_rows == 0 || n_features == 0 {
            return Err(ForecastError::insufficient("booster training rows", 1, n_rows));
        }
        if y.len() != n_rows || weights.is_some_and(|w| w.len() != n_rows) {
            return Err(ForecastError::Malformed(format!(
                "booster input lengths disagree: {} rows, {} targets",
                n_rows,
                y.len()
            )));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::Malformed("non-finite training target".into()));
        }
        if let Some(e) = &eval {
            if e.x.ncols() != n_features || e.x.nrows() != e.y.len() {
                return Err(ForecastError::Malformed("evaluation set shape mismatch".into()));
            }
        }

        let ones = vec![1.0; n_rows];
        let w = weights.unwrap_or(&ones);
        let w_sum: f64 = w.iter().sum();
        if !(w_sum > 0.0) {
            return Err(ForecastError::Malformed("sample weights sum to zero".into()));
        }
        let base_score = y.iter().zip(w).map(|(y, w)| y * w).sum::<f64>() / w_sum;

        let x_std = x.as_standard_layout();
        let x_flat = x_std.as_slice().unwrap_or_default();
        let eval_std = eval.as_ref().map(|e| e.x.as_standard_layout());
        let eval_flat = eval_std
            .as_ref()
            .and_then(|a| a.as_slice())
            .unwrap_or_default();

        let mapper = BinMapper::fit(x, params.max_bins);
        let bins = mapper.transform(x);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut booster = Booster {
            base_score,
            learning_rate: params.learning_rate,
            n_features,
            trees: Vec::new(),
            best_iteration: None,
            best_score: None,
        };
        let mut pred = vec![base_score; n_rows];
        let mut eval_pred: Vec<f64> = eval
            .as_ref()
            .map(|e| vec![base_score; e.x.nrows()])
            .unwrap_or_default();
        let mut history = EvalHistory::default();
        let n_cols = ((params.colsample * n_features as f64).ceil() as usize).clamp(1, n_features);
        let mut all_cols: Vec<usize> = (0..n_features).collect();

        for round in 0..params.n_rounds {
            let grads: Vec<GradPair> = (0..n_rows)
                .map(|i| GradPair {
                    g: w[i] * (pred[i] - y[i]),
                    h: w[i],
                })
                .collect();

            let mut rows: Vec<usize> = if params.subsample < 1.0 {
                (0..n_rows)
                    .filter(|_| rng.gen_bool(params.subsample))
                    .collect()
            } else {
                (0..n_rows).collect()
            };
            if rows.is_empty() {
                rows.push(rng.gen_range(0..n_rows));
            }
            all_cols.shuffle(&mut rng);
            let mut cols = all_cols[..n_cols].to_vec();
            cols.sort_unstable();

            let builder = TreeBuilder {
                mapper: &mapper,
                bins: &bins,
                n_features,
                grads: &grads,
                params,
                cols: &cols,
            };
            let tree = builder.build(rows);

            for (p, row) in pred.iter_mut().zip(x_flat.chunks(n_features)) {
                *p += tree.predict_row(row);
            }

            if let Some(e) = &eval {
                for (p, row) in eval_pred.iter_mut().zip(eval_flat.chunks(n_features)) {
                    *p += tree.predict_row(row);
                }
                let mae = mean_abs_error(&eval_pred, e.y);
                history.mae.push(mae);
                let improved = booster.best_score.is_none_or(|best| mae < best);
                if improved {
                    booster.best_score = Some(mae);
                    booster.best_iteration = Some(round);
                }
            }
            booster.trees.push(tree);

            if early_stopping_rounds > 0 {
                if let Some(best) = booster.best_iteration {
                    if round - best >= early_stopping_rounds {
                        debug!(round, best, "early stopping");
                        break;
                    }
                }
            }
        }

        if let Some(best) = booster.best_iteration {
            if early_stopping_rounds > 0 {
                booster.trees.truncate(best + 1);
            }
        }
        Ok((booster, history))
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Number of rounds kept (the best iteration + 1 after early stopping).
    pub fn best_n_rounds(&self) -> usize {
        self.best_iteration
            .map(|b| b + 1)
            .unwrap_or(self.trees.len())
            .min(self.trees.len())
            .max(1)
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Total split gain per feature, normalised to sum to 1.
    pub fn feature_importance(&self) -> Vec<f64> {
        let mut gains = vec![0.0; self.n_features];
        for tree in &self.trees {
            tree.add_gains(&mut gains);
        }
        let total: f64 = gains.iter().sum();
        if total > 0.0 {
            gains.iter_mut().for_each(|g| *g /= total);
        }
        gains
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let booster: Booster = bincode::deserialize(bytes)
            .map_err(|e| ForecastError::ArtifactInvalid(format!("booster blob: {}", e)))?;
        if booster.trees.iter().any(|t| t.nodes.is_empty()) {
            return Err(ForecastError::ArtifactInvalid("booster has an empty tree".into()));
        }
        Ok(booster)
    }
}

impl Regressor for Booster {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }
}

fn mean_abs_error(pred: &[f64], y: &[f64]) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    pred.iter().zip(y).map(|(p, y)| (p - y).abs()).sum::<f64>() / y.len() as f64
}

struct TreeBuilder<'a> {
    mapper: &'a BinMapper,
    bins: &'a [u16],
    n_features: usize,
    grads: &'a [GradPair],
    params: &'a BoosterParams,
    cols: &'a [usize],
}

impl TreeBuilder<'_> {
    fn build(&self, rows: Vec<usize>) -> Tree {
        let mut nodes = Vec::new();
        self.grow(rows, 0, &mut nodes);
        Tree { nodes }
    }

    fn grow(&self, rows: Vec<usize>, depth: usize, nodes: &mut Vec<Node>) -> usize {
        let total = self.sum(&rows);
        let idx = nodes.len();
        nodes.push(Node::Leaf {
            value: self.leaf_value(total),
        });

        if depth >= self.params.max_depth || total.h < 2.0 * self.params.min_child_weight {
            return idx;
        }
        let Some(split) = self.best_split(&rows, total) else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows.into_iter().partition(|r| {
            let b = self.bins[r * self.n_features + split.feature];
            if b == MISSING_BIN {
                split.default_left
            } else {
                (b as usize) <= split.bin
            }
        });
        if left_rows.is_empty() || right_rows.is_empty() {
            return idx;
        }

        let left = self.grow(left_rows, depth + 1, nodes);
        let right = self.grow(right_rows, depth + 1, nodes);
        nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: self.mapper.threshold(split.feature, split.bin),
            default_left: split.default_left,
            gain: split.gain,
            left,
            right,
        };
        idx
    }

    fn sum(&self, rows: &[usize]) -> GradPair {
        let mut total = GradPair::default();
        for r in rows {
            total += self.grads[*r];
        }
        total
    }

    fn soft_threshold(&self, g: f64) -> f64 {
        let a = self.params.reg_alpha;
        if g > a {
            g - a
        } else if g < -a {
            g + a
        } else {
            0.0
        }
    }

    fn score(&self, p: GradPair) -> f64 {
        let t = self.soft_threshold(p.g);
        t * t / (p.h + self.params.reg_lambda)
    }

    fn leaf_value(&self, p: GradPair) -> f64 {
        let denom = p.h + self.params.reg_lambda;
        if denom <= 0.0 {
            return 0.0;
        }
        -self.soft_threshold(p.g) / denom * self.params.learning_rate
    }

    fn best_split(&self, rows: &[usize], total: GradPair) -> Option<SplitCandidate> {
        let parent = self.score(total);
        let min_w = self.params.min_child_weight;
        let mut best: Option<SplitCandidate> = None;

        for &f in self.cols {
            let n_bins = self.mapper.n_bins(f);
            if n_bins < 2 {
                continue;
            }
            let mut hist = vec![GradPair::default(); n_bins];
            let mut missing = GradPair::default();
            for r in rows {
                let b = self.bins[r * self.n_features + f];
                if b == MISSING_BIN {
                    missing += self.grads[*r];
                } else {
                    hist[b as usize] += self.grads[*r];
                }
            }

            let mut left = GradPair::default();
            for (b, cell) in hist.iter().enumerate().take(n_bins - 1) {
                left += *cell;
                for default_left in [true, false] {
                    let mut l = left;
                    if default_left {
                        l += missing;
                    }
                    let r = total - l;
                    if l.h < min_w || r.h < min_w {
                        continue;
                    }
                    let gain = 0.5 * (self.score(l) + self.score(r) - parent) - self.params.gamma;
                    if gain > 1e-12 && best.is_none_or(|s| gain > s.gain) {
                        best = Some(SplitCandidate {
                            feature: f,
                            bin: b,
                            default_left,
                            gain,
                        });
                    }
                    if missing.h == 0.0 {
                        // both directions are identical without missing rows
                        break;
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::Array2;

    use super::*;

    fn step_data(n: usize) -> (Array2<f64>, Vec<f64>) {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 7) as f64 });
        let y = (0..n).map(|i| if i < n / 2 { 100.0 } else { 200.0 }).collect();
        (x, y)
    }

    fn quick_params() -> BoosterParams {
        BoosterParams {
            n_rounds: 200,
            max_depth: 3,
            learning_rate: 0.3,
            subsample: 1.0,
            colsample: 1.0,
            min_child_weight: 1.0,
            reg_alpha: 0.0,
            reg_lambda: 1.0,
            gamma: 0.0,
            max_bins: 64,
        }
    }

    #[test]
    fn test_learns_a_step_function() {
        let (x, y) = step_data(100);
        let (booster, _) = Booster::fit(x.view(), &y, None, &quick_params(), 7, None, 0).unwrap();
        assert_relative_eq!(booster.predict_row(&[10.0, 3.0]), 100.0, epsilon = 1.0);
        assert_relative_eq!(booster.predict_row(&[90.0, 3.0]), 200.0, epsilon = 1.0);
        // the informative feature carries the gain
        let imp = booster.feature_importance();
        assert!(imp[0] > 0.9);
        assert_relative_eq!(imp.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_missing_values_follow_learned_direction() {
        // NaN rows all carry the high target, so NaN must route with the high side
        let n = 120;
        let x = Array2::from_shape_fn((n, 1), |(i, _)| if i >= 100 { f64::NAN } else { i as f64 });
        let y: Vec<f64> = (0..n).map(|i| if i < 50 { 10.0 } else { 50.0 }).collect();
        let (booster, _) = Booster::fit(x.view(), &y, None, &quick_params(), 1, None, 0).unwrap();
        assert_relative_eq!(booster.predict_row(&[f64::NAN]), 50.0, epsilon = 1.0);
        assert_relative_eq!(booster.predict_row(&[5.0]), 10.0, epsilon = 1.0);
    }

    #[test]
    fn test_same_seed_same_model() {
        let (x, y) = step_data(80);
        let params = BoosterParams {
            subsample: 0.7,
            colsample: 0.5,
            n_rounds: 30,
            ..quick_params()
        };
        let (a, _) = Booster::fit(x.view(), &y, None, &params, 11, None, 0).unwrap();
        let (b, _) = Booster::fit(x.view(), &y, None, &params, 11, None, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_early_stopping_truncates_to_best_round() {
        let (x, y) = step_data(100);
        let (ex, _) = step_data(40);
        // a flat target the ensemble moves away from after the first round
        let ey = vec![150.0; 40];
        let eval = EvalSet {
            x: ex.view(),
            y: &ey,
        };
        let (booster, history) =
            Booster::fit(x.view(), &y, None, &quick_params(), 3, Some(eval), 5).unwrap();
        assert!(booster.n_trees() < 200);
        assert_eq!(booster.n_trees(), booster.best_n_rounds());
        let best = history.mae.iter().copied().fold(f64::INFINITY, f64::min);
        assert_relative_eq!(booster.best_score().unwrap(), best);
    }

    #[test]
    fn test_weights_pull_the_base_score() {
        let x = Array2::from_shape_fn((4, 1), |_| 1.0);
        let y = [0.0, 0.0, 0.0, 100.0];
        let w = [1.0, 1.0, 1.0, 9.0];
        let params = BoosterParams {
            n_rounds: 1,
            ..quick_params()
        };
        let (booster, _) = Booster::fit(x.view(), &y, Some(&w), &params, 0, None, 0).unwrap();
        // constant feature: no split, prediction is the weighted mean
        assert_relative_eq!(booster.predict_row(&[1.0]), 75.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bytes_round_trip_and_garbage_rejected() {
        let (x, y) = step_data(50);
        let params = BoosterParams {
            n_rounds: 5,
            ..quick_params()
        };
        let (booster, _) = Booster::fit(x.view(), &y, None, &params, 0, None, 0).unwrap();
        let restored = Booster::from_bytes(&booster.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.predict_row(&[3.0, 1.0]), booster.predict_row(&[3.0, 1.0]));
        assert!(matches!(
            Booster::from_bytes(&[1, 2, 3]),
            Err(ForecastError::ArtifactInvalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let x = Array2::<f64>::zeros((3, 2));
        assert!(Booster::fit(x.view(), &[1.0, 2.0], None, &quick_params(), 0, None, 0).is_err());
        let bad = BoosterParams {
            learning_rate: 0.0,
            ..quick_params()
        };
        assert!(Booster::fit(x.view(), &[1.0, 2.0, 3.0], None, &bad, 0, None, 0).is_err());
    }

    #[test]
    fn test_bin_boundary_matches_threshold() {
        let x = Array2::from_shape_vec((5, 1), vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let mapper = BinMapper::fit(x.view(), 16);
        // value equal to a cut lands in that cut's bin, i.e. goes left
        assert_eq!(mapper.bin(0, 3.0), 2);
        assert_eq!(mapper.threshold(0, 2), 3.0);
        assert_eq!(mapper.bin(0, 3.5), 3);
        assert_eq!(mapper.bin(0, f64::NAN), MISSING_BIN);
    }
}
