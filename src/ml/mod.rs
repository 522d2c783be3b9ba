//! Machine learning module for attendance forecasting
//!
//! Feature building, splitting, gradient-boosted trees, training, the model
//! registry and the rolling multi-day predictor.

pub mod confidence;
pub mod features;
pub mod gbm;
pub mod metrics;
pub mod predictor;
pub mod registry;
pub mod search;
pub mod split;
pub mod training;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use confidence::{Interval, PredictionRecord, Track};
pub use features::{Feature, FeatureBuilder, FeatureMatrix, FeatureSet, build_features};
pub use gbm::{Booster, BoosterParams, Regressor};
pub use metrics::{CvSummary, Metrics};
pub use predictor::{RollingPredictor, ServingModel};
pub use registry::{ArtifactMeta, ModelArtifact, ModelRegistry, VersionSelector};
pub use training::{DowProfile, Trainer, TrainingFlag, TrainingMetrics};

/// Cooperative cancellation flag, checked between folds and between
/// forecast days.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
