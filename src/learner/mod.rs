//! Continuous learning: accuracy recording, the weather-impact correction
//! and the fusion-weight governor.

pub mod accuracy;
pub mod governor;
pub mod impact;
pub mod state;

pub use accuracy::{AccuracySummary, record_actual, summarize};
pub use governor::{
    FusionWeights, GovernorDecision, GovernorEvidence, PairedDay, WeightUpdateRecord, govern,
    pair_tracks,
};
pub use impact::{ImpactParam, ImpactSample, ImpactSet, fit_impact, join_samples};
pub use state::FileLearnerState;
