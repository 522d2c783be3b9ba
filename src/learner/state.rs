//! File-backed learner state.
//!
//! `impact.json` holds the current weather-impact coefficients and
//! `fusion_weights.json` the full history of published weight records, the
//! last entry being current. Both files are replaced atomically, so a reader
//! sees either the previous or the new contents.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::learner::{ImpactSet, WeightUpdateRecord};
use crate::ml::registry::write_atomic;
use crate::traits::LearnerState;

const IMPACT_FILE: &str = "impact.json";
const WEIGHTS_FILE: &str = "fusion_weights.json";

#[derive(Debug, Clone)]
pub struct FileLearnerState {
    root: PathBuf,
}

impl FileLearnerState {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weights_path(&self) -> PathBuf {
        self.root.join(WEIGHTS_FILE)
    }

    pub fn impact_path(&self) -> PathBuf {
        self.root.join(IMPACT_FILE)
    }

    /// Every published fusion-weight record, oldest first.
    pub fn weight_history(&self) -> Result<Vec<WeightUpdateRecord>> {
        let path = self.weights_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

impl LearnerState for FileLearnerState {
    fn impact_params(&self) -> Result<ImpactSet> {
        let path = self.impact_path();
        if !path.exists() {
            return Ok(ImpactSet::default());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn save_impact_params(&self, params: &ImpactSet) -> Result<()> {
        write_atomic(&self.impact_path(), &serde_json::to_vec_pretty(params)?)?;
        info!(params = params.params.len(), "weather-impact parameters saved");
        Ok(())
    }

    fn fusion_weights(&self) -> Result<Option<WeightUpdateRecord>> {
        Ok(self.weight_history()?.pop())
    }

    fn publish_fusion_weights(&self, record: &WeightUpdateRecord) -> Result<()> {
        let mut history = self.weight_history()?;
        history.push(record.clone());
        write_atomic(&self.weights_path(), &serde_json::to_vec_pretty(&history)?)?;
        info!(version = record.version, "fusion weights published");
        Ok(())
    }
}
