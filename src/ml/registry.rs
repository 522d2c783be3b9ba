//! Versioned on-disk model registry.
//!
//! Layout under the registry root:
//!
//! ```text
//! versions/<id>/booster.bin     bincode booster
//! versions/<id>/features.json   ordered feature-name list
//! versions/<id>/metrics.json    training metrics
//! versions/<id>/meta.json       hyperparameters, data window, timestamps
//! LATEST                        id of the newest published version
//! ```
//!
//! A version is written into a staging directory and renamed into
//! `versions/` in one step, then `LATEST` is replaced by renaming a temp
//! file over it. Readers therefore see either the previous version or the
//! new one.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::features::FeatureSet;
use super::gbm::{Booster, BoosterParams, Regressor};
use super::training::{DowProfile, TrainingMetrics};
use crate::config::{DataWindow, ExcludedPeriod, ExclusionMode};
use crate::error::{ForecastError, Result};

const BOOSTER_FILE: &str = "booster.bin";
const FEATURES_FILE: &str = "features.json";
const METRICS_FILE: &str = "metrics.json";
const META_FILE: &str = "meta.json";
const LATEST_FILE: &str = "LATEST";

/// Bumped when the artifact layout changes incompatibly.
pub const ARTIFACT_FORMAT: u32 = 1;

/// Training-time metadata stored in `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub format: u32,
    pub version: String,
    pub created_at: DateTime<FixedOffset>,
    pub params: BoosterParams,
    /// Rounds kept by the final model.
    pub n_rounds: usize,
    pub seed: u64,
    pub data_window: DataWindow,
    pub excluded_periods: Vec<ExcludedPeriod>,
    pub exclusion_mode: ExclusionMode,
    pub time_decay_rate: f64,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: Option<NaiveDate>,
    pub test_end: Option<NaiveDate>,
    pub n_train: usize,
    pub n_test: usize,
    pub dow_profile: DowProfile,
}

/// Everything a trained model consists of.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub booster: Booster,
    pub features: FeatureSet,
    pub metrics: TrainingMetrics,
    pub meta: ArtifactMeta,
}

impl ModelArtifact {
    pub fn version(&self) -> &str {
        &self.meta.version
    }

    fn check_consistency(&self) -> Result<()> {
        if self.booster.n_features() != self.features.len() {
            return Err(ForecastError::ArtifactInvalid(format!(
                "booster expects {} features, list has {}",
                self.booster.n_features(),
                self.features.len()
            )));
        }
        if self.meta.format != ARTIFACT_FORMAT {
            return Err(ForecastError::ArtifactInvalid(format!(
                "artifact format {} not supported (expected {})",
                self.meta.format, ARTIFACT_FORMAT
            )));
        }
        Ok(())
    }
}

/// Which version to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Version(String),
}

impl From<Option<String>> for VersionSelector {
    fn from(v: Option<String>) -> Self {
        v.map(VersionSelector::Version).unwrap_or(VersionSelector::Latest)
    }
}

/// Parsed `vYYYYMMDD-HHMMSS-n` id, ordered by time then sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct VersionId {
    stamp: String,
    seq: u64,
}

impl VersionId {
    fn parse(id: &str) -> Option<Self> {
        let rest = id.strip_prefix('v')?;
        let (stamp, seq) = rest.rsplit_once('-')?;
        let valid_stamp = stamp.len() == 15
            && stamp.as_bytes()[8] == b'-'
            && stamp.bytes().enumerate().all(|(i, b)| i == 8 || b.is_ascii_digit());
        if !valid_stamp {
            return None;
        }
        Some(Self {
            stamp: stamp.to_string(),
            seq: seq.parse().ok()?,
        })
    }
}

/// Filesystem-backed registry.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    /// Open (creating if needed) a registry rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("versions"))?;
        fs::create_dir_all(root.join(".staging"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join("versions").join(version)
    }

    /// Next id for a model trained at `now` (HKT): strictly greater than every existing id.
    pub fn next_version(&self, now: DateTime<FixedOffset>) -> Result<String> {
        let stamp = now.format("%Y%m%d-%H%M%S").to_string();
        let versions = self.parsed_versions()?;
        let Some((last, name)) = versions.last() else {
            return Ok(format!("v{}-1", stamp));
        };
        let seq = last.seq + 1;
        if stamp < last.stamp {
            warn!(previous = %name, "clock is behind the newest version; reusing its timestamp");
            return Ok(format!("v{}-{}", last.stamp, seq));
        }
        Ok(format!("v{}-{}", stamp, seq))
    }

    /// Publish `artifact` under its version id and point `LATEST` at it.
    pub fn save(&self, artifact: &ModelArtifact) -> Result<()> {
        artifact.check_consistency()?;
        let version = artifact.version();
        if VersionId::parse(version).is_none() {
            return Err(ForecastError::ArtifactInvalid(format!(
                "'{}' is not a valid version id",
                version
            )));
        }
        let target = self.version_dir(version);
        if target.exists() {
            return Err(ForecastError::ArtifactInvalid(format!(
                "version {} already exists",
                version
            )));
        }

        let staging = self
            .root
            .join(".staging")
            .join(format!("{}-{}", version, std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        let written = (|| -> Result<()> {
            fs::write(staging.join(BOOSTER_FILE), artifact.booster.to_bytes()?)?;
            fs::write(
                staging.join(FEATURES_FILE),
                serde_json::to_vec_pretty(artifact.features.names())?,
            )?;
            fs::write(staging.join(METRICS_FILE), serde_json::to_vec_pretty(&artifact.metrics)?)?;
            fs::write(staging.join(META_FILE), serde_json::to_vec_pretty(&artifact.meta)?)?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        fs::rename(&staging, &target)?;
        write_atomic(&self.root.join(LATEST_FILE), version.as_bytes())?;
        info!(version, features = artifact.features.len(), "published model version");
        Ok(())
    }

    /// Id `LATEST` points at, `None` for an empty registry.
    pub fn latest_version(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(LATEST_FILE)) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(&self, selector: &VersionSelector) -> Result<ModelArtifact> {
        let version = match selector {
            VersionSelector::Version(v) => v.clone(),
            VersionSelector::Latest => self
                .latest_version()?
                .ok_or_else(|| ForecastError::ArtifactInvalid("registry has no model".into()))?,
        };
        if VersionId::parse(&version).is_none() {
            return Err(ForecastError::ArtifactInvalid(format!(
                "'{}' is not a valid version id",
                version
            )));
        }
        let dir = self.version_dir(&version);
        let read = |name: &str| -> Result<Vec<u8>> {
            fs::read(dir.join(name)).map_err(|e| {
                ForecastError::ArtifactInvalid(format!("{}/{}: {}", version, name, e))
            })
        };
        let invalid = |name: &str, e: serde_json::Error| {
            ForecastError::ArtifactInvalid(format!("{}/{}: {}", version, name, e))
        };

        let booster = Booster::from_bytes(&read(BOOSTER_FILE)?)?;
        let names: Vec<String> =
            serde_json::from_slice(&read(FEATURES_FILE)?).map_err(|e| invalid(FEATURES_FILE, e))?;
        let features = FeatureSet::parse(&names)?;
        let metrics: TrainingMetrics =
            serde_json::from_slice(&read(METRICS_FILE)?).map_err(|e| invalid(METRICS_FILE, e))?;
        let meta: ArtifactMeta =
            serde_json::from_slice(&read(META_FILE)?).map_err(|e| invalid(META_FILE, e))?;
        if meta.version != version {
            return Err(ForecastError::ArtifactInvalid(format!(
                "directory {} holds metadata for {}",
                version, meta.version
            )));
        }

        let artifact = ModelArtifact {
            booster,
            features,
            metrics,
            meta,
        };
        artifact.check_consistency()?;
        debug!(version = %version, "loaded model");
        Ok(artifact)
    }

    fn parsed_versions(&self) -> Result<Vec<(VersionId, String)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join("versions"))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = VersionId::parse(&name) {
                out.push((id, name));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Published ids, oldest first.
    pub fn list_versions(&self) -> Result<Vec<String>> {
        Ok(self.parsed_versions()?.into_iter().map(|(_, n)| n).collect())
    }

    /// Delete all but the newest `keep` versions; the `LATEST` version is
    /// always kept. Returns the removed ids.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let latest = self.latest_version()?;
        let versions = self.list_versions()?;
        let cut = versions.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for v in &versions[..cut] {
            if latest.as_deref() == Some(v.as_str()) {
                continue;
            }
            fs::remove_dir_all(self.version_dir(v))?;
            removed.push(v.clone());
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), kept = versions.len() - removed.len(), "pruned model registry");
        }
        Ok(removed)
    }
}

/// Replace `path` with `bytes` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
