use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ForecastError;
use crate::ml::gbm::BoosterParams;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub registry: RegistryConfig,
    pub training: TrainingConfig,
    pub prediction: PredictionConfig,
    pub learner: LearnerConfig,
    pub holidays: HolidayConfig,
    pub weather: WeatherConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Without it the binary works from CSV files only.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root directory holding `versions/`, `LATEST` and the learner state.
    pub root: PathBuf,
    /// Versions kept by `prune`.
    pub keep_versions: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: default_registry_root(),
            keep_versions: 10,
        }
    }
}

fn default_registry_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aed-forecast")
        .join("models")
}

/// Which part of the history feeds training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataWindow {
    #[default]
    All,
    LastNYears(u32),
}

/// A closed date range treated specially during training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub label: String,
}

impl ExcludedPeriod {
    pub fn contains(&self, date: NaiveDate) -> bool {
        (self.start..=self.end).contains(&date)
    }
}

/// What happens to rows inside an excluded period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionMode {
    #[default]
    Drop,
    DownWeight(f64),
}

/// Source of the ordered feature-name list for a training run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSelection {
    Explicit(Vec<String>),
    FromLatestArtifact,
    #[default]
    AutoSelect,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrainingConfig {
    /// Fraction of usable rows before the test tail.
    pub split_fraction: f64,
    /// Fraction of training rows held out as the early-stopping tail.
    pub early_stopping_fraction: f64,
    pub cv_folds: usize,
    pub early_stopping_rounds: usize,
    pub data_window: DataWindow,
    pub excluded_periods: Vec<ExcludedPeriod>,
    pub exclusion_mode: ExclusionMode,
    /// λ in exp(-λ·age_days); 0 disables decay.
    pub time_decay_rate: f64,
    pub do_hyperparameter_search: bool,
    pub search_trials: usize,
    pub search_timeout_secs: Option<u64>,
    pub feature_list: FeatureSelection,
    /// Features kept by auto-selection.
    pub auto_select_top_k: usize,
    /// Test MAE at or above this multiple of the training-tail MAE flags overfitting.
    pub overfit_ratio: f64,
    /// Fold MAE std / mean above this flags unstable cross-validation.
    pub cv_max_relative_std: f64,
    /// Dates perturbed by the leakage audit.
    pub leakage_audit_samples: usize,
    pub min_training_rows: usize,
    pub seed: u64,
    pub booster: BoosterParams,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            split_fraction: 0.8,
            early_stopping_fraction: 0.15,
            cv_folds: 3,
            early_stopping_rounds: 50,
            data_window: DataWindow::All,
            excluded_periods: Vec::new(),
            exclusion_mode: ExclusionMode::Drop,
            time_decay_rate: 0.0,
            do_hyperparameter_search: false,
            search_trials: 30,
            search_timeout_secs: None,
            feature_list: FeatureSelection::AutoSelect,
            auto_select_top_k: 25,
            overfit_ratio: 3.0,
            cv_max_relative_std: 0.25,
            leakage_audit_samples: 5,
            min_training_rows: 60,
            seed: 42,
            booster: BoosterParams::default(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        let unit = |name: &str, v: f64| {
            if v > 0.0 && v < 1.0 {
                Ok(())
            } else {
                Err(ForecastError::Config(format!("{} must be in (0, 1), got {}", name, v)))
            }
        };
        unit("split_fraction", self.split_fraction)?;
        unit("early_stopping_fraction", self.early_stopping_fraction)?;
        if self.cv_folds < 3 {
            return Err(ForecastError::Config(format!(
                "cv_folds must be at least 3, got {}",
                self.cv_folds
            )));
        }
        if self.time_decay_rate < 0.0 || !self.time_decay_rate.is_finite() {
            return Err(ForecastError::Config(format!(
                "time_decay_rate must be >= 0, got {}",
                self.time_decay_rate
            )));
        }
        if let ExclusionMode::DownWeight(w) = self.exclusion_mode {
            if !(0.0..=1.0).contains(&w) {
                return Err(ForecastError::Config(format!(
                    "exclusion down-weight must be in [0, 1], got {}",
                    w
                )));
            }
        }
        if let Some(p) = self.excluded_periods.iter().find(|p| p.start > p.end) {
            return Err(ForecastError::Config(format!(
                "excluded period '{}' ends before it starts",
                p.label
            )));
        }
        self.booster.validate()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PredictionConfig {
    pub horizon: usize,
    pub clamp_min: f64,
    pub clamp_max: f64,
    /// Blend with the recent same-weekday mean.
    pub blend_enabled: bool,
    /// Model weight on the first forecast day.
    pub blend_start: f64,
    /// Model weight the schedule decays towards.
    pub blend_floor: f64,
    /// e-folding time of the blend weight, in days.
    pub blend_decay_days: f64,
    /// Same-weekday observations averaged for the blend.
    pub blend_weeks: usize,
    pub noise_enabled: bool,
    /// Noise std on day 0 as a fraction of the point.
    pub noise_fraction: f64,
    /// Linear growth of the noise std per forecast day.
    pub noise_growth: f64,
    /// Noise is truncated to ± this many standard deviations.
    pub noise_bound: f64,
    /// σ(i) = σ(0)·sqrt(1 + interval_growth·i).
    pub interval_growth: f64,
    /// σ(0) used when the artifact carries none.
    pub default_residual_std: f64,
    pub holiday_multiplier: f64,
    pub use_dow_factors: bool,
    /// Log an experimental track next to production.
    pub dual_track: bool,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            horizon: 7,
            clamp_min: 50.0,
            clamp_max: 600.0,
            blend_enabled: true,
            blend_start: 0.9,
            blend_floor: 0.4,
            blend_decay_days: 7.0,
            blend_weeks: 8,
            noise_enabled: true,
            noise_fraction: 0.005,
            noise_growth: 0.1,
            noise_bound: 2.0,
            interval_growth: 0.15,
            default_residual_std: 20.0,
            holiday_multiplier: 0.9,
            use_dow_factors: true,
            dual_track: true,
        }
    }
}

impl PredictionConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.horizon == 0 {
            return Err(ForecastError::Config("horizon must be at least 1".into()));
        }
        if !(self.clamp_min >= 0.0 && self.clamp_min < self.clamp_max) {
            return Err(ForecastError::Config(format!(
                "clamp range [{}, {}] is empty",
                self.clamp_min, self.clamp_max
            )));
        }
        if !(0.0..=1.0).contains(&self.blend_floor) || !(0.0..=1.0).contains(&self.blend_start) {
            return Err(ForecastError::Config("blend weights must be in [0, 1]".into()));
        }
        if self.noise_fraction < 0.0 || self.noise_growth < 0.0 || self.interval_growth < 0.0 {
            return Err(ForecastError::Config(
                "noise and interval growth must be non-negative".into(),
            ));
        }
        if self.holiday_multiplier <= 0.0 {
            return Err(ForecastError::Config("holiday_multiplier must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LearnerConfig {
    pub impact_window_days: i64,
    pub impact_min_samples: usize,
    pub governor_window_days: i64,
    pub governor_min_days: usize,
    pub min_improvement: f64,
    pub max_p_value: f64,
    pub min_win_rate: f64,
    /// Largest |Δw_AI| per governor update.
    pub max_step: f64,
    /// Extra w_AI applied on the experimental track.
    pub experimental_ai_step: f64,
    pub w_base_min: f64,
    pub w_base_max: f64,
    pub w_ai_max: f64,
    pub initial_weights: [f64; 3],
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            impact_window_days: 90,
            impact_min_samples: 50,
            governor_window_days: 30,
            governor_min_days: 30,
            min_improvement: 0.02,
            max_p_value: 0.05,
            min_win_rate: 0.55,
            max_step: 0.10,
            experimental_ai_step: 0.10,
            w_base_min: 0.70,
            w_base_max: 0.95,
            w_ai_max: 0.20,
            initial_weights: [0.85, 0.15, 0.0],
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HolidayConfig {
    /// Lunar-calendar holidays, which the generator cannot compute.
    pub lunar: Vec<NaiveDate>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WeatherConfig {
    pub base_url: String,
    pub station: String,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.weather.gov.hk/weatherAPI/opendata/opendata.php".to_string(),
            station: "HKO".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present - production uses env vars directly)
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aed-forecast");

        let builder = Config::builder()
            // 1. Load default values
            .set_default("database.url", std::env::var("DATABASE_URL").ok())?
            .set_default("database.max_connections", 5)?
            .set_default(
                "registry.root",
                default_registry_root().to_string_lossy().to_string(),
            )?
            .set_default("registry.keep_versions", 10)?
            // Training
            .set_default("training.split_fraction", 0.8)?
            .set_default("training.early_stopping_fraction", 0.15)?
            .set_default("training.cv_folds", 3)?
            .set_default("training.early_stopping_rounds", 50)?
            .set_default("training.time_decay_rate", 0.0)?
            .set_default("training.do_hyperparameter_search", false)?
            .set_default("training.search_trials", 30)?
            .set_default("training.auto_select_top_k", 25)?
            .set_default("training.overfit_ratio", 3.0)?
            .set_default("training.seed", 42)?
            // Prediction
            .set_default("prediction.horizon", 7)?
            .set_default("prediction.clamp_min", 50.0)?
            .set_default("prediction.clamp_max", 600.0)?
            .set_default("prediction.holiday_multiplier", 0.9)?
            // Learner
            .set_default("learner.impact_window_days", 90)?
            .set_default("learner.impact_min_samples", 50)?
            .set_default("learner.governor_window_days", 30)?
            .set_default("learner.governor_min_days", 30)?
            // Weather
            .set_default(
                "weather.base_url",
                "https://data.weather.gov.hk/weatherAPI/opendata/opendata.php",
            )?
            .set_default("weather.station", "HKO")?
            // Network
            .set_default("network.request_timeout_secs", 30)?
            .set_default("network.connect_timeout_secs", 10)?
            // 2. Load from local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))
            // 3. Load from user config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))
            // 4. Load from Environment variables (AED__TRAINING__CV_FOLDS=5)
            .add_source(Environment::with_prefix("AED").separator("__"));

        let s = builder.build().context("building configuration")?;
        let cfg: Self = s.try_deserialize().context("deserializing configuration")?;
        cfg.training.validate()?;
        cfg.prediction.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.split_fraction, 0.8);
        assert_eq!(config.early_stopping_fraction, 0.15);
        assert_eq!(config.cv_folds, 3);
        assert_eq!(config.overfit_ratio, 3.0);
        assert_eq!(config.feature_list, FeatureSelection::AutoSelect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_learner_defaults_sum_to_one() {
        let config = LearnerConfig::default();
        let sum: f64 = config.initial_weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert_eq!(config.impact_min_samples, 50);
        assert_eq!(config.governor_min_days, 30);
    }

    #[test]
    fn test_training_validate_rejects_two_folds() {
        let config = TrainingConfig {
            cv_folds: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ForecastError::Config(_))));
    }

    #[test]
    fn test_training_validate_rejects_inverted_period() {
        let config = TrainingConfig {
            excluded_periods: vec![ExcludedPeriod {
                start: NaiveDate::from_ymd_opt(2022, 3, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
                label: "covid".into(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prediction_validate_rejects_empty_clamp() {
        let config = PredictionConfig {
            clamp_min: 500.0,
            clamp_max: 100.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(PredictionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_excluded_period_is_inclusive() {
        let p = ExcludedPeriod {
            start: NaiveDate::from_ymd_opt(2020, 2, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2022, 12, 31).unwrap(),
            label: "pandemic".into(),
        };
        assert!(p.contains(p.start));
        assert!(p.contains(p.end));
        assert!(!p.contains(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()));
    }

    #[test]
    fn test_enum_settings_deserialize_from_toml() {
        let toml = r#"
            data_window = { last_n_years = 3 }
            exclusion_mode = { down_weight = 0.3 }
            feature_list = { explicit = ["Lag1", "Lag7"] }
        "#;
        let cfg = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();
        let training: TrainingConfig = cfg.try_deserialize().unwrap();
        assert_eq!(training.data_window, DataWindow::LastNYears(3));
        assert_eq!(training.exclusion_mode, ExclusionMode::DownWeight(0.3));
        assert_eq!(
            training.feature_list,
            FeatureSelection::Explicit(vec!["Lag1".into(), "Lag7".into()])
        );
    }

    #[test]
    fn test_config_load_with_defaults() {
        let config = AppConfig::load().expect("Config should load");
        assert!(config.network.request_timeout_secs > 0);
        assert!(config.training.cv_folds >= 3);
        assert_eq!(config.weather.station, "HKO");
    }

    /// Helper to safely set and remove environment variables in tests.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        // SAFETY: Test environment, the key is unique to one test
        unsafe {
            std::env::set_var(key, value);
        }
        let result = f();
        unsafe {
            std::env::remove_var(key);
        }
        result
    }

    #[test]
    fn test_env_var_overrides_weather_station() {
        let config = with_env_var("AED__WEATHER__STATION", "KP", || {
            AppConfig::load().expect("Config should load")
        });
        assert_eq!(config.weather.station, "KP");
    }
}
