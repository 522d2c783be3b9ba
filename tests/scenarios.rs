//! End-to-end scenarios through the public API.
//!
//! Everything runs against the in-memory adapters and a temporary registry,
//! so no database or network is needed.

use std::sync::Arc;

use aed_forecast::config::{LearnerConfig, PredictionConfig};
use aed_forecast::exogenous::WeatherTable;
use aed_forecast::learner::{FileLearnerState, ImpactParam};
use aed_forecast::ml::{DowProfile, Interval, Regressor, build_features};
use aed_forecast::{
    Exogenous, FeatureSet, ForecastError, Forecaster, GovernorDecision, HKT, HolidayCalendar,
    ImpactSet, LearnerState, MemoryAttendanceStore, MemoryLearnerState, MemoryPredictionLog,
    MockClock, ModelRegistry, PredictionRecord, RollingPredictor, Series, ServingModel, Track,
    WeatherDay, WeightUpdateRecord,
};
use approx::assert_relative_eq;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use tempfile::TempDir;

// ==================== Fixtures ====================

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn at(date: NaiveDate) -> DateTime<FixedOffset> {
    HKT.from_local_datetime(&date.and_hms_opt(9, 0, 0).unwrap())
        .unwrap()
}

/// 200, 210, ..., 260 over the first week of 2024.
fn first_week() -> Series {
    Series::from_values((0..7).map(|i| (d(2024, 1, 1 + i), 200.0 + 10.0 * i as f64))).unwrap()
}

/// Predicts yesterday's count plus one.
struct LagPlusOne;

impl Regressor for LagPlusOne {
    fn n_features(&self) -> usize {
        2
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        row[0] + 1.0
    }
}

fn plain_prediction() -> PredictionConfig {
    PredictionConfig {
        blend_enabled: false,
        noise_enabled: false,
        use_dow_factors: false,
        clamp_min: 0.0,
        clamp_max: 1000.0,
        ..Default::default()
    }
}

fn lag_plus_one_forecast(
    exo: &Exogenous,
    cfg: &PredictionConfig,
    history: &Series,
    start: NaiveDate,
    horizon: usize,
) -> Vec<PredictionRecord> {
    let features = FeatureSet::parse(&["Lag1", "Lag7"]).unwrap();
    let dow = DowProfile::default();
    let model = ServingModel {
        regressor: &LagPlusOne,
        features: &features,
        version: "toy",
        dow: &dow,
        residual_std: 10.0,
    };
    RollingPredictor::new(exo, cfg)
        .predict_range(&model, history, start, horizon, at(start))
        .unwrap()
}

fn record(date: NaiveDate, track: Track, final_value: f64, actual: f64) -> PredictionRecord {
    PredictionRecord {
        target_date: date,
        horizon: 0,
        track,
        base: final_value,
        weather_adj: 0.0,
        ai_adj: 0.0,
        final_value,
        ci80: Interval {
            low: final_value - 20.0,
            high: final_value + 20.0,
        },
        ci95: Interval {
            low: final_value - 30.0,
            high: final_value + 30.0,
        },
        model_version: "v20240101-000000-1".into(),
        predicted_at: at(date - Duration::days(1)),
        actual: None,
        error: None,
        error_pct: None,
        in_ci80: None,
        in_ci95: None,
    }
    .with_actual(actual)
}

fn forecaster(
    dir: &TempDir,
    log: MemoryPredictionLog,
    state: Arc<dyn LearnerState>,
    exo: Exogenous,
    learner: LearnerConfig,
    today: NaiveDate,
) -> Forecaster {
    let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();
    let clock = MockClock::new(Utc.from_utc_datetime(&today.and_hms_opt(2, 0, 0).unwrap()));
    Forecaster::new(
        Arc::new(MemoryAttendanceStore::default()),
        Arc::new(log),
        state,
        registry,
        exo,
    )
    .with_learner_config(learner)
    .with_clock(Arc::new(clock))
}

// ==================== Feature Construction ====================

#[test]
fn test_lag_features_are_exact() {
    let names = vec!["Lag1".to_string(), "Lag7".to_string()];
    let m = build_features(&first_week(), &Exogenous::default(), &names, &[d(2024, 1, 8)]).unwrap();
    assert_eq!(m.x.row(0).to_vec(), vec![260.0, 200.0]);
}

#[test]
fn test_same_day_count_does_not_leak_into_features() {
    let names = vec!["Lag1".to_string(), "Lag7".to_string()];
    let mut series = first_week();
    series.insert(d(2024, 1, 8), 999.0).unwrap();
    let m = build_features(&series, &Exogenous::default(), &names, &[d(2024, 1, 8)]).unwrap();
    assert_eq!(m.x.row(0).to_vec(), vec![260.0, 200.0]);
}

// ==================== Rolling Prediction ====================

#[test]
fn test_rolling_forecast_is_reproducible() {
    let exo = Exogenous::default();
    let cfg = plain_prediction();
    let points = |recs: Vec<PredictionRecord>| -> Vec<f64> {
        recs.iter()
            .filter(|r| r.track == Track::Production)
            .map(|r| r.final_value)
            .collect()
    };
    let first = points(lag_plus_one_forecast(&exo, &cfg, &first_week(), d(2024, 1, 8), 3));
    let second = points(lag_plus_one_forecast(&exo, &cfg, &first_week(), d(2024, 1, 8), 3));
    assert_eq!(first, vec![261.0, 262.0, 263.0]);
    assert_eq!(first, second);
}

#[test]
fn test_holiday_multiplier_applies_before_noise() {
    let xmas = d(2024, 12, 25);
    let history =
        Series::from_values((0..30).map(|i| (d(2024, 11, 25) + Duration::days(i), 300.0)))
            .unwrap();
    let cfg = plain_prediction();
    let without = lag_plus_one_forecast(&Exogenous::default(), &cfg, &history, xmas, 1)[0].base;
    let holidays = Exogenous::with_holidays(HolidayCalendar::new([xmas]));
    let with = lag_plus_one_forecast(&holidays, &cfg, &history, xmas, 1)[0].base;
    assert_relative_eq!(with, without * 0.9, epsilon = 1e-9);
}

// ==================== Fusion Governor ====================

#[test]
fn test_weak_evidence_leaves_weights_file_untouched() {
    let dir = TempDir::new().unwrap();
    let state = Arc::new(FileLearnerState::open(dir.path().join("learner")).unwrap());
    let learner = LearnerConfig {
        governor_min_days: 20,
        ..Default::default()
    };
    state
        .publish_fusion_weights(&WeightUpdateRecord::initial(&learner, at(d(2024, 2, 1))))
        .unwrap();
    let before = std::fs::read(state.weights_path()).unwrap();

    // production is off by 20 every day; experimental alternates 18.7 / 20.7
    let mut records = Vec::new();
    for i in 0..20 {
        let date = d(2024, 3, 1) + Duration::days(i);
        let shift = if i % 2 == 0 { 1.3 } else { -0.7 };
        records.push(record(date, Track::Production, 320.0, 300.0));
        records.push(record(date, Track::Experimental, 320.0 - shift, 300.0));
    }
    let log = MemoryPredictionLog::from_records(records);

    let f = forecaster(&dir, log, state.clone(), Exogenous::default(), learner, d(2024, 3, 22));
    let outcome = f.run_fusion_governor(30).unwrap();

    assert_eq!(outcome.decision, GovernorDecision::Unchanged);
    assert_eq!(outcome.new, outcome.old);
    let ev = outcome.evidence.expect("guardrails evaluated");
    assert_eq!(ev.days, 20);
    assert_relative_eq!(ev.improvement, 0.015, epsilon = 1e-9);
    assert!(ev.p_value > 0.15 && ev.p_value < 0.3, "p = {}", ev.p_value);

    let after = std::fs::read(state.weights_path()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_twenty_days_under_default_config_keep_weights() {
    let dir = TempDir::new().unwrap();
    let state = Arc::new(FileLearnerState::open(dir.path().join("learner")).unwrap());
    let learner = LearnerConfig::default();
    state
        .publish_fusion_weights(&WeightUpdateRecord::initial(&learner, at(d(2024, 2, 1))))
        .unwrap();
    let before = std::fs::read(state.weights_path()).unwrap();

    // experimental is clearly closer every day, but there are too few days
    let mut records = Vec::new();
    for i in 0..20 {
        let date = d(2024, 3, 1) + Duration::days(i);
        records.push(record(date, Track::Production, 320.0, 300.0));
        records.push(record(date, Track::Experimental, 305.0, 300.0));
    }
    let log = MemoryPredictionLog::from_records(records);

    let f = forecaster(&dir, log, state.clone(), Exogenous::default(), learner, d(2024, 3, 22));
    let outcome = f.run_fusion_governor(30).unwrap();

    assert_eq!(outcome.decision, GovernorDecision::Unchanged);
    assert_eq!(outcome.new, outcome.old);
    assert!(outcome.evidence.is_none());
    assert!(outcome.recommendation.contains("20 paired days"), "{}", outcome.recommendation);
    assert_eq!(std::fs::read(state.weights_path()).unwrap(), before);
}

// ==================== Weather-Impact Learner ====================

#[test]
fn test_impact_learner_refuses_small_samples() {
    let dir = TempDir::new().unwrap();
    let existing = ImpactSet {
        params: vec![ImpactParam {
            name: "Rainfall".into(),
            value: -0.8,
            sample_count: 60,
            updated_at: at(d(2024, 1, 1)),
        }],
    };
    let state = Arc::new(MemoryLearnerState::seeded(existing.clone(), None));

    let mut weather = WeatherTable::new();
    let mut records = Vec::new();
    for i in 0..30 {
        let date = d(2024, 4, 1) + Duration::days(i);
        weather.insert(WeatherDay {
            date,
            temp_mean: Some(24.0 + (i % 5) as f64),
            temp_max: Some(28.0),
            temp_min: Some(21.0),
            rainfall: Some((i % 3) as f64 * 4.0),
            humidity: Some(80.0),
            wind: Some(12.0),
            ..WeatherDay::empty(date)
        });
        records.push(record(date, Track::Production, 300.0, 300.0 + (i % 7) as f64));
    }
    let exo = Exogenous {
        weather,
        ..Default::default()
    };
    let f = forecaster(
        &dir,
        MemoryPredictionLog::from_records(records),
        state.clone(),
        exo,
        LearnerConfig::default(),
        d(2024, 5, 2),
    );

    let err = f.run_impact_learner(90).unwrap_err();
    assert!(matches!(
        err,
        ForecastError::InsufficientData {
            required: 50,
            found: 30,
            ..
        }
    ));
    assert_eq!(state.impact_params().unwrap(), existing);
}
