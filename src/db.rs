//! PostgreSQL adapter.
//!
//! Holds the attendance series, exogenous tables, the prediction log and the
//! learner state. The core never awaits: the binary loads a [`Snapshot`]
//! into the in-memory adapters, runs the core, then writes results back.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use crate::error::ForecastError;
use crate::exogenous::{
    AqhiDay, AqhiRisk, AqhiTable, FactorCategory, FactorTable, QualitativeFactor, WeatherDay,
    WeatherTable,
};
use crate::learner::{ImpactParam, ImpactSet, WeightUpdateRecord};
use crate::ml::{Interval, PredictionRecord, Track};
use crate::series::{AttendancePoint, Series};
use crate::traits::{Clock, HKT};

#[derive(Debug, Clone, FromRow)]
struct AttendanceRow {
    date: NaiveDate,
    count: i32,
}

#[derive(Debug, Clone, FromRow)]
struct WeatherRow {
    date: NaiveDate,
    temp_mean: Option<f64>,
    temp_max: Option<f64>,
    temp_min: Option<f64>,
    rainfall: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    wind: Option<f64>,
    visibility: Option<f64>,
    cloud: Option<f64>,
    sunshine: Option<f64>,
}

impl From<WeatherRow> for WeatherDay {
    fn from(r: WeatherRow) -> Self {
        WeatherDay {
            date: r.date,
            temp_mean: r.temp_mean,
            temp_max: r.temp_max,
            temp_min: r.temp_min,
            rainfall: r.rainfall,
            humidity: r.humidity,
            pressure: r.pressure,
            wind: r.wind,
            visibility: r.visibility,
            cloud: r.cloud,
            sunshine: r.sunshine,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct AqhiRow {
    date: NaiveDate,
    general_max: Option<f64>,
    roadside_max: Option<f64>,
    risk: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct FactorRow {
    date: NaiveDate,
    multiplier: f64,
    confidence: f64,
    category: String,
}

/// One row of the `predictions` table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PredictionRow {
    pub target_date: NaiveDate,
    pub model_version: String,
    pub track: String,
    pub horizon: i32,
    pub base: f64,
    pub weather_adj: f64,
    pub ai_adj: f64,
    pub final_value: f64,
    pub ci80_low: f64,
    pub ci80_high: f64,
    pub ci95_low: f64,
    pub ci95_high: f64,
    pub predicted_at: DateTime<Utc>,
    pub actual: Option<f64>,
    pub error: Option<f64>,
    pub error_pct: Option<f64>,
    pub in_ci80: Option<bool>,
    pub in_ci95: Option<bool>,
}

impl From<&PredictionRecord> for PredictionRow {
    fn from(r: &PredictionRecord) -> Self {
        Self {
            target_date: r.target_date,
            model_version: r.model_version.clone(),
            track: r.track.as_str().to_string(),
            horizon: i32::try_from(r.horizon).unwrap_or(i32::MAX),
            base: r.base,
            weather_adj: r.weather_adj,
            ai_adj: r.ai_adj,
            final_value: r.final_value,
            ci80_low: r.ci80.low,
            ci80_high: r.ci80.high,
            ci95_low: r.ci95.low,
            ci95_high: r.ci95.high,
            predicted_at: r.predicted_at.with_timezone(&Utc),
            actual: r.actual,
            error: r.error,
            error_pct: r.error_pct,
            in_ci80: r.in_ci80,
            in_ci95: r.in_ci95,
        }
    }
}

impl TryFrom<PredictionRow> for PredictionRecord {
    type Error = ForecastError;

    fn try_from(r: PredictionRow) -> Result<Self, Self::Error> {
        let track = Track::parse(&r.track)
            .ok_or_else(|| ForecastError::Malformed(format!("unknown track '{}'", r.track)))?;
        Ok(PredictionRecord {
            target_date: r.target_date,
            horizon: u32::try_from(r.horizon)
                .map_err(|_| ForecastError::Malformed(format!("negative horizon {}", r.horizon)))?,
            track,
            base: r.base,
            weather_adj: r.weather_adj,
            ai_adj: r.ai_adj,
            final_value: r.final_value,
            ci80: Interval {
                low: r.ci80_low,
                high: r.ci80_high,
            },
            ci95: Interval {
                low: r.ci95_low,
                high: r.ci95_high,
            },
            model_version: r.model_version,
            predicted_at: r.predicted_at.with_timezone(&HKT),
            actual: r.actual,
            error: r.error,
            error_pct: r.error_pct,
            in_ci80: r.in_ci80,
            in_ci95: r.in_ci95,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct ImpactRow {
    name: String,
    value: f64,
    sample_count: i32,
    updated_at: DateTime<Utc>,
}

/// Everything the core reads, loaded in one go.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub series: Series,
    pub weather: WeatherTable,
    pub aqhi: AqhiTable,
    pub factors: FactorTable,
    pub holidays: Vec<NaiveDate>,
    pub impact: ImpactSet,
    pub fusion: Option<WeightUpdateRecord>,
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    // ==================== Attendance ====================

    pub async fn load_series(&self) -> Result<Series> {
        let rows: Vec<AttendanceRow> =
            sqlx::query_as("SELECT date, count FROM attendance ORDER BY date ASC")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch attendance")?;
        let points = rows
            .into_iter()
            .map(|r| AttendancePoint::new(r.date, i64::from(r.count)))
            .collect::<Result<Vec<_>, _>>()
            .context("Attendance table holds an invalid count")?;
        Ok(Series::from_points(points))
    }

    /// Insert or overwrite counts in one transaction.
    pub async fn upsert_attendance(&self, points: &[AttendancePoint]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for p in points {
            let count = i32::try_from(p.count).context("Attendance count overflows INTEGER")?;
            sqlx::query(
                "INSERT INTO attendance (date, count) VALUES ($1, $2) \
                 ON CONFLICT (date) DO UPDATE SET count = EXCLUDED.count",
            )
            .bind(p.date)
            .bind(count)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert attendance for {}", p.date))?;
        }
        tx.commit().await.context("Failed to commit attendance")?;
        debug!(rows = points.len(), "attendance upserted");
        Ok(points.len())
    }

    // ==================== Exogenous ====================

    pub async fn load_weather(&self) -> Result<WeatherTable> {
        let rows: Vec<WeatherRow> = sqlx::query_as(
            "SELECT date, temp_mean, temp_max, temp_min, rainfall, humidity, pressure, wind, \
             visibility, cloud, sunshine FROM weather_daily ORDER BY date ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch weather")?;
        Ok(rows.into_iter().map(WeatherDay::from).collect())
    }

    /// Upsert weather days; a missing field never overwrites a stored one.
    pub async fn upsert_weather(&self, days: &[WeatherDay]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for d in days {
            sqlx::query(
                "INSERT INTO weather_daily (date, temp_mean, temp_max, temp_min, rainfall, humidity, \
                 pressure, wind, visibility, cloud, sunshine) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (date) DO UPDATE SET \
                 temp_mean = COALESCE(EXCLUDED.temp_mean, weather_daily.temp_mean), \
                 temp_max = COALESCE(EXCLUDED.temp_max, weather_daily.temp_max), \
                 temp_min = COALESCE(EXCLUDED.temp_min, weather_daily.temp_min), \
                 rainfall = COALESCE(EXCLUDED.rainfall, weather_daily.rainfall), \
                 humidity = COALESCE(EXCLUDED.humidity, weather_daily.humidity), \
                 pressure = COALESCE(EXCLUDED.pressure, weather_daily.pressure), \
                 wind = COALESCE(EXCLUDED.wind, weather_daily.wind), \
                 visibility = COALESCE(EXCLUDED.visibility, weather_daily.visibility), \
                 cloud = COALESCE(EXCLUDED.cloud, weather_daily.cloud), \
                 sunshine = COALESCE(EXCLUDED.sunshine, weather_daily.sunshine)",
            )
            .bind(d.date)
            .bind(d.temp_mean)
            .bind(d.temp_max)
            .bind(d.temp_min)
            .bind(d.rainfall)
            .bind(d.humidity)
            .bind(d.pressure)
            .bind(d.wind)
            .bind(d.visibility)
            .bind(d.cloud)
            .bind(d.sunshine)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert weather for {}", d.date))?;
        }
        tx.commit().await.context("Failed to commit weather")?;
        info!(rows = days.len(), "weather upserted");
        Ok(days.len())
    }

    pub async fn load_aqhi(&self) -> Result<AqhiTable> {
        let rows: Vec<AqhiRow> = sqlx::query_as(
            "SELECT date, general_max, roadside_max, risk FROM aqhi_daily ORDER BY date ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch AQHI")?;
        rows.into_iter()
            .map(|r| -> Result<AqhiDay, ForecastError> {
                let risk = r.risk.as_deref().map(AqhiRisk::parse).transpose()?;
                Ok(AqhiDay {
                    date: r.date,
                    general_max: r.general_max,
                    roadside_max: r.roadside_max,
                    risk,
                })
            })
            .collect::<Result<AqhiTable, ForecastError>>()
            .context("AQHI table holds an invalid risk")
    }

    pub async fn load_factors(&self) -> Result<FactorTable> {
        let rows: Vec<FactorRow> = sqlx::query_as(
            "SELECT date, multiplier, confidence, category FROM qualitative_factors ORDER BY date ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch qualitative factors")?;
        rows.into_iter()
            .map(|r| {
                QualitativeFactor::new(
                    r.date,
                    r.multiplier,
                    r.confidence,
                    FactorCategory::parse(&r.category),
                )
            })
            .collect::<Result<FactorTable, ForecastError>>()
            .context("Qualitative factor table holds an invalid row")
    }

    /// Listed (lunar and ad-hoc) holidays.
    pub async fn load_holidays(&self) -> Result<Vec<NaiveDate>> {
        sqlx::query_scalar("SELECT date FROM holidays ORDER BY date ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch holidays")
    }

    // ==================== Prediction Log ====================

    pub async fn load_predictions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PredictionRecord>> {
        let rows: Vec<PredictionRow> = sqlx::query_as(
            "SELECT target_date, model_version, track, horizon, base, weather_adj, ai_adj, \
             final_value, ci80_low, ci80_high, ci95_low, ci95_high, predicted_at, actual, error, \
             error_pct, in_ci80, in_ci95 FROM predictions \
             WHERE target_date >= $1 AND target_date <= $2 \
             ORDER BY target_date ASC, predicted_at ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch predictions")?;
        rows.into_iter()
            .map(PredictionRecord::try_from)
            .collect::<Result<Vec<_>, _>>()
            .context("Prediction log holds an invalid row")
    }

    /// Insert or replace records keyed by (target date, model version, track).
    pub async fn upsert_predictions(&self, records: &[PredictionRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for r in records {
            let row = PredictionRow::from(r);
            sqlx::query(
                "INSERT INTO predictions (target_date, model_version, track, horizon, base, \
                 weather_adj, ai_adj, final_value, ci80_low, ci80_high, ci95_low, ci95_high, \
                 predicted_at, actual, error, error_pct, in_ci80, in_ci95) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
                 ON CONFLICT (target_date, model_version, track) DO UPDATE SET \
                 horizon = EXCLUDED.horizon, base = EXCLUDED.base, \
                 weather_adj = EXCLUDED.weather_adj, ai_adj = EXCLUDED.ai_adj, \
                 final_value = EXCLUDED.final_value, ci80_low = EXCLUDED.ci80_low, \
                 ci80_high = EXCLUDED.ci80_high, ci95_low = EXCLUDED.ci95_low, \
                 ci95_high = EXCLUDED.ci95_high, predicted_at = EXCLUDED.predicted_at, \
                 actual = EXCLUDED.actual, error = EXCLUDED.error, error_pct = EXCLUDED.error_pct, \
                 in_ci80 = EXCLUDED.in_ci80, in_ci95 = EXCLUDED.in_ci95",
            )
            .bind(row.target_date)
            .bind(&row.model_version)
            .bind(&row.track)
            .bind(row.horizon)
            .bind(row.base)
            .bind(row.weather_adj)
            .bind(row.ai_adj)
            .bind(row.final_value)
            .bind(row.ci80_low)
            .bind(row.ci80_high)
            .bind(row.ci95_low)
            .bind(row.ci95_high)
            .bind(row.predicted_at)
            .bind(row.actual)
            .bind(row.error)
            .bind(row.error_pct)
            .bind(row.in_ci80)
            .bind(row.in_ci95)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert prediction for {}", r.target_date))?;
        }
        tx.commit().await.context("Failed to commit predictions")?;
        debug!(rows = records.len(), "predictions upserted");
        Ok(records.len())
    }

    // ==================== Learner State ====================

    pub async fn load_impact_params(&self) -> Result<ImpactSet> {
        let rows: Vec<ImpactRow> = sqlx::query_as(
            "SELECT name, value, sample_count, updated_at FROM weather_impact_params ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch weather-impact parameters")?;
        Ok(ImpactSet {
            params: rows
                .into_iter()
                .map(|r| ImpactParam {
                    name: r.name,
                    value: r.value,
                    sample_count: usize::try_from(r.sample_count).unwrap_or(0),
                    updated_at: r.updated_at.with_timezone(&HKT),
                })
                .collect(),
        })
    }

    /// Replace the whole parameter set atomically.
    pub async fn save_impact_params(&self, set: &ImpactSet) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query("DELETE FROM weather_impact_params")
            .execute(&mut *tx)
            .await
            .context("Failed to clear weather-impact parameters")?;
        for p in &set.params {
            sqlx::query(
                "INSERT INTO weather_impact_params (name, value, sample_count, updated_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&p.name)
            .bind(p.value)
            .bind(i32::try_from(p.sample_count).unwrap_or(i32::MAX))
            .bind(p.updated_at.with_timezone(&Utc))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert parameter {}", p.name))?;
        }
        tx.commit().await.context("Failed to commit weather-impact parameters")?;
        info!(params = set.params.len(), "weather-impact parameters saved");
        Ok(())
    }

    pub async fn load_fusion_weights(&self) -> Result<Option<WeightUpdateRecord>> {
        let record: Option<String> =
            sqlx::query_scalar("SELECT record FROM fusion_weights ORDER BY version DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch fusion weights")?;
        record
            .map(|json| serde_json::from_str(&json).context("Fusion weight record is corrupt"))
            .transpose()
    }

    pub async fn publish_fusion_weights(&self, record: &WeightUpdateRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize fusion weights")?;
        let version = i64::try_from(record.version).context("Fusion weight version overflows")?;
        sqlx::query(
            "INSERT INTO fusion_weights (version, w_base, w_weather, w_ai, recommendation, record, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(version)
        .bind(record.new.w_base)
        .bind(record.new.w_weather)
        .bind(record.new.w_ai)
        .bind(&record.recommendation)
        .bind(json)
        .bind(record.updated_at.with_timezone(&Utc))
        .execute(&self.pool)
        .await
        .context("Failed to publish fusion weights")?;
        info!(version = record.version, "fusion weights published");
        Ok(())
    }

    // ==================== Snapshot & Export ====================

    /// Load everything the core reads.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            series: self.load_series().await?,
            weather: self.load_weather().await?,
            aqhi: self.load_aqhi().await?,
            factors: self.load_factors().await?,
            holidays: self.load_holidays().await?,
            impact: self.load_impact_params().await?,
            fusion: self.load_fusion_weights().await?,
        })
    }

    /// Export the prediction log for `[start, end]` to a timestamped CSV file.
    pub async fn export_predictions_csv<C: Clock>(
        &self,
        output_dir: &Path,
        start: NaiveDate,
        end: NaiveDate,
        clock: &C,
    ) -> Result<PathBuf> {
        let records = self
            .load_predictions(start, end)
            .await
            .context("Failed to fetch predictions for export")?;
        let now = clock.now_hkt();
        let dir = output_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            crate::store::export_predictions(&dir, &records, now)
                .context("Failed to write prediction CSV")
        })
        .await
        .context("CSV export task failed")?
    }
}

/// Map an adapter failure into the core taxonomy.
pub fn unavailable(err: anyhow::Error) -> ForecastError {
    ForecastError::StoreUnavailable(format!("{:#}", err))
}
