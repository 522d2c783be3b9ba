use std::path::PathBuf;
use std::sync::Arc;

use aed_forecast::config::{AppConfig, FeatureSelection};
use aed_forecast::learner::{self, FileLearnerState, GovernorDecision};
use aed_forecast::store::{self, MemoryAttendanceStore, MemoryLearnerState, MemoryPredictionLog};
use aed_forecast::{
    AttendancePoint, Clock, Database, Exogenous, ForecastError, Forecaster, HolidayCalendar,
    LearnerState, ModelRegistry, ObservatoryClient, PredictionRecord, Series, SystemClock, Track,
};
use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "aed-forecast")]
#[command(about = "Daily A&E attendance forecasting with a continuous-learning loop")]
struct Args {
    /// Attendance CSV (`date,count`) used instead of the database
    #[arg(long, global = true)]
    history: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import an attendance CSV into the database
    Import { file: PathBuf },
    /// Fetch daily weather from the Observatory into the database
    FetchWeather {
        #[arg(long, value_parser = parse_date)]
        start: NaiveDate,
        #[arg(long, value_parser = parse_date)]
        end: Option<NaiveDate>,
    },
    /// Train and publish a new model version
    Train {
        /// Comma-separated feature names; omit to auto-select
        #[arg(long, value_delimiter = ',')]
        features: Vec<String>,
        /// Reuse the feature list of the latest model
        #[arg(long, conflicts_with = "features")]
        reuse_features: bool,
        /// Run the hyperparameter search first
        #[arg(long)]
        search: bool,
    },
    /// Forecast with the latest model
    Predict {
        /// First forecast day; defaults to tomorrow in Hong Kong
        #[arg(long, value_parser = parse_date)]
        start: Option<NaiveDate>,
        #[arg(long)]
        horizon: Option<usize>,
    },
    /// Record an observed daily count and evaluate its predictions
    RecordActual {
        #[arg(value_parser = parse_date)]
        date: NaiveDate,
        count: i64,
    },
    /// Refit the weather-impact coefficients
    LearnImpact {
        #[arg(long)]
        window_days: Option<i64>,
    },
    /// Compare production and experimental tracks and maybe move the fusion weights
    Govern {
        #[arg(long)]
        window_days: Option<i64>,
    },
    /// Error and interval coverage over recent evaluated predictions
    Accuracy {
        #[arg(long, default_value_t = 30)]
        days: i64,
        #[arg(long, default_value = "production")]
        track: String,
    },
    /// Export the prediction log to a timestamped CSV file
    Export {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, value_parser = parse_date)]
        start: NaiveDate,
        #[arg(long, value_parser = parse_date)]
        end: NaiveDate,
    },
    /// List registry versions, optionally pruning old ones
    Models {
        #[arg(long)]
        prune: bool,
    },
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    aed_forecast::series::parse_date(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("aed_forecast=debug");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let config = Arc::new(config);

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    rt.block_on(run(args, config))
}

// ==================== Backend ====================

/// Where the run reads its inputs and writes its results.
enum Backend {
    Database(Database),
    /// CSV history with file-based learner state next to the registry.
    Files(PathBuf),
}

impl Backend {
    async fn connect(args: &Args, config: &AppConfig) -> Result<Self> {
        if let Some(path) = &args.history {
            return Ok(Backend::Files(path.clone()));
        }
        let url = config
            .database
            .url
            .as_deref()
            .context("No database configured: set DATABASE_URL or pass --history")?;
        tracing::info!("Connecting to database...");
        let database = Database::new(url).await?;
        tracing::info!("Database connected successfully");
        Ok(Backend::Database(database))
    }

    fn database(&self) -> Result<&Database> {
        match self {
            Backend::Database(db) => Ok(db),
            Backend::Files(_) => anyhow::bail!("This command needs the database"),
        }
    }
}

/// Prediction log hydrated for one run, plus the forecaster over it.
struct Session {
    log: Arc<MemoryPredictionLog>,
    forecaster: Forecaster,
}

fn calendar(series: &Series, extra: Vec<NaiveDate>, config: &AppConfig) -> HolidayCalendar {
    let today = SystemClock.today_hkt();
    let first = series.first_date().unwrap_or(today).year();
    let last = series.last_date().unwrap_or(today).year().max(today.year()) + 1;
    HolidayCalendar::hong_kong(
        first..=last,
        extra.into_iter().chain(config.holidays.lunar.iter().copied()),
    )
}

async fn open_session(
    backend: &Backend,
    config: &AppConfig,
    predictions: Vec<PredictionRecord>,
) -> Result<Session> {
    let registry = ModelRegistry::open(config.registry.root.clone())?;

    let (series, exo, state): (Series, Exogenous, Arc<dyn LearnerState>) = match backend {
        Backend::Database(db) => {
            let snapshot = db.snapshot().await?;
            let holidays = calendar(&snapshot.series, snapshot.holidays, config);
            let exo = Exogenous {
                weather: snapshot.weather,
                aqhi: snapshot.aqhi,
                factors: snapshot.factors,
                holidays,
            };
            let state: Arc<dyn LearnerState> =
                Arc::new(MemoryLearnerState::seeded(snapshot.impact, snapshot.fusion));
            (snapshot.series, exo, state)
        }
        Backend::Files(path) => {
            let series = Series::from_points(store::import_attendance_file(path)?);
            let exo = Exogenous::with_holidays(calendar(&series, Vec::new(), config));
            let state: Arc<dyn LearnerState> =
                Arc::new(FileLearnerState::open(config.registry.root.join("learner"))?);
            (series, exo, state)
        }
    };
    tracing::info!(
        days = series.len(),
        weather_days = exo.weather.len(),
        holidays = exo.holidays.len(),
        "history loaded"
    );

    let store = Arc::new(MemoryAttendanceStore::new(series));
    let log = Arc::new(MemoryPredictionLog::from_records(predictions));
    let forecaster = Forecaster::new(store, log.clone(), state, registry, exo)
        .with_prediction_config(config.prediction.clone())
        .with_learner_config(config.learner.clone());

    Ok(Session { log, forecaster })
}

async fn recent_predictions(backend: &Backend, days: i64) -> Result<Vec<PredictionRecord>> {
    match backend {
        Backend::Database(db) => {
            let end = SystemClock.today_hkt();
            db.load_predictions(end - Duration::days(days.max(1)), end).await
        }
        Backend::Files(_) => Ok(Vec::new()),
    }
}

// ==================== Commands ====================

async fn run(args: Args, config: Arc<AppConfig>) -> Result<()> {
    let backend = Backend::connect(&args, &config).await?;

    match args.command {
        Command::Import { file } => {
            let points = store::import_attendance_file(&file)
                .with_context(|| format!("Failed to import {}", file.display()))?;
            let written = backend.database()?.upsert_attendance(&points).await?;
            tracing::info!(rows = written, "attendance imported");
        }
        Command::FetchWeather { start, end } => {
            let end = end.unwrap_or_else(|| SystemClock.today_hkt() - Duration::days(1));
            let client = ObservatoryClient::new(&config.weather, &config.network)?;
            tracing::info!(%start, %end, "fetching observatory weather");
            let days = client.fetch_range(start, end).await?;
            let written = backend.database()?.upsert_weather(&days).await?;
            tracing::info!(days = written, "weather stored");
        }
        Command::Train {
            features,
            reuse_features,
            search,
        } => {
            let mut training = config.training.clone();
            if reuse_features {
                training.feature_list = FeatureSelection::FromLatestArtifact;
            } else if !features.is_empty() {
                training.feature_list = FeatureSelection::Explicit(features);
            }
            training.do_hyperparameter_search |= search;
            training.validate()?;

            let session = open_session(&backend, &config, Vec::new()).await?;
            let version = session.forecaster.train(&training)?;
            let pruned = session.forecaster.registry().prune(config.registry.keep_versions)?;
            if !pruned.is_empty() {
                tracing::info!(count = pruned.len(), "old model versions pruned");
            }
            println!("{}", version);
        }
        Command::Predict { start, horizon } => {
            config.prediction.validate()?;
            let start = start.unwrap_or_else(|| SystemClock.today_hkt() + Duration::days(1));
            let horizon = horizon.unwrap_or(config.prediction.horizon);

            let session = open_session(&backend, &config, Vec::new()).await?;
            let records = session.forecaster.predict_range(start, horizon)?;
            print_records(&records);
            match &backend {
                Backend::Database(db) => {
                    db.upsert_predictions(&records).await?;
                }
                Backend::Files(_) => {
                    let path = store::export_predictions(
                        &config.registry.root.join("predictions"),
                        &records,
                        SystemClock.now_hkt(),
                    )?;
                    tracing::info!(path = %path.display(), "predictions written");
                }
            }
        }
        Command::RecordActual { date, count } => {
            let db = backend.database()?;
            let predictions = db.load_predictions(date, date).await?;
            let session = open_session(&backend, &config, predictions).await?;
            let evaluated = session.forecaster.record_actual(date, count)?;

            db.upsert_attendance(&[AttendancePoint::new(date, count)?]).await?;
            db.upsert_predictions(&session.log.all()).await?;
            if let Some(r) = evaluated {
                println!(
                    "{} predicted {:.0}, actual {}, error {:+.1}",
                    date,
                    r.final_value,
                    count,
                    r.error.unwrap_or_default()
                );
            }
        }
        Command::LearnImpact { window_days } => {
            let days = window_days.unwrap_or(config.learner.impact_window_days);
            let predictions = recent_predictions(&backend, days).await?;
            let session = open_session(&backend, &config, predictions).await?;
            match session.forecaster.run_impact_learner(days) {
                Ok(set) => {
                    if let Backend::Database(db) = &backend {
                        db.save_impact_params(&set).await?;
                    }
                    for p in &set.params {
                        println!("{:<16} {:>10.4} (n={})", p.name, p.value, p.sample_count);
                    }
                }
                Err(ForecastError::InsufficientData { required, found, .. }) => {
                    tracing::warn!(required, found, "too few samples, impact parameters kept");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Govern { window_days } => {
            let days = window_days.unwrap_or(config.learner.governor_window_days);
            let predictions = recent_predictions(&backend, days).await?;
            let session = open_session(&backend, &config, predictions).await?;
            let outcome = session.forecaster.run_fusion_governor(days)?;
            if outcome.decision == GovernorDecision::Updated {
                if let Backend::Database(db) = &backend {
                    db.publish_fusion_weights(&outcome).await?;
                }
            }
            println!(
                "{:?}: base {:.3} weather {:.3} ai {:.3} ({})",
                outcome.decision,
                outcome.new.w_base,
                outcome.new.w_weather,
                outcome.new.w_ai,
                outcome.recommendation
            );
        }
        Command::Accuracy { days, track } => {
            let track = Track::parse(&track)
                .with_context(|| format!("Unknown track '{}'", track))?;
            let predictions = recent_predictions(&backend, days).await?;
            let log = MemoryPredictionLog::from_records(predictions);
            let end = SystemClock.today_hkt();
            match learner::summarize(&log, end - Duration::days(days.max(1)), end, track)? {
                Some(s) => println!(
                    "n={} mae={:.1} mape={:.2}% bias={:+.1} ci80={:.0}% ci95={:.0}%",
                    s.n,
                    s.mae,
                    s.mape,
                    s.bias,
                    100.0 * s.coverage80,
                    100.0 * s.coverage95
                ),
                None => println!("no evaluated predictions in the last {} days", days),
            }
        }
        Command::Export {
            out_dir,
            start,
            end,
        } => {
            let path = backend
                .database()?
                .export_predictions_csv(&out_dir, start, end, &SystemClock)
                .await?;
            println!("{}", path.display());
        }
        Command::Models { prune } => {
            let registry = ModelRegistry::open(config.registry.root.clone())?;
            if prune {
                for v in registry.prune(config.registry.keep_versions)? {
                    tracing::info!(version = %v, "pruned");
                }
            }
            let latest = registry.latest_version()?;
            for v in registry.list_versions()? {
                let marker = if latest.as_deref() == Some(v.as_str()) { "*" } else { " " };
                println!("{} {}", marker, v);
            }
        }
    }
    Ok(())
}

fn print_records(records: &[PredictionRecord]) {
    for r in records.iter().filter(|r| r.track == Track::Production) {
        println!(
            "{} {:>6.0}  80% [{:.0}, {:.0}]  95% [{:.0}, {:.0}]",
            r.target_date, r.final_value, r.ci80.low, r.ci80.high, r.ci95.low, r.ci95.high
        );
    }
}
