//! Hong Kong Observatory open-data client.
//!
//! Daily mean/max/min temperature come from the climate series
//! (`CLMTEMP`, `CLMMAXT`, `CLMMINT`), one request per element and month.
//! Daily rainfall comes from the weather and radiation report (`RYES`),
//! which is published the following day.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{NetworkConfig, WeatherConfig};
use crate::exogenous::WeatherDay;

/// Marker the Observatory uses for an unavailable value.
const MISSING: &str = "***";

/// One of the daily climate series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClimateElement {
    MeanTemp,
    MaxTemp,
    MinTemp,
}

impl ClimateElement {
    pub const ALL: [ClimateElement; 3] = [
        ClimateElement::MeanTemp,
        ClimateElement::MaxTemp,
        ClimateElement::MinTemp,
    ];

    pub fn data_type(self) -> &'static str {
        match self {
            ClimateElement::MeanTemp => "CLMTEMP",
            ClimateElement::MaxTemp => "CLMMAXT",
            ClimateElement::MinTemp => "CLMMINT",
        }
    }

    fn apply(self, day: &mut WeatherDay, value: Option<f64>) {
        match self {
            ClimateElement::MeanTemp => day.temp_mean = value,
            ClimateElement::MaxTemp => day.temp_max = value,
            ClimateElement::MinTemp => day.temp_min = value,
        }
    }
}

/// Climate series response. Every cell of `data` is a string:
/// year, month, day, value, completeness.
#[derive(Debug, Deserialize)]
pub struct ClimateResponse {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub data: Vec<Vec<String>>,
}

impl ClimateResponse {
    /// Dated values; `***` becomes `None`. Rows without a valid date are skipped.
    pub fn values(&self) -> Result<Vec<(NaiveDate, Option<f64>)>> {
        let mut out = Vec::with_capacity(self.data.len());
        for row in &self.data {
            let [year, month, day, value, ..] = row.as_slice() else {
                continue;
            };
            let (Ok(y), Ok(m), Ok(d)) = (year.parse(), month.parse(), day.parse()) else {
                continue;
            };
            let Some(date) = NaiveDate::from_ymd_opt(y, m, d) else {
                continue;
            };
            out.push((date, parse_value(value)?));
        }
        Ok(out)
    }
}

fn parse_value(raw: &str) -> Result<Option<f64>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == MISSING {
        return Ok(None);
    }
    // "Trace" rainfall is below 0.05 mm
    if raw.eq_ignore_ascii_case("trace") {
        return Ok(Some(0.0));
    }
    raw.parse::<f64>()
        .map(Some)
        .with_context(|| format!("Failed to parse observatory value '{}'", raw))
}

/// Weather and radiation report; only the rainfall reading is used.
#[derive(Debug, Deserialize)]
pub struct DailyReport {
    #[serde(rename = "HKOReadingsRainfall", default)]
    pub rainfall: Option<Value>,
}

impl DailyReport {
    pub fn rainfall_mm(&self) -> Result<Option<f64>> {
        match &self.rainfall {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => parse_value(s),
            Some(other) => anyhow::bail!("unexpected rainfall reading {}", other),
        }
    }
}

/// API client for the Observatory's open-data endpoint.
#[derive(Clone, Debug)]
pub struct ObservatoryClient {
    client: reqwest::Client,
    base_url: String,
    station: String,
}

impl ObservatoryClient {
    /// Create a new client with configurable timeouts.
    pub fn new(weather: &WeatherConfig, network_config: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(network_config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(network_config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: weather.base_url.clone(),
            station: weather.station.clone(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send request to observatory API")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Observatory API returned error status: {}", status);
        }

        response
            .json::<T>()
            .await
            .context("Failed to parse observatory API response")
    }

    /// One climate element for one month at the configured station.
    pub async fn fetch_climate(
        &self,
        element: ClimateElement,
        year: i32,
        month: u32,
    ) -> Result<Vec<(NaiveDate, Option<f64>)>> {
        let url = format!(
            "{}?dataType={}&rformat=json&station={}&year={}&month={}",
            self.base_url,
            element.data_type(),
            self.station,
            year,
            month
        );
        let body: ClimateResponse = self
            .get_json(url)
            .await
            .with_context(|| format!("{} {}-{:02}", element.data_type(), year, month))?;
        body.values()
    }

    /// Temperatures for every day of a month, merged into weather days.
    pub async fn fetch_month(&self, year: i32, month: u32) -> Result<Vec<WeatherDay>> {
        let mut days: BTreeMap<NaiveDate, WeatherDay> = BTreeMap::new();
        for element in ClimateElement::ALL {
            for (date, value) in self.fetch_climate(element, year, month).await? {
                let day = days.entry(date).or_insert_with(|| WeatherDay::empty(date));
                element.apply(day, value);
            }
        }
        debug!(year, month, days = days.len(), "observatory month fetched");
        Ok(days.into_values().collect())
    }

    /// Rainfall on `date`, read from the report issued the day after.
    pub async fn fetch_rainfall(&self, date: NaiveDate) -> Result<Option<f64>> {
        let report_date = date
            .succ_opt()
            .with_context(|| format!("No report date after {}", date))?;
        let url = format!(
            "{}?dataType=RYES&lang=en&rformat=json&date={}",
            self.base_url,
            report_date.format("%Y%m%d")
        );
        let report: DailyReport = self
            .get_json(url)
            .await
            .with_context(|| format!("RYES {}", report_date))?;
        report.rainfall_mm()
    }

    /// Temperatures and rainfall for every day of `[start, end]`.
    pub async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<WeatherDay>> {
        let mut out = Vec::new();
        let mut cursor = NaiveDate::from_ymd_opt(start.year(), start.month(), 1)
            .context("Invalid start month")?;
        while cursor <= end {
            for mut day in self.fetch_month(cursor.year(), cursor.month()).await? {
                if day.date < start || day.date > end {
                    continue;
                }
                day.rainfall = self.fetch_rainfall(day.date).await?;
                out.push(day);
            }
            cursor = cursor
                .checked_add_months(chrono::Months::new(1))
                .context("Month overflow")?;
        }
        Ok(out)
    }
}
