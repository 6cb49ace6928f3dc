use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, trace};

use crate::config::{Coordinates, WeatherConfig};
use crate::error::ForecastError;
use crate::models::weather::{ApiErrorResponse, HourlyBlock, HourlyForecastResponse, WeatherSample, WeatherSeries};

const HOURLY_VARIABLES: &str =
    "shortwave_radiation,direct_normal_irradiance,diffuse_radiation,temperature_2m,cloud_cover,wind_speed_10m";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Narrow query interface to the weather data provider.
///
/// Implementations do not retry; the coordinator treats any error as a failure
/// of the affected array for the current cycle.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, location: Coordinates, horizon_days: u8) -> Result<WeatherSeries, ForecastError>;
}

/// Open-Meteo forecast API client
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: Client,
    base_url: String,
    model: Option<String>,
}

impl OpenMeteoClient {
    pub fn new(config: &WeatherConfig) -> Result<Self, ForecastError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ForecastError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    async fn fetch(&self, location: Coordinates, horizon_days: u8) -> Result<WeatherSeries, ForecastError> {
        let mut query = vec![
            ("latitude", location.latitude.to_string()),
            ("longitude", location.longitude.to_string()),
            ("hourly", HOURLY_VARIABLES.to_string()),
            ("timezone", "GMT".to_string()),
            ("wind_speed_unit", "ms".to_string()),
            ("forecast_days", horizon_days.to_string()),
        ];
        if let Some(model) = &self.model {
            query.push(("models", model.clone()));
        }

        debug!(lat = location.latitude, lon = location.longitude, days = horizon_days, "requesting weather forecast");
        let response = self.client.get(&self.base_url).query(&query).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ForecastError::RateLimit(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.reason)
                .unwrap_or(body);
            return Err(ForecastError::Network(format!("HTTP {status}: {reason}")));
        }

        let body = response.text().await?;
        let parsed: HourlyForecastResponse = serde_json::from_str(&body)?;
        let hourly = parsed
            .hourly
            .ok_or_else(|| ForecastError::MalformedResponse("response has no hourly block".to_string()))?;

        let samples = samples_from_hourly(&hourly, horizon_days)?;
        trace!(samples = samples.len(), "weather forecast parsed");

        Ok(WeatherSeries { issued_at: Utc::now(), samples })
    }
}

/// Converts the column-oriented block into hour-start labelled samples.
///
/// Open-Meteo reports irradiance as the average of the preceding hour, so the
/// value stamped 12:00 describes 11:00–12:00 and is relabelled to 11:00.
///
/// Timestamps must be strictly ascending and lie within `horizon_days` of the
/// first one.
fn samples_from_hourly(hourly: &HourlyBlock, horizon_days: u8) -> Result<Vec<WeatherSample>, ForecastError> {
    if hourly.time.is_empty() {
        return Err(ForecastError::MalformedResponse("hourly time series is empty".to_string()));
    }

    let at = |series: &[Option<f64>], i: usize| series.get(i).copied().flatten();
    let horizon = Duration::days(i64::from(horizon_days.max(1)));
    let mut window: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

    hourly
        .time
        .iter()
        .enumerate()
        .map(|(i, raw)| -> Result<WeatherSample, ForecastError> {
            let timestamp = NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
                .map_err(|e| ForecastError::MalformedResponse(format!("bad timestamp '{raw}': {e}")))?
                .and_utc()
                - Duration::hours(1);

            match window {
                None => window = Some((timestamp + horizon, timestamp)),
                Some((end, last)) => {
                    if timestamp <= last {
                        return Err(ForecastError::MalformedResponse(format!("timestamp '{raw}' is not ascending")));
                    }
                    if timestamp >= end {
                        return Err(ForecastError::MalformedResponse(format!(
                            "timestamp '{raw}' lies beyond the {horizon_days}-day horizon"
                        )));
                    }
                    window = Some((end, timestamp));
                }
            }

            Ok(WeatherSample {
                timestamp,
                ghi_w_m2: at(&hourly.shortwave_radiation, i),
                dni_w_m2: at(&hourly.direct_normal_irradiance, i),
                dhi_w_m2: at(&hourly.diffuse_radiation, i),
                cloud_cover_pct: at(&hourly.cloud_cover, i),
                temperature_c: at(&hourly.temperature_2m, i),
                wind_speed_m_s: at(&hourly.wind_speed_10m, i),
            })
        })
        .collect()
}
