use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Provider-neutral weather input ──────────────────────────────────────────

/// One hourly weather record covering `[timestamp, timestamp + 1h)`.
/// Absent fields mean the provider returned no (or a null) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub timestamp: DateTime<Utc>,
    /// Global horizontal irradiance (W/m²)
    pub ghi_w_m2: Option<f64>,
    /// Direct normal irradiance (W/m²)
    pub dni_w_m2: Option<f64>,
    /// Diffuse horizontal irradiance (W/m²)
    pub dhi_w_m2: Option<f64>,
    pub cloud_cover_pct: Option<f64>,
    pub temperature_c: Option<f64>,
    pub wind_speed_m_s: Option<f64>,
}

impl WeatherSample {
    #[cfg(test)]
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ghi_w_m2: None,
            dni_w_m2: None,
            dhi_w_m2: None,
            cloud_cover_pct: None,
            temperature_c: None,
            wind_speed_m_s: None,
        }
    }
}

/// Hour-ascending samples for one location plus the time the provider produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherSeries {
    pub issued_at: DateTime<Utc>,
    pub samples: Vec<WeatherSample>,
}

// ─── Open-Meteo wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HourlyForecastResponse {
    pub hourly: Option<HourlyBlock>,
}

/// Column-oriented hourly block. Every series is aligned with `time`; values
/// may be null.
#[derive(Debug, Deserialize)]
pub struct HourlyBlock {
    #[serde(default)]
    pub time: Vec<String>,
    #[serde(default)]
    pub shortwave_radiation: Vec<Option<f64>>,
    #[serde(default)]
    pub direct_normal_irradiance: Vec<Option<f64>>,
    #[serde(default)]
    pub diffuse_radiation: Vec<Option<f64>>,
    #[serde(default)]
    pub temperature_2m: Vec<Option<f64>>,
    #[serde(default)]
    pub cloud_cover: Vec<Option<f64>>,
    #[serde(default)]
    pub wind_speed_10m: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub reason: String,
}
