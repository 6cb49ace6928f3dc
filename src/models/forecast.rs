use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{ArrayConfig, LocationConfig};
use crate::error::ErrorKind;

// ─── Estimator output ────────────────────────────────────────────────────────

/// One hour of an array's forecast, covering `[timestamp, timestamp + 1h)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ArrayForecastPoint {
    pub timestamp: DateTime<Utc>,
    /// Mean power over the hour (kW), within `[0, kWp]`
    pub power_kw: f64,
    /// `power_kw` integrated over one hour (kWh)
    pub energy_kwh: f64,
    /// Plane-of-array irradiance (W/m²)
    pub poa_irradiance_w_m2: f64,
    pub cell_temp_c: f64,
    pub cloud_cover_pct: Option<f64>,
}

impl ArrayForecastPoint {
    pub fn new(timestamp: DateTime<Utc>, power_kw: f64) -> Self {
        Self {
            timestamp,
            power_kw,
            energy_kwh: power_kw,
            poa_irradiance_w_m2: 0.0,
            cell_temp_c: 0.0,
            cloud_cover_pct: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ArrayForecastResult {
    pub array_name: String,
    /// Hour-ascending, gap-free
    pub points: Vec<ArrayForecastPoint>,
    pub computed_at: DateTime<Utc>,
    /// Issue time of the weather data the forecast was computed from
    pub source_weather_timestamp: DateTime<Utc>,
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Last good forecast of one array. Exists only once the array refreshed
/// successfully at least once; failures never remove or overwrite `result`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub result: Arc<ArrayForecastResult>,
    pub last_success_at: DateTime<Utc>,
    pub last_error: Option<FailureRecord>,
}

impl CacheEntry {
    /// True when the latest refresh attempt failed after the stored result was computed.
    pub fn is_stale(&self) -> bool {
        self.last_error
            .as_ref()
            .is_some_and(|e| e.at > self.last_success_at)
    }
}

// ─── Read surface ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HourlyForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub power_kw: f64,
    pub energy_kwh: f64,
}

impl From<&ArrayForecastPoint> for HourlyForecastPoint {
    fn from(point: &ArrayForecastPoint) -> Self {
        Self {
            timestamp: point.timestamp,
            power_kw: point.power_kw,
            energy_kwh: point.energy_kwh,
        }
    }
}

/// Sensor values derived from one hourly series (a single array, or the
/// per-hour sum over all arrays with data).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ForecastSensors {
    pub current_power_kw: f64,
    pub today_energy_kwh: f64,
    pub tomorrow_energy_kwh: f64,
    pub peak_power_today_kw: f64,
    pub peak_power_tomorrow_kw: f64,
    pub peak_power_remaining_today_kw: f64,
    pub remaining_today_energy_kwh: f64,
    pub this_hour_energy_kwh: f64,
    pub next_hour_energy_kwh: f64,
    /// Next 24 hours starting at the current hour
    pub hourly_forecast: Vec<HourlyForecastPoint>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ArrayForecastView {
    pub array: ArrayConfig,
    pub sensors: ForecastSensors,
    pub last_success_at: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
    pub source_weather_timestamp: DateTime<Utc>,
    pub stale: bool,
    pub last_error: Option<FailureRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ArrayContribution {
    pub array_name: String,
    pub has_data: bool,
    pub stale: bool,
    pub current_power_kw: f64,
    pub today_energy_kwh: f64,
    pub tomorrow_energy_kwh: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<FailureRecord>,
}

/// Read-time view over the cache; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SystemTotals {
    pub sensors: ForecastSensors,
    pub arrays_configured: usize,
    pub arrays_with_data: usize,
    pub total_kwp: f64,
    pub contributions: Vec<ArrayContribution>,
    pub oldest_success_at: Option<DateTime<Utc>>,
    pub newest_success_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ForecastWindow {
    Today,
    Tomorrow,
    RemainingToday,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EnergyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub energy_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EnergyDashboardForecast {
    pub forecast: Vec<EnergyInterval>,
    pub total_energy_kwh: f64,
    pub forecast_type: ForecastWindow,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TotalSystemForecast {
    pub forecast: Vec<HourlyForecastPoint>,
    pub total_energy_kwh: f64,
    pub system_kwp: f64,
    pub arrays_count: usize,
    pub hours_requested: u32,
    pub data_points: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HourlyForecastResponse {
    /// `None` for the aggregate over all arrays
    pub array: Option<String>,
    pub days: u8,
    pub forecast: Vec<HourlyForecastPoint>,
}

/// Static facts about this configuration entry.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SystemInfo {
    pub entry_id: String,
    pub location: LocationConfig,
    pub update_interval_s: u64,
    pub forecast_days: u8,
    pub arrays_configured: usize,
    pub refreshing: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReconfigureResponse {
    /// Refresh cycle started for the new array set
    pub cycle_id: Uuid,
}

// ─── Refresh cycle reporting ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Startup,
    Scheduled,
    Manual,
    Reconfigure,
}

/// Result of refreshing one array within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArrayRefreshOutcome {
    Updated {
        computed_at: DateTime<Utc>,
        points: usize,
    },
    /// A newer forecast was already cached; nothing was written.
    Superseded {
        computed_at: DateTime<Utc>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        /// Previous successful forecast is still being served
        stale_data_retained: bool,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ArrayRefreshReport {
    pub array_name: String,
    #[serde(flatten)]
    pub outcome: ArrayRefreshOutcome,
    pub duration_ms: u64,
}

impl ArrayRefreshReport {
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            ArrayRefreshOutcome::Updated { .. } | ArrayRefreshOutcome::Superseded { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RefreshSummary {
    pub cycle_id: Uuid,
    pub trigger: RefreshTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One report per configured array, in configuration order
    pub reports: Vec<ArrayRefreshReport>,
}

impl RefreshSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, ArrayRefreshOutcome::Failed { .. }))
            .count()
    }

    /// Every array failed and none has data to fall back on. Whether that is a
    /// user-visible error is the caller's decision.
    pub fn total_failure(&self) -> bool {
        !self.reports.is_empty()
            && self.reports.iter().all(|r| {
                matches!(
                    r.outcome,
                    ArrayRefreshOutcome::Failed { stale_data_retained: false, .. }
                )
            })
    }

    pub fn report(&self, array_name: &str) -> Option<&ArrayRefreshReport> {
        self.reports.iter().find(|r| r.array_name == array_name)
    }
}
