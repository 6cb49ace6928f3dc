use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{ArrayConfig, MAX_FORECAST_DAYS};
use crate::error::ForecastError;
use crate::models::forecast::{
    ArrayForecastView, EnergyDashboardForecast, ForecastWindow, HourlyForecastPoint, HourlyForecastResponse,
    RefreshSummary, RefreshTrigger, SystemTotals, TotalSystemForecast,
};
use crate::services::aggregator;
use crate::services::coordinator::UpdateCoordinator;

pub const DEFAULT_HOURLY_DAYS: u8 = 1;
pub const DEFAULT_TOTAL_HOURS: u32 = 24;
pub const MAX_TOTAL_HOURS: u32 = 168;

/// Result of the "update forecast" command.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The caller waited; summary of the cycle that was started or joined.
    Completed(Arc<RefreshSummary>),
    /// The cycle keeps running in the background.
    Started {
        cycle_id: Uuid,
        previous: Option<Arc<RefreshSummary>>,
    },
}

/// Read and command operations over the coordinator's cache.
#[derive(Clone)]
pub struct ForecastService {
    coordinator: Arc<UpdateCoordinator>,
    entry_id: String,
}

impl ForecastService {
    pub fn new(coordinator: Arc<UpdateCoordinator>, entry_id: impl Into<String>) -> Self {
        Self { coordinator, entry_id: entry_id.into() }
    }

    pub fn coordinator(&self) -> &Arc<UpdateCoordinator> {
        &self.coordinator
    }

    pub fn list_arrays(&self) -> Vec<ArrayConfig> {
        self.coordinator.arrays().as_ref().clone()
    }

    pub fn array_forecast(&self, name: &str) -> Result<ArrayForecastView, ForecastError> {
        self.array_forecast_at(name, Utc::now())
    }

    fn array_forecast_at(&self, name: &str, now: DateTime<Utc>) -> Result<ArrayForecastView, ForecastError> {
        let (arrays, snapshot) = self.coordinator.read_view();
        let config = arrays
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| ForecastError::ArrayNotFound(name.to_string()))?;
        let entry = snapshot
            .entries
            .get(name)
            .ok_or_else(|| ForecastError::NoDataYet(name.to_string()))?;
        Ok(aggregator::array_view(config, entry, now, self.coordinator.settings().tz))
    }

    pub fn system_forecast(&self) -> SystemTotals {
        let (arrays, snapshot) = self.coordinator.read_view();
        aggregator::aggregate(&arrays, &snapshot, Utc::now(), self.coordinator.settings().tz)
    }

    /// Hourly forecast over `days` days from the current hour, for one array or
    /// summed over all arrays with data. Always `days * 24` gap-free points.
    pub fn hourly_forecast(&self, array: Option<&str>, days: Option<u8>) -> Result<HourlyForecastResponse, ForecastError> {
        let days = days.unwrap_or(DEFAULT_HOURLY_DAYS);
        if !(1..=MAX_FORECAST_DAYS).contains(&days) {
            return Err(ForecastError::InvalidRequest(format!(
                "days must be between 1 and {MAX_FORECAST_DAYS}, got {days}"
            )));
        }

        let series = self.series_for(array)?;
        let start = aggregator::hour_start(Utc::now());
        Ok(HourlyForecastResponse {
            array: array.map(str::to_string),
            days,
            forecast: aggregator::hourly_window(&series, start, usize::from(days) * 24),
        })
    }

    pub fn energy_dashboard(&self, forecast_type: ForecastWindow) -> EnergyDashboardForecast {
        let series = self.combined_series();
        aggregator::energy_dashboard(&series, forecast_type, Utc::now(), self.coordinator.settings().tz)
    }

    pub fn total_forecast(&self, hours: Option<u32>) -> Result<TotalSystemForecast, ForecastError> {
        let hours = hours.unwrap_or(DEFAULT_TOTAL_HOURS);
        if !(1..=MAX_TOTAL_HOURS).contains(&hours) {
            return Err(ForecastError::InvalidRequest(format!(
                "hours must be between 1 and {MAX_TOTAL_HOURS}, got {hours}"
            )));
        }
        let (arrays, snapshot) = self.coordinator.read_view();
        let series = aggregator::combined_series(&arrays, &snapshot);
        Ok(aggregator::total_system_forecast(&arrays, &series, hours, Utc::now()))
    }

    /// "Update forecast" command. `entry_id`, when given, must name this entry.
    pub async fn update_forecast(&self, entry_id: Option<&str>, wait: bool) -> Result<UpdateOutcome, ForecastError> {
        if let Some(id) = entry_id {
            if id != self.entry_id {
                return Err(ForecastError::EntryNotFound(id.to_string()));
            }
        }

        if wait {
            let summary = self.coordinator.refresh_all(RefreshTrigger::Manual).await?;
            return Ok(UpdateOutcome::Completed(summary));
        }
        let previous = self.coordinator.last_summary();
        let handle = self.coordinator.begin_refresh(RefreshTrigger::Manual);
        Ok(UpdateOutcome::Started { cycle_id: handle.cycle_id, previous })
    }

    /// Replaces the array set and starts a refresh for it in the background.
    /// Unlike a config file, arrays with out-of-range values are rejected here.
    pub fn replace_arrays(&self, arrays: Vec<ArrayConfig>) -> Result<Uuid, ForecastError> {
        for array in &arrays {
            array.validate()?;
        }
        self.coordinator.reconfigure(arrays)?;
        Ok(self.coordinator.begin_refresh(RefreshTrigger::Reconfigure).cycle_id)
    }

    pub fn last_refresh(&self) -> Option<Arc<RefreshSummary>> {
        self.coordinator.last_summary()
    }

    fn combined_series(&self) -> Vec<HourlyForecastPoint> {
        let (arrays, snapshot) = self.coordinator.read_view();
        aggregator::combined_series(&arrays, &snapshot)
    }

    fn series_for(&self, array: Option<&str>) -> Result<Vec<HourlyForecastPoint>, ForecastError> {
        let Some(name) = array else {
            return Ok(self.combined_series());
        };
        let (arrays, snapshot) = self.coordinator.read_view();
        if !arrays.iter().any(|a| a.name == name) {
            return Err(ForecastError::ArrayNotFound(name.to_string()));
        }
        let entry = snapshot
            .entries
            .get(name)
            .ok_or_else(|| ForecastError::NoDataYet(name.to_string()))?;
        Ok(entry.result.points.iter().map(HourlyForecastPoint::from).collect())
    }
}
