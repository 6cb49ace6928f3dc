use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::config::{ArrayConfig, Config};
use crate::error::{ErrorBody, ForecastError};
use crate::models::forecast::{
    ArrayForecastView, EnergyDashboardForecast, ForecastWindow, HourlyForecastResponse, ReconfigureResponse,
    RefreshSummary, SystemInfo, SystemTotals, TotalSystemForecast,
};
use crate::services::forecast_service::UpdateOutcome;
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HourlyQuery {
    /// Array name; omit for the sum over all arrays
    pub array: Option<String>,
    /// Number of days, 1 to 7 (default 1)
    pub days: Option<u8>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EnergyDashboardQuery {
    /// `today` (default), `tomorrow` or `remaining_today`
    pub forecast_type: Option<ForecastWindow>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TotalForecastQuery {
    /// Number of hours from the current hour, 1 to 168 (default 24)
    pub hours: Option<u32>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UpdateQuery {
    /// Configuration entry to refresh; must match this service's entry when given
    pub entry_id: Option<String>,
    /// Wait for the cycle to finish (default true)
    pub wait: Option<bool>,
}

/// GET /api/arrays
/// List all configured arrays
#[utoipa::path(
    get,
    path = "/api/arrays",
    responses(
        (status = 200, description = "Configured arrays", body = Vec<ArrayConfig>)
    )
)]
pub async fn list_arrays(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.forecasts.list_arrays())
}

/// PUT /api/arrays
/// Replace the configured arrays
///
/// Forecasts of removed or changed arrays are discarded and a refresh of the
/// new set starts in the background. Returns the id of that refresh cycle.
#[utoipa::path(
    put,
    path = "/api/arrays",
    request_body = Vec<ArrayConfig>,
    responses(
        (status = 202, description = "Arrays replaced, refresh started", body = ReconfigureResponse),
        (status = 400, description = "Invalid array configuration", body = ErrorBody)
    )
)]
pub async fn replace_arrays(
    State(state): State<AppState>,
    Json(arrays): Json<Vec<ArrayConfig>>,
) -> Result<impl IntoResponse, ForecastError> {
    let cycle_id = state.forecasts.replace_arrays(arrays)?;
    Ok((StatusCode::ACCEPTED, Json(ReconfigureResponse { cycle_id })))
}

/// GET /api/arrays/{name}/forecast
/// Current forecast sensors of one array
///
/// Served from the last successful refresh. `stale` is set when the latest
/// refresh of the array failed; `last_success_at` tells how old the data is.
#[utoipa::path(
    get,
    path = "/api/arrays/{name}/forecast",
    params(
        ("name" = String, Path, description = "Array name")
    ),
    responses(
        (status = 200, description = "Array forecast", body = ArrayForecastView),
        (status = 404, description = "Array not configured", body = ErrorBody),
        (status = 503, description = "Array has not been refreshed successfully yet", body = ErrorBody)
    )
)]
pub async fn get_array_forecast(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ArrayForecastView>, ForecastError> {
    state.forecasts.array_forecast(&name).map(Json)
}

/// GET /api/system/forecast
/// System totals and per-array breakdown
#[utoipa::path(
    get,
    path = "/api/system/forecast",
    responses(
        (status = 200, description = "System totals", body = SystemTotals)
    )
)]
pub async fn get_system_forecast(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.forecasts.system_forecast())
}

/// GET /api/system/config
/// Location, refresh interval and horizon of this entry
#[utoipa::path(
    get,
    path = "/api/system/config",
    responses(
        (status = 200, description = "System configuration", body = SystemInfo)
    )
)]
pub async fn get_system_config(
    State(state): State<AppState>,
    State(config): State<Arc<Config>>,
) -> impl IntoResponse {
    let coordinator = state.forecasts.coordinator();
    Json(SystemInfo {
        entry_id: config.entry_id.clone(),
        location: config.location.clone(),
        update_interval_s: config.update_interval_s,
        forecast_days: coordinator.settings().horizon_days,
        arrays_configured: coordinator.arrays().len(),
        refreshing: coordinator.is_refreshing(),
    })
}

/// GET /api/forecast/hourly
/// Hourly forecast for one array or for the whole system
///
/// Returns exactly `days * 24` consecutive hours starting at the current hour.
/// Hours without data are reported as zero.
#[utoipa::path(
    get,
    path = "/api/forecast/hourly",
    params(HourlyQuery),
    responses(
        (status = 200, description = "Hourly forecast", body = HourlyForecastResponse),
        (status = 400, description = "Invalid days", body = ErrorBody),
        (status = 404, description = "Array not configured", body = ErrorBody),
        (status = 503, description = "Array has not been refreshed successfully yet", body = ErrorBody)
    )
)]
pub async fn get_hourly_forecast(
    Query(query): Query<HourlyQuery>,
    State(state): State<AppState>,
) -> Result<Json<HourlyForecastResponse>, ForecastError> {
    state.forecasts.hourly_forecast(query.array.as_deref(), query.days).map(Json)
}

/// GET /api/forecast/energy-dashboard
/// Energy per hour interval for today, tomorrow or the rest of today
#[utoipa::path(
    get,
    path = "/api/forecast/energy-dashboard",
    params(EnergyDashboardQuery),
    responses(
        (status = 200, description = "Energy dashboard forecast", body = EnergyDashboardForecast)
    )
)]
pub async fn get_energy_dashboard(
    Query(query): Query<EnergyDashboardQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let window = query.forecast_type.unwrap_or(ForecastWindow::Today);
    Json(state.forecasts.energy_dashboard(window))
}

/// GET /api/forecast/total
/// Combined hourly system forecast
#[utoipa::path(
    get,
    path = "/api/forecast/total",
    params(TotalForecastQuery),
    responses(
        (status = 200, description = "Total system forecast", body = TotalSystemForecast),
        (status = 400, description = "Invalid hours", body = ErrorBody)
    )
)]
pub async fn get_total_forecast(
    Query(query): Query<TotalForecastQuery>,
    State(state): State<AppState>,
) -> Result<Json<TotalSystemForecast>, ForecastError> {
    state.forecasts.total_forecast(query.hours).map(Json)
}

/// POST /api/forecast/update
/// Refresh all arrays now
///
/// With `wait=true` the response carries the summary of the cycle, including
/// per-array failures. With `wait=false` the cycle runs in the background and
/// the previous summary (or null) is returned with 202.
#[utoipa::path(
    post,
    path = "/api/forecast/update",
    params(UpdateQuery),
    responses(
        (status = 200, description = "Refresh cycle finished", body = RefreshSummary),
        (status = 202, description = "Refresh started; previous summary, null before the first cycle", body = RefreshSummary),
        (status = 404, description = "Unknown configuration entry", body = ErrorBody)
    )
)]
pub async fn update_forecast(
    Query(query): Query<UpdateQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ForecastError> {
    let wait = query.wait.unwrap_or(true);
    let response = match state.forecasts.update_forecast(query.entry_id.as_deref(), wait).await? {
        UpdateOutcome::Completed(summary) => (StatusCode::OK, Json(Some(summary))),
        UpdateOutcome::Started { previous, .. } => (StatusCode::ACCEPTED, Json(previous)),
    };
    Ok(response)
}

/// GET /api/refresh/last
/// Summary of the last completed refresh cycle
#[utoipa::path(
    get,
    path = "/api/refresh/last",
    responses(
        (status = 200, description = "Last refresh summary", body = RefreshSummary),
        (status = 404, description = "No refresh has completed yet", body = ErrorBody)
    )
)]
pub async fn get_last_refresh(State(state): State<AppState>) -> Result<Json<Arc<RefreshSummary>>, ForecastError> {
    state.forecasts.last_refresh().map(Json).ok_or(ForecastError::NoRefreshYet)
}
