use utoipa::OpenApi;
use crate::controllers::forecast_controller;
use crate::models::forecast;
use crate::config;
use crate::error;

#[derive(OpenApi)]
#[openapi(
    paths(
        forecast_controller::list_arrays,
        forecast_controller::replace_arrays,
        forecast_controller::get_array_forecast,
        forecast_controller::get_system_forecast,
        forecast_controller::get_system_config,
        forecast_controller::get_hourly_forecast,
        forecast_controller::get_energy_dashboard,
        forecast_controller::get_total_forecast,
        forecast_controller::update_forecast,
        forecast_controller::get_last_refresh
    ),
    components(
        schemas(
            config::ArrayConfig,
            config::Coordinates,
            config::LocationConfig,
            forecast::ArrayForecastView,
            forecast::ForecastSensors,
            forecast::HourlyForecastPoint,
            forecast::SystemTotals,
            forecast::ArrayContribution,
            forecast::FailureRecord,
            forecast::HourlyForecastResponse,
            forecast::EnergyDashboardForecast,
            forecast::EnergyInterval,
            forecast::ForecastWindow,
            forecast::TotalSystemForecast,
            forecast::SystemInfo,
            forecast::ReconfigureResponse,
            forecast::RefreshSummary,
            forecast::ArrayRefreshReport,
            forecast::ArrayRefreshOutcome,
            forecast::RefreshTrigger,
            error::ErrorKind,
            error::ErrorBody
        )
    ),
    tags(
        (name = "solar-forecast", description = "Multi-array solar production forecast API")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/arrays",
            "/api/arrays/{name}/forecast",
            "/api/system/forecast",
            "/api/forecast/hourly",
            "/api/forecast/update",
            "/api/refresh/last",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
