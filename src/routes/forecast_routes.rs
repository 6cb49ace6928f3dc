use axum::{
    routing::{get, post},
    Router,
};

use crate::controllers::forecast_controller::{
    // Arrays & system
    get_array_forecast, get_system_config, get_system_forecast, list_arrays, replace_arrays,
    // Forecast queries
    get_energy_dashboard, get_hourly_forecast, get_total_forecast,
    // Commands
    get_last_refresh, update_forecast,
};
use crate::shared_state::SharedState;

/// Build the `/api/*` sub-router.
pub fn api_routes(shared: SharedState) -> Router {
    Router::new()
        .route("/arrays",                    get(list_arrays).put(replace_arrays))
        .route("/arrays/{name}/forecast",    get(get_array_forecast))
        .route("/system/forecast",           get(get_system_forecast))
        .route("/system/config",             get(get_system_config))
        .route("/forecast/hourly",           get(get_hourly_forecast))
        .route("/forecast/energy-dashboard", get(get_energy_dashboard))
        .route("/forecast/total",            get(get_total_forecast))
        .route("/forecast/update",           post(update_forecast))
        .route("/refresh/last",              get(get_last_refresh))
        .with_state(shared)
}
