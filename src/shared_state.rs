use std::sync::Arc;

use axum::extract::FromRef;

use crate::config::Config;
use crate::services::forecast_service::ForecastService;

#[derive(Clone)]
pub struct AppState {
    pub forecasts: ForecastService,
}

impl AppState {
    pub fn new(forecasts: ForecastService) -> Self {
        Self { forecasts }
    }
}

/// Router state. Handlers extract `State<AppState>` and/or `State<Arc<Config>>`
/// through `FromRef`, so one `.with_state(shared)` serves both.
#[derive(Clone)]
pub struct SharedState {
    pub app: AppState,
    pub config: Arc<Config>,
}

impl FromRef<SharedState> for AppState {
    fn from_ref(shared: &SharedState) -> Self {
        shared.app.clone()
    }
}

impl FromRef<SharedState> for Arc<Config> {
    fn from_ref(shared: &SharedState) -> Self {
        Arc::clone(&shared.config)
    }
}
