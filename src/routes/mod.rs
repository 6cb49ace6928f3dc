pub mod forecast_routes;

use axum::{response::Html, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_scalar::Scalar;

use crate::api_docs::ApiDoc;
use crate::shared_state::SharedState;

/// Full HTTP application: `/api/*`, the Scalar reference UI and request tracing.
pub fn app(shared: SharedState) -> Router {
    Router::new()
        .nest("/api", forecast_routes::api_routes(shared))
        .route("/scalar", get(|| async { Html(Scalar::new(ApiDoc::openapi()).to_html()) }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
