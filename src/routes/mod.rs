mod health;
mod index;
mod metrics;
mod upload;

use crate::{pages::RenderError, server::SharedState};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/upload", post(upload::upload_image))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}

impl IntoResponse for RenderError {
    fn into_response(self) -> Response {
        tracing::error!("{}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Something went wrong rendering the page",
        )
            .into_response()
    }
}
