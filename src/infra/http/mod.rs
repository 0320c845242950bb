mod certificates;
pub mod error;
pub mod middleware;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use axum::http::StatusCode;

use crate::application::certificates::CertificateService;

use self::middleware::{log_responses, require_principal, set_request_context};

pub use self::middleware::USER_ID_HEADER;

#[derive(Clone)]
pub struct HttpState {
    pub certificates: Arc<CertificateService>,
}

pub fn build_router(state: HttpState) -> Router {
    let api = Router::new()
        .route(
            "/api/certificate/generate",
            post(certificates::generate_certificate),
        )
        .route(
            "/api/certificate/user/{user_id}",
            get(certificates::list_certificates),
        )
        .route(
            "/api/certificate/download/{certificate_number}",
            get(certificates::download_certificate),
        )
        .route_layer(axum_middleware::from_fn(require_principal));

    Router::new()
        .route("/healthz", get(health))
        .merge(api)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
