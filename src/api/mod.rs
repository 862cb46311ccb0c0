//! REST surface over the per-tenant engines.

pub mod dto;
pub mod error;
pub mod handlers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;

use crate::observability::{HTTP_REJECTED_TOTAL, HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};
use crate::tenant::TenantManager;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantManager>,
    pub request_timeout: Duration,
    /// In-flight request permits; exhausted means 503.
    pub limiter: Arc<Semaphore>,
}

impl AppState {
    pub fn new(tenants: Arc<TenantManager>, request_timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            tenants,
            request_timeout,
            limiter: Arc::new(Semaphore::new(max_in_flight)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/tenants/{tenant}/providers",
            post(handlers::create_provider).get(handlers::list_providers),
        )
        .route(
            "/tenants/{tenant}/providers/{id}",
            get(handlers::get_provider)
                .patch(handlers::update_provider)
                .delete(handlers::remove_provider),
        )
        .route("/tenants/{tenant}/providers/{id}/schedule", get(handlers::provider_schedule))
        .route("/tenants/{tenant}/providers/{id}/windows", post(handlers::add_window))
        .route("/tenants/{tenant}/providers/{id}/breaks", post(handlers::add_break))
        .route("/tenants/{tenant}/providers/{id}/slots", get(handlers::provider_slots))
        .route("/tenants/{tenant}/providers/{id}/slots/check", get(handlers::check_slot))
        .route("/tenants/{tenant}/providers/{id}/free", get(handlers::free_spans))
        .route(
            "/tenants/{tenant}/windows/{id}",
            patch(handlers::toggle_window).delete(handlers::remove_window),
        )
        .route(
            "/tenants/{tenant}/breaks/{id}",
            patch(handlers::toggle_break).delete(handlers::remove_break),
        )
        .route("/tenants/{tenant}/slots", get(handlers::chapter_slots))
        .route(
            "/tenants/{tenant}/bookings",
            post(handlers::create_booking).get(handlers::list_bookings),
        )
        .route("/tenants/{tenant}/bookings/{id}", get(handlers::get_booking))
        .route("/tenants/{tenant}/bookings/{id}/status", patch(handlers::update_booking_status))
        .route("/tenants/{tenant}/bookings/{id}/reschedule", post(handlers::reschedule_booking))
        .route("/tenants/{tenant}/events", get(handlers::events))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load shedding plus RED metrics for every request.
async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Ok(_permit) = state.limiter.clone().try_acquire_owned() else {
        tracing::warn!("in-flight limit reached, rejecting {} {}", req.method(), req.uri().path());
        metrics::counter!(HTTP_REJECTED_TOTAL).increment(1);
        return ApiError::overloaded().into_response();
    };

    let method = req.method().as_str().to_owned();
    let started = Instant::now();
    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "status" => status).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method)
        .record(started.elapsed().as_secs_f64());
    response
}
