//! Minimal HTTP wiring: health plus a sample protected route that exercises
//! the validation middleware. The broader routing surface lives with the
//! consuming service; this crate only ships the middleware and handlers that
//! belong to the credential core.

pub mod handlers;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware as axum_middleware,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

use crate::auth::AuthService;
use crate::federation::FederationService;
use crate::middleware::{authenticate, AuthLayer};
use crate::otp::OtpService;
use crate::twofa::TwoFactorService;

/// Fully wired broker services, shared with request handlers. The routing
/// surface built on top of this lives with the consuming service; only the
/// credential-core routes are mounted here.
#[derive(Clone)]
pub struct AppState {
    pub layer: Arc<AuthLayer>,
    pub auth: Arc<AuthService>,
    pub federation: Arc<FederationService>,
    pub otp: Arc<OtpService>,
    pub twofa: Arc<TwoFactorService>,
}

/// Build the router: `/health` is open, `/v1/me` sits behind the validation
/// middleware.
#[must_use]
pub fn router(state: &AppState) -> Router {
    let protected = Router::new()
        .route("/v1/me", get(handlers::me::me))
        .route_layer(axum_middleware::from_fn_with_state(
            state.layer.clone(),
            authenticate,
        ));

    Router::new()
        .route("/health", get(handlers::health::health))
        .merge(protected)
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, state: &AppState) -> Result<()> {
    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span)),
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
