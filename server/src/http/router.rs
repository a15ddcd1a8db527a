use core::time::Duration;

use axum::{
    Router,
    http::{
        HeaderValue, Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, COOKIE},
    },
    middleware as ax_middleware,
    routing::any,
};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt as _,
    cors::{AllowOrigin, CorsLayer},
    request_id::MakeRequestUuid,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

use crate::{
    app::AppState,
    auth,
    http::{
        api, library,
        middleware::{not_found, secure_headers_middleware},
    },
    websocket,
};

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// CORS for the listed origins only, with credentials. `None` when the list is empty.
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|e| warn!(origin, "Ignoring invalid CORS origin: {e}"))
                .ok()
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
            .allow_credentials(true),
    )
}

/// Builds the application with its state applied, ready to be served by the
/// orchestrator in either plain or TLS mode.
pub fn create_app(app_state: AppState, cors_origins: &[String]) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .sensitive_headers([AUTHORIZATION, COOKIE])
        .set_x_request_id(MakeRequestUuid)
        .propagate_x_request_id()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(ax_middleware::from_fn(secure_headers_middleware));

    let require_login =
        || ax_middleware::from_fn_with_state(app_state.auth.clone(), auth::require);

    let protected_api = Router::new()
        .merge(api::routes())
        .merge(library::routes())
        .route_layer(require_login());
    let api = Router::new()
        .merge(api::public_routes())
        .merge(auth::routes())
        .merge(protected_api);

    let router = Router::new()
        .nest("/api", api)
        .route("/ws", any(websocket::ws_handler).route_layer(require_login()))
        .with_state(app_state)
        .fallback(not_found);
    let router = match cors_layer(cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };
    router.layer(middleware_stack)
}
