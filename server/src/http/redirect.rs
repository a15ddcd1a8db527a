//! Plain-HTTP listener that sends every request to the TLS origin.

use alloc::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header::LOCATION},
    response::{IntoResponse, Response},
};
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone)]
struct RedirectTarget {
    authority: Arc<str>,
}

/// Router answering every request with a 301 to `https://hostname[:port]` plus the
/// original path and query. Port 443 is left out of the URL.
pub fn https_redirect_router(hostname: &str, port: u16) -> Router {
    let authority = if port == 443 {
        hostname.to_owned()
    } else {
        format!("{hostname}:{port}")
    };
    Router::new()
        .fallback(redirect)
        .with_state(RedirectTarget {
            authority: authority.into(),
        })
        .layer(TraceLayer::new_for_http())
}

async fn redirect(State(target): State<RedirectTarget>, req: Request) -> Response {
    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let location = format!("https://{}{path}", target.authority);
    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::MOVED_PERMANENTLY, [(LOCATION, value)]).into_response(),
        Err(e) => {
            tracing::warn!("Cannot build redirect for {location:?}: {e}");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}
