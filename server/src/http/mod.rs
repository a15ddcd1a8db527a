//! HTTP surface of the server: JSON API, `/ws` and the middleware stack around them.
//!
//! Everything under `/api` except version, login and logout requires a session
//! (see [`crate::auth`]), and so does `/ws`.

pub mod api;
pub mod library;
pub mod middleware;
mod redirect;
pub mod router;

pub use redirect::https_redirect_router;
pub use router::create_app;
