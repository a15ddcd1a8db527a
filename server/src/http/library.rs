//! CRUD endpoints for books, wishlist and quotes. Every change is announced on the hub.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::{
    app::AppState,
    http::api::api_error,
    library::{self, BookInput, LibraryError, QuoteInput, Table, WishlistInput},
    websocket::{
        BOOK_CREATED, BOOK_DELETED, BOOK_UPDATED, QUOTE_CREATED, QUOTE_DELETED, WISHLIST_CREATED,
        WISHLIST_DELETED, WISHLIST_UPDATED,
    },
};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/books", get(list_books).post(create_book))
        .route("/books/{id}", put(update_book).delete(delete_book))
        .route("/wishlist", get(list_wishlist).post(create_wishlist))
        .route("/wishlist/{id}", put(update_wishlist).delete(delete_wishlist))
        .route("/quotes", get(list_quotes).post(create_quote))
        .route("/quotes/{id}", delete(delete_quote))
}

fn failure(e: &LibraryError) -> Response {
    match *e {
        LibraryError::Missing(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        LibraryError::Database(ref db) => {
            error!("Library query failed: {db}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        }
    }
}

fn bad_json(rejection: &JsonRejection) -> Response {
    api_error(StatusCode::BAD_REQUEST, rejection.body_text())
}

fn not_found(what: &str) -> Response {
    api_error(StatusCode::NOT_FOUND, format!("{what} not found"))
}

/// Lists as JSON, or maps the failure.
fn listed<T: Serialize>(result: Result<Vec<T>, LibraryError>) -> Response {
    match result {
        Ok(items) => Json(items).into_response(),
        Err(e) => failure(&e),
    }
}

/// Publishes `event` with the stored entity and answers with `status`.
fn announced<T: Serialize>(
    state: &AppState,
    event: &str,
    status: StatusCode,
    result: Result<T, LibraryError>,
) -> Response {
    match result {
        Ok(item) => {
            state.hub.publish(event, &item);
            (status, Json(item)).into_response()
        }
        Err(e) => failure(&e),
    }
}

async fn removed(state: &AppState, table: Table, event: &str, what: &str, id: i64) -> Response {
    match library::delete(&state.db, table, id).await {
        Ok(true) => {
            info!(id, "{what} deleted");
            state.hub.publish(event, json!({ "id": id }));
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => not_found(what),
        Err(e) => failure(&e),
    }
}

async fn list_books(State(state): State<AppState>) -> Response {
    listed(library::list_books(&state.db).await)
}

async fn create_book(
    State(state): State<AppState>,
    payload: Result<Json<BookInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return bad_json(&rejection),
    };
    let created = library::insert_book(&state.db, &input).await;
    announced(&state, BOOK_CREATED, StatusCode::CREATED, created)
}

async fn update_book(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<BookInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return bad_json(&rejection),
    };
    match library::update_book(&state.db, id, &input).await {
        Ok(Some(book)) => announced(&state, BOOK_UPDATED, StatusCode::OK, Ok(book)),
        Ok(None) => not_found("book"),
        Err(e) => failure(&e),
    }
}

async fn delete_book(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    removed(&state, Table::Books, BOOK_DELETED, "book", id).await
}

async fn list_wishlist(State(state): State<AppState>) -> Response {
    listed(library::list_wishlist(&state.db).await)
}

async fn create_wishlist(
    State(state): State<AppState>,
    payload: Result<Json<WishlistInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return bad_json(&rejection),
    };
    let created = library::insert_wishlist(&state.db, &input).await;
    announced(&state, WISHLIST_CREATED, StatusCode::CREATED, created)
}

async fn update_wishlist(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<WishlistInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return bad_json(&rejection),
    };
    match library::update_wishlist(&state.db, id, &input).await {
        Ok(Some(item)) => announced(&state, WISHLIST_UPDATED, StatusCode::OK, Ok(item)),
        Ok(None) => not_found("wishlist entry"),
        Err(e) => failure(&e),
    }
}

async fn delete_wishlist(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    removed(&state, Table::Wishlist, WISHLIST_DELETED, "wishlist entry", id).await
}

async fn list_quotes(State(state): State<AppState>) -> Response {
    listed(library::list_quotes(&state.db).await)
}

async fn create_quote(
    State(state): State<AppState>,
    payload: Result<Json<QuoteInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return bad_json(&rejection),
    };
    let created = library::insert_quote(&state.db, &input).await;
    announced(&state, QUOTE_CREATED, StatusCode::CREATED, created)
}

async fn delete_quote(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    removed(&state, Table::Quotes, QUOTE_DELETED, "quote", id).await
}
