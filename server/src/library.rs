//! Storage for the reading log itself: books, the wishlist and saved quotes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::db::DbPool;

#[derive(Debug, ThisError)]
pub enum LibraryError {
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("library store failed: {0}")]
    Database(#[from] sqlx::Error),
}

fn require(field: &'static str, value: &str) -> Result<(), LibraryError> {
    if value.trim().is_empty() {
        return Err(LibraryError::Missing(field));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub genre: String,
    pub pages: i64,
    pub format: String,
    pub publisher: String,
    pub status: String,
    pub rating: i64,
    pub review: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Writable fields of a [`Book`]. Omitted fields take their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BookInput {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub genre: String,
    pub pages: i64,
    pub format: String,
    pub publisher: String,
    pub status: Option<String>,
    pub rating: i64,
    pub review: String,
}

impl BookInput {
    fn validate(&self) -> Result<(), LibraryError> {
        require("title", &self.title)?;
        require("author", &self.author)
    }

    fn status(&self) -> &str {
        self.status
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("unread")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WishlistItem {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub genre: String,
    pub pages: i64,
    pub publisher: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WishlistInput {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub genre: String,
    pub pages: i64,
    pub publisher: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Quote {
    pub id: i64,
    pub quote: String,
    pub book: String,
    pub page: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuoteInput {
    pub quote: String,
    pub book: String,
    pub page: i64,
}

/// All books, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn list_books(pool: &DbPool) -> Result<Vec<Book>, LibraryError> {
    Ok(sqlx::query_as("SELECT * FROM books ORDER BY created_at DESC, id DESC")
        .fetch_all(pool)
        .await?)
}

/// # Errors
///
/// Returns [`LibraryError::Missing`] without title or author, or a database error.
pub async fn insert_book(pool: &DbPool, input: &BookInput) -> Result<Book, LibraryError> {
    input.validate()?;
    let now = Utc::now();
    Ok(sqlx::query_as(
        "INSERT INTO books (title, author, isbn, genre, pages, format, publisher, status, \
         rating, review, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(input.title.trim())
    .bind(input.author.trim())
    .bind(input.isbn.trim())
    .bind(&input.genre)
    .bind(input.pages)
    .bind(&input.format)
    .bind(&input.publisher)
    .bind(input.status())
    .bind(input.rating)
    .bind(&input.review)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?)
}

/// Replaces every writable field. `None` when no book has `id`.
///
/// # Errors
///
/// Returns [`LibraryError::Missing`] without title or author, or a database error.
pub async fn update_book(
    pool: &DbPool,
    id: i64,
    input: &BookInput,
) -> Result<Option<Book>, LibraryError> {
    input.validate()?;
    Ok(sqlx::query_as(
        "UPDATE books SET title = ?, author = ?, isbn = ?, genre = ?, pages = ?, format = ?, \
         publisher = ?, status = ?, rating = ?, review = ?, updated_at = ? \
         WHERE id = ? RETURNING *",
    )
    .bind(input.title.trim())
    .bind(input.author.trim())
    .bind(input.isbn.trim())
    .bind(&input.genre)
    .bind(input.pages)
    .bind(&input.format)
    .bind(&input.publisher)
    .bind(input.status())
    .bind(input.rating)
    .bind(&input.review)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

/// # Errors
///
/// Returns an error if the query fails.
pub async fn list_wishlist(pool: &DbPool) -> Result<Vec<WishlistItem>, LibraryError> {
    Ok(sqlx::query_as("SELECT * FROM wishlist ORDER BY created_at DESC, id DESC")
        .fetch_all(pool)
        .await?)
}

/// # Errors
///
/// Returns [`LibraryError::Missing`] without title or author, or a database error.
pub async fn insert_wishlist(
    pool: &DbPool,
    input: &WishlistInput,
) -> Result<WishlistItem, LibraryError> {
    require("title", &input.title)?;
    require("author", &input.author)?;
    let now = Utc::now();
    Ok(sqlx::query_as(
        "INSERT INTO wishlist (title, author, isbn, genre, pages, publisher, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(input.title.trim())
    .bind(input.author.trim())
    .bind(input.isbn.trim())
    .bind(&input.genre)
    .bind(input.pages)
    .bind(&input.publisher)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?)
}

/// # Errors
///
/// Returns [`LibraryError::Missing`] without title or author, or a database error.
pub async fn update_wishlist(
    pool: &DbPool,
    id: i64,
    input: &WishlistInput,
) -> Result<Option<WishlistItem>, LibraryError> {
    require("title", &input.title)?;
    require("author", &input.author)?;
    Ok(sqlx::query_as(
        "UPDATE wishlist SET title = ?, author = ?, isbn = ?, genre = ?, pages = ?, \
         publisher = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(input.title.trim())
    .bind(input.author.trim())
    .bind(input.isbn.trim())
    .bind(&input.genre)
    .bind(input.pages)
    .bind(&input.publisher)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

/// # Errors
///
/// Returns an error if the query fails.
pub async fn list_quotes(pool: &DbPool) -> Result<Vec<Quote>, LibraryError> {
    Ok(sqlx::query_as("SELECT * FROM quotes ORDER BY created_at DESC, id DESC")
        .fetch_all(pool)
        .await?)
}

/// # Errors
///
/// Returns [`LibraryError::Missing`] without quote text or book, or a database error.
pub async fn insert_quote(pool: &DbPool, input: &QuoteInput) -> Result<Quote, LibraryError> {
    require("quote", &input.quote)?;
    require("book", &input.book)?;
    let now = Utc::now();
    Ok(sqlx::query_as(
        "INSERT INTO quotes (quote, book, page, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(input.quote.trim())
    .bind(input.book.trim())
    .bind(input.page)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?)
}

/// Tables rows can be deleted from by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Books,
    Wishlist,
    Quotes,
}

impl Table {
    const fn delete_sql(self) -> &'static str {
        match self {
            Self::Books => "DELETE FROM books WHERE id = ?",
            Self::Wishlist => "DELETE FROM wishlist WHERE id = ?",
            Self::Quotes => "DELETE FROM quotes WHERE id = ?",
        }
    }
}

/// Deletes one row. Returns whether it existed.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn delete(pool: &DbPool, table: Table, id: i64) -> Result<bool, LibraryError> {
    let result = sqlx::query(table.delete_sql())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
