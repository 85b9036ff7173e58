use crate::otlp::EmitError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpancheckError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Emitter error: {0}")]
    Emit(#[from] EmitError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures talking to either downstream store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Query failed ({status}): {body}")]
    Query { status: u16, body: String },
}
