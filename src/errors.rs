use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Spreadsheet(#[from] calamine::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("invalid input: {0}")]
    Input(String),
    #[error("geocoding lookup failed: {0}")]
    Lookup(String),
    #[error("outcome merge failed: {0}")]
    Merge(String),
    #[error("geocoding worker aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}
