use std::io;
use std::path::PathBuf;

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
    Http(#[from] reqwest::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Config(String),
    #[error("invalid district name: {0:?}")]
    InvalidDistrict(String),
    #[error("invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("coordinate snapshot {} is corrupt: {reason}", path.display())]
    CorruptStore { path: PathBuf, reason: String },
    #[error("failed to persist coordinate snapshot {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AppError {
    pub fn is_corrupt_store(&self) -> bool {
        matches!(self, AppError::CorruptStore { .. })
    }
}
