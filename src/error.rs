use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Couldn't find directory: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("no sample in channel '{channel}' exceeds threshold {threshold}")]
    EmptyTrigger { channel: String, threshold: f64 },

    #[error("only {count} trigger sample(s) found, need at least 2 for gap detection")]
    InsufficientTriggerData { count: usize },

    #[error("channel '{0}' not present in recording")]
    MissingChannel(String),

    #[error("invalid sampling rate: {0} Hz")]
    InvalidSamplingRate(f64),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
