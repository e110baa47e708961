pub mod config;
pub mod engine;
pub mod error;
pub mod listing;
pub mod matcher;
pub mod metadata;
pub mod recording;
pub mod reconcile;
pub mod segment;

pub use config::AppConfig;
pub use engine::{Engine, SessionSummary};
pub use error::Error;
