pub mod config;
pub mod db;
pub mod downsample;
pub mod energy;
pub mod error;
pub mod ingest;
pub mod models;
pub mod presence;
pub mod retention;
pub mod rollup;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use error::{AppError, Result};
pub use ingest::Ingestor;
