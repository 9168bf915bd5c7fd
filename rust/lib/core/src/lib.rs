//! Shared building blocks of the record engine: the error taxonomy,
//! runtime configuration and small id/time/naming helpers.

pub mod config;
pub mod error;
pub mod types;

pub use config::RuntimeConfig;
pub use error::OrmError;
pub use types::{new_id, now_rfc3339, to_snake_case};
