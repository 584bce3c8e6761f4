//! Conveyor Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities used by every Conveyor workspace member.
//!
//! # Overview
//!
//! - **Error Handling**: the [`CommonError`] type and its [`Result`] alias
//! - **Logging**: `tracing` subscriber bootstrap driven by `LOG_*` variables
//! - **Censoring**: recursive redaction of secrets inside JSON option maps
//!
//! # Example
//!
//! ```no_run
//! use conveyor_common::censor::censor_keys;
//! use serde_json::json;
//!
//! let options = json!({ "db": { "user": "etl", "password": "hunter2" } });
//! let safe = censor_keys(&options, &["password"]);
//! assert_eq!(safe["db"]["password"], "***censored***");
//! ```

pub mod censor;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
