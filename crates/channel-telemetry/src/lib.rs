//! # Channel Telemetry
//!
//! Logging setup shared by the node binary and tests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use channel_telemetry::{init_logging, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PCN_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` wins) |
//! | `PCN_JSON_LOGS` | `false` | One JSON object per line |
//! | `PCN_SERVICE_NAME` | `pcn-node` | Service name |
//! | `PCN_LOG_SOURCE` | `false` | Include file and line |

#![warn(missing_docs)]

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::init_logging;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// A global subscriber is already installed.
    #[error("Logging already initialized")]
    AlreadyInitialized,

    /// The level / filter directive did not parse.
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
}

/// Convenience macro for creating a span with subsystem context.
///
/// # Example
///
/// ```rust,ignore
/// let _span = subsystem_span!("propose_state", subsystem = "engine", version = 3);
/// ```
#[macro_export]
macro_rules! subsystem_span {
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!($name, $($field)*)
    };
}
