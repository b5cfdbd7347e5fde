//! # Node Runtime Library
//!
//! This library exposes the configuration and wiring of the node runtime for
//! testing. The main entry point is the `main.rs` binary.

#![warn(missing_docs)]

pub mod container;

pub use container::{ConfigError, NodeConfig, NodeService, ServiceContainer};
