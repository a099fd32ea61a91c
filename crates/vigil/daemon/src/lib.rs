//! Vigil daemon library
//!
//! This module provides the process host around the monitoring core:
//! - REST API handlers
//! - HTTP adapters for the external collaborators
//! - Polling loop and patrol supervision
//! - Server lifecycle management

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, ApiResult, DaemonError, DaemonResult};
pub use scheduler::{PollSummary, Poller};
pub use server::Server;
