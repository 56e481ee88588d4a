//! notifier library crate.
//!
//! Multi-channel notification delivery engine. Exposed as a library for
//! embedding and integration testing; `main.rs` runs it as a service.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;

pub use error::{Error, Result};
