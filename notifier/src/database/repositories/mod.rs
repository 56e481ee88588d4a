//! Repository layer.
//!
//! Traits abstract the stores; each has a SQLx implementation and an
//! in-memory one.

pub mod memory;
pub mod notification;
pub mod preferences;

pub use memory::*;
pub use notification::*;
pub use preferences::*;
