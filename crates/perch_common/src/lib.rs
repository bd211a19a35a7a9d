//! Shared foundation for the perch replication manager: identifiers,
//! error tree, daemon configuration, and the interruptible signal state.

pub mod config;
pub mod error;
pub mod signal;
pub mod types;

pub use error::{PerchError, PerchResult};
