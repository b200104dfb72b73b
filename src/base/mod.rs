//! Base types and error handling.
//!
//! Provides foundational types shared by the rest of the crate:
//! - [`PoolError`]: the crate-wide error taxonomy
//! - [`context`]: extension traits for context-rich IO error conversion

pub mod context;
pub mod error;

pub use error::PoolError;
