//! Common types, admin wire definitions, and errors shared across `harbor` crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
