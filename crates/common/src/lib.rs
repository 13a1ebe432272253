//! Shared types for the native auth workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
