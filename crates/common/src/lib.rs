//! Shared types for the code rotation services
//!
//! Configuration errors and the `Secret` wrapper used for the admin token.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
