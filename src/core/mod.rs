//! Constants and error types shared by every layer.

pub mod constants;
mod error;

pub use constants::*;
pub use error::{ConfigError, RelayError};
