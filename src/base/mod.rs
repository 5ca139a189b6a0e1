//! This module contains base types that are used across Turnstile.

mod error;

pub use error::*;
