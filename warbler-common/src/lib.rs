//! Common utilities for the warbler speech-decoder toolkit

pub mod error;

pub use error::{Error, Result};
