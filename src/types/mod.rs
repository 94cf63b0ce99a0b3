//! Shared types for Postern

mod error;

pub use error::{PosternError, Result};
