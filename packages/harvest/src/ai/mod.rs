//! Generation backends.
//!
//! This module provides reference implementations of the
//! [`GenerationBackend`](crate::traits::backend::GenerationBackend) trait.
//! Users can use these directly or implement their own.

#[cfg(feature = "gemini")]
mod gemini;

#[cfg(feature = "gemini")]
pub use gemini::{GeminiBackend, DEFAULT_MODEL};
