//! Core trait abstractions.
//!
//! These traits define the seams applications plug into: the generation
//! service, durable storage, cancellation and the page-fetch layer.

pub mod backend;
pub mod source;
pub mod store;
