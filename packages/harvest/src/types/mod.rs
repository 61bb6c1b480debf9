//! Data types shared across the pipelines.

pub mod config;
pub mod history;
pub mod page;
pub mod prediction;
pub mod record;
