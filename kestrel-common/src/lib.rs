//! # Kestrel Common Library
//!
//! Shared code for the Kestrel taxonomy search tools including:
//! - Query, taxonomy record and resolution outcome models
//! - Common error type
//! - TOML configuration loading and API key resolution
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod logging;
pub mod model;

pub use error::{Error, Result};
pub use model::{NameKind, Query, Rank, Ranks, ResolutionOutcome, SourceId, TaxonomyRecord};
