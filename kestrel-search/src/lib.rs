//! # Kestrel Search
//!
//! Resolves free-text species names to taxonomies by querying several
//! taxonomy sources, then falls back to a web search for the residue.
//!
//! # Architecture
//! - [`input`]: loads the cleaned name list and labels names common/scientific
//! - [`store`]: append-only CSV stores and the resume snapshot
//! - [`sources`]: one adapter per taxonomy source behind [`sources::SourceAdapter`]
//! - [`resolver`]: ordered fill-only merge across adapters for one query
//! - [`workflow`]: concurrent worker pool feeding a single store writer
//! - [`escalation`]: web-search fallback over the missed store
//! - [`pipeline`]: wires the stages together for one run

pub mod classifier;
pub mod escalation;
pub mod input;
pub mod pipeline;
pub mod resolver;
pub mod sources;
pub mod store;
pub mod workflow;

pub use pipeline::{PipelineOptions, RunSummary, SearchPipeline};
pub use resolver::ResolverChain;
