//! Runtime layer for a5-census.
//!
//! Supervises the external monitor and extractor processes of a capture
//! session.

pub mod orchestrator;

pub use census_core as core;
