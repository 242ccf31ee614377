//! Data layer for a5-census.
//!
//! Discovers and parses capture files, attributes them to base stations,
//! merges partial captures, aggregates windows and exports the results.

pub mod aggregator;
pub mod analysis;
pub mod export;
pub mod merger;
pub mod reader;

pub use census_core as core;
