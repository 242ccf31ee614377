//! Shared domain types for the A5 cipher census.
//!
//! Holds the error taxonomy, the event and identity models, the cipher
//! classifier, source-name resolution, timestamp normalisation and the
//! command-line settings.

pub mod entity;
pub mod error;
pub mod models;
pub mod settings;
pub mod time_utils;
