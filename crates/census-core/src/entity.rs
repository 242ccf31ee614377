//! Base-station identity from capture source names.
//!
//! The capture tooling names its output files
//! `<tool>_<frequency>_<mcc>_<provider>_<lac>[_<cell>][_<epoch>]`, for example
//! `tshark_944.2M_262_2_0x10c3_0x23a1_1717511213.csv`. That layout is an
//! external contract owned by the capture side; it is pinned here as
//! [`NamingScheme::V1`] rather than inferred.

use std::path::Path;

use crate::error::{CensusError, Result};
use crate::models::EntityKey;

/// Segment layout of a capture source name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingScheme {
    /// `tool_frequency_mcc_provider_lac[_...]`.
    #[default]
    V1,
}

impl NamingScheme {
    const DELIMITER: char = '_';

    /// Minimum number of segments a name must carry.
    pub fn required_segments(self) -> usize {
        match self {
            NamingScheme::V1 => 5,
        }
    }

    /// Positions of `(frequency, provider, lac)`.
    fn positions(self) -> (usize, usize, usize) {
        match self {
            NamingScheme::V1 => (1, 3, 4),
        }
    }

    /// Resolve the [`EntityKey`] encoded in `source`.
    ///
    /// `source` may be a bare name or a path; directories and the extension
    /// are stripped before splitting.
    pub fn resolve(self, source: &str) -> Result<EntityKey> {
        let stem = source_stem(source);
        let segments: Vec<&str> = stem.split(Self::DELIMITER).collect();
        let expected = self.required_segments();

        let malformed = || CensusError::MalformedSourceName {
            name: source.to_string(),
            expected,
            found: segments.len(),
        };

        if segments.len() < expected {
            return Err(malformed());
        }

        let (f, p, l) = self.positions();
        let (frequency, provider, lac) = (segments[f], segments[p], segments[l]);
        if frequency.is_empty() || provider.is_empty() || lac.is_empty() {
            return Err(malformed());
        }

        Ok(EntityKey::new(frequency, provider, lac))
    }

    /// Build a source name (without extension) in this layout.
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        self,
        tool: &str,
        frequency: &str,
        mcc: &str,
        provider: &str,
        lac: &str,
        cell: &str,
        epoch: i64,
    ) -> String {
        match self {
            NamingScheme::V1 => {
                format!("{tool}_{frequency}_{mcc}_{provider}_{lac}_{cell}_{epoch}")
            }
        }
    }
}

/// Resolve with the default [`NamingScheme`].
pub fn resolve_entity_key(source: &str) -> Result<EntityKey> {
    NamingScheme::default().resolve(source)
}

/// File name without directory or extension.
///
/// Frequencies such as `944.2M` contain a dot, so only a trailing
/// alphanumeric suffix counts as an extension.
fn source_stem(source: &str) -> &str {
    let name = Path::new(source)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(source);

    match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            stem
        }
        _ => name,
    }
}
