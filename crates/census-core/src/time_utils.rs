use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tracing::warn;

use crate::error::{CensusError, Result};

// ── Zone table ────────────────────────────────────────────────────────────────

/// Zone abbreviations known to appear in `frame.time`, with their UTC offset
/// in seconds.
const KNOWN_ZONES: &[(&str, i32)] = &[
    ("CEST", 2 * 3600),
    ("CET", 3600),
    ("BST", 3600),
    ("GMT", 0),
    ("UTC", 0),
    ("EEST", 3 * 3600),
    ("EET", 2 * 3600),
    ("WEST", 3600),
    ("WET", 0),
    ("MSK", 3 * 3600),
];

/// Zones tried when the caller does not configure any, most common first.
pub const DEFAULT_ZONES: &[&str] = &["CEST", "BST", "CET"];

/// Look up the fixed offset for a zone abbreviation (case-insensitive).
pub fn zone_offset(abbreviation: &str) -> Option<FixedOffset> {
    let upper = abbreviation.to_ascii_uppercase();
    KNOWN_ZONES
        .iter()
        .find(|(name, _)| *name == upper)
        .and_then(|(_, secs)| FixedOffset::east_opt(*secs))
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("regex is valid"))
}

// ── TimestampNormalizer ───────────────────────────────────────────────────────

/// One candidate format: the `frame.time` layout with a literal zone suffix.
#[derive(Debug, Clone)]
struct ZoneFormat {
    abbreviation: String,
    offset: FixedOffset,
    pattern: String,
}

impl ZoneFormat {
    fn new(abbreviation: &str, offset: FixedOffset) -> Self {
        let abbreviation = abbreviation.to_ascii_uppercase();
        let pattern = format!("%b %d, %Y %H:%M:%S%.f {}", abbreviation);
        Self {
            abbreviation,
            offset,
            pattern,
        }
    }

    fn parse(&self, text: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(text, &self.pattern).ok()?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Parses tshark `frame.time` strings such as
/// `"Jun  4, 2024 16:26:53.123456789 CEST"` into UTC instants.
///
/// Candidate formats are tried in the configured order and the first match
/// wins. Fractional seconds are optional and may have any precision.
#[derive(Debug, Clone)]
pub struct TimestampNormalizer {
    candidates: Vec<ZoneFormat>,
}

impl TimestampNormalizer {
    /// Build a normalizer that accepts the given zone abbreviations, in
    /// priority order.
    ///
    /// Fails with [`CensusError::Config`] when the list is empty or names a
    /// zone that is not in the built-in table.
    pub fn new<S: AsRef<str>>(zones: &[S]) -> Result<Self> {
        if zones.is_empty() {
            return Err(CensusError::Config(
                "at least one timestamp zone suffix is required".to_string(),
            ));
        }

        let candidates = zones
            .iter()
            .map(|zone| {
                let zone = zone.as_ref().trim();
                zone_offset(zone)
                    .map(|offset| ZoneFormat::new(zone, offset))
                    .ok_or_else(|| {
                        CensusError::Config(format!("unknown timezone abbreviation: {zone}"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { candidates })
    }

    /// Configured zone abbreviations, in the order they are tried.
    pub fn zones(&self) -> Vec<&str> {
        self.candidates
            .iter()
            .map(|c| c.abbreviation.as_str())
            .collect()
    }

    /// Parse `text` into a UTC instant.
    pub fn normalize(&self, text: &str) -> Result<DateTime<Utc>> {
        let collapsed = whitespace_runs().replace_all(text.trim(), " ");

        self.candidates
            .iter()
            .find_map(|candidate| candidate.parse(&collapsed))
            .ok_or_else(|| CensusError::UnparseableTimestamp(text.to_string()))
    }
}

impl Default for TimestampNormalizer {
    fn default() -> Self {
        let candidates = DEFAULT_ZONES
            .iter()
            .filter_map(|zone| zone_offset(zone).map(|offset| ZoneFormat::new(zone, offset)))
            .collect();
        Self { candidates }
    }
}

// ── Display timezone ──────────────────────────────────────────────────────────

/// Detect the IANA timezone name of the running system.
///
/// Falls back to `"UTC"` if detection fails.
pub fn get_system_timezone() -> String {
    iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string())
}

/// Resolve the timezone used when rendering exported timestamps.
///
/// `"auto"` selects the system timezone; anything else must be a valid IANA
/// identifier.
pub fn resolve_display_timezone(name: &str) -> Result<Tz> {
    if name.eq_ignore_ascii_case("auto") {
        let system = get_system_timezone();
        return Ok(system.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                "system timezone \"{}\" is not a recognised IANA name, using UTC",
                system
            );
            Tz::UTC
        }));
    }

    name.parse::<Tz>()
        .map_err(|_| CensusError::Config(format!("invalid timezone: {name}")))
}

/// Render a UTC instant as RFC 3339 in `tz`.
pub fn format_in_timezone(dt: DateTime<Utc>, tz: Tz) -> String {
    dt.with_timezone(&tz).to_rfc3339()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
