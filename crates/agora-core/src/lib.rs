//! Core domain model and normalization utilities for Agora.

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "agora-core";

/// Event categories as emitted by the upstream scrapers. Unknown labels
/// map to `Other` rather than failing ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Concert,
    Theater,
    Performance,
    Cinema,
    Exhibition,
    Workshop,
    Other,
}

impl EventType {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "concert" => Self::Concert,
            "theater" | "theatre" => Self::Theater,
            "performance" => Self::Performance,
            "cinema" => Self::Cinema,
            "exhibition" => Self::Exhibition,
            "workshop" => Self::Workshop,
            _ => Self::Other,
        }
    }

    /// Types that come in multi-night runs at a fixed venue.
    pub fn is_staged_run(self) -> bool {
        matches!(self, Self::Theater | Self::Performance | Self::Cinema)
    }
}

/// The unit of reconciliation. Records are created at ingestion and flow
/// through the engine read-only except for deletion; `id` is a stable
/// slug assigned once and never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    pub venue_name: String,
    /// Venue-local wall clock. Scrapers that could not extract a real
    /// showtime leave a sentinel time (midnight or noon) here.
    pub start: NaiveDateTime,
    pub event_type: EventType,
    pub source: String,
    pub url: Option<String>,
    /// Content-richness proxy; used only as a tie-break, never as a key.
    pub description_len: u32,
}

impl EventRecord {
    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }

    pub fn has_venue(&self) -> bool {
        !self.venue_name.trim().is_empty()
    }

    pub fn has_url(&self) -> bool {
        self.url.as_deref().map(str::trim).is_some_and(|u| !u.is_empty())
    }

    pub fn has_sentinel_time(&self) -> bool {
        is_sentinel_time(self.start.time())
    }
}

/// Why a record was excluded from every deletion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionReason {
    TheaterRun,
    ExhibitionRun,
    WeeklyRecurring,
    Festival,
}

/// Unicode-lowercased, whitespace-trimmed title for fuzzy grouping.
pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Lowercased venue with ASCII punctuation stripped, so
/// "Gazarte Main Stage!" and "Gazarte Main Stage" collide.
pub fn normalize_venue(venue: &str) -> String {
    venue
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect()
}

/// Scraper placeholder times: midnight is the obvious default, noon is
/// implausible for the evening events this store carries.
pub fn is_sentinel_time(time: NaiveTime) -> bool {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("valid time");
    let noon = NaiveTime::from_hms_opt(12, 0, 0).expect("valid time");
    time == midnight || time == noon
}
