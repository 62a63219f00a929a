//! Core domain model and title identity for the movie release calendar.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "mrc-core";

/// Namespace appended to every exported calendar UID.
pub const UID_DOMAIN_SUFFIX: &str = "firstshowing.net";

/// Marker prefixed to every exported event name.
pub const EVENT_MARKER: &str = "🍿";

/// Persisted release row, keyed by the raw scraped title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub identity_key: String,
    pub release_date: NaiveDate,
    pub description: Option<String>,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseRecord {
    pub fn from_candidate(candidate: &CandidateRecord, now: DateTime<Utc>) -> Self {
        Self {
            identity_key: candidate.title.clone(),
            release_date: candidate.release_date,
            description: Some(candidate.description.clone()),
            source_url: Some(candidate.source_url.clone()),
            created_at: now,
            updated_at: now,
        }
    }

    /// True when any mutable field differs from what the candidate carries.
    pub fn differs_from(&self, candidate: &CandidateRecord) -> bool {
        self.release_date != candidate.release_date
            || self.source_url.as_deref() != Some(candidate.source_url.as_str())
            || self.description.as_deref() != Some(candidate.description.as_str())
    }

    pub fn event_name(&self) -> String {
        format!("{EVENT_MARKER} {}", self.identity_key)
    }

    pub fn calendar_uid(&self) -> String {
        calendar_uid(&self.identity_key)
    }
}

/// Parsed listing entry handed from the parser into reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub title: String,
    pub release_date: NaiveDate,
    pub source_url: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Suspicious drop in the number of entries scraped for one year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSignal {
    pub year_key: String,
    pub previous_count: usize,
    pub current_count: usize,
    pub message: String,
}

pub fn year_key(year: i32) -> String {
    year.to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical identity token for a title.
///
/// Decomposes, lowercases and trims; maps typographic quotes and dashes to
/// ASCII; keeps only letters, digits, whitespace, `:` and `-`; collapses
/// whitespace runs to one space.
pub fn normalize_title(title: &str) -> String {
    let decomposed = title.nfkd().collect::<String>().to_lowercase();
    decomposed
        .trim()
        .chars()
        .map(ascii_punctuation)
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == ':' || *c == '-')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cross-run stable event UID derived from the normalized title.
pub fn calendar_uid(title: &str) -> String {
    let normalized = normalize_title(title);
    format!("{}@{UID_DOMAIN_SUFFIX}", sha256_hex(normalized.as_bytes()))
}

fn ascii_punctuation(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
        '\u{2010}'..='\u{2015}' | '\u{2212}' | '\u{FE58}' | '\u{FE63}' | '\u{FF0D}' => '-',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(url: &str) -> CandidateRecord {
        CandidateRecord {
            title: "Sinners".into(),
            release_date: NaiveDate::from_ymd_opt(2025, 4, 18).unwrap(),
            source_url: url.into(),
            description: "Trailer: https://example.com".into(),
        }
    }

    #[test]
    fn normalization_ignores_case_padding_and_typographic_hyphens() {
        let plain = normalize_title("Spider-Man: No Way Home");
        assert_eq!(plain, "spider-man: no way home");
        assert_eq!(normalize_title("  spider-man: no way home "), plain);
        assert_eq!(normalize_title("SPIDER\u{2011}MAN: NO WAY HOME"), plain);
        assert_eq!(normalize_title("Spider\u{2013}Man: No Way Home"), plain);

        let uid = calendar_uid("Spider-Man: No Way Home");
        assert_eq!(calendar_uid("  spider-man: no way home "), uid);
        assert_eq!(calendar_uid("SPIDER\u{2011}MAN: NO WAY HOME"), uid);
    }

    #[test]
    fn normalization_strips_accents_and_surrounding_punctuation() {
        assert_eq!(normalize_title("Amélie"), normalize_title("AMELIE"));
        assert_eq!(normalize_title("\u{201C}Wicked\u{201D}!"), "wicked");
        assert_eq!(normalize_title("...Wicked..."), "wicked");
        assert_eq!(normalize_title("Wicked: For Good (2025)"), "wicked: for good 2025");
        assert_eq!(normalize_title("Bob's   Burgers\tMovie"), "bobs burgers movie");
    }

    #[test]
    fn normalization_is_total() {
        assert_eq!(normalize_title(""), "");
        assert_eq!(normalize_title("!!!"), "");
        assert!(calendar_uid("").ends_with("@firstshowing.net"));
    }

    #[test]
    fn uid_is_hex_digest_with_domain_suffix() {
        let uid = calendar_uid("Sinners");
        let (digest, domain) = uid.split_once('@').unwrap();
        assert_eq!(domain, UID_DOMAIN_SUFFIX);
        assert_eq!(digest, sha256_hex(b"sinners"));
        assert_ne!(calendar_uid("Sinners"), calendar_uid("Sinner"));
    }

    #[test]
    fn record_difference_covers_every_mutable_field() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let record = ReleaseRecord::from_candidate(&candidate("https://a"), now);
        assert_eq!(record.created_at, record.updated_at);
        assert!(!record.differs_from(&candidate("https://a")));
        assert!(record.differs_from(&candidate("https://b")));

        let mut moved = candidate("https://a");
        moved.release_date = NaiveDate::from_ymd_opt(2025, 5, 2).unwrap();
        assert!(record.differs_from(&moved));

        let mut described = candidate("https://a");
        described.description = "A new synopsis.".into();
        assert!(record.differs_from(&described));
    }

    #[test]
    fn event_name_carries_marker() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let record = ReleaseRecord::from_candidate(&candidate("https://a"), now);
        assert_eq!(record.event_name(), "🍿 Sinners");
    }
}
