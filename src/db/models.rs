use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// A persisted string that doesn't name any variant of the target enum.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// How a royalty record was tied to a catalog track.
///
/// `Fuzzy` doubles as the classification of an unmatched record for which the
/// fuzzy tier was attempted; `NoAttempt` means fuzzy matching was never run
/// (title or artist missing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MatchKind {
    Isrc,
    Exact,
    Fuzzy,
    Manual,
    NoAttempt,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isrc => "ISRC",
            Self::Exact => "EXACT",
            Self::Fuzzy => "FUZZY",
            Self::Manual => "MANUAL",
            Self::NoAttempt => "NONE",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MatchKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ISRC" => Ok(Self::Isrc),
            "EXACT" => Ok(Self::Exact),
            "FUZZY" => Ok(Self::Fuzzy),
            "MANUAL" => Ok(Self::Manual),
            "NONE" => Ok(Self::NoAttempt),
            _ => Err(UnknownVariant { kind: "match kind", value: s.to_string() }),
        }
    }
}

/// Performing rights organization a statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Pro {
    Ascap,
    Bmi,
    Prs,
    Socan,
    Gema,
    Sacem,
    Jasrac,
    Apra,
    Other,
}

impl Pro {
    pub const ALL: [Pro; 9] = [
        Pro::Ascap, Pro::Bmi, Pro::Prs, Pro::Socan, Pro::Gema,
        Pro::Sacem, Pro::Jasrac, Pro::Apra, Pro::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ascap => "ASCAP",
            Self::Bmi => "BMI",
            Self::Prs => "PRS",
            Self::Socan => "SOCAN",
            Self::Gema => "GEMA",
            Self::Sacem => "SACEM",
            Self::Jasrac => "JASRAC",
            Self::Apra => "APRA",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for Pro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Pro {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Pro::ALL
            .into_iter()
            .find(|p| p.as_str() == upper)
            .ok_or_else(|| UnknownVariant { kind: "PRO", value: s.to_string() })
    }
}

/// Lifecycle of an audit run. Everything except `Processing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AuditStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(UnknownVariant { kind: "audit status", value: s.to_string() }),
        }
    }
}

/// One claim from a PRO/distributor statement, after column normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RoyaltyRecord {
    /// Normalized ISRC (uppercase, no separators). Not validated.
    pub isrc: Option<String>,
    pub title: String,
    pub artist: String,
    pub pro: Pro,
    /// Non-negative amount claimed.
    pub amount: f64,
    pub period: String,
    pub plays: Option<i64>,
    /// Original row, kept for traceability.
    pub raw: BTreeMap<String, String>,
}

/// A catalog track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub id: i64,
    pub isrc: Option<String>,
    pub title: String,
    pub artist: String,
}

/// Data for inserting a catalog track.
#[derive(Debug, Clone)]
pub struct NewTrack {
    pub isrc: Option<String>,
    pub title: String,
    pub artist: String,
}

/// Audit owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// An audit row.
#[derive(Debug, Clone, PartialEq)]
pub struct Audit {
    pub id: i64,
    pub user_id: String,
    pub file_name: String,
    pub status: AuditStatus,
    pub tracks_scanned: i64,
    pub matches_found: i64,
    pub missing_amount: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Data for creating an audit. New audits always start in `Processing`.
#[derive(Debug, Clone)]
pub struct NewAudit {
    pub user_id: String,
    pub file_name: String,
    pub tracks_scanned: i64,
}

/// Partial update of an audit row; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AuditUpdate {
    pub status: Option<AuditStatus>,
    pub matches_found: Option<i64>,
    pub missing_amount: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Data for inserting a track match (snapshot of the record that produced it).
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrackMatch {
    pub audit_id: i64,
    /// Position of the source record in the audited batch.
    pub record_index: i64,
    pub track_id: Option<i64>,
    pub isrc: Option<String>,
    pub title: String,
    pub artist: String,
    pub pro: Pro,
    pub match_kind: MatchKind,
    pub amount_found: f64,
    /// Similarity score, fuzzy hits only.
    pub score: Option<f64>,
    pub period: String,
    pub plays: Option<i64>,
    /// Raw statement row as JSON.
    pub raw_data: Option<String>,
}

impl NewTrackMatch {
    fn snapshot(audit_id: i64, record_index: i64, record: &RoyaltyRecord, match_kind: MatchKind) -> Self {
        Self {
            audit_id,
            record_index,
            track_id: None,
            isrc: record.isrc.clone(),
            title: record.title.clone(),
            artist: record.artist.clone(),
            pro: record.pro,
            match_kind,
            amount_found: record.amount,
            score: None,
            period: record.period.clone(),
            plays: record.plays,
            raw_data: if record.raw.is_empty() {
                None
            } else {
                serde_json::to_string(&record.raw).ok()
            },
        }
    }

    /// A match linking `record` to catalog track `track_id`.
    pub fn linked(
        audit_id: i64,
        record_index: i64,
        record: &RoyaltyRecord,
        track_id: i64,
        match_kind: MatchKind,
        score: Option<f64>,
    ) -> Self {
        Self {
            track_id: Some(track_id),
            score,
            ..Self::snapshot(audit_id, record_index, record, match_kind)
        }
    }

    /// An unmatched entry for `record`.
    pub fn unmatched(audit_id: i64, record_index: i64, record: &RoyaltyRecord, match_kind: MatchKind) -> Self {
        Self::snapshot(audit_id, record_index, record, match_kind)
    }
}

/// A persisted track match, optionally joined with the track it points to.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMatch {
    pub id: i64,
    pub audit_id: i64,
    pub record_index: i64,
    pub track_id: Option<i64>,
    pub isrc: Option<String>,
    pub title: String,
    pub artist: String,
    pub pro: Pro,
    pub match_kind: MatchKind,
    pub amount_found: f64,
    pub score: Option<f64>,
    pub period: String,
    pub plays: Option<i64>,
    /// Raw statement row as JSON.
    pub raw_data: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub track: Option<Track>,
}

impl TrackMatch {
    pub fn is_matched(&self) -> bool {
        self.track_id.is_some()
    }
}

/// An unmatched claim from a completed audit (missing-royalties report).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedClaim {
    pub title: String,
    pub artist: String,
    pub pro: Pro,
    pub amount: f64,
    pub audit_date: DateTime<Utc>,
}

/// Catalog and audit statistics.
#[derive(Debug)]
pub struct CatalogStats {
    pub total_tracks: i64,
    pub tracks_with_isrc: i64,
    pub total_audits: i64,
    pub audits_by_status: Vec<(String, i64)>,
    pub total_missing: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_strings_parse_back() {
        for kind in [MatchKind::Isrc, MatchKind::Exact, MatchKind::Fuzzy, MatchKind::Manual, MatchKind::NoAttempt] {
            assert_eq!(kind.as_str().parse::<MatchKind>().unwrap(), kind);
        }
        for pro in Pro::ALL {
            assert_eq!(pro.as_str().parse::<Pro>().unwrap(), pro);
        }
        assert_eq!("cancelled".parse::<AuditStatus>().unwrap(), AuditStatus::Cancelled);
    }

    #[test]
    fn test_unknown_strings_rejected() {
        assert!("TITLE".parse::<MatchKind>().is_err());
        let err = "KOMCA".parse::<Pro>().unwrap_err();
        assert_eq!(err.value, "KOMCA");
        assert!("DONE".parse::<AuditStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!AuditStatus::Processing.is_terminal());
        assert!(AuditStatus::Completed.is_terminal());
        assert!(AuditStatus::Failed.is_terminal());
        assert!(AuditStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_unmatched_snapshot_keeps_raw_row() {
        let mut raw = BTreeMap::new();
        raw.insert("Title".to_string(), "Vice City".to_string());
        let record = RoyaltyRecord {
            isrc: None,
            title: "Vice City".into(),
            artist: "Jay Rock".into(),
            pro: Pro::Bmi,
            amount: 12.5,
            period: "2024Q1".into(),
            plays: Some(300),
            raw,
        };
        let m = NewTrackMatch::unmatched(7, 0, &record, MatchKind::Fuzzy);
        assert_eq!(m.track_id, None);
        assert_eq!(m.amount_found, 12.5);
        assert_eq!(m.raw_data.as_deref(), Some(r#"{"Title":"Vice City"}"#));

        let linked = NewTrackMatch::linked(7, 0, &record, 3, MatchKind::Exact, None);
        assert_eq!(linked.track_id, Some(3));
        assert_eq!(linked.match_kind, MatchKind::Exact);
    }
}
