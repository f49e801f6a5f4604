use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::models::{Audit, TrackMatch};
use crate::db::Database;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),
    #[error("Audit {0} not found")]
    NotFound(i64),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV buffer error: {0}")]
    CsvBuffer(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(ExportError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Render an audit and its matches. Returns `(file_name, content)`.
pub fn export_audit(db: &Database, audit_id: i64, format: ExportFormat) -> Result<(String, String), ExportError> {
    let audit = db.get_audit(audit_id)?.ok_or(ExportError::NotFound(audit_id))?;
    let matches = db.get_audit_matches(audit_id)?;

    let content = match format {
        ExportFormat::Csv => render_csv(&matches)?,
        ExportFormat::Json => render_json(&audit, &matches)?,
    };
    log::debug!("Exported audit {audit_id} as {format} ({} matches)", matches.len());

    Ok((format!("audit_{}.{}", audit.id, format.extension()), content))
}

pub fn render_csv(matches: &[TrackMatch]) -> Result<String, ExportError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record([
        "ISRC", "Title", "Artist", "PRO", "Amount",
        "Match Type", "Matched Track ID", "Matched Track Title",
    ])?;

    for m in matches {
        let match_type = if m.is_matched() { m.match_kind.as_str() } else { "UNMATCHED" };
        let track_id = m.track_id.map(|id| id.to_string()).unwrap_or_default();
        let amount = m.amount_found.to_string();
        wtr.write_record([
            m.isrc.as_deref().unwrap_or(""),
            m.title.as_str(),
            m.artist.as_str(),
            m.pro.as_str(),
            amount.as_str(),
            match_type,
            track_id.as_str(),
            m.track.as_ref().map(|t| t.title.as_str()).unwrap_or(""),
        ])?;
    }

    let bytes = wtr.into_inner().map_err(|e| ExportError::CsvBuffer(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ExportError::CsvBuffer(e.to_string()))
}

#[derive(Serialize)]
struct AuditExport<'a> {
    audit_id: i64,
    file_name: &'a str,
    created_at: String,
    completed_at: Option<String>,
    status: &'static str,
    summary: ExportSummary,
    matches: Vec<MatchExport<'a>>,
}

#[derive(Serialize)]
struct ExportSummary {
    tracks_scanned: i64,
    matches_found: i64,
    missing_amount: f64,
}

#[derive(Serialize)]
struct MatchExport<'a> {
    isrc: Option<&'a str>,
    title: &'a str,
    artist: &'a str,
    pro: &'static str,
    amount: f64,
    match_type: &'static str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_track: Option<MatchedTrack<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_row: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct MatchedTrack<'a> {
    id: i64,
    title: &'a str,
    artist: &'a str,
    isrc: Option<&'a str>,
}

fn iso(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn render_json(audit: &Audit, matches: &[TrackMatch]) -> Result<String, ExportError> {
    let entries = matches
        .iter()
        .map(|m| -> Result<MatchExport, ExportError> {
            let raw_row = m
                .raw_data
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?;
            Ok(MatchExport {
                isrc: m.isrc.as_deref(),
                title: &m.title,
                artist: &m.artist,
                pro: m.pro.as_str(),
                amount: m.amount_found,
                match_type: m.match_kind.as_str(),
                timestamp: iso(&m.timestamp),
                matched_track: m.track.as_ref().map(|t| MatchedTrack {
                    id: t.id,
                    title: &t.title,
                    artist: &t.artist,
                    isrc: t.isrc.as_deref(),
                }),
                raw_row,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let doc = AuditExport {
        audit_id: audit.id,
        file_name: &audit.file_name,
        created_at: iso(&audit.created_at),
        completed_at: audit.completed_at.as_ref().map(iso),
        status: audit.status.as_str(),
        summary: ExportSummary {
            tracks_scanned: audit.tracks_scanned,
            matches_found: audit.matches_found,
            missing_amount: audit.missing_amount,
        },
        matches: entries,
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}
