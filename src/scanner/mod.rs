pub mod html;

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::config::ScannerConfig;
use crate::db::models::{Pro, Track};

const ASCAP_URL: &str = "https://www.ascap.com/repertory";
const BMI_URL: &str = "https://repertoire.bmi.com/Search/Search";

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP error: {0}")]
    Http(#[from] ureq::Error),
}

/// HTTP client shared by every repertory source.
///
/// Owns the agent (timeout), the user agent header and the request pacing:
/// consecutive requests through one client are at least `rate_limit` apart.
pub struct ProClient {
    agent: ureq::Agent,
    user_agent: String,
    rate_limit: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl ProClient {
    pub fn new(config: &ScannerConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(agent_config),
            user_agent: config.user_agent.clone(),
            rate_limit: Duration::from_millis(config.rate_limit_ms),
            last_request: Mutex::new(None),
        }
    }

    /// GET `url` with query parameters and return the body as text.
    pub fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, ScanError> {
        self.pace();

        let mut request = self.agent.get(url).header("User-Agent", self.user_agent.as_str());
        for (key, value) in query {
            request = request.query(key, value);
        }
        log::debug!("GET {url} {query:?}");

        let body = request.call()?.body_mut().read_to_string()?;
        Ok(body)
    }

    fn pace(&self) {
        let mut last = match self.last_request.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.rate_limit {
                std::thread::sleep(self.rate_limit - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

/// A work listed in a PRO's public repertory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepertoryWork {
    pub title: String,
    pub writers: String,
    pub publishers: String,
    pub iswc: Option<String>,
}

/// Searchable public repertory of one PRO.
pub trait RepertorySource {
    fn pro(&self) -> Pro;

    fn search(&self, title: &str, artist: Option<&str>) -> Result<Vec<RepertoryWork>, ScanError>;
}

pub struct AscapSource<'c> {
    client: &'c ProClient,
}

impl<'c> AscapSource<'c> {
    pub fn new(client: &'c ProClient) -> Self {
        Self { client }
    }
}

impl RepertorySource for AscapSource<'_> {
    fn pro(&self) -> Pro {
        Pro::Ascap
    }

    fn search(&self, title: &str, artist: Option<&str>) -> Result<Vec<RepertoryWork>, ScanError> {
        let mut query = vec![("title", title)];
        if let Some(artist) = artist.filter(|a| !a.is_empty()) {
            query.push(("writer", artist));
        }
        let body = self.client.get_text(ASCAP_URL, &query)?;
        let works = parse_ascap_results(&body);
        log::info!("ASCAP search found {} results for {title}", works.len());
        Ok(works)
    }
}

/// ASCAP result rows: title, writers, publishers, ISWC.
pub fn parse_ascap_results(html: &str) -> Vec<RepertoryWork> {
    html::table_rows(html, "results")
        .into_iter()
        .filter(|cells| cells.len() >= 4)
        .map(|cells| RepertoryWork {
            title: cells[0].clone(),
            writers: cells[1].clone(),
            publishers: cells[2].clone(),
            iswc: Some(cells[3].clone()).filter(|s| !s.is_empty()),
        })
        .collect()
}

pub struct BmiSource<'c> {
    client: &'c ProClient,
}

impl<'c> BmiSource<'c> {
    pub fn new(client: &'c ProClient) -> Self {
        Self { client }
    }
}

impl RepertorySource for BmiSource<'_> {
    fn pro(&self) -> Pro {
        Pro::Bmi
    }

    fn search(&self, title: &str, _artist: Option<&str>) -> Result<Vec<RepertoryWork>, ScanError> {
        let query = [
            ("Main_Search", title),
            ("Sub_Search", "song"),
            ("View_Count", "20"),
            ("Page_Number", "1"),
        ];
        let body = self.client.get_text(BMI_URL, &query)?;
        let works = parse_bmi_results(&body);
        log::info!("BMI search found {} results for {title}", works.len());
        Ok(works)
    }
}

/// BMI result rows: title, writers, then optionally publishers and ISWC.
pub fn parse_bmi_results(html: &str) -> Vec<RepertoryWork> {
    html::table_rows(html, "search-results")
        .into_iter()
        .filter(|cells| cells.len() >= 2)
        .map(|cells| RepertoryWork {
            title: cells[0].clone(),
            writers: cells[1].clone(),
            publishers: cells.get(2).cloned().unwrap_or_default(),
            iswc: cells.get(3).cloned().filter(|s| !s.is_empty()),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    /// Not found in any searched repertory.
    MissingRegistration,
    /// Found somewhere, but not with this PRO.
    MissingPro(Pro),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
}

/// Registration gaps given how many works each PRO returned.
///
/// PROs whose search failed must be left out of `found`; an unknown answer
/// is not reported as missing.
pub fn analyze_coverage(found: &[(Pro, usize)]) -> Vec<CoverageIssue> {
    if found.is_empty() {
        return Vec::new();
    }
    if found.iter().all(|(_, n)| *n == 0) {
        return vec![CoverageIssue {
            kind: IssueKind::MissingRegistration,
            severity: Severity::High,
            message: "Track not found in any PRO database".to_string(),
        }];
    }
    found
        .iter()
        .filter(|(_, n)| *n == 0)
        .map(|(pro, _)| CoverageIssue {
            kind: IssueKind::MissingPro(*pro),
            severity: Severity::Medium,
            message: format!("Track missing from {pro}"),
        })
        .collect()
}

/// Scan result for one catalog track.
#[derive(Debug, Clone, Serialize)]
pub struct TrackScan {
    pub track: Track,
    /// Works found per PRO that answered.
    pub found_in: Vec<(Pro, usize)>,
    pub issues: Vec<CoverageIssue>,
    /// PROs whose search failed, with the error.
    pub errors: Vec<(Pro, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogScan {
    pub tracks_scanned: usize,
    pub issues_found: usize,
    pub results: Vec<TrackScan>,
}

/// Search every source for every track and report registration gaps.
/// Source failures are logged and recorded per track; they never abort the scan.
pub fn batch_scan(tracks: &[Track], sources: &[&dyn RepertorySource]) -> CatalogScan {
    let mut results = Vec::with_capacity(tracks.len());
    for track in tracks {
        log::info!("Scanning {}...", track.title);

        let mut found_in = Vec::new();
        let mut errors = Vec::new();
        for source in sources {
            let artist = Some(track.artist.as_str()).filter(|a| !a.is_empty());
            match source.search(&track.title, artist) {
                Ok(works) => found_in.push((source.pro(), works.len())),
                Err(e) => {
                    log::error!("{} search failed for {}: {e}", source.pro(), track.title);
                    errors.push((source.pro(), e.to_string()));
                }
            }
        }

        results.push(TrackScan {
            track: track.clone(),
            issues: analyze_coverage(&found_in),
            found_in,
            errors,
        });
    }

    CatalogScan {
        tracks_scanned: tracks.len(),
        issues_found: results.iter().map(|r| r.issues.len()).sum(),
        results,
    }
}
