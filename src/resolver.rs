use thiserror::Error;

use crate::db::models::{MatchKind, RoyaltyRecord, Track};
use crate::similarity::{similarity, DEFAULT_FUZZY_THRESHOLD};

/// A catalog query failed. Distinct from a lookup that found nothing.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Catalog query failed: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("{tier} lookup failed for \"{title}\" / \"{artist}\": {source}")]
    Lookup {
        tier: MatchKind,
        title: String,
        artist: String,
        #[source]
        source: LookupError,
    },
}

/// Read-only view of the track catalog used during resolution.
pub trait TrackLookup {
    /// The track carrying this (normalized) ISRC, if any.
    fn find_by_isrc(&self, isrc: &str) -> Result<Option<Track>, LookupError>;

    /// Tracks whose title and artist equal the arguments exactly, in id order.
    fn find_by_title_artist(&self, title: &str, artist: &str) -> Result<Vec<Track>, LookupError>;

    /// Pre-filtered fuzzy candidates: title contains `title` OR artist
    /// contains `artist`, case-insensitive, in id order.
    fn find_candidates(&self, title: Option<&str>, artist: Option<&str>) -> Result<Vec<Track>, LookupError>;
}

/// One catalog track a record resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub track: Track,
    pub kind: MatchKind,
    /// Similarity score for fuzzy hits.
    pub score: Option<f64>,
}

/// Outcome of resolving one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Hits from the first tier that produced any, most confident first.
    pub hits: Vec<Hit>,
    /// Whether the fuzzy tier ran. Kept even when it found nothing.
    pub fuzzy_attempted: bool,
}

impl Resolution {
    pub fn is_matched(&self) -> bool {
        !self.hits.is_empty()
    }

    /// `(track, kind)` pairs in confidence order.
    pub fn pairs(&self) -> Vec<(&Track, MatchKind)> {
        self.hits.iter().map(|h| (&h.track, h.kind)).collect()
    }

    /// Classification to record when there are no hits.
    pub fn unmatched_kind(&self) -> MatchKind {
        if self.fuzzy_attempted {
            MatchKind::Fuzzy
        } else {
            MatchKind::NoAttempt
        }
    }
}

/// Fuzzy matching needs both a title and an artist.
pub fn fuzzy_match_possible(record: &RoyaltyRecord) -> bool {
    !record.title.is_empty() && !record.artist.is_empty()
}

/// Tiered resolver: ISRC, then exact title + artist, then fuzzy.
/// The first tier with any hit wins.
#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    threshold: f64,
}

impl Default for Resolver {
    fn default() -> Self {
        Self { threshold: DEFAULT_FUZZY_THRESHOLD }
    }
}

impl Resolver {
    /// `threshold` is clamped to [0, 1].
    pub fn new(threshold: f64) -> Self {
        let threshold = if threshold.is_nan() { DEFAULT_FUZZY_THRESHOLD } else { threshold.clamp(0.0, 1.0) };
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn resolve<L: TrackLookup + ?Sized>(
        &self,
        record: &RoyaltyRecord,
        catalog: &L,
    ) -> Result<Resolution, ResolveError> {
        let lookup_err = |tier: MatchKind| {
            move |source: LookupError| ResolveError::Lookup {
                tier,
                title: record.title.clone(),
                artist: record.artist.clone(),
                source,
            }
        };

        if let Some(isrc) = record.isrc.as_deref().filter(|i| !i.is_empty()) {
            if let Some(track) = catalog.find_by_isrc(isrc).map_err(lookup_err(MatchKind::Isrc))? {
                return Ok(Resolution {
                    hits: vec![Hit { track, kind: MatchKind::Isrc, score: None }],
                    fuzzy_attempted: false,
                });
            }
        }

        let exact = catalog
            .find_by_title_artist(&record.title, &record.artist)
            .map_err(lookup_err(MatchKind::Exact))?;
        if !exact.is_empty() {
            return Ok(Resolution {
                hits: exact
                    .into_iter()
                    .map(|track| Hit { track, kind: MatchKind::Exact, score: None })
                    .collect(),
                fuzzy_attempted: false,
            });
        }

        if !fuzzy_match_possible(record) {
            return Ok(Resolution { hits: Vec::new(), fuzzy_attempted: false });
        }

        let candidates = catalog
            .find_candidates(Some(&record.title), Some(&record.artist))
            .map_err(lookup_err(MatchKind::Fuzzy))?;

        let mut scored: Vec<(f64, Track)> = candidates
            .into_iter()
            .map(|track| {
                let score = similarity(
                    (&track.title, &track.artist),
                    (&record.title, &record.artist),
                );
                (score, track)
            })
            .filter(|(score, _)| *score >= self.threshold)
            .collect();

        // Highest score first; ties in id order so repeated runs agree
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.id.cmp(&b.1.id))
        });

        log::trace!(
            "Fuzzy tier for \"{}\" / \"{}\": {} hits",
            record.title,
            record.artist,
            scored.len()
        );

        Ok(Resolution {
            hits: scored
                .into_iter()
                .map(|(score, track)| Hit { track, kind: MatchKind::Fuzzy, score: Some(score) })
                .collect(),
            fuzzy_attempted: true,
        })
    }
}
