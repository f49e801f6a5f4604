use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::db::models::{NewTrack, Track};
use crate::db::Database;
use crate::parser::normalize_isrc;
use crate::resolver::{LookupError, TrackLookup};
use crate::similarity::is_candidate;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
}

/// Immutable in-memory copy of the catalog.
///
/// Answers the same queries as the database but is `Sync`, so one snapshot can
/// serve every worker thread of an audit run.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    tracks: Vec<Track>,
    by_isrc: HashMap<String, usize>,
    by_title_artist: HashMap<(String, String), Vec<usize>>,
}

impl CatalogSnapshot {
    pub fn new(mut tracks: Vec<Track>) -> Self {
        tracks.sort_by_key(|t| t.id);

        let mut by_isrc = HashMap::new();
        let mut by_title_artist: HashMap<(String, String), Vec<usize>> = HashMap::new();
        for (idx, t) in tracks.iter().enumerate() {
            if let Some(isrc) = &t.isrc {
                by_isrc.entry(isrc.clone()).or_insert(idx);
            }
            by_title_artist
                .entry((t.title.clone(), t.artist.clone()))
                .or_default()
                .push(idx);
        }

        Self { tracks, by_isrc, by_title_artist }
    }

    /// Load every catalog track from the database.
    pub fn load(db: &Database) -> Result<Self, crate::db::DbError> {
        let tracks = db.get_all_tracks()?;
        log::debug!("Loaded catalog snapshot with {} tracks", tracks.len());
        Ok(Self::new(tracks))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }
}

impl TrackLookup for CatalogSnapshot {
    fn find_by_isrc(&self, isrc: &str) -> Result<Option<Track>, LookupError> {
        Ok(self.by_isrc.get(isrc).map(|&idx| self.tracks[idx].clone()))
    }

    fn find_by_title_artist(&self, title: &str, artist: &str) -> Result<Vec<Track>, LookupError> {
        let key = (title.to_string(), artist.to_string());
        Ok(self
            .by_title_artist
            .get(&key)
            .map(|idxs| idxs.iter().map(|&i| self.tracks[i].clone()).collect())
            .unwrap_or_default())
    }

    fn find_candidates(&self, title: Option<&str>, artist: Option<&str>) -> Result<Vec<Track>, LookupError> {
        Ok(self
            .tracks
            .iter()
            .filter(|t| is_candidate((t.title.as_str(), t.artist.as_str()), title, artist))
            .cloned()
            .collect())
    }}

impl TrackLookup for Database {
    fn find_by_isrc(&self, isrc: &str) -> Result<Option<Track>, LookupError> {
        Ok(self.track_by_isrc(isrc)?)
    }

    fn find_by_title_artist(&self, title: &str, artist: &str) -> Result<Vec<Track>, LookupError> {
        Ok(self.tracks_by_title_artist(title, artist)?)
    }

    fn find_candidates(&self, title: Option<&str>, artist: Option<&str>) -> Result<Vec<Track>, LookupError> {
        Ok(self.candidate_tracks(title, artist)?)
    }
}

/// A row of a catalog CSV.
#[derive(Debug, Deserialize)]
struct CatalogRow {
    #[serde(default, alias = "ISRC", alias = "Isrc")]
    isrc: Option<String>,
    #[serde(alias = "Title", alias = "Song Title", alias = "track_title")]
    title: String,
    #[serde(alias = "Artist", alias = "artist_name")]
    artist: String,
}

pub struct CatalogImport {
    pub imported: usize,
    pub skipped: usize,
}

pub fn import_catalog_file(db: &Database, path: &Path) -> Result<CatalogImport, CatalogError> {
    let file = std::fs::File::open(path)?;
    import_catalog_csv(db, file)
}

/// Import catalog tracks from CSV (`isrc`, `title`, `artist` columns).
/// Rows that fail to deserialize or have a blank title are skipped and logged.
pub fn import_catalog_csv<R: Read>(db: &Database, reader: R) -> Result<CatalogImport, CatalogError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut result = CatalogImport { imported: 0, skipped: 0 };

    // One transaction for the whole import
    let tx = db.conn.unchecked_transaction().map_err(crate::db::DbError::from)?;

    for (idx, row) in rdr.deserialize::<CatalogRow>().enumerate() {
        let line = idx + 2;
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                log::warn!("Catalog line {line}: {e}");
                result.skipped += 1;
                continue;
            }
        };
        if row.title.is_empty() {
            log::warn!("Catalog line {line}: blank title, skipping");
            result.skipped += 1;
            continue;
        }

        db.upsert_track(&NewTrack {
            isrc: row.isrc.as_deref().and_then(normalize_isrc),
            title: row.title,
            artist: row.artist,
        })?;
        result.imported += 1;
    }

    tx.commit().map_err(crate::db::DbError::from)?;
    Ok(result)
}
