use super::models::{
    Audit, AuditStatus, AuditUpdate, CatalogStats, NewAudit, NewTrack, NewTrackMatch, Track,
    TrackMatch, UnmatchedClaim, User,
};
use super::{to_db_time, Database, Result};
use crate::similarity::is_candidate;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::str::FromStr;

const AUDIT_COLUMNS: &str = "id, user_id, file_name, status, tracks_scanned, matches_found,
     missing_amount, created_at, completed_at";

impl Database {
    /// Insert a user, or refresh email/name of an existing one.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                email = COALESCE(excluded.email, users.email),
                name = COALESCE(excluded.name, users.name)",
            params![user.id, user.email, user.name, to_db_time(&Utc::now())],
        )?;
        Ok(())
    }

    /// Make sure a user row exists for `user_id` without touching its details.
    pub fn ensure_user(&self, user_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![user_id, to_db_time(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, email, name FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Insert a catalog track. Returns the track id.
    ///
    /// Tracks with an ISRC are upserted on it. Tracks without one are
    /// deduplicated on exact (title, artist), so re-importing a catalog is a no-op.
    pub fn upsert_track(&self, t: &NewTrack) -> Result<i64> {
        let now = to_db_time(&Utc::now());
        match &t.isrc {
            Some(isrc) => {
                self.conn.execute(
                    "INSERT INTO tracks (isrc, title, artist, created_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(isrc) DO UPDATE SET
                        title = excluded.title,
                        artist = excluded.artist",
                    params![isrc, t.title, t.artist, now],
                )?;
                let id: i64 = self.conn.query_row(
                    "SELECT id FROM tracks WHERE isrc = ?1",
                    params![isrc],
                    |row| row.get(0),
                )?;
                Ok(id)
            }
            None => {
                let existing: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT id FROM tracks
                         WHERE isrc IS NULL AND title = ?1 AND artist = ?2
                         ORDER BY id LIMIT 1",
                        params![t.title, t.artist],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing {
                    return Ok(id);
                }
                self.conn.execute(
                    "INSERT INTO tracks (isrc, title, artist, created_at) VALUES (NULL, ?1, ?2, ?3)",
                    params![t.title, t.artist, now],
                )?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    pub fn get_track(&self, id: i64) -> Result<Option<Track>> {
        let track = self
            .conn
            .query_row(
                "SELECT id, isrc, title, artist FROM tracks WHERE id = ?1",
                params![id],
                track_from_row,
            )
            .optional()?;
        Ok(track)
    }

    /// All catalog tracks, in id order.
    pub fn get_all_tracks(&self) -> Result<Vec<Track>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, isrc, title, artist FROM tracks ORDER BY id",
        )?;
        let tracks = stmt
            .query_map([], track_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    pub fn track_by_isrc(&self, isrc: &str) -> Result<Option<Track>> {
        let track = self
            .conn
            .query_row(
                "SELECT id, isrc, title, artist FROM tracks WHERE isrc = ?1",
                params![isrc],
                track_from_row,
            )
            .optional()?;
        Ok(track)
    }

    /// Tracks whose title and artist equal the given strings exactly (case-sensitive).
    pub fn tracks_by_title_artist(&self, title: &str, artist: &str) -> Result<Vec<Track>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, isrc, title, artist FROM tracks
             WHERE title = ?1 AND artist = ?2
             ORDER BY id",
        )?;
        let tracks = stmt
            .query_map(params![title, artist], track_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Fuzzy-match candidates: tracks whose title contains `title` OR whose
    /// artist contains `artist`, case-folded the way the scorer folds.
    /// Blank needles are ignored.
    pub fn candidate_tracks(&self, title: Option<&str>, artist: Option<&str>) -> Result<Vec<Track>> {
        let title = title.filter(|s| !s.is_empty());
        let artist = artist.filter(|s| !s.is_empty());
        if title.is_none() && artist.is_none() {
            return Ok(Vec::new());
        }

        // SQLite's lower() only folds ASCII, so the containment check runs here.
        let mut tracks = self.get_all_tracks()?;
        tracks.retain(|t| is_candidate((t.title.as_str(), t.artist.as_str()), title, artist));
        Ok(tracks)
    }

    /// Insert a new audit in `Processing` state.
    pub fn insert_audit(&self, a: &NewAudit) -> Result<Audit> {
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO audits (user_id, file_name, status, tracks_scanned, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                a.user_id,
                a.file_name,
                AuditStatus::Processing.as_str(),
                a.tracks_scanned,
                to_db_time(&created_at),
            ],
        )?;

        Ok(Audit {
            id: self.conn.last_insert_rowid(),
            user_id: a.user_id.clone(),
            file_name: a.file_name.clone(),
            status: AuditStatus::Processing,
            tracks_scanned: a.tracks_scanned,
            matches_found: 0,
            missing_amount: 0.0,
            created_at,
            completed_at: None,
        })
    }

    /// Apply a partial update. Returns false if the audit doesn't exist.
    pub fn update_audit(&self, id: i64, u: &AuditUpdate) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE audits SET
                status = COALESCE(?2, status),
                matches_found = COALESCE(?3, matches_found),
                missing_amount = COALESCE(?4, missing_amount),
                completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1",
            params![
                id,
                u.status.map(|s| s.as_str()),
                u.matches_found,
                u.missing_amount,
                u.completed_at.as_ref().map(to_db_time),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_audit(&self, id: i64) -> Result<Option<Audit>> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM audits WHERE id = ?1");
        let audit = self.conn.query_row(&sql, params![id], audit_from_row).optional()?;
        Ok(audit)
    }

    /// Audits owned by `user_id`, newest first.
    pub fn list_user_audits(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
        status: Option<AuditStatus>,
    ) -> Result<Vec<Audit>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audits
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let audits = stmt
            .query_map(
                params![user_id, status.map(|s| s.as_str()), limit as i64, offset as i64],
                audit_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(audits)
    }

    /// Delete an audit (and, by cascade, its matches) if `user_id` owns it.
    pub fn delete_audit(&self, id: i64, user_id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM audits WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(deleted > 0)
    }

    /// Insert a single track match.
    pub fn insert_track_match(&self, m: &NewTrackMatch) -> Result<TrackMatch> {
        Self::insert_match_row(&self.conn, m)
    }

    /// Insert a batch of track matches in one transaction, preserving order.
    pub fn insert_track_matches(&self, batch: &[NewTrackMatch]) -> Result<Vec<TrackMatch>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = Vec::with_capacity(batch.len());
        for m in batch {
            inserted.push(Self::insert_match_row(&tx, m)?);
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn insert_match_row(conn: &rusqlite::Connection, m: &NewTrackMatch) -> Result<TrackMatch> {
        let timestamp = Utc::now();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO track_matches (
                audit_id, record_index, track_id, isrc, title, artist, pro, match_type,
                amount_found, score, period, plays, raw_data, timestamp
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        stmt.execute(params![
            m.audit_id, m.record_index, m.track_id, m.isrc, m.title, m.artist,
            m.pro.as_str(), m.match_kind.as_str(),
            m.amount_found, m.score, m.period, m.plays, m.raw_data,
            to_db_time(&timestamp),
        ])?;

        Ok(TrackMatch {
            id: conn.last_insert_rowid(),
            audit_id: m.audit_id,
            record_index: m.record_index,
            track_id: m.track_id,
            isrc: m.isrc.clone(),
            title: m.title.clone(),
            artist: m.artist.clone(),
            pro: m.pro,
            match_kind: m.match_kind,
            amount_found: m.amount_found,
            score: m.score,
            period: m.period.clone(),
            plays: m.plays,
            raw_data: m.raw_data.clone(),
            timestamp,
            track: None,
        })
    }

    /// All matches of an audit in creation order, joined with their tracks.
    pub fn get_audit_matches(&self, audit_id: i64) -> Result<Vec<TrackMatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.audit_id, m.track_id, m.isrc, m.title, m.artist, m.pro,
                    m.match_type, m.amount_found, m.score, m.period, m.plays, m.timestamp,
                    t.id, t.isrc, t.title, t.artist, m.record_index, m.raw_data
             FROM track_matches m
             LEFT JOIN tracks t ON t.id = m.track_id
             WHERE m.audit_id = ?1
             ORDER BY m.id",
        )?;

        let matches = stmt
            .query_map(params![audit_id], |row| {
                let track = match row.get::<_, Option<i64>>(13)? {
                    Some(id) => Some(Track {
                        id,
                        isrc: row.get(14)?,
                        title: row.get(15)?,
                        artist: row.get(16)?,
                    }),
                    None => None,
                };
                Ok(TrackMatch {
                    id: row.get(0)?,
                    audit_id: row.get(1)?,
                    record_index: row.get(17)?,
                    track_id: row.get(2)?,
                    isrc: row.get(3)?,
                    title: row.get(4)?,
                    artist: row.get(5)?,
                    pro: parse_column(row, 6)?,
                    match_kind: parse_column(row, 7)?,
                    amount_found: row.get(8)?,
                    score: row.get(9)?,
                    period: row.get(10)?,
                    plays: row.get(11)?,
                    raw_data: row.get(18)?,
                    timestamp: time_column(row, 12)?,
                    track,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(matches)
    }

    /// Completed audits of `user_id` created at or after `since`, newest first.
    pub fn completed_audits_since(&self, user_id: &str, since: &DateTime<Utc>) -> Result<Vec<Audit>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audits
             WHERE user_id = ?1 AND status = ?2 AND created_at >= ?3
             ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let audits = stmt
            .query_map(
                params![user_id, AuditStatus::Completed.as_str(), to_db_time(since)],
                audit_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(audits)
    }

    /// Unmatched claims from the same audits as [`Self::completed_audits_since`].
    pub fn unmatched_claims_since(&self, user_id: &str, since: &DateTime<Utc>) -> Result<Vec<UnmatchedClaim>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.title, m.artist, m.pro, m.amount_found, a.created_at
             FROM track_matches m
             JOIN audits a ON a.id = m.audit_id
             WHERE a.user_id = ?1 AND a.status = ?2 AND a.created_at >= ?3
               AND m.track_id IS NULL
             ORDER BY a.created_at DESC, a.id DESC, m.id",
        )?;
        let claims = stmt
            .query_map(
                params![user_id, AuditStatus::Completed.as_str(), to_db_time(since)],
                |row| {
                    Ok(UnmatchedClaim {
                        title: row.get(0)?,
                        artist: row.get(1)?,
                        pro: parse_column(row, 2)?,
                        amount: row.get(3)?,
                        audit_date: time_column(row, 4)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(claims)
    }

    /// Catalog and audit statistics.
    pub fn stats(&self) -> Result<CatalogStats> {
        let total_tracks: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tracks", [], |r| r.get(0),
        )?;
        let tracks_with_isrc: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE isrc IS NOT NULL", [], |r| r.get(0),
        )?;
        let total_audits: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM audits", [], |r| r.get(0),
        )?;
        let total_missing: f64 = self.conn.query_row(
            "SELECT COALESCE(SUM(missing_amount), 0.0) FROM audits WHERE status = ?1",
            params![AuditStatus::Completed.as_str()],
            |r| r.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM audits GROUP BY status ORDER BY COUNT(*) DESC, status",
        )?;
        let audits_by_status = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(CatalogStats {
            total_tracks,
            tracks_with_isrc,
            total_audits,
            audits_by_status,
            total_missing,
        })
    }
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        isrc: row.get(1)?,
        title: row.get(2)?,
        artist: row.get(3)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<Audit> {
    let completed_at = match row.get::<_, Option<String>>(8)? {
        Some(_) => Some(time_column(row, 8)?),
        None => None,
    };
    Ok(Audit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_name: row.get(2)?,
        status: parse_column(row, 3)?,
        tracks_scanned: row.get(4)?,
        matches_found: row.get(5)?,
        missing_amount: row.get(6)?,
        created_at: time_column(row, 7)?,
        completed_at,
    })
}

/// Read a TEXT column holding the persisted form of an enum.
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
