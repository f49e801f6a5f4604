pub mod summary;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::catalog::CatalogSnapshot;
use crate::db::models::{
    Audit, AuditStatus, AuditUpdate, NewAudit, NewTrackMatch, RoyaltyRecord, TrackMatch,
};
use crate::db::{Database, DbError};
use crate::resolver::{Resolution, ResolveError, Resolver, TrackLookup};

pub use summary::{
    delete_audit, get_audit_summary, list_user_audits, missing_royalties_summary, summarize,
    AuditSummary, MissingRoyalties,
};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("Audit worker failed: {0}")]
    Worker(String),
}

/// Where audits and their matches are written.
pub trait AuditStore {
    /// Insert a new audit in `Processing` state.
    fn create_audit(&self, audit: &NewAudit) -> Result<Audit, DbError>;

    fn create_track_match(&self, m: &NewTrackMatch) -> Result<TrackMatch, DbError>;

    /// Insert several matches, keeping their order.
    fn create_track_matches(&self, batch: &[NewTrackMatch]) -> Result<Vec<TrackMatch>, DbError> {
        batch.iter().map(|m| self.create_track_match(m)).collect()
    }

    /// Returns false when the audit doesn't exist.
    fn update_audit(&self, id: i64, update: &AuditUpdate) -> Result<bool, DbError>;
}

impl AuditStore for Database {
    fn create_audit(&self, audit: &NewAudit) -> Result<Audit, DbError> {
        self.ensure_user(&audit.user_id)?;
        self.insert_audit(audit)
    }

    fn create_track_match(&self, m: &NewTrackMatch) -> Result<TrackMatch, DbError> {
        self.insert_track_match(m)
    }

    fn create_track_matches(&self, batch: &[NewTrackMatch]) -> Result<Vec<TrackMatch>, DbError> {
        self.insert_track_matches(batch)
    }

    fn update_audit(&self, id: i64, update: &AuditUpdate) -> Result<bool, DbError> {
        Database::update_audit(self, id, update)
    }
}

/// Shared flag for stopping a running audit. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Totals derived from a set of persisted matches.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AuditTotals {
    /// Records with at least one linked match.
    pub matches_found: i64,
    /// Sum of `amount_found` over unmatched entries.
    pub missing_amount: f64,
}

impl AuditTotals {
    pub fn from_matches(matches: &[TrackMatch]) -> Self {
        let matched_records: HashSet<i64> = matches
            .iter()
            .filter(|m| m.is_matched())
            .map(|m| m.record_index)
            .collect();
        let missing_amount = matches
            .iter()
            .filter(|m| !m.is_matched())
            .map(|m| m.amount_found)
            .sum();

        Self {
            matches_found: matched_records.len() as i64,
            missing_amount,
        }
    }
}

/// Result of an audit pass that reached a terminal status without error.
#[derive(Debug)]
pub struct AuditOutcome {
    pub audit_id: i64,
    /// `Completed` or `Cancelled`.
    pub status: AuditStatus,
    pub totals: AuditTotals,
    /// Matches persisted by this pass, in input order.
    pub matches: Vec<TrackMatch>,
}

#[derive(Debug, Clone, Copy)]
pub struct AuditOptions {
    pub resolver: Resolver,
    /// Resolution threads.
    pub jobs: usize,
    /// Show a progress bar on stderr.
    pub progress: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            resolver: Resolver::default(),
            jobs: 1,
            progress: false,
        }
    }
}

/// Create the audit row for a batch of `record_count` records.
pub fn create_audit<S: AuditStore + ?Sized>(
    store: &S,
    user_id: &str,
    file_name: &str,
    record_count: usize,
) -> Result<Audit, AuditError> {
    let audit = store.create_audit(&NewAudit {
        user_id: user_id.to_string(),
        file_name: file_name.to_string(),
        tracks_scanned: record_count as i64,
    })?;
    log::info!("Created audit {} for {user_id} ({record_count} records from {file_name})", audit.id);
    Ok(audit)
}

enum Pass {
    Finished,
    Cancelled,
}

/// Resolves a batch of records and records the results against an audit.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    resolver: Resolver,
    jobs: usize,
    progress: bool,
}

impl Aggregator {
    pub fn new(options: &AuditOptions) -> Self {
        Self {
            resolver: options.resolver,
            jobs: options.jobs.max(1),
            progress: options.progress,
        }
    }

    /// Run the audit to a terminal status.
    ///
    /// Records are resolved in parallel, one chunk at a time; each chunk's
    /// matches are persisted in input order before the next chunk starts.
    /// Whatever the ending (completed, cancelled or failed), the audit row's
    /// totals are recomputed from the matches that were actually persisted.
    pub fn run<S, L>(
        &self,
        store: &S,
        lookup: &L,
        audit_id: i64,
        records: &[RoyaltyRecord],
        cancel: &CancelToken,
    ) -> Result<AuditOutcome, AuditError>
    where
        S: AuditStore + ?Sized,
        L: TrackLookup + Sync + ?Sized,
    {
        log::info!("Audit {audit_id}: resolving {} records with {} workers", records.len(), self.jobs);

        let mut persisted = Vec::with_capacity(records.len());
        let pass = self.process(store, lookup, audit_id, records, cancel, &mut persisted);

        let totals = AuditTotals::from_matches(&persisted);
        let status = match &pass {
            Ok(Pass::Finished) => AuditStatus::Completed,
            Ok(Pass::Cancelled) => AuditStatus::Cancelled,
            Err(_) => AuditStatus::Failed,
        };
        let update = AuditUpdate {
            status: Some(status),
            matches_found: Some(totals.matches_found),
            missing_amount: Some(totals.missing_amount),
            completed_at: Some(Utc::now()),
        };

        if let Err(e) = pass {
            log::error!("Audit {audit_id} failed after {} matches: {e}", persisted.len());
            if let Err(db_err) = store.update_audit(audit_id, &update) {
                log::error!("Could not mark audit {audit_id} as failed: {db_err}");
            }
            return Err(e);
        }

        if !store.update_audit(audit_id, &update)? {
            return Err(AuditError::NotFound { kind: "audit", id: audit_id });
        }

        log::info!(
            "Audit {audit_id} {status}: {} of {} records matched, {:.2} missing",
            totals.matches_found,
            records.len(),
            totals.missing_amount
        );

        Ok(AuditOutcome {
            audit_id,
            status,
            totals,
            matches: persisted,
        })
    }

    fn process<S, L>(
        &self,
        store: &S,
        lookup: &L,
        audit_id: i64,
        records: &[RoyaltyRecord],
        cancel: &CancelToken,
        persisted: &mut Vec<TrackMatch>,
    ) -> Result<Pass, AuditError>
    where
        S: AuditStore + ?Sized,
        L: TrackLookup + Sync + ?Sized,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| AuditError::Worker(e.to_string()))?;

        let pb = self.progress_bar(records.len());

        // Chunk size = jobs * 2, same trade-off as any batch pass: enough
        // work per round for every thread, bounded results in memory.
        let chunk_size = self.jobs * 2;

        for (chunk_no, chunk) in records.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                pb.abandon_with_message("cancelled");
                return Ok(Pass::Cancelled);
            }

            let resolved: Vec<Option<Result<Resolution, ResolveError>>> = pool.install(|| {
                use rayon::prelude::*;
                chunk
                    .par_iter()
                    .map(|record| {
                        if cancel.is_cancelled() {
                            return None;
                        }
                        let result = self.resolver.resolve(record, lookup);
                        pb.inc(1);
                        Some(result)
                    })
                    .collect()
            });

            let offset = chunk_no * chunk_size;
            let mut batch = Vec::with_capacity(chunk.len());
            let mut stop = None;
            for (i, (record, outcome)) in chunk.iter().zip(resolved).enumerate() {
                let index = (offset + i) as i64;
                match outcome {
                    Some(Ok(resolution)) => batch.extend(matches_for(audit_id, index, record, &resolution)),
                    Some(Err(e)) => {
                        stop = Some(Err(AuditError::from(e)));
                        break;
                    }
                    None => {
                        stop = Some(Ok(Pass::Cancelled));
                        break;
                    }
                }
            }

            // Everything resolved before the stop point is still recorded
            if !batch.is_empty() {
                persisted.extend(store.create_track_matches(&batch)?);
            }
            if let Some(stop) = stop {
                pb.abandon();
                return stop;
            }
        }

        pb.finish_and_clear();
        Ok(Pass::Finished)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }
}

/// One linked match per hit, or a single unmatched entry.
fn matches_for(audit_id: i64, index: i64, record: &RoyaltyRecord, resolution: &Resolution) -> Vec<NewTrackMatch> {
    if !resolution.is_matched() {
        return vec![NewTrackMatch::unmatched(audit_id, index, record, resolution.unmatched_kind())];
    }
    resolution
        .hits
        .iter()
        .map(|hit| NewTrackMatch::linked(audit_id, index, record, hit.track.id, hit.kind, hit.score))
        .collect()
}

/// A background audit. Dropping the handle detaches the worker.
pub struct AuditHandle {
    pub audit_id: i64,
    cancel: CancelToken,
    join: JoinHandle<Result<AuditOutcome, AuditError>>,
}

impl AuditHandle {
    /// Ask the worker to stop at the next record boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker to finish.
    pub fn join(self) -> Result<AuditOutcome, AuditError> {
        let audit_id = self.audit_id;
        self.join
            .join()
            .map_err(|_| AuditError::Worker(format!("audit {audit_id} worker panicked")))?
    }
}

/// Run an already created audit on a background thread.
///
/// The connection to `db_path` is opened here and handed to the worker, so a
/// database that can't be opened fails the call before the audit leaves
/// `Processing`. The worker resolves against `catalog`; the caller returns
/// immediately and can poll the audit row or join the handle.
pub fn spawn_audit(
    db_path: &Path,
    catalog: Arc<CatalogSnapshot>,
    audit_id: i64,
    records: Vec<RoyaltyRecord>,
    options: AuditOptions,
) -> Result<AuditHandle, AuditError> {
    let db = Database::open(db_path).inspect_err(|e| {
        log::error!("Audit {audit_id}: cannot open {}: {e}", db_path.display());
    })?;
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();

    let join = std::thread::Builder::new()
        .name(format!("audit-{audit_id}"))
        .spawn(move || {
            Aggregator::new(&options).run(&db, catalog.as_ref(), audit_id, &records, &worker_cancel)
        })
        .map_err(|e| AuditError::Worker(e.to_string()))?;

    Ok(AuditHandle { audit_id, cancel, join })
}
