use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use super::AuditError;
use crate::db::models::{Audit, AuditStatus, MatchKind, Pro, TrackMatch, UnmatchedClaim, User};
use crate::db::Database;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const DEFAULT_MISSING_DAYS: u32 = 90;
/// Unmatched claims listed in a missing-royalties report.
const MISSING_ENTRIES: usize = 20;

/// An audit with its matches and derived statistics.
#[derive(Debug, Clone)]
pub struct AuditSummary {
    pub audit: Audit,
    pub user: Option<User>,
    pub matches: Vec<TrackMatch>,
    /// `matches_found / tracks_scanned * 100`, 0 for an empty audit.
    pub match_rate: f64,
    pub matched_count: usize,
    pub unmatched_count: usize,
    pub by_match_type: BTreeMap<MatchKind, usize>,
    pub by_pro: BTreeMap<Pro, usize>,
}

pub fn summarize(audit: Audit, matches: Vec<TrackMatch>, user: Option<User>) -> AuditSummary {
    let match_rate = if audit.tracks_scanned > 0 {
        audit.matches_found as f64 / audit.tracks_scanned as f64 * 100.0
    } else {
        0.0
    };

    let matched_count = matches.iter().filter(|m| m.is_matched()).count();

    let mut by_match_type = BTreeMap::new();
    let mut by_pro = BTreeMap::new();
    for m in &matches {
        *by_match_type.entry(m.match_kind).or_insert(0) += 1;
        *by_pro.entry(m.pro).or_insert(0) += 1;
    }

    AuditSummary {
        unmatched_count: matches.len() - matched_count,
        matched_count,
        match_rate,
        by_match_type,
        by_pro,
        audit,
        user,
        matches,
    }
}

pub fn get_audit_summary(db: &Database, audit_id: i64) -> Result<AuditSummary, AuditError> {
    let audit = db
        .get_audit(audit_id)?
        .ok_or(AuditError::NotFound { kind: "audit", id: audit_id })?;
    let matches = db.get_audit_matches(audit_id)?;
    let user = db.get_user(&audit.user_id)?;
    Ok(summarize(audit, matches, user))
}

/// A user's audits, newest first.
pub fn list_user_audits(
    db: &Database,
    user_id: &str,
    limit: usize,
    offset: usize,
    status: Option<AuditStatus>,
) -> Result<Vec<Audit>, AuditError> {
    Ok(db.list_user_audits(user_id, limit, offset, status)?)
}

/// Delete an audit and its matches. Returns false unless `user_id` owns it.
pub fn delete_audit(db: &Database, audit_id: i64, user_id: &str) -> Result<bool, AuditError> {
    let deleted = db.delete_audit(audit_id, user_id)?;
    if deleted {
        log::info!("Deleted audit {audit_id}");
    } else {
        log::warn!("Audit {audit_id} not found for {user_id}, nothing deleted");
    }
    Ok(deleted)
}

/// Unpaid claims across a user's recent completed audits.
#[derive(Debug, Clone)]
pub struct MissingRoyalties {
    pub period_days: u32,
    pub audits: usize,
    /// Sum of the audits' `missing_amount`.
    pub total_missing: f64,
    /// Unmatched amount per PRO.
    pub by_pro: BTreeMap<Pro, f64>,
    pub unmatched_count: usize,
    /// The first unmatched claims, newest audit first.
    pub entries: Vec<UnmatchedClaim>,
}

pub fn missing_royalties_summary(
    db: &Database,
    user_id: &str,
    days: u32,
) -> Result<MissingRoyalties, AuditError> {
    // A window reaching past the earliest representable time covers everything.
    let since = TimeDelta::try_days(i64::from(days))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let audits = db.completed_audits_since(user_id, &since)?;
    let claims = db.unmatched_claims_since(user_id, &since)?;

    let mut by_pro = BTreeMap::new();
    for c in &claims {
        *by_pro.entry(c.pro).or_insert(0.0) += c.amount;
    }

    Ok(MissingRoyalties {
        period_days: days,
        audits: audits.len(),
        total_missing: audits.iter().map(|a| a.missing_amount).sum(),
        by_pro,
        unmatched_count: claims.len(),
        entries: claims.into_iter().take(MISSING_ENTRIES).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{create_audit, Aggregator, AuditOptions, CancelToken};
    use crate::catalog::CatalogSnapshot;
    use crate::db::models::{AuditUpdate, NewTrack, RoyaltyRecord};

    fn record(title: &str, pro: Pro, amount: f64) -> RoyaltyRecord {
        RoyaltyRecord {
            isrc: None,
            title: title.to_string(),
            artist: "Jay Rock".to_string(),
            pro,
            amount,
            period: String::new(),
            plays: None,
            raw: Default::default(),
        }
    }

    fn audited(db: &Database, user: &str, records: &[RoyaltyRecord]) -> Audit {
        let snapshot = CatalogSnapshot::load(db).unwrap();
        let audit = create_audit(db, user, "statement.csv", records.len()).unwrap();
        Aggregator::new(&AuditOptions::default())
            .run(db, &snapshot, audit.id, records, &CancelToken::new())
            .unwrap();
        db.get_audit(audit.id).unwrap().unwrap()
    }

    fn catalog_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_track(&NewTrack { isrc: None, title: "Vice City".into(), artist: "Jay Rock".into() }).unwrap();
        db
    }

    #[test]
    fn test_summary_statistics() {
        let db = catalog_db();
        let audit = audited(&db, "u1", &[
            record("Vice City", Pro::Ascap, 10.0),
            record("Lost One", Pro::Bmi, 3.0),
            record("Lost Two", Pro::Bmi, 4.0),
            record("", Pro::Ascap, 1.0),
        ]);

        let summary = get_audit_summary(&db, audit.id).unwrap();
        assert_eq!(summary.match_rate, 25.0);
        assert_eq!(summary.matched_count, 1);
        assert_eq!(summary.unmatched_count, 3);
        assert_eq!(summary.by_match_type[&MatchKind::Exact], 1);
        assert_eq!(summary.by_match_type[&MatchKind::Fuzzy], 2);
        assert_eq!(summary.by_match_type[&MatchKind::NoAttempt], 1);
        assert_eq!(summary.by_pro[&Pro::Bmi], 2);
        assert_eq!(summary.by_pro[&Pro::Ascap], 2);
        assert_eq!(summary.user.as_ref().map(|u| u.id.as_str()), Some("u1"));
    }

    #[test]
    fn test_empty_audit_has_zero_rate() {
        let db = catalog_db();
        let audit = audited(&db, "u1", &[]);
        let summary = get_audit_summary(&db, audit.id).unwrap();
        assert_eq!(summary.match_rate, 0.0);
        assert!(summary.by_pro.is_empty());
    }

    #[test]
    fn test_missing_audit_is_not_found() {
        let db = catalog_db();
        let err = get_audit_summary(&db, 42).unwrap_err();
        assert!(matches!(err, AuditError::NotFound { id: 42, .. }));
    }

    #[test]
    fn test_delete_checks_owner() {
        let db = catalog_db();
        let audit = audited(&db, "owner", &[record("Lost", Pro::Prs, 1.0)]);
        assert!(!delete_audit(&db, audit.id, "someone-else").unwrap());
        assert!(delete_audit(&db, audit.id, "owner").unwrap());
        assert!(db.get_audit_matches(audit.id).unwrap().is_empty());
        assert!(!delete_audit(&db, audit.id, "owner").unwrap());
    }

    #[test]
    fn test_list_defaults_newest_first() {
        let db = catalog_db();
        let a = audited(&db, "u1", &[record("Vice City", Pro::Ascap, 1.0)]);
        let b = audited(&db, "u1", &[record("Vice City", Pro::Ascap, 1.0)]);
        let listed = list_user_audits(&db, "u1", DEFAULT_LIST_LIMIT, 0, Some(AuditStatus::Completed)).unwrap();
        let ids: Vec<i64> = listed.iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert!(list_user_audits(&db, "u2", DEFAULT_LIST_LIMIT, 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_missing_royalties_report() {
        let db = catalog_db();
        audited(&db, "u1", &[
            record("Vice City", Pro::Ascap, 100.0),
            record("Lost One", Pro::Bmi, 3.0),
            record("Lost Two", Pro::Ascap, 4.5),
        ]);
        let many: Vec<RoyaltyRecord> = (0..25).map(|i| record(&format!("Gone {i}"), Pro::Prs, 1.0)).collect();
        audited(&db, "u1", &many);

        // Failed and foreign audits are ignored
        let failed = audited(&db, "u1", &[record("Lost Three", Pro::Gema, 50.0)]);
        db.update_audit(failed.id, &AuditUpdate { status: Some(AuditStatus::Failed), ..Default::default() }).unwrap();
        audited(&db, "u2", &[record("Lost Four", Pro::Bmi, 9.0)]);

        let report = missing_royalties_summary(&db, "u1", DEFAULT_MISSING_DAYS).unwrap();
        assert_eq!(report.audits, 2);
        assert_eq!(report.total_missing, 32.5);
        assert_eq!(report.unmatched_count, 27);
        assert_eq!(report.entries.len(), 20);
        assert_eq!(report.by_pro[&Pro::Prs], 25.0);
        assert_eq!(report.by_pro[&Pro::Ascap], 4.5);
        assert_eq!(report.by_pro[&Pro::Bmi], 3.0);
        assert!(!report.by_pro.contains_key(&Pro::Gema));
    }

    #[test]
    fn test_missing_royalties_unbounded_window() {
        let db = catalog_db();
        audited(&db, "u1", &[record("Lost One", Pro::Bmi, 3.0)]);

        let report = missing_royalties_summary(&db, "u1", u32::MAX).unwrap();
        assert_eq!(report.period_days, u32::MAX);
        assert_eq!(report.audits, 1);
        assert_eq!(report.unmatched_count, 1);
        assert_eq!(report.total_missing, 3.0);
    }
}
