use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use royalty_audit::audit::summary::{DEFAULT_LIST_LIMIT, DEFAULT_MISSING_DAYS};
use royalty_audit::audit::{self, AuditOptions, AuditSummary};
use royalty_audit::catalog::{self, CatalogSnapshot};
use royalty_audit::db::models::{Audit, AuditStatus, Pro, RoyaltyRecord};
use royalty_audit::export::{self, ExportFormat};
use royalty_audit::parser::{self, ParsedBatch};
use royalty_audit::scanner::{self, AscapSource, BmiSource, ProClient, RepertorySource};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "royalty-audit", version, about = "Audit royalty statements against your catalog")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import catalog tracks from a CSV file (ISRC, Title, Artist)
    CatalogImport {
        csv: PathBuf,
    },

    /// List catalog tracks
    CatalogList {
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Resolve a single statement line against the catalog
    Match {
        title: String,
        artist: String,

        #[arg(long)]
        isrc: Option<String>,
    },

    /// Audit PRO statement files (CSV files or directories of them)
    Audit {
        paths: Vec<PathBuf>,

        /// PRO the statements come from (ASCAP, BMI, PRS, ...)
        #[arg(long)]
        pro: Pro,

        /// Owner of the audit
        #[arg(long)]
        user: String,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Name recorded for the audit (defaults to the statement file names)
        #[arg(long)]
        file_name: Option<String>,
    },

    /// Show an audit with match statistics
    Summary {
        id: i64,
    },

    /// List a user's audits, newest first
    Audits {
        #[arg(long)]
        user: String,

        #[arg(long)]
        status: Option<AuditStatus>,

        #[arg(short = 'n', long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Export an audit's matches as CSV or JSON
    Export {
        id: i64,

        #[arg(short, long, default_value = "csv")]
        format: String,

        /// Output file or directory (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an audit and its matches
    Delete {
        id: i64,

        #[arg(long)]
        user: String,
    },

    /// Unmatched royalties across recent completed audits
    Missing {
        #[arg(long)]
        user: String,

        #[arg(long, default_value_t = DEFAULT_MISSING_DAYS)]
        days: u32,
    },

    /// Check catalog tracks against ASCAP and BMI public repertories
    Coverage {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show catalog and audit statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = royalty_audit::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli.db_path
        .or(config.db_path.clone())
        .unwrap_or_else(royalty_audit::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = royalty_audit::db::Database::open(&db_path)
        .context("Failed to open database")?;

    match cli.command {
        Commands::CatalogImport { csv } => {
            let result = catalog::import_catalog_file(&db, &csv)
                .with_context(|| format!("Failed to import {}", csv.display()))?;
            println!(
                "Catalog import complete: {} imported, {} skipped",
                result.imported, result.skipped
            );
        }

        Commands::CatalogList { limit } => {
            let tracks = db.get_all_tracks().context("Query failed")?;
            if tracks.is_empty() {
                println!("Catalog is empty. Run `royalty-audit catalog-import` first.");
                return Ok(());
            }

            println!("{:>6}  {:<12}  {:<35} {}", "ID", "ISRC", "Title", "Artist");
            println!("{}", "-".repeat(80));
            for t in tracks.iter().take(limit) {
                println!(
                    "{:>6}  {:<12}  {:<35} {}",
                    t.id,
                    t.isrc.as_deref().unwrap_or("-"),
                    truncate(&t.title, 35),
                    t.artist
                );
            }
            if tracks.len() > limit {
                println!("... and {} more", tracks.len() - limit);
            }
        }

        Commands::Match { title, artist, isrc } => {
            let record = RoyaltyRecord {
                isrc: isrc.as_deref().and_then(parser::normalize_isrc),
                title,
                artist,
                pro: Pro::Other,
                amount: 0.0,
                period: String::new(),
                plays: None,
                raw: Default::default(),
            };
            let resolution = config.resolver().resolve(&record, &db)
                .context("Lookup failed")?;

            if !resolution.is_matched() {
                println!("No match ({}).", resolution.unmatched_kind());
                return Ok(());
            }
            for hit in &resolution.hits {
                let score = hit.score.map(|s| format!(" score {s:.2}")).unwrap_or_default();
                println!(
                    "{:<6} #{} {} - {}{}",
                    hit.kind, hit.track.id, hit.track.title, hit.track.artist, score
                );
            }
        }

        Commands::Audit { paths, pro, user, jobs, file_name } => {
            let files = parser::statement_files(&paths);
            if files.is_empty() {
                anyhow::bail!("No statement files found. Pass CSV files or directories containing them.");
            }

            let aliases = config.alias_table();
            let mut batch = ParsedBatch::default();
            for file in &files {
                let parsed = parser::parse_file(file, pro, &aliases)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                println!(
                    "{}: {} records, {} rejected",
                    file.display(),
                    parsed.records.len(),
                    parsed.failures.len()
                );
                for failure in parsed.failures.iter().take(5) {
                    println!("  {failure}");
                }
                batch.extend(parsed);
            }
            if batch.invalid_isrcs > 0 {
                println!("Warning: {} records carry a malformed ISRC", batch.invalid_isrcs);
            }

            let file_name = file_name.unwrap_or_else(|| {
                files
                    .iter()
                    .filter_map(|f| f.file_name())
                    .map(|n| n.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            });

            let snapshot = Arc::new(CatalogSnapshot::load(&db).context("Failed to load catalog")?);
            if snapshot.is_empty() {
                log::warn!("Catalog is empty, every record will be unmatched");
            }

            let audit = audit::create_audit(&db, &user, &file_name, batch.records.len())
                .context("Failed to create audit")?;
            let options = AuditOptions {
                resolver: config.resolver(),
                jobs: if jobs > 0 { jobs } else { config.resolve_workers() },
                progress: true,
            };
            let handle = audit::spawn_audit(&db_path, snapshot, audit.id, batch.records, options)
                .context("Failed to start audit worker")?;
            let outcome = handle.join()
                .with_context(|| format!("Audit {} failed", audit.id))?;

            println!();
            println!(
                "Audit {} {}: {} matched, {:.2} missing",
                outcome.audit_id, outcome.status, outcome.totals.matches_found, outcome.totals.missing_amount
            );
            let summary = audit::get_audit_summary(&db, audit.id).context("Failed to load audit")?;
            println!();
            print_summary(&summary);
        }

        Commands::Summary { id } => {
            let summary = audit::get_audit_summary(&db, id).context("Failed to load audit")?;
            print_summary(&summary);
        }

        Commands::Audits { user, status, limit, offset } => {
            let audits = audit::list_user_audits(&db, &user, limit, offset, status)
                .context("Query failed")?;
            if audits.is_empty() {
                println!("No audits for {user}.");
                return Ok(());
            }
            print_audit_table(&audits);
        }

        Commands::Export { id, format, output } => {
            let format: ExportFormat = format.parse()?;
            let (name, content) = export::export_audit(&db, id, format)
                .context("Export failed")?;

            match output {
                Some(path) => {
                    let path = if path.is_dir() { path.join(&name) } else { path };
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {}", path.display());
                }
                None => print!("{content}"),
            }
        }

        Commands::Delete { id, user } => {
            if audit::delete_audit(&db, id, &user).context("Delete failed")? {
                println!("Deleted audit {id}.");
            } else {
                println!("Audit {id} not found for {user}.");
            }
        }

        Commands::Missing { user, days } => {
            let report = audit::missing_royalties_summary(&db, &user, days)
                .context("Query failed")?;

            println!("Missing royalties for {user} (last {} days)", report.period_days);
            println!("==========================================");
            println!("Completed audits:  {}", report.audits);
            println!("Total missing:     {:.2}", report.total_missing);
            println!("Unmatched claims:  {}", report.unmatched_count);

            if !report.by_pro.is_empty() {
                println!();
                println!("By PRO:");
                for (pro, amount) in &report.by_pro {
                    println!("  {:<8} {:>12.2}", pro, amount);
                }
            }

            if !report.entries.is_empty() {
                println!();
                println!("{:<30} {:<20} {:<7} {:>10}  {}", "Title", "Artist", "PRO", "Amount", "Audit date");
                println!("{}", "-".repeat(85));
                for e in &report.entries {
                    println!(
                        "{:<30} {:<20} {:<7} {:>10.2}  {}",
                        truncate(&e.title, 30),
                        truncate(&e.artist, 20),
                        e.pro,
                        e.amount,
                        e.audit_date.format("%Y-%m-%d")
                    );
                }
            }
        }

        Commands::Coverage { limit } => {
            let tracks: Vec<_> = db.get_all_tracks().context("Query failed")?
                .into_iter()
                .take(limit)
                .collect();
            if tracks.is_empty() {
                println!("Catalog is empty. Run `royalty-audit catalog-import` first.");
                return Ok(());
            }

            let client = ProClient::new(&config.scanner);
            let ascap = AscapSource::new(&client);
            let bmi = BmiSource::new(&client);
            let sources: [&dyn RepertorySource; 2] = [&ascap, &bmi];
            let scan = scanner::batch_scan(&tracks, &sources);

            for result in &scan.results {
                let found: Vec<String> = result.found_in
                    .iter()
                    .map(|(pro, n)| format!("{pro}:{n}"))
                    .collect();
                println!("{:<35} {}", truncate(&result.track.title, 35), found.join(" "));
                for issue in &result.issues {
                    println!("  [{}] {}", issue.severity, issue.message);
                }
                for (pro, err) in &result.errors {
                    println!("  [error] {pro}: {err}");
                }
            }
            println!();
            println!(
                "Coverage check complete: {} tracks scanned, {} issues found",
                scan.tracks_scanned, scan.issues_found
            );
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Catalog Statistics");
            println!("==================");
            println!("Total tracks:      {}", stats.total_tracks);
            println!("Tracks with ISRC:  {}", stats.tracks_with_isrc);
            println!("Total audits:      {}", stats.total_audits);
            println!("Total missing:     {:.2}", stats.total_missing);

            if !stats.audits_by_status.is_empty() {
                println!();
                println!("Audits:");
                for (status, count) in &stats.audits_by_status {
                    println!("  {:<12} {}", status, count);
                }
            }
        }
    }

    Ok(())
}

/// Print an audit with its statistics and matches.
fn print_summary(s: &AuditSummary) {
    let a = &s.audit;
    println!("Audit {}: {}", a.id, a.file_name);
    println!("Status:          {}", a.status);
    if let Some(user) = &s.user {
        println!("Owner:           {}", user.name.as_deref().unwrap_or(&user.id));
    }
    println!("Created:         {}", a.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = a.completed_at {
        println!("Completed:       {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("Tracks scanned:  {}", a.tracks_scanned);
    println!("Matches found:   {} ({:.1}%)", a.matches_found, s.match_rate);
    println!("Missing amount:  {:.2}", a.missing_amount);
    println!("Entries:         {} matched, {} unmatched", s.matched_count, s.unmatched_count);

    if !s.by_match_type.is_empty() {
        let kinds: Vec<String> = s.by_match_type.iter().map(|(k, n)| format!("{k}={n}")).collect();
        println!("By match type:   {}", kinds.join("  "));
    }
    if !s.by_pro.is_empty() {
        let pros: Vec<String> = s.by_pro.iter().map(|(p, n)| format!("{p}={n}")).collect();
        println!("By PRO:          {}", pros.join("  "));
    }

    if s.matches.is_empty() {
        return;
    }
    println!();
    println!("{:<30} {:<20} {:<7} {:>10}  {:<6} {}", "Title", "Artist", "PRO", "Amount", "Match", "Track");
    println!("{}", "-".repeat(95));
    for m in &s.matches {
        let (kind, track) = match &m.track {
            Some(t) => (m.match_kind.to_string(), format!("#{} {}", t.id, t.title)),
            None => ("-".to_string(), String::new()),
        };
        println!(
            "{:<30} {:<20} {:<7} {:>10.2}  {:<6} {}",
            truncate(&m.title, 30),
            truncate(&m.artist, 20),
            m.pro,
            m.amount_found,
            kind,
            track
        );
    }
}

/// Print a table of audits.
fn print_audit_table(audits: &[Audit]) {
    println!(
        "{:>6}  {:<10} {:<11} {:>7} {:>7} {:>12}  {}",
        "ID", "Date", "Status", "Tracks", "Matched", "Missing", "File"
    );
    println!("{}", "-".repeat(85));
    for a in audits {
        println!(
            "{:>6}  {:<10} {:<11} {:>7} {:>7} {:>12.2}  {}",
            a.id,
            a.created_at.format("%Y-%m-%d"),
            a.status,
            a.tracks_scanned,
            a.matches_found,
            a.missing_amount,
            a.file_name
        );
    }
}

/// Truncate long text for table columns.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let cut: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        s.to_string()
    }
}
