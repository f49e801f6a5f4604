pub mod aliases;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

use crate::db::models::{Pro, RoyaltyRecord};
pub use aliases::{AliasTable, Field};

/// The statement file as a whole could not be read.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Why a single row was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    #[error("no amount column ({0})")]
    MissingAmount(String),
    #[error("amount {0:?} is not a number")]
    InvalidAmount(String),
    #[error("amount {0:?} is negative")]
    NegativeAmount(String),
    #[error("play count {0:?} is not a whole number")]
    InvalidPlays(String),
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// A rejected statement row, kept for reporting.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("line {line}: {reason}")]
pub struct ParseFailure {
    /// 1-based line in the source file (header is line 1).
    pub line: u64,
    pub reason: RowError,
    pub row: BTreeMap<String, String>,
}

/// Parsed statement: good records plus the rows that were rejected.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<RoyaltyRecord>,
    pub failures: Vec<ParseFailure>,
    /// Records whose ISRC doesn't look like a valid ISRC (kept anyway).
    pub invalid_isrcs: usize,
}

// CC-XXX-YY-NNNNN once separators are stripped
static ISRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}[A-Z0-9]{3}[0-9]{7}$").expect("valid regex"));

/// Canonical ISRC form: separators and whitespace removed, uppercase.
/// Returns `None` for a blank value.
pub fn normalize_isrc(raw: &str) -> Option<String> {
    let isrc: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_uppercase)
        .collect();
    if isrc.is_empty() { None } else { Some(isrc) }
}

/// Whether a normalized ISRC has the standard 12-character shape.
pub fn is_valid_isrc(isrc: &str) -> bool {
    ISRC_RE.is_match(isrc)
}

/// Best-effort money parsing: tolerates currency symbols and codes,
/// thousands separators and a decimal comma.
pub fn coerce_amount(raw: &str) -> Result<f64, RowError> {
    let trimmed = raw
        .trim()
        .trim_matches(|c: char| c.is_whitespace() || c.is_alphabetic() || is_currency_symbol(c))
        .trim();

    let negative = trimmed.starts_with('-') || (trimmed.starts_with('(') && trimmed.ends_with(')'));
    let body = trimmed
        .trim_start_matches('-')
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim_matches(|c: char| c.is_whitespace() || is_currency_symbol(c));

    let digits: String = body.chars().filter(|c| !c.is_whitespace() && *c != '_').collect();
    let normalized = normalize_separators(&digits).ok_or_else(|| RowError::InvalidAmount(raw.to_string()))?;

    let value: f64 = normalized
        .parse()
        .map_err(|_| RowError::InvalidAmount(raw.to_string()))?;
    if !value.is_finite() {
        return Err(RowError::InvalidAmount(raw.to_string()));
    }
    if negative && value != 0.0 {
        return Err(RowError::NegativeAmount(raw.to_string()));
    }
    Ok(value.abs())
}

fn is_currency_symbol(c: char) -> bool {
    matches!(c, '$' | '€' | '£' | '¥' | '₩' | '₹' | '¤')
}

/// Rewrite grouping and decimal marks into a plain `1234.56` form.
///
/// With both `.` and `,` present the last one is the decimal mark and must
/// occur once. Returns `None` when the marks are ambiguous.
fn normalize_separators(body: &str) -> Option<String> {
    match (body.rfind('.'), body.rfind(',')) {
        (Some(dot), Some(comma)) => {
            let (decimal, group) = if comma > dot { (',', '.') } else { ('.', ',') };
            if body.matches(decimal).count() != 1 {
                return None;
            }
            Some(body.replace(group, "").replace(decimal, "."))
        }
        (None, Some(_)) if body.matches(',').count() == 1 && decimal_comma(body) => {
            Some(body.replace(',', "."))
        }
        _ => Some(body.replace(',', "")),
    }
}

/// "12,50" is a decimal comma; "1,250" is a thousands separator.
fn decimal_comma(body: &str) -> bool {
    body.rsplit(',')
        .next()
        .is_some_and(|frac| (1..=2).contains(&frac.len()) && frac.chars().all(|c| c.is_ascii_digit()))
}

fn parse_plays(raw: &str) -> Result<i64, RowError> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, ',' | '_' | ' ')).collect();
    match cleaned.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(n),
        _ => Err(RowError::InvalidPlays(raw.to_string())),
    }
}

/// Normalize one statement row into a royalty record.
pub fn parse_row(
    row: &BTreeMap<String, String>,
    pro: Pro,
    aliases: &AliasTable,
) -> Result<RoyaltyRecord, RowError> {
    let get = |field| aliases.lookup(row, field, pro);

    let amount = match get(Field::Amount) {
        Some(raw) => coerce_amount(raw)?,
        None => {
            let tried: Vec<&str> = aliases.candidates(Field::Amount, pro).collect();
            return Err(RowError::MissingAmount(tried.join(", ")));
        }
    };

    let plays = get(Field::Plays).map(parse_plays).transpose()?;

    Ok(RoyaltyRecord {
        isrc: get(Field::Isrc).and_then(normalize_isrc),
        title: get(Field::Title).unwrap_or_default().to_string(),
        artist: get(Field::Artist).unwrap_or_default().to_string(),
        pro,
        amount,
        period: get(Field::Period).unwrap_or_default().to_string(),
        plays,
        raw: row.clone(),
    })
}

/// Parse many rows; bad rows are collected, never fatal.
/// `rows` yields `(line, row)` pairs.
pub fn parse_rows<I>(rows: I, pro: Pro, aliases: &AliasTable) -> ParsedBatch
where
    I: IntoIterator<Item = (u64, BTreeMap<String, String>)>,
{
    let mut batch = ParsedBatch::default();
    for (line, row) in rows {
        match parse_row(&row, pro, aliases) {
            Ok(record) => batch.push(record),
            Err(reason) => {
                log::warn!("Skipping line {line}: {reason}");
                batch.failures.push(ParseFailure { line, reason, row });
            }
        }
    }
    batch
}

impl ParsedBatch {
    fn push(&mut self, record: RoyaltyRecord) {
        if let Some(isrc) = &record.isrc {
            if !is_valid_isrc(isrc) {
                log::debug!("Suspicious ISRC {isrc:?} for \"{}\"", record.title);
                self.invalid_isrcs += 1;
            }
        }
        self.records.push(record);
    }

    /// Merge another batch into this one (multi-file audits).
    pub fn extend(&mut self, other: ParsedBatch) {
        self.records.extend(other.records);
        self.failures.extend(other.failures);
        self.invalid_isrcs += other.invalid_isrcs;
    }
}

/// Parse a CSV statement with a header row.
///
/// Unreadable input or a bad header fails the whole file; a bad data row
/// becomes a [`ParseFailure`].
pub fn parse_csv<R: Read>(reader: R, pro: Pro, aliases: &AliasTable) -> Result<ParsedBatch, ParseError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();

    let mut rows = Vec::new();
    let mut malformed = Vec::new();
    for result in rdr.records() {
        match result {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or(0);
                let row: BTreeMap<String, String> = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect();
                rows.push((line, row));
            }
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                malformed.push(ParseFailure {
                    line,
                    reason: RowError::Malformed(e.to_string()),
                    row: BTreeMap::new(),
                });
            }
        }
    }

    let mut batch = parse_rows(rows, pro, aliases);
    batch.failures.extend(malformed);
    batch.failures.sort_by_key(|f| f.line);
    Ok(batch)
}

pub fn parse_file(path: &Path, pro: Pro, aliases: &AliasTable) -> Result<ParsedBatch, ParseError> {
    let file = std::fs::File::open(path)?;
    parse_csv(file, pro, aliases)
}

/// Statement files under `paths`: files are taken as given, directories
/// are walked for files with a [`crate::STATEMENT_EXTENSIONS`] extension.
pub fn statement_files<P: AsRef<Path>>(paths: &[P]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.is_file() {
            files.push(path.to_path_buf());
            continue;
        }
        for entry in WalkDir::new(path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if crate::STATEMENT_EXTENSIONS.contains(&ext.as_str()) {
                files.push(entry.into_path());
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_row_with_aliases() {
        let r = row(&[
            ("Song Title", "Midnight Drive"),
            ("Writer", "Jay Rock"),
            ("Royalty", "$1,234.50"),
            ("Statement Period", "2024-Q1"),
            ("isrc", "us-tde-24-00123"),
            ("Streams", "12,000"),
        ]);
        let rec = parse_row(&r, Pro::Bmi, &AliasTable::default()).unwrap();
        assert_eq!(rec.title, "Midnight Drive");
        assert_eq!(rec.artist, "Jay Rock");
        assert_eq!(rec.amount, 1234.5);
        assert_eq!(rec.period, "2024-Q1");
        assert_eq!(rec.isrc.as_deref(), Some("USTDE2400123"));
        assert_eq!(rec.plays, Some(12_000));
        assert_eq!(rec.pro, Pro::Bmi);
        assert_eq!(rec.raw, r);
    }

    #[test]
    fn test_optional_fields_default() {
        let rec = parse_row(&row(&[("Amount", "3")]), Pro::Ascap, &AliasTable::default()).unwrap();
        assert_eq!(rec.isrc, None);
        assert_eq!(rec.title, "");
        assert_eq!(rec.artist, "");
        assert_eq!(rec.period, "");
        assert_eq!(rec.plays, None);
    }

    #[test]
    fn test_missing_amount_fails() {
        let err = parse_row(&row(&[("Title", "Song")]), Pro::Ascap, &AliasTable::default()).unwrap_err();
        assert_eq!(err, RowError::MissingAmount("Amount, Royalty, earnings".into()));
    }

    #[test]
    fn test_bad_plays_fails() {
        let r = row(&[("Amount", "1"), ("Plays", "lots")]);
        let err = parse_row(&r, Pro::Ascap, &AliasTable::default()).unwrap_err();
        assert!(matches!(err, RowError::InvalidPlays(_)));
    }

    #[test]
    fn test_coerce_amount() {
        assert_eq!(coerce_amount("100").unwrap(), 100.0);
        assert_eq!(coerce_amount(" USD 1,250.75 ").unwrap(), 1250.75);
        assert_eq!(coerce_amount("12,50 €").unwrap(), 12.5);
        assert_eq!(coerce_amount("£0.07").unwrap(), 0.07);
        assert_eq!(coerce_amount("1,250").unwrap(), 1250.0);
        assert_eq!(coerce_amount("-0").unwrap(), 0.0);
        assert!(matches!(coerce_amount("-5.00"), Err(RowError::NegativeAmount(_))));
        assert!(matches!(coerce_amount("(5.00)"), Err(RowError::NegativeAmount(_))));
        assert!(matches!(coerce_amount("n/a"), Err(RowError::InvalidAmount(_))));
        assert!(matches!(coerce_amount("inf"), Err(RowError::InvalidAmount(_))));
        assert!(matches!(coerce_amount("$"), Err(RowError::InvalidAmount(_))));
    }

    #[test]
    fn test_coerce_amount_european_grouping() {
        assert_eq!(coerce_amount("1.234,56").unwrap(), 1234.56);
        assert_eq!(coerce_amount("€ 1.234.567,8").unwrap(), 1234567.8);
        assert_eq!(coerce_amount("1 234,56").unwrap(), 1234.56);
        assert_eq!(coerce_amount("1\u{a0}234,56").unwrap(), 1234.56);
        assert_eq!(coerce_amount("1,234,567.89").unwrap(), 1234567.89);
        assert!(matches!(coerce_amount("1,234.5,6"), Err(RowError::InvalidAmount(_))));
        assert!(matches!(coerce_amount("1.234.56"), Err(RowError::InvalidAmount(_))));
    }

    #[test]
    fn test_isrc_helpers() {
        assert_eq!(normalize_isrc(" us-abc-24-00001 ").as_deref(), Some("USABC2400001"));
        assert_eq!(normalize_isrc("  "), None);
        assert!(is_valid_isrc("USABC2400001"));
        assert!(!is_valid_isrc("USABC24"));
        assert!(!is_valid_isrc("12ABC2400001"));
    }

    #[test]
    fn test_one_bad_row_in_ten() {
        let mut csv = String::from("Title,Artist,Amount\n");
        for i in 0..10 {
            if i == 4 {
                csv.push_str("Broken,Someone,twelve dollars\n");
            } else {
                csv.push_str(&format!("Song {i},Artist {i},{i}.50\n"));
            }
        }
        let batch = parse_csv(csv.as_bytes(), Pro::Ascap, &AliasTable::default()).unwrap();
        assert_eq!(batch.records.len(), 9);
        assert_eq!(batch.failures.len(), 1);
        let failure = &batch.failures[0];
        assert_eq!(failure.line, 6);
        assert!(matches!(failure.reason, RowError::InvalidAmount(_)));
        assert_eq!(failure.row.get("Title").map(String::as_str), Some("Broken"));
    }

    #[test]
    fn test_short_rows_are_tolerated() {
        let csv = "Title,Artist,Amount,Plays\nSong,Band,5\n";
        let batch = parse_csv(csv.as_bytes(), Pro::Prs, &AliasTable::default()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].plays, None);
    }

    #[test]
    fn test_invalid_isrc_counted_not_rejected() {
        let csv = "ISRC,Title,Artist,Amount\nNOT-AN-ISRC,Song,Band,5\nUSABC2400001,Song,Band,5\n";
        let batch = parse_csv(csv.as_bytes(), Pro::Prs, &AliasTable::default()).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.invalid_isrcs, 1);
        assert_eq!(batch.records[0].isrc.as_deref(), Some("NOTANISRC"));
    }

    #[test]
    fn test_statement_files_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2024").join("q1");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("bmi.CSV"), "Amount\n1\n").unwrap();
        std::fs::write(dir.path().join("ascap.csv"), "Amount\n1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore").unwrap();
        let explicit = dir.path().join("notes.txt");

        let found = statement_files(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv"))));

        // Explicit files are kept whatever their extension
        assert_eq!(statement_files(&[explicit.clone()]), vec![explicit]);
    }

    #[test]
    fn test_parse_file_missing_is_io_error() {
        let err = parse_file(Path::new("/nonexistent/statement.csv"), Pro::Bmi, &AliasTable::default()).unwrap_err();
        assert!(matches!(err, ParseError::Io(_)));
    }

    #[test]
    fn test_extend_merges_batches() {
        let a = parse_csv("Amount\n1\nx\n".as_bytes(), Pro::Bmi, &AliasTable::default()).unwrap();
        let mut b = parse_csv("Amount\n2\n".as_bytes(), Pro::Bmi, &AliasTable::default()).unwrap();
        b.extend(a);
        assert_eq!(b.records.len(), 2);
        assert_eq!(b.failures.len(), 1);
    }
}
