use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::db::models::Pro;
use crate::parser::{AliasTable, Field};
use crate::resolver::Resolver;
use crate::similarity::DEFAULT_FUZZY_THRESHOLD;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults, the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Minimum Jaccard score for a fuzzy catalog match.
    pub fuzzy_threshold: f64,
    /// PRO repertory scanner settings.
    pub scanner: ScannerConfig,
    /// Extra statement column names.
    pub column_aliases: Vec<ColumnAliasConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            workers: 0,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            scanner: ScannerConfig::default(),
            column_aliases: Vec::new(),
        }
    }
}

/// PRO repertory scanner configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Delay between repertory requests in milliseconds.
    pub rate_limit_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: 1500,
            timeout_secs: 10,
            user_agent: concat!("royalty-audit/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// `[[column_aliases]]` entry: extra column names for one record field,
/// optionally only for one PRO's statements.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnAliasConfig {
    pub field: Field,
    pub names: Vec<String>,
    #[serde(default)]
    pub pro: Option<String>,
}

impl AppConfig {
    /// Load config from `~/.config/royalty-audit/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        match Self::from_toml(&contents) {
                            Ok(config) => {
                                log::info!("Loaded config from {}", path.display());
                                config
                            }
                            Err(e) => {
                                log::warn!(
                                    "Failed to parse {}: {}. Using defaults.",
                                    path.display(),
                                    e
                                );
                                Self::default()
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to read {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        Self::default()
                    }
                }
            }
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.fuzzy_threshold)
    }

    /// Built-in column aliases extended with the configured ones.
    /// Entries naming an unknown PRO are skipped with a warning.
    pub fn alias_table(&self) -> AliasTable {
        let mut table = AliasTable::default();
        for entry in &self.column_aliases {
            let pro = match entry.pro.as_deref().map(str::parse::<Pro>).transpose() {
                Ok(pro) => pro,
                Err(e) => {
                    log::warn!("Ignoring column aliases for {}: {e}", entry.field);
                    continue;
                }
            };
            table.add(entry.field, entry.names.iter().cloned(), pro);
        }
        table
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("royalty-audit.db")
    } else {
        // Fallback: current directory
        PathBuf::from("royalty-audit.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.fuzzy_threshold, 0.8);
        assert_eq!(config.workers, 0);
        assert!(config.resolve_workers() >= 1);
        assert_eq!(config.scanner.rate_limit_ms, 1500);
        assert_eq!(config.scanner.timeout_secs, 10);
        assert!(config.column_aliases.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(
            r#"
            db_path = "/tmp/audits.db"
            workers = 3
            fuzzy_threshold = 0.7

            [scanner]
            rate_limit_ms = 0

            [[column_aliases]]
            field = "amount"
            names = ["Net Payable"]

            [[column_aliases]]
            field = "title"
            names = ["Work Title"]
            pro = "bmi"
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/audits.db")));
        assert_eq!(config.resolve_workers(), 3);
        assert_eq!(config.resolver().threshold(), 0.7);
        assert_eq!(config.scanner.rate_limit_ms, 0);
        assert_eq!(config.scanner.timeout_secs, 10);

        let table = config.alias_table();
        let row: BTreeMap<String, String> = [
            ("Title".to_string(), "Generic".to_string()),
            ("Work Title".to_string(), "From BMI".to_string()),
            ("Net Payable".to_string(), "9.99".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(table.lookup(&row, Field::Title, Pro::Bmi), Some("From BMI"));
        assert_eq!(table.lookup(&row, Field::Title, Pro::Ascap), Some("Generic"));
        assert_eq!(table.lookup(&row, Field::Amount, Pro::Ascap), Some("9.99"));
    }

    #[test]
    fn test_unknown_pro_alias_skipped() {
        let config = AppConfig::from_toml(
            r#"
            [[column_aliases]]
            field = "artist"
            names = ["Composer"]
            pro = "KOMCA"
            "#,
        )
        .unwrap();
        let table = config.alias_table();
        assert_eq!(table.candidates(Field::Artist, Pro::Other).count(), 3);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(AppConfig::from_toml("[[column_aliases]]\nfield = \"currency\"\nnames = []\n").is_err());
    }
}
