pub mod audit;
pub mod catalog;
pub mod config;
pub mod db;
pub mod export;
pub mod parser;
pub mod resolver;
pub mod scanner;
pub mod similarity;

/// Statement file extensions picked up when walking directories
pub const STATEMENT_EXTENSIONS: &[&str] = &["csv"];

/// Application name for XDG paths
pub const APP_NAME: &str = "royalty-audit";
