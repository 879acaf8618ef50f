use field_agent::fs::walker::normalize_extensions;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub archive_root: PathBuf,
    /// Extensions served to agents; empty means every file.
    pub extensions: Vec<String>,
    pub manifest_ttl: Duration,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            archive_root: PathBuf::from(
                std::env::var("ARCHIVE_ROOT").unwrap_or_else(|_| "/srv/archive".into()),
            ),
            extensions: std::env::var("ARCHIVE_EXTENSIONS")
                .map(|v| parse_extensions(&v))
                .unwrap_or_default(),
            manifest_ttl: Duration::from_secs(
                std::env::var("MANIFEST_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}

fn parse_extensions(raw: &str) -> Vec<String> {
    normalize_extensions(raw.split(','))
}
