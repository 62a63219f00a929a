use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use mrc_adapters::{TmdbConfig, DEFAULT_LISTING_URL_TEMPLATE, DEFAULT_TMDB_BASE_URL};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_PUSHOVER_ENDPOINT: &str = "https://api.pushover.net/1/messages.json";
pub const DEFAULT_ALERT_TITLE: &str = "Movie Calendar Warning";

/// Which stored records the deletion sweep may remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionScope {
    /// Every stored title missing from this run's seen set.
    #[default]
    RunWide,
    /// Only titles released in a year that was reparsed this run.
    ReparsedYears,
}

impl FromStr for DeletionScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "run_wide" | "run-wide" => Ok(Self::RunWide),
            "reparsed_years" | "reparsed-years" => Ok(Self::ReparsedYears),
            other => bail!("unknown deletion scope `{other}` (expected run_wide or reparsed_years)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    File(PathBuf),
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PushoverConfig {
    pub enabled: bool,
    pub app_token: String,
    pub user_key: String,
    pub priority: i8,
    pub title: String,
    pub endpoint: String,
}

impl Default for PushoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_token: String::new(),
            user_key: String::new(),
            priority: 0,
            title: DEFAULT_ALERT_TITLE.to_string(),
            endpoint: DEFAULT_PUSHOVER_ENDPOINT.to_string(),
        }
    }
}

/// On-disk YAML layout. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub years: Option<Vec<i32>>,
    pub listing_url: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub calendar_path: Option<PathBuf>,
    pub store: Option<String>,
    pub store_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub deletion_scope: Option<DeletionScope>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub tmdb_bearer_token: Option<String>,
    pub tmdb_base_url: Option<String>,
    pub sync_cron: Option<String>,
    pub web_port: Option<u16>,
    pub pushover: PushoverConfig,
}

impl ConfigFile {
    /// Missing file reads as all defaults; unreadable or invalid YAML is an error.
    pub fn read(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub years: Vec<i32>,
    pub listing_url_template: String,
    pub state_dir: PathBuf,
    pub calendar_path: PathBuf,
    pub store: StoreConfig,
    pub deletion_scope: DeletionScope,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub tmdb: Option<TmdbConfig>,
    pub sync_cron: String,
    pub web_port: u16,
    pub pushover: PushoverConfig,
}

impl SyncConfig {
    /// Reads `MRC_CONFIG` (or `./config.yaml`), then applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MRC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = ConfigFile::read(&path)?;
        Self::resolve(file, |key| std::env::var(key).ok(), Utc::now().year())
    }

    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
        current_year: i32,
    ) -> Result<Self> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let years = match env("MRC_YEARS") {
            Some(raw) => parse_years(&raw).context("parsing MRC_YEARS")?,
            None => file
                .years
                .unwrap_or_else(|| vec![current_year - 1, current_year, current_year + 1]),
        };
        if years.is_empty() {
            bail!("no listing years configured");
        }

        let listing_url_template = env("MRC_LISTING_URL")
            .or(file.listing_url)
            .unwrap_or_else(|| DEFAULT_LISTING_URL_TEMPLATE.to_string());
        if !listing_url_template.contains("{year}") {
            bail!("listing url template `{listing_url_template}` has no {{year}} placeholder");
        }

        let state_dir = env("MRC_STATE_DIR")
            .map(PathBuf::from)
            .or(file.state_dir)
            .unwrap_or_else(|| PathBuf::from("./state"));
        let calendar_path = env("MRC_CALENDAR_PATH")
            .map(PathBuf::from)
            .or(file.calendar_path)
            .unwrap_or_else(|| PathBuf::from("./calendar.ics"));

        let store_kind = env("MRC_STORE")
            .or(file.store)
            .unwrap_or_else(|| "file".to_string());
        let store = match store_kind.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => StoreConfig::File(
                env("MRC_STORE_PATH")
                    .map(PathBuf::from)
                    .or(file.store_path)
                    .unwrap_or_else(|| state_dir.join("releases.json")),
            ),
            "postgres" | "pg" => StoreConfig::Postgres {
                database_url: env("DATABASE_URL")
                    .or(file.database_url)
                    .context("MRC_STORE=postgres requires DATABASE_URL")?,
            },
            other => bail!("unknown store backend `{other}` (expected file or postgres)"),
        };

        let deletion_scope = match env("MRC_DELETION_SCOPE") {
            Some(raw) => raw.parse().context("parsing MRC_DELETION_SCOPE")?,
            None => file.deletion_scope.unwrap_or_default(),
        };

        let http_timeout_secs = match env("MRC_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("parsing MRC_HTTP_TIMEOUT_SECS `{raw}`"))?,
            None => file.http_timeout_secs.unwrap_or(20),
        };

        let tmdb = env("TMDB_BEARER_TOKEN")
            .or(file.tmdb_bearer_token)
            .map(|bearer_token| TmdbConfig {
                base_url: env("TMDB_BASE_URL")
                    .or(file.tmdb_base_url)
                    .unwrap_or_else(|| DEFAULT_TMDB_BASE_URL.to_string()),
                bearer_token,
            });

        let web_port = match env("MRC_WEB_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("parsing MRC_WEB_PORT `{raw}`"))?,
            None => file.web_port.unwrap_or(8080),
        };

        Ok(Self {
            years,
            listing_url_template,
            state_dir,
            calendar_path,
            store,
            deletion_scope,
            user_agent: env("MRC_USER_AGENT")
                .or(file.user_agent)
                .unwrap_or_else(|| format!("mrc-bot/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs,
            tmdb,
            sync_cron: env("MRC_SYNC_CRON")
                .or(file.sync_cron)
                .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            web_port,
            pushover: file.pushover,
        })
    }
}

fn parse_years(raw: &str) -> Result<Vec<i32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i32>()
                .with_context(|| format!("invalid year `{part}`"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve_with(file: ConfigFile, vars: &[(&str, &str)]) -> Result<SyncConfig> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        SyncConfig::resolve(file, |key| vars.get(key).cloned(), 2025)
    }

    #[test]
    fn defaults_track_three_years_around_today() {
        let config = resolve_with(ConfigFile::default(), &[]).unwrap();
        assert_eq!(config.years, vec![2024, 2025, 2026]);
        assert_eq!(config.listing_url_template, DEFAULT_LISTING_URL_TEMPLATE);
        assert_eq!(config.state_dir, PathBuf::from("./state"));
        assert_eq!(config.calendar_path, PathBuf::from("./calendar.ics"));
        assert_eq!(
            config.store,
            StoreConfig::File(PathBuf::from("./state").join("releases.json"))
        );
        assert_eq!(config.deletion_scope, DeletionScope::RunWide);
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert_eq!(config.web_port, 8080);
        assert!(config.tmdb.is_none());
        assert!(!config.pushover.enabled);
        assert_eq!(config.pushover.title, DEFAULT_ALERT_TITLE);
    }

    #[test]
    fn environment_overrides_file_values() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
years: [2020]
state_dir: /var/lib/mrc
deletion_scope: reparsed_years
pushover:
  enabled: true
  app_token: tok
  user_key: usr
  priority: 1
"#,
        )
        .unwrap();
        let config = resolve_with(
            file,
            &[
                ("MRC_YEARS", "2025, 2026"),
                ("MRC_STORE", "postgres"),
                ("DATABASE_URL", "postgres://mrc@localhost/mrc"),
                ("TMDB_BEARER_TOKEN", "secret"),
                ("MRC_WEB_PORT", "9000"),
            ],
        )
        .unwrap();

        assert_eq!(config.years, vec![2025, 2026]);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/mrc"));
        assert_eq!(config.deletion_scope, DeletionScope::ReparsedYears);
        assert_eq!(
            config.store,
            StoreConfig::Postgres {
                database_url: "postgres://mrc@localhost/mrc".into()
            }
        );
        let tmdb = config.tmdb.unwrap();
        assert_eq!(tmdb.bearer_token, "secret");
        assert_eq!(tmdb.base_url, DEFAULT_TMDB_BASE_URL);
        assert_eq!(config.web_port, 9000);
        assert!(config.pushover.enabled);
        assert_eq!(config.pushover.priority, 1);
        assert_eq!(config.pushover.endpoint, DEFAULT_PUSHOVER_ENDPOINT);
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(resolve_with(ConfigFile::default(), &[("MRC_YEARS", "2025,next")]).is_err());
        assert!(resolve_with(ConfigFile::default(), &[("MRC_YEARS", " , ")]).is_err());
        assert!(resolve_with(ConfigFile::default(), &[("MRC_STORE", "postgres")]).is_err());
        assert!(resolve_with(ConfigFile::default(), &[("MRC_STORE", "sqlite")]).is_err());
        assert!(resolve_with(ConfigFile::default(), &[("MRC_DELETION_SCOPE", "none")]).is_err());
        assert!(
            resolve_with(ConfigFile::default(), &[("MRC_LISTING_URL", "https://x/schedule")]).is_err()
        );
    }

    #[test]
    fn config_file_missing_is_default_and_invalid_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ConfigFile::read(&dir.path().join("absent.yaml")).unwrap();
        assert!(missing.years.is_none());

        let bad = dir.path().join("config.yaml");
        std::fs::write(&bad, "years: [not, numbers\n").unwrap();
        assert!(ConfigFile::read(&bad).is_err());

        let unknown = dir.path().join("unknown.yaml");
        std::fs::write(&unknown, "yeers: [2025]\n").unwrap();
        assert!(ConfigFile::read(&unknown).is_err());
    }
}
