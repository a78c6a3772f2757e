// dbstream/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable consulted when config.json carries no password.
pub const PASSWORD_ENV: &str = "DATABASE_PASSWORD";
const DEFAULT_BACKUP_DIR: &str = "~/BACKUP";
const DEFAULT_HOST: &str = "localhost";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDatabaseConfig {
    pub kind: Option<String>,
    pub host: Option<String>,
    pub port: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database: Option<RawDatabaseConfig>,
    pub backup_dir: Option<PathBuf>,
    pub backup_format: Option<String>,
    pub restore_file: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Postgres,
    MySql,
}

impl DatabaseKind {
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseKind::Postgres => 5432,
            DatabaseKind::MySql => 3306,
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::Postgres => f.write_str("postgres"),
            DatabaseKind::MySql => f.write_str("mysql"),
        }
    }
}

impl FromStr for DatabaseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(DatabaseKind::Postgres),
            "mysql" => Ok(DatabaseKind::MySql),
            other @ ("mongodb" | "sqlite") => {
                anyhow::bail!("{} is not supported yet", other)
            }
            other => anyhow::bail!("Unknown database kind: {:?}", other),
        }
    }
}

/// Wire format the dump tool writes before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    #[default]
    Plain,
    Custom,
    Tar,
}

impl DumpFormat {
    pub fn as_flag(&self) -> &'static str {
        match self {
            DumpFormat::Plain => "plain",
            DumpFormat::Custom => "custom",
            DumpFormat::Tar => "tar",
        }
    }
}

impl FromStr for DumpFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "p" => Ok(DumpFormat::Plain),
            "custom" | "c" => Ok(DumpFormat::Custom),
            "tar" | "t" => Ok(DumpFormat::Tar),
            other => anyhow::bail!("Unknown backup format: {:?} (expected plain, custom or tar)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Backup => f.write_str("backup"),
            Operation::Restore => f.write_str("restore"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ConnectionConfig {
    /// Same server and credentials, different database.
    pub fn with_database(&self, database: &str) -> Self {
        ConnectionConfig {
            database: database.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub path: PathBuf,
    pub format: DumpFormat,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub backup_dir: PathBuf,
    pub format: DumpFormat,
    pub restore_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config, std::env::var(PASSWORD_ENV).ok())
    }

    /// Validates the raw JSON. `env_password` is used when the JSON has no password.
    pub fn from_raw(raw: RawJsonConfig, env_password: Option<String>) -> Result<Self> {
        let db = raw
            .database
            .context("database section must be set in config.json")?;

        let kind: DatabaseKind = db
            .kind
            .as_deref()
            .context("database.kind must be set in config.json")?
            .parse()?;

        let user = non_empty(db.user, "database.user")?;
        let database = non_empty(db.name, "database.name")?;
        let host = db
            .host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match db.port {
            None => kind.default_port(),
            Some(p) if (1..=65535).contains(&p) => p as u16,
            Some(p) => anyhow::bail!("database.port must be a number between 1 and 65535, got {}", p),
        };

        let password = db.password.or(env_password).unwrap_or_default();

        let format = match raw.backup_format.as_deref() {
            Some(f) => f.parse()?,
            None => DumpFormat::default(),
        };
        if kind == DatabaseKind::MySql && format != DumpFormat::Plain {
            anyhow::bail!(
                "backup_format {:?} is only available for postgres; mysql dumps are always plain",
                format.as_flag()
            );
        }

        if raw.timeout_secs == Some(0) {
            anyhow::bail!("timeout_secs must be greater than zero when set");
        }

        Ok(AppConfig {
            connection: ConnectionConfig {
                kind,
                host,
                port,
                user,
                password,
                database,
            },
            backup_dir: raw
                .backup_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR)),
            format,
            restore_file: raw.restore_file,
            timeout: raw.timeout_secs.map(Duration::from_secs),
        })
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    let value = value.with_context(|| format!("{} must be set in config.json", field))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        anyhow::bail!("{} must not be empty", field);
    }
    Ok(trimmed.to_string())
}
