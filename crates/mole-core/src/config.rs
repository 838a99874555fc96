use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Reconciliation cadence. Fixed; not read from config.
pub const RECONCILE_INTERVAL_SECS: u64 = 300;
/// Job id of the periodic reconciliation job.
pub const RELOAD_JOB_ID: &str = "reload_db_jobs";
/// Passphrase shipped as the default. Startup warns when it is still in use.
pub const DEFAULT_PASSPHRASE: &str = "a-default-key-that-should-be-changed-in-prod";

/// Top-level config (mole.toml + MOLE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoleConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Control store location (SQLite file shared with the admin backend).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Credential vault settings.
///
/// The passphrase must match the one the admin backend encrypts with.
/// Legacy override: `MOLE_ENCRYPTION_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            passphrase: default_passphrase(),
        }
    }
}

impl VaultConfig {
    pub fn uses_default_passphrase(&self) -> bool {
        self.passphrase == DEFAULT_PASSPHRASE
    }
}

/// Postgres → Postgres transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Maintenance role on the target server.
    /// Legacy override: `DEFAULT_PG_ADMIN_USER`.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    /// Legacy override: `DEFAULT_PG_ADMIN_PASSWORD`.
    #[serde(default)]
    pub admin_password: String,
    /// Directory for dump archives and CSV exports. Archives are kept.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Upper bound for any single external tool invocation.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// High-volume table copied via CSV instead of the archive.
    #[serde(default = "default_designated_table")]
    pub designated_table: String,
    /// Partitioning column of the designated table.
    #[serde(default = "default_time_column")]
    pub time_column: String,
    /// Extension installed on the target before restore.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Schemas never dumped from the source.
    #[serde(default = "default_excluded_schemas")]
    pub excluded_schemas: Vec<String>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            admin_user: default_admin_user(),
            admin_password: String::new(),
            work_dir: default_work_dir(),
            phase_timeout_secs: default_phase_timeout_secs(),
            designated_table: default_designated_table(),
            time_column: default_time_column(),
            extension: default_extension(),
            excluded_schemas: default_excluded_schemas(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Clock resolution for due-job detection.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mole/mole.db", home)
}
fn default_passphrase() -> String {
    DEFAULT_PASSPHRASE.to_string()
}
fn default_admin_user() -> String {
    "postgres".to_string()
}
fn default_work_dir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}
fn default_phase_timeout_secs() -> u64 {
    3600
}
fn default_designated_table() -> String {
    "public.sensor_readings".to_string()
}
fn default_time_column() -> String {
    "time".to_string()
}
fn default_extension() -> String {
    "timescaledb".to_string()
}
fn default_excluded_schemas() -> Vec<String> {
    [
        "_timescaledb_internal",
        "_timescaledb_catalog",
        "_timescaledb_config",
        "timescaledb_information",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_tick_millis() -> u64 {
    1000
}

impl MoleConfig {
    /// Load config from a TOML file with env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.mole/mole.toml
    ///
    /// `MOLE_SECTION__FIELD` overrides any field; the legacy variables
    /// `MOLE_ENCRYPTION_KEY`, `DEFAULT_PG_ADMIN_USER` and
    /// `DEFAULT_PG_ADMIN_PASSWORD` win over everything else.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MoleConfig = Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::MoleError::Config(e.to_string()))?;

        Ok(config)
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MOLE_").split("__"))
            .merge(legacy_env("MOLE_ENCRYPTION_KEY", "vault.passphrase"))
            .merge(legacy_env("DEFAULT_PG_ADMIN_USER", "postgres.admin_user"))
            .merge(legacy_env("DEFAULT_PG_ADMIN_PASSWORD", "postgres.admin_password"))
    }
}

/// Map a single un-prefixed environment variable onto a nested config key.
fn legacy_env(var: &'static str, key: &'static str) -> Env {
    Env::raw().only(&[var]).map(move |_| key.into())
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mole/mole.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        figment::Jail::expect_with(|_jail| {
            let config = MoleConfig::load(Some("missing.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.gateway.port, DEFAULT_PORT);
            assert_eq!(config.postgres.admin_user, "postgres");
            assert_eq!(config.postgres.excluded_schemas.len(), 4);
            assert!(config.vault.uses_default_passphrase());
            Ok(())
        });
    }

    #[test]
    fn toml_file_is_read() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "mole.toml",
                r#"
                [gateway]
                port = 9000

                [postgres]
                work_dir = "/var/lib/mole"
                phase_timeout_secs = 60
                "#,
            )?;
            let config = MoleConfig::load(Some("mole.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.gateway.port, 9000);
            assert_eq!(config.gateway.bind, DEFAULT_BIND);
            assert_eq!(config.postgres.work_dir, "/var/lib/mole");
            assert_eq!(config.postgres.phase_timeout_secs, 60);
            Ok(())
        });
    }

    #[test]
    fn nested_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("mole.toml", "[gateway]\nport = 9000\n")?;
            jail.set_env("MOLE_GATEWAY__PORT", "9100");
            jail.set_env("MOLE_POSTGRES__DESIGNATED_TABLE", "public.metrics");
            let config = MoleConfig::load(Some("mole.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.gateway.port, 9100);
            assert_eq!(config.postgres.designated_table, "public.metrics");
            Ok(())
        });
    }

    #[test]
    fn legacy_env_vars_are_honoured() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MOLE_ENCRYPTION_KEY", "s3cret");
            jail.set_env("DEFAULT_PG_ADMIN_USER", "admin");
            jail.set_env("DEFAULT_PG_ADMIN_PASSWORD", "hunter2");
            let config = MoleConfig::load(Some("missing.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.vault.passphrase, "s3cret");
            assert!(!config.vault.uses_default_passphrase());
            assert_eq!(config.postgres.admin_user, "admin");
            assert_eq!(config.postgres.admin_password, "hunter2");
            Ok(())
        });
    }
}
