//! Configuration management for the operator command line
//!
//! Values are layered: `conf/tessera.yml`, then `TESSERA_*` environment
//! variables, then command line flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use tessera_changeset::ChangesetOptions;
use tessera_common::validation::MAX_COMMENT_LENGTH;
use tessera_common::{PermissionLevel, StaticPermissions, UserContext};
use tessera_persistence::{
    ExternalDbPersistService, MemoryPersistService, PersistenceService, StorageMode,
};
use tessera_variation::HierarchyOptions;
use tessera_variation::cache::DEFAULT_CACHE_TTL;

use crate::commands::Command;
use crate::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/tessera.yml";

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "tessera-admin", version, about = "Operate Tessera changesets and variation hierarchies")]
pub struct Cli {
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: String,
    #[arg(long = "db-url", env = "DATABASE_URL")]
    pub database_url: Option<String>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    #[arg(long = "log-dir")]
    pub log_dir: Option<String>,
    /// Id of the user the command acts as
    #[arg(short = 'u', long = "user-id", default_value_t = 0)]
    pub user_id: i64,
    /// Act as a global administrator
    #[arg(long = "admin")]
    pub admin: bool,
    /// Service ids on which the user holds Admin
    #[arg(long = "service-admin", value_delimiter = ',')]
    pub service_admin: Vec<i64>,
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn user_context(&self) -> UserContext {
        if self.admin {
            return UserContext::global_admin(self.user_id);
        }
        let permissions = self
            .service_admin
            .iter()
            .fold(StaticPermissions::new(), |permissions, service_id| {
                permissions.grant_service(*service_id, PermissionLevel::Admin)
            });
        UserContext::new(self.user_id, Arc::new(permissions))
    }
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(config::File::with_name(&cli.config_file).required(false))
            .add_source(
                Environment::with_prefix("tessera")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(v) = &cli.database_url {
            builder = builder.set_override("db.url", v.as_str())?;
        }
        if let Some(v) = &cli.log_level {
            builder = builder.set_override("log.level", v.as_str())?;
        }
        if let Some(v) = &cli.log_dir {
            builder = builder
                .set_override("log.dir", v.as_str())?
                .set_override("log.file", true)?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn persistence_mode(&self) -> StorageMode {
        self.config
            .get_string("persistence.mode")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(StorageMode::ExternalDb)
    }

    pub async fn database_connection(&self) -> anyhow::Result<DatabaseConnection> {
        let max_connections = self.config.get_int("db.max_connections").unwrap_or(10) as u32;
        let min_connections = self.config.get_int("db.min_connections").unwrap_or(1) as u32;
        let connect_timeout = self
            .config
            .get_int("db.connect_timeout_secs")
            .unwrap_or(30) as u64;
        let sqlx_logging = self.config.get_bool("db.sqlx_logging").unwrap_or(false);

        let url = self.config.get_string("db.url")?;

        let mut opt = ConnectOptions::new(url);
        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .sqlx_logging(sqlx_logging);

        Ok(Database::connect(opt).await?)
    }

    pub async fn persistence(&self) -> anyhow::Result<Arc<dyn PersistenceService>> {
        Ok(match self.persistence_mode() {
            StorageMode::ExternalDb => {
                Arc::new(ExternalDbPersistService::new(self.database_connection().await?))
            }
            StorageMode::Memory => Arc::new(MemoryPersistService::new()),
        })
    }

    // ========================================================================
    // Core options
    // ========================================================================

    pub fn hierarchy_options(&self) -> HierarchyOptions {
        let cache_ttl = self
            .config
            .get_int("variation.cache_ttl_secs")
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .unwrap_or(DEFAULT_CACHE_TTL);
        HierarchyOptions { cache_ttl }
    }

    pub fn changeset_options(&self) -> ChangesetOptions {
        let max_comment_length = self
            .config
            .get_int("changeset.max_comment_length")
            .map(|len| len.max(1) as usize)
            .unwrap_or(MAX_COMMENT_LENGTH);
        ChangesetOptions { max_comment_length }
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        let level = self
            .config
            .get_string("log.level")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(tracing::Level::INFO);

        LoggingConfig {
            log_dir: self.config.get_string("log.dir").ok().map(PathBuf::from),
            console_output: self.config.get_bool("log.console").unwrap_or(true),
            file_logging: self.config.get_bool("log.file").unwrap_or(false),
            level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("tessera-admin").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let cli = parse(&[
            "--config",
            "does/not/exist.yml",
            "--db-url",
            "postgres://localhost/tessera",
            "--log-level",
            "debug",
            "health",
        ]);
        let configuration = Configuration::new(&cli).unwrap();

        assert_eq!(
            configuration.config.get_string("db.url").unwrap(),
            "postgres://localhost/tessera"
        );
        assert_eq!(configuration.logging_config().level, tracing::Level::DEBUG);
        assert_eq!(configuration.persistence_mode(), StorageMode::ExternalDb);
    }

    #[test]
    fn test_defaults_without_config_file() {
        let cli = parse(&["--config", "does/not/exist.yml", "health"]);
        let configuration = Configuration::new(&cli).unwrap();

        assert_eq!(configuration.hierarchy_options().cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(
            configuration.changeset_options().max_comment_length,
            MAX_COMMENT_LENGTH
        );
        let logging = configuration.logging_config();
        assert!(logging.console_output);
        assert!(!logging.file_logging);
    }

    #[test]
    fn test_log_dir_enables_file_logging() {
        let cli = parse(&["--config", "none.yml", "--log-dir", "/tmp/tessera", "health"]);
        let logging = Configuration::new(&cli).unwrap().logging_config();
        assert!(logging.file_logging);
        assert_eq!(logging.log_dir, Some(PathBuf::from("/tmp/tessera")));
    }

    #[test]
    fn test_user_context_from_flags() {
        let admin = parse(&["--admin", "-u", "4", "health"]).user_context();
        assert!(admin.is_global_admin);
        assert_eq!(admin.id, 4);

        let user = parse(&["-u", "5", "--service-admin", "10,11", "health"]).user_context();
        assert!(!user.is_global_admin);
        assert!(user.has_service_level(11, PermissionLevel::Admin));
        assert!(!user.has_service_level(12, PermissionLevel::Read));
    }
}
