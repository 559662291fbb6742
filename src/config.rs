/// Configuration management for the GAL resolver
use crate::error::{ResolverError, ResolverResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub resolver: ResolverConfig,
    pub ldap: LdapConfig,
    pub logging: LoggingConfig,
}

/// HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub run_migrations: bool,
    pub directory_mode: DirectoryMode,
    /// Snapshot rebuild interval in seconds
    pub snapshot_refresh_secs: u64,
}

/// How identity lookups reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryMode {
    /// Every lookup is a live query against the view
    Sql,
    /// Lookups are served from a periodically rebuilt in-memory copy
    Snapshot,
}

impl FromStr for DirectoryMode {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Ok(DirectoryMode::Sql),
            "snapshot" => Ok(DirectoryMode::Snapshot),
            other => Err(ResolverError::Config(format!(
                "Unknown directory mode '{}' (expected 'sql' or 'snapshot')",
                other
            ))),
        }
    }
}

/// Membership resolver limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub timeout_ms: u64,
    pub max_depth: usize,
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_depth: 32,
        }
    }
}

/// LDAP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    pub enabled: bool,
    pub hostname: String,
    pub port: u16,
    /// Suffix appended to every DN the listener emits
    pub base_dn: String,
    /// A connection with no complete request for this long is closed
    pub idle_timeout_secs: u64,
    /// Connections served at once; further accepts wait for a slot
    pub max_connections: usize,
}

impl LdapConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> ResolverResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("GAL_HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_var("GAL_PORT", 8080u16)?;

        let database_path: PathBuf = env::var("GAL_DATABASE_PATH")
            .unwrap_or_else(|_| "./data/gal.sqlite".to_string())
            .into();
        let max_connections = parse_var("GAL_DB_MAX_CONNECTIONS", 10u32)?;
        let run_migrations = parse_var("GAL_RUN_MIGRATIONS", true)?;
        let directory_mode = env::var("GAL_DIRECTORY_MODE")
            .unwrap_or_else(|_| "sql".to_string())
            .parse()?;
        let snapshot_refresh_secs = parse_var("GAL_SNAPSHOT_REFRESH_SECS", 60u64)?;

        let timeout_ms = parse_var("GAL_RESOLVE_TIMEOUT_MS", 5000u64)?;
        let max_depth = parse_var("GAL_MAX_EXPANSION_DEPTH", 32usize)?;

        let ldap_enabled = parse_var("GAL_LDAP_ENABLED", false)?;
        let ldap_hostname =
            env::var("GAL_LDAP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let ldap_port = parse_var("GAL_LDAP_PORT", 3893u16)?;
        let base_dn = env::var("GAL_LDAP_BASE_DN").unwrap_or_else(|_| "dc=schule,dc=lan".to_string());
        let idle_timeout_secs = parse_var("GAL_LDAP_IDLE_TIMEOUT_SECS", 300u64)?;
        let ldap_max_connections = parse_var("GAL_LDAP_MAX_CONNECTIONS", 256usize)?;

        let level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "gal_resolver=debug,tower_http=debug".to_string());
        let json = env::var("GAL_LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig { hostname, port },
            storage: StorageConfig {
                database_path,
                max_connections,
                run_migrations,
                directory_mode,
                snapshot_refresh_secs,
            },
            resolver: ResolverConfig {
                timeout_ms,
                max_depth,
            },
            ldap: LdapConfig {
                enabled: ldap_enabled,
                hostname: ldap_hostname,
                port: ldap_port,
                base_dn,
                idle_timeout_secs,
                max_connections: ldap_max_connections,
            },
            logging: LoggingConfig { level, json },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> ResolverResult<()> {
        if self.service.hostname.is_empty() {
            return Err(ResolverError::Config("Hostname cannot be empty".to_string()));
        }

        if self.storage.max_connections == 0 {
            return Err(ResolverError::Config(
                "Database pool needs at least one connection".to_string(),
            ));
        }

        if self.resolver.timeout_ms == 0 {
            return Err(ResolverError::Config(
                "Resolve timeout must be greater than zero".to_string(),
            ));
        }

        if self.resolver.max_depth == 0 {
            return Err(ResolverError::Config(
                "Maximum expansion depth must be at least 1".to_string(),
            ));
        }

        if self.storage.directory_mode == DirectoryMode::Snapshot
            && self.storage.snapshot_refresh_secs == 0
        {
            return Err(ResolverError::Config(
                "Snapshot refresh interval must be greater than zero".to_string(),
            ));
        }

        if self.ldap.enabled && (self.ldap.idle_timeout_secs == 0 || self.ldap.max_connections == 0) {
            return Err(ResolverError::Config(
                "LDAP idle timeout and connection limit must be greater than zero".to_string(),
            ));
        }

        if self.ldap.enabled && self.ldap.port == self.service.port
            && self.ldap.hostname == self.service.hostname
        {
            return Err(ResolverError::Config(
                "LDAP listener and HTTP server cannot share an address".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read an environment variable, falling back to `default` when unset
fn parse_var<T: FromStr>(name: &str, default: T) -> ResolverResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ResolverError::Config(format!("Invalid value for {}: '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        service: ServiceConfig {
            hostname: "127.0.0.1".to_string(),
            port: 8080,
        },
        storage: StorageConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            run_migrations: false,
            directory_mode: DirectoryMode::Sql,
            snapshot_refresh_secs: 60,
        },
        resolver: ResolverConfig::default(),
        ldap: LdapConfig {
            enabled: false,
            hostname: "127.0.0.1".to_string(),
            port: 3893,
            base_dn: "dc=schule,dc=lan".to_string(),
            idle_timeout_secs: 300,
            max_connections: 16,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            json: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_mode_parsing() {
        assert_eq!("sql".parse::<DirectoryMode>().unwrap(), DirectoryMode::Sql);
        assert_eq!(
            " Snapshot ".parse::<DirectoryMode>().unwrap(),
            DirectoryMode::Snapshot
        );
        assert!("ldap".parse::<DirectoryMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_depth() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.resolver.max_depth = 0;
        assert!(matches!(config.validate(), Err(ResolverError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_ldap_listener() {
        let mut config = test_config();
        config.ldap.enabled = true;
        config.ldap.port = 3893;
        assert!(config.validate().is_ok());

        config.ldap.max_connections = 0;
        assert!(matches!(config.validate(), Err(ResolverError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_shared_listener_address() {
        let mut config = test_config();
        config.ldap.enabled = true;
        config.ldap.port = config.service.port;
        assert!(config.validate().is_err());
    }
}
