use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::tickets::code::is_valid_prefix;
use crate::tickets::{CryptoError, KeyRing, TicketSettings};

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::SecurityHeaders;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error(transparent)]
    Keys(#[from] CryptoError),
}

pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

/// Start-up configuration. Read once; key material moves into the [`KeyRing`].
#[derive(Debug)]
pub struct Config {
    pub database: DatabaseConfig,
    pub bind_addr: SocketAddr,
    pub keys: KeyRing,
    pub code_prefix: String,
    pub default_scan_window_minutes: u32,
    pub default_post_window_minutes: u32,
    pub tickets: TicketSettings,
    pub cors_allowed_origins: Vec<String>,
    pub production: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let signing_key = vars.required("TICKET_SIGNING_KEY")?;
        let metadata_key = vars.required("TICKET_METADATA_KEY")?;
        let mut keys = KeyRing::new(
            vars.parse("TICKET_SIGNING_KEY_VERSION", 1u8)?,
            signing_key.into_bytes(),
            metadata_key.into_bytes(),
        )?;
        if let Some(raw) = vars.optional("TICKET_PREVIOUS_SIGNING_KEYS") {
            for (version, key) in parse_previous_keys(&raw)? {
                keys = keys.with_previous(version, key)?;
            }
        }

        let code_prefix = vars
            .optional("TICKET_CODE_PREFIX")
            .unwrap_or_else(|| "CP".to_string());
        if !is_valid_prefix(&code_prefix) {
            return Err(ConfigError::Invalid {
                name: "TICKET_CODE_PREFIX",
                reason: "expected 1-8 uppercase letters or digits".to_string(),
            });
        }

        let tickets = TicketSettings {
            code_max_attempts: vars.parse("TICKET_CODE_MAX_ATTEMPTS", 5)?,
            scan_history_limit: vars.parse("SCAN_HISTORY_LIMIT", 20)?,
            bulk_max_items: vars.parse("BULK_MAX_ITEMS", 100)?,
            bulk_concurrency: vars.parse("BULK_CONCURRENCY", 8)?,
            collaborator_timeout: Duration::from_millis(
                vars.parse("COLLABORATOR_TIMEOUT_MS", 2000)?,
            ),
        };

        Ok(Self {
            database: DatabaseConfig {
                url: vars.required("DATABASE_URL")?,
                max_connections: vars.parse("DATABASE_MAX_CONNECTIONS", 5)?,
                acquire_timeout: Duration::from_millis(
                    vars.parse("DATABASE_ACQUIRE_TIMEOUT_MS", 2000)?,
                ),
            },
            bind_addr: vars.parse("BIND_ADDR", parse_default(DEFAULT_BIND_ADDR)?)?,
            keys,
            code_prefix,
            default_scan_window_minutes: vars.parse("DEFAULT_SCAN_WINDOW_MINUTES", 30)?,
            default_post_window_minutes: vars.parse("DEFAULT_POST_WINDOW_MINUTES", 120)?,
            tickets,
            cors_allowed_origins: split_list(
                &vars
                    .optional("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string()),
            ),
            production: vars
                .optional("RUST_ENV")
                .is_some_and(|v| v.eq_ignore_ascii_case("production")),
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(name) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

fn parse_default(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
        name: "BIND_ADDR",
        reason: e.to_string(),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `version:key` pairs separated by commas.
fn parse_previous_keys(raw: &str) -> Result<Vec<(u8, Vec<u8>)>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            let invalid = |reason: &str| ConfigError::Invalid {
                name: "TICKET_PREVIOUS_SIGNING_KEYS",
                reason: reason.to_string(),
            };
            let (version, key) = entry
                .split_once(':')
                .ok_or_else(|| invalid("expected version:key"))?;
            let version = version
                .trim()
                .parse::<u8>()
                .map_err(|_| invalid("key version must be 0-255"))?;
            Ok((version, key.as_bytes().to_vec()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SIGNING: &str = "0123456789abcdef0123456789abcdef";
    const METADATA: &str = "fedcba9876543210fedcba9876543210";

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATABASE_URL", "postgres://localhost/campus"),
            ("TICKET_SIGNING_KEY", SIGNING),
            ("TICKET_METADATA_KEY", METADATA),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&base())).unwrap();
        assert_eq!(config.bind_addr.port(), 3001);
        assert_eq!(config.code_prefix, "CP");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.tickets.bulk_max_items, 100);
        assert_eq!(config.tickets.collaborator_timeout, Duration::from_millis(2000));
        assert_eq!(config.default_scan_window_minutes, 30);
        assert_eq!(config.default_post_window_minutes, 120);
        assert_eq!(config.keys.current_version(), 1);
        assert_eq!(config.cors_allowed_origins.len(), 2);
        assert!(!config.production);
    }

    #[test]
    fn test_missing_signing_key() {
        let vars: Vec<_> = base()
            .into_iter()
            .filter(|(k, _)| *k != "TICKET_SIGNING_KEY")
            .collect();
        assert!(matches!(
            Config::from_lookup(lookup(&vars)),
            Err(ConfigError::Missing("TICKET_SIGNING_KEY"))
        ));
    }

    #[test]
    fn test_short_key_is_rejected() {
        let mut vars = base();
        // Later entries win in the lookup map.
        vars.push(("TICKET_METADATA_KEY", "short"));
        assert!(matches!(
            Config::from_lookup(lookup(&vars)),
            Err(ConfigError::Keys(CryptoError::KeyTooShort { .. }))
        ));
    }

    #[test]
    fn test_previous_keys_are_loaded() {
        let previous = format!("1:{SIGNING}");
        let mut vars: Vec<(&str, &str)> = base();
        vars.push(("TICKET_SIGNING_KEY_VERSION", "2"));
        vars.push(("TICKET_PREVIOUS_SIGNING_KEYS", previous.as_str()));

        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.keys.current_version(), 2);
        assert_eq!(config.keys.versions().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_malformed_values_name_the_variable() {
        let mut vars = base();
        vars.push(("BULK_MAX_ITEMS", "lots"));
        match Config::from_lookup(lookup(&vars)) {
            Err(ConfigError::Invalid { name, .. }) => assert_eq!(name, "BULK_MAX_ITEMS"),
            other => panic!("unexpected: {other:?}"),
        }

        assert!(parse_previous_keys("no-colon").is_err());
        assert!(parse_previous_keys("300:key").is_err());
    }

    #[test]
    fn test_invalid_prefix() {
        let mut vars = base();
        vars.push(("TICKET_CODE_PREFIX", "cp-"));
        assert!(matches!(
            Config::from_lookup(lookup(&vars)),
            Err(ConfigError::Invalid {
                name: "TICKET_CODE_PREFIX",
                ..
            })
        ));
    }
}
