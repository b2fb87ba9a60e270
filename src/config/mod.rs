//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

use crate::util::rate_limit::INPUT_RATE_LIMIT;
use crate::ws::router::DEFAULT_RECONCILE_THRESHOLD;

/// Application configuration loaded from environment variables.
///
/// Engine constants (arena size, speeds, tick rate) are deliberately absent:
/// clients predict with the same values, so they are compiled in.
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Capacity of a room when the creator does not ask for less
    pub max_players_per_room: usize,
    /// Client/server position divergence tolerated before correcting
    pub reconcile_threshold: f32,
    /// Inbound messages per second per connection
    pub input_rate_limit: u32,

    /// Allowed client origins for CORS (comma separated, `*` for any)
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // PORT wins over SERVER_ADDR
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8765".to_string()),
        };

        let max_players_per_room = parse_or(&lookup, "MAX_PLAYERS_PER_ROOM", 8usize)?;
        if max_players_per_room == 0 {
            return Err(ConfigError::Invalid("MAX_PLAYERS_PER_ROOM"));
        }

        let reconcile_threshold =
            parse_or(&lookup, "RECONCILE_THRESHOLD", DEFAULT_RECONCILE_THRESHOLD)?;
        if !reconcile_threshold.is_finite() || reconcile_threshold < 0.0 {
            return Err(ConfigError::Invalid("RECONCILE_THRESHOLD"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),

            max_players_per_room,
            reconcile_threshold,
            input_rate_limit: parse_or(&lookup, "INPUT_RATE_LIMIT", INPUT_RATE_LIMIT)?,

            client_origin: lookup("CLIENT_ORIGIN").unwrap_or_else(|| "*".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
