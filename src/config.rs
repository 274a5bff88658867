use std::collections::HashMap;
use thiserror::Error;

use crate::domain::Network;

/// Runtime configuration for the sweep daemon and store wiring.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Cadence of the allocation expiry sweep.
    pub sweep_interval_ms: u64,
    /// Network for balance records the ledger must create on its own
    /// (expiry reconciliation, allocation-only settlement fallback).
    pub default_network: Network,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let sweep_interval_ms = env_map
            .get("SWEEP_INTERVAL_MS")
            .map(|s| s.as_str())
            .unwrap_or("60000")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "SWEEP_INTERVAL_MS".to_string(),
                    "must be a valid u64".to_string(),
                )
            })?;
        if sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "SWEEP_INTERVAL_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let default_network = Network::new(
            env_map
                .get("DEFAULT_NETWORK")
                .map(|s| s.as_str())
                .unwrap_or("ethereum"),
        );

        Ok(Config {
            database_path,
            sweep_interval_ms,
            default_network,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/ledger.db".to_string());
        map
    }

    #[test]
    fn test_missing_database_path() {
        let result = Config::from_env_map(HashMap::new());
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.sweep_interval_ms, 60_000);
        assert_eq!(config.default_network, Network::new("ethereum"));
    }

    #[test]
    fn test_invalid_sweep_interval() {
        let mut env_map = setup_required_env();
        env_map.insert("SWEEP_INTERVAL_MS".to_string(), "soon".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "SWEEP_INTERVAL_MS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("SWEEP_INTERVAL_MS".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(_, _))
        ));
    }

    #[test]
    fn test_custom_default_network() {
        let mut env_map = setup_required_env();
        env_map.insert("DEFAULT_NETWORK".to_string(), "bsc".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.default_network, Network::new("bsc"));
    }
}
