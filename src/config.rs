//! Engine configuration
//!
//! Every field has a default, so a JSON file only needs the keys it changes.
//! Environment variables override file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAP_SIZE, DEFAULT_MAX_DELEGATION_DEPTH, DEFAULT_MAX_GROUP_DEPTH, DEFAULT_RESERVATION_LEASE_SECS,
    TABLE_COUNT,
};
use crate::error::{CapError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the LMDB environment.
    pub db_path: PathBuf,
    pub map_size: usize,
    pub max_dbs: u32,
    /// Seconds an uncommitted usage reservation holds budget.
    pub reservation_lease_secs: u64,
    pub max_delegation_depth: usize,
    pub max_group_depth: usize,
    /// Seeded as the holder of `admin:*` on first open.
    pub admin_principal: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from("./data/capwarden.mdb"),
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: TABLE_COUNT,
            reservation_lease_secs: DEFAULT_RESERVATION_LEASE_SECS,
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            max_group_depth: DEFAULT_MAX_GROUP_DEPTH,
            admin_principal: None,
        }
    }
}

impl Config {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Config { db_path: db_path.into(), ..Default::default() }
    }

    pub fn with_admin(mut self, principal: impl Into<String>) -> Self {
        self.admin_principal = Some(principal.into());
        self
    }

    pub fn with_reservation_lease(mut self, secs: u64) -> Self {
        self.reservation_lease_secs = secs;
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CapError::Validation(format!("cannot read config {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| CapError::Validation(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CAPWARDEN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Config::default().apply_env()
    }

    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(path) = std::env::var("CAPWARDEN_DB") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("CAPWARDEN_MAP_SIZE") {
            self.map_size = parse_env("CAPWARDEN_MAP_SIZE", &size)?;
        }
        if let Ok(secs) = std::env::var("CAPWARDEN_LEASE_SECS") {
            self.reservation_lease_secs = parse_env("CAPWARDEN_LEASE_SECS", &secs)?;
        }
        if let Ok(admin) = std::env::var("CAPWARDEN_ADMIN") {
            self.admin_principal = Some(admin);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_dbs < TABLE_COUNT {
            return Err(CapError::Validation(format!("max_dbs must be at least {}", TABLE_COUNT)));
        }
        if self.map_size == 0 {
            return Err(CapError::Validation("map_size must be positive".into()));
        }
        if self.max_delegation_depth == 0 || self.max_group_depth == 0 {
            return Err(CapError::Validation("depth limits must be positive".into()));
        }
        if let Some(admin) = &self.admin_principal {
            admin.parse::<crate::principal::Principal>()?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CapError::Validation(format!("{} has invalid value '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let c: Config = serde_json::from_str(r#"{"db_path": "/tmp/x", "reservation_lease_secs": 60}"#).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/tmp/x"));
        assert_eq!(c.reservation_lease_secs, 60);
        assert_eq!(c.max_dbs, TABLE_COUNT);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_bad_admin() {
        let c = Config::new("/tmp/x").with_admin("root");
        assert!(matches!(c.validate(), Err(CapError::Validation(_))));
    }
}
