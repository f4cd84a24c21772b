//! The engine handle every operation hangs off

use chrono::Duration;
use tracing::info;

use crate::config::Config;
use crate::constants::MAX_RESERVATION_LEASE_SECS;
use crate::db::Store;
use crate::error::Result;
use crate::principal::Principal;

/// Shared authorization engine. Clones share one store, so an `Engine` can be
/// handed to any number of request handlers.
#[derive(Clone)]
pub struct Engine {
    store: Store,
    config: Config,
}

impl Engine {
    /// Open the store described by `config`. When the config names an admin
    /// principal and the store is fresh, the admin capability is seeded.
    pub fn open(config: Config) -> Result<Self> {
        let store = Store::open(&config)?;
        let engine = Engine { store, config };
        if let Some(admin) = &engine.config.admin_principal {
            if !engine.is_bootstrapped()? {
                let admin: Principal = admin.parse()?;
                let id = engine.bootstrap(&admin)?;
                info!(admin = %admin, capability = %id, "bootstrapped from config");
            }
        }
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn reservation_lease(&self) -> Duration {
        Duration::seconds(self.config.reservation_lease_secs.min(MAX_RESERVATION_LEASE_SECS) as i64)
    }
}
