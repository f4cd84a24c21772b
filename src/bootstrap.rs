//! Bootstrap and system initialization
//!
//! The administrator is not a special case in verification: bootstrap seeds
//! one ordinary capability on `admin:*` carrying every action.

use chrono::Utc;
use tracing::info;

use crate::action::ActionSet;
use crate::capability::{Capability, Conditions, Metadata};
use crate::constants::META_ADMIN;
use crate::engine::Engine;
use crate::error::{store_err, CapError, Result};
use crate::ids::generate_id;
use crate::principal::Principal;
use crate::resource::Resource;

impl Engine {
    /// Seed the `admin:*` capability for `admin`. Fails with `InvalidState`
    /// if the store has already been bootstrapped.
    pub fn bootstrap(&self, admin: &Principal) -> Result<String> {
        if admin.is_anonymous() {
            return Err(CapError::Validation("the anonymous principal cannot be the administrator".into()));
        }
        let cap = Capability {
            id: generate_id()?,
            principal: admin.clone(),
            resource: Resource::Global,
            actions: ActionSet::all(),
            conditions: Conditions::default(),
            metadata: Metadata {
                issued_at: Utc::now(),
                issued_by: admin.clone(),
                request_id: None,
                delegation: None,
            },
            title: Some("Administrator".into()),
            description: None,
        };
        self.store().transact(|tx| {
            if tx.is_bootstrapped()? {
                return Err(CapError::InvalidState("already bootstrapped".into()));
            }
            tx.put_capability(&cap)?;
            tx.mark_bootstrapped(&admin.to_string())
        })?;
        info!(admin = %admin, capability = %cap.id, "bootstrap complete");
        Ok(cap.id)
    }

    /// The principal seeded at bootstrap, if any
    pub fn admin_principal(&self) -> Result<Option<Principal>> {
        let raw = self.store().read(|d, tx| {
            Ok(d.meta.get(tx, META_ADMIN).map_err(store_err)?.map(str::to_string))
        })?;
        raw.map(|s| s.parse()).transpose()
    }
}
