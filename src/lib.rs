//! Capwarden - capability-based authorization with delegation, groups and usage quotas
//!
//! A capability binds a principal to a set of actions on a resource, optionally
//! constrained by expiry, caller address and usage limits. Access is denied
//! unless some capability the principal can exercise allows it.
//!
//! ```no_run
//! use capwarden::{Action, CheckRequest, Config, Engine, NewCapability, Principal, Resource};
//!
//! # fn main() -> capwarden::Result<()> {
//! let engine = Engine::open(Config::new("./data/capwarden.mdb").with_admin("user:root"))?;
//! let root = Principal::user("root")?;
//! let alice = Principal::user("alice")?;
//!
//! engine.grant(&root, NewCapability::new(alice.clone(), Resource::api("billing", None)?, [Action::Read]))?;
//!
//! let req = CheckRequest::new(alice, Resource::api("billing", Some("invoices"))?, Action::Read);
//! assert!(engine.is_allowed(&req));
//! # Ok(())
//! # }
//! ```

mod action;
mod bootstrap;
mod capability;
mod config;
pub mod constants;
mod db;
mod engine;
mod error;
mod ids;
mod keys;
mod principal;
mod protected;
mod quota;
mod read;
mod resource;
mod tx;
mod verify;

pub use action::{Action, ActionSet};
pub use capability::{
    Capability, CapabilityGroup, CapabilityRequest, Conditions, Metadata, NewCapability, Period, RequestStatus,
    Reservation, UsageLimit, UsageRecord,
};
pub use config::Config;
pub use engine::Engine;
pub use error::{CapError, Result};
pub use principal::{Principal, PrincipalKind};
pub use protected::NewRequest;
pub use quota::{window, Reserved, UsageKey};
pub use resource::{Coverage, Resource, ResourceKind, Scope};
pub use verify::{CheckRequest, Decision, DenyReason, UsageQuery};
