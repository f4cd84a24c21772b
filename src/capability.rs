//! Persisted entities: capabilities, requests, groups and usage accounting

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionSet};
use crate::error::{CapError, Result};
use crate::ids::group_membership_id;
use crate::principal::Principal;
use crate::resource::Resource;

/// Fixed accounting window kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(Period::Daily),
            "weekly" => Ok(Period::Weekly),
            "monthly" => Ok(Period::Monthly),
            other => Err(CapError::Validation(format!("unknown period '{}'", other))),
        }
    }
}

/// A ceiling on one usage type over one period kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimit {
    pub usage_type: String,
    pub period: Period,
    pub limit: f64,
}

impl UsageLimit {
    pub fn new(usage_type: impl Into<String>, period: Period, limit: f64) -> Self {
        UsageLimit { usage_type: usage_type.into(), period, limit }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Caller must present one of these addresses. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ips: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usage_limits: Vec<UsageLimit>,
}

impl Conditions {
    pub fn expiring_at(at: DateTime<Utc>) -> Self {
        Conditions { expires_at: Some(at), ..Default::default() }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// An absent caller address fails a present restriction.
    pub fn allows_ip(&self, source_ip: Option<IpAddr>) -> bool {
        if self.source_ips.is_empty() {
            return true;
        }
        source_ip.map(|ip| self.source_ips.contains(&ip)).unwrap_or(false)
    }

    pub fn limits_for<'a>(&'a self, usage_type: Option<&'a str>) -> impl Iterator<Item = &'a UsageLimit> + 'a {
        self.usage_limits
            .iter()
            .filter(move |l| usage_type.map(|t| t == l.usage_type).unwrap_or(true))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for l in &self.usage_limits {
            if l.usage_type.is_empty() || l.usage_type.len() > crate::constants::MAX_PART_LEN {
                return Err(CapError::Validation("usage type must be 1..=255 bytes".into()));
            }
            if !l.limit.is_finite() || l.limit < 0.0 {
                return Err(CapError::Validation(format!("usage limit for '{}' must be finite and non-negative", l.usage_type)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub issued_at: DateTime<Utc>,
    pub issued_by: Principal,
    /// The capability request this grant resolved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Parent capability when this one was delegated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub principal: Principal,
    pub resource: Resource,
    pub actions: ActionSet,
    #[serde(default)]
    pub conditions: Conditions,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Capability {
    pub fn allows(&self, action: Action) -> bool {
        self.actions.contains(action)
    }

    /// The group this capability makes its principal a member of. Only the
    /// capability `grant_group` issues counts: its id is derived from the
    /// principal and group. Other grants on a group resource confer nothing.
    pub fn membership_group(&self) -> Option<&str> {
        match &self.resource {
            Resource::Group { name } if self.id == group_membership_id(&self.principal, name) => Some(name),
            _ => None,
        }
    }
}

/// What a grant should create. Ids and metadata are filled in by the engine.
#[derive(Debug, Clone)]
pub struct NewCapability {
    pub principal: Principal,
    pub resource: Resource,
    pub actions: ActionSet,
    pub conditions: Conditions,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl NewCapability {
    pub fn new(principal: Principal, resource: Resource, actions: impl Into<ActionSet>) -> Self {
        NewCapability {
            principal,
            resource,
            actions: actions.into(),
            conditions: Conditions::default(),
            title: None,
            description: None,
        }
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        self != RequestStatus::Pending
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub id: String,
    pub requester: Principal,
    pub resource: Resource,
    pub actions: ActionSet,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<Principal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Principal,
}

/// Committed consumption for one (capability, principal, usage type) in one
/// fixed window. A new window starts a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub capability_id: String,
    pub principal: Principal,
    pub resource: Resource,
    pub usage_type: String,
    pub period: Period,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub consumed: f64,
    pub updated_at: DateTime<Utc>,
}

/// A held but not yet committed amount of budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub capability_id: String,
    pub principal: Principal,
    pub resource: Resource,
    pub usage_type: String,
    pub period: Period,
    pub period_start: DateTime<Utc>,
    pub amount: f64,
    pub reserved_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}
