//! Verification: default-deny decisions over stored capabilities
//!
//! A check gathers the principal's own capabilities, public `anon:*`
//! capabilities and everything reachable through group memberships, then
//! filters by resource coverage, action, expiry, source address and usage
//! budget. Any survivor allows; the best survivor is reported.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use heed::RoTxn;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::action::Action;
use crate::capability::Capability;
use crate::db::Dbs;
use crate::engine::Engine;
use crate::error::{CapError, Result};
use crate::principal::Principal;
use crate::quota::{remaining, validate_amount};
use crate::read;
use crate::resource::{Coverage, Resource};

/// Metered usage the caller intends to consume if allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageQuery {
    /// Restrict to limits of this usage type; `None` means every limit.
    pub usage_type: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckRequest {
    pub principal: Principal,
    pub resource: Resource,
    pub action: Action,
    pub usage: Option<UsageQuery>,
    pub source_ip: Option<IpAddr>,
}

impl CheckRequest {
    pub fn new(principal: Principal, resource: Resource, action: Action) -> Self {
        CheckRequest { principal, resource, action, usage: None, source_ip: None }
    }

    /// Build from the raw strings an HTTP middleware hands over
    pub fn parse(principal: &str, resource: &str, action: &str) -> Result<Self> {
        Ok(CheckRequest::new(principal.parse()?, resource.parse()?, action.parse()?))
    }

    pub fn with_usage(mut self, usage_type: impl Into<String>, amount: f64) -> Self {
        self.usage = Some(UsageQuery { usage_type: Some(usage_type.into()), amount });
        self
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.usage = Some(UsageQuery { usage_type: None, amount });
        self
    }

    pub fn from_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }
}

/// Why a check was denied: the furthest stage any candidate reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoMatchingCapability,
    Expired,
    SourceIpMismatch,
    QuotaExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub matched_capability_id: Option<String>,
    /// Smallest budget left across the matched capability's applicable limits
    pub remaining_quota: Option<f64>,
    pub reason: Option<DenyReason>,
    pub resource: Resource,
    pub action: Action,
}

struct Survivor {
    coverage: Coverage,
    issued_at: DateTime<Utc>,
    id: String,
    remaining: Option<f64>,
}

impl Survivor {
    fn beats(&self, other: &Survivor) -> bool {
        (self.coverage, self.issued_at) > (other.coverage, other.issued_at)
    }
}

/// Capabilities a principal can exercise: its own, the public ones, and the
/// members of every group it belongs to. Group expansion is iterative with a
/// visited set, so nested or cyclic groups terminate.
pub(crate) fn gather(
    d: &Dbs,
    tx: &RoTxn,
    principal: &Principal,
    now: DateTime<Utc>,
    source_ip: Option<IpAddr>,
    max_group_depth: usize,
) -> Result<Vec<Capability>> {
    let mut caps = read::caps_for_principal(d, tx, principal)?;
    if !principal.is_anonymous() {
        caps.extend(read::caps_for_principal(d, tx, &Principal::anonymous())?);
    }
    let mut seen: HashSet<String> = caps.iter().map(|c| c.id.clone()).collect();

    let usable = |c: &Capability| !c.conditions.is_expired(now) && c.conditions.allows_ip(source_ip);
    let mut frontier: Vec<(String, usize)> = caps
        .iter()
        .filter(|c| usable(*c))
        .filter_map(|c| c.membership_group().map(|g| (g.to_string(), 1)))
        .collect();
    let mut visited_groups: HashSet<String> = HashSet::new();

    while let Some((group, depth)) = frontier.pop() {
        if depth > max_group_depth {
            warn!(group = %group, depth, "group nesting too deep, not expanded");
            continue;
        }
        if !visited_groups.insert(group.clone()) {
            continue;
        }
        for id in read::group_member_ids(d, tx, &group)? {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(member) = read::capability(d, tx, &id)? else {
                continue;
            };
            if usable(&member) {
                if let Some(nested) = member.membership_group() {
                    frontier.push((nested.to_string(), depth + 1));
                }
            }
            caps.push(member);
        }
    }
    Ok(caps)
}

impl Engine {
    /// Decide whether the request is allowed. Errors (including an
    /// unavailable store) must be treated as deny by the caller.
    pub fn check(&self, req: &CheckRequest) -> Result<Decision> {
        self.check_at(req, Utc::now())
    }

    pub fn check_at(&self, req: &CheckRequest, now: DateTime<Utc>) -> Result<Decision> {
        if let Some(usage) = &req.usage {
            validate_amount("usage amount", usage.amount)?;
        }
        let max_depth = self.config().max_group_depth;
        let (best, reason) = self.store().read(|d, tx| {
            let candidates = gather(d, tx, &req.principal, now, req.source_ip, max_depth)?;
            let mut best: Option<Survivor> = None;
            let mut reason = DenyReason::NoMatchingCapability;

            for cap in candidates {
                let Some(coverage) = cap.resource.covers(&req.resource) else {
                    continue;
                };
                if !cap.allows(req.action) {
                    continue;
                }
                if cap.conditions.is_expired(now) {
                    reason = reason.max(DenyReason::Expired);
                    continue;
                }
                if !cap.conditions.allows_ip(req.source_ip) {
                    reason = reason.max(DenyReason::SourceIpMismatch);
                    continue;
                }
                let mut left: Option<f64> = None;
                if let Some(usage) = &req.usage {
                    for limit in cap.conditions.limits_for(usage.usage_type.as_deref()) {
                        let r = remaining(d, tx, &cap, &req.principal, limit, now)?;
                        left = Some(left.map_or(r, |l| l.min(r)));
                    }
                    if left.map(|l| usage.amount > l).unwrap_or(false) {
                        reason = reason.max(DenyReason::QuotaExhausted);
                        continue;
                    }
                }
                let survivor = Survivor { coverage, issued_at: cap.metadata.issued_at, id: cap.id, remaining: left };
                if best.as_ref().map(|b| survivor.beats(b)).unwrap_or(true) {
                    best = Some(survivor);
                }
            }
            Ok((best, reason))
        })?;

        let decision = match best {
            Some(s) => Decision {
                allowed: true,
                matched_capability_id: Some(s.id),
                remaining_quota: s.remaining,
                reason: None,
                resource: req.resource.clone(),
                action: req.action,
            },
            None => Decision {
                allowed: false,
                matched_capability_id: None,
                remaining_quota: None,
                reason: Some(reason),
                resource: req.resource.clone(),
                action: req.action,
            },
        };
        debug!(
            principal = %req.principal,
            resource = %req.resource,
            action = %req.action,
            allowed = decision.allowed,
            capability = ?decision.matched_capability_id,
            reason = ?decision.reason,
            "check"
        );
        Ok(decision)
    }

    /// Fail-closed convenience: any error is a denial.
    pub fn is_allowed(&self, req: &CheckRequest) -> bool {
        match self.check(req) {
            Ok(decision) => decision.allowed,
            Err(e) => {
                warn!(principal = %req.principal, resource = %req.resource, action = %req.action, error = %e, "check failed, denying");
                false
            }
        }
    }

    /// Succeed only if `actor` may perform `action` on `resource`
    pub(crate) fn require(&self, actor: &Principal, resource: &Resource, action: Action) -> Result<()> {
        let decision = self.check(&CheckRequest::new(actor.clone(), resource.clone(), action))?;
        if decision.allowed {
            Ok(())
        } else {
            Err(CapError::Unauthorized {
                actor: actor.to_string(),
                action: action.to_string(),
                resource: resource.to_string(),
            })
        }
    }
}
