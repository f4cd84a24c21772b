//! Management operations
//!
//! Every mutation of authorization state goes through here, and every
//! operation except `request_capability` and `grant_exempt` first checks the
//! actor's authority through the verification path.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{info, warn};

use crate::action::{Action, ActionSet};
use crate::capability::{
    Capability, CapabilityGroup, CapabilityRequest, Conditions, Metadata, NewCapability, RequestStatus,
};
use crate::engine::Engine;
use crate::error::{CapError, Result};
use crate::ids::{generate_id, group_membership_id};
use crate::keys::check_part;
use crate::principal::Principal;
use crate::read;
use crate::resource::Resource;
use crate::tx::Tx;

/// A pending ask for access, as submitted by the requester.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub requester: Principal,
    pub resource: Resource,
    pub actions: ActionSet,
    pub owner_id: String,
    pub message: Option<String>,
    pub callback: Option<String>,
}

impl NewRequest {
    pub fn new(requester: Principal, resource: Resource, actions: impl Into<ActionSet>, owner_id: impl Into<String>) -> Self {
        NewRequest {
            requester,
            resource,
            actions: actions.into(),
            owner_id: owner_id.into(),
            message: None,
            callback: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }
}

fn unauthorized(actor: &Principal, action: &str, target: &str) -> CapError {
    CapError::Unauthorized { actor: actor.to_string(), action: action.into(), resource: target.into() }
}

fn check_actions(actions: ActionSet) -> Result<()> {
    if actions.is_empty() {
        return Err(CapError::Validation("action set must not be empty".into()));
    }
    Ok(())
}

fn build(issuer: &Principal, new: NewCapability, delegation: Option<String>, request_id: Option<String>) -> Result<Capability> {
    check_actions(new.actions)?;
    new.conditions.validate()?;
    Ok(Capability {
        id: generate_id()?,
        principal: new.principal,
        resource: new.resource,
        actions: new.actions,
        conditions: new.conditions,
        metadata: Metadata { issued_at: Utc::now(), issued_by: issuer.clone(), request_id, delegation },
        title: new.title,
        description: new.description,
    })
}

/// Membership capabilities `principal` holds for `group`
fn memberships(tx: &Tx, principal: &Principal, group: &str) -> Result<Vec<Capability>> {
    Ok(read::caps_for_principal(tx.dbs(), tx.ro(), principal)?
        .into_iter()
        .filter(|c| c.membership_group() == Some(group))
        .collect())
}

impl Engine {
    // ========================================================================
    // Grants and revocation
    // ========================================================================

    /// Create a capability. Requires `admin` on the capability's resource.
    pub fn grant(&self, issuer: &Principal, new: NewCapability) -> Result<String> {
        check_actions(new.actions)?;
        self.require(issuer, &new.resource, Action::Admin)?;
        self.grant_exempt(issuer, new)
    }

    /// Create a capability without an authority check. For bootstrap and
    /// self-service flows (first-time account setup) the caller has already
    /// decided are exempt.
    pub fn grant_exempt(&self, issuer: &Principal, new: NewCapability) -> Result<String> {
        let cap = build(issuer, new, None, None)?;
        self.store().transact(|tx| tx.put_capability(&cap))?;
        info!(issuer = %issuer, principal = %cap.principal, resource = %cap.resource, actions = %cap.actions, capability = %cap.id, "granted");
        Ok(cap.id)
    }

    /// Delete a capability and everything delegated from it. Allowed for the
    /// holder and for anyone with `admin` on its resource. Revoking an id that
    /// does not exist succeeds and removes nothing.
    pub fn revoke(&self, revoker: &Principal, capability_id: &str) -> Result<Vec<String>> {
        let Some(cap) = self.get_capability(capability_id)? else {
            return Ok(Vec::new());
        };
        if cap.principal != *revoker {
            self.require(revoker, &cap.resource, Action::Admin)?;
        }
        let removed = self.store().transact(|tx| tx.delete_delegation_subtree(capability_id))?;
        info!(revoker = %revoker, capability = %capability_id, cascaded = removed.len().saturating_sub(1), "revoked");
        Ok(removed)
    }

    /// Re-grant a held capability to `delegatee`. The delegator must hold the
    /// capability and it must include `delegate`. The copy shares the
    /// original's usage budget.
    pub fn delegate(&self, delegator: &Principal, delegatee: &Principal, capability_id: &str) -> Result<String> {
        if delegator == delegatee {
            return Err(CapError::Validation("cannot delegate a capability to its own holder".into()));
        }
        let parent = self
            .get_capability(capability_id)?
            .ok_or_else(|| CapError::not_found("capability", capability_id))?;
        if parent.principal != *delegator || !parent.allows(Action::Delegate) {
            return Err(unauthorized(delegator, "delegate", &parent.resource.to_string()));
        }
        if parent.membership_group().is_some() {
            return Err(CapError::Validation("group memberships are granted with grant_group, not delegated".into()));
        }
        if parent.conditions.is_expired(Utc::now()) {
            return Err(CapError::InvalidState(format!("capability {} has expired", capability_id)));
        }

        let max_depth = self.config().max_delegation_depth;
        let child = build(
            delegator,
            NewCapability {
                principal: delegatee.clone(),
                resource: parent.resource.clone(),
                actions: parent.actions,
                conditions: parent.conditions.clone(),
                title: parent.title.clone(),
                description: parent.description.clone(),
            },
            Some(parent.id.clone()),
            None,
        )?;
        self.store().transact(|tx| {
            // Walk to the root: bounds the chain and catches corrupt cycles.
            let mut seen = HashSet::from([capability_id.to_string()]);
            let mut cursor = tx.capability(capability_id)?.ok_or_else(|| CapError::not_found("capability", capability_id))?;
            while let Some(up) = cursor.metadata.delegation.take() {
                if !seen.insert(up.clone()) {
                    return Err(CapError::Integrity(format!("delegation cycle through capability {}", up)));
                }
                if seen.len() > max_depth {
                    return Err(CapError::Validation(format!("delegation chain deeper than {}", max_depth)));
                }
                match tx.capability(&up)? {
                    Some(c) => cursor = c,
                    None => break,
                }
            }
            if seen.len() >= max_depth {
                return Err(CapError::Validation(format!("delegation chain deeper than {}", max_depth)));
            }
            tx.put_capability(&child)
        })?;
        info!(delegator = %delegator, delegatee = %delegatee, parent = %capability_id, capability = %child.id, "delegated");
        Ok(child.id)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// File a pending request. Anyone may ask.
    pub fn request_capability(&self, new: NewRequest) -> Result<String> {
        check_actions(new.actions)?;
        check_part("owner id", &new.owner_id)?;
        let req = CapabilityRequest {
            id: generate_id()?,
            requester: new.requester,
            resource: new.resource,
            actions: new.actions,
            owner_id: new.owner_id,
            message: new.message,
            callback: new.callback,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            capability_id: None,
        };
        self.store().transact(|tx| tx.put_request(&req))?;
        info!(requester = %req.requester, resource = %req.resource, actions = %req.actions, request = %req.id, "capability requested");
        Ok(req.id)
    }

    fn load_request_for(&self, actor: &Principal, request_id: &str) -> Result<CapabilityRequest> {
        let req = self
            .get_request(request_id)?
            .ok_or_else(|| CapError::not_found("capability request", request_id))?;
        self.require(actor, &req.resource, Action::Admin)?;
        Ok(req)
    }

    /// Approve a pending request, creating the capability and closing the
    /// request in one transaction. Requires `admin` on the request's resource.
    pub fn approve(&self, approver: &Principal, request_id: &str, conditions: Option<Conditions>) -> Result<String> {
        let req = self.load_request_for(approver, request_id)?;
        let cap = build(
            approver,
            NewCapability {
                principal: req.requester.clone(),
                resource: req.resource.clone(),
                actions: req.actions,
                conditions: conditions.unwrap_or_default(),
                title: None,
                description: req.message.clone(),
            },
            None,
            Some(req.id.clone()),
        )?;
        let cap_id = self.store().transact(|tx| {
            let mut req = tx.request(request_id)?.ok_or_else(|| CapError::not_found("capability request", request_id))?;
            if req.status.is_terminal() {
                return Err(CapError::InvalidState(format!("request {} is already {}", request_id, req.status)));
            }
            // A pending request that already has a capability was left half
            // approved; adopt that capability instead of issuing a second one.
            let mut adopted = None;
            for id in tx.caps_from_request(request_id)? {
                if tx.capability(&id)?.is_some() {
                    adopted = Some(id);
                    break;
                }
            }
            let cap_id = match adopted {
                Some(id) => {
                    warn!(request = %request_id, capability = %id, "adopting capability from interrupted approval");
                    id
                }
                None => {
                    tx.put_capability(&cap)?;
                    cap.id.clone()
                }
            };
            req.status = RequestStatus::Approved;
            req.resolved_at = Some(Utc::now());
            req.resolved_by = Some(approver.clone());
            req.capability_id = Some(cap_id.clone());
            tx.put_request(&req)?;
            Ok(cap_id)
        })?;
        info!(approver = %approver, request = %request_id, capability = %cap_id, "request approved");
        Ok(cap_id)
    }

    /// Reject a pending request. Requires `admin` on the request's resource.
    pub fn reject(&self, rejector: &Principal, request_id: &str) -> Result<()> {
        self.load_request_for(rejector, request_id)?;
        self.store().transact(|tx| {
            let mut req = tx.request(request_id)?.ok_or_else(|| CapError::not_found("capability request", request_id))?;
            if req.status.is_terminal() {
                return Err(CapError::InvalidState(format!("request {} is already {}", request_id, req.status)));
            }
            req.status = RequestStatus::Rejected;
            req.resolved_at = Some(Utc::now());
            req.resolved_by = Some(rejector.clone());
            tx.put_request(&req)
        })?;
        info!(rejector = %rejector, request = %request_id, "request rejected");
        Ok(())
    }

    /// Withdraw a request and revoke every capability issued from it,
    /// including their delegations. Allowed for the requester and for anyone
    /// with `admin` on the request's resource.
    pub fn invalidate_request(&self, actor: &Principal, request_id: &str) -> Result<Vec<String>> {
        let req = self
            .get_request(request_id)?
            .ok_or_else(|| CapError::not_found("capability request", request_id))?;
        if req.requester != *actor {
            self.require(actor, &req.resource, Action::Admin)?;
        }
        let removed = self.store().transact(|tx| {
            let mut removed = Vec::new();
            for id in tx.caps_from_request(request_id)? {
                removed.extend(tx.delete_delegation_subtree(&id)?);
            }
            tx.delete_request(request_id)?;
            Ok(removed)
        })?;
        info!(actor = %actor, request = %request_id, revoked = removed.len(), "request invalidated");
        Ok(removed)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Define a named group. Requires `admin` on `group:<name>`.
    pub fn create_group(&self, issuer: &Principal, name: &str, title: Option<&str>, description: Option<&str>) -> Result<()> {
        let resource = Resource::group(name)?;
        self.require(issuer, &resource, Action::Admin)?;
        let group = CapabilityGroup {
            name: name.to_string(),
            title: title.map(str::to_string),
            description: description.map(str::to_string),
            created_at: Utc::now(),
            created_by: issuer.clone(),
        };
        self.store().transact(|tx| {
            if tx.group(name)?.is_some() {
                return Err(CapError::InvalidState(format!("group '{}' already exists", name)));
            }
            tx.put_group(&group)
        })?;
        info!(issuer = %issuer, group = %name, "group created");
        Ok(())
    }

    /// Add an existing capability to a group's bundle. Returns false if it
    /// was already a member.
    pub fn add_group_member(&self, issuer: &Principal, group: &str, capability_id: &str) -> Result<bool> {
        self.require(issuer, &Resource::group(group)?, Action::Admin)?;
        let added = self.store().transact(|tx| {
            if tx.group(group)?.is_none() {
                return Err(CapError::not_found("group", group));
            }
            if tx.capability(capability_id)?.is_none() {
                return Err(CapError::not_found("capability", capability_id));
            }
            tx.add_group_member(group, capability_id, Utc::now().timestamp_millis().max(0) as u64)
        })?;
        info!(issuer = %issuer, group = %group, capability = %capability_id, added, "group member added");
        Ok(added)
    }

    pub fn remove_group_member(&self, issuer: &Principal, group: &str, capability_id: &str) -> Result<bool> {
        self.require(issuer, &Resource::group(group)?, Action::Admin)?;
        check_part("capability id", capability_id)?;
        let removed = self.store().transact(|tx| tx.remove_group_member(group, capability_id))?;
        info!(issuer = %issuer, group = %group, capability = %capability_id, removed, "group member removed");
        Ok(removed)
    }

    /// Make `principal` a member of the named group. Idempotent: an existing
    /// membership is returned unchanged.
    pub fn grant_group(&self, issuer: &Principal, principal: &Principal, group: &str) -> Result<String> {
        let resource = Resource::group(group)?;
        self.require(issuer, &resource, Action::Admin)?;
        let membership_id = group_membership_id(principal, group);
        let (id, created) = self.store().transact(|tx| {
            if tx.group(group)?.is_none() {
                return Err(CapError::not_found("group", group));
            }
            if let Some(existing) = memberships(tx, principal, group)?.into_iter().next() {
                return Ok((existing.id, false));
            }
            let cap = Capability {
                id: membership_id.clone(),
                principal: principal.clone(),
                resource: resource.clone(),
                actions: ActionSet::from(Action::Read),
                conditions: Conditions::default(),
                metadata: Metadata { issued_at: Utc::now(), issued_by: issuer.clone(), request_id: None, delegation: None },
                title: Some(format!("member of {}", group)),
                description: None,
            };
            tx.put_capability(&cap)?;
            Ok((cap.id, true))
        })?;
        if created {
            info!(issuer = %issuer, principal = %principal, group = %group, capability = %id, "group granted");
        }
        Ok(id)
    }

    /// Remove `principal` from the named group. Allowed for the member and
    /// for anyone with `admin` on the group. Group member capabilities are
    /// left untouched.
    pub fn revoke_group(&self, revoker: &Principal, principal: &Principal, group: &str) -> Result<Vec<String>> {
        let resource = Resource::group(group)?;
        if revoker != principal {
            self.require(revoker, &resource, Action::Admin)?;
        }
        let removed = self.store().transact(|tx| {
            let mut removed = Vec::new();
            for cap in memberships(tx, principal, group)? {
                removed.extend(tx.delete_delegation_subtree(&cap.id)?);
            }
            Ok(removed)
        })?;
        info!(revoker = %revoker, principal = %principal, group = %group, removed = removed.len(), "group revoked");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[test]
    fn approve_adopts_capability_from_interrupted_approval() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(Config::new(dir.path().join("db")).with_admin("user:root")).unwrap();
        let root = Principal::user("root").unwrap();
        let alice = Principal::user("alice").unwrap();
        let resource: Resource = "data:reports".parse().unwrap();

        let request_id = engine
            .request_capability(NewRequest::new(alice.clone(), resource.clone(), Action::Read, "owner-1"))
            .unwrap();
        let orphan = build(&root, NewCapability::new(alice.clone(), resource, Action::Read), None, Some(request_id.clone()))
            .unwrap();
        engine.store().transact(|tx| tx.put_capability(&orphan)).unwrap();

        assert_eq!(engine.approve(&root, &request_id, None).unwrap(), orphan.id);
        assert_eq!(engine.list_for_principal(&alice).unwrap().len(), 1);

        let req = engine.get_request(&request_id).unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Approved);
        assert_eq!(req.capability_id.as_deref(), Some(orphan.id.as_str()));
        assert_eq!(req.resolved_by, Some(root.clone()));
        assert!(matches!(engine.approve(&root, &request_id, None), Err(CapError::InvalidState(_))));
    }
}
