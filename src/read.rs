//! Read operations (no permission checks, direct LMDB access)

use chrono::{DateTime, Utc};
use heed::RoTxn;

use crate::capability::{Capability, CapabilityGroup, CapabilityRequest, RequestStatus, Reservation, UsageRecord};
use crate::constants::META_BOOTSTRAPPED;
use crate::db::{get_row, index_ids, scan_rows, Dbs};
use crate::engine::Engine;
use crate::error::{store_err, Result};
use crate::keys::{check_part, principal_prefix, resource_prefix, single_prefix, usage_prefix};
use crate::principal::Principal;
use crate::resource::ResourceKind;

// ============================================================================
// Snapshot queries (shared by verification and the write path)
// ============================================================================

#[inline]
pub(crate) fn capability(d: &Dbs, tx: &RoTxn, id: &str) -> Result<Option<Capability>> {
    get_row(tx, &d.caps, id.as_bytes())
}

/// Load the rows behind a list of index ids. Ids whose row is gone are skipped.
fn load_caps(d: &Dbs, tx: &RoTxn, ids: Vec<(String, u64)>) -> Result<Vec<Capability>> {
    let mut caps = Vec::with_capacity(ids.len());
    for (id, _) in ids {
        if let Some(cap) = capability(d, tx, &id)? {
            caps.push(cap);
        }
    }
    Ok(caps)
}

pub(crate) fn caps_for_principal(d: &Dbs, tx: &RoTxn, principal: &Principal) -> Result<Vec<Capability>> {
    let ids = index_ids(tx, &d.caps_by_principal, &principal_prefix(principal)?)?;
    load_caps(d, tx, ids)
}

pub(crate) fn caps_for_resource(
    d: &Dbs,
    tx: &RoTxn,
    kind: ResourceKind,
    namespace: &str,
    id: Option<&str>,
) -> Result<Vec<Capability>> {
    let ids = index_ids(tx, &d.caps_by_resource, &resource_prefix(kind, namespace, id)?)?;
    load_caps(d, tx, ids)
}

/// Ids of capabilities delegated directly from `parent`
pub(crate) fn delegated_children(d: &Dbs, tx: &RoTxn, parent: &str) -> Result<Vec<String>> {
    Ok(index_ids(tx, &d.caps_by_parent, &single_prefix(parent)?)?.into_iter().map(|(id, _)| id).collect())
}

/// Ids of capabilities created by approving `request_id`
pub(crate) fn caps_from_request(d: &Dbs, tx: &RoTxn, request_id: &str) -> Result<Vec<String>> {
    Ok(index_ids(tx, &d.caps_by_request, &single_prefix(request_id)?)?.into_iter().map(|(id, _)| id).collect())
}

#[inline]
pub(crate) fn request(d: &Dbs, tx: &RoTxn, id: &str) -> Result<Option<CapabilityRequest>> {
    get_row(tx, &d.requests, id.as_bytes())
}

#[inline]
pub(crate) fn group(d: &Dbs, tx: &RoTxn, name: &str) -> Result<Option<CapabilityGroup>> {
    get_row(tx, &d.groups, name.as_bytes())
}

pub(crate) fn group_member_ids(d: &Dbs, tx: &RoTxn, name: &str) -> Result<Vec<String>> {
    Ok(d.group_members.list_fwd(tx, name)?.into_iter().map(|(id, _)| id).collect())
}

#[inline]
pub(crate) fn usage_record(d: &Dbs, tx: &RoTxn, window: &[u8]) -> Result<Option<UsageRecord>> {
    get_row(tx, &d.usage, window)
}

/// Budget held by live reservations in one usage window
pub(crate) fn held_amount(d: &Dbs, tx: &RoTxn, window: &[u8], now: DateTime<Utc>) -> Result<f64> {
    Ok(scan_rows::<Reservation>(tx, &d.reservations, window)?
        .into_iter()
        .filter(|(_, r)| r.is_live(now))
        .map(|(_, r)| r.amount)
        .sum())
}

pub(crate) fn is_bootstrapped(d: &Dbs, tx: &RoTxn) -> Result<bool> {
    Ok(d.meta.get(tx, META_BOOTSTRAPPED).map_err(store_err)?.is_some())
}

// ============================================================================
// Public listing API
// ============================================================================

impl Engine {
    pub fn get_capability(&self, id: &str) -> Result<Option<Capability>> {
        self.store().read(|d, tx| capability(d, tx, id))
    }

    /// Capabilities held directly by a principal, oldest first
    pub fn list_for_principal(&self, principal: &Principal) -> Result<Vec<Capability>> {
        let mut caps = self.store().read(|d, tx| caps_for_principal(d, tx, principal))?;
        caps.sort_by_key(|c| c.metadata.issued_at);
        Ok(caps)
    }

    /// Capabilities scoped to a namespace, or to one instance id in it.
    /// A namespace listing includes namespace-wide (`*`) capabilities.
    pub fn list_by_resource(&self, kind: ResourceKind, namespace: &str, id: Option<&str>) -> Result<Vec<Capability>> {
        check_part("namespace", namespace)?;
        if let Some(id) = id {
            check_part("resource id", id)?;
        }
        self.store().read(|d, tx| caps_for_resource(d, tx, kind, namespace, id))
    }

    pub fn get_request(&self, id: &str) -> Result<Option<CapabilityRequest>> {
        self.store().read(|d, tx| request(d, tx, id))
    }

    /// Requests addressed to a resource owner, optionally filtered by status
    pub fn list_requests_for_owner(&self, owner_id: &str, status: Option<RequestStatus>) -> Result<Vec<CapabilityRequest>> {
        check_part("owner id", owner_id)?;
        let mut reqs = self.store().read(|d, tx| {
            let mut r = Vec::new();
            for (id, _) in index_ids(tx, &d.requests_by_owner, &single_prefix(owner_id)?)? {
                if let Some(req) = request(d, tx, &id)? {
                    r.push(req);
                }
            }
            Ok(r)
        })?;
        reqs.retain(|r| status.map(|s| s == r.status).unwrap_or(true));
        reqs.sort_by_key(|r| r.created_at);
        Ok(reqs)
    }

    pub fn get_group(&self, name: &str) -> Result<Option<CapabilityGroup>> {
        self.store().read(|d, tx| group(d, tx, name))
    }

    pub fn list_group_members(&self, name: &str) -> Result<Vec<Capability>> {
        check_part("group name", name)?;
        self.store().read(|d, tx| {
            let ids = d.group_members.list_fwd(tx, name)?;
            load_caps(d, tx, ids)
        })
    }

    /// Every usage window recorded for a principal on a capability, oldest first
    pub fn usage_history(&self, capability_id: &str, principal: &Principal) -> Result<Vec<UsageRecord>> {
        check_part("capability id", capability_id)?;
        let mut records: Vec<UsageRecord> = self
            .store()
            .read(|d, tx| scan_rows(tx, &d.usage, &usage_prefix(capability_id, principal)?))?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        records.sort_by_key(|r| (r.period_start, r.period.as_str()));
        Ok(records)
    }

    pub fn is_bootstrapped(&self) -> Result<bool> {
        self.store().read(is_bootstrapped)
    }
}
