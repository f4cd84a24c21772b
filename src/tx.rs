//! Write transaction wrapper
//!
//! Every entity write goes through `Tx`, which keeps the index tables in step
//! with the rows they point at. A `Tx` commits all or nothing.

use std::collections::HashSet;

use heed::{RoTxn, RwTxn};

use crate::capability::{Capability, CapabilityGroup, CapabilityRequest, Reservation, UsageRecord};
use crate::constants::{META_ADMIN, META_BOOTSTRAPPED, OUTCOME_LAPSED};
use crate::db::{put_row, scan_rows, Dbs};
use crate::error::{store_err, CapError, Result};
use crate::keys::{pair_key, principal_key, resource_key};
use crate::read;

pub struct Tx<'e> {
    txn: RwTxn<'e>,
    dbs: &'e Dbs,
}

impl<'e> Tx<'e> {
    #[inline]
    pub(crate) fn new(txn: RwTxn<'e>, dbs: &'e Dbs) -> Self {
        Tx { txn, dbs }
    }

    #[inline]
    pub(crate) fn commit(self) -> Result<()> {
        self.txn.commit().map_err(store_err)
    }

    /// Read view of this transaction, including its own uncommitted writes
    #[inline]
    pub(crate) fn ro(&self) -> &RoTxn<'e> {
        &self.txn
    }

    #[inline]
    pub(crate) fn dbs(&self) -> &'e Dbs {
        self.dbs
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    pub fn capability(&self, id: &str) -> Result<Option<Capability>> {
        read::capability(self.dbs, &self.txn, id)
    }

    /// Insert a capability row and its index entries
    pub fn put_capability(&mut self, cap: &Capability) -> Result<()> {
        if cap.actions.is_empty() {
            return Err(CapError::Validation("capability must grant at least one action".into()));
        }
        cap.conditions.validate()?;
        let d = self.dbs;
        let issued = cap.metadata.issued_at.timestamp_millis().max(0) as u64;
        put_row(&mut self.txn, &d.caps, cap.id.as_bytes(), cap)?;
        d.caps_by_principal.put(&mut self.txn, &principal_key(&cap.principal, &cap.id)?, &issued).map_err(store_err)?;
        d.caps_by_resource.put(&mut self.txn, &resource_key(&cap.resource, &cap.id)?, &issued).map_err(store_err)?;
        if let Some(parent) = &cap.metadata.delegation {
            d.caps_by_parent.put(&mut self.txn, &pair_key(parent, &cap.id)?, &issued).map_err(store_err)?;
        }
        if let Some(req) = &cap.metadata.request_id {
            d.caps_by_request.put(&mut self.txn, &pair_key(req, &cap.id)?, &issued).map_err(store_err)?;
        }
        Ok(())
    }

    /// Remove one capability row, its index entries and its group memberships.
    /// Returns the removed row, or `None` if it did not exist.
    pub fn delete_capability(&mut self, id: &str) -> Result<Option<Capability>> {
        let Some(cap) = self.capability(id)? else {
            return Ok(None);
        };
        let d = self.dbs;
        d.caps.delete(&mut self.txn, id.as_bytes()).map_err(store_err)?;
        d.caps_by_principal.delete(&mut self.txn, &principal_key(&cap.principal, id)?).map_err(store_err)?;
        d.caps_by_resource.delete(&mut self.txn, &resource_key(&cap.resource, id)?).map_err(store_err)?;
        if let Some(parent) = &cap.metadata.delegation {
            d.caps_by_parent.delete(&mut self.txn, &pair_key(parent, id)?).map_err(store_err)?;
        }
        if let Some(req) = &cap.metadata.request_id {
            d.caps_by_request.delete(&mut self.txn, &pair_key(req, id)?).map_err(store_err)?;
        }
        for (group, _) in d.group_members.list_rev(&self.txn, id)? {
            d.group_members.del(&mut self.txn, &group, id)?;
        }
        Ok(Some(cap))
    }

    /// Delete `root` and every capability delegated from it, transitively.
    ///
    /// Traversal is an explicit work list over the parent index. Reaching a
    /// capability twice means the delegation graph is not a tree, which aborts
    /// the whole transaction.
    pub fn delete_delegation_subtree(&mut self, root: &str) -> Result<Vec<String>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                return Err(CapError::Integrity(format!("delegation cycle through capability {}", id)));
            }
            stack.extend(read::delegated_children(self.dbs, &self.txn, &id)?);
            order.push(id);
        }
        let mut removed = Vec::with_capacity(order.len());
        for id in order {
            if self.delete_capability(&id)?.is_some() {
                removed.push(id);
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    pub fn request(&self, id: &str) -> Result<Option<CapabilityRequest>> {
        read::request(self.dbs, &self.txn, id)
    }

    pub fn put_request(&mut self, req: &CapabilityRequest) -> Result<()> {
        let d = self.dbs;
        let created = req.created_at.timestamp_millis().max(0) as u64;
        put_row(&mut self.txn, &d.requests, req.id.as_bytes(), req)?;
        d.requests_by_owner.put(&mut self.txn, &pair_key(&req.owner_id, &req.id)?, &created).map_err(store_err)
    }

    pub fn delete_request(&mut self, id: &str) -> Result<Option<CapabilityRequest>> {
        let Some(req) = self.request(id)? else {
            return Ok(None);
        };
        let d = self.dbs;
        d.requests.delete(&mut self.txn, id.as_bytes()).map_err(store_err)?;
        d.requests_by_owner.delete(&mut self.txn, &pair_key(&req.owner_id, id)?).map_err(store_err)?;
        Ok(Some(req))
    }

    pub fn caps_from_request(&self, request_id: &str) -> Result<Vec<String>> {
        read::caps_from_request(self.dbs, &self.txn, request_id)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    pub fn group(&self, name: &str) -> Result<Option<CapabilityGroup>> {
        read::group(self.dbs, &self.txn, name)
    }

    pub fn put_group(&mut self, group: &CapabilityGroup) -> Result<()> {
        let d = self.dbs;
        put_row(&mut self.txn, &d.groups, group.name.as_bytes(), group)
    }

    /// Link a capability into a group. Returns false if already linked.
    pub fn add_group_member(&mut self, group: &str, cap_id: &str, at: u64) -> Result<bool> {
        let d = self.dbs;
        if d.group_members.contains(&self.txn, group, cap_id)? {
            return Ok(false);
        }
        d.group_members.put(&mut self.txn, group, cap_id, at)?;
        Ok(true)
    }

    pub fn remove_group_member(&mut self, group: &str, cap_id: &str) -> Result<bool> {
        let d = self.dbs;
        d.group_members.del(&mut self.txn, group, cap_id)
    }

    // ========================================================================
    // Usage accounting
    // ========================================================================

    pub fn usage_record(&self, window: &[u8]) -> Result<Option<UsageRecord>> {
        read::usage_record(self.dbs, &self.txn, window)
    }

    pub fn put_usage_record(&mut self, window: &[u8], record: &UsageRecord) -> Result<()> {
        let d = self.dbs;
        put_row(&mut self.txn, &d.usage, window, record)
    }

    pub fn put_reservation(&mut self, key: &[u8], reservation: &Reservation) -> Result<()> {
        let d = self.dbs;
        put_row(&mut self.txn, &d.reservations, key, reservation)
    }

    pub fn delete_reservation(&mut self, key: &[u8]) -> Result<bool> {
        let d = self.dbs;
        d.reservations.delete(&mut self.txn, key).map_err(store_err)
    }

    /// How a reservation that left the live table ended, if it did
    pub fn reservation_outcome(&self, reservation_id: &str) -> Result<Option<u64>> {
        self.dbs.reservation_outcomes.get(&self.txn, reservation_id.as_bytes()).map_err(store_err)
    }

    pub fn put_reservation_outcome(&mut self, reservation_id: &str, outcome: u64) -> Result<()> {
        let d = self.dbs;
        d.reservation_outcomes.put(&mut self.txn, reservation_id.as_bytes(), &outcome).map_err(store_err)
    }

    /// Delete reservations under `prefix` whose lease ended before `now`,
    /// recording each as lapsed so a late commit can still be charged.
    pub fn delete_expired_reservations(&mut self, prefix: &[u8], now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let expired: Vec<(Vec<u8>, Reservation)> = scan_rows::<Reservation>(&self.txn, &self.dbs.reservations, prefix)?
            .into_iter()
            .filter(|(_, r)| !r.is_live(now))
            .collect();
        for (key, r) in &expired {
            self.delete_reservation(key)?;
            self.put_reservation_outcome(&r.id, OUTCOME_LAPSED)?;
        }
        Ok(expired.len())
    }

    // ========================================================================
    // Meta
    // ========================================================================

    pub fn is_bootstrapped(&self) -> Result<bool> {
        read::is_bootstrapped(self.dbs, &self.txn)
    }

    pub fn mark_bootstrapped(&mut self, admin: &str) -> Result<()> {
        let d = self.dbs;
        d.meta.put(&mut self.txn, META_BOOTSTRAPPED, "1").map_err(store_err)?;
        d.meta.put(&mut self.txn, META_ADMIN, admin).map_err(store_err)
    }
}
