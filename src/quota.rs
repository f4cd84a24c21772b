//! Usage quota accounting
//!
//! Budgets live in fixed UTC windows (day, ISO week starting Monday, calendar
//! month). Reserving is a compare-and-increment inside one LMDB write
//! transaction; LMDB admits a single writer at a time, so two reservers can
//! never both claim the same remaining budget.
//!
//! Reservations are leases. A reservation that is neither committed nor
//! released stops holding budget once `lease_expires_at` passes and is deleted
//! by the next reserve against the same window or by
//! [`Engine::sweep_expired_reservations`]. A reservation leaving the live
//! table is recorded as lapsed or settled; a settled ticket cannot be
//! committed again.
//!
//! A delegated capability draws on its delegation root's budget, held by the
//! root's principal.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use heed::RoTxn;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capability::{Capability, Period, Reservation, UsageLimit, UsageRecord};
use crate::constants::{OUTCOME_LAPSED, OUTCOME_SETTLED};
use crate::db::Dbs;
use crate::engine::Engine;
use crate::error::{CapError, Result};
use crate::ids::generate_id;
use crate::keys::{reservation_key, usage_key};
use crate::principal::Principal;
use crate::read;
use crate::tx::Tx;

/// Identifies one metered budget: a capability as used by one principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageKey {
    pub capability_id: String,
    pub principal: Principal,
    pub usage_type: String,
}

impl UsageKey {
    pub fn new(capability_id: impl Into<String>, principal: Principal, usage_type: impl Into<String>) -> Self {
        UsageKey { capability_id: capability_id.into(), principal, usage_type: usage_type.into() }
    }
}

/// A successful reservation and the budget left in its window afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reserved {
    pub ticket: Reservation,
    pub remaining: f64,
}

/// Start and end of the fixed window containing `at`
pub fn window(period: Period, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = at.date_naive();
    let (start, end) = match period {
        Period::Daily => (date, date + Duration::days(1)),
        Period::Weekly => {
            let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
            (monday, monday + Duration::days(7))
        }
        Period::Monthly => {
            let first = date - Duration::days(date.day0() as i64);
            let later = first + Duration::days(32);
            (first, later - Duration::days(later.day0() as i64))
        }
    };
    (midnight(start), midnight(end))
}

#[inline]
fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

pub(crate) fn validate_amount(what: &str, amount: f64) -> Result<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(CapError::Validation(format!("{} must be finite and non-negative, got {}", what, amount)));
    }
    Ok(())
}

/// The (capability id, principal) whose budget `principal` spends when using
/// `cap`. Delegated capabilities resolve to the root of their chain.
pub(crate) fn budget_of(d: &Dbs, tx: &RoTxn, cap: &Capability, principal: &Principal) -> Result<(String, Principal)> {
    if cap.metadata.delegation.is_none() {
        return Ok((cap.id.clone(), principal.clone()));
    }
    let mut seen = HashSet::from([cap.id.clone()]);
    let mut root = cap.clone();
    while let Some(up) = root.metadata.delegation.take() {
        if !seen.insert(up.clone()) {
            return Err(CapError::Integrity(format!("delegation cycle through capability {}", up)));
        }
        match read::capability(d, tx, &up)? {
            Some(parent) => root = parent,
            None => break,
        }
    }
    Ok((root.id, root.principal))
}

/// Budget left under `limit` for `principal` using `cap` in the window
/// containing `now`. Read-only; verification uses this to answer without
/// reserving.
pub(crate) fn remaining(
    d: &Dbs,
    tx: &RoTxn,
    cap: &Capability,
    principal: &Principal,
    limit: &UsageLimit,
    now: DateTime<Utc>,
) -> Result<f64> {
    let (budget_id, budget_principal) = budget_of(d, tx, cap, principal)?;
    let (start, _) = window(limit.period, now);
    let wkey = usage_key(&budget_id, &budget_principal, &limit.usage_type, limit.period, start)?;
    let consumed = read::usage_record(d, tx, &wkey)?.map(|r| r.consumed).unwrap_or(0.0);
    let held = read::held_amount(d, tx, &wkey, now)?;
    Ok((limit.limit - consumed - held).max(0.0))
}

/// Compare-and-increment against one limit, inside the caller's transaction.
fn reserve_in(
    tx: &mut Tx,
    cap: &Capability,
    key: &UsageKey,
    limit: &UsageLimit,
    amount: f64,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Reserved> {
    let (budget_id, budget_principal) = budget_of(tx.dbs(), tx.ro(), cap, &key.principal)?;
    let (start, end) = window(limit.period, now);
    let wkey = usage_key(&budget_id, &budget_principal, &key.usage_type, limit.period, start)?;

    let reclaimed = tx.delete_expired_reservations(&wkey, now)?;
    if reclaimed > 0 {
        debug!(capability = %budget_id, reclaimed, "reclaimed expired reservations");
    }

    let record = match tx.usage_record(&wkey)? {
        Some(r) => r,
        None => {
            let r = UsageRecord {
                capability_id: budget_id.clone(),
                principal: budget_principal.clone(),
                resource: cap.resource.clone(),
                usage_type: key.usage_type.clone(),
                period: limit.period,
                period_start: start,
                period_end: end,
                consumed: 0.0,
                updated_at: now,
            };
            tx.put_usage_record(&wkey, &r)?;
            r
        }
    };
    let held = read::held_amount(tx.dbs(), tx.ro(), &wkey, now)?;
    let available = limit.limit - record.consumed - held;
    if amount > available {
        return Err(CapError::QuotaExceeded {
            capability_id: cap.id.clone(),
            usage_type: key.usage_type.clone(),
            period: limit.period.to_string(),
            limit: limit.limit,
            remaining: available.max(0.0),
        });
    }

    let ticket = Reservation {
        id: generate_id()?,
        capability_id: budget_id,
        principal: budget_principal,
        resource: cap.resource.clone(),
        usage_type: key.usage_type.clone(),
        period: limit.period,
        period_start: start,
        amount,
        reserved_at: now,
        lease_expires_at: now + lease,
    };
    tx.put_reservation(&reservation_key(&wkey, &ticket.id)?, &ticket)?;
    Ok(Reserved { ticket, remaining: available - amount })
}

fn load_metered(tx: &Tx, key: &UsageKey) -> Result<Capability> {
    tx.capability(&key.capability_id)?
        .ok_or_else(|| CapError::not_found("capability", key.capability_id.as_str()))
}

impl Engine {
    /// Reserve `amount` against the capability's `period` limit for the usage
    /// type. Denial is `QuotaExceeded` carrying the budget still available.
    pub fn check_and_reserve(&self, key: &UsageKey, period: Period, amount: f64) -> Result<Reserved> {
        self.check_and_reserve_at(key, period, amount, Utc::now())
    }

    pub fn check_and_reserve_at(&self, key: &UsageKey, period: Period, amount: f64, now: DateTime<Utc>) -> Result<Reserved> {
        validate_amount("requested amount", amount)?;
        let lease = self.reservation_lease();
        let reserved = self.store().transact(|tx| {
            let cap = load_metered(tx, key)?;
            let limit = cap
                .conditions
                .usage_limits
                .iter()
                .find(|l| l.usage_type == key.usage_type && l.period == period)
                .cloned()
                .ok_or_else(|| CapError::not_found("usage limit", format!("{}/{}/{}", cap.id, key.usage_type, period)))?;
            reserve_in(tx, &cap, key, &limit, amount, now, lease)
        })?;
        debug!(capability = %key.capability_id, principal = %key.principal, amount, remaining = reserved.remaining, "usage reserved");
        Ok(reserved)
    }

    /// Reserve against every limit of the usage type at once. Either all
    /// windows accept the amount or nothing is reserved. A capability with no
    /// limit for the usage type yields no tickets.
    pub fn reserve_all(&self, key: &UsageKey, amount: f64) -> Result<Vec<Reserved>> {
        self.reserve_all_at(key, amount, Utc::now())
    }

    pub fn reserve_all_at(&self, key: &UsageKey, amount: f64, now: DateTime<Utc>) -> Result<Vec<Reserved>> {
        validate_amount("requested amount", amount)?;
        let lease = self.reservation_lease();
        self.store().transact(|tx| {
            let cap = load_metered(tx, key)?;
            let limits: Vec<UsageLimit> = cap.conditions.limits_for(Some(&key.usage_type)).cloned().collect();
            limits.iter().map(|l| reserve_in(tx, &cap, key, l, amount, now, lease)).collect()
        })
    }

    /// Settle a reservation with the amount actually consumed. Any surplus
    /// returns to the window's budget. A commit arriving after the ticket's
    /// window closed is charged to the current window instead, so closed
    /// windows are never rewritten.
    ///
    /// A reservation whose lease lapsed is still charged. One already
    /// committed or released is `InvalidState`; a ticket this store never
    /// issued is `NotFound`.
    pub fn commit(&self, ticket: &Reservation, actual: f64) -> Result<UsageRecord> {
        self.commit_at(ticket, actual, Utc::now())
    }

    pub fn commit_at(&self, ticket: &Reservation, actual: f64, now: DateTime<Utc>) -> Result<UsageRecord> {
        validate_amount("actual amount", actual)?;
        let record = self.store().transact(|tx| {
            let held_key = usage_key(&ticket.capability_id, &ticket.principal, &ticket.usage_type, ticket.period, ticket.period_start)?;
            if !tx.delete_reservation(&reservation_key(&held_key, &ticket.id)?)? {
                match tx.reservation_outcome(&ticket.id)? {
                    Some(OUTCOME_LAPSED) => {}
                    Some(_) => {
                        return Err(CapError::InvalidState(format!("reservation {} is already settled", ticket.id)));
                    }
                    None => return Err(CapError::not_found("reservation", ticket.id.as_str())),
                }
            }
            tx.put_reservation_outcome(&ticket.id, OUTCOME_SETTLED)?;

            let (ticket_start, ticket_end) = window(ticket.period, ticket.period_start);
            let (start, end) = if now < ticket_end { (ticket_start, ticket_end) } else { window(ticket.period, now) };
            let wkey = usage_key(&ticket.capability_id, &ticket.principal, &ticket.usage_type, ticket.period, start)?;
            let mut record = tx.usage_record(&wkey)?.unwrap_or_else(|| UsageRecord {
                capability_id: ticket.capability_id.clone(),
                principal: ticket.principal.clone(),
                resource: ticket.resource.clone(),
                usage_type: ticket.usage_type.clone(),
                period: ticket.period,
                period_start: start,
                period_end: end,
                consumed: 0.0,
                updated_at: now,
            });
            record.consumed += actual;
            record.updated_at = now;
            tx.put_usage_record(&wkey, &record)?;
            Ok(record)
        })?;
        debug!(capability = %ticket.capability_id, principal = %ticket.principal, reserved = ticket.amount, actual, consumed = record.consumed, "usage committed");
        Ok(record)
    }

    /// Drop a reservation without consuming anything. Returns false if it was
    /// already committed, released or swept. A released ticket can no longer
    /// be committed.
    pub fn release(&self, ticket: &Reservation) -> Result<bool> {
        self.store().transact(|tx| {
            let held_key = usage_key(&ticket.capability_id, &ticket.principal, &ticket.usage_type, ticket.period, ticket.period_start)?;
            let released = tx.delete_reservation(&reservation_key(&held_key, &ticket.id)?)?;
            if released || tx.reservation_outcome(&ticket.id)? == Some(OUTCOME_LAPSED) {
                tx.put_reservation_outcome(&ticket.id, OUTCOME_SETTLED)?;
            }
            Ok(released)
        })
    }

    /// Budget left in the current window of one limit, without reserving
    pub fn remaining_quota(&self, key: &UsageKey, period: Period) -> Result<Option<f64>> {
        self.remaining_quota_at(key, period, Utc::now())
    }

    pub fn remaining_quota_at(&self, key: &UsageKey, period: Period, now: DateTime<Utc>) -> Result<Option<f64>> {
        self.store().read(|d, tx| {
            let cap = read::capability(d, tx, &key.capability_id)?
                .ok_or_else(|| CapError::not_found("capability", key.capability_id.as_str()))?;
            match cap.conditions.usage_limits.iter().find(|l| l.usage_type == key.usage_type && l.period == period) {
                Some(limit) => Ok(Some(remaining(d, tx, &cap, &key.principal, limit, now)?)),
                None => Ok(None),
            }
        })
    }

    /// Delete every reservation whose lease has run out
    pub fn sweep_expired_reservations(&self) -> Result<usize> {
        self.sweep_expired_reservations_at(Utc::now())
    }

    pub fn sweep_expired_reservations_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let n = self.store().transact(|tx| tx.delete_expired_reservations(&[], now))?;
        if n > 0 {
            info!(swept = n, "expired usage reservations released");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_window() {
        let (s, e) = window(Period::Daily, at("2024-03-15T17:42:00Z"));
        assert_eq!(s, at("2024-03-15T00:00:00Z"));
        assert_eq!(e, at("2024-03-16T00:00:00Z"));
    }

    #[test]
    fn weekly_window_starts_monday() {
        // 2024-03-17 is a Sunday
        let (s, e) = window(Period::Weekly, at("2024-03-17T23:59:59Z"));
        assert_eq!(s, at("2024-03-11T00:00:00Z"));
        assert_eq!(e, at("2024-03-18T00:00:00Z"));
        let (s, _) = window(Period::Weekly, at("2024-03-18T00:00:00Z"));
        assert_eq!(s, at("2024-03-18T00:00:00Z"));
    }

    #[test]
    fn monthly_window_handles_lengths() {
        let (s, e) = window(Period::Monthly, at("2024-02-29T12:00:00Z"));
        assert_eq!(s, at("2024-02-01T00:00:00Z"));
        assert_eq!(e, at("2024-03-01T00:00:00Z"));
        let (s, e) = window(Period::Monthly, at("2023-12-31T23:00:00Z"));
        assert_eq!(s, at("2023-12-01T00:00:00Z"));
        assert_eq!(e, at("2024-01-01T00:00:00Z"));
        let (_, e) = window(Period::Monthly, at("2024-01-01T00:00:00Z"));
        assert_eq!(e, at("2024-02-01T00:00:00Z"));
    }

    #[test]
    fn window_start_is_its_own_window() {
        for p in [Period::Daily, Period::Weekly, Period::Monthly] {
            let (s, e) = window(p, at("2024-07-10T08:00:00Z"));
            assert_eq!(window(p, s), (s, e));
        }
    }

    #[test]
    fn amounts_must_be_finite() {
        assert!(validate_amount("x", 0.0).is_ok());
        assert!(validate_amount("x", -1.0).is_err());
        assert!(validate_amount("x", f64::NAN).is_err());
        assert!(validate_amount("x", f64::INFINITY).is_err());
    }
}
