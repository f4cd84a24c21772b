//! LMDB environment, tables and transaction helpers

use std::sync::Arc;

use heed::types::{Bytes, Str, U64};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::constants::*;
use crate::error::{codec_err, store_err, Result};
use crate::keys::{last_part, pair_key, single_prefix};
use crate::tx::Tx;

// Database type aliases
/// Index table: composite key -> issued-at epoch millis
pub type Index = Database<Bytes, U64<byteorder::BigEndian>>;
/// Entity table: key -> JSON document
pub type Rows = Database<Bytes, Bytes>;

/// Bidirectional index: fwd[a,b] and rev[b,a] stay in sync
pub struct BiPair {
    pub fwd: Index,
    pub rev: Index,
}

impl BiPair {
    #[inline]
    pub fn contains(&self, tx: &RoTxn, a: &str, b: &str) -> Result<bool> {
        Ok(self.fwd.get(tx, &pair_key(a, b)?).map_err(store_err)?.is_some())
    }

    #[inline]
    pub fn put(&self, tx: &mut RwTxn, a: &str, b: &str, v: u64) -> Result<()> {
        self.fwd.put(tx, &pair_key(a, b)?, &v).map_err(store_err)?;
        self.rev.put(tx, &pair_key(b, a)?, &v).map_err(store_err)
    }

    #[inline]
    pub fn del(&self, tx: &mut RwTxn, a: &str, b: &str) -> Result<bool> {
        let r = self.fwd.delete(tx, &pair_key(a, b)?).map_err(store_err)?;
        self.rev.delete(tx, &pair_key(b, a)?).map_err(store_err)?;
        Ok(r)
    }

    pub fn list_fwd(&self, tx: &RoTxn, a: &str) -> Result<Vec<(String, u64)>> {
        index_ids(tx, &self.fwd, &single_prefix(a)?)
    }

    pub fn list_rev(&self, tx: &RoTxn, b: &str) -> Result<Vec<(String, u64)>> {
        index_ids(tx, &self.rev, &single_prefix(b)?)
    }
}

/// All database handles
pub struct Dbs {
    pub caps: Rows,
    pub caps_by_principal: Index,
    pub caps_by_resource: Index,
    pub caps_by_parent: Index,
    pub caps_by_request: Index,
    pub requests: Rows,
    pub requests_by_owner: Index,
    pub groups: Rows,
    pub group_members: BiPair,
    pub usage: Rows,
    pub reservations: Rows,
    /// reservation id -> lapsed or settled; a live reservation has no entry
    pub reservation_outcomes: Index,
    pub meta: Database<Str, Str>,
}

/// Handle to the capability store. Cheap to clone; clones share the
/// environment.
#[derive(Clone)]
pub struct Store {
    env: Env,
    dbs: Arc<Dbs>,
}

impl Store {
    /// Open (creating if needed) the LMDB environment at `config.db_path`.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.db_path).map_err(store_err)?;
        // SAFETY: LMDB requires no other process to open this path with a conflicting configuration concurrently.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size)
                .max_dbs(config.max_dbs)
                .open(&config.db_path)
                .map_err(store_err)?
        };
        let mut tx = env.write_txn().map_err(store_err)?;
        let dbs = Dbs {
            caps: env.create_database(&mut tx, Some(T_CAPABILITIES)).map_err(store_err)?,
            caps_by_principal: env.create_database(&mut tx, Some(T_CAPS_BY_PRINCIPAL)).map_err(store_err)?,
            caps_by_resource: env.create_database(&mut tx, Some(T_CAPS_BY_RESOURCE)).map_err(store_err)?,
            caps_by_parent: env.create_database(&mut tx, Some(T_CAPS_BY_PARENT)).map_err(store_err)?,
            caps_by_request: env.create_database(&mut tx, Some(T_CAPS_BY_REQUEST)).map_err(store_err)?,
            requests: env.create_database(&mut tx, Some(T_REQUESTS)).map_err(store_err)?,
            requests_by_owner: env.create_database(&mut tx, Some(T_REQUESTS_BY_OWNER)).map_err(store_err)?,
            groups: env.create_database(&mut tx, Some(T_GROUPS)).map_err(store_err)?,
            group_members: BiPair {
                fwd: env.create_database(&mut tx, Some(T_GROUP_MEMBERS)).map_err(store_err)?,
                rev: env.create_database(&mut tx, Some(T_GROUP_MEMBERS_REV)).map_err(store_err)?,
            },
            usage: env.create_database(&mut tx, Some(T_USAGE)).map_err(store_err)?,
            reservations: env.create_database(&mut tx, Some(T_RESERVATIONS)).map_err(store_err)?,
            reservation_outcomes: env.create_database(&mut tx, Some(T_RESERVATION_OUTCOMES)).map_err(store_err)?,
            meta: env.create_database(&mut tx, Some(T_META)).map_err(store_err)?,
        };
        tx.commit().map_err(store_err)?;
        debug!(path = %config.db_path.display(), "capability store opened");
        Ok(Store { env, dbs: Arc::new(dbs) })
    }

    /// Execute a read-only operation against a consistent snapshot
    #[inline]
    pub fn read<T, F: FnOnce(&Dbs, &RoTxn) -> Result<T>>(&self, f: F) -> Result<T> {
        let tx = self.env.read_txn().map_err(store_err)?;
        f(&self.dbs, &tx)
    }

    /// Run multiple writes in a single transaction. Nothing is visible to
    /// readers unless `f` succeeds and the commit lands.
    #[inline]
    pub fn transact<T, F: FnOnce(&mut Tx) -> Result<T>>(&self, f: F) -> Result<T> {
        let mut tx = Tx::new(self.env.write_txn().map_err(store_err)?, &self.dbs);
        let r = f(&mut tx)?;
        tx.commit()?;
        Ok(r)
    }
}

// ============================================================================
// Row and index helpers
// ============================================================================

pub(crate) fn get_row<T: DeserializeOwned>(tx: &RoTxn, db: &Rows, key: &[u8]) -> Result<Option<T>> {
    match db.get(tx, key).map_err(store_err)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes).map_err(codec_err)?)),
        None => Ok(None),
    }
}

pub(crate) fn put_row<T: Serialize>(tx: &mut RwTxn, db: &Rows, key: &[u8], row: &T) -> Result<()> {
    let bytes = serde_json::to_vec(row).map_err(codec_err)?;
    db.put(tx, key, &bytes).map_err(store_err)
}

/// Decode every row whose key starts with `prefix`, returning (key, row)
pub(crate) fn scan_rows<T: DeserializeOwned>(tx: &RoTxn, db: &Rows, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
    let mut r = Vec::new();
    for item in db.prefix_iter(tx, prefix).map_err(store_err)? {
        let (k, v) = item.map_err(store_err)?;
        r.push((k.to_vec(), serde_json::from_slice(v).map_err(codec_err)?));
    }
    Ok(r)
}

/// Record ids (the last key part) and values under an index prefix
pub(crate) fn index_ids(tx: &RoTxn, db: &Index, prefix: &[u8]) -> Result<Vec<(String, u64)>> {
    let mut r = Vec::new();
    for item in db.prefix_iter(tx, prefix).map_err(store_err)? {
        let (k, v) = item.map_err(store_err)?;
        if let Some(id) = last_part(k) {
            r.push((id.to_string(), v));
        }
    }
    Ok(r)
}
