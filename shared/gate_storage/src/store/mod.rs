//! Transactional record store backed by LMDB
//!
//! Records are JSON documents grouped into named collections. Every collection is
//! created when the store is opened, so a handle to a [`RecordStore`] can always
//! address all of them. Keys are fixed-width big-endian integers.

mod error;

use std::ops::Bound;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{de::DeserializeOwned, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

pub use error::{StoreError, StoreResult};

/// Named collections held by the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Collection {
    /// Verification sessions keyed by user id
    UserSessions,
    /// Group verification configuration keyed by group id
    GroupConfigs,
    /// Admin user id to the group they are configuring
    AdminLinks,
    /// Verified users keyed by group id followed by user id
    VerifiedUsers,
}

impl Collection {
    const fn slot(self) -> usize {
        match self {
            Self::UserSessions => 0,
            Self::GroupConfigs => 1,
            Self::AdminLinks => 2,
            Self::VerifiedUsers => 3,
        }
    }
}

const COLLECTION_COUNT: usize = 4;

/// Outcome of a read-modify-write closure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T> {
    /// Store the value under the key
    Put(T),
    /// Remove the key
    Delete,
    /// Leave the record untouched and abort the transaction
    Abort,
}

/// Encodes an id as the 8 byte big-endian key used by every collection
#[must_use]
pub const fn record_key(id: i64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Decodes a key written by [`record_key`]
#[must_use]
pub fn record_id(key: &[u8]) -> Option<i64> {
    <[u8; 8]>::try_from(key).ok().map(i64::from_be_bytes)
}

/// Encodes a `(parent, child)` pair so all children of one parent share a key prefix
#[must_use]
pub fn composite_key(parent: i64, child: i64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&parent.to_be_bytes());
    key[8..].copy_from_slice(&child.to_be_bytes());
    key
}

/// Key range covering `prefix`; LMDB rejects zero-length keys, so an empty prefix is unbounded
fn prefix_bounds<'a>(
    prefix: &'a [u8],
    upper: Option<&'a [u8]>,
) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    let lower = if prefix.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Included(prefix)
    };
    (lower, upper.map_or(Bound::Unbounded, Bound::Excluded))
}

/// Smallest key strictly greater than every key starting with `prefix`
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// LMDB environment holding one database per [`Collection`]
pub struct RecordStore {
    env: Env,
    databases: [Database<Bytes, Bytes>; COLLECTION_COUNT],
}

impl RecordStore {
    /// Opens the environment at `path`, creating the directory and every collection
    ///
    /// # Arguments
    ///
    /// * `path` - Directory holding the LMDB data files
    /// * `map_size` - Maximum size of the memory map in bytes
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the directory cannot be created or LMDB refuses to open
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> StoreResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        // SAFETY: the environment is opened once per directory by this process and the
        // data files are not modified by anything else while it is open.
        #[allow(unsafe_code)]
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(COLLECTION_COUNT as u32)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let mut databases = Vec::with_capacity(COLLECTION_COUNT);
        for collection in Collection::iter() {
            let name = collection.to_string();
            let db = env.create_database::<Bytes, Bytes>(&mut wtxn, Some(name.as_str()))?;
            databases.push(db);
        }
        wtxn.commit()?;

        let databases: [Database<Bytes, Bytes>; COLLECTION_COUNT] = [
            databases[Collection::UserSessions.slot()],
            databases[Collection::GroupConfigs.slot()],
            databases[Collection::AdminLinks.slot()],
            databases[Collection::VerifiedUsers.slot()],
        ];

        tracing::info!(path = %path.display(), map_size, "Opened record store");

        Ok(Self { env, databases })
    }

    const fn db(&self, collection: Collection) -> Database<Bytes, Bytes> {
        self.databases[collection.slot()]
    }

    /// Reads a record, returning `None` when the key is absent
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read transaction fails or the record cannot be decoded
    pub fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &[u8],
    ) -> StoreResult<Option<T>> {
        let rtxn = self.env.read_txn()?;
        let record = self
            .db(collection)
            .get(&rtxn, key)?
            .map(serde_json::from_slice)
            .transpose()?;
        Ok(record)
    }

    /// Writes a record, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the record cannot be encoded or the transaction fails
    pub fn put<T: Serialize>(
        &self,
        collection: Collection,
        key: &[u8],
        record: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(record)?;
        let mut wtxn = self.env.write_txn()?;
        self.db(collection).put(&mut wtxn, key, &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Removes a record, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the transaction fails
    pub fn delete(&self, collection: Collection, key: &[u8]) -> StoreResult<bool> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.db(collection).delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(existed)
    }

    /// Runs a read-modify-write against one key inside a single write transaction
    ///
    /// The closure receives the current record and decides what to store. Returning
    /// [`Mutation::Abort`] or an error rolls the transaction back, so callers never
    /// observe a partially applied change. The closure's second value is handed back
    /// to the caller once the transaction has committed.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a `StoreError` (converted into `E`) if the
    /// transaction, encoding or decoding fails
    pub fn modify<T, R, E, F>(&self, collection: Collection, key: &[u8], f: F) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StoreError>,
        F: FnOnce(Option<T>) -> Result<(Mutation<T>, R), E>,
    {
        let db = self.db(collection);
        let mut wtxn = self.env.write_txn().map_err(StoreError::from)?;

        let current: Option<T> = db
            .get(&wtxn, key)
            .map_err(StoreError::from)?
            .map(serde_json::from_slice)
            .transpose()
            .map_err(StoreError::from)?;

        let (mutation, output) = f(current)?;

        match mutation {
            Mutation::Put(record) => {
                let bytes = serde_json::to_vec(&record).map_err(StoreError::from)?;
                db.put(&mut wtxn, key, &bytes).map_err(StoreError::from)?;
            }
            Mutation::Delete => {
                db.delete(&mut wtxn, key).map_err(StoreError::from)?;
            }
            Mutation::Abort => {
                wtxn.abort();
                return Ok(output);
            }
        }

        wtxn.commit().map_err(StoreError::from)?;
        Ok(output)
    }

    /// Reads every record whose key starts with `prefix`, in key order
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read transaction fails or a record cannot be decoded
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        collection: Collection,
        prefix: &[u8],
    ) -> StoreResult<Vec<(Vec<u8>, T)>> {
        let upper = prefix_upper_bound(prefix);
        let bounds = prefix_bounds(prefix, upper.as_deref());

        let rtxn = self.env.read_txn()?;
        let mut records = Vec::new();
        for entry in self.db(collection).range(&rtxn, &bounds)? {
            let (key, value) = entry?;
            records.push((key.to_vec(), serde_json::from_slice(value)?));
        }
        Ok(records)
    }

    /// Removes every record whose key starts with `prefix`, returning how many were removed
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the transaction fails
    pub fn delete_prefix(&self, collection: Collection, prefix: &[u8]) -> StoreResult<usize> {
        let upper = prefix_upper_bound(prefix);
        let bounds = prefix_bounds(prefix, upper.as_deref());

        let mut wtxn = self.env.write_txn()?;
        let removed = self.db(collection).delete_range(&mut wtxn, &bounds)?;
        wtxn.commit()?;
        Ok(removed)
    }
}
