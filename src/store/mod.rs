//! Consistent key-value store capability.
//!
//! The coordination components talk to the store only through the
//! [`KvStore`] trait: key/prefix reads at a revision, puts bound to a lease,
//! compare-and-swap transactions, lease management and a revision-ordered
//! prefix watch.
//!
//! # Implementations
//!
//! - [`MemStore`]: in-process store with MVCC history, compaction, leases
//!   and fault injection. Used by tests and single-process embedding.
//! - A remote client of the real store is expected to implement the same
//!   trait outside of this crate.
//!
//! # Watch contract
//!
//! ```text
//! watch(prefix, start_revision)
//!        │
//!        ├─► Created { header }                      exactly once, first message
//!        ├─► Events  { header, events }              one message per revision
//!        ├─► Error   (StoreError::Unavailable)       transient, stream continues
//!        └─► Error   (StoreError::Compacted)         terminal, channel closes
//! ```
//!
//! A closed channel means the watcher is gone and must be re-created.
mod mem_store;
pub use mem_store::*;


use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;
use crate::StoreError;

/// Lease identifier, 0 means "no lease".
pub type LeaseId = i64;

/// Store revision, incremented by every write.
pub type Revision = i64;

/// A key-value pair together with its MVCC metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision of the last creation of this key
    pub create_revision: Revision,
    /// Revision of the last modification of this key
    pub mod_revision: Revision,
    /// Number of modifications since the last creation
    pub version: i64,
    pub lease: LeaseId,
}

/// Store revision observed by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub revision: Revision,
}

#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    /// Read at this revision, 0 reads the latest state
    pub revision: Revision,
    /// Only return keys strictly greater than this key, used for paging
    pub after_key: Option<String>,
    /// Maximum number of returned keys, 0 means unlimited
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    /// More keys are available after the last returned one
    pub more: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Bind the key to this lease, 0 means no lease
    pub lease: LeaseId,
    /// Return the previous key-value pair
    pub prev_kv: bool,
}

impl PutOptions {
    pub fn with_lease(lease: LeaseId) -> Self {
        Self {
            lease,
            prev_kv: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

/// Field of a key compared inside a transaction guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Version(i64),
    CreateRevision(Revision),
    ModRevision(Revision),
    Value(Bytes),
    Lease(LeaseId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

/// Guard of a transaction. A missing key has version, revisions and lease 0
/// and an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
    pub op: CompareOp,
}

impl Compare {
    pub fn new(
        key: impl Into<String>,
        op: CompareOp,
        target: CompareTarget,
    ) -> Self {
        Self {
            key: key.into(),
            target,
            op,
        }
    }

    /// The key does not exist.
    pub fn key_missing(key: impl Into<String>) -> Self {
        Self::new(key, CompareOp::Equal, CompareTarget::Version(0))
    }

    /// The key exists.
    pub fn key_exists(key: impl Into<String>) -> Self {
        Self::new(key, CompareOp::Greater, CompareTarget::Version(0))
    }

    pub fn create_revision(
        key: impl Into<String>,
        op: CompareOp,
        revision: Revision,
    ) -> Self {
        Self::new(key, op, CompareTarget::CreateRevision(revision))
    }

    pub fn value(
        key: impl Into<String>,
        op: CompareOp,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(key, op, CompareTarget::Value(value.into()))
    }

    /// The key is bound to the lease, 0 matches keys without a lease.
    pub fn lease(
        key: impl Into<String>,
        op: CompareOp,
        lease: LeaseId,
    ) -> Self {
        Self::new(key, op, CompareTarget::Lease(lease))
    }

    /// Evaluates the guard against the current state of the key.
    pub fn matches(
        &self,
        kv: Option<&KeyValue>,
    ) -> bool {
        use std::cmp::Ordering;

        let ordering = match (&self.target, kv) {
            (CompareTarget::Version(v), kv) => kv.map_or(0, |kv| kv.version).cmp(v),
            (CompareTarget::CreateRevision(r), kv) => kv.map_or(0, |kv| kv.create_revision).cmp(r),
            (CompareTarget::ModRevision(r), kv) => kv.map_or(0, |kv| kv.mod_revision).cmp(r),
            (CompareTarget::Lease(l), kv) => kv.map_or(0, |kv| kv.lease).cmp(l),
            (CompareTarget::Value(v), kv) => {
                kv.map_or(&b""[..], |kv| kv.value.as_ref()).cmp(v.as_ref())
            }
        };
        match self.op {
            CompareOp::Equal => ordering == Ordering::Equal,
            CompareOp::NotEqual => ordering != Ordering::Equal,
            CompareOp::Greater => ordering == Ordering::Greater,
            CompareOp::Less => ordering == Ordering::Less,
        }
    }
}

/// Operation executed by a transaction branch.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Bytes,
        options: PutOptions,
    },
    Delete {
        key: String,
    },
    Get {
        key: String,
    },
}

impl TxnOp {
    pub fn put(
        key: impl Into<String>,
        value: impl Into<Bytes>,
        options: PutOptions,
    ) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }
}

#[derive(Debug, Clone)]
pub enum TxnOpResponse {
    Put(PutResponse),
    Delete(DeleteResponse),
    Get(GetResponse),
}

/// Compare-and-swap transaction: if all `compare` guards hold, `success`
/// is executed, otherwise `failure`. Executed atomically at one revision.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(
        mut self,
        compare: impl IntoIterator<Item = Compare>,
    ) -> Self {
        self.compare.extend(compare);
        self
    }

    pub fn and_then(
        mut self,
        ops: impl IntoIterator<Item = TxnOp>,
    ) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(
        mut self,
        ops: impl IntoIterator<Item = TxnOp>,
    ) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Put,
    Delete,
}

/// Change of one key, as reported by the store watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    /// For deletes only the key and `mod_revision` are set
    pub kv: KeyValue,
    /// Present only if requested by [`WatchOptions::prev_kv`]
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// First revision to deliver, 0 means "after the current revision"
    pub start_revision: Revision,
    /// Attach the previous key-value pair to every event
    pub prev_kv: bool,
}

#[derive(Debug, Clone)]
pub enum RawWatchResponse {
    Created { header: ResponseHeader },
    Events { header: ResponseHeader, events: Vec<RawEvent> },
    Error(StoreError),
}

pub type WatchReceiver = mpsc::UnboundedReceiver<RawWatchResponse>;

/// Capability of a consistent key-value store.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`, they are shared by all components
/// of a node behind an `Arc`.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads a single key at the latest revision.
    async fn get(
        &self,
        key: &str,
    ) -> Result<GetResponse>;

    /// Reads all keys with the prefix, ordered by key.
    ///
    /// # Errors
    /// - [`StoreError::Compacted`] if `options.revision` was compacted
    async fn get_prefix(
        &self,
        prefix: &str,
        options: RangeOptions,
    ) -> Result<GetResponse>;

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        options: PutOptions,
    ) -> Result<PutResponse>;

    async fn delete(
        &self,
        key: &str,
        prev_kv: bool,
    ) -> Result<DeleteResponse>;

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<DeleteResponse>;

    async fn txn(
        &self,
        txn: Txn,
    ) -> Result<TxnResponse>;

    /// Grants a lease with the TTL in seconds.
    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> Result<LeaseId>;

    /// Renews the lease once, returns the remaining TTL in seconds.
    ///
    /// # Errors
    /// - [`StoreError::LeaseNotFound`] if the lease expired or was revoked
    async fn keep_alive_once(
        &self,
        lease: LeaseId,
    ) -> Result<i64>;

    /// Revokes the lease and deletes all keys bound to it.
    async fn revoke_lease(
        &self,
        lease: LeaseId,
    ) -> Result<()>;

    /// Watches all keys with the prefix.
    async fn watch(
        &self,
        prefix: &str,
        options: WatchOptions,
    ) -> Result<WatchReceiver>;
}
