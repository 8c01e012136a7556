//! In-process implementation of [`KvStore`].
//!
//! All state lives behind one mutex, every write allocates the next revision
//! and is published to the watchers while the mutex is still held, so
//! watchers observe revisions in order without gaps.
//!
//! History is kept per revision until it is compacted. Reads at an older
//! revision are served by undoing the newer events on a copy of the current
//! state.
//!
//! Leases expire lazily on every operation and eagerly through a reaper
//! worker, spawned when the store is created inside a tokio runtime.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::*;

/// Cheaply cloneable handle to an in-memory store.
#[derive(Clone)]
pub struct MemStore {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    lease_granted: Arc<Notify>,
    closed: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

struct Lease {
    ttl_secs: i64,
    expires_at: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<RawWatchResponse>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    compact_revision: Revision,
    data: BTreeMap<String, KeyValue>,
    /// Events of every revision after `compact_revision`, `prev_kv` always set
    history: BTreeMap<Revision, Vec<RawEvent>>,
    leases: HashMap<LeaseId, Lease>,
    last_lease_id: LeaseId,
    watchers: Vec<Watcher>,
    unavailable: Option<String>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("MemStore")
            .field("revision", &inner.revision)
            .field("keys", &inner.data.len())
            .field("leases", &inner.leases.len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            lease_granted: Arc::new(Notify::new()),
            closed: CancellationToken::new(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_expired_leases(
                Arc::downgrade(&shared),
                shared.lease_granted.clone(),
                shared.closed.clone(),
            ));
        }

        Self { shared }
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.shared.inner.lock().revision
    }

    /// Removes history up to and including `revision`.
    ///
    /// Existing watchers are not affected, new watchers and reads starting
    /// at or before `revision` fail with [`StoreError::Compacted`].
    pub fn compact(
        &self,
        revision: Revision,
    ) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if revision > inner.revision {
            return Err(StoreError::InvalidRequest(format!(
                "compact revision {revision} is in the future, current revision {}",
                inner.revision
            ))
            .into());
        }
        if revision > inner.compact_revision {
            inner.compact_revision = revision;
            inner.history = inner.history.split_off(&(revision + 1));
            debug!(revision, "compacted");
        }
        Ok(())
    }

    /// Makes every operation fail with [`StoreError::Unavailable`], `None` heals the store.
    pub fn set_unavailable(
        &self,
        reason: Option<&str>,
    ) {
        self.shared.inner.lock().unavailable = reason.map(str::to_string);
    }

    /// Sends a recoverable error to all watchers.
    pub fn send_watch_error(
        &self,
        err: StoreError,
    ) {
        let mut inner = self.shared.inner.lock();
        inner
            .watchers
            .retain(|w| w.tx.send(RawWatchResponse::Error(err.clone())).is_ok());
    }

    /// Closes all watch channels, optionally sending a final error first.
    pub fn cancel_watchers(
        &self,
        err: Option<StoreError>,
    ) {
        let mut inner = self.shared.inner.lock();
        for w in inner.watchers.drain(..) {
            if let Some(err) = &err {
                let _ = w.tx.send(RawWatchResponse::Error(err.clone()));
            }
        }
    }

    /// Expires the lease immediately, as if the TTL elapsed.
    pub fn expire_lease(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        self.shared.inner.lock().revoke(lease)
    }

    pub fn lease_ids(&self) -> Vec<LeaseId> {
        let mut ids: Vec<_> = self.shared.inner.lock().leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn watcher_count(&self) -> usize {
        let mut inner = self.shared.inner.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    fn lock_available(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let mut inner = self.shared.inner.lock();
        inner.expire_leases(Instant::now());
        if let Some(reason) = &inner.unavailable {
            return Err(StoreError::Unavailable(reason.clone()).into());
        }
        Ok(inner)
    }
}

#[async_trait::async_trait]
impl KvStore for MemStore {
    async fn get(
        &self,
        key: &str,
    ) -> Result<GetResponse> {
        let inner = self.lock_available()?;
        Ok(GetResponse {
            header: inner.header(),
            kvs: inner.data.get(key).cloned().into_iter().collect(),
            more: false,
        })
    }

    async fn get_prefix(
        &self,
        prefix: &str,
        options: RangeOptions,
    ) -> Result<GetResponse> {
        let inner = self.lock_available()?;
        let state = inner.prefix_state_at(prefix, options.revision)?;

        let mut kvs = Vec::new();
        let mut more = false;
        for (key, kv) in state {
            if options.after_key.as_deref().is_some_and(|after| key.as_str() <= after) {
                continue;
            }
            if options.limit > 0 && kvs.len() == options.limit {
                more = true;
                break;
            }
            kvs.push(kv);
        }

        Ok(GetResponse {
            header: inner.header(),
            kvs,
            more,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        options: PutOptions,
    ) -> Result<PutResponse> {
        let mut inner = self.lock_available()?;
        let rev = inner.revision + 1;
        let mut events = Vec::with_capacity(1);
        let mut resp = inner.put_at(rev, key, value, options, &mut events)?;
        inner.commit(rev, events);
        resp.header = inner.header();
        Ok(resp)
    }

    async fn delete(
        &self,
        key: &str,
        prev_kv: bool,
    ) -> Result<DeleteResponse> {
        let mut inner = self.lock_available()?;
        let rev = inner.revision + 1;
        let mut events = Vec::with_capacity(1);
        let prev = inner.delete_at(rev, key, &mut events);
        inner.commit(rev, events);
        Ok(DeleteResponse {
            header: inner.header(),
            deleted: prev.is_some() as i64,
            prev_kvs: if prev_kv { prev.into_iter().collect() } else { vec![] },
        })
    }

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<DeleteResponse> {
        let mut inner = self.lock_available()?;
        let rev = inner.revision + 1;
        let keys: Vec<String> = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();

        let mut events = Vec::with_capacity(keys.len());
        let mut prev_kvs = Vec::with_capacity(keys.len());
        for key in keys {
            prev_kvs.extend(inner.delete_at(rev, &key, &mut events));
        }
        inner.commit(rev, events);
        Ok(DeleteResponse {
            header: inner.header(),
            deleted: prev_kvs.len() as i64,
            prev_kvs,
        })
    }

    async fn txn(
        &self,
        txn: Txn,
    ) -> Result<TxnResponse> {
        let mut inner = self.lock_available()?;
        let succeeded = txn.compare.iter().all(|c| c.matches(inner.data.get(&c.key)));
        let ops = if succeeded { txn.success } else { txn.failure };

        // Validate before the first write, the transaction is all or nothing
        for op in &ops {
            if let TxnOp::Put { options, .. } = op {
                if options.lease != 0 && !inner.leases.contains_key(&options.lease) {
                    return Err(StoreError::LeaseNotFound(options.lease).into());
                }
            }
        }

        let rev = inner.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let resp = match op {
                TxnOp::Put { key, value, options } => {
                    TxnOpResponse::Put(inner.put_at(rev, &key, value, options, &mut events)?)
                }
                TxnOp::Delete { key } => {
                    let prev = inner.delete_at(rev, &key, &mut events);
                    TxnOpResponse::Delete(DeleteResponse {
                        header: ResponseHeader::default(),
                        deleted: prev.is_some() as i64,
                        prev_kvs: vec![],
                    })
                }
                TxnOp::Get { key } => TxnOpResponse::Get(GetResponse {
                    header: ResponseHeader::default(),
                    kvs: inner.data.get(&key).cloned().into_iter().collect(),
                    more: false,
                }),
            };
            responses.push(resp);
        }
        inner.commit(rev, events);

        let header = inner.header();
        for resp in responses.iter_mut() {
            match resp {
                TxnOpResponse::Put(r) => r.header = header,
                TxnOpResponse::Delete(r) => r.header = header,
                TxnOpResponse::Get(r) => r.header = header,
            }
        }
        trace!(succeeded, revision = header.revision, "txn");
        Ok(TxnResponse {
            header,
            succeeded,
            responses,
        })
    }

    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(StoreError::InvalidRequest(format!("invalid lease ttl {ttl_secs}")).into());
        }
        let id = {
            let mut inner = self.lock_available()?;
            inner.last_lease_id += 1;
            let id = inner.last_lease_id;
            inner.leases.insert(
                id,
                Lease {
                    ttl_secs,
                    expires_at: Instant::now() + Duration::from_secs(ttl_secs as u64),
                    keys: BTreeSet::new(),
                },
            );
            id
        };
        self.shared.lease_granted.notify_one();
        debug!(lease = id, ttl_secs, "lease granted");
        Ok(id)
    }

    async fn keep_alive_once(
        &self,
        lease: LeaseId,
    ) -> Result<i64> {
        let mut inner = self.lock_available()?;
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.expires_at = Instant::now() + Duration::from_secs(entry.ttl_secs as u64);
        Ok(entry.ttl_secs)
    }

    async fn revoke_lease(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        self.lock_available()?.revoke(lease)
    }

    async fn watch(
        &self,
        prefix: &str,
        options: WatchOptions,
    ) -> Result<WatchReceiver> {
        let mut inner = self.lock_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let start = if options.start_revision > 0 {
            options.start_revision
        } else {
            inner.revision + 1
        };

        let _ = tx.send(RawWatchResponse::Created {
            header: inner.header(),
        });

        if start <= inner.compact_revision {
            let _ = tx.send(RawWatchResponse::Error(StoreError::Compacted {
                requested: start,
                compact_revision: inner.compact_revision,
            }));
            return Ok(rx);
        }

        let watcher = Watcher {
            prefix: prefix.to_string(),
            prev_kv: options.prev_kv,
            tx,
        };
        for (rev, events) in inner.history.range(start..) {
            watcher.deliver(*rev, events);
        }
        inner.watchers.push(watcher);
        Ok(rx)
    }
}

impl Watcher {
    /// Returns false if the receiver is gone.
    fn deliver(
        &self,
        revision: Revision,
        events: &[RawEvent],
    ) -> bool {
        let events: Vec<RawEvent> = events
            .iter()
            .filter(|e| e.kv.key.starts_with(&self.prefix))
            .map(|e| RawEvent {
                kind: e.kind,
                kv: e.kv.clone(),
                prev_kv: if self.prev_kv { e.prev_kv.clone() } else { None },
            })
            .collect();
        if events.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx
            .send(RawWatchResponse::Events {
                header: ResponseHeader { revision },
                events,
            })
            .is_ok()
    }
}

impl Inner {
    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.revision,
        }
    }

    fn put_at(
        &mut self,
        rev: Revision,
        key: &str,
        value: Bytes,
        options: PutOptions,
        events: &mut Vec<RawEvent>,
    ) -> Result<PutResponse> {
        if options.lease != 0 && !self.leases.contains_key(&options.lease) {
            return Err(StoreError::LeaseNotFound(options.lease).into());
        }

        let prev = self.data.get(key).cloned();
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map_or(rev, |p| p.create_revision),
            mod_revision: rev,
            version: prev.as_ref().map_or(0, |p| p.version) + 1,
            lease: options.lease,
        };

        if let Some(p) = &prev {
            if p.lease != 0 && p.lease != options.lease {
                if let Some(l) = self.leases.get_mut(&p.lease) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(l) = self.leases.get_mut(&options.lease) {
            l.keys.insert(key.to_string());
        }

        self.data.insert(kv.key.clone(), kv.clone());
        events.push(RawEvent {
            kind: RawEventKind::Put,
            kv,
            prev_kv: prev.clone(),
        });

        Ok(PutResponse {
            header: ResponseHeader::default(),
            prev_kv: if options.prev_kv { prev } else { None },
        })
    }

    fn delete_at(
        &mut self,
        rev: Revision,
        key: &str,
        events: &mut Vec<RawEvent>,
    ) -> Option<KeyValue> {
        let prev = self.data.remove(key)?;
        if prev.lease != 0 {
            if let Some(l) = self.leases.get_mut(&prev.lease) {
                l.keys.remove(key);
            }
        }
        events.push(RawEvent {
            kind: RawEventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                mod_revision: rev,
                ..Default::default()
            },
            prev_kv: Some(prev.clone()),
        });
        Some(prev)
    }

    /// Publishes the events of one revision, no-op for read-only operations.
    fn commit(
        &mut self,
        rev: Revision,
        events: Vec<RawEvent>,
    ) {
        if events.is_empty() {
            return;
        }
        self.revision = rev;
        self.watchers.retain(|w| w.deliver(rev, &events));
        self.history.insert(rev, events);
    }

    fn revoke(
        &mut self,
        lease: LeaseId,
    ) -> Result<()> {
        let entry = self
            .leases
            .remove(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        let rev = self.revision + 1;
        let mut events = Vec::with_capacity(entry.keys.len());
        for key in &entry.keys {
            self.delete_at(rev, key, &mut events);
        }
        debug!(lease, keys = entry.keys.len(), "lease revoked");
        self.commit(rev, events);
        Ok(())
    }

    fn expire_leases(
        &mut self,
        now: Instant,
    ) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = id, "lease expired");
            let _ = self.revoke(id);
        }
    }

    fn next_lease_expiry(&self) -> Option<Instant> {
        self.leases.values().map(|l| l.expires_at).min()
    }

    /// State of the keys under `prefix` at `revision`, 0 means latest.
    fn prefix_state_at(
        &self,
        prefix: &str,
        revision: Revision,
    ) -> Result<BTreeMap<String, KeyValue>> {
        if revision > self.revision {
            return Err(StoreError::InvalidRequest(format!(
                "revision {revision} is in the future, current revision {}",
                self.revision
            ))
            .into());
        }
        if revision > 0 && revision < self.compact_revision {
            return Err(StoreError::Compacted {
                requested: revision,
                compact_revision: self.compact_revision,
            }
            .into());
        }

        let mut state: BTreeMap<String, KeyValue> = self
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if revision == 0 || revision == self.revision {
            return Ok(state);
        }

        for (_, events) in self.history.range(revision + 1..).rev() {
            for event in events.iter().rev() {
                if !event.kv.key.starts_with(prefix) {
                    continue;
                }
                match (&event.kind, &event.prev_kv) {
                    (_, Some(prev)) => {
                        state.insert(prev.key.clone(), prev.clone());
                    }
                    (RawEventKind::Put, None) => {
                        state.remove(&event.kv.key);
                    }
                    (RawEventKind::Delete, None) => {}
                }
            }
        }
        Ok(state)
    }
}

async fn reap_expired_leases(
    shared: Weak<Shared>,
    lease_granted: Arc<Notify>,
    closed: CancellationToken,
) {
    loop {
        let next = match shared.upgrade() {
            Some(shared) => {
                let mut inner = shared.inner.lock();
                inner.expire_leases(Instant::now());
                inner.next_lease_expiry()
            }
            None => return,
        };

        match next {
            Some(at) => tokio::select! {
                _ = closed.cancelled() => return,
                _ = lease_granted.notified() => {},
                _ = tokio::time::sleep_until(at) => {},
            },
            None => tokio::select! {
                _ = closed.cancelled() => return,
                _ = lease_granted.notified() => {},
            },
        }
    }
}
