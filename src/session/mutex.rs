//! Distributed mutex bound to the session lease.
//!
//! A [`Mutex`] is also a local lock: a second `lock` call in the same
//! process waits until the first holder unlocks, even though the store-side
//! lock is held by the same lease. The store-side lock is acquired by the
//! first local holder and released when nobody in the process uses the name
//! anymore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::session::wait_for_lease;
use super::LeaseHandle;
use crate::store::Compare;
use crate::store::CompareOp;
use crate::store::KvStore;
use crate::store::PutOptions;
use crate::store::RangeOptions;
use crate::store::RawEventKind;
use crate::store::RawWatchResponse;
use crate::store::ResponseHeader;
use crate::store::Revision;
use crate::store::Txn;
use crate::store::TxnOp;
use crate::store::TxnOpResponse;
use crate::store::WatchOptions;
use crate::utils::async_task::with_timeout;
use crate::Error;
use crate::LockError;
use crate::Result;
use crate::SessionError;

/// User-facing handle of a named lock, see [`Session::new_mutex`](super::Session::new_mutex).
pub struct Mutex {
    store: MutexStore,
    name: String,
    locked: Option<Arc<ActiveMutex>>,
}

impl Mutex {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key of the held lock, or the lock name if not locked.
    pub fn key(&self) -> String {
        self.store_lock()
            .map(|l| l.key.clone())
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn is_locked(&self) -> bool {
        self.store_lock().is_some()
    }

    /// Header of the acquiring request, its revision can be used as a fencing token.
    pub fn header(&self) -> Option<ResponseHeader> {
        self.store_lock().map(|l| l.header)
    }

    /// Guard checking the lock ownership inside a store transaction.
    ///
    /// `None` if the mutex is not locked. Only writes of the same transaction
    /// are fenced, side effects performed outside of the store between
    /// [`Mutex::lock`] and the transaction are not.
    pub fn is_owner(&self) -> Option<Compare> {
        self.store_lock()
            .map(|l| Compare::create_revision(l.key.clone(), CompareOp::Equal, l.create_revision))
    }

    /// Locks the mutex, waiting for the local holder and for the store-side
    /// owner if necessary.
    ///
    /// You cannot use the store as a naive locking system, couple writes
    /// with [`Mutex::is_owner`] or the [`Mutex::header`] revision.
    pub async fn lock(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let active = self.store.get_ready(&self.name, cancel).await?;
        let result = async {
            active.local_lock(cancel).await?;
            if let Err(e) = self.store.store_lock(&active, cancel, None).await {
                active.local_unlock()?;
                return Err(e);
            }
            Ok(())
        }
        .await;
        self.finish_lock(active, result).await
    }

    /// Locks the mutex if it is free both locally and in the store, otherwise
    /// fails with [`LockError::AlreadyLocked`].
    pub async fn try_lock(
        &mut self,
        cancel: &CancellationToken,
        reason: &str,
    ) -> Result<()> {
        let active = self.store.get_ready(&self.name, cancel).await?;
        let result = async {
            active.local_try_lock(reason)?;
            if let Err(e) = self.store.store_lock(&active, cancel, Some(reason)).await {
                active.local_unlock()?;
                return Err(e);
            }
            Ok(())
        }
        .await;
        self.finish_lock(active, result).await
    }

    pub async fn unlock(&mut self) -> Result<()> {
        let active = self.locked.take().ok_or(LockError::NotLocked)?;
        let released = self.store.release(&active).await;
        active.local_unlock()?;
        released
    }

    async fn finish_lock(
        &mut self,
        active: Arc<ActiveMutex>,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.locked = Some(active);
                Ok(())
            }
            Err(e) => {
                let _ = self.store.release(&active).await;
                Err(e)
            }
        }
    }

    fn store_lock(&self) -> Option<Arc<StoreLock>> {
        self.locked.as_ref().and_then(|a| a.store_lock.lock().clone())
    }
}

/// Registry of the mutexes used by one session.
#[derive(Clone)]
pub(crate) struct MutexStore {
    inner: Arc<MutexStoreInner>,
}

struct MutexStoreInner {
    kv: Arc<dyn KvStore>,
    leases: watch::Receiver<Option<LeaseHandle>>,
    session_closed: CancellationToken,
    request_timeout: Duration,
    all: parking_lot::Mutex<HashMap<String, Slot>>,
}

struct Slot {
    active: Arc<ActiveMutex>,
    /// Holders and waiters of the name
    usage: usize,
    /// Set while the store-side lock is being released
    teardown: Option<CancellationToken>,
}

pub(crate) struct ActiveMutex {
    name: String,
    gate: Semaphore,
    store_lock: parking_lot::Mutex<Option<Arc<StoreLock>>>,
}

impl MutexStore {
    pub(crate) fn new(
        kv: Arc<dyn KvStore>,
        leases: watch::Receiver<Option<LeaseHandle>>,
        session_closed: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MutexStoreInner {
                kv,
                leases,
                session_closed,
                request_timeout,
                all: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn new_mutex(
        &self,
        name: String,
    ) -> Mutex {
        Mutex {
            store: self.clone(),
            name,
            locked: None,
        }
    }

    /// Number of names in use, for tests.
    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.inner.all.lock().len()
    }

    /// Returns the mutex of the name with incremented usage, waits while a
    /// previous instance is being torn down.
    async fn get_ready(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ActiveMutex>> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let teardown = {
                let mut all = self.inner.all.lock();
                let slot = all.entry(name.to_string()).or_insert_with(|| Slot {
                    active: Arc::new(ActiveMutex {
                        name: name.to_string(),
                        gate: Semaphore::new(1),
                        store_lock: parking_lot::Mutex::new(None),
                    }),
                    usage: 0,
                    teardown: None,
                });
                match &slot.teardown {
                    None => {
                        slot.usage += 1;
                        return Ok(slot.active.clone());
                    }
                    Some(teardown) => teardown.clone(),
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = teardown.cancelled() => {}
            }
        }
    }

    /// Decrements the usage, the last user releases the store-side lock.
    async fn release(
        &self,
        active: &Arc<ActiveMutex>,
    ) -> Result<()> {
        let (store_lock, teardown) = {
            let mut all = self.inner.all.lock();
            let Some(slot) = all.get_mut(&active.name) else {
                return Ok(());
            };
            slot.usage = slot.usage.saturating_sub(1);
            if slot.usage > 0 {
                return Ok(());
            }
            let teardown = CancellationToken::new();
            slot.teardown = Some(teardown.clone());
            (active.store_lock.lock().take(), teardown)
        };

        let mut result = Ok(());
        if let Some(lock) = store_lock {
            if let Err(e) = with_timeout(self.inner.request_timeout, lock.unlock(&self.inner.kv)).await {
                // State of the store-side lock is unknown, give up the lease
                warn!(lock = %lock.key, "cannot release mutex: {e}");
                lock.lease.abandon();
                result = Err(e);
            }
        }

        self.inner.all.lock().remove(&active.name);
        teardown.cancel();
        result
    }

    /// Acquires the store-side lock, only by the first local holder.
    ///
    /// `try_reason` switches to the non-blocking variant.
    async fn store_lock(
        &self,
        active: &ActiveMutex,
        cancel: &CancellationToken,
        try_reason: Option<&str>,
    ) -> Result<()> {
        let current = active.store_lock.lock().clone();
        if let Some(lock) = current {
            if lock.lease.is_done() {
                *active.store_lock.lock() = None;
                return Err(LockError::SessionExpired.into());
            }
            return Ok(());
        }

        let lease = match try_reason {
            Some(_) => match self.inner.leases.borrow().clone() {
                Some(lease) if !lease.is_done() => lease,
                _ => return Err(SessionError::NoSession.into()),
            },
            None => wait_for_lease(self.inner.leases.clone(), cancel, &self.inner.session_closed).await?,
        };

        let lock = StoreLock::acquire(&self.inner.kv, &active.name, lease, cancel, try_reason).await?;
        debug!(lock = %lock.key, revision = lock.create_revision, "mutex acquired");
        *active.store_lock.lock() = Some(Arc::new(lock));
        Ok(())
    }
}

impl ActiveMutex {
    async fn local_lock(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = self.gate.acquire() => {
                permit.map_err(|_| Error::Fatal(format!("mutex \"{}\" gate closed", self.name)))?.forget();
                Ok(())
            }
        }
    }

    fn local_try_lock(
        &self,
        reason: &str,
    ) -> Result<()> {
        match self.gate.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(LockError::AlreadyLocked {
                reason: reason.to_string(),
            }
            .into()),
        }
    }

    fn local_unlock(&self) -> Result<()> {
        if self.gate.available_permits() > 0 {
            return Err(LockError::NotLocked.into());
        }
        self.gate.add_permits(1);
        Ok(())
    }
}

/// Store-side lock using ordered keys.
///
/// Every contender puts `<name>/<lease hex>` bound to its lease. The key with
/// the lowest create revision owns the lock, the others wait for deletion of
/// their direct predecessor, which avoids waking all waiters at once.
pub(crate) struct StoreLock {
    key: String,
    create_revision: Revision,
    header: ResponseHeader,
    lease: LeaseHandle,
}

impl StoreLock {
    async fn acquire(
        kv: &Arc<dyn KvStore>,
        name: &str,
        lease: LeaseHandle,
        cancel: &CancellationToken,
        try_reason: Option<&str>,
    ) -> Result<StoreLock> {
        let prefix = format!("{name}/");
        let key = format!("{prefix}{:x}", lease.id());

        let resp = kv
            .txn(
                Txn::new()
                    .when([Compare::key_missing(key.clone())])
                    .and_then([TxnOp::put(key.clone(), Bytes::new(), PutOptions::with_lease(lease.id()))])
                    .or_else([TxnOp::get(key.clone())]),
            )
            .await?;
        let create_revision = if resp.succeeded {
            resp.header.revision
        } else {
            match resp.responses.first() {
                Some(TxnOpResponse::Get(get)) => get.kvs.first().map_or(resp.header.revision, |kv| kv.create_revision),
                _ => resp.header.revision,
            }
        };

        let acquired = Self::wait_for_ownership(kv, &prefix, &key, create_revision, &lease, cancel, try_reason).await;
        match acquired {
            Ok(header) => Ok(StoreLock {
                key,
                create_revision,
                header,
                lease,
            }),
            Err(e) => {
                // Leaves the queue, the key would otherwise block others until the lease expires
                if let Err(delete_err) = kv.delete(&key, false).await {
                    debug!(lock = %key, "cannot delete lock key: {delete_err}");
                }
                Err(e)
            }
        }
    }

    async fn wait_for_ownership(
        kv: &Arc<dyn KvStore>,
        prefix: &str,
        key: &str,
        create_revision: Revision,
        lease: &LeaseHandle,
        cancel: &CancellationToken,
        try_reason: Option<&str>,
    ) -> Result<ResponseHeader> {
        loop {
            let contenders = kv.get_prefix(prefix, RangeOptions::default()).await?;
            if !contenders.kvs.iter().any(|kv| kv.key == key) {
                return Err(LockError::SessionExpired.into());
            }

            let predecessor = contenders
                .kvs
                .iter()
                .filter(|kv| kv.create_revision < create_revision)
                .max_by_key(|kv| kv.create_revision);
            let Some(predecessor) = predecessor else {
                return Ok(contenders.header);
            };

            if let Some(reason) = try_reason {
                return Err(LockError::AlreadyLocked {
                    reason: reason.to_string(),
                }
                .into());
            }

            debug!(lock = %key, waiting_for = %predecessor.key, "mutex is locked, waiting");
            Self::wait_deleted(kv, &predecessor.key, contenders.header.revision, lease, cancel).await?;
        }
    }

    /// Returns once the key was deleted, or when it is unknown whether it was.
    async fn wait_deleted(
        kv: &Arc<dyn KvStore>,
        key: &str,
        revision: Revision,
        lease: &LeaseHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut rx = kv
            .watch(
                key,
                WatchOptions {
                    start_revision: revision + 1,
                    prev_kv: false,
                },
            )
            .await?;

        loop {
            let resp = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = lease.done() => return Err(LockError::SessionExpired.into()),
                resp = rx.recv() => resp,
            };
            match resp {
                Some(RawWatchResponse::Events { events, .. }) => {
                    if events.iter().any(|e| e.kind == RawEventKind::Delete && e.kv.key == key) {
                        return Ok(());
                    }
                }
                Some(RawWatchResponse::Created { .. }) => {}
                Some(RawWatchResponse::Error(_)) | None => return Ok(()),
            }
        }
    }

    async fn unlock(
        &self,
        kv: &Arc<dyn KvStore>,
    ) -> Result<()> {
        kv.delete(&self.key, false).await?;
        debug!(lock = %self.key, "mutex released");
        Ok(())
    }
}
