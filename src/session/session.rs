use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::Mutex;
use super::MutexStore;
use crate::store::KvStore;
use crate::store::LeaseId;
use crate::utils::async_task::cancellable;
use crate::utils::async_task::sleep_or_cancel;
use crate::utils::async_task::with_timeout;
use crate::utils::backoff::ExponentialBackoff;
use crate::watch::InitReceiver;
use crate::BoxError;
use crate::Error;
use crate::Result;
use crate::SessionConfig;
use crate::SessionError;
use crate::StoreError;

/// Called on each session creation, before the lease is published.
///
/// The callback must not block. Work started from it should watch
/// [`LeaseHandle::done`].
pub type OnSessionFn = Arc<dyn Fn(&LeaseHandle) -> std::result::Result<(), BoxError> + Send + Sync>;

/// One granted lease of a [`Session`].
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    id: LeaseId,
    done: CancellationToken,
}

impl LeaseHandle {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// The lease expired or the session was closed.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn done(&self) {
        self.done.cancelled().await
    }

    /// Marks the lease as lost, the session creates a new one.
    pub(crate) fn abandon(&self) {
        self.done.cancel();
    }
}

pub struct SessionBuilder {
    store: Arc<dyn KvStore>,
    config: SessionConfig,
    on_session: Vec<OnSessionFn>,
}

impl SessionBuilder {
    pub fn on_session(
        mut self,
        f: impl Fn(&LeaseHandle) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.on_session.push(Arc::new(f));
        self
    }

    /// Starts the session worker.
    ///
    /// The receiver resolves after the first lease was granted, renewed once
    /// and all `on_session` callbacks succeeded. An initialization error
    /// stops the worker, later failures are retried until `cancel` fires.
    pub fn start(
        self,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> (Session, InitReceiver) {
        let (current, _) = watch::channel(None);
        let closed = CancellationToken::new();
        let inner = Arc::new(SessionInner {
            mutexes: MutexStore::new(
                self.store.clone(),
                current.subscribe(),
                closed.clone(),
                self.config.ttl(),
            ),
            store: self.store,
            current,
            cancel,
            closed,
        });

        let (init_tx, init_rx) = oneshot::channel();
        let worker = SessionWorker {
            inner: inner.clone(),
            backoff: ExponentialBackoff::new(self.config.recreate_backoff),
            config: self.config,
            on_session: self.on_session,
        };
        tracker.spawn(worker.run(init_tx));

        (Session { inner }, init_rx)
    }

    /// Starts the session and waits for the initialization.
    pub async fn start_or_err(
        self,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Result<Session> {
        let (session, init) = self.start(tracker, cancel);
        init.await.map_err(|_| Error::Cancelled)??;
        Ok(session)
    }
}

/// Lease-backed session, re-created after each failure until cancelled.
///
/// Cheap to clone, all clones share the same lease.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: Arc<dyn KvStore>,
    current: watch::Sender<Option<LeaseHandle>>,
    mutexes: MutexStore,
    cancel: CancellationToken,
    /// Fired once the worker revoked the last lease and stopped
    closed: CancellationToken,
}

impl Session {
    pub fn builder(
        store: Arc<dyn KvStore>,
        config: SessionConfig,
    ) -> SessionBuilder {
        SessionBuilder {
            store,
            config,
            on_session: vec![],
        }
    }

    /// Shortcut for a session without `on_session` callbacks.
    pub fn start(
        store: Arc<dyn KvStore>,
        config: SessionConfig,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> (Session, InitReceiver) {
        Self::builder(store, config).start(tracker, cancel)
    }

    /// Active lease, or [`SessionError::NoSession`] during an outage.
    pub fn session(&self) -> Result<LeaseHandle> {
        active_lease(&self.inner.current.borrow())
    }

    /// Returns the active lease, waits for a new one during an outage.
    pub async fn wait_for_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LeaseHandle> {
        wait_for_lease(self.inner.current.subscribe(), cancel, &self.inner.closed).await
    }

    pub fn new_mutex(
        &self,
        name: impl Into<String>,
    ) -> Mutex {
        self.inner.mutexes.new_mutex(name.into())
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.inner.store
    }

    /// Cancels the session and waits until its lease is revoked.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn mutexes_count(&self) -> usize {
        self.inner.mutexes.active_count()
    }
}

fn active_lease(current: &Option<LeaseHandle>) -> Result<LeaseHandle> {
    match current {
        Some(lease) if !lease.is_done() => Ok(lease.clone()),
        _ => Err(SessionError::NoSession.into()),
    }
}

pub(crate) async fn wait_for_lease(
    mut current: watch::Receiver<Option<LeaseHandle>>,
    cancel: &CancellationToken,
    closed: &CancellationToken,
) -> Result<LeaseHandle> {
    loop {
        let lease = current.borrow_and_update().clone();
        if let Ok(lease) = active_lease(&lease) {
            return Ok(lease);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = closed.cancelled() => return Err(SessionError::NoSession.into()),
            r = current.changed() => {
                if r.is_err() {
                    return Err(SessionError::NoSession.into());
                }
            }
        }
    }
}

struct SessionWorker {
    inner: Arc<SessionInner>,
    config: SessionConfig,
    backoff: ExponentialBackoff,
    on_session: Vec<OnSessionFn>,
}

impl SessionWorker {
    async fn run(
        mut self,
        init_tx: oneshot::Sender<Result<()>>,
    ) {
        let cancel = self.inner.cancel.clone();
        let mut init_tx = Some(init_tx);

        while !cancel.is_cancelled() {
            info!("creating session");
            let started = Instant::now();

            let lease = match self.new_session(&cancel).await {
                Ok(lease) => lease,
                Err(err) => {
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(Err(err));
                        break;
                    }
                    if err.is_cancelled() {
                        continue;
                    }
                    let delay = self.backoff.next_backoff().unwrap_or(self.config.recreate_backoff.max_delay());
                    info!("cannot create session: {err}, waiting {delay:?} before the retry");
                    sleep_or_cancel(&cancel, delay).await;
                    continue;
                }
            };

            info!(lease = lease.id, elapsed = ?started.elapsed(), "created session");
            self.backoff.reset();
            self.inner.current.send_replace(Some(lease.clone()));
            if let Some(tx) = init_tx.take() {
                let _ = tx.send(Ok(()));
            }

            if self.keep_alive(&lease, &cancel).await {
                warn!(lease = lease.id, "session expired");
                lease.abandon();
            } else {
                self.close_session(&lease).await;
            }
        }

        self.inner.current.send_replace(None);
        self.inner.closed.cancel();
    }

    async fn new_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LeaseHandle> {
        let store = &self.inner.store;
        let grant_timeout = self.config.grant_timeout();

        let id = cancellable(cancel, async {
            match tokio::time::timeout(grant_timeout, store.grant_lease(self.config.ttl_secs)).await {
                Ok(r) => r,
                Err(_) => Err(SessionError::GrantTimeout(grant_timeout).into()),
            }
        })
        .await?;
        let lease = LeaseHandle {
            id,
            done: CancellationToken::new(),
        };

        let init = async {
            // Checks the connection before the lease is handed out
            cancellable(cancel, with_timeout(grant_timeout, store.keep_alive_once(id))).await?;

            for (index, f) in self.on_session.iter().enumerate() {
                if let Err(e) = f(&lease) {
                    let err = SessionError::Callback {
                        index,
                        message: e.to_string(),
                    };
                    error!("{err}");
                    return Err(err.into());
                }
            }
            Ok(())
        };

        if let Err(err) = init.await {
            lease.abandon();
            let _ = with_timeout(grant_timeout, store.revoke_lease(id)).await;
            return Err(err);
        }
        Ok(lease)
    }

    /// Renews the lease until it is lost (returns true) or `cancel` fires.
    async fn keep_alive(
        &self,
        lease: &LeaseHandle,
        cancel: &CancellationToken,
    ) -> bool {
        let interval = self.config.keep_alive_interval();
        let ttl = self.config.ttl();
        let mut last_renewal = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = lease.done() => return true,
                _ = tokio::time::sleep(interval) => {}
            }

            let renewal = cancellable(cancel, with_timeout(interval, self.inner.store.keep_alive_once(lease.id))).await;
            match renewal {
                Ok(remaining) => {
                    last_renewal = Instant::now();
                    trace!(lease = lease.id, remaining, "session lease renewed");
                }
                Err(Error::Store(StoreError::LeaseNotFound(_))) => return true,
                Err(e) if e.is_cancelled() => return false,
                Err(e) => {
                    if last_renewal.elapsed() >= ttl {
                        return true;
                    }
                    warn!(lease = lease.id, "session keep-alive failed: {e}");
                }
            }
        }
    }

    async fn close_session(
        &self,
        lease: &LeaseHandle,
    ) {
        info!(lease = lease.id, "closing session");
        let started = Instant::now();
        lease.abandon();
        match with_timeout(self.config.grant_timeout(), self.inner.store.revoke_lease(lease.id)).await {
            Ok(()) => info!(lease = lease.id, elapsed = ?started.elapsed(), "closed session"),
            Err(e) => warn!(lease = lease.id, "cannot close session: {e}"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease", &self.inner.current.borrow().as_ref().map(|l| l.id))
            .field("closed", &self.is_closed())
            .finish()
    }
}
