//! In-memory projections of a watched prefix.
//!
//! A mirror consumes a [`WatchStream`] and keeps a local copy of the prefix,
//! keyed by a derived key. Every batch of the stream is applied atomically
//! under one write lock, then the mirror revision is advanced and
//! [`wait_for_revision`](MirrorMap::wait_for_revision) callers are woken.
//!
//! - [`MirrorMap`]: hash map, fast single key access.
//! - [`MirrorTree`]: ordered by string key, supports prefix queries.
//!
//! Writes are performed exclusively by the watch stream, the public API is
//! read-only.
mod map;
mod tree;
pub use map::*;
pub use tree::*;


use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::metrics::CoordMetrics;
use crate::store::KeyValue;
use crate::store::ResponseHeader;
use crate::store::Revision;
use crate::watch::EventKind;
use crate::watch::InitReceiver;
use crate::watch::RestartHandle;
use crate::watch::WatchConsumer;
use crate::watch::WatchEvent;
use crate::watch::WatchStream;
use crate::Error;
use crate::Result;

/// Emitted once per applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorUpdate {
    pub header: ResponseHeader,
    /// The batch replaced the whole state
    pub restart: bool,
}

/// [`MirrorUpdate`] with the list of applied changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorUpdateChanges<K, V> {
    pub update: MirrorUpdate,
    pub created: Vec<(K, V)>,
    pub updated: Vec<(K, V)>,
    pub deleted: Vec<(K, V)>,
}

pub type DeriveKeyFn<K> = Arc<dyn Fn(&str, &Bytes) -> K + Send + Sync>;
/// `(raw key, value, raw key-value, previous value at the old key)`, the
/// previous value is set only for updates.
pub type DeriveValueFn<V> = Arc<dyn Fn(&str, &Bytes, &KeyValue, Option<&V>) -> V + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&WatchEvent) -> bool + Send + Sync>;
pub type OnUpdateFn = Arc<dyn Fn(MirrorUpdate) + Send + Sync>;
pub type OnChangesFn<K, V> = Arc<dyn Fn(MirrorUpdateChanges<K, V>) + Send + Sync>;

/// Local storage of a mirror.
#[doc(hidden)]
pub trait MirrorStorage<K, V>: Default + Send + Sync + 'static {
    fn get(
        &self,
        key: &K,
    ) -> Option<&V>;

    fn insert(
        &mut self,
        key: K,
        value: V,
    );

    fn remove(
        &mut self,
        key: &K,
    ) -> Option<V>;

    fn clear(&mut self);

    fn len(&self) -> usize;
}

impl<K, V> MirrorStorage<K, V> for HashMap<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn get(
        &self,
        key: &K,
    ) -> Option<&V> {
        HashMap::get(self, key)
    }

    fn insert(
        &mut self,
        key: K,
        value: V,
    ) {
        HashMap::insert(self, key, value);
    }

    fn remove(
        &mut self,
        key: &K,
    ) -> Option<V> {
        HashMap::remove(self, key)
    }

    fn clear(&mut self) {
        HashMap::clear(self)
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }
}

impl<V> MirrorStorage<String, V> for BTreeMap<String, V>
where
    V: Send + Sync + 'static,
{
    fn get(
        &self,
        key: &String,
    ) -> Option<&V> {
        BTreeMap::get(self, key)
    }

    fn insert(
        &mut self,
        key: String,
        value: V,
    ) {
        BTreeMap::insert(self, key, value);
    }

    fn remove(
        &mut self,
        key: &String,
    ) -> Option<V> {
        BTreeMap::remove(self, key)
    }

    fn clear(&mut self) {
        BTreeMap::clear(self)
    }

    fn len(&self) -> usize {
        BTreeMap::len(self)
    }
}

/// State and reconciliation logic shared by the map and the tree.
pub(crate) struct MirrorCore<S, K, V> {
    prefix: String,
    pub(crate) data: RwLock<S>,
    revision: watch::Sender<Revision>,
    derive_key: DeriveKeyFn<K>,
    derive_value: DeriveValueFn<V>,
    filter: Option<FilterFn>,
    on_update: Vec<OnUpdateFn>,
    on_changes: Vec<OnChangesFn<K, V>>,
    metrics: Option<CoordMetrics>,
}

impl<S, K, V> MirrorCore<S, K, V>
where
    S: MirrorStorage<K, V>,
    K: Clone + PartialEq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Applies one batch atomically.
    fn apply(
        &self,
        events: Vec<WatchEvent>,
        header: ResponseHeader,
        restart: bool,
    ) {
        let update = MirrorUpdate { header, restart };
        let track_changes = !self.on_changes.is_empty();
        let mut changes = MirrorUpdateChanges {
            update,
            created: vec![],
            updated: vec![],
            deleted: vec![],
        };

        let len = {
            let mut data = self.data.write();
            if restart {
                data.clear();
            }

            for event in &events {
                if let Some(filter) = &self.filter {
                    if !filter(event) {
                        continue;
                    }
                }

                let new_key = (self.derive_key)(&event.key, &event.value);
                let old_key = match &event.prev_value {
                    Some(prev) => (self.derive_key)(&event.key, prev),
                    None => new_key.clone(),
                };

                match event.kind {
                    EventKind::Create => {
                        let value = (self.derive_value)(&event.key, &event.value, &event.kv, None);
                        if track_changes {
                            changes.created.push((new_key.clone(), value.clone()));
                        }
                        data.insert(new_key, value);
                    }
                    EventKind::Update => {
                        let old_value = if old_key != new_key {
                            data.remove(&old_key)
                        } else {
                            data.get(&old_key).cloned()
                        };
                        let value = (self.derive_value)(
                            &event.key,
                            &event.value,
                            &event.kv,
                            old_value.as_ref(),
                        );
                        if track_changes {
                            changes.updated.push((new_key.clone(), value.clone()));
                        }
                        data.insert(new_key, value);
                    }
                    EventKind::Delete => {
                        if let Some(old_value) = data.remove(&old_key) {
                            if track_changes {
                                changes.deleted.push((old_key, old_value));
                            }
                        }
                    }
                }
            }
            data.len()
        };

        self.revision.send_if_modified(|current| {
            if header.revision > *current {
                *current = header.revision;
                true
            } else {
                false
            }
        });
        debug!(prefix = %self.prefix, revision = header.revision, "watch stream mirror synced to revision");

        if let Some(m) = &self.metrics {
            m.mirror_keys.with_label_values(&[&self.prefix]).set(len as i64);
            m.mirror_revision.with_label_values(&[&self.prefix]).set(header.revision);
        }

        for f in &self.on_update {
            let f = f.clone();
            tokio::spawn(async move { f(update) });
        }
        for f in &self.on_changes {
            let f = f.clone();
            let changes = changes.clone();
            tokio::spawn(async move { f(changes) });
        }
    }

    fn revision(&self) -> Revision {
        *self.revision.borrow()
    }

    async fn wait_for_revision(
        &self,
        cancel: &CancellationToken,
        expected: Revision,
    ) -> Result<()> {
        let mut rx = self.revision.subscribe();
        tokio::select! {
            biased;
            r = rx.wait_for(|rev| *rev >= expected) => r.map(|_| ()).map_err(|_| Error::Cancelled),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }
}

/// Shared builder of [`MirrorMap`] and [`MirrorTree`], `S` is the storage type.
pub struct MirrorBuilder<S, K, V> {
    stream: WatchStream,
    derive_key: DeriveKeyFn<K>,
    derive_value: DeriveValueFn<V>,
    filter: Option<FilterFn>,
    on_update: Vec<OnUpdateFn>,
    on_changes: Vec<OnChangesFn<K, V>>,
    metrics: Option<CoordMetrics>,
    _storage: PhantomData<fn() -> S>,
}

impl<S, K, V> MirrorBuilder<S, K, V>
where
    S: MirrorStorage<K, V>,
    K: Clone + PartialEq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        stream: WatchStream,
        derive_key: DeriveKeyFn<K>,
        derive_value: DeriveValueFn<V>,
    ) -> Self {
        Self {
            stream,
            derive_key,
            derive_value,
            filter: None,
            on_update: vec![],
            on_changes: vec![],
            metrics: None,
            _storage: PhantomData,
        }
    }

    /// The filter must return true if the event should be applied.
    pub fn filter(
        mut self,
        f: impl Fn(&WatchEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Called after each atomic update, with the synced revision.
    pub fn on_update(
        mut self,
        f: impl Fn(MirrorUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_update.push(Arc::new(f));
        self
    }

    /// Called after each atomic update, with the applied changes.
    pub fn on_changes(
        mut self,
        f: impl Fn(MirrorUpdateChanges<K, V>) + Send + Sync + 'static,
    ) -> Self {
        self.on_changes.push(Arc::new(f));
        self
    }

    pub fn metrics(
        mut self,
        metrics: CoordMetrics,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn build_parts(self) -> Result<MirrorParts<S, K, V>> {
        let (revision, _) = watch::channel(0);
        let core = Arc::new(MirrorCore {
            prefix: self.stream.prefix().to_string(),
            data: RwLock::new(S::default()),
            revision,
            derive_key: self.derive_key,
            derive_value: self.derive_value,
            filter: self.filter,
            on_update: self.on_update,
            on_changes: self.on_changes,
            metrics: self.metrics,
        });

        let apply_core = core.clone();
        let consumer = WatchConsumer::builder(self.stream)
            .for_each(move |events, header, restart| apply_core.apply(events, header, restart))
            .build()?;

        Ok(MirrorParts {
            restart: consumer.restart_handle(),
            consumer: Mutex::new(Some(consumer)),
            core,
        })
    }
}

/// Fields common to both mirror types.
pub(crate) struct MirrorParts<S, K, V> {
    pub(crate) core: Arc<MirrorCore<S, K, V>>,
    consumer: Mutex<Option<WatchConsumer>>,
    restart: RestartHandle,
}

impl<S, K, V> MirrorParts<S, K, V>
where
    S: MirrorStorage<K, V>,
    K: Clone + PartialEq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn start_mirroring(
        &self,
        tracker: &TaskTracker,
    ) -> Result<InitReceiver> {
        let consumer = self
            .consumer
            .lock()
            .take()
            .ok_or_else(|| Error::Fatal(format!("mirror of \"{}\" already started", self.core.prefix)))?;
        Ok(consumer.start(tracker))
    }

    fn restart(
        &self,
        cause: impl Into<String>,
    ) {
        self.restart.restart(cause)
    }
}
