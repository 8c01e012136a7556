use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::MirrorBuilder;
use super::MirrorParts;
use crate::store::KeyValue;
use crate::store::Revision;
use crate::watch::InitReceiver;
use crate::watch::WatchStream;
use crate::Result;

pub type MirrorMapBuilder<K, V> = MirrorBuilder<HashMap<K, V>, K, V>;

/// Hash map filled from a watch stream.
///
/// Suited for quick single key access or iteration over all keys. To query
/// keys by a common prefix, use [`MirrorTree`](super::MirrorTree).
pub struct MirrorMap<K, V> {
    parts: MirrorParts<HashMap<K, V>, K, V>,
}

impl<K, V> MirrorMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `derive_key(raw_key, value)` computes the map key,
    /// `derive_value(raw_key, value, kv, old_value)` the map value.
    pub fn builder(
        stream: WatchStream,
        derive_key: impl Fn(&str, &Bytes) -> K + Send + Sync + 'static,
        derive_value: impl Fn(&str, &Bytes, &KeyValue, Option<&V>) -> V + Send + Sync + 'static,
    ) -> MirrorMapBuilder<K, V> {
        MirrorBuilder::new(stream, Arc::new(derive_key), Arc::new(derive_value))
    }

    /// Starts the consumer, the receiver resolves once the initial state is loaded.
    pub fn start_mirroring(
        &self,
        tracker: &TaskTracker,
    ) -> Result<InitReceiver> {
        self.parts.start_mirroring(tracker)
    }

    pub fn restart(
        &self,
        cause: impl Into<String>,
    ) {
        self.parts.restart(cause)
    }

    /// Revision of the last applied batch.
    pub fn revision(&self) -> Revision {
        self.parts.core.revision()
    }

    /// Waits until the mirror is synced at least to the `expected` revision.
    pub async fn wait_for_revision(
        &self,
        cancel: &CancellationToken,
        expected: Revision,
    ) -> Result<()> {
        self.parts.core.wait_for_revision(cancel, expected).await
    }

    pub fn len(&self) -> usize {
        self.parts.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.parts.core.data.read().get(key).cloned()
    }

    pub fn clone_map(&self) -> HashMap<K, V> {
        self.parts.core.data.read().clone()
    }

    /// Iterates under the read lock until `f` returns true.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&K, &V) -> bool,
    ) {
        for (k, v) in self.parts.core.data.read().iter() {
            if f(k, v) {
                return;
            }
        }
    }
}

impl<K, V> MirrorMapBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn build(self) -> Result<MirrorMap<K, V>> {
        Ok(MirrorMap {
            parts: self.build_parts()?,
        })
    }
}
