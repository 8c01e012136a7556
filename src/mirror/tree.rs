use std::collections::BTreeMap;
use std::ops::Bound;
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

pub type MirrorTreeBuilder<V> = MirrorBuilder<BTreeMap<String, V>, String, V>;

/// Ordered tree filled from a watch stream, keyed by string paths.
pub struct MirrorTree<V> {
    parts: MirrorParts<BTreeMap<String, V>, String, V>,
}

impl<V> MirrorTree<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(
        stream: WatchStream,
        derive_key: impl Fn(&str, &Bytes) -> String + Send + Sync + 'static,
        derive_value: impl Fn(&str, &Bytes, &KeyValue, Option<&V>) -> V + Send + Sync + 'static,
    ) -> MirrorTreeBuilder<V> {
        MirrorBuilder::new(stream, Arc::new(derive_key), Arc::new(derive_value))
    }

    /// Tree keyed by the raw store keys.
    pub fn full_builder(
        stream: WatchStream,
        derive_value: impl Fn(&str, &Bytes, &KeyValue, Option<&V>) -> V + Send + Sync + 'static,
    ) -> MirrorTreeBuilder<V> {
        Self::builder(stream, |key, _| key.to_string(), derive_value)
    }

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

    pub fn revision(&self) -> Revision {
        self.parts.core.revision()
    }

    pub async fn wait_for_revision(
        &self,
        cancel: &CancellationToken,
        expected: Revision,
    ) -> Result<()> {
        self.parts.core.wait_for_revision(cancel, expected).await
    }

    /// Runs `f` with a consistent read-only view of the whole tree.
    pub fn atomic<R>(
        &self,
        f: impl FnOnce(&BTreeMap<String, V>) -> R,
    ) -> R {
        f(&self.parts.core.data.read())
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<V> {
        self.parts.core.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.parts.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<V> {
        self.parts.core.data.read().values().cloned().collect()
    }

    pub fn all_from_prefix(
        &self,
        prefix: &str,
    ) -> Vec<V> {
        self.atomic(|data| prefix_range(data, prefix).map(|(_, v)| v.clone()).collect())
    }

    pub fn first_from_prefix(
        &self,
        prefix: &str,
    ) -> Option<V> {
        self.atomic(|data| prefix_range(data, prefix).next().map(|(_, v)| v.clone()))
    }

    pub fn last_from_prefix(
        &self,
        prefix: &str,
    ) -> Option<V> {
        self.atomic(|data| prefix_range(data, prefix).last().map(|(_, v)| v.clone()))
    }

    /// Walks keys with the prefix in order, until `f` returns true.
    pub fn walk_prefix(
        &self,
        prefix: &str,
        mut f: impl FnMut(&str, &V) -> bool,
    ) {
        self.atomic(|data| {
            for (k, v) in prefix_range(data, prefix) {
                if f(k, v) {
                    return;
                }
            }
        })
    }

    pub fn walk_all(
        &self,
        f: impl FnMut(&str, &V) -> bool,
    ) {
        self.walk_prefix("", f)
    }

    pub fn to_map(&self) -> BTreeMap<String, V> {
        self.parts.core.data.read().clone()
    }
}

impl<V> MirrorTreeBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn build(self) -> Result<MirrorTree<V>> {
        Ok(MirrorTree {
            parts: self.build_parts()?,
        })
    }
}

fn prefix_range<'a, V>(
    data: &'a BTreeMap<String, V>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a V)> + 'a {
    data.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(prefix))
}
