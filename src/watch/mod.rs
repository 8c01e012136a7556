//! Resilient watch streams over a key prefix.
//!
//! ```text
//!  KvStore::get_prefix (paged, one revision)
//!  KvStore::watch (revision + 1)
//!         │
//!         ▼
//!  ┌──────────────────┐  WatchResponse   ┌──────────────────┐  for_each(events, header, restart)
//!  │ WatchStream      │ ───────────────► │ WatchConsumer    │ ─────────────────────────────────► Mirror / Orchestrator
//!  │ (restart worker) │ ◄─────────────── │ (dispatch worker)│
//!  └──────────────────┘  restart(cause)  └──────────────────┘
//! ```
//!
//! The stream survives disconnects and compaction by re-running the whole
//! load-then-watch sequence. After a restart, the entire current state is
//! delivered as one batch flagged `restart = true` and consumers replace
//! their state with it.
mod consumer;
mod stream;
pub use consumer::*;
pub use stream::*;

#[cfg(test)]
mod stream_test;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::store::KeyValue;
use crate::store::RawEvent;
use crate::store::RawEventKind;
use crate::store::ResponseHeader;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            EventKind::Create => write!(f, "create"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// Change of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value; for deletes the previous value if tracked, otherwise empty
    pub value: Bytes,
    /// Previous value, set for updates and deletes when `prev_kv` was requested
    pub prev_value: Option<Bytes>,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    /// Event of the "get all" phase, every existing key is reported as created.
    pub(crate) fn from_existing(kv: KeyValue) -> Self {
        Self {
            kind: EventKind::Create,
            key: kv.key.clone(),
            value: kv.value.clone(),
            prev_value: None,
            kv,
            prev_kv: None,
        }
    }

    pub(crate) fn from_raw(raw: RawEvent) -> Self {
        let kind = match raw.kind {
            RawEventKind::Put if raw.kv.version == 1 => EventKind::Create,
            RawEventKind::Put => EventKind::Update,
            RawEventKind::Delete => EventKind::Delete,
        };
        let prev_value = match kind {
            EventKind::Create => None,
            _ => raw.prev_kv.as_ref().map(|p| p.value.clone()),
        };
        let value = match kind {
            EventKind::Delete => prev_value.clone().unwrap_or_default(),
            _ => raw.kv.value.clone(),
        };
        Self {
            kind,
            key: raw.kv.key.clone(),
            value,
            prev_value,
            kv: raw.kv,
            prev_kv: raw.prev_kv,
        }
    }

    /// Decodes the JSON value of the event.
    pub fn decode_value<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(Error::from)
    }

    /// Decodes the JSON previous value of the event, if tracked.
    pub fn decode_prev_value<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.prev_value
            .as_ref()
            .map(|v| serde_json::from_slice(v))
            .transpose()
            .map_err(Error::from)
    }
}

/// One message of a [`WatchStream`].
#[derive(Debug)]
pub enum WatchResponse {
    /// The first attempt failed before the watcher was created, the stream closes
    InitErr(Error),
    /// Recoverable error, possibly followed by `Restarted`
    Err(Error),
    /// The watcher is being re-created, the next `Events` batch is a full state
    Restarted { cause: String, delay: Duration },
    /// The watcher is established, emitted once per stream
    Created { header: ResponseHeader },
    /// The stream ended after a failure it cannot recover from, last message
    Closed(Error),
    /// Events of one revision, or the full state if `restart` is set
    Events {
        header: ResponseHeader,
        events: Vec<WatchEvent>,
        restart: bool,
    },
}

/// Sorts events of one revision: PUT before DELETE, then by key A→Z.
pub(crate) fn sort_revision_events(events: &mut [RawEvent]) {
    events.sort_by(|a, b| {
        let rank = |e: &RawEvent| matches!(e.kind, RawEventKind::Delete) as u8;
        rank(a).cmp(&rank(b)).then_with(|| a.kv.key.cmp(&b.kv.key))
    });
}
