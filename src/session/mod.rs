//! Lease-backed sessions and distributed mutexes.
//!
//! ```text
//!            grant + keep_alive_once + on_session
//!  creating ───────────────────────────────────────► active
//!     ▲                                                │
//!     │  backoff          lease lost (expired, revoked, │
//!     └──────────────── keep-alive failing for > ttl) ◄─┘
//!                                                      │ cancel
//!                                                      ▼
//!                                                   closed (lease revoked)
//! ```
//!
//! A [`Session`] keeps exactly one lease alive and re-creates it after a
//! loss. Keys bound to the lease disappear from the store together with it,
//! which is what makes the [`Mutex`] and the task locks crash-safe.
mod mutex;
mod session;
pub use mutex::*;
pub use session::*;
