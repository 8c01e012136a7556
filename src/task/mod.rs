//! At-most-once background tasks across the cluster.
//!
//! ```text
//!   watch event ──► Orchestrator ──is_owner?──► DistributionAssigner
//!                        │
//!                        ▼ start_task
//!                    TaskNode ── local lock ──► txn { lock key missing } ──► put task + lock key (lease)
//!                        │
//!                        ▼ background
//!                    operation(TaskContext) ──► txn { put finished task, delete lock key }
//! ```
//!
//! The local lock prevents duplicates on one node, e.g. during periodic
//! re-syncs of the orchestrator. The transaction prevents duplicates in the
//! cluster. If a node crashes, its lock keys are removed together with the
//! session lease.
mod assigner;
mod model;
mod node;
mod orchestrator;
pub use assigner::*;
pub use model::*;
pub use node::*;
pub use orchestrator::*;

#[cfg(test)]
mod orchestrator_test;
