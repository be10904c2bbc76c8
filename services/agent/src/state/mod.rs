//! Local state persistence for the node agent.
//!
//! SQLite-based storage for:
//! - Node state (the node's identity, last heartbeat)
//! - Task records (phase, container ID, exit code)
//!
//! The state store lets the agent keep its identity across restarts and
//! report tasks whose containers were lost while it was down.

mod store;

pub use store::{NodeState, StateStore, StateStoreError, TaskPhase, TaskRecord};
