//! convoy manager library.
//!
//! Ships the `convoy-manager` binary; the library surface exists so the
//! reconciliation engine can be embedded and driven from integration tests.

pub mod allocator;
pub mod api;
pub mod binding;
pub mod cluster;
pub mod config;
pub mod manager;
pub mod model;
pub mod projection;
pub mod reconciler;
pub mod state;
pub mod store;

pub use manager::{Manager, ManagerSettings};
