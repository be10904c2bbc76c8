//! convoy node agent library.
//!
//! A reference implementation of the node side of the manager/agent
//! contract. The agent runs in the manager's process, starts containers
//! through a [`Runtime`] and keeps a small SQLite record of its tasks so a
//! restarted agent can report what it lost.
//!
//! ## Modules
//!
//! - `agent`: [`LocalAgent`], the `NodeAgent` implementation
//! - `runtime`: container runtime interface and the in-memory mock
//! - `volumes`: named volumes under the data directory
//! - `state`: local SQLite state persistence
//! - `heartbeat`: periodic liveness reports

pub mod agent;
pub mod config;
pub mod heartbeat;
pub mod runtime;
pub mod state;
pub mod volumes;

pub use agent::{AgentStartError, LocalAgent};
pub use config::AgentConfig;
pub use runtime::{ContainerInspect, MockRuntime, Runtime};
