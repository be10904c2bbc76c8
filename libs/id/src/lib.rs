//! # convoy-id
//!
//! Typed identifiers for convoy resources.
//!
//! Every ID is rendered as `{prefix}_{ulid}`:
//!
//! - `svc_01HV4Z2WQXKJNM8GPQY6VBKC3D` (service)
//! - `task_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (task)
//! - `sec_01HV4Z4NYPLTRS0JTUA8XDME5F` (secret)
//!
//! IDs are assigned by the system and never change; names are user labels.
//! ULIDs sort by creation time, which the reconciler relies on when it has to
//! pick the oldest task of a slot.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
