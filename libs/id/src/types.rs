//! Typed ID definitions for all convoy resources.

use crate::define_id;

// =============================================================================
// Desired state
// =============================================================================

define_id!(
    /// Immutable identity of a service across all of its spec versions.
    ServiceId,
    "svc"
);
define_id!(
    /// Identity of a stored secret.
    SecretId,
    "sec"
);

// =============================================================================
// Runtime
// =============================================================================

define_id!(
    /// One task record. A replacement task for the same slot gets a new ID.
    TaskId,
    "task"
);
define_id!(NodeId, "node");
define_id!(ContainerId, "ctr");

// =============================================================================
// Slots
// =============================================================================

/// Replica position within a service, 1-based.
///
/// A slot outlives the tasks that fill it: when a task fails, its replacement
/// keeps the slot number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Slot(u64);

impl Slot {
    /// The first slot of every service.
    pub const FIRST: Self = Self(1);

    /// Creates a slot from its number.
    #[must_use]
    pub const fn new(slot: u64) -> Self {
        Self(slot)
    }

    /// Returns the slot number.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Iterates over the slots `1..=replicas`.
    pub fn range(replicas: u64) -> impl Iterator<Item = Slot> {
        (1..=replicas).map(Slot)
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;

    #[test]
    fn test_service_id_roundtrip() {
        let id = ServiceId::new();
        let parsed: ServiceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("svc_"));
    }

    #[test]
    fn test_invalid_prefix() {
        let err = "task_01HV4Z2WQXKJNM8GPQY6VBKC3D"
            .parse::<ServiceId>()
            .unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let err = "svc01HV4Z2WQXKJNM8GPQY6VBKC3D"
            .parse::<ServiceId>()
            .unwrap_err();
        assert_eq!(err, IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        assert_eq!("".parse::<TaskId>().unwrap_err(), IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        assert!(matches!(
            "sec_invalid".parse::<SecretId>().unwrap_err(),
            IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = NodeId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = TaskId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = TaskId::new();
        assert!(first < second);
    }

    #[test]
    fn test_short_form() {
        let id = ContainerId::new();
        let short = id.short();
        assert_eq!(short.len(), 12);
        assert_eq!(short, short.to_ascii_lowercase());
    }

    #[test]
    fn test_slot_range() {
        let slots: Vec<u64> = Slot::range(3).map(|s| s.value()).collect();
        assert_eq!(slots, vec![1, 2, 3]);
        assert_eq!(Slot::range(0).count(), 0);
        assert_eq!(serde_json::to_string(&Slot::FIRST).unwrap(), "1");
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_never_panics(s in ".*") {
            let _ = s.parse::<TaskId>();
        }
    }
}
