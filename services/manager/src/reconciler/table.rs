//! The reconciler's task table.
//!
//! An arena of tasks indexed by task ID, plus one [`SlotEntry`] per
//! `(service, slot)` pointing at the slot's current task and its recent
//! history. Only the reconciler owns a table, so nothing here locks.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use convoy_id::{NodeId, ServiceId, Slot, TaskId};

use super::task::{Task, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub service_id: ServiceId,
    pub slot: Slot,
}

impl SlotKey {
    pub fn new(service_id: ServiceId, slot: Slot) -> Self {
        Self { service_id, slot }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service_id, self.slot)
    }
}

#[derive(Debug, Default)]
pub struct SlotEntry {
    /// Most recent task created for the slot.
    pub current: Option<TaskId>,

    /// Older tasks, oldest first.
    pub history: VecDeque<TaskId>,

    /// A dispatch job for `current` has not reported back yet.
    pub in_flight: bool,

    /// The slot is above the replica count or its service is gone.
    pub retired: bool,

    /// The previous task was stopped for a rolling update and the
    /// replacement is not running yet.
    pub replacing: bool,

    /// Tasks created after a previous one ended.
    pub restarts: u64,

    /// No replacement before this instant.
    pub restart_at: Option<Instant>,

    /// Node that last failed a dispatch for this slot.
    pub avoid: Option<NodeId>,
}

#[derive(Debug)]
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    slots: BTreeMap<SlotKey, SlotEntry>,
    history_limit: usize,
}

impl TaskTable {
    pub fn new(history_limit: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            slots: BTreeMap::new(),
            history_limit,
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn slot(&self, key: &SlotKey) -> Option<&SlotEntry> {
        self.slots.get(key)
    }

    /// Entry for `key`, created on first use.
    pub fn slot_mut(&mut self, key: SlotKey) -> &mut SlotEntry {
        self.slots.entry(key).or_default()
    }

    /// Mark the slot's dispatch job as finished, if the slot still exists.
    pub fn clear_in_flight(&mut self, key: &SlotKey) {
        if let Some(entry) = self.slots.get_mut(key) {
            entry.in_flight = false;
        }
    }

    /// The slot's current task.
    pub fn current(&self, key: &SlotKey) -> Option<&Task> {
        self.slots
            .get(key)
            .and_then(|e| e.current)
            .and_then(|id| self.tasks.get(&id))
    }

    /// The slot's current task if it is not terminal.
    pub fn live(&self, key: &SlotKey) -> Option<&Task> {
        self.current(key).filter(|t| t.is_live())
    }

    /// Make `task` the current task of its slot.
    ///
    /// The previous task moves to the slot's history; history beyond the
    /// limit is dropped from the table.
    pub fn insert(&mut self, task: Task) -> TaskId {
        let id = task.id;
        let key = task.slot_key();
        let limit = self.history_limit;

        let entry = self.slots.entry(key).or_default();
        if let Some(previous) = entry.current.replace(id) {
            entry.history.push_back(previous);
        }
        let mut dropped = Vec::new();
        while entry.history.len() > limit {
            if let Some(old) = entry.history.pop_front() {
                dropped.push(old);
            }
        }

        for old in dropped {
            self.tasks.remove(&old);
        }
        self.tasks.insert(id, task);
        id
    }

    /// Slots of a service that are not retired, ascending.
    pub fn active_slots(&self, service_id: ServiceId) -> Vec<Slot> {
        self.service_range(service_id)
            .filter(|(_, e)| !e.retired)
            .map(|(k, _)| k.slot)
            .collect()
    }

    fn service_range(
        &self,
        service_id: ServiceId,
    ) -> impl Iterator<Item = (&SlotKey, &SlotEntry)> {
        let start = SlotKey::new(service_id, Slot::new(0));
        let end = SlotKey::new(service_id, Slot::new(u64::MAX));
        self.slots.range(start..=end)
    }

    /// Services with at least one slot in the table.
    pub fn service_ids(&self) -> BTreeSet<ServiceId> {
        self.slots.keys().map(|k| k.service_id).collect()
    }

    /// Nodes that hosted failed tasks for this slot.
    pub fn failed_nodes(&self, key: &SlotKey) -> BTreeSet<NodeId> {
        let Some(entry) = self.slots.get(key) else {
            return BTreeSet::new();
        };
        entry
            .history
            .iter()
            .chain(entry.current.iter())
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.state == TaskState::Failed)
            .filter_map(|t| t.node_id)
            .collect()
    }

    /// Forget a service entirely. Returns the removed tasks.
    pub fn remove_service(&mut self, service_id: ServiceId) -> Vec<Task> {
        let keys: Vec<SlotKey> = self.service_range(service_id).map(|(k, _)| *k).collect();
        let mut removed = Vec::new();
        for key in keys {
            if let Some(entry) = self.slots.remove(&key) {
                for id in entry.history.iter().chain(entry.current.iter()) {
                    if let Some(task) = self.tasks.remove(id) {
                        removed.push(task);
                    }
                }
            }
        }
        removed
    }
}
