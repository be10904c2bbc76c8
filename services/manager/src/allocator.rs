//! Slot placement.
//!
//! [`plan_service`] is a pure function: given a service's replica count, its
//! per-task reservation, the cluster view and what currently occupies each
//! slot, it decides for every slot whether to keep its task where it is, place
//! a task on a node, leave it empty, or remove it. The caller applies the plan.
//!
//! Placement rules for a slot that needs a node:
//!
//! 1. The node must be ready, active and have the reservation free.
//! 2. Nodes that did not recently host this slot come first.
//! 3. Then the node with the fewest tasks.
//! 4. Then the lowest node ID.
//!
//! Placements are charged against the view as they are made, so later slots
//! (and later services sharing the view) see the updated load.

use std::collections::{BTreeMap, BTreeSet};

use convoy_agent_api::Resources;
use convoy_id::{NodeId, Slot};
use thiserror::Error;

use crate::cluster::Availability;

/// Why a slot could not be placed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("no suitable node: none of {total} node(s) is ready and active")]
    NoNodeAvailable { total: usize },

    #[error("no suitable node: insufficient resources on {available} node(s)")]
    InsufficientResources { available: usize },
}

/// One node as the allocator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCandidate {
    pub id: NodeId,
    pub ready: bool,
    pub availability: Availability,
    /// Capacity minus the reservations of live tasks.
    pub free: Resources,
    /// Live tasks on the node.
    pub task_count: usize,
}

impl NodeCandidate {
    fn accepts_new(&self) -> bool {
        self.ready && self.availability == Availability::Active
    }

    fn keeps_existing(&self) -> bool {
        self.ready && self.availability != Availability::Drain
    }
}

/// Load-aware view of the cluster, ordered by node ID.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    nodes: Vec<NodeCandidate>,
}

impl ClusterView {
    pub fn new(mut nodes: Vec<NodeCandidate>) -> Self {
        nodes.sort_by_key(|n| n.id);
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeCandidate] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeCandidate> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Account for a task holding `reservation` on `node`.
    pub fn charge(&mut self, node: &NodeId, reservation: &Resources) {
        if let Some(n) = self.nodes.iter_mut().find(|n| n.id == *node) {
            n.free = n.free.saturating_sub(reservation);
            n.task_count += 1;
        }
    }

    fn choose(
        &self,
        reservation: &Resources,
        avoid: &BTreeSet<NodeId>,
    ) -> Result<NodeId, SchedulingError> {
        let available: Vec<_> = self.nodes.iter().filter(|n| n.accepts_new()).collect();
        if available.is_empty() {
            return Err(SchedulingError::NoNodeAvailable {
                total: self.nodes.len(),
            });
        }

        available
            .iter()
            .filter(|n| n.free.fits(reservation))
            .min_by_key(|n| (avoid.contains(&n.id), n.task_count, n.id))
            .map(|n| n.id)
            .ok_or(SchedulingError::InsufficientResources {
                available: available.len(),
            })
    }
}

/// What currently fills a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotOccupancy {
    /// Node of the slot's live task, if it has one with a node.
    pub live_node: Option<NodeId>,

    /// False when the slot should stay empty (restart policy, pending delay).
    pub wanted: bool,

    /// Nodes that recently hosted a task for this slot.
    pub previous_nodes: BTreeSet<NodeId>,
}

impl SlotOccupancy {
    /// An empty slot that should be filled.
    pub fn vacant() -> Self {
        Self {
            wanted: true,
            ..Default::default()
        }
    }
}

/// Decision for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPlan {
    /// Live task stays on its node.
    Keep { slot: Slot, node: NodeId },
    /// Slot needs a task on this node.
    Place { slot: Slot, node: NodeId },
    /// Slot needs a task but no node can take it.
    Unschedulable { slot: Slot, error: SchedulingError },
    /// Slot stays empty for now.
    Idle { slot: Slot },
    /// Slot is above the replica count.
    Remove { slot: Slot },
}

impl SlotPlan {
    pub fn slot(&self) -> Slot {
        match self {
            Self::Keep { slot, .. }
            | Self::Place { slot, .. }
            | Self::Unschedulable { slot, .. }
            | Self::Idle { slot }
            | Self::Remove { slot } => *slot,
        }
    }
}

/// Plan every slot of one service.
///
/// `view` must already be charged with the service's live tasks. Slots in
/// `1..=replicas` missing from `occupancy` are treated as vacant.
pub fn plan_service(
    replicas: u64,
    reservation: &Resources,
    view: &mut ClusterView,
    occupancy: &BTreeMap<Slot, SlotOccupancy>,
) -> Vec<SlotPlan> {
    let vacant = SlotOccupancy::vacant();
    let mut plan = Vec::new();

    for slot in Slot::range(replicas) {
        let current = occupancy.get(&slot).unwrap_or(&vacant);

        if let Some(node) = current.live_node {
            if view.node(&node).is_some_and(NodeCandidate::keeps_existing) {
                plan.push(SlotPlan::Keep { slot, node });
                continue;
            }
        } else if !current.wanted {
            plan.push(SlotPlan::Idle { slot });
            continue;
        }

        let mut avoid = current.previous_nodes.clone();
        avoid.extend(current.live_node);

        match view.choose(reservation, &avoid) {
            Ok(node) => {
                view.charge(&node, reservation);
                plan.push(SlotPlan::Place { slot, node });
            }
            Err(error) => plan.push(SlotPlan::Unschedulable { slot, error }),
        }
    }

    plan.extend(
        occupancy
            .keys()
            .filter(|slot| slot.value() > replicas)
            .map(|&slot| SlotPlan::Remove { slot }),
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CPU: u64 = 1_000_000_000;

    fn node(ready: bool, availability: Availability, cpus: u64) -> NodeCandidate {
        NodeCandidate {
            id: NodeId::new(),
            ready,
            availability,
            free: Resources {
                nano_cpus: cpus * CPU,
                memory_bytes: 1 << 32,
            },
            task_count: 0,
        }
    }

    fn nodes(n: usize) -> Vec<NodeCandidate> {
        (0..n)
            .map(|_| node(true, Availability::Active, 8))
            .collect()
    }

    fn placed(plan: &[SlotPlan]) -> Vec<NodeId> {
        plan.iter()
            .filter_map(|p| match p {
                SlotPlan::Place { node, .. } => Some(*node),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_spreads_across_nodes() {
        let mut view = ClusterView::new(nodes(3));
        let plan = plan_service(3, &Resources::default(), &mut view, &BTreeMap::new());

        let mut used = placed(&plan);
        used.sort();
        used.dedup();
        assert_eq!(used.len(), 3);
        assert!(view.nodes().iter().all(|n| n.task_count == 1));
    }

    #[test]
    fn test_plan_without_nodes_covers_every_slot() {
        let replicas = crate::store::validate::MAX_REPLICAS;
        let mut view = ClusterView::new(vec![]);
        let plan = plan_service(replicas, &Resources::default(), &mut view, &BTreeMap::new());

        assert_eq!(plan.len() as u64, replicas);
        assert!(plan
            .iter()
            .all(|p| matches!(p, SlotPlan::Unschedulable { .. })));
        assert_eq!(plan.last().map(SlotPlan::slot), Some(Slot::new(replicas)));
    }

    #[test]
    fn test_tie_break_is_lowest_id() {
        let candidates = nodes(2);
        let lowest = candidates.iter().map(|n| n.id).min().unwrap();
        let mut view = ClusterView::new(candidates);

        let plan = plan_service(1, &Resources::default(), &mut view, &BTreeMap::new());
        assert_eq!(
            plan,
            vec![SlotPlan::Place {
                slot: Slot::FIRST,
                node: lowest
            }]
        );
    }

    #[test]
    fn test_keeps_live_task_on_eligible_node() {
        let candidates = nodes(2);
        let home = candidates[1].id;
        let mut view = ClusterView::new(candidates);
        view.charge(&home, &Resources::default());

        let occupancy = BTreeMap::from([(
            Slot::FIRST,
            SlotOccupancy {
                live_node: Some(home),
                wanted: true,
                previous_nodes: BTreeSet::new(),
            },
        )]);
        let plan = plan_service(1, &Resources::default(), &mut view, &occupancy);
        assert_eq!(
            plan,
            vec![SlotPlan::Keep {
                slot: Slot::FIRST,
                node: home
            }]
        );
    }

    #[test]
    fn test_moves_off_drained_node_but_not_paused() {
        let mut candidates = nodes(3);
        candidates[0].availability = Availability::Drain;
        candidates[1].availability = Availability::Pause;
        let drained = candidates[0].id;
        let paused = candidates[1].id;
        let free = candidates[2].id;
        let mut view = ClusterView::new(candidates);

        let occupancy = BTreeMap::from([
            (
                Slot::new(1),
                SlotOccupancy {
                    live_node: Some(drained),
                    wanted: true,
                    previous_nodes: BTreeSet::new(),
                },
            ),
            (
                Slot::new(2),
                SlotOccupancy {
                    live_node: Some(paused),
                    wanted: true,
                    previous_nodes: BTreeSet::new(),
                },
            ),
        ]);
        let plan = plan_service(2, &Resources::default(), &mut view, &occupancy);
        assert_eq!(
            plan,
            vec![
                SlotPlan::Place {
                    slot: Slot::new(1),
                    node: free
                },
                SlotPlan::Keep {
                    slot: Slot::new(2),
                    node: paused
                },
            ]
        );
    }

    #[test]
    fn test_prefers_node_without_previous_task() {
        let candidates = nodes(2);
        let (a, b) = (candidates[0].id, candidates[1].id);
        let mut view = ClusterView::new(candidates);
        // `b` is busier but `a` hosted the slot's failed task.
        view.charge(&b, &Resources::default());

        let occupancy = BTreeMap::from([(
            Slot::FIRST,
            SlotOccupancy {
                live_node: None,
                wanted: true,
                previous_nodes: BTreeSet::from([a]),
            },
        )]);
        let plan = plan_service(1, &Resources::default(), &mut view, &occupancy);
        assert_eq!(placed(&plan), vec![b]);
    }

    #[test]
    fn test_falls_back_to_previous_node() {
        let candidates = nodes(1);
        let only = candidates[0].id;
        let mut view = ClusterView::new(candidates);
        let occupancy = BTreeMap::from([(
            Slot::FIRST,
            SlotOccupancy {
                live_node: None,
                wanted: true,
                previous_nodes: BTreeSet::from([only]),
            },
        )]);
        let plan = plan_service(1, &Resources::default(), &mut view, &occupancy);
        assert_eq!(placed(&plan), vec![only]);
    }

    #[test]
    fn test_unschedulable_only_affects_its_slot() {
        let mut view = ClusterView::new(vec![node(true, Availability::Active, 2)]);
        let reservation = Resources {
            nano_cpus: CPU,
            memory_bytes: 0,
        };
        let plan = plan_service(3, &reservation, &mut view, &BTreeMap::new());

        assert_eq!(placed(&plan).len(), 2);
        assert_eq!(
            plan[2],
            SlotPlan::Unschedulable {
                slot: Slot::new(3),
                error: SchedulingError::InsufficientResources { available: 1 }
            }
        );
    }

    #[test]
    fn test_no_ready_nodes() {
        let mut view = ClusterView::new(vec![
            node(false, Availability::Active, 8),
            node(true, Availability::Pause, 8),
        ]);
        let plan = plan_service(1, &Resources::default(), &mut view, &BTreeMap::new());
        assert_eq!(
            plan,
            vec![SlotPlan::Unschedulable {
                slot: Slot::FIRST,
                error: SchedulingError::NoNodeAvailable { total: 2 }
            }]
        );
    }

    #[test]
    fn test_idle_and_removed_slots() {
        let mut view = ClusterView::new(nodes(1));
        let occupancy = BTreeMap::from([
            (Slot::new(1), SlotOccupancy::default()),
            (Slot::new(2), SlotOccupancy::vacant()),
            (Slot::new(3), SlotOccupancy::vacant()),
        ]);
        let plan = plan_service(1, &Resources::default(), &mut view, &occupancy);
        assert_eq!(
            plan.iter().map(SlotPlan::slot).collect::<Vec<_>>(),
            vec![Slot::new(1), Slot::new(2), Slot::new(3)]
        );
        assert_eq!(plan[0], SlotPlan::Idle { slot: Slot::new(1) });
        assert_eq!(plan[1], SlotPlan::Remove { slot: Slot::new(2) });
        assert_eq!(plan[2], SlotPlan::Remove { slot: Slot::new(3) });
    }

    proptest! {
        #[test]
        fn prop_placements_respect_capacity(
            cpus in proptest::collection::vec(0u64..6, 1..6),
            replicas in 0u64..20,
            per_task in 1u64..3,
        ) {
            let candidates: Vec<_> = cpus
                .iter()
                .map(|&c| node(true, Availability::Active, c))
                .collect();
            let capacity: BTreeMap<_, _> =
                candidates.iter().map(|n| (n.id, n.free.nano_cpus)).collect();
            let mut view = ClusterView::new(candidates);
            let reservation = Resources { nano_cpus: per_task * CPU, memory_bytes: 0 };

            let plan = plan_service(replicas, &reservation, &mut view, &BTreeMap::new());
            prop_assert_eq!(plan.len() as u64, replicas);

            let mut used: BTreeMap<NodeId, u64> = BTreeMap::new();
            for node in placed(&plan) {
                *used.entry(node).or_default() += reservation.nano_cpus;
            }
            for (node, total) in used {
                prop_assert!(total <= capacity[&node]);
            }
        }

        #[test]
        fn prop_uniform_nodes_stay_balanced(n in 1usize..8, replicas in 0u64..40) {
            let mut view = ClusterView::new(nodes(n));
            plan_service(replicas, &Resources::default(), &mut view, &BTreeMap::new());
            let counts: Vec<_> = view.nodes().iter().map(|n| n.task_count).collect();
            let max = counts.iter().max().copied().unwrap_or(0);
            let min = counts.iter().min().copied().unwrap_or(0);
            prop_assert!(max - min <= 1);
        }
    }
}
