//! Demand analysis: is a candidate agent the only resource able to run
//! some pending work item?
//!
//! Items claim idle slots greedily in queue order. The first item that no
//! remaining slot can take, but the candidate can, makes the candidate
//! uniquely needed. No look-ahead is attempted: an early item may consume a
//! slot that a later item could only have used, and that is intended.

use std::sync::Arc;

use tracing::debug;

use crate::fleet::ComputerState;
use crate::queue::WorkItem;

/// Idle executors currently offered by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSlot {
    pub node: String,
    pub idle_executors: u32,
}

impl ExecutionSlot {
    /// Slots offered by every online or connecting, accepting, partially idle node.
    pub fn from_computers(computers: &[ComputerState]) -> Vec<ExecutionSlot> {
        computers
            .iter()
            .filter(|c| c.offers_slots())
            .map(|c| ExecutionSlot {
                node: c.name.clone(),
                idle_executors: c.idle_executors,
            })
            .collect()
    }
}

/// Slots and pending items captured once per tick.
#[derive(Debug, Clone, Default)]
pub struct DemandSnapshot {
    pub slots: Vec<ExecutionSlot>,
    pub items: Vec<Arc<dyn WorkItem>>,
}

impl DemandSnapshot {
    pub fn new(slots: Vec<ExecutionSlot>, items: Vec<Arc<dyn WorkItem>>) -> Self {
        Self { slots, items }
    }

    pub fn is_uniquely_needed(&self, candidate: &str) -> bool {
        is_uniquely_needed(candidate, &self.slots, &self.items)
    }

    /// Add a node that will take work once it connects. A node already
    /// offering slots is left as it is.
    pub fn offer(&mut self, slot: ExecutionSlot) {
        if !self.slots.iter().any(|s| s.node == slot.node) {
            self.slots.push(slot);
        }
    }
}

/// Whether `candidate` can run a pending item nothing else idle can take.
pub fn is_uniquely_needed(
    candidate: &str,
    slots: &[ExecutionSlot],
    items: &[Arc<dyn WorkItem>],
) -> bool {
    // Ordered multiset: node -> remaining idle executors.
    let mut available: Vec<(&str, u32)> = slots
        .iter()
        .filter(|s| s.node != candidate && s.idle_executors > 0)
        .map(|s| (s.node.as_str(), s.idle_executors))
        .collect();

    for item in items {
        let covering = available
            .iter()
            .position(|(node, _)| item.can_run_on(node).is_yes());

        if let Some(idx) = covering {
            let entry = &mut available[idx];
            entry.1 -= 1;
            if entry.1 == 0 {
                available.remove(idx);
            }
            continue;
        }

        if item.can_run_on(candidate).is_yes() {
            debug!(agent = %candidate, item = %item.id(), "Agent uniquely needed");
            return true;
        }
    }

    false
}
