use std::sync::Arc;

/// Answer to "can this item run on that node?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Yes,
    No(String),
}

impl Placement {
    pub fn is_yes(&self) -> bool {
        matches!(self, Self::Yes)
    }
}

/// A unit of pending work owned by the external build queue.
pub trait WorkItem: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn can_run_on(&self, node: &str) -> Placement;
}

/// Read-only view of the external build queue.
///
/// Implementations must return a consistent snapshot while the fleet lock
/// is held.
pub trait WorkQueue: Send + Sync {
    /// Buildable items in queue order.
    fn buildable_items(&self) -> Vec<Arc<dyn WorkItem>>;
}
