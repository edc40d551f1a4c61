use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

/// Online-agent accounting for one hypervisor.
///
/// Membership is keyed by agent name so that `mark_online`/`mark_offline`
/// are idempotent: a second shutdown path reaching the same agent cannot
/// decrement twice. A launch in flight holds a reservation, which counts
/// against the limit until the boot settles. Both counts are mirrored in
/// atomics so `is_full` never blocks the fleet tick.
pub struct CapacityTracker {
    hypervisor: String,
    max_online: usize,
    slots: Mutex<Slots>,
    current: AtomicUsize,
    occupied: AtomicUsize,
}

/// Online and reserved agents. The two sets never overlap.
#[derive(Default)]
struct Slots {
    online: HashSet<String>,
    reserved: HashSet<String>,
}

impl Slots {
    fn occupied(&self) -> usize {
        self.online.len() + self.reserved.len()
    }

    fn holds(&self, agent: &str) -> bool {
        self.online.contains(agent) || self.reserved.contains(agent)
    }
}

impl CapacityTracker {
    pub fn new(hypervisor: impl Into<String>, max_online: usize) -> Self {
        Self {
            hypervisor: hypervisor.into(),
            max_online,
            slots: Mutex::new(Slots::default()),
            current: AtomicUsize::new(0),
            occupied: AtomicUsize::new(0),
        }
    }

    pub fn hypervisor(&self) -> &str {
        &self.hypervisor
    }

    pub fn max(&self) -> usize {
        self.max_online
    }

    /// Agents counted online.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Agents counted online plus launches in flight.
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    pub fn reserved(&self) -> usize {
        self.occupied().saturating_sub(self.current())
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.max_online
    }

    pub fn is_online(&self, agent: &str) -> bool {
        self.lock().online.contains(agent)
    }

    /// Whether `agent` fits once everything else already counted is
    /// accounted for. Its own reservation does not count against it.
    pub fn has_room_for(&self, agent: &str) -> bool {
        let slots = self.lock();
        let others = slots.occupied() - usize::from(slots.holds(agent));
        others < self.max_online
    }

    /// Hold a slot for a launch about to start. Returns false when the
    /// hypervisor is full; an agent already counted keeps its slot.
    pub fn reserve(&self, agent: &str) -> bool {
        let mut slots = self.lock();
        if slots.holds(agent) {
            return true;
        }
        if slots.occupied() >= self.max_online {
            debug!(hypervisor = %self.hypervisor, agent = %agent, "No room to reserve");
            return false;
        }
        slots.reserved.insert(agent.to_string());
        self.publish(&slots);
        debug!(hypervisor = %self.hypervisor, agent = %agent, occupied = slots.occupied(), "Slot reserved");
        true
    }

    /// Drop a reservation left by a launch that did not come online.
    pub fn release(&self, agent: &str) -> bool {
        let mut slots = self.lock();
        if !slots.reserved.remove(agent) {
            return false;
        }
        self.publish(&slots);
        debug!(hypervisor = %self.hypervisor, agent = %agent, "Reservation released");
        true
    }

    /// Count `agent` as online, converting its reservation if it holds one.
    /// Returns false if it already was online.
    ///
    /// Going over the limit is tolerated (a manual start can race a tick, and
    /// a reconciliation may find more than expected) and only logged.
    pub fn mark_online(&self, agent: &str) -> bool {
        let mut slots = self.lock();
        slots.reserved.remove(agent);
        let inserted = slots.online.insert(agent.to_string());
        self.publish(&slots);
        if !inserted {
            debug!(hypervisor = %self.hypervisor, agent = %agent, "Agent already counted online");
            return false;
        }
        let now = slots.online.len();
        if slots.occupied() > self.max_online {
            warn!(
                hypervisor = %self.hypervisor,
                agent = %agent,
                current = now,
                max = self.max_online,
                "Hypervisor capacity overshoot"
            );
        } else {
            debug!(hypervisor = %self.hypervisor, agent = %agent, current = now, "Agent marked online");
        }
        true
    }

    /// Stop counting `agent`, dropping any reservation too. Returns false if
    /// it was not counted online.
    pub fn mark_offline(&self, agent: &str) -> bool {
        let mut slots = self.lock();
        let released = slots.reserved.remove(agent);
        let removed = slots.online.remove(agent);
        if released || removed {
            self.publish(&slots);
        }
        if !removed {
            debug!(hypervisor = %self.hypervisor, agent = %agent, "Agent already counted offline");
            return false;
        }
        debug!(hypervisor = %self.hypervisor, agent = %agent, current = slots.online.len(), "Agent marked offline");
        true
    }

    /// Replace the online accounting with the authoritative set of online
    /// agents. Reservations for launches still in flight are kept.
    ///
    /// Returns the online count before and after.
    pub fn reconcile<I, S>(&self, authoritative: I) -> (usize, usize)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fresh: HashSet<String> = authoritative.into_iter().map(Into::into).collect();
        let mut slots = self.lock();
        let before = slots.online.len();
        if slots.online != fresh {
            info!(
                hypervisor = %self.hypervisor,
                before,
                after = fresh.len(),
                "Capacity accounting reconciled"
            );
        }
        slots.reserved.retain(|a| !fresh.contains(a));
        slots.online = fresh;
        let after = slots.online.len();
        self.publish(&slots);
        (before, after)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, slots: &Slots) {
        self.current.store(slots.online.len(), Ordering::Release);
        self.occupied.store(slots.occupied(), Ordering::Release);
    }
}

impl std::fmt::Debug for CapacityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityTracker")
            .field("hypervisor", &self.hypervisor)
            .field("current", &self.current())
            .field("reserved", &self.reserved())
            .field("max", &self.max_online)
            .finish()
    }
}
