use std::cell::Cell;
use std::rc::Rc;

/// Charges heap allocations against a host controlled budget.
///
/// The runtime consults the tracker before every significant allocation:
/// strings, tables, closures, coroutine stacks, buffers. A refusal unwinds
/// the interpreter with an uncatchable error that no `pcall` or coroutine
/// boundary observes; only the host sees it, at its `resume` or `call`
/// site.
///
/// A tracker is also the host's interruption mechanism: returning `false`
/// from [`AllocationTracker::track`] at any time tears the running thread
/// down to the host.
pub trait AllocationTracker {
    /// Returns whether the allocation may proceed.
    fn track(&self, bytes: usize) -> bool;

    /// Returns bytes to the budget when an allocation is released.
    fn release(&self, bytes: usize) {
        let _ = bytes;
    }
}

/// The default tracker: every allocation succeeds.
#[derive(Default, Clone)]
pub struct UnlimitedTracker;

impl AllocationTracker for UnlimitedTracker {
    #[inline]
    fn track(&self, _bytes: usize) -> bool {
        true
    }
}

/// A fixed byte budget, shared by clones.
#[derive(Clone)]
pub struct BudgetTracker {
    used: Rc<Cell<usize>>,
    limit: usize,
}

impl BudgetTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            used: Default::default(),
            limit,
        }
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }
}

impl AllocationTracker for BudgetTracker {
    fn track(&self, bytes: usize) -> bool {
        let next = self.used.get() + bytes;

        if next > self.limit {
            return false;
        }

        self.used.set(next);
        true
    }

    fn release(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_sub(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_refuses_past_limit() {
        let tracker = BudgetTracker::new(100);

        assert!(tracker.track(60));
        assert!(!tracker.track(60));

        tracker.release(60);
        assert!(tracker.track(60));
        assert_eq!(tracker.used(), 60);
    }
}
