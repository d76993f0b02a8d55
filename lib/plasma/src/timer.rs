use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Deadline bookkeeping for the reactor. Entries are lazily invalidated:
/// the reactor re-checks the owning connection's real deadline when an
/// entry pops, re-pushing entries that fired early because activity moved
/// the deadline forward.
pub struct Timers {
    heap: BinaryHeap<Reverse<Entry>>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
struct Entry {
    when: Instant,
    id: usize,
    gen: u32,
}

impl Timers {
    #[inline]
    pub fn new() -> Timers {
        Timers {
            heap: BinaryHeap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn schedule(&mut self, when: Instant, id: usize, gen: u32) {
        self.heap.push(Reverse(Entry { when, id, gen }));
    }

    /// Earliest scheduled deadline, if any.
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.when)
    }

    /// Pops every entry due at or before `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<(usize, u32)> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if entry.when > now {
                break;
            }
            self.heap.pop();
            due.push((entry.id, entry.gen));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_orders_by_deadline() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(now + Duration::from_secs(5), 1, 0);
        timers.schedule(now + Duration::from_secs(1), 2, 0);
        timers.schedule(now + Duration::from_secs(3), 3, 0);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));

        let due = timers.expired(now + Duration::from_secs(3));
        assert_eq!(due, vec![(2, 0), (3, 0)]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_expired_is_empty_before_deadline() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(now + Duration::from_secs(10), 1, 4);

        assert!(timers.expired(now).is_empty());
        assert_eq!(timers.len(), 1);

        let due = timers.expired(now + Duration::from_secs(10));
        assert_eq!(due, vec![(1, 4)]);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_duplicate_entries_all_surface() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(now, 1, 0);
        timers.schedule(now, 1, 0);
        let due = timers.expired(now);
        assert_eq!(due.len(), 2);
    }
}
