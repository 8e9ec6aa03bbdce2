//! The timer wheel: per-connection deadlines with lazy invalidation.
//!
//! Connections re-arm constantly (ACK alarms, loss detection, idle), so
//! entries are never removed eagerly; a popped entry is checked against the
//! connection's current deadline and stale ones are discarded.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::endpoint::ConnHandle;

#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, ConnHandle)>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, deadline: Instant, handle: ConnHandle) {
        self.heap.push(Reverse((deadline, handle)));
    }

    /// Earliest pending deadline, stale entries included (harmless: firing
    /// early is a no-op for a re-armed connection).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Drain every entry due at `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<ConnHandle> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let Reverse((_, handle)) = self.heap.pop().expect("peeked");
            due.push(handle);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(idx: u32) -> ConnHandle {
        ConnHandle { idx, gen: 0 }
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.arm(t0 + Duration::from_millis(30), handle(1));
        wheel.arm(t0 + Duration::from_millis(10), handle(2));
        wheel.arm(t0 + Duration::from_millis(20), handle(3));

        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_millis(10)));
        let due = wheel.expired(t0 + Duration::from_millis(25));
        assert_eq!(due, vec![handle(2), handle(3)]);
        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_millis(30)));
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.arm(t0 + Duration::from_secs(1), handle(1));
        assert!(wheel.expired(t0).is_empty());
        assert!(!wheel.is_empty());
    }
}
