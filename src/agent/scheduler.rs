//! Interval scheduling for an agent's loop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::TaskHandler;

/// A task fired every `period`.
#[derive(Clone)]
pub struct IntervalTask {
    pub period: Duration,
    pub handler: Arc<dyn TaskHandler>,
}

/// Min-heap of `(next_fire, registration index)`.
///
/// Each task has at most one pending entry, so a busy loop never builds a
/// backlog of firings.
pub struct Scheduler {
    tasks: Vec<IntervalTask>,
    queue: BinaryHeap<Reverse<(Instant, usize)>>,
}

impl Scheduler {
    pub fn new(tasks: Vec<IntervalTask>) -> Self {
        Self {
            tasks,
            queue: BinaryHeap::new(),
        }
    }

    /// Queue every task's first firing one period after `now`.
    pub fn start(&mut self, now: Instant) {
        self.queue.clear();
        for (id, task) in self.tasks.iter().enumerate() {
            self.queue.push(Reverse((now + task.period, id)));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop the earliest task due at `now`; ties go to the earlier registration.
    pub fn pop_due(&mut self, now: Instant) -> Option<usize> {
        match self.queue.peek() {
            Some(Reverse((at, _))) if *at <= now => self.queue.pop().map(|Reverse((_, id))| id),
            _ => None,
        }
    }

    /// Queue the next firing one period after `now`; missed firings are not replayed.
    pub fn reschedule(&mut self, id: usize, now: Instant) {
        if let Some(task) = self.tasks.get(id) {
            self.queue.push(Reverse((now + task.period, id)));
        }
    }

    pub fn task(&self, id: usize) -> Option<&IntervalTask> {
        self.tasks.get(id)
    }

    /// Drop every pending firing.
    pub fn clear(&mut self) -> usize {
        let pending = self.queue.len();
        self.queue.clear();
        pending
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::task;

    fn every(secs: u64) -> IntervalTask {
        IntervalTask {
            period: Duration::from_secs(secs),
            handler: task(|_ctx| async { Ok(()) }),
        }
    }

    #[test]
    fn test_first_firing_after_one_period() {
        let mut scheduler = Scheduler::new(vec![every(2)]);
        let start = Instant::now();
        scheduler.start(start);

        assert_eq!(scheduler.next_deadline(), Some(start + Duration::from_secs(2)));
        assert_eq!(scheduler.pop_due(start + Duration::from_secs(1)), None);
        assert_eq!(scheduler.pop_due(start + Duration::from_secs(2)), Some(0));
    }

    #[test]
    fn test_ties_break_by_registration_order() {
        let mut scheduler = Scheduler::new(vec![every(1), every(1), every(3)]);
        let start = Instant::now();
        scheduler.start(start);

        let now = start + Duration::from_secs(1);
        assert_eq!(scheduler.pop_due(now), Some(0));
        assert_eq!(scheduler.pop_due(now), Some(1));
        assert_eq!(scheduler.pop_due(now), None);
    }

    #[test]
    fn test_no_backfill_after_overrun() {
        let mut scheduler = Scheduler::new(vec![every(1)]);
        let start = Instant::now();
        scheduler.start(start);

        // The loop was busy for ten periods; only one firing is pending.
        let late = start + Duration::from_secs(10);
        assert_eq!(scheduler.pop_due(late), Some(0));
        assert_eq!(scheduler.pop_due(late), None);

        scheduler.reschedule(0, late);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.next_deadline(), Some(late + Duration::from_secs(1)));
    }

    #[test]
    fn test_clear() {
        let mut scheduler = Scheduler::new(vec![every(1), every(2)]);
        scheduler.start(Instant::now());
        assert_eq!(scheduler.clear(), 2);
        assert_eq!(scheduler.next_deadline(), None);
        assert_eq!(scheduler.len(), 2);
    }
}
