//! The time vortex: the per-partition priority queue of activities.
//!
//! Activities are ordered by `(time, priority, order)`, where `order` is a
//! ticket handed out at insertion. Ties are therefore FIFO and the pop order
//! is fully deterministic.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::activity::Activity;
use crate::error::{SimError, SimResult};
use crate::types::{Priority, SimTime, MAX_SIM_TIME};

/// Ticket identifying one insertion, usable to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityTicket(u64);

impl ActivityTicket {
    /// The insertion order number.
    pub fn order(self) -> u64 {
        self.0
    }
}

/// An activity popped from the vortex, with its ordering key.
#[derive(Debug)]
pub struct Scheduled {
    pub time: SimTime,
    pub priority: Priority,
    pub order: u64,
    pub activity: Activity,
}

struct Entry {
    time: SimTime,
    priority: Priority,
    order: u64,
    activity: Activity,
}

impl Entry {
    fn key(&self) -> (SimTime, Priority, u64) {
        (self.time, self.priority, self.order)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Min-queue of activities keyed by `(time, priority, order)`.
#[derive(Default)]
pub struct TimeVortex {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    current_time: SimTime,
    next_order: u64,
    max_depth: usize,
    inserted: u64,
    popped: u64,
}

impl TimeVortex {
    /// Creates an empty vortex at time 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time of the most recently popped activity.
    pub fn current_time(&self) -> SimTime {
        self.current_time
    }

    /// Schedules `activity` at `time`.
    ///
    /// Fails with a temporal error if `time` is before the current time or
    /// beyond [`MAX_SIM_TIME`].
    #[track_caller]
    pub fn insert(&mut self, activity: Activity, time: SimTime, priority: Priority) -> SimResult<ActivityTicket> {
        if time < self.current_time {
            return Err(SimError::temporal(format!(
                "{} activity scheduled at {} before current time {}",
                activity.kind(),
                time,
                self.current_time
            )));
        }
        if time > MAX_SIM_TIME {
            return Err(SimError::temporal(format!(
                "{} activity scheduled at {} exceeds the maximum simulation time {}",
                activity.kind(),
                time,
                MAX_SIM_TIME
            )));
        }
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Entry {
            time,
            priority,
            order,
            activity,
        });
        self.inserted += 1;
        self.max_depth = self.max_depth.max(self.len());
        Ok(ActivityTicket(order))
    }

    /// Removes and returns the minimum activity, advancing the current time.
    pub fn pop(&mut self) -> Option<Scheduled> {
        while let Some(entry) = self.heap.pop() {
            if self.cancelled.remove(&entry.order) {
                continue;
            }
            debug_assert!(entry.time >= self.current_time);
            self.current_time = entry.time;
            self.popped += 1;
            return Some(Scheduled {
                time: entry.time,
                priority: entry.priority,
                order: entry.order,
                activity: entry.activity,
            });
        }
        None
    }

    fn purge_cancelled_head(&mut self) {
        while let Some(top) = self.heap.peek() {
            if !self.cancelled.contains(&top.order) {
                break;
            }
            let order = top.order;
            self.heap.pop();
            self.cancelled.remove(&order);
        }
    }

    /// Time of the minimum activity, or `SimTime::MAX` if empty.
    pub fn peek_time(&mut self) -> SimTime {
        self.purge_cancelled_head();
        self.heap.peek().map_or(SimTime::MAX, |e| e.time)
    }

    /// Cancels a pending activity. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, ticket: ActivityTicket) -> bool {
        if self.cancelled.contains(&ticket.0) {
            return false;
        }
        if !self.heap.iter().any(|e| e.order == ticket.0) {
            return false;
        }
        self.cancelled.insert(ticket.0)
    }

    /// Removes every pending activity matching `pred`, returning them in
    /// pop order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<Activity>
    where
        F: FnMut(&Activity) -> bool,
    {
        let entries = std::mem::take(&mut self.heap).into_vec();
        let (mut removed, kept): (Vec<Entry>, Vec<Entry>) = entries
            .into_iter()
            .filter(|e| !self.cancelled.contains(&e.order))
            .partition(|e| pred(&e.activity));
        self.cancelled.clear();
        self.heap = BinaryHeap::from(kept);
        removed.sort_by_key(Entry::key);
        removed.into_iter().map(|e| e.activity).collect()
    }

    /// Iterates pending activities in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Activity> + '_ {
        self.heap
            .iter()
            .filter(|e| !self.cancelled.contains(&e.order))
            .map(|e| &e.activity)
    }

    /// Number of pending activities.
    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest number of pending activities seen.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Total insertions.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Total activities popped (cancelled ones excluded).
    pub fn popped(&self) -> u64 {
        self.popped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockKey;
    use crate::types::priority;

    fn clock(n: usize) -> Activity {
        Activity::Clock(ClockKey(n))
    }

    fn key_of(s: &Scheduled) -> usize {
        match s.activity {
            Activity::Clock(ClockKey(n)) => n,
            _ => usize::MAX,
        }
    }

    #[test]
    fn test_orders_by_time_then_priority_then_fifo() {
        let mut v = TimeVortex::new();
        v.insert(clock(0), 20, priority::EVENT).unwrap();
        v.insert(clock(1), 10, priority::CLOCK).unwrap();
        v.insert(clock(2), 10, priority::EVENT).unwrap();
        v.insert(clock(3), 10, priority::EVENT).unwrap();

        let order: Vec<usize> = std::iter::from_fn(|| v.pop()).map(|s| key_of(&s)).collect();
        assert_eq!(order, vec![2, 3, 1, 0]);
        assert_eq!(v.current_time(), 20);
    }

    #[test]
    fn test_insert_in_past_is_temporal_error() {
        let mut v = TimeVortex::new();
        v.insert(Activity::Sync, 100, priority::SYNC).unwrap();
        v.pop().unwrap();
        let err = v.insert(Activity::Sync, 99, priority::SYNC).unwrap_err();
        assert!(err.is_temporal());
        assert!(v.insert(Activity::Sync, 100, priority::SYNC).is_ok());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut v = TimeVortex::new();
        assert!(v.insert(Activity::Stop, MAX_SIM_TIME, priority::STOP).is_ok());
        assert!(v.insert(Activity::Stop, MAX_SIM_TIME + 1, priority::STOP).unwrap_err().is_temporal());
    }

    #[test]
    fn test_peek_time_empty_is_infinite() {
        let mut v = TimeVortex::new();
        assert_eq!(v.peek_time(), SimTime::MAX);
        v.insert(Activity::Heartbeat, 7, priority::HEARTBEAT).unwrap();
        assert_eq!(v.peek_time(), 7);
    }

    #[test]
    fn test_cancel() {
        let mut v = TimeVortex::new();
        let a = v.insert(clock(0), 5, priority::CLOCK).unwrap();
        v.insert(clock(1), 6, priority::CLOCK).unwrap();
        assert!(v.cancel(a));
        assert!(!v.cancel(a));
        assert_eq!(v.len(), 1);
        assert_eq!(v.peek_time(), 6);
        assert_eq!(key_of(&v.pop().unwrap()), 1);
        assert!(v.pop().is_none());
    }

    #[test]
    fn test_remove_where() {
        let mut v = TimeVortex::new();
        v.insert(clock(0), 5, priority::CLOCK).unwrap();
        v.insert(Activity::Sync, 3, priority::SYNC).unwrap();
        v.insert(clock(1), 4, priority::CLOCK).unwrap();
        let removed = v.remove_where(|a| matches!(a, Activity::Clock(_)));
        assert_eq!(removed.len(), 2);
        assert!(matches!(removed[0], Activity::Clock(ClockKey(1))));
        assert_eq!(v.len(), 1);
        assert_eq!(v.max_depth(), 3);
    }
}
