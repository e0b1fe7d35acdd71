//! Clocks.
//!
//! One [`Clock`] exists per (period, priority) pair. Registering a handler on
//! a period that already has a clock appends to that clock's handler list.
//! A clock edge invokes every handler in registration order; a handler that
//! returns `true` leaves the list. A clock whose list becomes empty is not
//! rescheduled.

use crate::time::align;
use crate::types::{Cycle, HandlerId, Priority, SimTime};

/// Index of a clock in its [`ClockSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClockKey(pub(crate) usize);

/// A periodic activity fanning out to a list of handlers.
#[derive(Debug)]
pub struct Clock {
    period: SimTime,
    priority: Priority,
    handlers: Vec<HandlerId>,
    current_cycle: Cycle,
    next_time: Option<SimTime>,
    fired: u64,
}

impl Clock {
    fn new(period: SimTime, priority: Priority) -> Self {
        Self {
            period,
            priority,
            handlers: Vec::new(),
            current_cycle: 0,
            next_time: None,
            fired: 0,
        }
    }

    /// Period in core ticks.
    pub fn period(&self) -> SimTime {
        self.period
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Handlers currently on the clock, in invocation order.
    pub fn handlers(&self) -> &[HandlerId] {
        &self.handlers
    }

    /// Cycle number of the most recent edge.
    pub fn current_cycle(&self) -> Cycle {
        self.current_cycle
    }

    /// Time of the pending edge, if one is on the vortex.
    pub fn next_time(&self) -> Option<SimTime> {
        self.next_time
    }

    pub fn is_scheduled(&self) -> bool {
        self.next_time.is_some()
    }

    /// Number of edges fired.
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

/// What the driver must do after adding a handler to a clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockSchedule {
    /// The clock already has a pending edge.
    AlreadyScheduled,
    /// Insert a clock activity at this time.
    ScheduleAt(SimTime),
}

/// All clocks of one partition.
#[derive(Debug, Default)]
pub struct ClockSet {
    clocks: Vec<Clock>,
}

impl ClockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ClockKey) -> Option<&Clock> {
        self.clocks.get(key.0)
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Finds the clock for `period`, at any priority if `priority` is `None`.
    pub fn find(&self, period: SimTime, priority: Option<Priority>) -> Option<ClockKey> {
        self.clocks
            .iter()
            .position(|c| c.period == period && priority.map_or(true, |p| c.priority == p))
            .map(ClockKey)
    }

    /// Finds the clock holding `handler`.
    pub fn find_handler(&self, period: SimTime, handler: HandlerId) -> Option<ClockKey> {
        self.clocks
            .iter()
            .position(|c| c.period == period && c.handlers.contains(&handler))
            .map(ClockKey)
    }

    fn get_or_create(&mut self, period: SimTime, priority: Priority) -> ClockKey {
        if let Some(key) = self.find(period, Some(priority)) {
            return key;
        }
        self.clocks.push(Clock::new(period, priority));
        ClockKey(self.clocks.len() - 1)
    }

    /// Adds `handler` to the clock for `(period, priority)` at time `now`.
    ///
    /// A clock that is not already pending is scheduled for the first period
    /// boundary strictly after `now`, so a clock registered at time 0 first
    /// fires one period later.
    pub fn add_handler(&mut self, period: SimTime, priority: Priority, handler: HandlerId, now: SimTime) -> (ClockKey, ClockSchedule) {
        let key = self.get_or_create(period, priority);
        let clock = &mut self.clocks[key.0];
        clock.handlers.push(handler);
        if clock.next_time.is_some() {
            return (key, ClockSchedule::AlreadyScheduled);
        }
        let at = align::next_tick_boundary(now, period);
        clock.next_time = Some(at);
        (key, ClockSchedule::ScheduleAt(at))
    }

    /// Removes `handler` from a clock. Returns false if it was not there.
    pub fn remove_handler(&mut self, key: ClockKey, handler: HandlerId) -> bool {
        let Some(clock) = self.clocks.get_mut(key.0) else {
            return false;
        };
        let before = clock.handlers.len();
        clock.handlers.retain(|h| *h != handler);
        clock.handlers.len() != before
    }

    /// Starts an edge at `now`: returns the cycle number and a snapshot of the
    /// handlers to invoke.
    pub(crate) fn begin_edge(&mut self, key: ClockKey, now: SimTime) -> Option<(Cycle, Vec<HandlerId>)> {
        let clock = self.clocks.get_mut(key.0)?;
        clock.next_time = None;
        clock.current_cycle = align::tick_number(now, clock.period);
        clock.fired += 1;
        Some((clock.current_cycle, clock.handlers.clone()))
    }

    /// Finishes an edge: drops handlers that asked to leave and returns the
    /// time of the next edge if the clock must be rescheduled.
    pub(crate) fn end_edge(&mut self, key: ClockKey, now: SimTime, removed: &[HandlerId]) -> Option<SimTime> {
        let clock = self.clocks.get_mut(key.0)?;
        if !removed.is_empty() {
            clock.handlers.retain(|h| !removed.contains(h));
        }
        if clock.handlers.is_empty() || clock.next_time.is_some() {
            return None;
        }
        let at = now + clock.period;
        clock.next_time = Some(at);
        Some(at)
    }

    /// Cycle number of the next edge of the clock.
    pub fn next_cycle(&self, key: ClockKey, now: SimTime) -> Option<Cycle> {
        let clock = self.clocks.get(key.0)?;
        let at = clock
            .next_time
            .unwrap_or_else(|| align::next_tick_boundary(now, clock.period));
        Some(align::tick_number(at, clock.period))
    }
}
