//! One-shot callbacks.
//!
//! A [`OneShot`] exists per period. Handlers registered on it are grouped by
//! the time they become due; all handlers due at the same time fire as one
//! activity, in registration order, and are then discarded. The one-shot
//! keeps a single pending activity for its earliest bucket.

use std::collections::BTreeMap;

use crate::types::{HandlerId, SimTime};

/// Index of a one-shot in its [`OneShotSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OneShotKey(pub(crate) usize);

/// Handle for cancelling a registered one-shot callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OneShotToken {
    pub(crate) key: OneShotKey,
    pub(crate) due: SimTime,
    pub(crate) handler: HandlerId,
    /// Distinguishes registrations that reuse a handler id.
    pub(crate) serial: u64,
}

impl OneShotToken {
    /// Time at which the callback fires.
    pub fn due(&self) -> SimTime {
        self.due
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }
}

/// Deferred callbacks sharing one period.
#[derive(Debug)]
pub struct OneShot {
    period: SimTime,
    buckets: BTreeMap<SimTime, Vec<(HandlerId, u64)>>,
    scheduled: Option<SimTime>,
}

impl OneShot {
    fn new(period: SimTime) -> Self {
        Self {
            period,
            buckets: BTreeMap::new(),
            scheduled: None,
        }
    }

    pub fn period(&self) -> SimTime {
        self.period
    }

    /// Number of pending callbacks.
    pub fn pending(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// All one-shots of one partition.
#[derive(Debug, Default)]
pub struct OneShotSet {
    oneshots: Vec<OneShot>,
    serial: u64,
}

impl OneShotSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: OneShotKey) -> Option<&OneShot> {
        self.oneshots.get(key.0)
    }

    fn get_or_create(&mut self, period: SimTime) -> OneShotKey {
        if let Some(i) = self.oneshots.iter().position(|o| o.period == period) {
            return OneShotKey(i);
        }
        self.oneshots.push(OneShot::new(period));
        OneShotKey(self.oneshots.len() - 1)
    }

    /// Registers `handler` to fire one period after `now`.
    ///
    /// Returns the token and, if the one-shot has no pending activity, the
    /// time at which one must be inserted.
    pub fn add_handler(&mut self, period: SimTime, handler: HandlerId, now: SimTime) -> (OneShotToken, Option<SimTime>) {
        let key = self.get_or_create(period);
        let due = now + period;
        self.serial += 1;
        let serial = self.serial;
        let oneshot = &mut self.oneshots[key.0];
        oneshot.buckets.entry(due).or_default().push((handler, serial));
        let token = OneShotToken {
            key,
            due,
            handler,
            serial,
        };
        if oneshot.scheduled.is_none() {
            oneshot.scheduled = Some(due);
            return (token, Some(due));
        }
        (token, None)
    }

    /// Removes a pending callback. Returns false if it already fired.
    pub fn cancel(&mut self, token: &OneShotToken) -> bool {
        let Some(oneshot) = self.oneshots.get_mut(token.key.0) else {
            return false;
        };
        let Some(bucket) = oneshot.buckets.get_mut(&token.due) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|&(h, serial)| (h, serial) != (token.handler, token.serial));
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            oneshot.buckets.remove(&token.due);
        }
        removed
    }

    /// Takes the handlers due at `now`.
    pub(crate) fn take_due(&mut self, key: OneShotKey, now: SimTime) -> Vec<HandlerId> {
        let Some(oneshot) = self.oneshots.get_mut(key.0) else {
            return Vec::new();
        };
        oneshot.scheduled = None;
        let due: Vec<SimTime> = oneshot.buckets.range(..=now).map(|(t, _)| *t).collect();
        due.into_iter()
            .filter_map(|t| oneshot.buckets.remove(&t))
            .flatten()
            .map(|(handler, _)| handler)
            .collect()
    }

    /// After firing, returns the time of the next bucket if the one-shot must
    /// be rescheduled.
    pub(crate) fn reschedule(&mut self, key: OneShotKey) -> Option<SimTime> {
        let oneshot = self.oneshots.get_mut(key.0)?;
        if oneshot.scheduled.is_some() {
            return None;
        }
        let next = *oneshot.buckets.keys().next()?;
        oneshot.scheduled = Some(next);
        Some(next)
    }
}
