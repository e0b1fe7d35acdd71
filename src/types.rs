//! Core type definitions for the simulation engine.
//!
//! This module defines the scalar time model, the priority classes used to
//! order activities that share a tick, and the dense identifiers used to
//! reference components, links and handlers without back-pointers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Simulation time in core ticks.
///
/// The length of one tick is fixed by the `TimeLord` time base
/// (1 ps unless configured otherwise). All activities share this timeline.
pub type SimTime = u64;

/// Clock cycle counter passed to clock handlers.
pub type Cycle = u64;

/// Ordering class within a tick. Lower values fire first.
pub type Priority = i32;

/// Largest delivery time the vortex accepts.
///
/// Leaves headroom so that `time + latency` arithmetic never wraps.
pub const MAX_SIM_TIME: SimTime = 1 << 62;

/// Priority classes used by the engine.
///
/// The ordering guarantees that cross-rank events are injected before any
/// local work at a sync horizon, that events enqueued for a tick are
/// delivered before the clock edge of that tick, and that a stop request
/// only takes effect once everything else scheduled for its tick has run.
pub mod priority {
    use super::Priority;

    /// Rank synchronization horizon.
    pub const SYNC: Priority = 25;
    /// Link event delivery.
    pub const EVENT: Priority = 50;
    /// Clock edges.
    pub const CLOCK: Priority = 60;
    /// One-shot callbacks.
    pub const ONESHOT: Priority = 70;
    /// Periodic statistic dumps.
    pub const STATISTIC_CLOCK: Priority = 85;
    /// Heartbeat progress output.
    pub const HEARTBEAT: Priority = 90;
    /// `stop_at` request.
    pub const STOP: Priority = 95;
    /// Primary-component exit.
    pub const EXIT: Priority = 99;
}

/// Identifier of a component.
///
/// The low 32 bits identify the component within the configuration graph;
/// the high 16 bits carry a sub-component slot (0 for the component itself).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(u64);

impl ComponentId {
    const SUB_SHIFT: u32 = 48;
    const BASE_MASK: u64 = 0xFFFF_FFFF;

    /// Creates the id of a top-level component.
    pub const fn new(base: u32) -> Self {
        Self(base as u64)
    }

    /// Reconstructs an id from its raw 64-bit encoding.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit encoding.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the id of sub-component `slot` of this component.
    pub const fn with_subcomponent(self, slot: u16) -> Self {
        Self((self.0 & Self::BASE_MASK) | ((slot as u64) << Self::SUB_SHIFT))
    }

    /// The top-level component part of the id.
    pub const fn component_part(self) -> u32 {
        (self.0 & Self::BASE_MASK) as u32
    }

    /// The sub-component slot, 0 for a top-level component.
    pub const fn subcomponent_part(self) -> u16 {
        (self.0 >> Self::SUB_SHIFT) as u16
    }

    /// Returns true if this id names a sub-component.
    pub const fn is_subcomponent(self) -> bool {
        self.subcomponent_part() != 0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_subcomponent() {
            write!(f, "{}.{}", self.component_part(), self.subcomponent_part())
        } else {
            write!(f, "{}", self.component_part())
        }
    }
}

/// Identifier of one endpoint of a link.
///
/// Endpoints created from configuration-graph link `i` get ids `2i` and
/// `2i + 1`, so every rank derives the same ids for the same graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Stable identifier of a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(pub u32);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Rank (partition) index.
pub type Rank = u32;

/// Position of this partition in a multi-rank run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInfo {
    /// This partition's rank
    pub rank: Rank,
    /// Total number of ranks
    pub num_ranks: Rank,
}

impl RankInfo {
    /// Creates rank info for `rank` out of `num_ranks`.
    pub fn new(rank: Rank, num_ranks: Rank) -> Self {
        Self { rank, num_ranks }
    }

    /// Rank info for a single-partition run.
    pub fn single() -> Self {
        Self::new(0, 1)
    }

    /// Returns true if the run has more than one partition.
    pub fn is_parallel(&self) -> bool {
        self.num_ranks > 1
    }
}

impl Default for RankInfo {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_id_encoding() {
        let id = ComponentId::new(42);
        assert_eq!(id.component_part(), 42);
        assert_eq!(id.subcomponent_part(), 0);
        assert!(!id.is_subcomponent());

        let sub = id.with_subcomponent(3);
        assert_eq!(sub.component_part(), 42);
        assert_eq!(sub.subcomponent_part(), 3);
        assert!(sub.is_subcomponent());
        assert_eq!(sub.to_string(), "42.3");
        assert_eq!(ComponentId::from_raw(sub.raw()), sub);
    }

    #[test]
    fn test_priority_ordering() {
        use priority::*;
        assert!(SYNC < EVENT);
        assert!(EVENT < CLOCK);
        assert!(CLOCK < ONESHOT);
        assert!(STATISTIC_CLOCK < STOP);
        assert!(STOP < EXIT);
    }

    #[test]
    fn test_rank_info() {
        assert!(!RankInfo::single().is_parallel());
        assert!(RankInfo::new(1, 4).is_parallel());
    }
}
