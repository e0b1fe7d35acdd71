//! Primary-component shutdown gate.
//!
//! Components that drive the simulation register as primary and hold the
//! run open with `primary_component_do_not_end_sim`. When every holder has
//! released with `primary_component_ok_to_end_sim` the run may end. On a
//! single partition that happens at the end of the current tick; across
//! partitions the counts are summed at every sync horizon.

use std::collections::BTreeSet;

use crate::error::{SimError, SimResult};
use crate::types::ComponentId;

/// Reference count of components that keep the simulation alive.
#[derive(Debug, Default)]
pub struct ExitGate {
    holders: BTreeSet<ComponentId>,
    ever_held: bool,
    exit_scheduled: bool,
}

impl ExitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a holder. Idempotent per component.
    pub fn hold(&mut self, component: ComponentId) {
        self.holders.insert(component);
        self.ever_held = true;
    }

    /// Releases a holder. Returns true when the count has just reached zero.
    #[track_caller]
    pub fn release(&mut self, component: ComponentId) -> SimResult<bool> {
        if !self.holders.remove(&component) {
            return Err(SimError::configuration(format!(
                "component {} released the exit gate without holding it",
                component
            )));
        }
        Ok(self.holders.is_empty())
    }

    /// Number of current holders.
    pub fn count(&self) -> u64 {
        self.holders.len() as u64
    }

    /// Returns true if any component ever held the gate.
    pub fn ever_held(&self) -> bool {
        self.ever_held
    }

    /// Returns true if the gate allows the run to end on this partition.
    pub fn is_open(&self) -> bool {
        self.ever_held && self.holders.is_empty()
    }

    /// Marks that an exit activity is pending; returns false if one already was.
    pub(crate) fn mark_exit_scheduled(&mut self) -> bool {
        !std::mem::replace(&mut self.exit_scheduled, true)
    }

    pub(crate) fn clear_exit_scheduled(&mut self) {
        self.exit_scheduled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_counts() {
        let mut gate = ExitGate::new();
        assert!(!gate.is_open());
        gate.hold(ComponentId::new(0));
        gate.hold(ComponentId::new(1));
        gate.hold(ComponentId::new(1));
        assert_eq!(gate.count(), 2);
        assert!(!gate.release(ComponentId::new(0)).unwrap());
        assert!(gate.release(ComponentId::new(1)).unwrap());
        assert!(gate.is_open());
        assert!(gate.release(ComponentId::new(1)).unwrap_err().is_configuration());
    }

    #[test]
    fn test_exit_scheduled_once() {
        let mut gate = ExitGate::new();
        assert!(gate.mark_exit_scheduled());
        assert!(!gate.mark_exit_scheduled());
        gate.clear_exit_scheduled();
        assert!(gate.mark_exit_scheduled());
    }
}
