//! Everything that can sit on the time vortex.
//!
//! Activities are a closed set, so they are a plain enum. Clock and one-shot
//! entries carry only a key into their owning set; the driver resolves the
//! key when the activity fires.

use std::fmt;

use crate::clock::ClockKey;
use crate::event::Event;
use crate::oneshot::OneShotKey;

/// A schedulable unit of work.
pub enum Activity {
    /// Delivery of an event to its receiving link endpoint.
    Event(Event),
    /// A clock edge.
    Clock(ClockKey),
    /// A bucket of one-shot callbacks.
    OneShot(OneShotKey),
    /// A rank synchronization horizon.
    Sync,
    /// Periodic progress output.
    Heartbeat,
    /// The configured `stop_at` time has been reached.
    Stop,
    /// The primary-component count dropped to zero.
    Exit,
}

impl Activity {
    /// Short name for logs and profiling.
    pub fn kind(&self) -> &'static str {
        match self {
            Activity::Event(_) => "event",
            Activity::Clock(_) => "clock",
            Activity::OneShot(_) => "oneshot",
            Activity::Sync => "sync",
            Activity::Heartbeat => "heartbeat",
            Activity::Stop => "stop",
            Activity::Exit => "exit",
        }
    }

    /// Returns the event if this is an event delivery.
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Activity::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Event(event) => f.debug_tuple("Event").field(event).finish(),
            Activity::Clock(key) => f.debug_tuple("Clock").field(key).finish(),
            Activity::OneShot(key) => f.debug_tuple("OneShot").field(key).finish(),
            other => f.write_str(other.kind()),
        }
    }
}
