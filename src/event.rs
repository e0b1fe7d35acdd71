//! Events carried over links.
//!
//! An [`Event`] wraps a typed payload together with the times stamped on it
//! by the sending link. Payload types implement [`EventData`], which gives
//! each type a stable 16-bit tag so a receiving partition can rebuild the
//! concrete type from bytes.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use simcore::event::{Event, EventData, EventTypeRegistry};
//!
//! #[derive(Debug, Serialize, Deserialize, PartialEq)]
//! struct Packet {
//!     seq: u32,
//! }
//!
//! impl EventData for Packet {
//!     const TYPE_TAG: u16 = 100;
//! }
//!
//! let mut types = EventTypeRegistry::new();
//! types.register::<Packet>().unwrap();
//!
//! let event = Event::new(Packet { seq: 7 });
//! let bytes = event.encode().unwrap();
//! let decoded = types.decode(&bytes).unwrap();
//! assert_eq!(decoded.downcast_ref::<Packet>(), Some(&Packet { seq: 7 }));
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{SimError, SimResult};
use crate::types::{LinkId, SimTime};

/// Size of the event header that precedes the payload bytes: tag + send time.
pub const EVENT_HEADER_LEN: usize = 2 + 8;

/// Payload codec: fixed-width little-endian integers on every host.
pub(crate) fn codec() -> impl bincode::Options + Copy {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// A concrete event payload type.
///
/// `TYPE_TAG` must be unique among the types registered with an
/// [`EventTypeRegistry`] and identical on every partition.
pub trait EventData: Serialize + DeserializeOwned + Send + fmt::Debug + 'static {
    /// Stable wire identifier of this payload type.
    const TYPE_TAG: u16;
}

/// Object-safe view of an [`EventData`] value.
pub trait Payload: Any + Send + fmt::Debug {
    /// Wire tag of the concrete type.
    fn type_tag(&self) -> u16;

    /// Rust type name of the concrete type, for diagnostics.
    fn type_name(&self) -> &'static str;

    /// Serializes the payload bytes (without the event header).
    fn encode_payload(&self) -> SimResult<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: EventData> Payload for T {
    fn type_tag(&self) -> u16 {
        T::TYPE_TAG
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn encode_payload(&self) -> SimResult<Vec<u8>> {
        use bincode::Options;
        Ok(codec().serialize(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Payload-free event, useful as a pure wake-up signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullEvent;

impl EventData for NullEvent {
    const TYPE_TAG: u16 = 0;
}

/// An event in flight on a link.
pub struct Event {
    payload: Box<dyn Payload>,
    send_time: SimTime,
    delivery_time: SimTime,
    delivery_link: Option<LinkId>,
}

impl Event {
    /// Creates an unsent event carrying `data`.
    pub fn new<T: EventData>(data: T) -> Self {
        Self::from_payload(Box::new(data))
    }

    /// Creates an unsent event from an already boxed payload.
    pub fn from_payload(payload: Box<dyn Payload>) -> Self {
        Self {
            payload,
            send_time: 0,
            delivery_time: 0,
            delivery_link: None,
        }
    }

    /// Time at which the event was sent.
    pub fn send_time(&self) -> SimTime {
        self.send_time
    }

    /// Time at which the event is (or was) delivered.
    pub fn delivery_time(&self) -> SimTime {
        self.delivery_time
    }

    /// Total latency applied by the sending link.
    pub fn latency(&self) -> SimTime {
        self.delivery_time.saturating_sub(self.send_time)
    }

    /// Receiving link endpoint, once sent.
    pub fn delivery_link(&self) -> Option<LinkId> {
        self.delivery_link
    }

    /// Wire tag of the payload.
    pub fn type_tag(&self) -> u16 {
        self.payload.type_tag()
    }

    /// Type name of the payload.
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Returns true if the payload is a `T`.
    pub fn is<T: EventData>(&self) -> bool {
        self.payload.as_any().is::<T>()
    }

    /// Borrows the payload as a `T`.
    pub fn downcast_ref<T: EventData>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    /// Mutably borrows the payload as a `T`.
    pub fn downcast_mut<T: EventData>(&mut self) -> Option<&mut T> {
        self.payload.as_any_mut().downcast_mut::<T>()
    }

    /// Takes ownership of the payload as a `T`, or gives the event back.
    pub fn into_data<T: EventData>(self) -> Result<T, Event> {
        if !self.is::<T>() {
            return Err(self);
        }
        let Event {
            payload,
            send_time,
            delivery_time,
            delivery_link,
        } = self;
        match payload.into_any().downcast::<T>() {
            Ok(data) => Ok(*data),
            // Unreachable after the `is` check, but keep the event intact regardless.
            Err(_) => Err(Event {
                payload: Box::new(NullEvent),
                send_time,
                delivery_time,
                delivery_link,
            }),
        }
    }

    /// Borrows the raw payload.
    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }

    pub(crate) fn stamp(&mut self, send_time: SimTime, delivery_time: SimTime, link: LinkId) {
        self.send_time = send_time;
        self.delivery_time = delivery_time;
        self.delivery_link = Some(link);
    }

    pub(crate) fn set_delivery(&mut self, delivery_time: SimTime, link: LinkId) {
        self.delivery_time = delivery_time;
        self.delivery_link = Some(link);
    }

    /// Serializes the event: `u16` tag, `u64` send time, then payload bytes,
    /// all little-endian.
    pub fn encode(&self) -> SimResult<Vec<u8>> {
        let body = self.payload.encode_payload()?;
        let mut out = Vec::with_capacity(EVENT_HEADER_LEN + body.len());
        out.extend_from_slice(&self.type_tag().to_le_bytes());
        out.extend_from_slice(&self.send_time.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("payload", &self.payload)
            .field("send_time", &self.send_time)
            .field("delivery_time", &self.delivery_time)
            .field("delivery_link", &self.delivery_link)
            .finish()
    }
}

type DecodeFn = Arc<dyn Fn(&[u8]) -> SimResult<Box<dyn Payload>> + Send + Sync>;

#[derive(Clone)]
struct EventType {
    name: &'static str,
    decode: DecodeFn,
}

/// Maps wire tags to payload decoders.
///
/// Every partition of a run must register the same set of types.
#[derive(Clone)]
pub struct EventTypeRegistry {
    types: HashMap<u16, EventType>,
}

impl Default for EventTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTypeRegistry {
    /// Creates a registry that knows only [`NullEvent`].
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        registry.insert::<NullEvent>();
        registry
    }

    fn insert<T: EventData>(&mut self) {
        let decode: DecodeFn = Arc::new(|bytes: &[u8]| {
            use bincode::Options;
            let value: T = codec().deserialize(bytes).map_err(|e| {
                SimError::serialization(format!("decoding {}: {}", type_name::<T>(), e))
            })?;
            Ok(Box::new(value) as Box<dyn Payload>)
        });
        self.types.insert(
            T::TYPE_TAG,
            EventType {
                name: type_name::<T>(),
                decode,
            },
        );
    }

    /// Registers payload type `T`.
    ///
    /// Registering the same type twice is a no-op; two different types
    /// sharing a tag is a configuration error.
    #[track_caller]
    pub fn register<T: EventData>(&mut self) -> SimResult<()> {
        if let Some(existing) = self.types.get(&T::TYPE_TAG) {
            if existing.name == type_name::<T>() {
                return Ok(());
            }
            return Err(SimError::configuration(format!(
                "event tag {} claimed by both {} and {}",
                T::TYPE_TAG,
                existing.name,
                type_name::<T>()
            )));
        }
        self.insert::<T>();
        Ok(())
    }

    /// Returns true if a type is registered under `tag`.
    pub fn contains(&self, tag: u16) -> bool {
        self.types.contains_key(&tag)
    }

    /// Type name registered under `tag`.
    pub fn type_name(&self, tag: u16) -> Option<&'static str> {
        self.types.get(&tag).map(|t| t.name)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Rebuilds an event from the bytes produced by [`Event::encode`].
    ///
    /// The returned event carries its original send time; the delivery time
    /// and link are filled in by the caller from the wire frame.
    pub fn decode(&self, bytes: &[u8]) -> SimResult<Event> {
        if bytes.len() < EVENT_HEADER_LEN {
            return Err(SimError::serialization(format!(
                "truncated event: {} bytes, header needs {}",
                bytes.len(),
                EVENT_HEADER_LEN
            )));
        }
        let tag = u16::from_le_bytes([bytes[0], bytes[1]]);
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[2..EVENT_HEADER_LEN]);
        let send_time = SimTime::from_le_bytes(time);

        let ty = self
            .types
            .get(&tag)
            .ok_or_else(|| SimError::serialization(format!("unknown event type tag {}", tag)))?;
        let payload = (ty.decode)(&bytes[EVENT_HEADER_LEN..])?;
        let mut event = Event::from_payload(payload);
        event.send_time = send_time;
        Ok(event)
    }
}

impl fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.types.iter().map(|(tag, t)| (*tag, t.name)).collect();
        tags.sort_unstable();
        f.debug_struct("EventTypeRegistry").field("types", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Packet {
        seq: u32,
        data: Vec<u8>,
    }

    impl EventData for Packet {
        const TYPE_TAG: u16 = 17;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor(u8);

    impl EventData for Impostor {
        const TYPE_TAG: u16 = 17;
    }

    #[test]
    fn test_event_downcast() {
        let mut event = Event::new(Packet { seq: 1, data: vec![] });
        assert!(event.is::<Packet>());
        assert!(!event.is::<NullEvent>());
        event.downcast_mut::<Packet>().unwrap().seq = 2;
        assert_eq!(event.downcast_ref::<Packet>().unwrap().seq, 2);

        let event = event.into_data::<NullEvent>().unwrap_err();
        let packet = event.into_data::<Packet>().unwrap();
        assert_eq!(packet.seq, 2);
    }

    #[test]
    fn test_encode_layout_is_little_endian() {
        let mut event = Event::new(Packet { seq: 0x0102_0304, data: vec![9] });
        event.stamp(0x10, 0x20, LinkId(3));
        let bytes = event.encode().unwrap();
        assert_eq!(&bytes[0..2], &17u16.to_le_bytes());
        assert_eq!(&bytes[2..10], &0x10u64.to_le_bytes());
        assert_eq!(&bytes[10..14], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_decode_restores_payload_and_send_time() {
        let mut types = EventTypeRegistry::new();
        types.register::<Packet>().unwrap();

        let mut event = Event::new(Packet { seq: 5, data: vec![1, 2] });
        event.stamp(40, 50, LinkId(0));
        let decoded = types.decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.send_time(), 40);
        assert_eq!(decoded.delivery_link(), None);
        assert_eq!(decoded.downcast_ref::<Packet>(), Some(&Packet { seq: 5, data: vec![1, 2] }));
    }

    #[test]
    fn test_decode_errors() {
        let types = EventTypeRegistry::new();
        assert!(types.decode(&[1, 2, 3]).unwrap_err().is_serialization());

        let bytes = Event::new(Packet { seq: 1, data: vec![] }).encode().unwrap();
        let err = types.decode(&bytes).unwrap_err();
        assert!(err.is_serialization());
        assert!(err.to_string().contains("17"));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let mut types = EventTypeRegistry::new();
        types.register::<Packet>().unwrap();
        types.register::<Packet>().unwrap();
        assert!(types.register::<Impostor>().unwrap_err().is_configuration());
        assert_eq!(types.len(), 2);
    }
}
