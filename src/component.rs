//! The component model.
//!
//! Components are opaque to the engine beyond the lifecycle hooks of
//! [`Component`]. They are owned by [`ComponentSlots`], which lives beside the
//! [`Context`] rather than inside it, so a handler can borrow its component
//! and the context at the same time.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use crate::context::Context;
use crate::error::SimResult;
use crate::params::Params;
use crate::types::{ComponentId, LinkId};

/// Upcast helper so trait objects can be downcast to their concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A simulated hardware model.
///
/// Construction happens in a factory registered with the
/// [`ComponentRegistry`](crate::registry::ComponentRegistry); the factory
/// receives the [`Context`] and configures links, clocks and statistics.
/// Every hook has an empty default.
pub trait Component: AsAny {
    /// Untimed phase `phase`. Messages sent with `send_untimed` in phase `n`
    /// can be received in phase `n + 1`.
    fn init(&mut self, _ctx: &mut Context, _phase: u32) -> SimResult<()> {
        Ok(())
    }

    /// Called once after the untimed phases, before time starts.
    fn setup(&mut self, _ctx: &mut Context) -> SimResult<()> {
        Ok(())
    }

    /// Untimed phase after the run, symmetric to `init`.
    fn complete(&mut self, _ctx: &mut Context, _phase: u32) -> SimResult<()> {
        Ok(())
    }

    /// Called once at the end of the simulation.
    fn finish(&mut self, _ctx: &mut Context) -> SimResult<()> {
        Ok(())
    }
}

/// Port name to link endpoint map of one component.
#[derive(Clone, Debug, Default)]
pub struct LinkMap {
    ports: BTreeMap<String, LinkId>,
}

impl LinkMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, port: impl Into<String>, link: LinkId) -> Option<LinkId> {
        self.ports.insert(port.into(), link)
    }

    /// Endpoint connected to `port`.
    pub fn get(&self, port: &str) -> Option<LinkId> {
        self.ports.get(port).copied()
    }

    /// Returns true if `port` is connected.
    pub fn is_connected(&self, port: &str) -> bool {
        self.ports.contains_key(port)
    }

    /// Connected ports in name order.
    pub fn ports(&self) -> impl Iterator<Item = (&str, LinkId)> + '_ {
        self.ports.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Number of connected ports.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Returns true if no port is connected.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// What the engine knows about a component.
#[derive(Clone, Debug)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: String,
    pub type_name: String,
    pub params: Params,
    pub link_map: LinkMap,
    /// Statistics enabled for this component, with their parameters.
    pub statistics: BTreeMap<String, Params>,
}

impl ComponentInfo {
    pub fn new(id: ComponentId, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            type_name: type_name.into(),
            params: Params::new(),
            link_map: LinkMap::new(),
            statistics: BTreeMap::new(),
        }
    }
}

/// Storage for the constructed components of one partition.
#[derive(Default)]
pub struct ComponentSlots {
    slots: BTreeMap<ComponentId, Box<dyn Component>>,
    by_name: HashMap<String, ComponentId>,
}

impl ComponentSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, id: ComponentId, name: &str, component: Box<dyn Component>) {
        self.by_name.insert(name.to_string(), id);
        self.slots.insert(id, component);
    }

    /// Borrows a component as a trait object.
    pub fn get_mut(&mut self, id: ComponentId) -> Option<&mut (dyn Component + 'static)> {
        // Deref the box here: `AsAny` must dispatch on the component, not on `Box`.
        self.slots.get_mut(&id).map(|c| &mut **c)
    }

    pub fn get(&self, id: ComponentId) -> Option<&(dyn Component + 'static)> {
        self.slots.get(&id).map(|c| &**c)
    }

    /// Looks up a component by name and concrete type.
    pub fn downcast<C: Component>(&self, name: &str) -> Option<&C> {
        let id = self.by_name.get(name)?;
        self.get(*id)?.as_any().downcast_ref::<C>()
    }

    /// Mutable variant of [`downcast`](Self::downcast).
    pub fn downcast_mut<C: Component>(&mut self, name: &str) -> Option<&mut C> {
        let id = *self.by_name.get(name)?;
        self.get_mut(id)?.as_any_mut().downcast_mut::<C>()
    }

    /// Component ids in ascending order.
    pub fn ids(&self) -> Vec<ComponentId> {
        self.slots.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        value: u32,
    }

    impl Component for Recorder {}

    struct Other;

    impl Component for Other {}

    #[test]
    fn test_slots_downcast() {
        let mut slots = ComponentSlots::new();
        slots.insert(ComponentId::new(1), "recorder", Box::new(Recorder { value: 3 }));
        slots.insert(ComponentId::new(0), "other", Box::new(Other));

        assert_eq!(slots.downcast::<Recorder>("recorder").unwrap().value, 3);
        assert!(slots.downcast::<Other>("recorder").is_none());
        slots.downcast_mut::<Recorder>("recorder").unwrap().value = 9;

        let comp = slots.get_mut(ComponentId::new(1)).unwrap();
        assert_eq!((*comp).as_any().downcast_ref::<Recorder>().unwrap().value, 9);
        assert_eq!(slots.ids(), vec![ComponentId::new(0), ComponentId::new(1)]);
    }

    #[test]
    fn test_link_map() {
        let mut map = LinkMap::new();
        map.insert("out", LinkId(4));
        assert_eq!(map.get("out"), Some(LinkId(4)));
        assert!(!map.is_connected("in"));
        assert_eq!(map.len(), 1);
    }
}
