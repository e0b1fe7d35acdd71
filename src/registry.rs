//! Component factory registry for configuration-driven construction.
//!
//! The registry maps component type names to factories, and carries the
//! event payload types and custom statistic kinds every partition must
//! agree on. One registry is shared by all ranks of a run.
//!
//! # Example
//!
//! ```
//! use simcore::component::Component;
//! use simcore::registry::ComponentRegistry;
//!
//! struct Idle;
//! impl Component for Idle {}
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register("Idle", |_ctx, _params| Ok(Box::new(Idle)));
//! assert!(registry.contains("Idle"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::component::Component;
use crate::context::Context;
use crate::error::{SimError, SimResult};
use crate::event::{EventData, EventTypeRegistry};
use crate::params::Params;
use crate::statistics::kinds::{Collector, StatisticKinds};
use crate::statistics::StatValue;

/// Type alias for component factory functions.
pub type ComponentFactory = Arc<dyn Fn(&mut Context, &Params) -> SimResult<Box<dyn Component>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    factory: ComponentFactory,
    params: Option<Vec<String>>,
}

/// A registry for component factories.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: HashMap<String, Registration>,
    events: EventTypeRegistry,
    stat_kinds: StatisticKinds,
}

impl ComponentRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component factory with the given name.
    ///
    /// The factory runs during construction with the component's
    /// [`Context`] current; it configures links, clocks and statistics.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&mut Context, &Params) -> SimResult<Box<dyn Component>> + Send + Sync + 'static,
    {
        self.factories.insert(
            name.into(),
            Registration {
                factory: Arc::new(factory),
                params: None,
            },
        );
    }

    /// Registers a factory together with its documented parameter keys.
    ///
    /// Looking up any other key from the factory logs a warning.
    pub fn register_with_params<F, I, S>(&mut self, name: impl Into<String>, params: I, factory: F)
    where
        F: Fn(&mut Context, &Params) -> SimResult<Box<dyn Component>> + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.factories.insert(
            name.into(),
            Registration {
                factory: Arc::new(factory),
                params: Some(params.into_iter().map(Into::into).collect()),
            },
        );
    }

    /// Registers event payload type `T` for cross-rank transport.
    pub fn register_event<T: EventData>(&mut self) -> SimResult<()> {
        self.events.register::<T>()
    }

    /// Registers a custom statistic kind for values of type `T`.
    pub fn register_statistic_kind<T, F>(&mut self, name: &str, factory: F)
    where
        T: StatValue,
        F: Fn(&Params) -> SimResult<Box<dyn Collector<T>>> + Send + Sync + 'static,
    {
        self.stat_kinds.register::<T, F>(name, factory);
    }

    /// Creates a component instance by type name.
    ///
    /// Unknown types are a configuration error.
    pub fn create(&self, type_name: &str, ctx: &mut Context, params: &Params) -> SimResult<Box<dyn Component>> {
        let reg = self
            .factories
            .get(type_name)
            .ok_or_else(|| SimError::configuration(format!("unknown component type '{}'", type_name)))?;
        match &reg.params {
            Some(keys) => {
                let mut params = params.clone();
                params.push_allowed_keys(keys.iter().map(String::as_str));
                params.unexpected_keys();
                (reg.factory)(ctx, &params)
            }
            None => (reg.factory)(ctx, params),
        }
    }

    /// Returns true if a type is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Documented parameter keys of a type, if it declared any.
    pub fn documented_params(&self, type_name: &str) -> Option<&[String]> {
        self.factories.get(type_name)?.params.as_deref()
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if no types are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Returns an iterator over registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &String> {
        self.factories.keys()
    }

    /// Unregisters a component type.
    pub fn unregister(&mut self, type_name: &str) -> bool {
        self.factories.remove(type_name).is_some()
    }

    /// Event payload types known to this registry.
    pub fn event_types(&self) -> &EventTypeRegistry {
        &self.events
    }

    /// Custom statistic kinds known to this registry.
    pub fn statistic_kinds(&self) -> &StatisticKinds {
        &self.stat_kinds
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ComponentRegistry")
            .field("registered_types", &names)
            .field("events", &self.events)
            .field("stat_kinds", &self.stat_kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullEvent;
    use serde::{Deserialize, Serialize};

    struct Idle;
    impl Component for Idle {}

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;
    impl EventData for Ping {
        const TYPE_TAG: u16 = 0;
    }

    #[test]
    fn test_registry_basic() {
        let mut registry = ComponentRegistry::new();
        assert!(registry.is_empty());

        registry.register("Idle", |_, _| Ok(Box::new(Idle)));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("Idle"));
        assert!(registry.documented_params("Idle").is_none());
    }

    #[test]
    fn test_registry_unregister() {
        let mut registry = ComponentRegistry::new();
        registry.register("Idle", |_, _| Ok(Box::new(Idle)));
        assert!(registry.unregister("Idle"));
        assert!(!registry.contains("Idle"));
        assert!(!registry.unregister("Idle"));
    }

    #[test]
    fn test_registry_type_names() {
        let mut registry = ComponentRegistry::new();
        registry.register("A", |_, _| Ok(Box::new(Idle)));
        registry.register_with_params("B", ["rate"], |_, _| Ok(Box::new(Idle)));

        let names: Vec<_> = registry.type_names().collect();
        assert_eq!(names.len(), 2);
        assert_eq!(registry.documented_params("B").unwrap(), &["rate".to_string()]);
    }

    #[test]
    fn test_event_tag_conflict() {
        let mut registry = ComponentRegistry::new();
        registry.register_event::<NullEvent>().unwrap();
        assert!(registry.register_event::<Ping>().unwrap_err().is_configuration());
        assert_eq!(registry.event_types().len(), 1);
    }
}
