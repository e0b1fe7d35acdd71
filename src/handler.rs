//! Type-erased callbacks.
//!
//! A [`Handler<A, R>`] is "invoke with an `A`, get an `R`". It is either a
//! member handler, a closure over a component method resolved through the
//! component's id at call time, or a free handler that only sees the
//! [`Context`]. Both forms may carry a bound argument.
//!
//! Handlers are stored in a [`HandlerRegistry`] and referenced by a stable
//! [`HandlerId`]. Links, clocks and one-shots hold ids, never handlers, so
//! there are no back-pointers between components and the things that call
//! them.
//!
//! # Example
//!
//! ```
//! use simcore::context::Context;
//! use simcore::component::Component;
//! use simcore::error::SimResult;
//! use simcore::handler::ClockHandler;
//! use simcore::types::Cycle;
//!
//! struct Core {
//!     ticks: u64,
//! }
//!
//! impl Core {
//!     fn tick(&mut self, _ctx: &mut Context, _cycle: Cycle) -> SimResult<bool> {
//!         self.ticks += 1;
//!         Ok(false)
//!     }
//! }
//!
//! impl Component for Core {}
//!
//! let _handler: ClockHandler = ClockHandler::member(Core::tick);
//! ```

use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::fmt;

use crate::component::{Component, ComponentSlots};
use crate::context::Context;
use crate::error::{SimError, SimResult};
use crate::event::Event;
use crate::profile::AttachKey;
use crate::types::{ComponentId, Cycle, HandlerId};

type MemberFn<A, R> = Box<dyn FnMut(&mut (dyn Component + 'static), &mut Context, A) -> SimResult<R>>;
type FreeFn<A, R> = Box<dyn FnMut(&mut Context, A) -> SimResult<R>>;

/// A type-erased callback taking `A` and returning `R`.
pub enum Handler<A, R> {
    /// Method-style: resolved against a component at call time.
    Member {
        component: Option<ComponentId>,
        call: MemberFn<A, R>,
    },
    /// Function-style.
    Free { call: FreeFn<A, R> },
}

/// Receives events from a link.
pub type EventHandler = Handler<Event, ()>;

/// Runs on a clock edge. Returning `true` removes the handler from its clock.
pub type ClockHandler = Handler<Cycle, bool>;

/// Runs once at a one-shot time.
pub type OneShotHandler = Handler<(), ()>;

fn downcast_component<'a, C: Component>(
    component: &'a mut (dyn Component + 'static),
) -> SimResult<&'a mut C> {
    component
        .as_any_mut()
        .downcast_mut::<C>()
        .ok_or_else(|| SimError::fatal(format!("handler expected a {} component", type_name::<C>())))
}

impl<A: 'static, R: 'static> Handler<A, R> {
    /// Member handler on the component that registers it.
    pub fn member<C, F>(mut f: F) -> Self
    where
        C: Component,
        F: FnMut(&mut C, &mut Context, A) -> SimResult<R> + 'static,
    {
        Handler::Member {
            component: None,
            call: Box::new(move |comp: &mut (dyn Component + 'static), ctx: &mut Context, arg: A| {
                f(downcast_component::<C>(comp)?, ctx, arg)
            }),
        }
    }

    /// Member handler with a bound argument passed on every call.
    pub fn member_with<C, B, F>(mut bound: B, mut f: F) -> Self
    where
        C: Component,
        B: 'static,
        F: FnMut(&mut C, &mut Context, A, &mut B) -> SimResult<R> + 'static,
    {
        Handler::Member {
            component: None,
            call: Box::new(move |comp: &mut (dyn Component + 'static), ctx: &mut Context, arg: A| {
                f(downcast_component::<C>(comp)?, ctx, arg, &mut bound)
            }),
        }
    }

    /// Member handler on an explicit component.
    pub fn member_of<C, F>(component: ComponentId, f: F) -> Self
    where
        C: Component,
        F: FnMut(&mut C, &mut Context, A) -> SimResult<R> + 'static,
    {
        let mut handler = Self::member(f);
        handler.bind(component);
        handler
    }

    /// Free handler.
    pub fn free<F>(f: F) -> Self
    where
        F: FnMut(&mut Context, A) -> SimResult<R> + 'static,
    {
        Handler::Free { call: Box::new(f) }
    }

    /// Free handler with a bound argument passed on every call.
    pub fn free_with<B, F>(mut bound: B, mut f: F) -> Self
    where
        B: 'static,
        F: FnMut(&mut Context, A, &mut B) -> SimResult<R> + 'static,
    {
        Handler::Free {
            call: Box::new(move |ctx: &mut Context, arg: A| f(ctx, arg, &mut bound)),
        }
    }

    /// Component a member handler is bound to.
    pub fn component(&self) -> Option<ComponentId> {
        match self {
            Handler::Member { component, .. } => *component,
            Handler::Free { .. } => None,
        }
    }

    /// Returns true for member handlers.
    pub fn is_member(&self) -> bool {
        matches!(self, Handler::Member { .. })
    }

    /// Binds an unbound member handler to `id`. Already bound handlers keep their component.
    pub(crate) fn bind(&mut self, id: ComponentId) {
        if let Handler::Member { component, .. } = self {
            component.get_or_insert(id);
        }
    }

    pub(crate) fn call(&mut self, components: &mut ComponentSlots, ctx: &mut Context, arg: A) -> SimResult<R> {
        match self {
            Handler::Member { component, call } => {
                let id = component
                    .ok_or_else(|| SimError::fatal("member handler invoked before being bound to a component"))?;
                let target = components
                    .get_mut(id)
                    .ok_or_else(|| SimError::fatal(format!("handler target component {} does not exist", id)))?;
                call(target, ctx, arg)
            }
            Handler::Free { call } => call(ctx, arg),
        }
    }
}

impl<A, R> fmt::Debug for Handler<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Member { component, .. } => f.debug_struct("Member").field("component", component).finish(),
            Handler::Free { .. } => f.write_str("Free"),
        }
    }
}

/// The kind of activity a handler serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Event,
    Clock,
    OneShot,
}

/// Static description of a registered handler, given to attach points.
#[derive(Clone, Debug)]
pub struct HandlerMetadata {
    pub id: HandlerId,
    pub kind: HandlerKind,
    pub component: Option<ComponentId>,
    pub component_name: String,
    pub component_type: String,
    /// Port name, clock period or one-shot period.
    pub label: String,
}

/// The argument of an invocation as seen by an attach point.
#[derive(Clone, Copy, Debug)]
pub enum HandlerArg<'a> {
    Event(&'a Event),
    Cycle(Cycle),
    None,
}

/// Argument types handlers can be invoked with.
pub trait HandlerInput {
    fn describe(&self) -> HandlerArg<'_>;
}

impl HandlerInput for Event {
    fn describe(&self) -> HandlerArg<'_> {
        HandlerArg::Event(self)
    }
}

impl HandlerInput for Cycle {
    fn describe(&self) -> HandlerArg<'_> {
        HandlerArg::Cycle(*self)
    }
}

impl HandlerInput for () {
    fn describe(&self) -> HandlerArg<'_> {
        HandlerArg::None
    }
}

/// Return types of handlers; `removes` reports a self-deschedule.
pub trait HandlerOutput {
    fn removes(&self) -> bool;
}

impl HandlerOutput for () {
    fn removes(&self) -> bool {
        false
    }
}

impl HandlerOutput for bool {
    fn removes(&self) -> bool {
        *self
    }
}

enum Slot<A, R> {
    Idle(Handler<A, R>),
    /// Taken out for an invocation in progress.
    Busy,
    /// Removed during its invocation; freed when the invocation returns.
    Retired,
    Vacant,
}

struct Entry<A, R> {
    slot: Slot<A, R>,
    meta: HandlerMetadata,
    attach: Vec<(usize, AttachKey)>,
}

/// Handlers of one signature, indexed by [`HandlerId`].
///
/// Ids of removed handlers are reused, so the registry holds at most as many
/// slots as were ever live at once.
pub struct HandlerRegistry<A, R> {
    entries: Vec<Entry<A, R>>,
    /// Vacant slots ready for reuse, most recently freed last.
    free: Vec<u32>,
    live: usize,
}

impl<A, R> Default for HandlerRegistry<A, R> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

/// A handler checked out of its registry for one invocation.
pub(crate) struct Checkout<A, R> {
    pub handler: Handler<A, R>,
    pub owner: Option<ComponentId>,
    pub attach: Vec<(usize, AttachKey)>,
}

impl<A, R> HandlerRegistry<A, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next registration will receive.
    pub fn next_id(&self) -> HandlerId {
        match self.free.last() {
            Some(&slot) => HandlerId(slot),
            None => HandlerId(self.entries.len() as u32),
        }
    }

    /// Stores a handler. `meta.id` is overwritten with the assigned id.
    pub fn register(
        &mut self,
        handler: Handler<A, R>,
        mut meta: HandlerMetadata,
        attach: Vec<(usize, AttachKey)>,
    ) -> HandlerId {
        let id = self.next_id();
        meta.id = id;
        let entry = Entry {
            slot: Slot::Idle(handler),
            meta,
            attach,
        };
        match self.free.pop() {
            Some(slot) => self.entries[slot as usize] = entry,
            None => self.entries.push(entry),
        }
        self.live += 1;
        id
    }

    /// Removes a handler. A handler removed while it is running is dropped
    /// when its invocation returns, and only then is its id reused.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let Some(entry) = self.entries.get_mut(id.0 as usize) else {
            return false;
        };
        match std::mem::replace(&mut entry.slot, Slot::Vacant) {
            Slot::Vacant => false,
            Slot::Retired => {
                entry.slot = Slot::Retired;
                false
            }
            Slot::Idle(_) => {
                self.live -= 1;
                self.release(id);
                true
            }
            Slot::Busy => {
                entry.slot = Slot::Retired;
                self.live -= 1;
                true
            }
        }
    }

    fn release(&mut self, id: HandlerId) {
        if let Some(entry) = self.entries.get_mut(id.0 as usize) {
            entry.meta.component_name = String::new();
            entry.meta.component_type = String::new();
            entry.meta.label = String::new();
            entry.attach = Vec::new();
        }
        self.free.push(id.0);
    }

    /// Returns true if `id` names a live handler.
    pub fn contains(&self, id: HandlerId) -> bool {
        matches!(
            self.entries.get(id.0 as usize).map(|e| &e.slot),
            Some(Slot::Idle(_)) | Some(Slot::Busy)
        )
    }

    /// Registration metadata of a live handler.
    pub fn metadata(&self, id: HandlerId) -> Option<&HandlerMetadata> {
        self.entries
            .get(id.0 as usize)
            .filter(|e| matches!(e.slot, Slot::Idle(_) | Slot::Busy))
            .map(|e| &e.meta)
    }

    /// Number of slots allocated, live or awaiting reuse.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live handlers.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub(crate) fn checkout(&mut self, id: HandlerId) -> Option<Checkout<A, R>> {
        let entry = self.entries.get_mut(id.0 as usize)?;
        match std::mem::replace(&mut entry.slot, Slot::Busy) {
            Slot::Idle(handler) => Some(Checkout {
                handler,
                owner: entry.meta.component,
                attach: entry.attach.clone(),
            }),
            other => {
                entry.slot = other;
                None
            }
        }
    }

    pub(crate) fn restore(&mut self, id: HandlerId, handler: Handler<A, R>) {
        let Some(entry) = self.entries.get_mut(id.0 as usize) else {
            return;
        };
        match entry.slot {
            Slot::Busy => entry.slot = Slot::Idle(handler),
            Slot::Retired => {
                entry.slot = Slot::Vacant;
                self.release(id);
            }
            _ => {}
        }
    }
}

/// Invokes handler `id` from the registry selected by `select`.
///
/// Attach points observe the call before and after it runs. Returns
/// `Ok(None)` if the handler no longer exists.
pub(crate) fn invoke<A, R>(
    select: fn(&mut Context) -> &mut HandlerRegistry<A, R>,
    ctx: &mut Context,
    components: &mut ComponentSlots,
    id: HandlerId,
    arg: A,
) -> SimResult<Option<R>>
where
    A: HandlerInput + 'static,
    R: HandlerOutput + 'static,
{
    let Some(Checkout {
        mut handler,
        owner,
        attach,
    }) = select(ctx).checkout(id)
    else {
        return Ok(None);
    };

    if !attach.is_empty() {
        let described = arg.describe();
        for (tool, key) in &attach {
            ctx.profile_tools_mut().before_invoke(*tool, *key, &described);
        }
    }

    let previous = ctx.swap_current_component(owner);
    let result = handler.call(components, ctx, arg);
    ctx.swap_current_component(previous);
    select(ctx).restore(id, handler);

    if !attach.is_empty() {
        let removed = result.as_ref().map(HandlerOutput::removes).unwrap_or(false);
        for (tool, key) in &attach {
            ctx.profile_tools_mut().after_invoke(*tool, *key, removed);
        }
    }
    result.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: HandlerKind) -> HandlerMetadata {
        HandlerMetadata {
            id: HandlerId(0),
            kind,
            component: Some(ComponentId::new(3)),
            component_name: "cpu".into(),
            component_type: "Core".into(),
            label: "clk".into(),
        }
    }

    #[test]
    fn test_registry_assigns_dense_ids() {
        let mut reg: HandlerRegistry<Cycle, bool> = HandlerRegistry::new();
        let a = reg.register(Handler::free(|_, _| Ok(false)), meta(HandlerKind::Clock), vec![]);
        let b = reg.register(Handler::free(|_, _| Ok(true)), meta(HandlerKind::Clock), vec![]);
        assert_eq!(a, HandlerId(0));
        assert_eq!(b, HandlerId(1));
        assert_eq!(reg.metadata(b).unwrap().id, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_checkout_and_restore() {
        let mut reg: HandlerRegistry<(), ()> = HandlerRegistry::new();
        let id = reg.register(Handler::free(|_, _| Ok(())), meta(HandlerKind::OneShot), vec![]);
        let out = reg.checkout(id).unwrap();
        assert_eq!(out.owner, Some(ComponentId::new(3)));
        assert!(reg.checkout(id).is_none());
        assert!(reg.contains(id));
        reg.restore(id, out.handler);
        assert!(reg.checkout(id).is_some());
    }

    #[test]
    fn test_remove_while_busy_drops_on_restore() {
        let mut reg: HandlerRegistry<(), ()> = HandlerRegistry::new();
        let id = reg.register(Handler::free(|_, _| Ok(())), meta(HandlerKind::OneShot), vec![]);
        let out = reg.checkout(id).unwrap();
        assert!(reg.remove(id));
        reg.restore(id, out.handler);
        assert!(!reg.contains(id));
        assert!(!reg.remove(id));
        assert!(reg.is_empty());
        assert!(reg.metadata(id).is_none());
    }

    #[test]
    fn test_removed_ids_are_reused() {
        let mut reg: HandlerRegistry<(), ()> = HandlerRegistry::new();
        let first = reg.register(Handler::free(|_, _| Ok(())), meta(HandlerKind::OneShot), vec![]);
        for _ in 0..10_000 {
            let next = reg.next_id();
            let id = reg.register(Handler::free(|_, _| Ok(())), meta(HandlerKind::OneShot), vec![]);
            assert_eq!(id, next);
            assert_eq!(reg.metadata(id).unwrap().id, id);
            assert!(reg.remove(id));
        }
        assert_eq!(reg.capacity(), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(first));
    }

    #[test]
    fn test_busy_slot_is_not_reused_until_restored() {
        let mut reg: HandlerRegistry<(), ()> = HandlerRegistry::new();
        let id = reg.register(Handler::free(|_, _| Ok(())), meta(HandlerKind::OneShot), vec![]);
        let out = reg.checkout(id).unwrap();
        assert!(reg.remove(id));
        let other = reg.register(Handler::free(|_, _| Ok(())), meta(HandlerKind::OneShot), vec![]);
        assert_ne!(other, id);
        reg.restore(id, out.handler);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.next_id(), id);
    }

    #[test]
    fn test_member_binding() {
        struct Core;
        impl Component for Core {}

        let mut h: ClockHandler = Handler::member(|_c: &mut Core, _ctx: &mut Context, _cy: Cycle| Ok(false));
        assert!(h.is_member());
        assert_eq!(h.component(), None);
        h.bind(ComponentId::new(5));
        h.bind(ComponentId::new(6));
        assert_eq!(h.component(), Some(ComponentId::new(5)));

        let free: ClockHandler = Handler::free_with(0u32, |_ctx, _cy, n: &mut u32| {
            *n += 1;
            Ok(*n > 2)
        });
        assert_eq!(free.component(), None);
    }

    #[test]
    fn test_handler_output_removal_flag() {
        assert!(true.removes());
        assert!(!false.removes());
        assert!(!().removes());
    }
}
