//! The component host API.
//!
//! A [`Context`] is the state of one partition minus its components. Every
//! factory, lifecycle hook and handler receives `&mut Context` and uses it to
//! configure links, send events, register clocks, one-shots and statistics,
//! and to hold the run open as a primary component.
//!
//! Calls that act "as a component" (configuring a port, registering a
//! statistic, holding the exit gate) use the *current* component: the one
//! being constructed, the one whose hook is running, or the owner of the
//! handler being invoked.
//!
//! # Example
//!
//! ```
//! use simcore::component::Component;
//! use simcore::context::Context;
//! use simcore::error::SimResult;
//! use simcore::event::{Event, NullEvent};
//! use simcore::handler::{ClockHandler, EventHandler};
//! use simcore::params::Params;
//! use simcore::types::{Cycle, LinkId};
//!
//! struct Pinger {
//!     out: LinkId,
//!     received: u64,
//! }
//!
//! impl Pinger {
//!     fn build(ctx: &mut Context, params: &Params) -> SimResult<Box<dyn Component>> {
//!         let out = ctx.configure_link("out", EventHandler::member(Pinger::on_event))?;
//!         ctx.register_clock(&params.find("clock", "1GHz".to_string())?, ClockHandler::member(Pinger::tick))?;
//!         Ok(Box::new(Pinger { out, received: 0 }))
//!     }
//!
//!     fn tick(&mut self, ctx: &mut Context, _cycle: Cycle) -> SimResult<bool> {
//!         ctx.send(self.out, Event::new(NullEvent))?;
//!         Ok(false)
//!     }
//!
//!     fn on_event(&mut self, _ctx: &mut Context, _event: Event) -> SimResult<()> {
//!         self.received += 1;
//!         Ok(())
//!     }
//! }
//!
//! impl Component for Pinger {}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::activity::Activity;
use crate::clock::{ClockSchedule, ClockSet};
use crate::component::{ComponentInfo, LinkMap};
use crate::error::{SimError, SimResult};
use crate::event::{Event, EventData, EventTypeRegistry};
use crate::exit::ExitGate;
use crate::handler::{
    ClockHandler, EventHandler, Handler, HandlerKind, HandlerMetadata, HandlerRegistry, OneShotHandler,
};
use crate::link::{Delivery, LinkTable};
use crate::oneshot::{OneShotSet, OneShotToken};
use crate::output::Output;
use crate::params::Params;
use crate::profile::ProfileTools;
use crate::report::RunCounters;
use crate::statistics::engine::StatisticsEngine;
use crate::statistics::{StatInfo, StatValue, Statistic};
use crate::time::{TimeConverter, TimeLord};
use crate::types::{priority, ComponentId, Cycle, HandlerId, LinkId, Priority, Rank, RankInfo, SimTime};
use crate::vortex::TimeVortex;
use crate::wire::OutboundEvent;

/// Lifecycle phase of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Components are being built from the configuration graph.
    Construction,
    /// Untimed init phase `n`.
    Init(u32),
    Setup,
    /// Simulated time is advancing.
    Run,
    /// Untimed complete phase `n`.
    Complete(u32),
    Finish,
}

impl Phase {
    fn is_untimed(self) -> bool {
        matches!(self, Phase::Init(_) | Phase::Complete(_))
    }
}

/// A clock handler registration, used to unregister or re-register it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockHandle {
    pub converter: TimeConverter,
    pub handler: HandlerId,
    pub priority: Priority,
}

impl ClockHandle {
    /// Period of the clock in core ticks.
    pub fn period(&self) -> SimTime {
        self.converter.factor()
    }
}

/// Host state of one partition, handed to every hook and handler.
pub struct Context {
    rank: RankInfo,
    time_lord: TimeLord,
    verbosity: u32,
    max_event_size: usize,
    pub(crate) vortex: TimeVortex,
    pub(crate) links: LinkTable,
    pub(crate) event_handlers: HandlerRegistry<Event, ()>,
    pub(crate) clock_handlers: HandlerRegistry<Cycle, bool>,
    pub(crate) oneshot_handlers: HandlerRegistry<(), ()>,
    pub(crate) clocks: ClockSet,
    pub(crate) oneshots: OneShotSet,
    pub(crate) exit: ExitGate,
    pub(crate) stats: StatisticsEngine,
    profile: ProfileTools,
    event_types: EventTypeRegistry,
    components: BTreeMap<ComponentId, ComponentInfo>,
    current: Option<ComponentId>,
    pub(crate) phase: Phase,
    /// Timed events per destination rank, drained at each sync horizon.
    pub(crate) outbound: Vec<Vec<OutboundEvent>>,
    /// Untimed messages per destination rank, drained after each phase.
    pub(crate) untimed_outbound: Vec<Vec<OutboundEvent>>,
    /// Local untimed messages, delivered after the phase that sent them.
    pub(crate) pending_untimed: Vec<Event>,
    /// Earliest delivery time a cross-rank send may have.
    pub(crate) next_sync: SimTime,
    /// Whether the end-of-run decision is taken at sync horizons.
    pub(crate) exit_at_sync: bool,
    pub(crate) counters: RunCounters,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rank: RankInfo,
        time_lord: TimeLord,
        links: LinkTable,
        stats: StatisticsEngine,
        profile: ProfileTools,
        event_types: EventTypeRegistry,
        max_event_size: usize,
        verbosity: u32,
    ) -> Self {
        let peers = rank.num_ranks as usize;
        Self {
            rank,
            time_lord,
            verbosity,
            max_event_size,
            vortex: TimeVortex::new(),
            links,
            event_handlers: HandlerRegistry::new(),
            clock_handlers: HandlerRegistry::new(),
            oneshot_handlers: HandlerRegistry::new(),
            clocks: ClockSet::new(),
            oneshots: OneShotSet::new(),
            exit: ExitGate::new(),
            stats,
            profile,
            event_types,
            components: BTreeMap::new(),
            current: None,
            phase: Phase::Construction,
            outbound: vec![Vec::new(); peers],
            untimed_outbound: vec![Vec::new(); peers],
            pending_untimed: Vec::new(),
            next_sync: 0,
            exit_at_sync: false,
            counters: RunCounters::default(),
        }
    }

    // ---- crate hooks -------------------------------------------------

    pub(crate) fn profile_tools_mut(&mut self) -> &mut ProfileTools {
        &mut self.profile
    }

    pub(crate) fn profile_tools(&self) -> &ProfileTools {
        &self.profile
    }

    /// Makes `id` the current component and returns the previous one.
    pub(crate) fn swap_current_component(&mut self, id: Option<ComponentId>) -> Option<ComponentId> {
        std::mem::replace(&mut self.current, id)
    }

    pub(crate) fn event_registry(ctx: &mut Context) -> &mut HandlerRegistry<Event, ()> {
        &mut ctx.event_handlers
    }

    pub(crate) fn clock_registry(ctx: &mut Context) -> &mut HandlerRegistry<Cycle, bool> {
        &mut ctx.clock_handlers
    }

    pub(crate) fn oneshot_registry(ctx: &mut Context) -> &mut HandlerRegistry<(), ()> {
        &mut ctx.oneshot_handlers
    }

    pub(crate) fn add_component(&mut self, info: ComponentInfo) {
        self.components.insert(info.id, info);
    }

    pub(crate) fn component_info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.components.get(&id)
    }

    pub(crate) fn component_info_mut(&mut self, id: ComponentId) -> Option<&mut ComponentInfo> {
        self.components.get_mut(&id)
    }

    pub(crate) fn component_ids(&self) -> Vec<ComponentId> {
        self.components.keys().copied().collect()
    }

    pub(crate) fn event_types(&self) -> &EventTypeRegistry {
        &self.event_types
    }

    #[track_caller]
    fn require_current(&self, what: &str) -> SimResult<ComponentId> {
        self.current
            .ok_or_else(|| SimError::configuration(format!("{} called outside of a component", what)))
    }

    #[track_caller]
    fn current_info(&self, what: &str) -> SimResult<&ComponentInfo> {
        let id = self.require_current(what)?;
        self.components
            .get(&id)
            .ok_or_else(|| SimError::fatal(format!("component {} is not known to this rank", id)))
    }

    fn install<A: 'static, R: 'static>(
        &mut self,
        select: fn(&mut Context) -> &mut HandlerRegistry<A, R>,
        kind: HandlerKind,
        mut handler: Handler<A, R>,
        label: String,
    ) -> HandlerId {
        if let Some(id) = self.current {
            handler.bind(id);
        }
        let component = handler.component().or(self.current);
        let (component_name, component_type) = component
            .and_then(|id| self.components.get(&id))
            .map(|info| (info.name.clone(), info.type_name.clone()))
            .unwrap_or_else(|| ("<core>".to_string(), "<core>".to_string()));
        let meta = HandlerMetadata {
            id: select(self).next_id(),
            kind,
            component,
            component_name,
            component_type,
            label,
        };
        let attach = self.profile.register_handler(&meta);
        select(self).register(handler, meta, attach)
    }

    // ---- time --------------------------------------------------------

    /// Current simulated time in core ticks.
    pub fn now(&self) -> SimTime {
        self.vortex.current_time()
    }

    /// Same as [`now`](Self::now).
    pub fn current_sim_time(&self) -> SimTime {
        self.now()
    }

    /// Current time in units of `tc`, rounded down.
    pub fn current_cycle(&self, tc: &TimeConverter) -> Cycle {
        tc.convert_from_core_time(self.now())
    }

    pub fn time_lord(&self) -> &TimeLord {
        &self.time_lord
    }

    /// Converts a time or frequency string to core ticks.
    pub fn ticks(&self, text: &str) -> SimResult<SimTime> {
        self.time_lord.ticks(text)
    }

    /// Current time rendered in SI units.
    pub fn format_now(&self) -> String {
        self.time_lord.format_time(self.now())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn rank(&self) -> RankInfo {
        self.rank
    }

    // ---- component identity -----------------------------------------

    /// The component on whose behalf the context is acting.
    pub fn current_component(&self) -> Option<ComponentId> {
        self.current
    }

    /// Name of the current component.
    pub fn component_name(&self) -> SimResult<&str> {
        Ok(&self.current_info("component_name")?.name)
    }

    /// Parameters of the current component.
    pub fn params(&self) -> SimResult<&Params> {
        Ok(&self.current_info("params")?.params)
    }

    /// Ports of the current component.
    pub fn link_map(&self) -> SimResult<&LinkMap> {
        Ok(&self.current_info("link_map")?.link_map)
    }

    pub fn is_port_connected(&self, port: &str) -> bool {
        self.current_info("is_port_connected")
            .map(|info| info.link_map.is_connected(port))
            .unwrap_or(false)
    }

    /// Diagnostic output prefixed with the current component's name.
    pub fn output(&self) -> Output {
        match self.current_info("output") {
            Ok(info) => Output::new(info.name.clone(), self.verbosity),
            Err(_) => Output::new(format!("rank{}", self.rank.rank), self.verbosity),
        }
    }

    // ---- links -------------------------------------------------------

    #[track_caller]
    fn port_link(&self, port: &str) -> SimResult<Option<LinkId>> {
        Ok(self.current_info("configure_link")?.link_map.get(port))
    }

    #[track_caller]
    fn required_port(&self, port: &str) -> SimResult<LinkId> {
        match self.port_link(port)? {
            Some(link) => Ok(link),
            None => {
                let info = self.current_info("configure_link")?;
                Err(SimError::configuration(format!(
                    "port '{}' of component '{}' ({}) is not connected",
                    port, info.name, info.type_name
                )))
            }
        }
    }

    fn configure_end(&mut self, link: LinkId, handler: Option<EventHandler>, time_base: SimTime, label: &str) -> SimResult<()> {
        let delivery = match handler {
            Some(handler) => {
                let id = self.install(Context::event_registry, HandlerKind::Event, handler, label.to_string());
                Delivery::Handler(id)
            }
            None => Delivery::Polling,
        };
        self.links.configure(link, delivery, time_base)
    }

    /// Configures a connected port to deliver arriving events to `handler`.
    ///
    /// An unconnected port is a configuration error.
    #[track_caller]
    pub fn configure_link(&mut self, port: &str, handler: EventHandler) -> SimResult<LinkId> {
        let link = self.required_port(port)?;
        self.configure_end(link, Some(handler), 1, port)?;
        Ok(link)
    }

    /// Like [`configure_link`](Self::configure_link), but an unconnected
    /// port yields `None`.
    pub fn configure_optional_link(&mut self, port: &str, handler: EventHandler) -> SimResult<Option<LinkId>> {
        match self.port_link(port)? {
            Some(link) => {
                self.configure_end(link, Some(handler), 1, port)?;
                Ok(Some(link))
            }
            None => Ok(None),
        }
    }

    /// Configures a port whose events are pulled with [`recv`](Self::recv).
    #[track_caller]
    pub fn configure_polling_link(&mut self, port: &str) -> SimResult<LinkId> {
        let link = self.required_port(port)?;
        self.configure_end(link, None, 1, port)?;
        Ok(link)
    }

    /// Configures a port whose extra send latency is counted in units of
    /// `time_base`. Without a handler the port is polled.
    #[track_caller]
    pub fn configure_link_with_time_base(
        &mut self,
        port: &str,
        time_base: &str,
        handler: Option<EventHandler>,
    ) -> SimResult<LinkId> {
        let link = self.required_port(port)?;
        let base = self.time_lord.get_time_converter(time_base)?;
        self.configure_end(link, handler, base.factor(), port)?;
        Ok(link)
    }

    /// Configures a port and adds `latency` to every send from it.
    #[track_caller]
    pub fn configure_link_with_latency(&mut self, port: &str, latency: &str, handler: EventHandler) -> SimResult<LinkId> {
        let link = self.required_port(port)?;
        let extra = self.time_lord.ticks(latency)?;
        self.configure_end(link, Some(handler), 1, port)?;
        self.links.add_send_latency(link, extra)?;
        Ok(link)
    }

    /// Adds `latency` to every future send from `link`.
    pub fn add_send_latency(&mut self, link: LinkId, latency: &str) -> SimResult<()> {
        let extra = self.time_lord.ticks(latency)?;
        self.links.add_send_latency(link, extra)
    }

    fn self_link(&mut self, name: &str, latency: SimTime, zero: bool, handler: Option<EventHandler>) -> SimResult<LinkId> {
        let owner = self.require_current("configure_self_link")?;
        if self.current_info("configure_self_link")?.link_map.is_connected(name) {
            return Err(SimError::configuration(format!(
                "self link '{}' clashes with a port of the same name",
                name
            )));
        }
        let link = self.links.add_self_link(owner, name, latency, zero);
        self.configure_end(link, handler, 1, name)?;
        if let Some(info) = self.components.get_mut(&owner) {
            info.link_map.insert(name, link);
        }
        Ok(link)
    }

    /// Creates a link from the current component back to itself.
    ///
    /// The latency must be at least one tick.
    #[track_caller]
    pub fn configure_self_link(&mut self, name: &str, latency: &str, handler: Option<EventHandler>) -> SimResult<LinkId> {
        let ticks = self.time_lord.ticks(latency)?;
        if ticks == 0 {
            return Err(SimError::temporal(format!(
                "self link '{}' has zero latency; use configure_zero_latency_self_link",
                name
            )));
        }
        self.self_link(name, ticks, false, handler)
    }

    /// Creates a self link that delivers in the same tick it is sent.
    pub fn configure_zero_latency_self_link(&mut self, name: &str, handler: Option<EventHandler>) -> SimResult<LinkId> {
        self.self_link(name, 0, true, handler)
    }

    /// Sends `event` on `link` with the link's own latency.
    #[track_caller]
    pub fn send(&mut self, link: LinkId, event: Event) -> SimResult<()> {
        self.send_with_delay(link, 0, event)
    }

    /// Wraps `data` in an event and sends it.
    #[track_caller]
    pub fn send_event<T: EventData>(&mut self, link: LinkId, data: T) -> SimResult<()> {
        self.send_with_delay(link, 0, Event::new(data))
    }

    /// Sends `event` with `extra` additional latency, counted in units of
    /// the link's time base.
    #[track_caller]
    pub fn send_with_delay(&mut self, link: LinkId, extra: SimTime, mut event: Event) -> SimResult<()> {
        if !matches!(self.phase, Phase::Setup | Phase::Run) {
            return Err(SimError::configuration(format!(
                "timed send on {} during {:?}; use send_untimed",
                link, self.phase
            )));
        }
        let now = self.now();
        let plan = self.links.plan_send(link, now, extra)?;
        event.stamp(now, plan.delivery_time, plan.target);
        self.counters.events_sent += 1;
        match plan.remote {
            Some(rank) => {
                if plan.delivery_time < self.next_sync {
                    return Err(SimError::temporal(format!(
                        "event for {} delivered at {} before the next sync horizon {}",
                        plan.target, plan.delivery_time, self.next_sync
                    )));
                }
                let outbound = self.export(&event, plan.target, plan.delivery_time)?;
                self.outbound[rank as usize].push(outbound);
                self.counters.events_exported += 1;
            }
            None => {
                self.vortex
                    .insert(Activity::Event(event), plan.delivery_time, priority::EVENT)?;
            }
        }
        Ok(())
    }

    #[track_caller]
    fn export(&self, event: &Event, link: LinkId, delivery_time: SimTime) -> SimResult<OutboundEvent> {
        if self.event_types.type_name(event.type_tag()) != Some(event.type_name()) {
            return Err(SimError::serialization(format!(
                "event type {} (tag {}) is not registered for cross-rank transport",
                event.type_name(),
                event.type_tag()
            )));
        }
        let bytes = event.encode()?;
        if bytes.len() > self.max_event_size {
            return Err(SimError::serialization(format!(
                "{} event of {} bytes exceeds the maximum event size {}",
                event.type_name(),
                bytes.len(),
                self.max_event_size
            )));
        }
        Ok(OutboundEvent {
            link,
            delivery_time,
            bytes,
        })
    }

    /// Pops the oldest delivered event of a polling link.
    pub fn recv(&mut self, link: LinkId) -> SimResult<Option<Event>> {
        self.links.pop_polling(link)
    }

    /// Sends an untimed message during an init or complete phase. It can be
    /// received in the next phase.
    #[track_caller]
    pub fn send_untimed(&mut self, link: LinkId, mut event: Event) -> SimResult<()> {
        if !self.phase.is_untimed() {
            return Err(SimError::configuration(format!(
                "untimed send on {} during {:?}",
                link, self.phase
            )));
        }
        let end = self
            .links
            .get(link)
            .ok_or_else(|| SimError::configuration(format!("{} does not exist on this rank", link)))?;
        if end.is_disconnected() {
            return Err(SimError::configuration(format!("untimed send on disconnected port '{}'", end.port())));
        }
        let (target, remote) = (end.pair(), end.remote_rank());
        let now = self.now();
        event.stamp(now, now, target);
        self.counters.untimed_sent += 1;
        match remote {
            Some(rank) => {
                let outbound = self.export(&event, target, now)?;
                self.untimed_outbound[rank as usize].push(outbound);
            }
            None => self.pending_untimed.push(event),
        }
        Ok(())
    }

    /// Pops the oldest untimed message delivered to `link`.
    pub fn recv_untimed(&mut self, link: LinkId) -> SimResult<Option<Event>> {
        if !matches!(self.phase, Phase::Init(_) | Phase::Setup | Phase::Complete(_)) {
            return Err(SimError::configuration(format!(
                "untimed receive on {} during {:?}",
                link, self.phase
            )));
        }
        self.links.pop_untimed(link)
    }

    /// Number of untimed messages queued for the end of the current phase.
    pub(crate) fn untimed_backlog(&self) -> usize {
        self.pending_untimed.len() + self.untimed_outbound.iter().map(Vec::len).sum::<usize>()
    }

    /// Moves local untimed messages into the receivers' queues.
    pub(crate) fn deliver_untimed(&mut self, events: Vec<Event>) -> SimResult<()> {
        for event in events {
            let link = event
                .delivery_link()
                .ok_or_else(|| SimError::fatal("untimed message without a receiving link"))?;
            self.links.push_untimed(link, event)?;
        }
        Ok(())
    }

    /// Disconnects `link` and its pair, dropping every event in flight to
    /// either end.
    pub fn disconnect_link(&mut self, link: LinkId) -> SimResult<usize> {
        let ids = self.links.disconnect(link)?;
        let dropped = self
            .vortex
            .remove_where(|a| a.as_event().and_then(Event::delivery_link).map_or(false, |l| ids.contains(&l)));
        self.counters.events_dropped += dropped.len() as u64;
        tracing::debug!(rank = self.rank.rank, %link, dropped = dropped.len(), "link disconnected");
        Ok(dropped.len())
    }

    // ---- clocks ------------------------------------------------------

    /// Registers `handler` on the clock of `period` (a period or frequency
    /// string) and returns the clock's converter.
    #[track_caller]
    pub fn register_clock(&mut self, period: &str, handler: ClockHandler) -> SimResult<TimeConverter> {
        Ok(self.register_clock_with_priority(period, handler, priority::CLOCK)?.converter)
    }

    /// Like [`register_clock`](Self::register_clock), returning a handle for
    /// later unregistration.
    #[track_caller]
    pub fn register_clock_handler(&mut self, period: &str, handler: ClockHandler) -> SimResult<ClockHandle> {
        self.register_clock_with_priority(period, handler, priority::CLOCK)
    }

    /// Registers a clock handler at an explicit priority.
    #[track_caller]
    pub fn register_clock_with_priority(
        &mut self,
        period: &str,
        handler: ClockHandler,
        prio: Priority,
    ) -> SimResult<ClockHandle> {
        let converter = self.time_lord.get_time_converter(period)?;
        self.install_clock(converter, handler, prio, period.to_string())
    }

    /// Registers a clock handler whose period is given in core ticks.
    pub(crate) fn register_core_clock(
        &mut self,
        period: SimTime,
        handler: ClockHandler,
        prio: Priority,
        label: &str,
    ) -> SimResult<ClockHandle> {
        let converter = self.time_lord.get_time_converter_from_factor(period)?;
        self.install_clock(converter, handler, prio, label.to_string())
    }

    fn install_clock(
        &mut self,
        converter: TimeConverter,
        handler: ClockHandler,
        prio: Priority,
        label: String,
    ) -> SimResult<ClockHandle> {
        let id = self.install(Context::clock_registry, HandlerKind::Clock, handler, label);
        let handle = ClockHandle {
            converter,
            handler: id,
            priority: prio,
        };
        self.schedule_clock(&handle)?;
        Ok(handle)
    }

    fn schedule_clock(&mut self, handle: &ClockHandle) -> SimResult<()> {
        let (key, schedule) = self
            .clocks
            .add_handler(handle.period(), handle.priority, handle.handler, self.now());
        if let ClockSchedule::ScheduleAt(at) = schedule {
            self.vortex.insert(Activity::Clock(key), at, handle.priority)?;
        }
        Ok(())
    }

    /// Removes a handler from its clock. Returns false if it was not on it.
    pub fn unregister_clock(&mut self, handle: &ClockHandle) -> bool {
        match self.clocks.find(handle.period(), Some(handle.priority)) {
            Some(key) => self.clocks.remove_handler(key, handle.handler),
            None => false,
        }
    }

    /// Puts a removed handler back on its clock. Returns the cycle of its
    /// next invocation.
    pub fn reregister_clock(&mut self, handle: &ClockHandle) -> SimResult<Cycle> {
        if !self.clock_handlers.contains(handle.handler) {
            return Err(SimError::configuration(format!("{} is not a clock handler", handle.handler)));
        }
        if self.clock_is_scheduled(handle) {
            return Err(SimError::configuration(format!(
                "{} is already on its clock",
                handle.handler
            )));
        }
        self.schedule_clock(handle)?;
        self.next_clock_cycle(handle)
            .ok_or_else(|| SimError::fatal(format!("clock of {} vanished", handle.handler)))
    }

    /// Cycle number of the clock's next edge.
    pub fn next_clock_cycle(&self, handle: &ClockHandle) -> Option<Cycle> {
        let key = self.clocks.find(handle.period(), Some(handle.priority))?;
        self.clocks.next_cycle(key, self.now())
    }

    /// Returns true if the handler is on its clock.
    pub fn clock_is_scheduled(&self, handle: &ClockHandle) -> bool {
        self.clocks
            .find_handler(handle.period(), handle.handler)
            .and_then(|key| self.clocks.get(key))
            .map_or(false, |clock| clock.priority() == handle.priority && clock.is_scheduled())
    }

    // ---- one-shots ---------------------------------------------------

    /// Runs `handler` once, `delay` after now.
    #[track_caller]
    pub fn register_oneshot(&mut self, delay: &str, handler: OneShotHandler) -> SimResult<OneShotToken> {
        let period = self.time_lord.get_time_converter(delay)?.factor();
        let id = self.install(Context::oneshot_registry, HandlerKind::OneShot, handler, delay.to_string());
        let (token, schedule) = self.oneshots.add_handler(period, id, self.now());
        if let Some(at) = schedule {
            if let Err(err) = self.vortex.insert(Activity::OneShot(token.key), at, priority::ONESHOT) {
                self.oneshots.cancel(&token);
                self.oneshot_handlers.remove(id);
                return Err(err);
            }
        }
        Ok(token)
    }

    /// Cancels a pending one-shot. Returns false if it already fired.
    pub fn cancel_oneshot(&mut self, token: &OneShotToken) -> bool {
        let cancelled = self.oneshots.cancel(token);
        if cancelled {
            self.oneshot_handlers.remove(token.handler());
        }
        cancelled
    }

    // ---- statistics --------------------------------------------------

    /// Registers statistic `name` of the current component.
    ///
    /// A statistic the configuration does not enable (by name or with the
    /// `*` wildcard) is returned as a null statistic that discards data.
    pub fn register_statistic<T: StatValue>(&mut self, name: &str, sub_id: &str) -> SimResult<Statistic<T>> {
        let id = self.require_current("register_statistic")?;
        let info = self
            .components
            .get(&id)
            .ok_or_else(|| SimError::fatal(format!("component {} is not known to this rank", id)))?;
        match info.statistics.get(name).or_else(|| info.statistics.get("*")) {
            Some(params) => self
                .stats
                .register::<T>(&info.name, &info.type_name, name, sub_id, params),
            None => Ok(Statistic::null(StatInfo {
                component: info.name.clone(),
                component_type: info.type_name.clone(),
                name: name.to_string(),
                sub_id: sub_id.to_string(),
                kind: "null".to_string(),
                level: 0,
                reset_on_output: false,
            })),
        }
    }

    /// The partition's statistics engine.
    pub fn statistics(&self) -> &StatisticsEngine {
        &self.stats
    }

    // ---- shutdown ----------------------------------------------------

    /// Holds the run open until the current component calls
    /// [`primary_component_ok_to_end_sim`](Self::primary_component_ok_to_end_sim).
    pub fn primary_component_do_not_end_sim(&mut self) -> SimResult<()> {
        let id = self.require_current("primary_component_do_not_end_sim")?;
        self.exit.hold(id);
        Ok(())
    }

    /// Releases the current component's hold on the run.
    ///
    /// Once no holders remain the run ends at the end of the current tick,
    /// unless ranks are synchronized, in which case the decision is taken
    /// at the next sync horizon.
    pub fn primary_component_ok_to_end_sim(&mut self) -> SimResult<()> {
        let id = self.require_current("primary_component_ok_to_end_sim")?;
        if self.exit.release(id)? && !self.exit_at_sync && self.exit.mark_exit_scheduled() {
            self.vortex.insert(Activity::Exit, self.now(), priority::EXIT)?;
        }
        Ok(())
    }

    /// Number of components currently holding the run open on this rank.
    pub fn primary_holders(&self) -> u64 {
        self.exit.count()
    }

    pub(crate) fn peer_count(&self) -> Rank {
        self.rank.num_ranks
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("rank", &self.rank)
            .field("phase", &self.phase)
            .field("now", &self.now())
            .field("current", &self.current)
            .field("components", &self.components.len())
            .field("links", &self.links.len())
            .field("pending", &self.vortex.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullEvent;
    use crate::link::LinkEnd;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping(u32);

    impl EventData for Ping {
        const TYPE_TAG: u16 = 40;
    }

    fn context(rank: RankInfo) -> Context {
        let time_lord = TimeLord::new("1ps").unwrap();
        let mut links = LinkTable::new(2);
        links.insert(LinkEnd::new(LinkId(0), "l0", ComponentId::new(0), "out", LinkId(1), 5000));
        let far = LinkEnd::new(LinkId(1), "l0", ComponentId::new(1), "in", LinkId(0), 5000);
        if rank.is_parallel() {
            links.insert(far.with_remote(1));
        } else {
            links.insert(far);
        }
        let mut ctx = Context::new(
            rank,
            time_lord.clone(),
            links,
            StatisticsEngine::new(1, rank).with_time_lord(time_lord),
            ProfileTools::new(),
            EventTypeRegistry::new(),
            1 << 16,
            0,
        );
        let mut a = ComponentInfo::new(ComponentId::new(0), "a", "Src");
        a.link_map.insert("out", LinkId(0));
        ctx.add_component(a);
        ctx.add_component(ComponentInfo::new(ComponentId::new(1), "b", "Sink"));
        ctx
    }

    #[test]
    fn test_configure_requires_current_component() {
        let mut ctx = context(RankInfo::single());
        let err = ctx.configure_polling_link("out").unwrap_err();
        assert!(err.is_configuration());

        ctx.swap_current_component(Some(ComponentId::new(0)));
        assert!(ctx.configure_polling_link("missing").unwrap_err().is_configuration());
        assert_eq!(ctx.configure_optional_link("missing", Handler::free(|_, _| Ok(()))).unwrap(), None);
        assert_eq!(ctx.configure_polling_link("out").unwrap(), LinkId(0));
        assert!(ctx.configure_polling_link("out").is_err());
    }

    #[test]
    fn test_local_send_lands_on_vortex() {
        let mut ctx = context(RankInfo::single());
        ctx.swap_current_component(Some(ComponentId::new(0)));
        let out = ctx.configure_polling_link("out").unwrap();
        assert!(ctx.send(out, Event::new(NullEvent)).is_err());

        ctx.phase = Phase::Run;
        ctx.send(out, Event::new(NullEvent)).unwrap();
        let popped = ctx.vortex.pop().unwrap();
        assert_eq!(popped.time, 5000);
        assert_eq!(popped.priority, priority::EVENT);
        let event = popped.activity.as_event().unwrap();
        assert_eq!(event.delivery_link(), Some(LinkId(1)));
        assert_eq!(event.latency(), 5000);
    }

    #[test]
    fn test_remote_send_requires_registered_type() {
        let mut ctx = context(RankInfo::new(0, 2));
        ctx.swap_current_component(Some(ComponentId::new(0)));
        let out = ctx.configure_polling_link("out").unwrap();
        ctx.phase = Phase::Run;
        assert!(ctx.send(out, Event::new(Ping(1))).unwrap_err().is_serialization());

        ctx.event_types.register::<Ping>().unwrap();
        ctx.send(out, Event::new(Ping(2))).unwrap();
        assert_eq!(ctx.outbound[1].len(), 1);
        assert_eq!(ctx.outbound[1][0].link, LinkId(1));
        assert!(ctx.vortex.is_empty());

        ctx.next_sync = 10_000;
        assert!(ctx.send(out, Event::new(Ping(3))).unwrap_err().is_temporal());
    }

    #[test]
    fn test_untimed_only_in_untimed_phases() {
        let mut ctx = context(RankInfo::single());
        ctx.swap_current_component(Some(ComponentId::new(0)));
        let out = ctx.configure_polling_link("out").unwrap();
        assert!(ctx.send_untimed(out, Event::new(NullEvent)).is_err());
        ctx.phase = Phase::Init(0);
        ctx.send_untimed(out, Event::new(NullEvent)).unwrap();
        assert_eq!(ctx.untimed_backlog(), 1);
        let pending = std::mem::take(&mut ctx.pending_untimed);
        ctx.deliver_untimed(pending).unwrap();
        assert!(ctx.recv_untimed(LinkId(1)).unwrap().is_some());
        assert!(ctx.recv_untimed(LinkId(1)).unwrap().is_none());
    }

    #[test]
    fn test_clock_registration_and_unregistration() {
        let mut ctx = context(RankInfo::single());
        ctx.swap_current_component(Some(ComponentId::new(0)));
        let handle = ctx
            .register_clock_handler("1GHz", Handler::free(|_, _| Ok(false)))
            .unwrap();
        assert_eq!(handle.period(), 1000);
        assert!(ctx.clock_is_scheduled(&handle));
        assert_eq!(ctx.next_clock_cycle(&handle), Some(1));
        assert_eq!(ctx.vortex.len(), 1);

        assert!(ctx.unregister_clock(&handle));
        assert!(!ctx.unregister_clock(&handle));
        assert!(ctx.reregister_clock(&handle).is_ok());
        assert!(ctx.register_clock("0ns", Handler::free(|_, _| Ok(false))).is_err());
    }

    #[test]
    fn test_oneshot_cancel() {
        let mut ctx = context(RankInfo::single());
        let token = ctx.register_oneshot("3ns", Handler::free(|_, _| Ok(()))).unwrap();
        assert_eq!(token.due(), 3000);
        assert!(ctx.cancel_oneshot(&token));
        assert!(!ctx.cancel_oneshot(&token));
        assert!(!ctx.oneshot_handlers.contains(token.handler()));
    }

    #[test]
    fn test_exit_gate_schedules_exit_once() {
        let mut ctx = context(RankInfo::single());
        assert!(ctx.primary_component_do_not_end_sim().is_err());
        ctx.swap_current_component(Some(ComponentId::new(0)));
        ctx.primary_component_do_not_end_sim().unwrap();
        assert_eq!(ctx.primary_holders(), 1);
        ctx.primary_component_ok_to_end_sim().unwrap();
        let popped = ctx.vortex.pop().unwrap();
        assert_eq!(popped.priority, priority::EXIT);
        assert!(matches!(popped.activity, Activity::Exit));
    }

    #[test]
    fn test_unenabled_statistic_is_null() {
        let mut ctx = context(RankInfo::single());
        ctx.swap_current_component(Some(ComponentId::new(1)));
        let stat = ctx.register_statistic::<u64>("latency", "").unwrap();
        assert!(stat.is_null());
        stat.add_data(3);
        assert_eq!(stat.count(), 0);
    }

    #[test]
    fn test_disconnect_drops_in_flight() {
        let mut ctx = context(RankInfo::single());
        ctx.swap_current_component(Some(ComponentId::new(0)));
        let out = ctx.configure_polling_link("out").unwrap();
        ctx.phase = Phase::Run;
        ctx.send(out, Event::new(NullEvent)).unwrap();
        ctx.send(out, Event::new(NullEvent)).unwrap();
        assert_eq!(ctx.disconnect_link(out).unwrap(), 2);
        assert!(ctx.vortex.is_empty());
        assert_eq!(ctx.counters.events_dropped, 2);
    }
}
