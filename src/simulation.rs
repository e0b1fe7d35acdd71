//! The simulation driver.
//!
//! A [`Simulation`] is one partition of a run: its [`Context`], its
//! components and, when the run has several ranks, its [`RankSync`]. It
//! walks the lifecycle
//!
//! ```text
//! construction -> init phases -> setup -> run -> complete phases -> finish
//! ```
//!
//! and dispatches activities from the time vortex in `(time, priority,
//! order)` order until a stop, an exit, global idleness or an empty vortex.
//!
//! # Example
//!
//! ```
//! use simcore::component::Component;
//! use simcore::config::{ComponentConfig, ConfigGraphBuilder};
//! use simcore::handler::ClockHandler;
//! use simcore::registry::ComponentRegistry;
//! use simcore::simulation::Simulation;
//!
//! #[derive(Default)]
//! struct Ticker {
//!     ticks: u64,
//! }
//!
//! impl Component for Ticker {}
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register("Ticker", |ctx, _params| {
//!     ctx.register_clock("100MHz", ClockHandler::member(|t: &mut Ticker, _ctx, _cycle| {
//!         t.ticks += 1;
//!         Ok(false)
//!     }))?;
//!     Ok(Box::new(Ticker::default()))
//! });
//!
//! let graph = ConfigGraphBuilder::new()
//!     .stop_at("1us")
//!     .component(ComponentConfig::new(0, "t0", "Ticker"))
//!     .build()
//!     .unwrap();
//! let mut sim = Simulation::from_config(&graph, &registry).unwrap();
//! let report = sim.run().unwrap();
//! assert_eq!(sim.component::<Ticker>("t0").unwrap().ticks, 100);
//! assert_eq!(report.end_reason, "stop");
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::activity::Activity;
use crate::clock::ClockKey;
use crate::comm::Communicator;
use crate::component::{Component, ComponentInfo, ComponentSlots};
use crate::config::ConfigGraph;
use crate::context::{Context, Phase};
use crate::error::{SimError, SimResult};
use crate::event::{Event, EventTypeRegistry};
use crate::handler::{invoke, Handler};
use crate::heartbeat::Heartbeat;
use crate::link::{Delivery, LinkEnd, LinkTable};
use crate::oneshot::OneShotKey;
use crate::params::Params;
use crate::profile::ProfileTools;
use crate::registry::ComponentRegistry;
use crate::report::{RunReport, Timer};
use crate::statistics::engine::StatisticsEngine;
use crate::sync::{RankSync, SyncSummary};
use crate::time::TimeLord;
use crate::types::{priority, ComponentId, LinkId, RankInfo, SimTime};

/// Why the dispatch loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The configured `stop_at` time was reached.
    Stop,
    /// Every primary component agreed to end the run.
    Exit,
    /// No rank had work left at a sync horizon.
    Idle,
    /// The vortex ran empty.
    Drained,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Stop => "stop",
            EndReason::Exit => "exit",
            EndReason::Idle => "idle",
            EndReason::Drained => "drained",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One partition of a simulation run.
pub struct Simulation {
    ctx: Context,
    components: ComponentSlots,
    event_types: EventTypeRegistry,
    sync: Option<RankSync>,
    heartbeat: Option<Heartbeat>,
    stop_at: Option<SimTime>,
    untimed_round_limit: u32,
    init_phases: u32,
    untimed_rounds: u32,
    complete_phases: u32,
    end_reason: Option<EndReason>,
    started: bool,
}

impl Simulation {
    /// Builds a single-rank simulation from a configuration graph.
    ///
    /// Multi-rank graphs are run with
    /// [`PartitionedRunner`](crate::parallel::PartitionedRunner).
    pub fn from_config(graph: &ConfigGraph, registry: &ComponentRegistry) -> SimResult<Self> {
        if graph.simulation.num_ranks != 1 {
            return Err(SimError::configuration(format!(
                "graph has {} ranks; run it with a PartitionedRunner",
                graph.simulation.num_ranks
            )));
        }
        Self::build_partition(graph, registry, RankInfo::single(), None)
    }

    /// Builds the partition of `graph` that lives on `rank`.
    ///
    /// Link `i` of the graph gets endpoint ids `2i` (first endpoint) and
    /// `2i + 1` (second endpoint) on every rank, so ids agree across ranks
    /// without negotiation. Self links are numbered after them.
    ///
    /// A multi-rank partition needs a communicator.
    pub fn build_partition(
        graph: &ConfigGraph,
        registry: &ComponentRegistry,
        rank: RankInfo,
        comm: Option<Box<dyn Communicator>>,
    ) -> SimResult<Self> {
        graph.validate()?;
        let sim = &graph.simulation;
        if rank.num_ranks != sim.num_ranks || rank.rank >= rank.num_ranks {
            return Err(SimError::configuration(format!(
                "rank {} of {} does not match a graph with {} ranks",
                rank.rank, rank.num_ranks, sim.num_ranks
            )));
        }
        let time_lord = TimeLord::new(&sim.timebase)?;

        let ids: HashMap<&str, (ComponentId, u32)> = graph
            .components
            .iter()
            .map(|c| (c.name.as_str(), (c.component_id(), c.rank)))
            .collect();
        let mut infos: HashMap<ComponentId, ComponentInfo> = graph
            .components
            .iter()
            .filter(|c| c.rank == rank.rank)
            .map(|c| {
                let mut info = ComponentInfo::new(c.component_id(), c.name.clone(), c.type_name.clone());
                info.params = c.to_params();
                for stat in &c.statistics {
                    info.statistics.insert(stat.name.clone(), Params::from_pairs(stat.params.iter()));
                }
                (info.id, info)
            })
            .collect();

        let mut links = LinkTable::new((graph.links.len() * 2) as u32);
        for (i, link) in graph.links.iter().enumerate() {
            for (k, end) in link.endpoints.iter().enumerate() {
                let other = &link.endpoints[1 - k];
                let (owner, owner_rank) = lookup(&ids, &end.component)?;
                let (_, other_rank) = lookup(&ids, &other.component)?;
                if owner_rank != rank.rank {
                    continue;
                }
                let id = LinkId((2 * i + k) as u32);
                let pair = LinkId((2 * i + 1 - k) as u32);
                let latency = time_lord.ticks(&end.latency)?;
                let mut link_end = LinkEnd::new(id, link.name.clone(), owner, end.port.clone(), pair, latency);
                if other_rank != rank.rank {
                    link_end = link_end.with_remote(other_rank);
                }
                links.insert(link_end);
                if let Some(info) = infos.get_mut(&owner) {
                    info.link_map.insert(end.port.clone(), id);
                }
            }
        }

        let stats = StatisticsEngine::from_config(
            &graph.statistics,
            sim.statistics_level,
            rank,
            time_lord.clone(),
            registry.statistic_kinds().clone(),
        )?;
        let event_types = registry.event_types().clone();
        let mut ctx = Context::new(
            rank,
            time_lord.clone(),
            links,
            stats,
            ProfileTools::from_config(&sim.profiling),
            event_types.clone(),
            sim.max_event_size,
            sim.verbosity,
        );

        let period = graph.min_cut_latency(&time_lord)?;
        let sync = match (rank.is_parallel(), comm) {
            (false, _) => None,
            (true, Some(comm)) => {
                if comm.rank_info() != rank {
                    return Err(SimError::configuration(format!(
                        "communicator is for rank {} of {}, partition is rank {} of {}",
                        comm.rank_info().rank,
                        comm.rank_info().num_ranks,
                        rank.rank,
                        rank.num_ranks
                    )));
                }
                Some(RankSync::new(comm, sim.sync_mode, period, sim.sync_queue_depth))
            }
            (true, None) => {
                return Err(SimError::configuration(format!(
                    "rank {} of {} has no communicator",
                    rank.rank, rank.num_ranks
                )))
            }
        };
        if let (Some(_), Some(period)) = (&sync, period) {
            ctx.exit_at_sync = true;
            ctx.next_sync = period;
        }

        let mut components = ComponentSlots::new();
        for cfg in graph.components.iter().filter(|c| c.rank == rank.rank) {
            let id = cfg.component_id();
            let info = infos
                .remove(&id)
                .ok_or_else(|| SimError::fatal(format!("component '{}' lost during construction", cfg.name)))?;
            let params = info.params.clone();
            ctx.add_component(info);
            let previous = ctx.swap_current_component(Some(id));
            let built = registry.create(&cfg.type_name, &mut ctx, &params);
            ctx.swap_current_component(previous);
            let component = built.map_err(|err| {
                tracing::error!(rank = rank.rank, component = %cfg.name, error = %err, "construction failed");
                err
            })?;
            components.insert(id, &cfg.name, component);
        }

        let heartbeat = match &sim.heartbeat_period {
            Some(text) => Some(Heartbeat::new(time_lord.ticks(text)?)),
            None => None,
        };
        let stop_at = match &sim.stop_at {
            Some(text) => Some(time_lord.ticks(text)?),
            None => None,
        };

        tracing::info!(
            rank = rank.rank,
            components = components.len(),
            links = ctx.links.len(),
            sync_period = ?period,
            "partition built"
        );

        Ok(Self {
            ctx,
            components,
            event_types,
            sync,
            heartbeat,
            stop_at,
            untimed_round_limit: sim.untimed_round_limit,
            init_phases: 0,
            untimed_rounds: 0,
            complete_phases: 0,
            end_reason: None,
            started: false,
        })
    }

    /// Runs every phase of the simulation and returns the partition's report.
    ///
    /// An error from any handler or hook stops the run. End-of-simulation
    /// statistics are still flushed before the error is returned.
    pub fn run(&mut self) -> SimResult<RunReport> {
        if self.started {
            return Err(SimError::configuration("simulation has already been run"));
        }
        self.started = true;
        let timer = Timer::start();
        if let Err(err) = self.run_phases() {
            let rank = self.ctx.rank().rank;
            tracing::error!(rank, time = self.ctx.now(), error = %err, "simulation aborted");
            if let Err(flush) = self.ctx.stats.finish(self.ctx.now()) {
                tracing::warn!(rank, error = %flush, "statistics flush failed after abort");
            }
            return Err(err);
        }
        Ok(self.report(timer.elapsed_ms()))
    }

    fn run_phases(&mut self) -> SimResult<()> {
        let (phases, rounds) = self.untimed_phases(Phase::Init)?;
        self.init_phases = phases;
        self.untimed_rounds = rounds;

        self.ctx.phase = Phase::Setup;
        for id in self.components.ids() {
            self.call_hook(id, |c, ctx| c.setup(ctx))?;
        }
        self.start_running()?;

        let reason = self.dispatch()?;
        self.end_reason = Some(reason);
        tracing::info!(
            rank = self.ctx.rank().rank,
            time = %self.ctx.format_now(),
            reason = %reason,
            "run ended"
        );

        let (phases, _) = self.untimed_phases(Phase::Complete)?;
        self.complete_phases = phases;

        self.ctx.phase = Phase::Finish;
        for id in self.components.ids() {
            self.call_hook(id, |c, ctx| c.finish(ctx))?;
        }
        self.ctx.stats.finish(self.ctx.now())?;
        if let Some(sync) = self.sync.as_mut() {
            sync.barrier()?;
        }
        Ok(())
    }

    fn call_hook<F>(&mut self, id: ComponentId, hook: F) -> SimResult<()>
    where
        F: FnOnce(&mut dyn Component, &mut Context) -> SimResult<()>,
    {
        let component = self
            .components
            .get_mut(id)
            .ok_or_else(|| SimError::fatal(format!("component {} does not exist", id)))?;
        let previous = self.ctx.swap_current_component(Some(id));
        let result = hook(component, &mut self.ctx);
        self.ctx.swap_current_component(previous);
        result
    }

    /// Runs untimed phases until one sends nothing on any rank. Returns the
    /// number of phases and the number of phases that carried messages.
    fn untimed_phases(&mut self, make_phase: fn(u32) -> Phase) -> SimResult<(u32, u32)> {
        let mut phase = 0;
        let mut rounds = 0;
        loop {
            if phase >= self.untimed_round_limit {
                return Err(SimError::configuration(format!(
                    "untimed messages still flowing after {} phases",
                    phase
                )));
            }
            self.ctx.phase = make_phase(phase);
            let sent_before = self.ctx.counters.untimed_sent;
            for id in self.components.ids() {
                self.call_hook(id, |c, ctx| match ctx.phase() {
                    Phase::Complete(n) => c.complete(ctx, n),
                    _ => c.init(ctx, phase),
                })?;
            }
            let sent = self.ctx.counters.untimed_sent - sent_before;

            let local = std::mem::take(&mut self.ctx.pending_untimed);
            self.ctx.deliver_untimed(local)?;
            let total = match self.sync.as_mut() {
                Some(sync) => {
                    let (events, total) =
                        sync.exchange_untimed(&mut self.ctx.untimed_outbound, &self.event_types, sent)?;
                    self.ctx.counters.events_imported += events.len() as u64;
                    self.ctx.deliver_untimed(events)?;
                    total
                }
                None => sent,
            };
            tracing::debug!(rank = self.ctx.rank().rank, phase = ?self.ctx.phase(), sent, total, "untimed phase");

            phase += 1;
            if total == 0 {
                return Ok((phase, rounds));
            }
            rounds += 1;
        }
    }

    /// Moves links to running, starts statistics and schedules the core
    /// activities.
    fn start_running(&mut self) -> SimResult<()> {
        let rank = self.ctx.rank().rank;
        for id in self.ctx.links.start_running() {
            if let Some(end) = self.ctx.links.get(id) {
                let owner = self
                    .ctx
                    .component_info(end.owner())
                    .map_or_else(|| end.owner().to_string(), |info| info.name.clone());
                tracing::warn!(rank, component = %owner, port = end.port(), "link end was never configured");
            }
        }
        let dropped = self.ctx.links.clear_untimed();
        if dropped > 0 {
            tracing::warn!(rank, dropped, "untimed messages were never received");
        }

        for (group, period) in self.ctx.stats.start_of_simulation()? {
            let label = format!("statistics group {}", group);
            self.ctx.register_core_clock(
                period,
                Handler::free(move |ctx: &mut Context, _cycle| {
                    let now = ctx.now();
                    ctx.stats.dump_group(group, now)?;
                    Ok(false)
                }),
                priority::STATISTIC_CLOCK,
                &label,
            )?;
        }

        let now = self.ctx.now();
        if let Some(hb) = &self.heartbeat {
            self.ctx.vortex.insert(Activity::Heartbeat, hb.first(now), priority::HEARTBEAT)?;
        }
        if let Some(stop) = self.stop_at {
            self.ctx.vortex.insert(Activity::Stop, stop, priority::STOP)?;
        }
        if self.ctx.exit_at_sync {
            let first = self.next_horizon(now)?;
            self.ctx.vortex.insert(Activity::Sync, first, priority::SYNC)?;
            self.ctx.next_sync = first;
        }
        self.ctx.phase = Phase::Run;
        Ok(())
    }

    /// Time of the horizon after `now`: one sync period later, or the stop
    /// time if that comes first.
    fn next_horizon(&self, now: SimTime) -> SimResult<SimTime> {
        let period = self
            .sync
            .as_ref()
            .and_then(RankSync::period)
            .ok_or_else(|| SimError::fatal("sync horizon requested without a sync period"))?;
        let next = now.saturating_add(period);
        Ok(match self.stop_at {
            Some(stop) if stop > now && stop < next => stop,
            _ => next,
        })
    }

    fn dispatch(&mut self) -> SimResult<EndReason> {
        loop {
            let Some(next) = self.ctx.vortex.pop() else {
                return Ok(EndReason::Drained);
            };
            self.ctx.counters.activities += 1;
            match next.activity {
                Activity::Event(event) => self.deliver(event)?,
                Activity::Clock(key) => self.fire_clock(key)?,
                Activity::OneShot(key) => self.fire_oneshot(key)?,
                Activity::Sync => {
                    if let Some(reason) = self.sync_horizon()? {
                        return Ok(reason);
                    }
                }
                Activity::Heartbeat => self.heartbeat()?,
                Activity::Stop => return Ok(EndReason::Stop),
                Activity::Exit => {
                    self.ctx.exit.clear_exit_scheduled();
                    // A component may have re-held the gate earlier in this tick.
                    if self.ctx.exit.is_open() {
                        return Ok(EndReason::Exit);
                    }
                    tracing::debug!(rank = self.ctx.rank().rank, holders = self.ctx.exit.count(), "exit withdrawn");
                }
            }
        }
    }

    fn deliver(&mut self, event: Event) -> SimResult<()> {
        let link = event
            .delivery_link()
            .ok_or_else(|| SimError::fatal(format!("{} event has no receiving link", event.type_name())))?;
        match self.ctx.links.arrive(link)? {
            Delivery::Handler(id) => {
                match invoke(Context::event_registry, &mut self.ctx, &mut self.components, id, event)? {
                    Some(()) => self.ctx.counters.events_delivered += 1,
                    None => self.ctx.counters.events_dropped += 1,
                }
            }
            Delivery::Polling => {
                self.ctx.links.push_polling(link, event)?;
                self.ctx.counters.events_delivered += 1;
            }
            Delivery::Unset => {
                tracing::trace!(rank = self.ctx.rank().rank, %link, "event dropped");
                self.ctx.counters.events_dropped += 1;
            }
        }
        Ok(())
    }

    fn fire_clock(&mut self, key: ClockKey) -> SimResult<()> {
        let now = self.ctx.now();
        let Some(prio) = self.ctx.clocks.get(key).map(|c| c.priority()) else {
            return Ok(());
        };
        let Some((cycle, handlers)) = self.ctx.clocks.begin_edge(key, now) else {
            return Ok(());
        };
        self.ctx.counters.clock_edges += 1;
        let mut removed = Vec::new();
        for id in handlers {
            // Skip handlers taken off the clock earlier in this edge.
            let on_clock = self.ctx.clocks.get(key).map_or(false, |c| c.handlers().contains(&id));
            if !on_clock {
                continue;
            }
            if let Some(true) = invoke(Context::clock_registry, &mut self.ctx, &mut self.components, id, cycle)? {
                removed.push(id);
            }
        }
        if let Some(at) = self.ctx.clocks.end_edge(key, now, &removed) {
            self.ctx.vortex.insert(Activity::Clock(key), at, prio)?;
        }
        Ok(())
    }

    fn fire_oneshot(&mut self, key: OneShotKey) -> SimResult<()> {
        let now = self.ctx.now();
        for id in self.ctx.oneshots.take_due(key, now) {
            if invoke(Context::oneshot_registry, &mut self.ctx, &mut self.components, id, ())?.is_some() {
                self.ctx.counters.oneshots_fired += 1;
            }
            self.ctx.oneshot_handlers.remove(id);
        }
        if let Some(at) = self.ctx.oneshots.reschedule(key) {
            self.ctx.vortex.insert(Activity::OneShot(key), at, priority::ONESHOT)?;
        }
        Ok(())
    }

    fn has_work(&self) -> bool {
        self.ctx
            .vortex
            .iter()
            .any(|a| !matches!(a, Activity::Sync | Activity::Heartbeat))
    }

    fn sync_horizon(&mut self) -> SimResult<Option<EndReason>> {
        let now = self.ctx.now();
        let Some(sync) = self.sync.as_mut() else {
            return Ok(None);
        };
        let events = sync.exchange_events(&mut self.ctx.outbound, &self.event_types)?;
        self.ctx.counters.events_imported += events.len() as u64;
        for event in events {
            let at = event.delivery_time();
            self.ctx.vortex.insert(Activity::Event(event), at, priority::EVENT)?;
        }

        let local = SyncSummary {
            exit_holders: self.ctx.exit.count(),
            ever_held: self.ctx.exit.ever_held(),
            idle: !self.has_work(),
        };
        let sync = self
            .sync
            .as_mut()
            .ok_or_else(|| SimError::fatal("sync layer vanished during a horizon"))?;
        let global = sync.reduce(local)?;
        self.ctx.counters.sync_rounds = sync.rounds();
        self.ctx.counters.sync_bytes = sync.bytes_sent();
        tracing::trace!(rank = self.ctx.rank().rank, time = now, ?global, "sync horizon");

        if global.exit_ready() {
            return Ok(Some(EndReason::Exit));
        }
        if global.idle {
            return Ok(Some(EndReason::Idle));
        }
        let next = self.next_horizon(now)?;
        self.ctx.vortex.insert(Activity::Sync, next, priority::SYNC)?;
        self.ctx.next_sync = next;
        Ok(None)
    }

    fn heartbeat(&mut self) -> SimResult<()> {
        let now = self.ctx.now();
        let busy = self.has_work();
        let Some(hb) = self.heartbeat.as_mut() else {
            return Ok(());
        };
        let text = self.ctx.time_lord().format_time(now);
        hb.beat(now, self.ctx.rank().rank, &text, self.ctx.vortex.len());
        if busy {
            let at = now.saturating_add(hb.period());
            self.ctx.vortex.insert(Activity::Heartbeat, at, priority::HEARTBEAT)?;
        }
        Ok(())
    }

    fn report(&self, wall_time_ms: f64) -> RunReport {
        let rank = self.ctx.rank();
        RunReport {
            rank: rank.rank,
            num_ranks: rank.num_ranks,
            final_time: self.ctx.now(),
            final_time_text: self.ctx.format_now(),
            end_reason: self.end_reason.map_or("none", EndReason::as_str).to_string(),
            counters: self.ctx.counters.clone(),
            init_phases: self.init_phases,
            untimed_rounds: self.untimed_rounds,
            complete_phases: self.complete_phases,
            max_vortex_depth: self.ctx.vortex.max_depth(),
            statistics: self.ctx.stats.len(),
            wall_time_ms,
            profile: self.ctx.profile_tools().report(),
        }
    }

    // ---- inspection --------------------------------------------------

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn components(&self) -> &ComponentSlots {
        &self.components
    }

    /// Borrows the component named `name` as a `C`.
    pub fn component<C: Component>(&self, name: &str) -> Option<&C> {
        self.components.downcast::<C>(name)
    }

    pub fn component_mut<C: Component>(&mut self, name: &str) -> Option<&mut C> {
        self.components.downcast_mut::<C>(name)
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.ctx.now()
    }

    pub fn rank(&self) -> RankInfo {
        self.ctx.rank()
    }

    /// Why the run ended, once it has.
    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    /// Number of pending activities.
    pub fn pending(&self) -> usize {
        self.ctx.vortex.len()
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("ctx", &self.ctx)
            .field("components", &self.components.len())
            .field("sync", &self.sync)
            .field("stop_at", &self.stop_at)
            .field("end_reason", &self.end_reason)
            .finish()
    }
}

fn lookup(ids: &HashMap<&str, (ComponentId, u32)>, name: &str) -> SimResult<(ComponentId, u32)> {
    ids.get(name)
        .copied()
        .ok_or_else(|| SimError::configuration(format!("link references unknown component '{}'", name)))
}
