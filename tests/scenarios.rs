//! End-to-end runs of small reference systems.

use serde::{Deserialize, Serialize};

use simcore::component::Component;
use simcore::config::{ComponentConfig, ConfigGraphBuilder, LinkEndpoint};
use simcore::context::{Context, Phase};
use simcore::event::{Event, EventData, NullEvent};
use simcore::handler::{ClockHandler, EventHandler};
use simcore::params::Params;
use simcore::parallel::PartitionedRunner;
use simcore::registry::ComponentRegistry;
use simcore::simulation::{EndReason, Simulation};
use simcore::types::{Cycle, LinkId, SimTime};
use simcore::SimResult;

// ---- single clock ----------------------------------------------------------

#[derive(Default)]
struct Counter {
    ticks: u64,
}

impl Component for Counter {}

#[test]
fn test_single_clock_fixed_rate() {
    let mut registry = ComponentRegistry::new();
    registry.register("Counter", |ctx, _params| {
        ctx.register_clock(
            "100MHz",
            ClockHandler::member(|c: &mut Counter, _ctx, _cycle| {
                c.ticks += 1;
                Ok(false)
            }),
        )?;
        Ok(Box::new(Counter::default()))
    });

    let graph = ConfigGraphBuilder::new()
        .stop_at("1ms")
        .component(ComponentConfig::new(0, "counter", "Counter"))
        .build()
        .unwrap();
    let mut sim = Simulation::from_config(&graph, &registry).unwrap();
    let report = sim.run().unwrap();

    assert_eq!(sim.component::<Counter>("counter").unwrap().ticks, 100_000);
    assert_eq!(sim.now(), 1_000_000_000);
    assert_eq!(report.end_reason, "stop");
    assert_eq!(report.counters.clock_edges, 100_000);
}

// ---- two components over a link --------------------------------------------

struct Sender {
    out: LinkId,
}

impl Component for Sender {}

impl Sender {
    fn tick(&mut self, ctx: &mut Context, cycle: Cycle) -> SimResult<bool> {
        ctx.send(self.out, Event::new(NullEvent))?;
        Ok(cycle >= 1000)
    }
}

#[derive(Default)]
struct LatencySink {
    total_latency: SimTime,
    received: u64,
    last_recv: SimTime,
}

impl Component for LatencySink {}

impl LatencySink {
    fn on_event(&mut self, ctx: &mut Context, event: Event) -> SimResult<()> {
        self.total_latency += ctx.now() - event.send_time();
        self.received += 1;
        self.last_recv = ctx.now();
        Ok(())
    }
}

#[test]
fn test_two_component_link_latency() {
    let mut registry = ComponentRegistry::new();
    registry.register("Sender", |ctx, _params| {
        let out = ctx.configure_polling_link("out")?;
        ctx.register_clock("1GHz", ClockHandler::member(Sender::tick))?;
        Ok(Box::new(Sender { out }))
    });
    registry.register("LatencySink", |ctx, _params| {
        ctx.configure_link("in", EventHandler::member(LatencySink::on_event))?;
        Ok(Box::new(LatencySink::default()))
    });

    let graph = ConfigGraphBuilder::new()
        .component(ComponentConfig::new(0, "a", "Sender"))
        .component(ComponentConfig::new(1, "b", "LatencySink"))
        .link("ab", LinkEndpoint::new("a", "out", "5ns"), LinkEndpoint::new("b", "in", "5ns"))
        .build()
        .unwrap();
    let mut sim = Simulation::from_config(&graph, &registry).unwrap();
    let report = sim.run().unwrap();

    let sink = sim.component::<LatencySink>("b").unwrap();
    assert_eq!(sink.received, 1000);
    assert_eq!(sink.total_latency, 1000 * 5_000);
    // A clock registered at time zero first fires one period later, at
    // cycle 1, so sends run 1ns..1000ns and the last arrival is 1005ns.
    assert_eq!(sink.last_recv, 1_005_000);
    assert_eq!(sim.end_reason(), Some(EndReason::Drained));
    assert_eq!(report.counters.events_sent, 1000);
    assert_eq!(report.counters.events_delivered, 1000);
}

// ---- self-descheduling clock -------------------------------------------------

#[derive(Default)]
struct FiveShot {
    calls: u32,
}

impl Component for FiveShot {}

#[test]
fn test_self_descheduling_clock() {
    let mut registry = ComponentRegistry::new();
    registry.register("FiveShot", |ctx, _params| {
        ctx.register_clock(
            "2ns",
            ClockHandler::member(|c: &mut FiveShot, _ctx, _cycle| {
                c.calls += 1;
                Ok(c.calls == 5)
            }),
        )?;
        Ok(Box::new(FiveShot::default()))
    });

    let graph = ConfigGraphBuilder::new()
        .heartbeat("3ns")
        .component(ComponentConfig::new(0, "x", "FiveShot"))
        .build()
        .unwrap();
    let mut sim = Simulation::from_config(&graph, &registry).unwrap();
    let report = sim.run().unwrap();

    assert_eq!(sim.component::<FiveShot>("x").unwrap().calls, 5);
    assert_eq!(sim.pending(), 0);
    assert_eq!(sim.end_reason(), Some(EndReason::Drained));
    assert_eq!(report.counters.clock_edges, 5);
    assert_eq!(sim.now(), 12_000);
}

// ---- cross-partition ordering ----------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Token {
    seq: u64,
}

impl EventData for Token {
    const TYPE_TAG: u16 = 500;
}

struct Producer {
    out: LinkId,
    seq: u64,
}

impl Component for Producer {}

#[derive(Default)]
struct Consumer {
    arrivals: Vec<(u64, SimTime, SimTime)>,
}

impl Component for Consumer {}

fn cross_rank_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register_event::<Token>().unwrap();
    registry.register("Producer", |ctx, _params| {
        let out = ctx.configure_polling_link("out")?;
        ctx.register_clock(
            "1ns",
            ClockHandler::member(|p: &mut Producer, ctx, _cycle| {
                ctx.send_event(p.out, Token { seq: p.seq })?;
                p.seq += 1;
                Ok(false)
            }),
        )?;
        Ok(Box::new(Producer { out, seq: 0 }))
    });
    registry.register("Consumer", |ctx, _params| {
        ctx.configure_link(
            "in",
            EventHandler::member(|c: &mut Consumer, ctx, event| {
                let seq = event.downcast_ref::<Token>().map_or(u64::MAX, |t| t.seq);
                c.arrivals.push((seq, event.send_time(), ctx.now()));
                Ok(())
            }),
        )?;
        Ok(Box::new(Consumer::default()))
    });
    registry
}

#[test]
fn test_cross_partition_ordering() {
    let graph = ConfigGraphBuilder::new()
        .num_ranks(2)
        .stop_at("100ns")
        .component(ComponentConfig::new(0, "p", "Producer"))
        .component(ComponentConfig::new(1, "c", "Consumer").rank(1))
        .link("pc", LinkEndpoint::new("p", "out", "10ns"), LinkEndpoint::new("c", "in", "10ns"))
        .build()
        .unwrap();
    let results = PartitionedRunner::new(&graph, &cross_rank_registry())
        .run_with(|sim, report| (report, sim.component::<Consumer>("c").map(|c| c.arrivals.clone())))
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_none());
    let arrivals = results[1].1.as_ref().unwrap();
    assert_eq!(arrivals.len(), 90);
    // The producer's clock first fires at 1ns (cycle 1), not at 0ns, so
    // arrival i was sent at (i + 1)ns.
    for (i, &(seq, sent, recv)) in arrivals.iter().enumerate() {
        let i = i as u64;
        assert_eq!(seq, i);
        assert_eq!(sent, (i + 1) * 1_000);
        assert_eq!(recv, sent + 10_000);
    }
    for (report, _) in &results {
        assert_eq!(report.final_time, 100_000);
        assert_eq!(report.end_reason, "stop");
        assert_eq!(report.counters.sync_rounds, 10);
    }
    assert_eq!(results[0].0.counters.events_exported, 100);
    // Sends from 90ns to 99ns cross at the final horizon but arrive after the stop.
    assert_eq!(results[1].0.counters.events_imported, 99);
    assert_eq!(results[1].0.counters.events_delivered, 90);
}

// ---- untimed init quiescence -------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Hop(u32);

impl EventData for Hop {
    const TYPE_TAG: u16 = 501;
}

/// Forwards a token around a ring for a fixed number of init phases.
struct RingNode {
    next: LinkId,
    prev: LinkId,
    rounds: u32,
    received: u32,
    setups: u32,
    received_at_setup: Option<u32>,
}

impl Component for RingNode {
    fn init(&mut self, ctx: &mut Context, phase: u32) -> SimResult<()> {
        while ctx.recv_untimed(self.prev)?.is_some() {
            self.received += 1;
        }
        if phase < self.rounds {
            ctx.send_untimed(self.next, Event::new(Hop(phase)))?;
        }
        Ok(())
    }

    fn setup(&mut self, ctx: &mut Context) -> SimResult<()> {
        assert_eq!(ctx.phase(), Phase::Setup);
        self.setups += 1;
        self.received_at_setup = Some(self.received);
        Ok(())
    }
}

fn ring_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register_event::<Hop>().unwrap();
    registry.register("RingNode", |ctx: &mut Context, params: &Params| {
        let next = ctx.configure_polling_link("next")?;
        let prev = ctx.configure_polling_link("prev")?;
        Ok(Box::new(RingNode {
            next,
            prev,
            rounds: params.find("rounds", 2u32)?,
            received: 0,
            setups: 0,
            received_at_setup: None,
        }))
    });
    registry
}

#[test]
fn test_untimed_init_quiescence() {
    let graph = ConfigGraphBuilder::new()
        .component(ComponentConfig::new(0, "a", "RingNode"))
        .component(ComponentConfig::new(1, "b", "RingNode"))
        .component(ComponentConfig::new(2, "c", "RingNode"))
        .link("ab", LinkEndpoint::new("a", "next", "1ns"), LinkEndpoint::new("b", "prev", "1ns"))
        .link("bc", LinkEndpoint::new("b", "next", "1ns"), LinkEndpoint::new("c", "prev", "1ns"))
        .link("ca", LinkEndpoint::new("c", "next", "1ns"), LinkEndpoint::new("a", "prev", "1ns"))
        .build()
        .unwrap();
    let mut sim = Simulation::from_config(&graph, &ring_registry()).unwrap();
    let report = sim.run().unwrap();

    assert_eq!(report.untimed_rounds, 2);
    assert_eq!(report.init_phases, 3);
    for name in ["a", "b", "c"] {
        let node = sim.component::<RingNode>(name).unwrap();
        assert_eq!(node.setups, 1);
        assert_eq!(node.received_at_setup, Some(2));
    }
}

#[test]
fn test_untimed_round_limit_is_enforced() {
    let graph = ConfigGraphBuilder::new()
        .untimed_round_limit(4)
        .component(ComponentConfig::new(0, "a", "RingNode").param("rounds", "100"))
        .component(ComponentConfig::new(1, "b", "RingNode").param("rounds", "100"))
        .link("ab", LinkEndpoint::new("a", "next", "1ns"), LinkEndpoint::new("b", "prev", "1ns"))
        .link("ba", LinkEndpoint::new("b", "next", "1ns"), LinkEndpoint::new("a", "prev", "1ns"))
        .build()
        .unwrap();
    let mut sim = Simulation::from_config(&graph, &ring_registry()).unwrap();
    let err = sim.run().unwrap_err();
    assert!(err.to_string().contains("untimed"), "{}", err);
}

// ---- bracketed parameter arrays ------------------------------------------------

#[test]
fn test_param_bracketed_array() {
    let mut params = Params::new();
    params.insert("vec", "[1, 2, 3]");
    assert_eq!(params.find_array::<i32>("vec").unwrap(), vec![1, 2, 3]);

    params.insert("vec", "[1.5, 2.5]");
    assert_eq!(params.find_array::<f64>("vec").unwrap(), vec![1.5, 2.5]);

    assert!(params.find_array::<i32>("missing").unwrap().is_empty());
}
