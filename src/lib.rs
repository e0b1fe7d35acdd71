//! # simcore
//!
//! A parallel discrete-event simulation core for architectural models.
//!
//! ## Design Principles
//!
//! - **One ordered queue per partition**: every activity (event delivery,
//!   clock edge, one-shot, sync horizon, heartbeat, stop, exit) sits on a
//!   [`TimeVortex`](vortex::TimeVortex) and fires in `(time, priority,
//!   insertion order)` order.
//! - **Components are opaque**: hardware models implement
//!   [`Component`](component::Component) and talk to the engine only through
//!   the [`Context`](context::Context): links, clocks, one-shots,
//!   statistics and the primary-component exit gate.
//! - **Conservative parallelism**: the component graph is cut into ranks.
//!   Ranks run independently between sync horizons spaced by the smallest
//!   cut-link latency and exchange cross-rank events at each horizon.
//! - **Index-based ownership**: links hold handler ids, components live in
//!   slots beside the context, so handlers can borrow both at once.
//!
//! ## Features
//!
//! - `parallel` - frame outbound sync buffers on the rayon pool
//!
//! ## Quick Start
//!
//! ```rust
//! use simcore::component::Component;
//! use simcore::config::{ComponentConfig, ConfigGraphBuilder, LinkEndpoint};
//! use simcore::event::{Event, NullEvent};
//! use simcore::handler::{ClockHandler, EventHandler};
//! use simcore::registry::ComponentRegistry;
//! use simcore::simulation::Simulation;
//!
//! #[derive(Default)]
//! struct Sink {
//!     received: u64,
//! }
//! impl Component for Sink {}
//!
//! struct Source;
//! impl Component for Source {}
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register("Source", |ctx, _params| {
//!     let out = ctx.configure_polling_link("out")?;
//!     ctx.register_clock("1GHz", ClockHandler::free(move |ctx, _cycle| {
//!         ctx.send(out, Event::new(NullEvent))?;
//!         Ok(false)
//!     }))?;
//!     Ok(Box::new(Source))
//! });
//! registry.register("Sink", |ctx, _params| {
//!     ctx.configure_link("in", EventHandler::member(|s: &mut Sink, _ctx, _event| {
//!         s.received += 1;
//!         Ok(())
//!     }))?;
//!     Ok(Box::new(Sink::default()))
//! });
//!
//! let graph = ConfigGraphBuilder::new()
//!     .stop_at("100ns")
//!     .component(ComponentConfig::new(0, "src", "Source"))
//!     .component(ComponentConfig::new(1, "dst", "Sink"))
//!     .link("l0", LinkEndpoint::new("src", "out", "5ns"), LinkEndpoint::new("dst", "in", "5ns"))
//!     .build()
//!     .unwrap();
//!
//! let mut sim = Simulation::from_config(&graph, &registry).unwrap();
//! let report = sim.run().unwrap();
//! println!("{}", report.summary());
//! assert_eq!(sim.component::<Sink>("dst").unwrap().received, 95);
//! ```
//!
//! ## Partitioned Execution
//!
//! ```rust,ignore
//! use simcore::parallel::PartitionedRunner;
//!
//! let graph = ConfigGraph::from_file("system.yaml")?;
//! let reports = PartitionedRunner::new(&graph, &registry).run()?;
//! ```

pub mod types;
pub mod error;
pub mod time;
pub mod params;
pub mod event;
pub mod activity;
pub mod vortex;
pub mod handler;
pub mod profile;
pub mod link;
pub mod clock;
pub mod oneshot;
pub mod heartbeat;
pub mod exit;
pub mod output;
pub mod component;
pub mod registry;
pub mod config;
pub mod wire;
pub mod comm;
pub mod sync;
pub mod context;
pub mod simulation;
pub mod parallel;
pub mod report;
pub mod statistics;

// Re-export commonly used types
pub use types::{priority, ComponentId, Cycle, HandlerId, LinkId, Priority, Rank, RankInfo, SimTime, MAX_SIM_TIME};
pub use error::{SimError, SimResult};
pub use event::{Event, EventData, EventTypeRegistry, NullEvent};
pub use handler::{ClockHandler, EventHandler, Handler, OneShotHandler};
pub use component::Component;
pub use context::{ClockHandle, Context, Phase};
pub use config::{ComponentConfig, ConfigGraph, ConfigGraphBuilder, LinkEndpoint, SyncMode};
pub use registry::ComponentRegistry;
pub use params::Params;
pub use simulation::{EndReason, Simulation};
pub use parallel::PartitionedRunner;
pub use report::{RunCounters, RunReport, Timer};
pub use statistics::Statistic;
pub use time::{TimeConverter, TimeLord};

/// Initialize the tracing subscriber for logging.
///
/// Call this at the start of your program to enable logging. `RUST_LOG`
/// overrides `level` when set.
///
/// # Example
///
/// ```rust,ignore
/// simcore::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}
