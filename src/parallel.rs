//! Multi-rank execution inside one process.
//!
//! [`PartitionedRunner`] runs every rank of a graph on its own thread. Each
//! thread builds its own [`Simulation`] (partitions are not `Send`: they
//! hold per-thread statistic handles), connected to the others through a
//! [`ThreadCommunicator`]. A rank that fails drops its communicator, which
//! turns every later collective on the other ranks into a resource error,
//! so a fatal error on one rank aborts them all.
//!
//! # Example
//!
//! ```
//! use simcore::component::Component;
//! use simcore::config::{ComponentConfig, ConfigGraphBuilder};
//! use simcore::parallel::PartitionedRunner;
//! use simcore::registry::ComponentRegistry;
//!
//! struct Idle;
//! impl Component for Idle {}
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register("Idle", |_ctx, _params| Ok(Box::new(Idle)));
//!
//! let graph = ConfigGraphBuilder::new()
//!     .num_ranks(2)
//!     .stop_at("10ns")
//!     .component(ComponentConfig::new(0, "a", "Idle"))
//!     .component(ComponentConfig::new(1, "b", "Idle").rank(1))
//!     .build()
//!     .unwrap();
//! let reports = PartitionedRunner::new(&graph, &registry).run().unwrap();
//! assert_eq!(reports.len(), 2);
//! ```

use std::thread;

use crate::comm::{Communicator, ThreadCommunicator};
use crate::config::ConfigGraph;
use crate::error::{SimError, SimResult};
use crate::registry::ComponentRegistry;
use crate::report::RunReport;
use crate::simulation::Simulation;

/// Runs all ranks of a graph as threads of the current process.
#[derive(Debug)]
pub struct PartitionedRunner<'a> {
    graph: &'a ConfigGraph,
    registry: &'a ComponentRegistry,
}

impl<'a> PartitionedRunner<'a> {
    pub fn new(graph: &'a ConfigGraph, registry: &'a ComponentRegistry) -> Self {
        Self { graph, registry }
    }

    /// Number of ranks the graph asks for.
    pub fn num_ranks(&self) -> u32 {
        self.graph.simulation.num_ranks
    }

    /// Runs every rank and returns their reports in rank order.
    pub fn run(&self) -> SimResult<Vec<RunReport>> {
        self.run_with(|_sim, report| report)
    }

    /// Runs every rank and maps each finished partition through `extract`,
    /// returning the results in rank order.
    ///
    /// If ranks fail, the error of the lowest failing rank that did not
    /// merely observe another rank's failure is returned.
    pub fn run_with<T, F>(&self, extract: F) -> SimResult<Vec<T>>
    where
        T: Send,
        F: Fn(&Simulation, RunReport) -> T + Sync,
    {
        self.graph.validate()?;
        let num_ranks = self.num_ranks();
        tracing::info!(ranks = num_ranks, mode = ?self.graph.simulation.sync_mode, "starting partitioned run");

        let comms = ThreadCommunicator::create(num_ranks);
        let results: Vec<SimResult<T>> = thread::scope(|s| {
            let extract = &extract;
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let rank = comm.rank_info();
                    thread::Builder::new()
                        .name(format!("rank-{}", rank.rank))
                        .spawn_scoped(s, move || -> SimResult<T> {
                            let mut sim =
                                Simulation::build_partition(self.graph, self.registry, rank, Some(Box::new(comm)))?;
                            let report = sim.run()?;
                            Ok(extract(&sim, report))
                        })
                })
                .collect();
            handles
                .into_iter()
                .map(|spawned| match spawned {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(SimError::fatal("rank thread panicked"))),
                    Err(err) => Err(SimError::from(err)),
                })
                .collect()
        });

        let mut first_resource = None;
        let mut outputs = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(value) => outputs.push(value),
                // Resource errors are usually a peer hanging up after its own failure.
                Err(err @ SimError::Resource { .. }) => {
                    first_resource.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        match first_resource {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::config::{ComponentConfig, ConfigGraphBuilder, LinkEndpoint};
    use crate::handler::ClockHandler;

    struct Idle;
    impl Component for Idle {}

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register("Idle", |_ctx, _params| Ok(Box::new(Idle)));
        registry.register("Crash", |ctx, _params| {
            ctx.register_clock(
                "1ns",
                ClockHandler::free(|_ctx, cycle| {
                    if cycle == 15 {
                        return Err(SimError::fatal("crash"));
                    }
                    Ok(false)
                }),
            )?;
            Ok(Box::new(Idle))
        });
        registry
    }

    #[test]
    fn test_idle_ranks_end_together() {
        let graph = ConfigGraphBuilder::new()
            .num_ranks(2)
            .component(ComponentConfig::new(0, "a", "Idle"))
            .component(ComponentConfig::new(1, "b", "Idle").rank(1))
            .link("ab", LinkEndpoint::new("a", "p", "10ns"), LinkEndpoint::new("b", "p", "10ns"))
            .build()
            .unwrap();
        let reports = PartitionedRunner::new(&graph, &registry()).run().unwrap();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert_eq!(report.end_reason, "idle");
            assert_eq!(report.final_time, 10_000);
            assert_eq!(report.counters.sync_rounds, 1);
        }
    }

    #[test]
    fn test_failure_on_one_rank_aborts_all() {
        let graph = ConfigGraphBuilder::new()
            .num_ranks(2)
            .stop_at("100ns")
            .component(ComponentConfig::new(0, "a", "Idle"))
            .component(ComponentConfig::new(1, "b", "Crash").rank(1))
            .link("ab", LinkEndpoint::new("a", "p", "10ns"), LinkEndpoint::new("b", "p", "10ns"))
            .build()
            .unwrap();
        let err = PartitionedRunner::new(&graph, &registry()).run().unwrap_err();
        assert!(matches!(err, SimError::Fatal { .. }));
    }
}
