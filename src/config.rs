//! Configuration graph for the simulation engine.
//!
//! A [`ConfigGraph`] describes the components, the links between their
//! ports, the statistics setup and the global simulation parameters. It can
//! be loaded from YAML or JSON, or built with [`ConfigGraphBuilder`].
//!
//! # Configuration File Structure
//!
//! ```yaml
//! simulation:
//!   timebase: 1ps
//!   stop_at: 1ms
//!   num_ranks: 2
//!   sync_mode: parallel
//!
//! components:
//!   - id: 0
//!     name: cpu0
//!     type: Core
//!     rank: 0
//!     params:
//!       clock: 2GHz
//!     statistics:
//!       - name: instructions
//!         params:
//!           type: accumulator
//!   - id: 1
//!     name: mem
//!     type: Memory
//!     rank: 1
//!
//! links:
//!   - name: cpu0_mem
//!     endpoints:
//!       - { component: cpu0, port: mem, latency: 10ns }
//!       - { component: mem, port: cpu, latency: 10ns }
//!
//! statistics:
//!   outputs:
//!     - name: csv
//!       kind: csv
//!       path: stats.csv
//!   groups:
//!     - name: cores
//!       output: csv
//!       frequency: 100us
//!       components: [cpu0]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{SimError, SimResult};
use crate::params::Params;
use crate::profile::ProfileConfig;
use crate::time::TimeLord;
use crate::types::{ComponentId, Rank, SimTime};

/// How a rank exchanges its outbound buffers at a sync horizon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Frame, exchange and decode on the rank's own thread.
    #[default]
    Serial,
    /// Overlap framing and decoding with bounded worker pipelines.
    Parallel,
}

/// Global simulation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Length of one core tick
    #[serde(default = "default_timebase")]
    pub timebase: String,

    /// Simulated time at which the run stops
    #[serde(default)]
    pub stop_at: Option<String>,

    /// Interval between progress records
    #[serde(default)]
    pub heartbeat_period: Option<String>,

    /// Number of partitions
    #[serde(default = "default_num_ranks")]
    pub num_ranks: Rank,

    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Capacity of the bounded decode pipeline in parallel sync mode
    #[serde(default = "default_sync_queue_depth")]
    pub sync_queue_depth: usize,

    /// Largest encoded event accepted for a cut link, in bytes
    #[serde(default = "default_max_event_size")]
    pub max_event_size: usize,

    /// Upper bound on untimed phases in init and complete
    #[serde(default = "default_untimed_round_limit")]
    pub untimed_round_limit: u32,

    /// Statistics with a higher level are not collected
    #[serde(default = "default_statistics_level")]
    pub statistics_level: u8,

    /// Verbosity of the engine's own output
    #[serde(default)]
    pub verbosity: u32,

    /// Handler profiling tools
    #[serde(default)]
    pub profiling: Vec<ProfileConfig>,
}

fn default_timebase() -> String {
    "1ps".to_string()
}

fn default_num_ranks() -> Rank {
    1
}

fn default_sync_queue_depth() -> usize {
    64
}

fn default_max_event_size() -> usize {
    1 << 20
}

fn default_untimed_round_limit() -> u32 {
    64
}

fn default_statistics_level() -> u8 {
    1
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            timebase: default_timebase(),
            stop_at: None,
            heartbeat_period: None,
            num_ranks: default_num_ranks(),
            sync_mode: SyncMode::default(),
            sync_queue_depth: default_sync_queue_depth(),
            max_event_size: default_max_event_size(),
            untimed_round_limit: default_untimed_round_limit(),
            statistics_level: default_statistics_level(),
            verbosity: 0,
            profiling: Vec::new(),
        }
    }
}

/// A statistic enabled on a component.
///
/// The name `*` enables every statistic the component registers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnabledStatistic {
    pub name: String,

    /// `type`, `level`, `rate`, `reset_on_output` and kind-specific keys
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Configuration for a single component.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ComponentConfig {
    /// Unique component identifier
    pub id: u32,

    /// Unique component name
    pub name: String,

    /// Registered component type
    #[serde(rename = "type")]
    pub type_name: String,

    /// Partition the component runs on
    #[serde(default)]
    pub rank: Rank,

    #[serde(default)]
    pub params: BTreeMap<String, String>,

    #[serde(default)]
    pub statistics: Vec<EnabledStatistic>,
}

impl ComponentConfig {
    pub fn new(id: u32, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            type_name: type_name.into(),
            rank: 0,
            params: BTreeMap::new(),
            statistics: Vec::new(),
        }
    }

    /// Sets a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Places the component on `rank`.
    pub fn rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    /// Enables statistic `name` with the given parameters.
    pub fn statistic<K, V>(mut self, name: impl Into<String>, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.statistics.push(EnabledStatistic {
            name: name.into(),
            params: params.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        });
        self
    }

    pub fn component_id(&self) -> ComponentId {
        ComponentId::new(self.id)
    }

    /// Parameters as a [`Params`] bundle.
    pub fn to_params(&self) -> Params {
        Params::from_pairs(self.params.iter())
    }
}

/// One end of a link.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LinkEndpoint {
    /// Component name
    pub component: String,
    pub port: String,
    /// Latency of events sent from this end
    pub latency: String,
}

impl LinkEndpoint {
    pub fn new(component: impl Into<String>, port: impl Into<String>, latency: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            port: port.into(),
            latency: latency.into(),
        }
    }
}

/// Configuration for a link between two ports.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub name: String,
    pub endpoints: [LinkEndpoint; 2],
}

/// Format of a statistics output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Text,
    Csv,
    Json,
}

/// A statistics output destination.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatOutputConfig {
    pub name: String,

    #[serde(default)]
    pub kind: OutputKind,

    /// File to write; standard output if absent
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Gzip the file (implied by a `.gz` extension)
    #[serde(default)]
    pub compress: bool,

    /// CSV column separator
    #[serde(default)]
    pub delimiter: Option<String>,
}

/// A statistics group.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatGroupConfig {
    pub name: String,

    /// Output name; the first output if absent
    #[serde(default)]
    pub output: Option<String>,

    /// Dump period; end of simulation only if absent
    #[serde(default)]
    pub frequency: Option<String>,

    /// Member component names, `*` for all
    #[serde(default)]
    pub components: Vec<String>,

    /// Member statistic names, empty for all
    #[serde(default)]
    pub statistics: Vec<String>,
}

/// Statistics outputs and groups.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StatisticsConfig {
    #[serde(default)]
    pub outputs: Vec<StatOutputConfig>,

    #[serde(default)]
    pub groups: Vec<StatGroupConfig>,
}

/// Complete simulation configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigGraph {
    #[serde(default)]
    pub simulation: SimulationParams,

    #[serde(default)]
    pub components: Vec<ComponentConfig>,

    #[serde(default)]
    pub links: Vec<LinkConfig>,

    #[serde(default)]
    pub statistics: StatisticsConfig,
}

impl ConfigGraph {
    /// Creates a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> SimResult<Self> {
        let config: ConfigGraph = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> SimResult<Self> {
        let config: ConfigGraph = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(SimError::configuration(format!(
                "unknown configuration format '{}' for {}",
                ext,
                path.display()
            ))),
        }
    }

    /// Validates the entire configuration.
    pub fn validate(&self) -> SimResult<()> {
        let sim = &self.simulation;
        let time_lord = TimeLord::new(&sim.timebase)?;
        if sim.num_ranks == 0 {
            return Err(SimError::configuration("num_ranks must be at least 1"));
        }
        if let Some(stop) = &sim.stop_at {
            time_lord.ticks(stop)?;
        }
        if let Some(hb) = &sim.heartbeat_period {
            if time_lord.ticks(hb)? == 0 {
                return Err(SimError::configuration(format!("heartbeat_period '{}' is zero ticks", hb)));
            }
        }
        if sim.sync_queue_depth == 0 {
            return Err(SimError::configuration("sync_queue_depth must be at least 1"));
        }
        if sim.untimed_round_limit == 0 {
            return Err(SimError::configuration("untimed_round_limit must be at least 1"));
        }
        if sim.statistics_level > 10 {
            return Err(SimError::configuration(format!(
                "statistics_level {} is above 10",
                sim.statistics_level
            )));
        }

        // Components have unique ids and names
        let mut ids = HashSet::new();
        let mut names: HashMap<&str, &ComponentConfig> = HashMap::new();
        for comp in &self.components {
            if !ids.insert(comp.id) {
                return Err(SimError::configuration(format!("duplicate component id {}", comp.id)));
            }
            if names.insert(comp.name.as_str(), comp).is_some() {
                return Err(SimError::configuration(format!("duplicate component name '{}'", comp.name)));
            }
            if comp.rank >= sim.num_ranks {
                return Err(SimError::configuration(format!(
                    "component '{}' is on rank {} but the run has {} ranks",
                    comp.name, comp.rank, sim.num_ranks
                )));
            }
        }

        // Links reference existing ports, each port at most once
        let mut link_names = HashSet::new();
        let mut ports = HashSet::new();
        for link in &self.links {
            if !link_names.insert(link.name.as_str()) {
                return Err(SimError::configuration(format!("duplicate link name '{}'", link.name)));
            }
            for end in &link.endpoints {
                if !names.contains_key(end.component.as_str()) {
                    return Err(SimError::configuration(format!(
                        "link '{}' references unknown component '{}'",
                        link.name, end.component
                    )));
                }
                if !ports.insert((end.component.as_str(), end.port.as_str())) {
                    return Err(SimError::configuration(format!(
                        "port {}.{} is connected by more than one link",
                        end.component, end.port
                    )));
                }
                if time_lord.ticks(&end.latency)? == 0 {
                    return Err(SimError::configuration(format!(
                        "link '{}' has zero latency at {}.{}",
                        link.name, end.component, end.port
                    )));
                }
            }
        }

        // Statistics groups reference existing outputs
        let outputs: HashSet<&str> = self.statistics.outputs.iter().map(|o| o.name.as_str()).collect();
        if outputs.len() != self.statistics.outputs.len() {
            return Err(SimError::configuration("duplicate statistics output name"));
        }
        for group in &self.statistics.groups {
            if let Some(out) = &group.output {
                if !outputs.contains(out.as_str()) {
                    return Err(SimError::configuration(format!(
                        "statistic group '{}' uses unknown output '{}'",
                        group.name, out
                    )));
                }
            }
            if let Some(freq) = &group.frequency {
                time_lord.ticks(freq)?;
            }
        }

        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> SimResult<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Saves configuration to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> SimResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Converts to YAML string.
    pub fn to_yaml(&self) -> SimResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Converts to JSON string.
    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Returns the number of components.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Returns the number of links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Finds a component configuration by name.
    pub fn find_component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Finds a component configuration by id.
    pub fn find_component_by_id(&self, id: u32) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.id == id)
    }

    /// Rank of the component named `name`.
    pub fn rank_of(&self, name: &str) -> Option<Rank> {
        self.find_component(name).map(|c| c.rank)
    }

    /// Returns true if the endpoints of `link` live on different ranks.
    pub fn is_cut(&self, link: &LinkConfig) -> bool {
        let [a, b] = &link.endpoints;
        self.rank_of(&a.component) != self.rank_of(&b.component)
    }

    /// Smallest endpoint latency over all cut links, in core ticks.
    pub fn min_cut_latency(&self, time_lord: &TimeLord) -> SimResult<Option<SimTime>> {
        let mut min: Option<SimTime> = None;
        for link in self.links.iter().filter(|l| self.is_cut(l)) {
            for end in &link.endpoints {
                let ticks = time_lord.ticks(&end.latency)?;
                min = Some(min.map_or(ticks, |m| m.min(ticks)));
            }
        }
        Ok(min)
    }
}

/// Builder for creating a ConfigGraph programmatically.
#[derive(Default)]
pub struct ConfigGraphBuilder {
    config: ConfigGraph,
}

impl ConfigGraphBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the core tick length.
    pub fn timebase(mut self, base: impl Into<String>) -> Self {
        self.config.simulation.timebase = base.into();
        self
    }

    /// Sets the simulated stop time.
    pub fn stop_at(mut self, time: impl Into<String>) -> Self {
        self.config.simulation.stop_at = Some(time.into());
        self
    }

    pub fn heartbeat(mut self, period: impl Into<String>) -> Self {
        self.config.simulation.heartbeat_period = Some(period.into());
        self
    }

    /// Sets the number of partitions.
    pub fn num_ranks(mut self, ranks: Rank) -> Self {
        self.config.simulation.num_ranks = ranks;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.config.simulation.sync_mode = mode;
        self
    }

    pub fn sync_queue_depth(mut self, depth: usize) -> Self {
        self.config.simulation.sync_queue_depth = depth;
        self
    }

    pub fn max_event_size(mut self, bytes: usize) -> Self {
        self.config.simulation.max_event_size = bytes;
        self
    }

    pub fn untimed_round_limit(mut self, rounds: u32) -> Self {
        self.config.simulation.untimed_round_limit = rounds;
        self
    }

    pub fn statistics_level(mut self, level: u8) -> Self {
        self.config.simulation.statistics_level = level;
        self
    }

    pub fn verbosity(mut self, verbosity: u32) -> Self {
        self.config.simulation.verbosity = verbosity;
        self
    }

    /// Adds a profiling tool.
    pub fn profile(mut self, tool: ProfileConfig) -> Self {
        self.config.simulation.profiling.push(tool);
        self
    }

    /// Adds a component.
    pub fn component(mut self, component: ComponentConfig) -> Self {
        self.config.components.push(component);
        self
    }

    /// Adds a link between `a` and `b`.
    pub fn link(mut self, name: impl Into<String>, a: LinkEndpoint, b: LinkEndpoint) -> Self {
        self.config.links.push(LinkConfig {
            name: name.into(),
            endpoints: [a, b],
        });
        self
    }

    /// Adds a link with the same latency in both directions.
    pub fn connect(
        self,
        name: impl Into<String>,
        (comp_a, port_a): (&str, &str),
        (comp_b, port_b): (&str, &str),
        latency: &str,
    ) -> Self {
        self.link(
            name,
            LinkEndpoint::new(comp_a, port_a, latency),
            LinkEndpoint::new(comp_b, port_b, latency),
        )
    }

    /// Adds a statistics output.
    pub fn stat_output(mut self, output: StatOutputConfig) -> Self {
        self.config.statistics.outputs.push(output);
        self
    }

    /// Adds a statistics group.
    pub fn stat_group(mut self, group: StatGroupConfig) -> Self {
        self.config.statistics.groups.push(group);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> SimResult<ConfigGraph> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_core_yaml() -> &'static str {
        r#"
simulation:
  stop_at: 1us
  num_ranks: 2

components:
  - id: 0
    name: a
    type: Core
    params:
      clock: 1GHz
  - id: 1
    name: b
    type: Core
    rank: 1

links:
  - name: ab
    endpoints:
      - { component: a, port: out, latency: 10ns }
      - { component: b, port: in, latency: 20ns }
"#
    }

    #[test]
    fn test_default_config() {
        let config = ConfigGraph::new();
        assert_eq!(config.simulation.timebase, "1ps");
        assert_eq!(config.simulation.num_ranks, 1);
        assert_eq!(config.simulation.statistics_level, 1);
        assert_eq!(config.simulation.sync_mode, SyncMode::Serial);
        assert!(config.components.is_empty());
    }

    #[test]
    fn test_yaml_parsing() {
        let config = ConfigGraph::from_yaml(two_core_yaml()).unwrap();
        assert_eq!(config.component_count(), 2);
        assert_eq!(config.link_count(), 1);
        assert_eq!(config.find_component("a").unwrap().params["clock"], "1GHz");
        assert!(config.is_cut(&config.links[0]));
        let tl = TimeLord::new("1ps").unwrap();
        assert_eq!(config.min_cut_latency(&tl).unwrap(), Some(10_000));
    }

    #[test]
    fn test_json_parsing() {
        let json = r#"{
            "simulation": { "timebase": "1ns", "sync_mode": "parallel" },
            "components": [ { "id": 3, "name": "x", "type": "Sink" } ],
            "statistics": { "outputs": [ { "name": "o", "kind": "csv", "path": "s.csv" } ] }
        }"#;
        let config = ConfigGraph::from_json(json).unwrap();
        assert_eq!(config.simulation.sync_mode, SyncMode::Parallel);
        assert_eq!(config.find_component_by_id(3).unwrap().name, "x");
        assert_eq!(config.statistics.outputs[0].kind, OutputKind::Csv);
    }

    #[test]
    fn test_builder() {
        let config = ConfigGraphBuilder::new()
            .stop_at("1ms")
            .component(ComponentConfig::new(0, "src", "Source").param("count", "5"))
            .component(ComponentConfig::new(1, "dst", "Sink").statistic("hits", [("type", "accumulator")]))
            .connect("l0", ("src", "out"), ("dst", "in"), "5ns")
            .build()
            .unwrap();
        assert_eq!(config.link_count(), 1);
        assert!(!config.is_cut(&config.links[0]));
        let params = config.components[0].to_params();
        assert_eq!(params.find::<u32>("count", 0).unwrap(), 5);
    }

    #[test]
    fn test_validation_duplicate_component() {
        let result = ConfigGraphBuilder::new()
            .component(ComponentConfig::new(0, "a", "T"))
            .component(ComponentConfig::new(0, "b", "T"))
            .build();
        assert!(result.unwrap_err().is_configuration());

        let result = ConfigGraphBuilder::new()
            .component(ComponentConfig::new(0, "a", "T"))
            .component(ComponentConfig::new(1, "a", "T"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_port_connected_twice() {
        let result = ConfigGraphBuilder::new()
            .component(ComponentConfig::new(0, "a", "T"))
            .component(ComponentConfig::new(1, "b", "T"))
            .connect("l0", ("a", "p"), ("b", "p"), "1ns")
            .connect("l1", ("a", "p"), ("b", "q"), "1ns")
            .build();
        assert!(result.unwrap_err().is_configuration());
    }

    #[test]
    fn test_validation_bad_link() {
        let unknown = ConfigGraphBuilder::new()
            .component(ComponentConfig::new(0, "a", "T"))
            .connect("l0", ("a", "p"), ("ghost", "p"), "1ns")
            .build();
        assert!(unknown.is_err());

        let zero = ConfigGraphBuilder::new()
            .component(ComponentConfig::new(0, "a", "T"))
            .component(ComponentConfig::new(1, "b", "T"))
            .connect("l0", ("a", "p"), ("b", "p"), "0ns")
            .build();
        assert!(zero.is_err());

        let garbage = ConfigGraphBuilder::new()
            .component(ComponentConfig::new(0, "a", "T"))
            .component(ComponentConfig::new(1, "b", "T"))
            .connect("l0", ("a", "p"), ("b", "p"), "fast")
            .build();
        assert!(garbage.is_err());
    }

    #[test]
    fn test_validation_rank_out_of_range() {
        let result = ConfigGraphBuilder::new()
            .num_ranks(2)
            .component(ComponentConfig::new(0, "a", "T").rank(2))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_unknown_group_output() {
        let result = ConfigGraphBuilder::new()
            .stat_group(StatGroupConfig {
                name: "g".into(),
                output: Some("nowhere".into()),
                frequency: None,
                components: vec!["*".into()],
                statistics: vec![],
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = ConfigGraph::from_yaml(two_core_yaml()).unwrap();
        let yaml = config.to_yaml().unwrap();
        let restored = ConfigGraph::from_yaml(&yaml).unwrap();
        assert_eq!(restored.components, config.components);
        assert_eq!(restored.links, config.links);

        let json = config.to_json().unwrap();
        let restored = ConfigGraph::from_json(&json).unwrap();
        assert_eq!(restored.simulation.num_ranks, 2);
    }

    #[test]
    fn test_unknown_extension() {
        let err = ConfigGraph::from_file("graph.toml").unwrap_err();
        assert!(err.is_configuration());
    }
}
