//! Statistic registration, grouping and dump scheduling.
//!
//! Every statistic joins exactly one [`StatisticGroup`]: the first
//! configured group whose component and statistic filters match, else a
//! group created for its `rate` parameter, else the end-of-simulation
//! default group. Periodic groups are dumped from clock handlers; every group
//! is dumped once more at the end of the run.

use std::cell::RefCell;
use std::rc::Rc;

use super::kinds::StatisticKinds;
use super::output::{rank_path, CsvOutput, JsonOutput, OutputSink, StatisticOutput, TextOutput};
use super::{EntryHeader, EntryWriter, ErasedStatistic, FieldRegistrar, FieldRegistry, StatInfo, StatValue, Statistic};
use crate::config::{OutputKind, StatisticsConfig};
use crate::error::{SimError, SimResult};
use crate::params::Params;
use crate::time::TimeLord;
use crate::types::{RankInfo, SimTime};

/// Statistics sharing an output and a dump frequency.
#[derive(Debug, Clone)]
pub struct StatisticGroup {
    name: String,
    output: usize,
    frequency: Option<SimTime>,
    components: Vec<String>,
    statistics: Vec<String>,
    members: Vec<usize>,
}

impl StatisticGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dump period in core ticks; `None` for end of simulation only.
    pub fn frequency(&self) -> Option<SimTime> {
        self.frequency
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn matches(&self, component: &str, statistic: &str) -> bool {
        let component_ok = self.components.iter().any(|c| c == "*" || c == component);
        let statistic_ok = self.statistics.is_empty() || self.statistics.iter().any(|s| s == statistic);
        component_ok && statistic_ok
    }
}

struct OutputSlot {
    name: String,
    output: Box<dyn StatisticOutput>,
    fields: FieldRegistry,
}

/// Owns the outputs, groups and registered statistics of one partition.
pub struct StatisticsEngine {
    level: u8,
    rank: RankInfo,
    time_lord: Option<TimeLord>,
    kinds: StatisticKinds,
    outputs: Vec<OutputSlot>,
    groups: Vec<StatisticGroup>,
    stats: Vec<Rc<RefCell<dyn ErasedStatistic>>>,
    started: bool,
    finished: bool,
}

impl StatisticsEngine {
    /// Creates an engine with no outputs and only the default group.
    pub fn new(level: u8, rank: RankInfo) -> Self {
        Self {
            level,
            rank,
            time_lord: None,
            kinds: StatisticKinds::new(),
            outputs: Vec::new(),
            groups: vec![StatisticGroup {
                name: "default".to_string(),
                output: 0,
                frequency: None,
                components: Vec::new(),
                statistics: Vec::new(),
                members: Vec::new(),
            }],
            stats: Vec::new(),
            started: false,
            finished: false,
        }
    }

    /// Time lord used to parse group frequencies and `rate` parameters.
    pub fn with_time_lord(mut self, time_lord: TimeLord) -> Self {
        self.time_lord = Some(time_lord);
        self
    }

    pub fn with_kinds(mut self, kinds: StatisticKinds) -> Self {
        self.kinds = kinds;
        self
    }

    /// Builds outputs and groups from configuration.
    ///
    /// Output files get a `_rank{r}` suffix in multi-rank runs.
    pub fn from_config(
        config: &StatisticsConfig,
        level: u8,
        rank: RankInfo,
        time_lord: TimeLord,
        kinds: StatisticKinds,
    ) -> SimResult<Self> {
        let mut engine = Self::new(level, rank).with_time_lord(time_lord).with_kinds(kinds);
        for out in &config.outputs {
            let sink = match &out.path {
                Some(path) => OutputSink::create(&rank_path(path, rank), out.compress)?,
                None => OutputSink::stdout(),
            };
            let output: Box<dyn StatisticOutput> = match out.kind {
                OutputKind::Text => Box::new(TextOutput::new(sink)),
                OutputKind::Csv => Box::new(CsvOutput::with_delimiter(
                    sink,
                    out.delimiter.clone().unwrap_or_else(|| ",".to_string()),
                )),
                OutputKind::Json => Box::new(JsonOutput::new(sink)),
            };
            engine.add_output(&out.name, output);
        }
        for group in &config.groups {
            let frequency = match &group.frequency {
                Some(text) => Some(engine.parse_period(text)?),
                None => None,
            };
            engine.add_group(
                &group.name,
                group.output.as_deref(),
                frequency,
                group.components.clone(),
                group.statistics.clone(),
            )?;
        }
        Ok(engine)
    }

    fn parse_period(&self, text: &str) -> SimResult<SimTime> {
        let time_lord = self
            .time_lord
            .as_ref()
            .ok_or_else(|| SimError::configuration(format!("cannot parse '{}' without a time base", text)))?;
        let ticks = time_lord.ticks(text)?;
        if ticks == 0 {
            return Err(SimError::temporal(format!("statistic frequency '{}' is zero ticks", text)));
        }
        Ok(ticks)
    }

    /// Adds an output; returns its index.
    pub fn add_output(&mut self, name: &str, output: Box<dyn StatisticOutput>) -> usize {
        self.outputs.push(OutputSlot {
            name: name.to_string(),
            output,
            fields: FieldRegistry::new(),
        });
        self.outputs.len() - 1
    }

    /// Adds a group; `output` names an existing output (first one if `None`).
    pub fn add_group(
        &mut self,
        name: &str,
        output: Option<&str>,
        frequency: Option<SimTime>,
        components: Vec<String>,
        statistics: Vec<String>,
    ) -> SimResult<usize> {
        if self.groups.iter().any(|g| g.name == name) {
            return Err(SimError::configuration(format!("duplicate statistic group '{}'", name)));
        }
        let output = match output {
            Some(out) => self
                .outputs
                .iter()
                .position(|o| o.name == out)
                .ok_or_else(|| {
                    SimError::configuration(format!("statistic group '{}' uses unknown output '{}'", name, out))
                })?,
            None => 0,
        };
        self.groups.push(StatisticGroup {
            name: name.to_string(),
            output,
            frequency,
            components,
            statistics,
            members: Vec::new(),
        });
        Ok(self.groups.len() - 1)
    }

    /// Registers a statistic of `component`.
    ///
    /// Recognized parameters: `type` (default `accumulator`), `level`
    /// (default 1), `rate`, `reset_on_output`, plus the kind's own. Returns a
    /// null statistic when the level is above the configured one or the
    /// kind is unknown.
    pub fn register<T: StatValue>(
        &mut self,
        component: &str,
        component_type: &str,
        name: &str,
        sub_id: &str,
        params: &Params,
    ) -> SimResult<Statistic<T>> {
        if self.started {
            return Err(SimError::statistic(format!(
                "statistic {}.{} registered after start of simulation",
                component, name
            )));
        }
        let kind = params.find("type", "accumulator".to_string())?;
        let mut info = StatInfo {
            component: component.to_string(),
            component_type: component_type.to_string(),
            name: name.to_string(),
            sub_id: sub_id.to_string(),
            kind: kind.to_ascii_lowercase(),
            level: params.find("level", 1u8)?,
            reset_on_output: params.find("reset_on_output", false)?,
        };

        if info.level > self.level {
            tracing::debug!(
                component,
                statistic = name,
                level = info.level,
                configured = self.level,
                "statistic suppressed by level"
            );
            info.kind = "null".to_string();
            return Ok(Statistic::null(info));
        }

        let collector = match self.kinds.build::<T>(&kind, params)? {
            Some(c) => c,
            None => {
                tracing::warn!(component, statistic = name, kind = %kind, "unknown statistic type, using null");
                info.kind = "null".to_string();
                return Ok(Statistic::null(info));
            }
        };
        if collector.is_null() {
            return Ok(Statistic::new(info, collector));
        }

        let group = match self.groups.iter().skip(1).position(|g| g.matches(component, name)) {
            Some(i) => i + 1,
            None => match params.find_optional::<String>("rate")? {
                Some(rate) => self.rate_group(&rate)?,
                None => 0,
            },
        };

        let stat = Statistic::new(info, collector);
        self.groups[group].members.push(self.stats.len());
        self.stats.push(stat.erased());
        Ok(stat)
    }

    fn rate_group(&mut self, rate: &str) -> SimResult<usize> {
        let frequency = self.parse_period(rate)?;
        let name = format!("rate:{}", rate.trim());
        if let Some(i) = self.groups.iter().position(|g| g.name == name) {
            return Ok(i);
        }
        self.add_group(&name, None, Some(frequency), Vec::new(), Vec::new())
    }

    /// Registers every statistic's fields and writes output headers.
    ///
    /// Returns the periodic groups to schedule, as `(group, period)`.
    pub fn start_of_simulation(&mut self) -> SimResult<Vec<(usize, SimTime)>> {
        if self.started {
            return Ok(Vec::new());
        }
        self.started = true;
        if self.stats.is_empty() {
            return Ok(Vec::new());
        }
        if self.outputs.is_empty() {
            self.add_output("stdout", Box::new(TextOutput::new(OutputSink::stdout())));
        }

        for group in &self.groups {
            let slot = &mut self.outputs[group.output];
            for &member in &group.members {
                let mut registrar = FieldRegistrar::new(&mut slot.fields);
                self.stats[member].borrow_mut().register_fields(&mut registrar)?;
            }
        }
        for slot in &mut self.outputs {
            slot.output.start_of_simulation(slot.fields.defs())?;
        }

        Ok(self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| !g.members.is_empty())
            .filter_map(|(i, g)| g.frequency.map(|f| (i, f)))
            .collect())
    }

    /// Writes one entry per enabled statistic of `group`.
    pub fn dump_group(&mut self, group: usize, time: SimTime) -> SimResult<()> {
        let group = self
            .groups
            .get(group)
            .ok_or_else(|| SimError::statistic(format!("no statistic group {}", group)))?;
        if group.members.is_empty() {
            return Ok(());
        }
        let output = &mut self.outputs[group.output].output;
        for &member in &group.members {
            let stat = &self.stats[member];
            if !stat.borrow().is_enabled() {
                continue;
            }
            let header = {
                let s = stat.borrow();
                let info = s.info();
                EntryHeader {
                    component: info.component.clone(),
                    statistic: info.name.clone(),
                    sub_id: info.sub_id.clone(),
                    kind: info.kind.clone(),
                    time,
                    rank: self.rank.rank,
                }
            };
            output.start_entries(&header)?;
            stat.borrow().output(&mut EntryWriter::new(output.as_mut()))?;
            output.stop_entries()?;
            if stat.borrow().info().reset_on_output {
                stat.borrow_mut().reset();
            }
        }
        Ok(())
    }

    /// End-of-simulation dump of every group, then closes the outputs.
    ///
    /// Idempotent; also used on the error path.
    pub fn finish(&mut self, time: SimTime) -> SimResult<()> {
        if self.finished {
            return Ok(());
        }
        self.start_of_simulation()?;
        self.finished = true;
        if self.stats.is_empty() {
            return Ok(());
        }
        for group in 0..self.groups.len() {
            self.dump_group(group, time)?;
        }
        for slot in &mut self.outputs {
            slot.output.end_of_simulation()?;
        }
        Ok(())
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Number of registered (non-null) statistics.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn groups(&self) -> &[StatisticGroup] {
        &self.groups
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|o| o.name.as_str()).collect()
    }
}

impl std::fmt::Debug for StatisticsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsEngine")
            .field("level", &self.level)
            .field("rank", &self.rank)
            .field("outputs", &self.output_names())
            .field("groups", &self.groups.len())
            .field("statistics", &self.stats.len())
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::{Accumulator, SharedBuffer};

    fn engine_with_csv() -> (StatisticsEngine, SharedBuffer) {
        let buf = SharedBuffer::new();
        let mut engine = StatisticsEngine::new(2, RankInfo::single()).with_time_lord(TimeLord::new("1ps").unwrap());
        engine.add_output("csv", Box::new(CsvOutput::new(OutputSink::Memory(buf.clone()))));
        (engine, buf)
    }

    #[test]
    fn test_level_gating() {
        let (mut engine, _) = engine_with_csv();
        let high = Params::from_pairs([("level", "5")]);
        let stat = engine.register::<u64>("c", "T", "s", "", &high).unwrap();
        assert!(stat.is_null());
        assert!(engine.is_empty());
    }

    #[test]
    fn test_unknown_kind_falls_back_to_null() {
        let (mut engine, _) = engine_with_csv();
        let params = Params::from_pairs([("type", "nope")]);
        let stat = engine.register::<u64>("c", "T", "s", "", &params).unwrap();
        assert!(stat.is_null());
        stat.add_data(1);
        assert_eq!(stat.count(), 0);
    }

    #[test]
    fn test_late_registration_is_an_error() {
        let (mut engine, _) = engine_with_csv();
        engine.start_of_simulation().unwrap();
        let err = engine.register::<u64>("c", "T", "s", "", &Params::new()).unwrap_err();
        assert!(matches!(err, SimError::Statistic { .. }));
    }

    #[test]
    fn test_shared_fields_and_reset_on_output() {
        let (mut engine, buf) = engine_with_csv();
        let reset = Params::from_pairs([("reset_on_output", "true")]);
        let a = engine.register::<u64>("c0", "T", "hits", "", &reset).unwrap();
        let b = engine.register::<u64>("c1", "T", "hits", "", &Params::new()).unwrap();
        a.add_data(2);
        b.add_data(3);
        engine.start_of_simulation().unwrap();
        engine.dump_group(0, 10).unwrap();
        assert_eq!(a.collector::<Accumulator<u64>>().unwrap().sum(), 0);
        assert_eq!(b.collector::<Accumulator<u64>>().unwrap().sum(), 3);
        engine.finish(20).unwrap();
        engine.finish(30).unwrap();

        let text = buf.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("Sum.u64,SumSQ.u64,Count.u64,Min.u64,Max.u64"));
        assert_eq!(lines[1], "c0,hits,,accumulator,10,0,2,4,1,2,2");
        assert_eq!(lines[3], "c0,hits,,accumulator,20,0,0,0,0,0,0");
    }

    #[test]
    fn test_group_selection() {
        let (mut engine, _) = engine_with_csv();
        let g = engine
            .add_group("fast", Some("csv"), Some(100), vec!["cpu".into()], vec!["ipc".into()])
            .unwrap();
        engine.register::<f64>("cpu", "Core", "ipc", "", &Params::new()).unwrap();
        engine.register::<f64>("cpu", "Core", "other", "", &Params::new()).unwrap();
        let rated = Params::from_pairs([("rate", "1ns")]);
        engine.register::<f64>("mem", "Mem", "bw", "", &rated).unwrap();
        engine.register::<f64>("mem", "Mem", "lat", "", &rated).unwrap();

        assert_eq!(engine.groups()[g].len(), 1);
        assert_eq!(engine.groups()[0].len(), 1);
        let rate = engine.group_index("rate:1ns").unwrap();
        assert_eq!(engine.groups()[rate].len(), 2);
        assert_eq!(engine.groups()[rate].frequency(), Some(1000));

        let periodic = engine.start_of_simulation().unwrap();
        assert_eq!(periodic, vec![(g, 100), (rate, 1000)]);
    }

    #[test]
    fn test_unknown_group_output() {
        let (mut engine, _) = engine_with_csv();
        let err = engine.add_group("g", Some("missing"), None, vec![], vec![]).unwrap_err();
        assert!(err.is_configuration());
    }
}
