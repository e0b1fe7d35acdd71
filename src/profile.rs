//! Handler profiling through attach points.
//!
//! A profile tool is attached to handlers when they are registered and is
//! told before and after every invocation. Tools only observe: they never
//! see mutable state of the handler or its component.
//!
//! Two tools are built in:
//! - [`HandlerCountProfiler`] counts invocations (and self-removals).
//! - [`HandlerTimeProfiler`] accumulates wall-clock time spent in handlers.
//!
//! Both aggregate at a configurable [`ProfileLevel`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::handler::{HandlerArg, HandlerKind, HandlerMetadata};

/// Key returned by an attach point at registration, passed back on every call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachKey(pub u64);

/// Observer interface wrapped around handler invocations.
pub trait AttachPoint {
    /// Called once when a handler is registered.
    fn register_handler(&mut self, meta: &HandlerMetadata) -> AttachKey;

    /// Called immediately before the handler runs.
    fn before_invoke(&mut self, key: AttachKey, arg: &HandlerArg<'_>);

    /// Called immediately after the handler returns. `removed` is true when a
    /// clock handler descheduled itself.
    fn after_invoke(&mut self, key: AttachKey, removed: bool);
}

/// An attach point that produces a report.
pub trait ProfileTool: AttachPoint {
    fn name(&self) -> &str;

    fn report(&self) -> serde_json::Value;
}

/// Granularity at which a tool aggregates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileLevel {
    /// One bucket per handler.
    Handler,
    /// One bucket per component.
    #[default]
    Component,
    /// One bucket per component type.
    Type,
    /// A single bucket.
    Global,
}

impl ProfileLevel {
    fn bucket_name(self, meta: &HandlerMetadata) -> String {
        match self {
            ProfileLevel::Handler => format!("{}:{}#{}", meta.component_name, meta.label, meta.id.0),
            ProfileLevel::Component => meta.component_name.clone(),
            ProfileLevel::Type => meta.component_type.clone(),
            ProfileLevel::Global => "global".to_string(),
        }
    }
}

/// Built-in tool kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileToolKind {
    HandlerCount,
    HandlerTime,
}

/// Configuration of one profile tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Name used in the report
    pub name: String,

    pub tool: ProfileToolKind,

    #[serde(default)]
    pub level: ProfileLevel,

    /// Handler kinds to attach to; empty means all
    #[serde(default)]
    pub points: Vec<HandlerKind>,
}

#[derive(Default)]
struct Buckets {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Buckets {
    fn key_for(&mut self, name: String) -> AttachKey {
        let next = self.names.len();
        let idx = *self.index.entry(name.clone()).or_insert_with(|| next);
        if idx == next {
            self.names.push(name);
        }
        AttachKey(idx as u64)
    }
}

/// Counts handler invocations.
pub struct HandlerCountProfiler {
    name: String,
    level: ProfileLevel,
    buckets: Buckets,
    calls: Vec<u64>,
    removals: Vec<u64>,
}

impl HandlerCountProfiler {
    pub fn new(name: impl Into<String>, level: ProfileLevel) -> Self {
        Self {
            name: name.into(),
            level,
            buckets: Buckets::default(),
            calls: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// Invocation count of a bucket.
    pub fn count(&self, bucket: &str) -> u64 {
        self.buckets.index.get(bucket).map_or(0, |i| self.calls[*i])
    }

    /// Total invocations across all buckets.
    pub fn total(&self) -> u64 {
        self.calls.iter().sum()
    }
}

impl AttachPoint for HandlerCountProfiler {
    fn register_handler(&mut self, meta: &HandlerMetadata) -> AttachKey {
        let key = self.buckets.key_for(self.level.bucket_name(meta));
        if key.0 as usize == self.calls.len() {
            self.calls.push(0);
            self.removals.push(0);
        }
        key
    }

    fn before_invoke(&mut self, key: AttachKey, _arg: &HandlerArg<'_>) {
        self.calls[key.0 as usize] += 1;
    }

    fn after_invoke(&mut self, key: AttachKey, removed: bool) {
        if removed {
            self.removals[key.0 as usize] += 1;
        }
    }
}

impl ProfileTool for HandlerCountProfiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn report(&self) -> serde_json::Value {
        let buckets: Vec<_> = self
            .buckets
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| json!({"name": name, "calls": self.calls[i], "removals": self.removals[i]}))
            .collect();
        json!({
            "tool": "handler_count",
            "level": self.level,
            "total": self.total(),
            "buckets": buckets,
        })
    }
}

/// Accumulates wall-clock time spent in handlers.
pub struct HandlerTimeProfiler {
    name: String,
    level: ProfileLevel,
    buckets: Buckets,
    elapsed: Vec<Duration>,
    calls: Vec<u64>,
    started: Option<Instant>,
}

impl HandlerTimeProfiler {
    pub fn new(name: impl Into<String>, level: ProfileLevel) -> Self {
        Self {
            name: name.into(),
            level,
            buckets: Buckets::default(),
            elapsed: Vec::new(),
            calls: Vec::new(),
            started: None,
        }
    }

    /// Time accumulated by a bucket.
    pub fn elapsed(&self, bucket: &str) -> Duration {
        self.buckets
            .index
            .get(bucket)
            .map_or(Duration::ZERO, |i| self.elapsed[*i])
    }
}

impl AttachPoint for HandlerTimeProfiler {
    fn register_handler(&mut self, meta: &HandlerMetadata) -> AttachKey {
        let key = self.buckets.key_for(self.level.bucket_name(meta));
        if key.0 as usize == self.elapsed.len() {
            self.elapsed.push(Duration::ZERO);
            self.calls.push(0);
        }
        key
    }

    fn before_invoke(&mut self, _key: AttachKey, _arg: &HandlerArg<'_>) {
        self.started = Some(Instant::now());
    }

    fn after_invoke(&mut self, key: AttachKey, _removed: bool) {
        if let Some(start) = self.started.take() {
            let i = key.0 as usize;
            self.elapsed[i] += start.elapsed();
            self.calls[i] += 1;
        }
    }
}

impl ProfileTool for HandlerTimeProfiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn report(&self) -> serde_json::Value {
        let buckets: Vec<_> = self
            .buckets
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "name": name,
                    "calls": self.calls[i],
                    "total_us": self.elapsed[i].as_secs_f64() * 1e6,
                })
            })
            .collect();
        json!({
            "tool": "handler_time",
            "level": self.level,
            "buckets": buckets,
        })
    }
}

struct Attached {
    tool: Box<dyn ProfileTool>,
    points: Vec<HandlerKind>,
}

/// The profile tools of one partition.
#[derive(Default)]
pub struct ProfileTools {
    tools: Vec<Attached>,
}

impl ProfileTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the configured tools.
    pub fn from_config(configs: &[ProfileConfig]) -> Self {
        let mut tools = Self::new();
        for config in configs {
            let tool: Box<dyn ProfileTool> = match config.tool {
                ProfileToolKind::HandlerCount => Box::new(HandlerCountProfiler::new(&config.name, config.level)),
                ProfileToolKind::HandlerTime => Box::new(HandlerTimeProfiler::new(&config.name, config.level)),
            };
            tools.add(tool, config.points.clone());
        }
        tools
    }

    /// Adds a tool attached to the given handler kinds (all kinds if empty).
    pub fn add(&mut self, tool: Box<dyn ProfileTool>, points: Vec<HandlerKind>) {
        self.tools.push(Attached { tool, points });
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Offers a new handler to every tool; returns the keys of the tools that attached.
    pub fn register_handler(&mut self, meta: &HandlerMetadata) -> Vec<(usize, AttachKey)> {
        self.tools
            .iter_mut()
            .enumerate()
            .filter(|(_, a)| a.points.is_empty() || a.points.contains(&meta.kind))
            .map(|(i, a)| (i, a.tool.register_handler(meta)))
            .collect()
    }

    pub(crate) fn before_invoke(&mut self, tool: usize, key: AttachKey, arg: &HandlerArg<'_>) {
        if let Some(a) = self.tools.get_mut(tool) {
            a.tool.before_invoke(key, arg);
        }
    }

    pub(crate) fn after_invoke(&mut self, tool: usize, key: AttachKey, removed: bool) {
        if let Some(a) = self.tools.get_mut(tool) {
            a.tool.after_invoke(key, removed);
        }
    }

    /// Report of every tool, keyed by tool name.
    pub fn report(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .tools
            .iter()
            .map(|a| (a.tool.name().to_string(), a.tool.report()))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ComponentId, HandlerId};

    fn meta(id: u32, comp: &str, ty: &str, kind: HandlerKind) -> HandlerMetadata {
        HandlerMetadata {
            id: HandlerId(id),
            kind,
            component: Some(ComponentId::new(id)),
            component_name: comp.into(),
            component_type: ty.into(),
            label: "port".into(),
        }
    }

    #[test]
    fn test_count_profiler_aggregates_by_component() {
        let mut p = HandlerCountProfiler::new("counts", ProfileLevel::Component);
        let a = p.register_handler(&meta(0, "cpu0", "Core", HandlerKind::Clock));
        let b = p.register_handler(&meta(1, "cpu0", "Core", HandlerKind::Event));
        let c = p.register_handler(&meta(2, "mem", "Memory", HandlerKind::Event));
        assert_eq!(a, b);
        assert_ne!(a, c);

        p.before_invoke(a, &HandlerArg::Cycle(1));
        p.after_invoke(a, false);
        p.before_invoke(b, &HandlerArg::None);
        p.after_invoke(b, true);
        p.before_invoke(c, &HandlerArg::None);

        assert_eq!(p.count("cpu0"), 2);
        assert_eq!(p.count("mem"), 1);
        assert_eq!(p.total(), 3);
        let report = p.report();
        assert_eq!(report["buckets"][0]["removals"], 1);
    }

    #[test]
    fn test_levels() {
        let m = meta(4, "cpu0", "Core", HandlerKind::Clock);
        assert_eq!(ProfileLevel::Handler.bucket_name(&m), "cpu0:port#4");
        assert_eq!(ProfileLevel::Type.bucket_name(&m), "Core");
        assert_eq!(ProfileLevel::Global.bucket_name(&m), "global");
    }

    #[test]
    fn test_time_profiler_records_calls() {
        let mut p = HandlerTimeProfiler::new("time", ProfileLevel::Global);
        let k = p.register_handler(&meta(0, "a", "A", HandlerKind::OneShot));
        p.before_invoke(k, &HandlerArg::None);
        std::thread::sleep(Duration::from_millis(1));
        p.after_invoke(k, false);
        assert!(p.elapsed("global") >= Duration::from_millis(1));
        assert_eq!(p.report()["buckets"][0]["calls"], 1);
    }

    #[test]
    fn test_tools_filter_by_kind() {
        let mut tools = ProfileTools::from_config(&[
            ProfileConfig {
                name: "clocks".into(),
                tool: ProfileToolKind::HandlerCount,
                level: ProfileLevel::Global,
                points: vec![HandlerKind::Clock],
            },
            ProfileConfig {
                name: "all".into(),
                tool: ProfileToolKind::HandlerCount,
                level: ProfileLevel::Global,
                points: vec![],
            },
        ]);
        let keys = tools.register_handler(&meta(0, "a", "A", HandlerKind::Event));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].0, 1);
        let report = tools.report();
        assert!(report.get("clocks").is_some());
        assert!(report.get("all").is_some());
    }
}
