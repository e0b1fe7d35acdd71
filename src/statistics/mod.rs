//! Statistics collection and output.
//!
//! A component registers a [`Statistic<T>`] and feeds it with
//! [`Statistic::add_data`]. At start of simulation every statistic declares
//! its output fields; each output assigns dense [`FieldHandle`]s to
//! `(field name, type)` pairs, shared by every statistic that declares the
//! same field. Dumps then write values through the handles, one entry per
//! statistic.
//!
//! - [`kinds`]: accumulator, histogram, unique-count and null collectors,
//!   plus the table of custom kinds.
//! - [`output`]: text, CSV and JSON-lines formatters over plain, gzip or
//!   in-memory sinks.
//! - [`engine`]: registration, grouping, level gating and dump scheduling.
//!
//! # Example
//!
//! ```
//! use simcore::params::Params;
//! use simcore::statistics::engine::StatisticsEngine;
//! use simcore::statistics::output::{CsvOutput, OutputSink, SharedBuffer};
//! use simcore::types::RankInfo;
//!
//! let buffer = SharedBuffer::new();
//! let mut engine = StatisticsEngine::new(1, RankInfo::single());
//! engine.add_output("csv", Box::new(CsvOutput::new(OutputSink::Memory(buffer.clone()))));
//!
//! let stat = engine
//!     .register::<u64>("cpu0", "Core", "latency", "", &Params::new())
//!     .unwrap();
//! stat.add_data(4);
//! stat.add_data(6);
//!
//! engine.start_of_simulation().unwrap();
//! engine.finish(1000).unwrap();
//! assert!(buffer.contents().contains("cpu0,latency,,accumulator,1000,0,10,52,2,4,6"));
//! ```

pub mod engine;
pub mod kinds;
pub mod output;

use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{SimError, SimResult};
use crate::params::ParamValue;

pub use engine::{StatisticGroup, StatisticsEngine};
pub use kinds::{Accumulator, Collector, Histogram, NullStatistic, StatisticKinds, UniqueCount};
pub use output::{CsvOutput, EntryHeader, JsonOutput, OutputSink, SharedBuffer, StatisticOutput, TextOutput};

/// Element type of an output field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::U32 => "u32",
            FieldType::U64 => "u64",
            FieldType::I32 => "i32",
            FieldType::I64 => "i64",
            FieldType::F32 => "f32",
            FieldType::F64 => "f64",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single field value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::U32(_) => FieldType::U32,
            FieldValue::U64(_) => FieldType::U64,
            FieldValue::I32(_) => FieldType::I32,
            FieldValue::I64(_) => FieldType::I64,
            FieldValue::F32(_) => FieldType::F32,
            FieldValue::F64(_) => FieldType::F64,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match *self {
            FieldValue::U32(v) => v.into(),
            FieldValue::U64(v) => v.into(),
            FieldValue::I32(v) => v.into(),
            FieldValue::I64(v) => v.into(),
            FieldValue::F32(v) => serde_json::Number::from_f64(v as f64).map_or(serde_json::Value::Null, Into::into),
            FieldValue::F64(v) => serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, Into::into),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::U32(v) => write!(f, "{}", v),
            FieldValue::U64(v) => write!(f, "{}", v),
            FieldValue::I32(v) => write!(f, "{}", v),
            FieldValue::I64(v) => write!(f, "{}", v),
            FieldValue::F32(v) => write!(f, "{}", v),
            FieldValue::F64(v) => write!(f, "{}", v),
        }
    }
}

/// Numeric types a statistic can collect.
pub trait StatValue: Copy + PartialOrd + fmt::Debug + ParamValue + 'static {
    const FIELD_TYPE: FieldType;

    fn zero() -> Self;

    /// Addition; wraps for integers.
    fn add(self, other: Self) -> Self;

    /// Multiplication; wraps for integers.
    fn mul(self, other: Self) -> Self;

    fn from_u64(n: u64) -> Self;

    fn to_f64(self) -> f64;

    fn to_field(self) -> FieldValue;

    /// Bit pattern used to test equality of values, including floats.
    fn key_bits(self) -> u64;
}

macro_rules! int_stat_value {
    ($ty:ty, $ft:ident, $fv:ident) => {
        impl StatValue for $ty {
            const FIELD_TYPE: FieldType = FieldType::$ft;

            fn zero() -> Self {
                0
            }

            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            fn mul(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }

            fn from_u64(n: u64) -> Self {
                n as $ty
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn to_field(self) -> FieldValue {
                FieldValue::$fv(self)
            }

            fn key_bits(self) -> u64 {
                self as u64
            }
        }
    };
}

int_stat_value!(u32, U32, U32);
int_stat_value!(u64, U64, U64);
int_stat_value!(i32, I32, I32);
int_stat_value!(i64, I64, I64);

macro_rules! float_stat_value {
    ($ty:ty, $ft:ident, $fv:ident) => {
        impl StatValue for $ty {
            const FIELD_TYPE: FieldType = FieldType::$ft;

            fn zero() -> Self {
                0.0
            }

            fn add(self, other: Self) -> Self {
                self + other
            }

            fn mul(self, other: Self) -> Self {
                self * other
            }

            fn from_u64(n: u64) -> Self {
                n as $ty
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn to_field(self) -> FieldValue {
                FieldValue::$fv(self)
            }

            fn key_bits(self) -> u64 {
                self.to_bits() as u64
            }
        }
    };
}

float_stat_value!(f32, F32, F32);
float_stat_value!(f64, F64, F64);

/// Dense handle of a registered output field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldHandle(pub u32);

/// A registered output field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
}

impl FieldDef {
    /// Column title, e.g. `Sum.u64`.
    pub fn column(&self) -> String {
        format!("{}.{}", self.name, self.ty)
    }
}

/// Field handles of one output, in registration order.
#[derive(Debug, Default)]
pub struct FieldRegistry {
    defs: Vec<FieldDef>,
    index: HashMap<(String, FieldType), FieldHandle>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `(name, ty)`, registering it on first use.
    pub fn register(&mut self, name: &str, ty: FieldType) -> FieldHandle {
        if let Some(handle) = self.index.get(&(name.to_string(), ty)) {
            return *handle;
        }
        let handle = FieldHandle(self.defs.len() as u32);
        self.defs.push(FieldDef {
            name: name.to_string(),
            ty,
        });
        self.index.insert((name.to_string(), ty), handle);
        handle
    }

    pub fn defs(&self) -> &[FieldDef] {
        &self.defs
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Passed to collectors while they declare their fields.
pub struct FieldRegistrar<'a> {
    registry: &'a mut FieldRegistry,
}

impl<'a> FieldRegistrar<'a> {
    pub fn new(registry: &'a mut FieldRegistry) -> Self {
        Self { registry }
    }

    /// Declares a field holding values of type `V`.
    pub fn register<V: StatValue>(&mut self, name: &str) -> FieldHandle {
        self.registry.register(name, V::FIELD_TYPE)
    }

    /// Declares a field of an explicit type.
    pub fn register_typed(&mut self, name: &str, ty: FieldType) -> FieldHandle {
        self.registry.register(name, ty)
    }
}

/// Passed to collectors while they write one entry.
pub struct EntryWriter<'a> {
    output: &'a mut dyn StatisticOutput,
}

impl<'a> EntryWriter<'a> {
    pub fn new(output: &'a mut dyn StatisticOutput) -> Self {
        Self { output }
    }

    pub fn write<V: StatValue>(&mut self, handle: FieldHandle, value: V) -> SimResult<()> {
        self.output.output_field(handle, value.to_field())
    }

    pub fn write_value(&mut self, handle: FieldHandle, value: FieldValue) -> SimResult<()> {
        self.output.output_field(handle, value)
    }
}

/// Identity and options of a registered statistic.
#[derive(Clone, Debug)]
pub struct StatInfo {
    pub component: String,
    pub component_type: String,
    pub name: String,
    pub sub_id: String,
    pub kind: String,
    pub level: u8,
    pub reset_on_output: bool,
}

pub(crate) struct StatCell<T: StatValue> {
    info: StatInfo,
    enabled: bool,
    collector: Box<dyn Collector<T>>,
}

/// Type-erased view the engine uses for dumps.
pub(crate) trait ErasedStatistic {
    fn info(&self) -> &StatInfo;
    fn is_enabled(&self) -> bool;
    fn is_null(&self) -> bool;
    fn register_fields(&mut self, registrar: &mut FieldRegistrar<'_>) -> SimResult<()>;
    fn output(&self, writer: &mut EntryWriter<'_>) -> SimResult<()>;
    fn reset(&mut self);
}

impl<T: StatValue> ErasedStatistic for StatCell<T> {
    fn info(&self) -> &StatInfo {
        &self.info
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_null(&self) -> bool {
        self.collector.is_null()
    }

    fn register_fields(&mut self, registrar: &mut FieldRegistrar<'_>) -> SimResult<()> {
        self.collector.register_fields(registrar)
    }

    fn output(&self, writer: &mut EntryWriter<'_>) -> SimResult<()> {
        self.collector.output(writer)
    }

    fn reset(&mut self) {
        self.collector.reset();
    }
}

/// Handle to a registered statistic.
///
/// Cloning the handle shares the statistic.
pub struct Statistic<T: StatValue> {
    cell: Rc<RefCell<StatCell<T>>>,
}

impl<T: StatValue> Clone for Statistic<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: StatValue> Statistic<T> {
    pub(crate) fn new(info: StatInfo, collector: Box<dyn Collector<T>>) -> Self {
        Self {
            cell: Rc::new(RefCell::new(StatCell {
                info,
                enabled: true,
                collector,
            })),
        }
    }

    /// A statistic that discards everything.
    pub fn null(info: StatInfo) -> Self {
        Self::new(info, Box::new(NullStatistic))
    }

    pub(crate) fn erased(&self) -> Rc<RefCell<dyn ErasedStatistic>> {
        self.cell.clone()
    }

    /// Records one value.
    #[inline]
    pub fn add_data(&self, value: T) {
        self.add_data_n(value, 1);
    }

    /// Records `count` occurrences of `value`.
    #[inline]
    pub fn add_data_n(&self, value: T, count: u64) {
        let mut cell = self.cell.borrow_mut();
        if cell.enabled {
            cell.collector.add(value, count);
        }
    }

    pub fn enable(&self) {
        self.cell.borrow_mut().enabled = true;
    }

    pub fn disable(&self) {
        self.cell.borrow_mut().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.cell.borrow().enabled
    }

    pub fn is_null(&self) -> bool {
        self.cell.borrow().collector.is_null()
    }

    /// Number of values collected since the last reset.
    pub fn count(&self) -> u64 {
        self.cell.borrow().collector.count()
    }

    pub fn info(&self) -> StatInfo {
        self.cell.borrow().info.clone()
    }

    /// Borrows the collector as its concrete type.
    pub fn collector<C: Collector<T>>(&self) -> Option<Ref<'_, C>> {
        Ref::filter_map(self.cell.borrow(), |cell| (*cell.collector).as_any().downcast_ref::<C>()).ok()
    }
}

impl<T: StatValue> fmt::Debug for Statistic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.borrow();
        f.debug_struct("Statistic")
            .field("component", &cell.info.component)
            .field("name", &cell.info.name)
            .field("kind", &cell.info.kind)
            .field("enabled", &cell.enabled)
            .finish()
    }
}

#[track_caller]
pub(crate) fn unknown_handle(handle: FieldHandle, registered: usize) -> SimError {
    SimError::statistic(format!(
        "write through unregistered field handle {} ({} fields registered)",
        handle.0, registered
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_registry_shares_handles() {
        let mut reg = FieldRegistry::new();
        let a = reg.register("Sum", FieldType::U64);
        let b = reg.register("Count", FieldType::U64);
        let c = reg.register("Sum", FieldType::U64);
        let d = reg.register("Sum", FieldType::F64);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_ne!(a, d);
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.defs()[2].column(), "Sum.f64");
    }

    #[test]
    fn test_stat_value_ops() {
        assert_eq!(u32::MAX.add(1), 0);
        assert_eq!(3i64.mul(-2), -6);
        assert_eq!(2.5f64.to_field(), FieldValue::F64(2.5));
        assert_eq!(u64::FIELD_TYPE.name(), "u64");
        assert_ne!(1.0f32.key_bits(), 2.0f32.key_bits());
    }

    #[test]
    fn test_statistic_handle_enable_disable() {
        let info = StatInfo {
            component: "c".into(),
            component_type: "T".into(),
            name: "s".into(),
            sub_id: String::new(),
            kind: "accumulator".into(),
            level: 1,
            reset_on_output: false,
        };
        let stat: Statistic<u64> = Statistic::new(info, Box::new(Accumulator::<u64>::new()));
        stat.add_data(3);
        stat.disable();
        stat.add_data(100);
        stat.enable();
        stat.add_data_n(1, 2);
        assert_eq!(stat.count(), 3);
        let acc = stat.collector::<Accumulator<u64>>().unwrap();
        assert_eq!(acc.sum(), 5);
        assert!(!stat.is_null());
    }

    #[test]
    fn test_field_value_json() {
        assert_eq!(FieldValue::U32(3).to_json(), serde_json::json!(3));
        assert_eq!(FieldValue::F64(f64::NAN).to_json(), serde_json::Value::Null);
    }
}
