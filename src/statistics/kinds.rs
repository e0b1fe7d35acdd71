//! Statistic collectors.
//!
//! A [`Collector`] is the data half of a statistic: it absorbs values on the
//! hot path, declares its output fields once, and writes them per dump.
//! Built-in kinds are `accumulator`, `histogram`, `uniquecount` and `null`;
//! further kinds are registered by name in [`StatisticKinds`].

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::{EntryWriter, FieldHandle, FieldRegistrar, StatValue};
use crate::component::AsAny;
use crate::error::SimResult;
use crate::params::Params;

/// Data collection behind a [`Statistic`](super::Statistic).
pub trait Collector<T: StatValue>: AsAny {
    /// Kind name as used in configuration.
    fn kind(&self) -> &'static str;

    /// Records `count` occurrences of `value`. Must be O(1).
    fn add(&mut self, value: T, count: u64);

    /// Values collected since the last reset.
    fn count(&self) -> u64;

    /// Declares the output fields. Called once at start of simulation.
    fn register_fields(&mut self, fields: &mut FieldRegistrar<'_>) -> SimResult<()>;

    /// Writes one entry through the handles obtained in `register_fields`.
    fn output(&self, entry: &mut EntryWriter<'_>) -> SimResult<()>;

    fn reset(&mut self);

    fn is_null(&self) -> bool {
        false
    }
}

/// Count, sum, sum of squares, min and max.
#[derive(Debug)]
pub struct Accumulator<T: StatValue> {
    sum: T,
    sum_sq: T,
    min: Option<T>,
    max: Option<T>,
    count: u64,
    handles: Option<[FieldHandle; 5]>,
}

impl<T: StatValue> Default for Accumulator<T> {
    fn default() -> Self {
        Self {
            sum: T::zero(),
            sum_sq: T::zero(),
            min: None,
            max: None,
            count: 0,
            handles: None,
        }
    }
}

impl<T: StatValue> Accumulator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sum(&self) -> T {
        self.sum
    }

    pub fn sum_sq(&self) -> T {
        self.sum_sq
    }

    pub fn min(&self) -> Option<T> {
        self.min
    }

    pub fn max(&self) -> Option<T> {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum.to_f64() / self.count as f64
        }
    }
}

impl<T: StatValue> Collector<T> for Accumulator<T> {
    fn kind(&self) -> &'static str {
        "accumulator"
    }

    #[inline]
    fn add(&mut self, value: T, count: u64) {
        let n = T::from_u64(count);
        self.sum = self.sum.add(value.mul(n));
        self.sum_sq = self.sum_sq.add(value.mul(value).mul(n));
        self.count += count;
        if self.min.map_or(true, |m| value < m) {
            self.min = Some(value);
        }
        if self.max.map_or(true, |m| value > m) {
            self.max = Some(value);
        }
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn register_fields(&mut self, fields: &mut FieldRegistrar<'_>) -> SimResult<()> {
        self.handles = Some([
            fields.register::<T>("Sum"),
            fields.register::<T>("SumSQ"),
            fields.register::<u64>("Count"),
            fields.register::<T>("Min"),
            fields.register::<T>("Max"),
        ]);
        Ok(())
    }

    fn output(&self, entry: &mut EntryWriter<'_>) -> SimResult<()> {
        let Some([sum, sum_sq, count, min, max]) = self.handles else {
            return Ok(());
        };
        entry.write(sum, self.sum)?;
        entry.write(sum_sq, self.sum_sq)?;
        entry.write(count, self.count)?;
        entry.write(min, self.min.unwrap_or_else(T::zero))?;
        entry.write(max, self.max.unwrap_or_else(T::zero))?;
        Ok(())
    }

    fn reset(&mut self) {
        let handles = self.handles.take();
        *self = Self::default();
        self.handles = handles;
    }
}

/// Fixed-width bins starting at `min_value`.
///
/// Parameters: `min_value` (default 0), `bin_width` (default 5),
/// `num_bins` (default 100).
#[derive(Debug)]
pub struct Histogram<T: StatValue> {
    min_value: T,
    bin_width: T,
    bins: Vec<u64>,
    sum: T,
    sum_sq: T,
    collected: u64,
    below: u64,
    above: u64,
    handles: Vec<FieldHandle>,
}

const HISTOGRAM_FIXED_FIELDS: usize = 11;

impl<T: StatValue> Histogram<T> {
    pub fn new(min_value: T, bin_width: T, num_bins: usize) -> Self {
        Self {
            min_value,
            bin_width,
            bins: vec![0; num_bins],
            sum: T::zero(),
            sum_sq: T::zero(),
            collected: 0,
            below: 0,
            above: 0,
            handles: Vec::new(),
        }
    }

    pub fn from_params(params: &Params) -> SimResult<Self> {
        let min_value = params.find("min_value", T::zero())?;
        let bin_width = params.find("bin_width", T::from_u64(5))?;
        let num_bins = params.find("num_bins", 100usize)?;
        if bin_width.to_f64() <= 0.0 {
            return Err(crate::error::SimError::params(format!(
                "histogram bin_width must be positive, got {:?}",
                bin_width
            )));
        }
        Ok(Self::new(min_value, bin_width, num_bins))
    }

    /// Lower bound of bin `i`.
    pub fn bin_start(&self, i: usize) -> T {
        self.min_value.add(T::from_u64(i as u64).mul(self.bin_width))
    }

    /// Upper bound (exclusive) of the last bin.
    pub fn max_value(&self) -> T {
        self.bin_start(self.bins.len())
    }

    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn out_of_bounds(&self) -> (u64, u64) {
        (self.below, self.above)
    }

    pub fn binned(&self) -> u64 {
        self.bins.iter().sum()
    }

    fn bin_index(&self, value: T) -> Option<usize> {
        let offset = (value.to_f64() - self.min_value.to_f64()) / self.bin_width.to_f64();
        if offset < 0.0 {
            None
        } else {
            Some(offset.floor() as usize)
        }
    }
}

impl<T: StatValue> Collector<T> for Histogram<T> {
    fn kind(&self) -> &'static str {
        "histogram"
    }

    fn add(&mut self, value: T, count: u64) {
        let n = T::from_u64(count);
        self.collected += count;
        self.sum = self.sum.add(value.mul(n));
        self.sum_sq = self.sum_sq.add(value.mul(value).mul(n));
        match self.bin_index(value) {
            None => self.below += count,
            Some(i) if i >= self.bins.len() => self.above += count,
            Some(i) => self.bins[i] += count,
        }
    }

    fn count(&self) -> u64 {
        self.collected
    }

    fn register_fields(&mut self, fields: &mut FieldRegistrar<'_>) -> SimResult<()> {
        let mut handles = vec![
            fields.register::<T>("BinsMinValue"),
            fields.register::<T>("BinsMaxValue"),
            fields.register::<T>("BinWidth"),
            fields.register::<u32>("TotalNumBins"),
            fields.register::<T>("Sum"),
            fields.register::<T>("SumSQ"),
            fields.register::<u32>("NumActiveBins"),
            fields.register::<u64>("NumItemsCollected"),
            fields.register::<u64>("NumItemsBinned"),
            fields.register::<u64>("NumOutOfBounds-MinValue"),
            fields.register::<u64>("NumOutOfBounds-MaxValue"),
        ];
        for i in 0..self.bins.len() {
            let name = format!("Bin{}:{:?}-{:?}", i, self.bin_start(i), self.bin_start(i + 1));
            handles.push(fields.register::<u64>(&name));
        }
        self.handles = handles;
        Ok(())
    }

    fn output(&self, entry: &mut EntryWriter<'_>) -> SimResult<()> {
        if self.handles.len() < HISTOGRAM_FIXED_FIELDS {
            return Ok(());
        }
        let h = &self.handles;
        entry.write(h[0], self.min_value)?;
        entry.write(h[1], self.max_value())?;
        entry.write(h[2], self.bin_width)?;
        entry.write(h[3], self.bins.len() as u32)?;
        entry.write(h[4], self.sum)?;
        entry.write(h[5], self.sum_sq)?;
        entry.write(h[6], self.bins.iter().filter(|b| **b > 0).count() as u32)?;
        entry.write(h[7], self.collected)?;
        entry.write(h[8], self.binned())?;
        entry.write(h[9], self.below)?;
        entry.write(h[10], self.above)?;
        for (handle, count) in h[HISTOGRAM_FIXED_FIELDS..].iter().zip(&self.bins) {
            entry.write(*handle, *count)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0);
        self.sum = T::zero();
        self.sum_sq = T::zero();
        self.collected = 0;
        self.below = 0;
        self.above = 0;
    }
}

/// Number of distinct values seen.
#[derive(Debug, Default)]
pub struct UniqueCount {
    seen: HashSet<u64>,
    collected: u64,
    handle: Option<FieldHandle>,
}

impl UniqueCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique(&self) -> u64 {
        self.seen.len() as u64
    }
}

impl<T: StatValue> Collector<T> for UniqueCount {
    fn kind(&self) -> &'static str {
        "uniquecount"
    }

    fn add(&mut self, value: T, count: u64) {
        self.collected += count;
        self.seen.insert(value.key_bits());
    }

    fn count(&self) -> u64 {
        self.collected
    }

    fn register_fields(&mut self, fields: &mut FieldRegistrar<'_>) -> SimResult<()> {
        self.handle = Some(fields.register::<u64>("UniqueItems"));
        Ok(())
    }

    fn output(&self, entry: &mut EntryWriter<'_>) -> SimResult<()> {
        match self.handle {
            Some(handle) => entry.write(handle, self.unique()),
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.collected = 0;
    }
}

/// Discards everything. Used for disabled or unknown statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatistic;

impl<T: StatValue> Collector<T> for NullStatistic {
    fn kind(&self) -> &'static str {
        "null"
    }

    #[inline]
    fn add(&mut self, _value: T, _count: u64) {}

    fn count(&self) -> u64 {
        0
    }

    fn register_fields(&mut self, _fields: &mut FieldRegistrar<'_>) -> SimResult<()> {
        Ok(())
    }

    fn output(&self, _entry: &mut EntryWriter<'_>) -> SimResult<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    fn is_null(&self) -> bool {
        true
    }
}

/// Builds a collector for one value type from its parameters.
pub type CollectorFactory<T> = Arc<dyn Fn(&Params) -> SimResult<Box<dyn Collector<T>>> + Send + Sync>;

/// Table of statistic kinds, keyed by lowercase name and value type.
#[derive(Clone, Default)]
pub struct StatisticKinds {
    custom: HashMap<(String, TypeId), Arc<dyn Any + Send + Sync>>,
}

impl StatisticKinds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom kind for values of type `T`.
    pub fn register<T, F>(&mut self, name: &str, factory: F)
    where
        T: StatValue,
        F: Fn(&Params) -> SimResult<Box<dyn Collector<T>>> + Send + Sync + 'static,
    {
        let factory: CollectorFactory<T> = Arc::new(factory);
        self.custom
            .insert((name.to_ascii_lowercase(), TypeId::of::<T>()), Arc::new(factory));
    }

    pub fn contains<T: StatValue>(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        Self::is_builtin(&name) || self.custom.contains_key(&(name, TypeId::of::<T>()))
    }

    fn is_builtin(name: &str) -> bool {
        matches!(name, "accumulator" | "histogram" | "uniquecount" | "null")
    }

    /// Builds a collector of kind `name`. Returns `Ok(None)` for unknown kinds.
    pub fn build<T: StatValue>(&self, name: &str, params: &Params) -> SimResult<Option<Box<dyn Collector<T>>>> {
        let name = name.to_ascii_lowercase();
        let collector: Box<dyn Collector<T>> = match name.as_str() {
            "accumulator" => Box::new(Accumulator::<T>::new()),
            "histogram" => Box::new(Histogram::<T>::from_params(params)?),
            "uniquecount" => Box::new(UniqueCount::new()),
            "null" => Box::new(NullStatistic),
            _ => {
                let Some(entry) = self.custom.get(&(name, TypeId::of::<T>())) else {
                    return Ok(None);
                };
                match entry.downcast_ref::<CollectorFactory<T>>() {
                    Some(factory) => factory(params)?,
                    None => return Ok(None),
                }
            }
        };
        Ok(Some(collector))
    }

    pub fn custom_len(&self) -> usize {
        self.custom.len()
    }
}

impl fmt::Debug for StatisticKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.custom.keys().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("StatisticKinds").field("custom", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::FieldRegistry;

    #[test]
    fn test_accumulator() {
        let mut acc = Accumulator::<i64>::new();
        acc.add(3, 1);
        acc.add(-2, 2);
        assert_eq!(acc.sum(), -1);
        assert_eq!(acc.sum_sq(), 17);
        assert_eq!(Collector::<i64>::count(&acc), 3);
        assert_eq!(acc.min(), Some(-2));
        assert_eq!(acc.max(), Some(3));
        Collector::<i64>::reset(&mut acc);
        assert_eq!(acc.min(), None);
    }

    #[test]
    fn test_histogram_binning() {
        let mut h = Histogram::<u64>::new(10, 10, 3);
        for v in [5, 10, 19, 20, 39, 40, 100] {
            h.add(v, 1);
        }
        assert_eq!(h.bins(), &[2, 1, 1]);
        assert_eq!(h.out_of_bounds(), (1, 2));
        assert_eq!(h.max_value(), 40);
        assert_eq!(h.binned(), 4);
    }

    #[test]
    fn test_histogram_fields() {
        let mut reg = FieldRegistry::new();
        let mut h = Histogram::<u32>::new(0, 5, 2);
        Collector::<u32>::register_fields(&mut h, &mut FieldRegistrar::new(&mut reg)).unwrap();
        assert_eq!(reg.len(), HISTOGRAM_FIXED_FIELDS + 2);
        assert_eq!(reg.defs()[HISTOGRAM_FIXED_FIELDS].name, "Bin0:0-5");
    }

    #[test]
    fn test_histogram_rejects_zero_width() {
        let params = Params::from_pairs([("bin_width", "0")]);
        assert!(Histogram::<u64>::from_params(&params).is_err());
    }

    #[test]
    fn test_unique_count() {
        let mut u = UniqueCount::new();
        for v in [1u32, 2, 2, 3, 1] {
            Collector::<u32>::add(&mut u, v, 1);
        }
        assert_eq!(u.unique(), 3);
        assert_eq!(Collector::<u32>::count(&u), 5);
    }

    #[test]
    fn test_kind_table() {
        let mut kinds = StatisticKinds::new();
        assert!(kinds.build::<u64>("bogus", &Params::new()).unwrap().is_none());
        kinds.register::<u64, _>("Bogus", |_| Ok(Box::new(Accumulator::<u64>::new())));
        assert!(kinds.contains::<u64>("bogus"));
        assert!(!kinds.contains::<f64>("bogus"));
        let c = kinds.build::<u64>("BOGUS", &Params::new()).unwrap().unwrap();
        assert_eq!(c.kind(), "accumulator");
        assert!(kinds.build::<u64>("null", &Params::new()).unwrap().unwrap().is_null());
    }
}
