//! Time model: unit strings, converters and the time lord.
//!
//! User-visible times are written as an integer or decimal number followed
//! by an SI time unit (`"5ns"`, `"1.5 us"`) or a frequency (`"1GHz"`,
//! `"500MHz"`). The [`TimeLord`] converts them to an integer number of core
//! ticks relative to its time base.
//!
//! # Example
//!
//! ```
//! use simcore::time::TimeLord;
//!
//! let mut lord = TimeLord::new("1ps").unwrap();
//! let tc = lord.get_time_converter("100MHz").unwrap();
//! assert_eq!(tc.factor(), 10_000); // 10 ns period in 1 ps ticks
//! assert_eq!(lord.ticks("5ns").unwrap(), 5_000);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{SimError, SimResult};
use crate::types::SimTime;

/// Whether a parsed quantity is a duration or a frequency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    Time,
    Frequency,
}

const UNITS: &[(&str, UnitKind, i32)] = &[
    ("s", UnitKind::Time, 0),
    ("ms", UnitKind::Time, -3),
    ("us", UnitKind::Time, -6),
    ("µs", UnitKind::Time, -6),
    ("ns", UnitKind::Time, -9),
    ("ps", UnitKind::Time, -12),
    ("fs", UnitKind::Time, -15),
    ("hz", UnitKind::Frequency, 0),
    ("khz", UnitKind::Frequency, 3),
    ("mhz", UnitKind::Frequency, 6),
    ("ghz", UnitKind::Frequency, 9),
    ("thz", UnitKind::Frequency, 12),
];

/// A parsed time or frequency quantity, kept exact as `mantissa × 10^exp10`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAlgebra {
    mantissa: u128,
    exp10: i32,
    kind: UnitKind,
}

impl UnitAlgebra {
    /// Returns the kind of quantity.
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Returns true if the quantity is zero.
    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    /// Approximate value in seconds (time) or hertz (frequency).
    pub fn value_f64(&self) -> f64 {
        self.mantissa as f64 * 10f64.powi(self.exp10)
    }

    /// Exact number of ticks of `base` in this quantity, as a fraction.
    ///
    /// Frequencies are converted to their period first.
    fn ratio_to(&self, base: &UnitAlgebra) -> SimResult<(u128, u128)> {
        if base.kind != UnitKind::Time || base.is_zero() {
            return Err(SimError::time("time base must be a non-zero duration"));
        }
        let (mut num, mut den, exp) = match self.kind {
            // (m × 10^e) / (bm × 10^be)
            UnitKind::Time => (self.mantissa, base.mantissa, self.exp10 - base.exp10),
            // 1 / (m × 10^e × bm × 10^be)
            UnitKind::Frequency => {
                if self.is_zero() {
                    return Err(SimError::temporal("zero frequency has no period"));
                }
                let den = self
                    .mantissa
                    .checked_mul(base.mantissa)
                    .ok_or_else(|| SimError::time("frequency too large to convert"))?;
                (1, den, -(self.exp10 + base.exp10))
            }
        };
        let scale = pow10(exp.unsigned_abs())?;
        if exp >= 0 {
            num = num
                .checked_mul(scale)
                .ok_or_else(|| SimError::time("quantity overflows the time base"))?;
        } else {
            den = den
                .checked_mul(scale)
                .ok_or_else(|| SimError::time("quantity underflows the time base"))?;
        }
        Ok((num, den))
    }

    /// Converts to core ticks of `base`, rounding to the nearest tick.
    ///
    /// A zero duration converts to zero ticks.
    pub fn to_ticks(&self, base: &UnitAlgebra) -> SimResult<SimTime> {
        let (num, den) = self.ratio_to(base)?;
        let rounded = (num + den / 2) / den;
        if num % den != 0 {
            tracing::warn!(
                quantity = %self,
                base = %base,
                ticks = rounded as u64,
                "quantity is not an exact multiple of the time base; rounding"
            );
        }
        if rounded > SimTime::MAX as u128 {
            return Err(SimError::time(format!("{} overflows 64-bit simulation time", self)));
        }
        Ok(rounded as SimTime)
    }
}

fn pow10(exp: u32) -> SimResult<u128> {
    10u128
        .checked_pow(exp)
        .ok_or_else(|| SimError::time(format!("exponent 10^{} out of range", exp)))
}

impl FromStr for UnitAlgebra {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let split = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| SimError::time(format!("'{}' has no unit", s)))?;
        let (number, unit) = text.split_at(split);
        let unit = unit.trim().to_lowercase();
        if number.is_empty() {
            return Err(SimError::time(format!("'{}' has no numeric value", s)));
        }

        let (kind, unit_exp) = UNITS
            .iter()
            .find(|(name, _, _)| *name == unit)
            .map(|(_, kind, exp)| (*kind, *exp))
            .ok_or_else(|| SimError::time(format!("unknown unit '{}' in '{}'", unit, s)))?;

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if frac_part.contains('.') || (int_part.is_empty() && frac_part.is_empty()) {
            return Err(SimError::time(format!("malformed number in '{}'", s)));
        }
        let digits: String = format!("{}{}", int_part, frac_part);
        let mantissa: u128 = digits
            .parse()
            .map_err(|_| SimError::time(format!("malformed number in '{}'", s)))?;

        Ok(Self {
            mantissa,
            exp10: unit_exp - frac_part.len() as i32,
            kind,
        })
    }
}

impl fmt::Display for UnitAlgebra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.kind {
            UnitKind::Time => "s",
            UnitKind::Frequency => "Hz",
        };
        write!(f, "{}e{} {}", self.mantissa, self.exp10, unit)
    }
}

/// Converts between a component-visible period and core ticks.
///
/// A converter is a fixed integer number of core ticks per unit; clocks use
/// it as their period and links use it as the unit of extra send latency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeConverter {
    factor: SimTime,
}

impl TimeConverter {
    /// Creates a converter of `factor` core ticks per unit.
    pub fn from_factor(factor: SimTime) -> SimResult<Self> {
        if factor == 0 {
            return Err(SimError::temporal("time converter with zero period"));
        }
        Ok(Self { factor })
    }

    /// The converter whose unit is one core tick.
    pub fn core() -> Self {
        Self { factor: 1 }
    }

    /// Core ticks per unit.
    pub fn factor(&self) -> SimTime {
        self.factor
    }

    /// Converts a count of units into core ticks.
    pub fn convert_to_core_time(&self, units: u64) -> SimResult<SimTime> {
        units
            .checked_mul(self.factor)
            .ok_or_else(|| SimError::temporal(format!("{} units of {} ticks overflows", units, self.factor)))
    }

    /// Converts core ticks into whole units (truncating).
    pub fn convert_from_core_time(&self, time: SimTime) -> u64 {
        time / self.factor
    }
}

/// Owns the time base and hands out time converters.
#[derive(Debug, Clone)]
pub struct TimeLord {
    base_text: String,
    base: UnitAlgebra,
    cache: HashMap<String, TimeConverter>,
}

impl TimeLord {
    /// Creates a time lord whose core tick is `base` (e.g. `"1ps"`).
    pub fn new(base: &str) -> SimResult<Self> {
        let parsed: UnitAlgebra = base.parse()?;
        if parsed.kind != UnitKind::Time || parsed.is_zero() {
            return Err(SimError::time(format!("time base '{}' must be a non-zero duration", base)));
        }
        Ok(Self {
            base_text: base.trim().to_string(),
            base: parsed,
            cache: HashMap::new(),
        })
    }

    /// The configured time base string.
    pub fn time_base(&self) -> &str {
        &self.base_text
    }

    /// Returns a converter for a period or frequency string.
    ///
    /// Fails if the string is malformed or converts to zero ticks.
    pub fn get_time_converter(&mut self, text: &str) -> SimResult<TimeConverter> {
        if let Some(tc) = self.cache.get(text) {
            return Ok(*tc);
        }
        let ticks = self.ticks(text)?;
        let tc = TimeConverter::from_factor(ticks).map_err(|_| {
            SimError::temporal(format!("'{}' is shorter than the time base {}", text, self.base_text))
        })?;
        self.cache.insert(text.to_string(), tc);
        Ok(tc)
    }

    /// Returns a converter of `factor` core ticks.
    pub fn get_time_converter_from_factor(&self, factor: SimTime) -> SimResult<TimeConverter> {
        TimeConverter::from_factor(factor)
    }

    /// Converts a time or frequency string to core ticks (zero allowed).
    pub fn ticks(&self, text: &str) -> SimResult<SimTime> {
        let parsed: UnitAlgebra = text.parse()?;
        parsed.to_ticks(&self.base)
    }

    /// Converts core ticks to seconds.
    pub fn to_seconds(&self, time: SimTime) -> f64 {
        time as f64 * self.base.value_f64()
    }

    /// Renders a simulation time in the largest SI unit that represents it exactly.
    pub fn format_time(&self, time: SimTime) -> String {
        const NAMES: &[(i32, &str)] = &[(0, "s"), (-3, "ms"), (-6, "us"), (-9, "ns"), (-12, "ps"), (-15, "fs")];
        if time == 0 {
            return "0 s".to_string();
        }
        let mantissa = time as u128 * self.base.mantissa;
        let exp = self.base.exp10;
        for &(unit_exp, name) in NAMES {
            let shift = exp - unit_exp;
            if shift >= 0 {
                if let Ok(scale) = pow10(shift as u32) {
                    if let Some(v) = mantissa.checked_mul(scale) {
                        return format!("{} {}", v, name);
                    }
                }
            } else if let Ok(scale) = pow10((-shift) as u32) {
                if mantissa % scale == 0 {
                    return format!("{} {}", mantissa / scale, name);
                }
            }
        }
        format!("{} ticks", time)
    }
}

/// Tick boundary helpers shared by clocks and statistics.
pub mod align {
    use crate::types::SimTime;

    /// Rounds `time` up to a multiple of `period`.
    #[inline]
    pub fn ceil_to_tick(time: SimTime, period: SimTime) -> SimTime {
        if period == 0 || time == 0 {
            return time;
        }
        time.div_ceil(period) * period
    }

    /// Rounds `time` down to a multiple of `period`.
    #[inline]
    pub fn floor_to_tick(time: SimTime, period: SimTime) -> SimTime {
        if period == 0 {
            return time;
        }
        (time / period) * period
    }

    /// Returns true if `time` falls exactly on a multiple of `period`.
    #[inline]
    pub fn is_on_boundary(time: SimTime, period: SimTime) -> bool {
        period == 0 || time % period == 0
    }

    /// Returns the first multiple of `period` strictly after `time`.
    #[inline]
    pub fn next_tick_boundary(time: SimTime, period: SimTime) -> SimTime {
        if period == 0 {
            return time;
        }
        ((time / period) + 1) * period
    }

    /// Number of complete periods elapsed at `time`.
    #[inline]
    pub fn tick_number(time: SimTime, period: SimTime) -> u64 {
        if period == 0 {
            return 0;
        }
        time / period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_units() {
        let lord = TimeLord::new("1ps").unwrap();
        assert_eq!(lord.ticks("5ns").unwrap(), 5_000);
        assert_eq!(lord.ticks("1us").unwrap(), 1_000_000);
        assert_eq!(lord.ticks("2ms").unwrap(), 2_000_000_000);
        assert_eq!(lord.ticks("1s").unwrap(), 1_000_000_000_000);
        assert_eq!(lord.ticks("1.5 ns").unwrap(), 1_500);
        assert_eq!(lord.ticks("0ns").unwrap(), 0);
    }

    #[test]
    fn test_parse_frequencies() {
        let lord = TimeLord::new("1ps").unwrap();
        assert_eq!(lord.ticks("1GHz").unwrap(), 1_000);
        assert_eq!(lord.ticks("500MHz").unwrap(), 2_000);
        assert_eq!(lord.ticks("25kHz").unwrap(), 40_000_000);
        assert_eq!(lord.ticks("100MHz").unwrap(), 10_000);
    }

    #[test]
    fn test_inexact_frequency_rounds() {
        let lord = TimeLord::new("1ps").unwrap();
        // 3 GHz = 333.33 ps
        assert_eq!(lord.ticks("3GHz").unwrap(), 333);
    }

    #[test]
    fn test_invalid_strings() {
        let lord = TimeLord::new("1ps").unwrap();
        assert!(lord.ticks("5").is_err());
        assert!(lord.ticks("ns").is_err());
        assert!(lord.ticks("5 parsecs").is_err());
        assert!(lord.ticks("1.2.3ns").is_err());
        assert!(lord.ticks("0Hz").unwrap_err().is_temporal());
        assert!(TimeLord::new("1GHz").is_err());
    }

    #[test]
    fn test_time_converter_zero_period() {
        let mut lord = TimeLord::new("1ns").unwrap();
        let err = lord.get_time_converter("1ps").unwrap_err();
        assert!(err.is_temporal());
        assert!(TimeConverter::from_factor(0).is_err());
    }

    #[test]
    fn test_time_converter_conversions() {
        let mut lord = TimeLord::new("1ps").unwrap();
        let tc = lord.get_time_converter("1ns").unwrap();
        assert_eq!(tc.convert_to_core_time(5).unwrap(), 5_000);
        assert_eq!(tc.convert_from_core_time(5_999), 5);
        // Cached
        assert_eq!(lord.get_time_converter("1ns").unwrap(), tc);
    }

    #[test]
    fn test_format_time() {
        let lord = TimeLord::new("1ps").unwrap();
        assert_eq!(lord.format_time(1_000_000_000), "1 ms");
        assert_eq!(lord.format_time(1_500), "1500 ps");
        assert_eq!(lord.format_time(5_000), "5 ns");
        assert_eq!(lord.format_time(0), "0 s");
        assert!((lord.to_seconds(1_000_000_000_000) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align::next_tick_boundary(0, 10), 10);
        assert_eq!(align::next_tick_boundary(103, 10), 110);
        assert_eq!(align::next_tick_boundary(100, 10), 110);
        assert_eq!(align::ceil_to_tick(103, 10), 110);
        assert_eq!(align::ceil_to_tick(100, 10), 100);
        assert_eq!(align::floor_to_tick(103, 10), 100);
        assert!(align::is_on_boundary(100, 10));
        assert!(!align::is_on_boundary(103, 10));
        assert_eq!(align::tick_number(15, 10), 1);
    }
}
