//! Value-representation adapters (spec.md §3/§4.3): `uint`, `int`, `bit`,
//! `scalar`, `lut`, `enum`, `bit_mux`, `pos_mux`, `position`, `time`. Each
//! type converts between the textual protocol and a raw 32-bit register
//! value; some also contribute extra attributes (`RAW`, `SCALE`, `OFFSET`,
//! `UNITS`, ...) that read or mutate type-local per-instance state.
//!
//! spec.md §4.3 describes types as binding to "a Register accessor
//! interface exposing `read`/`write`/`changed`". The teacher's Design Notes
//! (§9) flag the source's `void *owner, void *data` threading as exactly
//! the pattern a clean rewrite should avoid; here every type that needs
//! register access is handed a clone of the same concrete [`RawValues`]
//! the owning class instance uses as its cache, instead of a trait object.
//! There is only ever one real implementation of "the register accessor" in
//! this codebase (the field's own per-instance raw-value cache), so a
//! concrete shared type is simpler than a trait with a single impl.

use std::sync::Arc;

use crate::attributes::AttrOps;
use crate::attributes::Attribute;
use crate::change::ChangeClock;
use crate::change::Tracked;
use crate::error::CommandError;
use crate::error::CommandResult;
use crate::mux::MuxTable;
use crate::names::LabelSet;
use sync::Mutex;

/// The per-instance cached raw register value a register-bound class
/// shares with its `Type`. This *is* spec.md §4.3's "Register accessor":
/// `read`/`write` map directly to it, and `changed` is `touch`.
pub struct RawValues {
    slots: Mutex<Vec<Tracked<u32>>>,
    clock: Arc<ChangeClock>,
}

impl RawValues {
    pub fn new(count: usize, clock: Arc<ChangeClock>) -> Arc<Self> {
        Arc::new(RawValues {
            slots: Mutex::new((0..count).map(|_| Tracked::new(0)).collect()),
            clock,
        })
    }

    pub fn read(&self, n: u32) -> u32 {
        *self.slots.lock()[n as usize].get()
    }

    pub fn write(&self, n: u32, value: u32) {
        self.slots.lock()[n as usize].set(value, &self.clock);
    }

    /// Bumps the change index without altering the raw value — used when a
    /// type-local attribute (e.g. `UNITS`) changes in a way that affects
    /// the formatted value without touching the register (spec.md §9:
    /// "the spec treats any UNITS change as a publishable event").
    pub fn changed(&self, n: u32) {
        self.slots.lock()[n as usize].touch(&self.clock);
    }

    pub fn update_index(&self, n: u32) -> u64 {
        self.slots.lock()[n as usize].update_index()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// A value-representation adapter bound to a field's raw register cache.
pub trait FieldType: Send + Sync {
    /// Parses client-supplied text into the raw 32-bit value that should be
    /// written to the register.
    fn parse(&self, n: u32, input: &str) -> CommandResult<u32>;
    /// Formats a raw register value for the client.
    fn format(&self, n: u32, raw: u32) -> String;
    fn get_enumeration(&self) -> Option<LabelSet> {
        None
    }
    /// Extra attributes this type contributes (`RAW`, `SCALE`, ...), given
    /// the shared raw-value cache it was bound to.
    fn attributes(&self, _raw: Arc<RawValues>) -> Vec<(String, Attribute)> {
        Vec::new()
    }
}

fn parse_error(what: &str, input: &str) -> CommandError {
    CommandError::other(format!("invalid {what}: '{input}'"))
}

// ---------------------------------------------------------------------
// uint / int / bit / lut — plain integer encodings, no extra attributes.
// ---------------------------------------------------------------------

pub struct UintType;

impl FieldType for UintType {
    fn parse(&self, _n: u32, input: &str) -> CommandResult<u32> {
        input.trim().parse::<u32>().map_err(|_| parse_error("uint", input))
    }

    fn format(&self, _n: u32, raw: u32) -> String {
        raw.to_string()
    }
}

pub struct IntType;

impl FieldType for IntType {
    fn parse(&self, _n: u32, input: &str) -> CommandResult<u32> {
        let value = input.trim().parse::<i64>().map_err(|_| parse_error("int", input))?;
        if !(i32::MIN as i64..=i32::MAX as i64).contains(&value) {
            return Err(parse_error("int", input));
        }
        Ok(value as i32 as u32)
    }

    fn format(&self, _n: u32, raw: u32) -> String {
        (raw as i32).to_string()
    }
}

pub struct BitType;

impl FieldType for BitType {
    fn parse(&self, _n: u32, input: &str) -> CommandResult<u32> {
        match input.trim() {
            "0" => Ok(0),
            "1" => Ok(1),
            _ => Err(parse_error("bit", input)),
        }
    }

    fn format(&self, _n: u32, raw: u32) -> String {
        if raw != 0 { "1".to_string() } else { "0".to_string() }
    }
}

pub struct LutType;

impl FieldType for LutType {
    fn parse(&self, _n: u32, input: &str) -> CommandResult<u32> {
        let input = input.trim();
        let hex = input.strip_prefix("0x").ok_or_else(|| parse_error("lut", input))?;
        u32::from_str_radix(hex, 16).map_err(|_| parse_error("lut", input))
    }

    fn format(&self, _n: u32, raw: u32) -> String {
        format!("0x{raw:08X}")
    }
}

// ---------------------------------------------------------------------
// scalar / position — scaled integers with a `RAW` attribute.
// ---------------------------------------------------------------------

struct ScaleState {
    scale: f64,
    offset: f64,
    units: String,
}

/// `scalar`: `raw*scale + offset`, formatted with 12 significant digits;
/// `RAW` exposes the unscaled integer (spec.md §4.3).
pub struct ScalarType {
    state: Mutex<Vec<ScaleState>>,
}

impl ScalarType {
    pub fn new(count: usize, scale: f64, offset: f64, units: impl Into<String>) -> Self {
        let units = units.into();
        ScalarType {
            state: Mutex::new(
                (0..count)
                    .map(|_| ScaleState { scale, offset, units: units.clone() })
                    .collect(),
            ),
        }
    }

    fn scaled(&self, n: u32, raw: i32) -> f64 {
        let state = self.state.lock();
        let s = &state[n as usize];
        raw as f64 * s.scale + s.offset
    }
}

fn format_significant(value: f64, digits: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (digits as i32 - 1 - magnitude).max(0) as usize;
    let formatted = format!("{value:.decimals$}");
    // Trim trailing zeros but keep at least one digit after the point only
    // if the point survives trimming.
    if formatted.contains('.') {
        let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
        trimmed.to_string()
    } else {
        formatted
    }
}

impl FieldType for ScalarType {
    fn parse(&self, n: u32, input: &str) -> CommandResult<u32> {
        let value: f64 = input.trim().parse().map_err(|_| parse_error("scalar", input))?;
        let state = self.state.lock();
        let s = &state[n as usize];
        let raw = ((value - s.offset) / s.scale).round();
        if !(i32::MIN as f64..=i32::MAX as f64).contains(&raw) {
            return Err(CommandError::PositionOutOfRange);
        }
        Ok(raw as i32 as u32)
    }

    fn format(&self, n: u32, raw: u32) -> String {
        format_significant(self.scaled(n, raw as i32), 12)
    }

    fn attributes(&self, raw_values: Arc<RawValues>) -> Vec<(String, Attribute)> {
        let rv = raw_values.clone();
        let format = move |n: u32| Ok((rv.read(n) as i32).to_string());
        vec![(
            "RAW".to_string(),
            Attribute::new(
                "RAW".to_string(),
                "Underlying register value without scaling".to_string(),
                true,
                true,
                AttrOps::format(format),
            ),
        )]
    }
}

/// `position`: `(input - offset) / scale` rounded half-to-even into
/// `int32`; out-of-range values fail (spec.md §4.3).
pub struct PositionType {
    state: Mutex<Vec<ScaleState>>,
}

impl PositionType {
    pub fn new(count: usize, scale: f64, offset: f64, units: impl Into<String>) -> Self {
        let units = units.into();
        PositionType {
            state: Mutex::new(
                (0..count)
                    .map(|_| ScaleState { scale, offset, units: units.clone() })
                    .collect(),
            ),
        }
    }
}

fn round_half_to_even(value: f64) -> f64 {
    let floor = value.floor();
    let diff = value - floor;
    if diff < 0.5 {
        floor
    } else if diff > 0.5 {
        floor + 1.0
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

impl FieldType for PositionType {
    fn parse(&self, n: u32, input: &str) -> CommandResult<u32> {
        let value: f64 = input.trim().parse().map_err(|_| parse_error("position", input))?;
        let state = self.state.lock();
        let s = &state[n as usize];
        let raw = round_half_to_even((value - s.offset) / s.scale);
        if !(i32::MIN as f64..=i32::MAX as f64).contains(&raw) {
            return Err(CommandError::PositionOutOfRange);
        }
        Ok(raw as i32 as u32)
    }

    fn format(&self, n: u32, raw: u32) -> String {
        let state = self.state.lock();
        let s = &state[n as usize];
        let value = raw as i32 as f64 * s.scale + s.offset;
        format_significant(value, 12)
    }

    fn attributes(&self, raw_values: Arc<RawValues>) -> Vec<(String, Attribute)> {
        let rv = raw_values;
        let format = move |n: u32| Ok((rv.read(n) as i32).to_string());
        vec![(
            "RAW".to_string(),
            Attribute::new(
                "RAW".to_string(),
                "Underlying register value without scaling".to_string(),
                true,
                true,
                AttrOps::format(format),
            ),
        )]
    }
}

// ---------------------------------------------------------------------
// enum — static (fixed list) or dynamic (config-loaded) label set.
// ---------------------------------------------------------------------

pub struct EnumType {
    labels: LabelSet,
}

impl EnumType {
    pub fn new_static(labels: &[impl AsRef<str>]) -> Self {
        EnumType { labels: LabelSet::from_static(labels) }
    }

    pub fn new_dynamic(labels: LabelSet) -> Self {
        EnumType { labels }
    }
}

impl FieldType for EnumType {
    fn parse(&self, _n: u32, input: &str) -> CommandResult<u32> {
        self.labels.index_of(input.trim()).ok_or(CommandError::MuxSelectorNotKnown)
    }

    fn format(&self, _n: u32, raw: u32) -> String {
        self.labels.name_of(raw).map(str::to_string).unwrap_or_default()
    }

    fn get_enumeration(&self) -> Option<LabelSet> {
        Some(self.labels.clone())
    }
}

// ---------------------------------------------------------------------
// bit_mux / pos_mux — selectors into the global mux enumerations.
// ---------------------------------------------------------------------

/// Looks a `blockN.field` name up in the global bit-bus or position-bus
/// enumeration and writes its index to the selector register (spec.md
/// §4.7).
pub struct MuxType {
    table: Arc<MuxTable>,
}

impl MuxType {
    pub fn new(table: Arc<MuxTable>) -> Self {
        MuxType { table }
    }
}

impl FieldType for MuxType {
    fn parse(&self, _n: u32, input: &str) -> CommandResult<u32> {
        self.table.index_of(input.trim()).ok_or(CommandError::MuxSelectorNotKnown)
    }

    fn format(&self, _n: u32, raw: u32) -> String {
        self.table.name_of(raw).unwrap_or_default()
    }

    fn get_enumeration(&self) -> Option<LabelSet> {
        Some(self.table.snapshot())
    }
}

// ---------------------------------------------------------------------
// time — ticks-per-unit scaled floating point (spec.md §4.3/§4.8 for the
// paired-register *class*; this is the plain 32-bit *type* variant used by
// fields that are a single register, not the 48-bit time class).
// ---------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeUnit {
    Min,
    Sec,
    Milli,
    Micro,
}

impl TimeUnit {
    pub fn ticks_per_unit(self) -> f64 {
        let secs = match self {
            TimeUnit::Min => 60.0,
            TimeUnit::Sec => 1.0,
            TimeUnit::Milli => 1e-3,
            TimeUnit::Micro => 1e-6,
        };
        secs * crate::hardware::CLOCK_FREQUENCY as f64
    }

    pub fn name(self) -> &'static str {
        match self {
            TimeUnit::Min => "min",
            TimeUnit::Sec => "s",
            TimeUnit::Milli => "ms",
            TimeUnit::Micro => "us",
        }
    }

    pub fn from_name(name: &str) -> Option<TimeUnit> {
        match name {
            "min" => Some(TimeUnit::Min),
            "s" => Some(TimeUnit::Sec),
            "ms" => Some(TimeUnit::Milli),
            "us" => Some(TimeUnit::Micro),
            _ => None,
        }
    }
}

pub struct TimeType {
    units: Mutex<Vec<TimeUnit>>,
}

impl TimeType {
    pub fn new(count: usize, default_unit: TimeUnit) -> Self {
        TimeType { units: Mutex::new(vec![default_unit; count]) }
    }
}

impl FieldType for TimeType {
    fn parse(&self, n: u32, input: &str) -> CommandResult<u32> {
        let value: f64 = input.trim().parse().map_err(|_| parse_error("time", input))?;
        let unit = self.units.lock()[n as usize];
        let ticks = (value * unit.ticks_per_unit()).round();
        if !(0.0..=u32::MAX as f64).contains(&ticks) {
            return Err(CommandError::TimeOutOfRange);
        }
        Ok(ticks as u32)
    }

    fn format(&self, n: u32, raw: u32) -> String {
        let unit = self.units.lock()[n as usize];
        format_significant(raw as f64 / unit.ticks_per_unit(), 12)
    }

    fn attributes(&self, raw_values: Arc<RawValues>) -> Vec<(String, Attribute)> {
        let rv = raw_values;
        let format = move |n: u32| Ok(rv.read(n).to_string());
        vec![(
            "RAW".to_string(),
            Attribute::new(
                "RAW".to_string(),
                "Unscaled tick count".to_string(),
                true,
                true,
                AttrOps::format(format),
            ),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeClock;

    #[test]
    fn uint_round_trips() {
        let t = UintType;
        assert_eq!(t.format(0, t.parse(0, "7").unwrap()), "7");
        assert!(t.parse(0, "-1").is_err());
    }

    #[test]
    fn int_rejects_overflow() {
        let t = IntType;
        assert!(t.parse(0, "99999999999999999999").is_err());
        assert_eq!(t.format(0, t.parse(0, "-5").unwrap()), "-5");
    }

    #[test]
    fn lut_formats_as_hex() {
        let t = LutType;
        assert_eq!(t.format(0, t.parse(0, "0x1A2B").unwrap()), "0x00001A2B");
    }

    #[test]
    fn scalar_round_trip_within_epsilon() {
        let t = ScalarType::new(1, 0.001, 0.0, "V");
        let raw = t.parse(0, "1.5").unwrap();
        let back: f64 = t.format(0, raw).parse().unwrap();
        assert!((back - 1.5).abs() < 1e-9);
    }

    #[test]
    fn time_example_from_spec() {
        // PULSE1.DELAY=1.0 at 125_000_000 ticks/s -> RAW=125000000
        let t = TimeType::new(4, TimeUnit::Sec);
        let raw = t.parse(1, "1.0").unwrap();
        assert_eq!(raw, 125_000_000);
    }

    #[test]
    fn raw_values_tracks_change_index() {
        let clock = Arc::new(ChangeClock::new());
        let rv = RawValues::new(2, clock);
        let before = rv.update_index(0);
        rv.write(0, 42);
        assert!(rv.update_index(0) > before);
        assert_eq!(rv.read(0), 42);
    }
}
