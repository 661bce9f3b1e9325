//! The class registry of spec.md §4.2: the closed set of per-field
//! behaviours a config-file `class` name selects. Where the loader
//! (`database.rs`) needs a generic `init`/`parse_register` dispatch across
//! class names, it matches on the config-file string directly and builds
//! the matching struct below — there is no further polymorphic "class
//! method table" at runtime beyond the [`FieldClass`] trait every variant
//! implements for the operations the dispatcher actually calls.

use std::sync::Arc;

use crate::bus::CaptureArm;
use crate::bus::CaptureSelector;
use crate::bus::BusState;
use crate::change::ChangeClock;
use crate::change::ChangeFamily;
use crate::change::Tracked;
use crate::error::CommandError;
use crate::error::CommandResult;
use crate::hardware::HardwareBackend;
use crate::hardware::MAX_CLOCK_VALUE;
use crate::mux::MuxTable;
use crate::names::LabelSet;
use crate::table::TableBlock;
use crate::types::FieldType;
use crate::types::RawValues;
use crate::types::TimeUnit;
use sync::Mutex;

/// The operations the dispatcher and change-set scanner need from every
/// class variant. `get_many`/`put`/`refresh`/`get_enumeration`/`as_table`
/// default to the "this class doesn't support that" behaviour most
/// variants have; each variant overrides only what it adds.
pub trait FieldClass: Send + Sync {
    fn get(&self, n: u32) -> CommandResult<String>;

    fn get_many(&self, _n: u32) -> CommandResult<Vec<String>> {
        Err(CommandError::NotReadable)
    }

    fn put(&self, _n: u32, _value: &str) -> CommandResult<()> {
        Err(CommandError::NotWriteable)
    }

    /// Refreshes cached state from hardware immediately prior to a read.
    /// Only output classes (`bit_out`/`pos_out`/`ext_out`) do anything here.
    fn refresh(&self, _n: u32) {}

    fn change_family(&self) -> ChangeFamily;

    fn changed_since(&self, n: u32, report_index: u64) -> bool;

    fn get_enumeration(&self) -> Option<LabelSet> {
        None
    }

    fn as_table(&self, _n: u32) -> Option<&TableBlock> {
        None
    }

    /// Flushes any default value to hardware after database loading
    /// completes (spec.md §4.2's `finalise`).
    fn finalise(&self) {}

    /// The current `CAPTURE` selection and wire type for a field the
    /// data-options collaborator (spec.md §4.11) may subscribe to. Only the
    /// bus-output classes override this; every other class is never a
    /// capture source.
    fn capture_info(&self, _n: u32) -> Option<CaptureInfo> {
        None
    }
}

/// What a captured field reports in the data-options header: its current
/// `CAPTURE` selection and the wire type the collaborator should expect
/// each captured sample to arrive as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInfo {
    pub mode: String,
    pub type_name: &'static str,
}

// ---------------------------------------------------------------------
// param / read / write — register-bound, type-formatted scalar classes.
// ---------------------------------------------------------------------

/// Cached write-through: `put` writes the register and the cache in the
/// same raw-values slot lock, reported under the CONFIG family.
pub struct ParamClass {
    raw: Arc<RawValues>,
    field_type: Box<dyn FieldType>,
    hw: Arc<dyn HardwareBackend>,
    block_base: u32,
    register: u32,
}

impl ParamClass {
    pub fn new(
        raw: Arc<RawValues>,
        field_type: Box<dyn FieldType>,
        hw: Arc<dyn HardwareBackend>,
        block_base: u32,
        register: u32,
    ) -> Self {
        ParamClass { raw, field_type, hw, block_base, register }
    }
}

impl FieldClass for ParamClass {
    fn get(&self, n: u32) -> CommandResult<String> {
        Ok(self.field_type.format(n, self.raw.read(n)))
    }

    fn put(&self, n: u32, value: &str) -> CommandResult<()> {
        let raw = self.field_type.parse(n, value)?;
        self.hw.write_register(self.block_base, n, self.register, raw);
        self.raw.write(n, raw);
        Ok(())
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Config
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.raw.update_index(n) > report_index
    }

    fn get_enumeration(&self) -> Option<LabelSet> {
        self.field_type.get_enumeration()
    }
}

/// Polled: `refresh` re-reads the register and only bumps the change
/// index when the value actually differs (spec.md §4.2: "updates cache
/// and change index only on detected value change"), reported under READ.
pub struct ReadClass {
    raw: Arc<RawValues>,
    field_type: Box<dyn FieldType>,
    hw: Arc<dyn HardwareBackend>,
    block_base: u32,
    register: u32,
}

impl ReadClass {
    pub fn new(
        raw: Arc<RawValues>,
        field_type: Box<dyn FieldType>,
        hw: Arc<dyn HardwareBackend>,
        block_base: u32,
        register: u32,
    ) -> Self {
        ReadClass { raw, field_type, hw, block_base, register }
    }
}

impl FieldClass for ReadClass {
    fn get(&self, n: u32) -> CommandResult<String> {
        Ok(self.field_type.format(n, self.raw.read(n)))
    }

    fn refresh(&self, n: u32) {
        let fresh = self.hw.read_register(self.block_base, n, self.register);
        if fresh != self.raw.read(n) {
            self.raw.write(n, fresh);
        }
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Read
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.raw.update_index(n) > report_index
    }

    fn get_enumeration(&self) -> Option<LabelSet> {
        self.field_type.get_enumeration()
    }
}

/// Write-only: no `get`, writes flow straight through to hardware.
pub struct WriteClass {
    raw: Arc<RawValues>,
    field_type: Box<dyn FieldType>,
    hw: Arc<dyn HardwareBackend>,
    block_base: u32,
    register: u32,
}

impl WriteClass {
    pub fn new(
        raw: Arc<RawValues>,
        field_type: Box<dyn FieldType>,
        hw: Arc<dyn HardwareBackend>,
        block_base: u32,
        register: u32,
    ) -> Self {
        WriteClass { raw, field_type, hw, block_base, register }
    }
}

impl FieldClass for WriteClass {
    fn get(&self, _n: u32) -> CommandResult<String> {
        Err(CommandError::NotReadable)
    }

    fn put(&self, n: u32, value: &str) -> CommandResult<()> {
        let raw = self.field_type.parse(n, value)?;
        self.hw.write_register(self.block_base, n, self.register, raw);
        self.raw.write(n, raw);
        Ok(())
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Config
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.raw.update_index(n) > report_index
    }
}

// ---------------------------------------------------------------------
// time — paired 32-bit registers as a 48-bit scaled value (spec.md §4.8).
// ---------------------------------------------------------------------

struct TimeSlot {
    unit: TimeUnit,
    value: u64,
}

/// The forbidden band `[1, min_value]` a `put` must reject, expressed in
/// raw ticks; spec.md §4.8 leaves `min_value` implementation-defined, so
/// this is a per-instance constant supplied at construction (the loader
/// reads it from the register-binding `low high [> min]` spec).
///
/// `slots`/`index` sit behind their own `Arc` (rather than being owned
/// directly) so the loader can clone a handle to build the `RAW`/`UNITS`/
/// `MIN` attributes before the class itself is boxed — the same "shared
/// state, not a shared class object" shape `RawValues` already uses for
/// `param`/`read`/`write`.
#[derive(Clone)]
pub struct TimeClass {
    slots: Arc<Mutex<Vec<TimeSlot>>>,
    index: Arc<Mutex<Vec<Tracked<()>>>>,
    min_value: u64,
    hw: Arc<dyn HardwareBackend>,
    block_base: u32,
    reg_low: u32,
    reg_high: u32,
    clock: Arc<ChangeClock>,
}

impl TimeClass {
    pub fn new(
        count: usize,
        default_unit: TimeUnit,
        min_value: u64,
        hw: Arc<dyn HardwareBackend>,
        block_base: u32,
        reg_low: u32,
        reg_high: u32,
        clock: Arc<ChangeClock>,
    ) -> Self {
        TimeClass {
            slots: Arc::new(Mutex::new((0..count).map(|_| TimeSlot { unit: default_unit, value: 0 }).collect())),
            index: Arc::new(Mutex::new((0..count).map(|_| Tracked::new(())).collect())),
            min_value,
            hw,
            block_base,
            reg_low,
            reg_high,
            clock,
        }
    }

    fn write_hardware(&self, n: u32, value: u64) {
        self.hw.write_register(self.block_base, n, self.reg_low, value as u32);
        self.hw.write_register(self.block_base, n, self.reg_high, (value >> 32) as u32);
    }

    pub fn units(&self, n: u32) -> CommandResult<String> {
        Ok(self.slots.lock()[n as usize].unit.name().to_string())
    }

    pub fn set_units(&self, n: u32, name: &str) -> CommandResult<()> {
        let unit = TimeUnit::from_name(name.trim()).ok_or_else(|| CommandError::other(format!("unknown time unit '{name}'")))?;
        self.slots.lock()[n as usize].unit = unit;
        self.index.lock()[n as usize].touch(&self.clock);
        Ok(())
    }

    pub fn min(&self, n: u32) -> String {
        let unit = self.slots.lock()[n as usize].unit;
        format!("{}", self.min_value as f64 / unit.ticks_per_unit())
    }

    pub fn raw(&self, n: u32) -> u64 {
        self.slots.lock()[n as usize].value
    }
}

impl FieldClass for TimeClass {
    fn get(&self, n: u32) -> CommandResult<String> {
        let slot = &self.slots.lock()[n as usize];
        Ok(format!("{}", slot.value as f64 / slot.unit.ticks_per_unit()))
    }

    fn put(&self, n: u32, value: &str) -> CommandResult<()> {
        let input: f64 = value.trim().parse().map_err(|_| CommandError::other(format!("invalid time: '{value}'")))?;
        let unit = self.slots.lock()[n as usize].unit;
        let ticks = (input * unit.ticks_per_unit()).round();
        if ticks < 0.0 || ticks > MAX_CLOCK_VALUE as f64 {
            return Err(CommandError::TimeOutOfRange);
        }
        let ticks = ticks as u64;
        if ticks >= 1 && ticks <= self.min_value {
            return Err(CommandError::ValueTooSmall);
        }
        self.write_hardware(n, ticks);
        self.slots.lock()[n as usize].value = ticks;
        self.index.lock()[n as usize].touch(&self.clock);
        Ok(())
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Config
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.index.lock()[n as usize].changed_since(report_index)
    }
}

// ---------------------------------------------------------------------
// bit_out / pos_out / ext_out — output bus subscribers (spec.md §4.6).
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct BitOutClass {
    bus_index: Vec<u32>,
    bus: Arc<BusState>,
    hw: Arc<dyn HardwareBackend>,
    capture: Arc<CaptureSelector>,
}

impl BitOutClass {
    pub fn new(bus_index: Vec<u32>, bus: Arc<BusState>, arm: Arc<CaptureArm>, hw: Arc<dyn HardwareBackend>) -> Self {
        let count = bus_index.len();
        BitOutClass {
            bus_index,
            bus,
            hw,
            capture: Arc::new(CaptureSelector::new(crate::bus::capture_options::EXT_OUT, count, arm)),
        }
    }

    pub fn capture(&self) -> &CaptureSelector {
        &self.capture
    }
}

impl FieldClass for BitOutClass {
    fn get(&self, n: u32) -> CommandResult<String> {
        Ok(if self.bus.bit_value(self.bus_index[n as usize]) { "1" } else { "0" }.to_string())
    }

    fn refresh(&self, _n: u32) {
        self.bus.refresh_bits(self.hw.as_ref());
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Bits
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.bus.bit_update_index(self.bus_index[n as usize]) > report_index
    }

    fn capture_info(&self, n: u32) -> Option<CaptureInfo> {
        let mode = self.capture.get(n).ok()?;
        if self.capture.is_none(n) {
            return None;
        }
        Some(CaptureInfo { mode, type_name: "bool" })
    }
}

#[derive(Clone)]
pub struct PosOutClass {
    bus_index: Vec<u32>,
    bus: Arc<BusState>,
    hw: Arc<dyn HardwareBackend>,
    capture: Arc<CaptureSelector>,
    capture_options: &'static [&'static str],
}

impl PosOutClass {
    pub fn new(
        bus_index: Vec<u32>,
        bus: Arc<BusState>,
        arm: Arc<CaptureArm>,
        hw: Arc<dyn HardwareBackend>,
        capture_options: &'static [&'static str],
    ) -> Self {
        let count = bus_index.len();
        PosOutClass { bus_index, bus, hw, capture: Arc::new(CaptureSelector::new(capture_options, count, arm)), capture_options }
    }

    pub fn capture(&self) -> &CaptureSelector {
        &self.capture
    }
}

impl FieldClass for PosOutClass {
    fn get(&self, n: u32) -> CommandResult<String> {
        Ok(self.bus.pos_value(self.bus_index[n as usize]).to_string())
    }

    fn refresh(&self, _n: u32) {
        self.bus.refresh_positions(self.hw.as_ref());
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Position
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.bus.pos_update_index(self.bus_index[n as usize]) > report_index
    }

    fn get_enumeration(&self) -> Option<LabelSet> {
        Some(LabelSet::from_static(self.capture_options))
    }

    fn capture_info(&self, n: u32) -> Option<CaptureInfo> {
        let mode = self.capture.get(n).ok()?;
        if self.capture.is_none(n) {
            return None;
        }
        Some(CaptureInfo { mode, type_name: "int32" })
    }
}

/// `ext_out`: a generic hardware-reported value (offset, adc_count, bits,
/// or a timestamp capture) that is not itself a bus line — spec.md §4.6
/// lists its capture-option variants but does not place its raw value in
/// BITS or POSITION, so this core reports its own value under the READ
/// family, consistent with "a polled value that changes independently of
/// client writes" (documented as an Open Question resolution in the
/// design ledger).
#[derive(Clone)]
pub struct ExtOutClass {
    raw: Arc<RawValues>,
    hw: Arc<dyn HardwareBackend>,
    block_base: u32,
    register: u32,
    capture: Arc<CaptureSelector>,
}

impl ExtOutClass {
    pub fn new(
        count: usize,
        raw: Arc<RawValues>,
        hw: Arc<dyn HardwareBackend>,
        block_base: u32,
        register: u32,
        arm: Arc<CaptureArm>,
        capture_options: &'static [&'static str],
    ) -> Self {
        ExtOutClass { raw, hw, block_base, register, capture: Arc::new(CaptureSelector::new(capture_options, count, arm)) }
    }

    pub fn capture(&self) -> &CaptureSelector {
        &self.capture
    }
}

impl FieldClass for ExtOutClass {
    fn get(&self, n: u32) -> CommandResult<String> {
        Ok(self.raw.read(n).to_string())
    }

    fn refresh(&self, n: u32) {
        let fresh = self.hw.read_register(self.block_base, n, self.register);
        if fresh != self.raw.read(n) {
            self.raw.write(n, fresh);
        }
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Read
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.raw.update_index(n) > report_index
    }

    fn capture_info(&self, n: u32) -> Option<CaptureInfo> {
        let mode = self.capture.get(n).ok()?;
        if self.capture.is_none(n) {
            return None;
        }
        Some(CaptureInfo { mode, type_name: "uint32" })
    }
}

// ---------------------------------------------------------------------
// pos_mux / bit_mux — selectors into the global mux enumerations.
// ---------------------------------------------------------------------

/// A register-bound selector field: `put` resolves the name through the
/// shared [`MuxTable`] and writes the resolved index; `get` reverses it.
pub struct MuxSelectorClass {
    raw: Arc<RawValues>,
    table: Arc<MuxTable>,
    hw: Arc<dyn HardwareBackend>,
    block_base: u32,
    register: u32,
}

impl MuxSelectorClass {
    pub fn new(raw: Arc<RawValues>, table: Arc<MuxTable>, hw: Arc<dyn HardwareBackend>, block_base: u32, register: u32) -> Self {
        MuxSelectorClass { raw, table, hw, block_base, register }
    }
}

impl FieldClass for MuxSelectorClass {
    fn get(&self, n: u32) -> CommandResult<String> {
        let index = self.raw.read(n);
        self.table.name_of(index).ok_or(CommandError::MuxSelectorNotKnown)
    }

    fn put(&self, n: u32, value: &str) -> CommandResult<()> {
        let index = self.table.index_of(value.trim()).ok_or(CommandError::MuxSelectorNotKnown)?;
        self.hw.write_register(self.block_base, n, self.register, index);
        self.raw.write(n, index);
        Ok(())
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Config
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.raw.update_index(n) > report_index
    }

    fn get_enumeration(&self) -> Option<LabelSet> {
        Some(self.table.snapshot())
    }
}

// ---------------------------------------------------------------------
// table — delegates to the table engine.
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct TableClass {
    blocks: Vec<Arc<TableBlock>>,
}

impl TableClass {
    pub fn new(blocks: Vec<Arc<TableBlock>>) -> Self {
        TableClass { blocks }
    }
}

impl FieldClass for TableClass {
    fn get(&self, _n: u32) -> CommandResult<String> {
        Err(CommandError::other("table fields are read with a multi-line request"))
    }

    fn get_many(&self, n: u32) -> CommandResult<Vec<String>> {
        Ok(self.blocks[n as usize].read_rows())
    }

    fn change_family(&self) -> ChangeFamily {
        ChangeFamily::Table
    }

    fn changed_since(&self, n: u32, report_index: u64) -> bool {
        self.blocks[n as usize].update_index() > report_index
    }

    fn as_table(&self, n: u32) -> Option<&TableBlock> {
        self.blocks.get(n as usize).map(Arc::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockHardware;
    use crate::types::UintType;

    #[test]
    fn param_write_through_updates_cache_and_hardware() {
        let clock = Arc::new(ChangeClock::new());
        let hw: Arc<dyn HardwareBackend> = Arc::new(MockHardware::new());
        let raw = RawValues::new(1, clock);
        let class = ParamClass::new(raw, Box::new(UintType), hw.clone(), 0, 4);
        class.put(0, "9").unwrap();
        assert_eq!(class.get(0).unwrap(), "9");
        assert_eq!(hw.read_register(0, 0, 4), 9);
    }

    #[test]
    fn read_class_only_bumps_index_on_change() {
        let clock = Arc::new(ChangeClock::new());
        let hw: Arc<dyn HardwareBackend> = Arc::new(MockHardware::new());
        let raw = RawValues::new(1, clock);
        let class = ReadClass::new(raw, Box::new(UintType), hw.clone(), 0, 4);
        let r0 = class.changed_since(0, 0);
        assert!(r0);
        let after_first_refresh = class.changed_since(0, 10_000);
        assert!(!after_first_refresh);
        class.refresh(0);
        assert!(!class.changed_since(0, 10_000));
        hw.write_register(0, 0, 4, 42);
        class.refresh(0);
        assert_eq!(class.get(0).unwrap(), "42");
    }

    #[test]
    fn time_class_rejects_forbidden_band() {
        let clock = Arc::new(ChangeClock::new());
        let hw: Arc<dyn HardwareBackend> = Arc::new(MockHardware::new());
        let class = TimeClass::new(1, TimeUnit::Sec, 10, hw, 0, 0, 1, clock);
        let small = 5.0 / TimeUnit::Sec.ticks_per_unit();
        assert_eq!(class.put(0, &small.to_string()), Err(CommandError::ValueTooSmall));
        assert!(class.put(0, "1.0").is_ok());
    }

    #[test]
    fn mux_selector_round_trips() {
        let clock = Arc::new(ChangeClock::new());
        let hw: Arc<dyn HardwareBackend> = Arc::new(MockHardware::new());
        let table = MuxTable::new_pos_mux();
        table.register("COUNTER1.OUT", 5).unwrap();
        let raw = RawValues::new(1, clock);
        let class = MuxSelectorClass::new(raw, table, hw, 0, 2);
        class.put(0, "COUNTER1.OUT").unwrap();
        assert_eq!(class.get(0).unwrap(), "COUNTER1.OUT");
    }
}
