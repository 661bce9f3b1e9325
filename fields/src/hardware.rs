//! The hardware shim (spec.md §6): an opaque interface this crate consumes
//! but never implements for real silicon — the real FPGA backend lives
//! outside this core, wired in by the `pandad` binary. `mock` provides the
//! in-memory stand-in used by every test in this crate and by `pandad
//! --mock-hardware`.

use sync::Mutex;

pub const BIT_BUS_COUNT: usize = 128;
pub const POS_BUS_COUNT: usize = 32;
pub const CAPTURE_BUS_COUNT: usize = 64;
pub const CLOCK_FREQUENCY: u64 = 125_000_000;
pub const MAX_CLOCK_VALUE: u64 = (1u64 << 48) - 1;

#[derive(Debug, Clone)]
pub struct BitsSnapshot {
    pub values: [bool; BIT_BUS_COUNT],
    pub changes: [bool; BIT_BUS_COUNT],
}

#[derive(Debug, Clone)]
pub struct PositionsSnapshot {
    pub values: [i32; POS_BUS_COUNT],
    pub changes: [bool; POS_BUS_COUNT],
}

/// The opaque hardware interface, spec.md §6. Every method is a direct
/// register/table primitive; none of them are fallible at this layer
/// except `validate`, which the loader calls once at the end of start-up
/// (spec.md §4.10 rule 5).
pub trait HardwareBackend: Send + Sync {
    fn read_register(&self, block_base: u32, instance: u32, reg: u32) -> u32;
    fn write_register(&self, block_base: u32, instance: u32, reg: u32, value: u32);

    fn read_bits(&self) -> BitsSnapshot;
    fn read_positions(&self) -> PositionsSnapshot;

    fn open_short_table(&self, block_base: u32, instance: u32, reg: u32, max_length: u32);
    fn open_long_table(&self, block_base: u32, instance: u32, order: u32, table_base_reg: u32);
    fn read_table_data(&self, block_base: u32, instance: u32, offset: u32, count: u32) -> Vec<u32>;
    fn write_table(&self, block_base: u32, instance: u32, offset: u32, data: &[u32]);
    fn close_table(&self, block_base: u32, instance: u32);

    fn set_named_register(&self, name: &str, block_base: u32, reg: u32);
    fn set_block_base(&self, block_base: u32, base: u32);

    /// Confirms every named-register binding made during loading is
    /// present in the real device. Returns an error message on failure.
    fn validate(&self) -> Result<(), String>;
}

pub mod mock {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct State {
        registers: HashMap<(u32, u32, u32), u32>,
        bits: [bool; BIT_BUS_COUNT],
        positions: [i32; POS_BUS_COUNT],
        tables: HashMap<(u32, u32), Vec<u32>>,
        named_registers: HashMap<String, (u32, u32)>,
        block_bases: HashMap<u32, u32>,
    }

    /// A pure in-memory hardware backend: registers are a hash map keyed by
    /// `(block_base, instance, reg)`, bit/position buses are fixed-size
    /// arrays a test can poke directly through [`MockHardware::set_bit`]/
    /// [`MockHardware::set_position`], and tables are `Vec<u32>` keyed by
    /// `(block_base, instance)`.
    pub struct MockHardware {
        state: Mutex<State>,
    }

    impl MockHardware {
        pub fn new() -> Self {
            MockHardware { state: Mutex::new(State::default()) }
        }

        pub fn set_bit(&self, index: usize, value: bool) {
            self.state.lock().bits[index] = value;
        }

        pub fn set_position(&self, index: usize, value: i32) {
            self.state.lock().positions[index] = value;
        }

        pub fn table(&self, block_base: u32, instance: u32) -> Vec<u32> {
            self.state
                .lock()
                .tables
                .get(&(block_base, instance))
                .cloned()
                .unwrap_or_default()
        }
    }

    impl Default for MockHardware {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HardwareBackend for MockHardware {
        fn read_register(&self, block_base: u32, instance: u32, reg: u32) -> u32 {
            *self.state.lock().registers.get(&(block_base, instance, reg)).unwrap_or(&0)
        }

        fn write_register(&self, block_base: u32, instance: u32, reg: u32, value: u32) {
            self.state.lock().registers.insert((block_base, instance, reg), value);
        }

        fn read_bits(&self) -> BitsSnapshot {
            // The mock has no hidden asynchronous mutation, so nothing ever
            // "changes" independently of a register write; real hardware
            // changes come from the FPGA's own logic. Tests that want to
            // exercise change detection call `set_bit` then compare two
            // successive snapshots themselves.
            let values = self.state.lock().bits;
            BitsSnapshot { values, changes: [false; BIT_BUS_COUNT] }
        }

        fn read_positions(&self) -> PositionsSnapshot {
            let values = self.state.lock().positions;
            PositionsSnapshot { values, changes: [false; POS_BUS_COUNT] }
        }

        fn open_short_table(&self, block_base: u32, instance: u32, _reg: u32, max_length: u32) {
            self.state
                .lock()
                .tables
                .entry((block_base, instance))
                .or_insert_with(|| Vec::with_capacity(max_length as usize));
        }

        fn open_long_table(&self, block_base: u32, instance: u32, order: u32, _table_base_reg: u32) {
            self.state
                .lock()
                .tables
                .entry((block_base, instance))
                .or_insert_with(|| Vec::with_capacity(1 << order));
        }

        fn read_table_data(&self, block_base: u32, instance: u32, offset: u32, count: u32) -> Vec<u32> {
            let state = self.state.lock();
            let table = state.tables.get(&(block_base, instance));
            let offset = offset as usize;
            match table {
                Some(data) => {
                    let end = (offset + count as usize).min(data.len());
                    if offset >= end {
                        Vec::new()
                    } else {
                        data[offset..end].to_vec()
                    }
                }
                None => Vec::new(),
            }
        }

        fn write_table(&self, block_base: u32, instance: u32, offset: u32, data: &[u32]) {
            let mut state = self.state.lock();
            let table = state.tables.entry((block_base, instance)).or_default();
            let offset = offset as usize;
            if table.len() < offset + data.len() {
                table.resize(offset + data.len(), 0);
            }
            table[offset..offset + data.len()].copy_from_slice(data);
        }

        fn close_table(&self, _block_base: u32, _instance: u32) {}

        fn set_named_register(&self, name: &str, block_base: u32, reg: u32) {
            self.state.lock().named_registers.insert(name.to_string(), (block_base, reg));
        }

        fn set_block_base(&self, block_base: u32, base: u32) {
            self.state.lock().block_bases.insert(block_base, base);
        }

        fn validate(&self) -> Result<(), String> {
            Ok(())
        }
    }
}
