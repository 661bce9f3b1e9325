//! The two global mux lookup tables of spec.md §4.7: `bit_mux` (128 lines)
//! and `pos_mux` (32 lines, plus the reserved sentinel name `ZERO` -> 32).
//! Populated during register binding of `bit_out`/`pos_out` fields,
//! append-only thereafter (spec.md §5).

use std::sync::Arc;

use sync::Mutex;

use crate::error::CommandError;
use crate::hardware::BIT_BUS_COUNT;
use crate::hardware::POS_BUS_COUNT;
use crate::names::LabelSet;

pub const POS_MUX_ZERO_NAME: &str = "ZERO";
pub const POS_MUX_ZERO_INDEX: u32 = POS_BUS_COUNT as u32;

pub struct MuxTable {
    labels: Mutex<LabelSet>,
    capacity: u32,
}

impl MuxTable {
    fn new(capacity: u32) -> Self {
        MuxTable { labels: Mutex::new(LabelSet::new_dynamic()), capacity }
    }

    pub fn new_bit_mux() -> Arc<Self> {
        Arc::new(MuxTable::new(BIT_BUS_COUNT as u32))
    }

    pub fn new_pos_mux() -> Arc<Self> {
        let table = MuxTable::new(POS_MUX_ZERO_INDEX + 1);
        table.labels.lock().insert(POS_MUX_ZERO_NAME, POS_MUX_ZERO_INDEX).expect("ZERO sentinel registration");
        Arc::new(table)
    }

    /// Registers `name` at `index`, failing if the index is out of range
    /// or already bound to a different name (spec.md §7 `Register already
    /// assigned`-class failure, surfaced through the loader).
    pub fn register(&self, name: impl Into<String>, index: u32) -> Result<(), CommandError> {
        if index >= self.capacity {
            return Err(CommandError::other("mux index out of range"));
        }
        self.labels.lock().insert(name, index).map_err(CommandError::other)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.labels.lock().index_of(name)
    }

    pub fn name_of(&self, index: u32) -> Option<String> {
        self.labels.lock().name_of(index).map(str::to_string)
    }

    pub fn snapshot(&self) -> LabelSet {
        self.labels.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_mux_round_trip_from_spec_example() {
        let table = MuxTable::new_pos_mux();
        table.register("COUNTER1.OUT", 5).unwrap();
        assert_eq!(table.index_of("COUNTER1.OUT"), Some(5));
        assert_eq!(table.name_of(5), Some("COUNTER1.OUT".to_string()));
        assert_eq!(table.index_of(POS_MUX_ZERO_NAME), Some(POS_MUX_ZERO_INDEX));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let table = MuxTable::new_bit_mux();
        assert!(table.register("X1.Y", BIT_BUS_COUNT as u32).is_err());
    }
}
