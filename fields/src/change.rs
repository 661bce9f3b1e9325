//! The change-index service of spec.md §3/§4.5/§9: a process-wide monotonic
//! 64-bit logical clock, plus the small `Tracked<T>` helper that every
//! change-aware slot (class instance, attribute, output bus line) wraps its
//! value in.
//!
//! The spec calls out an explicit Open Question here (§9): some revisions
//! of the original compared with `>=`, others with `>`. This implementation
//! uses strict `>`, per spec.md §3's invariant text, which also means a
//! client that writes and then immediately polls with the index the write
//! just produced does *not* see that write reported — it shows up on the
//! *next* poll. `Tracked::changed_since` is the single place this
//! comparison is made, so the choice is enforced uniformly.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A report index of 0 means "never polled"; every freshly constructed
/// `Tracked<T>` starts above it so the first poll always reports it.
pub const NEVER_SEEN: u64 = 0;

/// The process-wide monotonic counter. `current()` is the value "as of
/// now"; `tick()` advances it and returns the new value, which callers
/// stamp onto the slot they just mutated. The two must happen inside the
/// same lock that guards the slot (spec.md §5's ordering guarantee: "a
/// write to hardware is sequenced strictly before the matching
/// `update_index` bump").
#[derive(Debug)]
pub struct ChangeClock(AtomicU64);

impl ChangeClock {
    pub fn new() -> Self {
        ChangeClock(AtomicU64::new(1))
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for ChangeClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The six disjoint change-set families of spec.md §3.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChangeFamily {
    Config,
    Bits,
    Position,
    Read,
    Attr,
    Table,
}

impl ChangeFamily {
    pub const ALL: [ChangeFamily; 6] = [
        ChangeFamily::Config,
        ChangeFamily::Bits,
        ChangeFamily::Position,
        ChangeFamily::Read,
        ChangeFamily::Attr,
        ChangeFamily::Table,
    ];

    pub fn group_name(self) -> &'static str {
        match self {
            ChangeFamily::Config => "CONFIG",
            ChangeFamily::Bits => "BITS",
            ChangeFamily::Position => "POSITION",
            ChangeFamily::Read => "READ",
            ChangeFamily::Attr => "ATTR",
            ChangeFamily::Table => "TABLE",
        }
    }

    pub fn from_group_name(name: &str) -> Option<ChangeFamily> {
        ChangeFamily::ALL.into_iter().find(|f| f.group_name() == name)
    }
}

/// A value paired with the `update_index` of its last mutation. `set`
/// bumps the index from the shared clock at the same time it stores the
/// new value; `changed_since` is the strict-`>` comparison spec.md §9
/// settles on.
#[derive(Debug, Clone)]
pub struct Tracked<T> {
    value: T,
    update_index: u64,
}

impl<T> Tracked<T> {
    pub fn new(value: T) -> Self {
        Tracked { value, update_index: 1 }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn update_index(&self) -> u64 {
        self.update_index
    }

    pub fn set(&mut self, value: T, clock: &ChangeClock) {
        self.value = value;
        self.update_index = clock.tick();
    }

    /// Stamps the slot with an index that was already drawn from the clock
    /// (used when several slots must share one tick, e.g. a bus refresh
    /// sampling `get_change_index()` once for all changed lines).
    pub fn set_with_index(&mut self, value: T, index: u64) {
        self.value = value;
        self.update_index = index;
    }

    pub fn touch(&mut self, clock: &ChangeClock) {
        self.update_index = clock.tick();
    }

    pub fn changed_since(&self, report_index: u64) -> bool {
        self.update_index > report_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_poll_with_result_index_sees_no_change() {
        let clock = ChangeClock::new();
        let mut slot = Tracked::new(0u32);
        slot.set(7, &clock);
        let idx = slot.update_index();
        assert!(!slot.changed_since(idx));
        assert!(slot.changed_since(idx - 1));
    }

    #[test]
    fn fresh_slot_is_seen_as_changed_from_zero() {
        let slot: Tracked<u32> = Tracked::new(0);
        assert!(slot.changed_since(NEVER_SEEN));
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = ChangeClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
    }
}
