//! Attributes (spec.md §4.4): named sub-fields of a field, bound to either
//! a class or a type, each optionally offering `format` (single-line get),
//! `get_many` (multi-line get), `put`, and `get_enumeration`.
//!
//! The teacher's Design Notes (§9) call out the source's `void *owner, void
//! *data` threading through every attribute call as something a clean
//! rewrite should replace with "a closure over its bound (field,
//! class-or-type-state) pair" — that is exactly what `AttrOps` is: each
//! operation is a boxed closure that has already captured whatever state it
//! needs when the attribute was constructed.

use sync::Mutex;

use crate::change::ChangeClock;
use crate::error::CommandError;
use crate::error::CommandResult;
use crate::names::LabelSet;

type FormatFn = Box<dyn Fn(u32) -> CommandResult<String> + Send + Sync>;
type GetManyFn = Box<dyn Fn(u32) -> CommandResult<Vec<String>> + Send + Sync>;
type PutFn = Box<dyn Fn(u32, &str) -> CommandResult<()> + Send + Sync>;
type EnumFn = Box<dyn Fn() -> Option<LabelSet> + Send + Sync>;

#[derive(Default)]
pub struct AttrOps {
    pub format: Option<FormatFn>,
    pub get_many: Option<GetManyFn>,
    pub put: Option<PutFn>,
    pub get_enumeration: Option<EnumFn>,
}

impl AttrOps {
    pub fn format(f: impl Fn(u32) -> CommandResult<String> + Send + Sync + 'static) -> Self {
        AttrOps { format: Some(Box::new(f)), ..Default::default() }
    }

    pub fn format_and_put(
        format: impl Fn(u32) -> CommandResult<String> + Send + Sync + 'static,
        put: impl Fn(u32, &str) -> CommandResult<()> + Send + Sync + 'static,
    ) -> Self {
        AttrOps { format: Some(Box::new(format)), put: Some(Box::new(put)), ..Default::default() }
    }

    pub fn get_many(f: impl Fn(u32) -> CommandResult<Vec<String>> + Send + Sync + 'static) -> Self {
        AttrOps { get_many: Some(Box::new(f)), ..Default::default() }
    }

    pub fn with_enumeration(mut self, f: impl Fn() -> Option<LabelSet> + Send + Sync + 'static) -> Self {
        self.get_enumeration = Some(Box::new(f));
        self
    }
}

struct ChangeSlot {
    update_index: u64,
    last_format: Option<String>,
}

/// A named accessor hanging off a field, bound to a (field, class-or-type)
/// pair through the closures captured in its `AttrOps`.
pub struct Attribute {
    name: String,
    description: String,
    in_change_set: bool,
    polled_change_set: bool,
    ops: AttrOps,
    change: Mutex<Vec<ChangeSlot>>,
}

impl Attribute {
    pub fn new(name: String, description: String, in_change_set: bool, polled_change_set: bool, ops: AttrOps) -> Self {
        assert!(
            !polled_change_set || (in_change_set && ops.format.is_some()),
            "polled_change_set requires in_change_set and a format op (spec.md §4.4)"
        );
        Attribute { name, description, in_change_set, polled_change_set, ops, change: Mutex::new(Vec::new()) }
    }

    /// Lazily grows the per-instance change-tracking slots to cover
    /// instance `n` the first time it's touched — attributes don't know
    /// the field's instance count at construction in every call site, so
    /// this keeps the constructor simple.
    fn ensure_slot(&self, n: u32) {
        let mut slots = self.change.lock();
        while slots.len() <= n as usize {
            slots.push(ChangeSlot { update_index: 1, last_format: None });
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn in_change_set(&self) -> bool {
        self.in_change_set
    }

    pub fn polled_change_set(&self) -> bool {
        self.polled_change_set
    }

    pub fn has_format(&self) -> bool {
        self.ops.format.is_some()
    }

    pub fn has_get_many(&self) -> bool {
        self.ops.get_many.is_some()
    }

    pub fn is_writeable(&self) -> bool {
        self.ops.put.is_some()
    }

    pub fn format(&self, n: u32) -> CommandResult<String> {
        match &self.ops.format {
            Some(f) => f(n),
            None => Err(CommandError::NotReadable),
        }
    }

    pub fn get_many(&self, n: u32) -> CommandResult<Vec<String>> {
        match &self.ops.get_many {
            Some(f) => f(n),
            None => Err(CommandError::NotReadable),
        }
    }

    pub fn put(&self, n: u32, value: &str) -> CommandResult<()> {
        match &self.ops.put {
            Some(f) => f(n, value),
            None => Err(CommandError::NotWriteable),
        }
    }

    pub fn get_enumeration(&self) -> Option<LabelSet> {
        self.ops.get_enumeration.as_ref().and_then(|f| f())
    }

    /// `attr_changed(attr, n)` of spec.md §4.4: bumps the per-instance
    /// update index and marks ATTR-family membership. Call sites are
    /// `put` closures for non-polled attributes (e.g. `SCALE=`).
    pub fn mark_changed(&self, n: u32, clock: &ChangeClock) {
        self.ensure_slot(n);
        self.change.lock()[n as usize].update_index = clock.tick();
    }

    /// Evaluates whether instance `n` should be reported in the ATTR
    /// change-set as of `report_index`. For polled attributes this first
    /// re-evaluates `format` and compares it against the last observed
    /// string, bumping the update index (from `clock`) if it differs —
    /// spec.md §4.5's "polled attributes first re-evaluate their format
    /// and compare to the cached string".
    pub fn poll_changed(&self, n: u32, report_index: u64, clock: &ChangeClock) -> CommandResult<bool> {
        if !self.in_change_set {
            return Ok(false);
        }
        if self.polled_change_set {
            let current = self.format(n)?;
            self.ensure_slot(n);
            let mut slots = self.change.lock();
            let slot = &mut slots[n as usize];
            if slot.last_format.as_deref() != Some(current.as_str()) {
                slot.last_format = Some(current);
                slot.update_index = clock.tick();
            }
            Ok(slot.update_index > report_index)
        } else {
            self.ensure_slot(n);
            Ok(self.change.lock()[n as usize].update_index > report_index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync::Mutex as StdMutex;

    #[test]
    fn polled_attribute_detects_format_change() {
        let clock = ChangeClock::new();
        let value = std::sync::Arc::new(StdMutex::new(10i32));
        let v2 = value.clone();
        let attr = Attribute::new(
            "SCALE".to_string(),
            "".to_string(),
            true,
            true,
            AttrOps::format(move |_n| Ok(v2.lock().to_string())),
        );
        let r0 = clock.current();
        assert!(attr.poll_changed(0, r0, &clock).unwrap());
        let r1 = clock.current();
        assert!(!attr.poll_changed(0, r1, &clock).unwrap());
        *value.lock() = 20;
        assert!(attr.poll_changed(0, r1, &clock).unwrap());
    }

    #[test]
    fn non_polled_attribute_requires_explicit_mark() {
        let clock = ChangeClock::new();
        let attr = Attribute::new(
            "CAPTURE".to_string(),
            "".to_string(),
            true,
            false,
            AttrOps::format(|_n| Ok("No".to_string())),
        );
        let r0 = clock.current();
        assert!(!attr.poll_changed(0, r0, &clock).unwrap());
        attr.mark_changed(0, &clock);
        assert!(attr.poll_changed(0, r0, &clock).unwrap());
    }
}
