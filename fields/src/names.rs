//! Name↔value maps and name↔index enumeration sets, the two hash-table
//! shapes this registry needs everywhere: an insertion-ordered map from
//! identifier to arbitrary value (blocks, fields, attributes all want their
//! declaration order preserved for `block.*` / `block.field.*` listing —
//! spec.md §4.1), and a bidirectional name⇄index table for enumerations
//! (static `enum` types, dynamic `enum` types, and the two global mux
//! enumerations of spec.md §4.7).

use std::collections::HashMap;

/// An insertion-ordered `name -> V` map. Not a generic associative
/// container — it exists specifically so the three places that need
/// "unique name, declaration order preserved" (blocks in a `Database`,
/// fields in a `Block`, attributes in a `Field`) don't reinvent it.
#[derive(Debug, Default)]
pub struct NameMap<V> {
    order: Vec<String>,
    by_name: HashMap<String, V>,
}

impl<V> NameMap<V> {
    pub fn new() -> Self {
        NameMap {
            order: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Inserts `value` under `name`. Returns the previous value if `name`
    /// was already present (callers use this to enforce the "names unique
    /// within their scope" invariant of spec.md §3).
    pub fn insert(&mut self, name: impl Into<String>, value: V) -> Option<V> {
        let name = name.into();
        if !self.by_name.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.by_name.insert(name, value)
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.by_name.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        self.by_name.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.order.iter().map(move |n| (n.as_str(), self.by_name.get(n).unwrap()))
    }
}

/// A bidirectional name⇄index enumeration. `Static` sets are fixed at
/// construction (class-defined `enum` types); `Dynamic` sets grow by
/// appending new `(name, index)` pairs and never shrink (config-file
/// dynamic `enum` sub-blocks, and the two global mux tables of spec.md
/// §4.7, which are explicitly "append-only after initialisation and never
/// deleted").
#[derive(Debug, Clone)]
pub struct LabelSet {
    names: Vec<String>,
    index_of: HashMap<String, u32>,
    dynamic: bool,
}

impl LabelSet {
    pub fn from_static(labels: &[impl AsRef<str>]) -> Self {
        let mut set = LabelSet {
            names: Vec::with_capacity(labels.len()),
            index_of: HashMap::with_capacity(labels.len()),
            dynamic: false,
        };
        for (i, label) in labels.iter().enumerate() {
            set.names.push(label.as_ref().to_string());
            set.index_of.insert(label.as_ref().to_string(), i as u32);
        }
        set
    }

    pub fn new_dynamic() -> Self {
        LabelSet {
            names: Vec::new(),
            index_of: HashMap::new(),
            dynamic: true,
        }
    }

    /// Appends `name` at `index`, failing if the set is static, the index
    /// is already occupied (spec.md §7 `Register already assigned`-style
    /// double binding), or the name is already registered.
    pub fn insert(&mut self, name: impl Into<String>, index: u32) -> Result<(), String> {
        if !self.dynamic {
            return Err("label set is static".to_string());
        }
        let name = name.into();
        if self.index_of.contains_key(&name) {
            return Err(format!("name '{name}' already registered"));
        }
        let idx = index as usize;
        if idx >= self.names.len() {
            self.names.resize(idx + 1, String::new());
        } else if !self.names[idx].is_empty() {
            return Err(format!("index {index} already assigned"));
        }
        self.names[idx] = name.clone();
        self.index_of.insert(name, index);
        Ok(())
    }

    /// Appends `name` at the next free slot, returning its index. Used for
    /// static-width dynamic enums declared purely as an ordered list.
    pub fn push(&mut self, name: impl Into<String>) -> u32 {
        let index = self.names.len() as u32;
        let name = name.into();
        self.names.push(name.clone());
        self.index_of.insert(name, index);
        index
    }

    pub fn name_of(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).filter(|s| !s.is_empty()).map(|s| s.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.index_of.get(name).copied()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.names.iter().filter(|s| !s.is_empty()).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.index_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_of.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_map_preserves_insertion_order() {
        let mut m = NameMap::new();
        m.insert("b", 1);
        m.insert("a", 2);
        assert_eq!(m.names().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn name_map_reports_duplicate() {
        let mut m = NameMap::new();
        assert!(m.insert("a", 1).is_none());
        assert_eq!(m.insert("a", 2), Some(1));
    }

    #[test]
    fn static_label_round_trips() {
        let set = LabelSet::from_static(&["No", "Triggered", "Difference"]);
        assert_eq!(set.index_of("Triggered"), Some(1));
        assert_eq!(set.name_of(1), Some("Triggered"));
    }

    #[test]
    fn dynamic_label_set_rejects_rebinding() {
        let mut set = LabelSet::new_dynamic();
        set.insert("COUNTER1.OUT", 5).unwrap();
        assert!(set.insert("COUNTER1.OUT", 6).is_err());
        assert!(set.insert("OTHER.OUT", 5).is_err());
        assert_eq!(set.name_of(5), Some("COUNTER1.OUT"));
    }
}
