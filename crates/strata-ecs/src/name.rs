//! Component name interning.
//!
//! Components are identified by [`NameId`] -- a stable 32-bit identifier
//! produced by a [`NameTable`]. The numeric order of `NameId`s defines the
//! canonical column order inside every archetype, so the same set of
//! components always maps to the same table layout regardless of the order
//! in which they were added.
//!
//! The store itself does not own a `NameTable`; callers intern names up
//! front and pass `NameId`s into the store API. Diagnostics helpers accept
//! a `&NameTable` when a human-readable rendering is wanted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// NameId
// ---------------------------------------------------------------------------

/// Stable identifier for an interned component name.
///
/// `NameId(0)` is reserved for the `"id"` pseudo-component that every entity
/// carries; it is pre-interned by [`NameTable::new`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NameId(pub u32);

impl NameId {
    /// The reserved name of the entity-id pseudo-component.
    pub const ID: NameId = NameId(0);
}

impl fmt::Debug for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// NameTable
// ---------------------------------------------------------------------------

/// Interns component names to stable [`NameId`]s.
///
/// Interning is idempotent: the same string always yields the same id for
/// the lifetime of the table.
#[derive(Debug)]
pub struct NameTable {
    /// Indexed by `NameId.0`.
    names: Vec<String>,
    index: HashMap<String, NameId>,
}

impl NameTable {
    /// Create a table with the reserved `"id"` name pre-interned as
    /// [`NameId::ID`].
    pub fn new() -> Self {
        let mut table = Self {
            names: Vec::new(),
            index: HashMap::new(),
        };
        let id = table.intern("id");
        debug_assert_eq!(id, NameId::ID);
        table
    }

    /// Intern `name`, returning its stable id.
    pub fn intern(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(name.to_owned());
        self.index.insert(name.to_owned(), id);
        id
    }

    /// Resolve an id back to its string. Diagnostics only.
    pub fn resolve(&self, id: NameId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    /// Number of interned names (including the reserved `"id"`).
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table holds no names. Always false in practice, since
    /// `"id"` is pre-interned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_reserved() {
        let table = NameTable::new();
        assert_eq!(table.resolve(NameId::ID), Some("id"));
    }

    #[test]
    fn intern_is_idempotent() {
        let mut table = NameTable::new();
        let a = table.intern("location");
        let b = table.intern("location");
        assert_eq!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn ids_are_ordered_by_interning() {
        let mut table = NameTable::new();
        let a = table.intern("a");
        let b = table.intern("b");
        assert!(NameId::ID < a);
        assert!(a < b);
    }

    #[test]
    fn resolve_unknown_returns_none() {
        let table = NameTable::new();
        assert_eq!(table.resolve(NameId(99)), None);
    }
}
