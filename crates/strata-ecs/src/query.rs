//! Query primitive: iterate the archetypes matching a component set.
//!
//! [`Query`] is a lazy, forward-only iterator over [`ArchetypeHandle`]s --
//! one handle per archetype whose component set contains every requested
//! name and which currently holds at least one entity. A handle exposes the
//! archetype's columns as typed slices of equal length.
//!
//! # Borrowing contract
//!
//! A query borrows the store for its whole lifetime, so handles and the
//! slices drawn from them are valid only until the next mutating call on
//! the store; the borrow checker enforces this. Iteration order over
//! archetypes is unspecified but stable within a single iteration while no
//! mutation intervenes.

use crate::archetype::Archetype;
use crate::entity::EntityId;
use crate::name::NameId;
use crate::tree::ArchetypeTree;

use bytemuck::Pod;

// ---------------------------------------------------------------------------
// ArchetypeHandle
// ---------------------------------------------------------------------------

/// A borrowed view of one matching archetype.
#[derive(Clone, Copy)]
pub struct ArchetypeHandle<'s> {
    archetype: &'s Archetype,
    node_idx: u32,
}

impl<'s> ArchetypeHandle<'s> {
    /// Index of the archetype's node in the tree.
    #[inline]
    pub fn node_index(&self) -> u32 {
        self.node_idx
    }

    /// Number of live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.archetype.len() as usize
    }

    /// Whether the archetype has no live rows. Handles yielded by a query
    /// always have at least one.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.archetype.is_empty()
    }

    /// Whether the archetype has a column for `name`.
    #[inline]
    pub fn has_component(&self, name: NameId) -> bool {
        self.archetype.has_component(name)
    }

    /// The component names of this archetype, ascending.
    pub fn component_names(&self) -> impl Iterator<Item = NameId> + 's {
        self.archetype.component_names()
    }

    /// The column for `name` as a typed slice of length [`len`](Self::len),
    /// or `None` if the archetype has no such column.
    pub fn column<T: Pod + 'static>(&self, name: NameId) -> Option<&'s [T]> {
        self.archetype.column_slice::<T>(name)
    }

    /// The `id` column: one [`EntityId`] per row.
    pub fn entities(&self) -> &'s [EntityId] {
        self.archetype.entities()
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Lazy iterator over the archetypes containing a required component set.
pub struct Query<'s> {
    tree: &'s ArchetypeTree,
    required: Vec<NameId>,
    cursor: u32,
}

impl<'s> Query<'s> {
    pub(crate) fn new(tree: &'s ArchetypeTree, all: &[NameId]) -> Self {
        Self {
            tree,
            required: all.to_vec(),
            cursor: 0,
        }
    }
}

impl<'s> Iterator for Query<'s> {
    type Item = ArchetypeHandle<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        while (self.cursor as usize) < self.tree.node_count() {
            let node_idx = self.cursor;
            self.cursor += 1;
            let Some(archetype) = self.tree.archetype(node_idx) else {
                continue;
            };
            if archetype.is_empty() || !archetype.has_components(&self.required) {
                continue;
            }
            return Some(ArchetypeHandle {
                archetype,
                node_idx,
            });
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
