//! Entity identifiers and the entity directory.
//!
//! An [`EntityId`] is an opaque 64-bit handle allocated from a monotonic
//! counter, so an id is never reused for the lifetime of a store. The
//! [`EntityDirectory`] maps each live id to its current
//! [`EntityLocation`] -- which archetype table holds the entity and at
//! which row.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// An opaque 64-bit entity handle.
///
/// Ids start at 1 and grow monotonically; id 0 never names a live entity,
/// which makes stale zeroed memory easy to spot in diagnostics. The value is
/// `Pod` because it is also the payload of the reserved `id` column in every
/// archetype.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable)]
#[repr(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityLocation
// ---------------------------------------------------------------------------

/// Where an entity lives: which archetype node and which row within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    /// Index of the archetype node in the tree's node array.
    pub archetype_idx: u32,
    /// Row within that archetype's table.
    pub row: u32,
}

// ---------------------------------------------------------------------------
// EntityDirectory
// ---------------------------------------------------------------------------

/// Allocates [`EntityId`]s and tracks the location of every live entity.
///
/// Invariant: the `id` column of the archetype at `location.archetype_idx`,
/// row `location.row`, holds the entity's own id. The store maintains this by
/// patching the entry of whichever entity a swap-remove relocates.
#[derive(Debug)]
pub struct EntityDirectory {
    slots: HashMap<EntityId, EntityLocation>,
    next_id: u64,
}

impl EntityDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate a fresh, never-before-seen id.
    pub fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Record the location of a newly placed entity.
    pub fn insert(&mut self, entity: EntityId, location: EntityLocation) {
        self.slots.insert(entity, location);
    }

    /// Current location of an entity, or `None` if it is not live.
    #[inline]
    pub fn location(&self, entity: EntityId) -> Option<EntityLocation> {
        self.slots.get(&entity).copied()
    }

    /// Overwrite the location of a live entity.
    pub fn set_location(&mut self, entity: EntityId, location: EntityLocation) {
        self.slots.insert(entity, location);
    }

    /// Patch only the row of a live entity, keeping its archetype. Used when
    /// a swap-remove relocates the table's last row.
    pub fn set_row(&mut self, entity: EntityId, row: u32) {
        if let Some(loc) = self.slots.get_mut(&entity) {
            loc.row = row;
        }
    }

    /// Remove an entity's entry, returning its last location.
    pub fn remove(&mut self, entity: EntityId) -> Option<EntityLocation> {
        self.slots.remove(&entity)
    }

    /// Re-point every entry at compacted archetype indices after a cache
    /// clear. `remap[old_idx]` is the node's new index; nodes holding live
    /// entities always survive, so their slots are never `None`.
    pub fn patch_archetypes(&mut self, remap: &[Option<u32>]) {
        for loc in self.slots.values_mut() {
            loc.archetype_idx = remap[loc.archetype_idx as usize]
                .expect("archetypes with live entities survive a cache clear");
        }
    }

    /// Whether the entity is live.
    #[inline]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.slots.contains_key(&entity)
    }

    /// Number of live entities.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether any entities are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over all live entities and their locations.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, EntityLocation)> + '_ {
        self.slots.iter().map(|(&e, &loc)| (e, loc))
    }
}

impl Default for EntityDirectory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
