//! The [`EntityStore`] is the top-level container. It owns the archetype
//! tree (and through it every archetype table) and the entity directory,
//! and orchestrates the component mutation protocol.
//!
//! # Mutation protocol
//!
//! `set` on a component the entity already has writes in place. Otherwise
//! the entity migrates: the tree resolves the node for the enlarged (or
//! shrunken) set, the node's table is materialized if needed, the row is
//! copied over, and the old row is swap-removed -- patching the directory
//! entry of whichever entity the swap relocated. Externally the migration
//! is atomic: the entity is observable at its old location with its old set,
//! or at its new location with its new set, never both or neither.
//!
//! All fallible allocation happens before any observable mutation, so a
//! [`StoreError::OutOfMemory`] leaves the store in its pre-call state. A
//! node materialized for a migration that then failed stays behind empty;
//! [`EntityStore::clear_cache`] reclaims it.

use crate::archetype::ColumnSpec;
use crate::entity::{EntityDirectory, EntityId, EntityLocation};
use crate::name::NameId;
use crate::query::Query;
use crate::tree::ArchetypeTree;
use crate::StoreError;

use bytemuck::Pod;

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// Owns all archetype storage and the entity directory.
///
/// Single-writer: every borrow handed out (component slices, query handles)
/// is tied to `&self` and ends before the next `&mut self` call, so any
/// mutation invalidates all outstanding readers at compile time.
pub struct EntityStore {
    tree: ArchetypeTree,
    directory: EntityDirectory,
    /// Reused staging buffer for row migration.
    row_scratch: Vec<u8>,
}

impl EntityStore {
    /// Create an empty store. The root archetype (component set `{id}`)
    /// is materialized up front; every fresh entity starts there.
    pub fn new() -> Self {
        Self {
            tree: ArchetypeTree::new(),
            directory: EntityDirectory::new(),
            row_scratch: Vec::new(),
        }
    }

    /// Read-only access to the archetype tree.
    pub fn tree(&self) -> &ArchetypeTree {
        &self.tree
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.directory.len()
    }

    /// Number of tree nodes, including the root.
    pub fn node_count(&self) -> usize {
        self.tree.node_count()
    }

    /// Number of materialized archetype tables.
    pub fn archetype_count(&self) -> usize {
        (0..self.tree.node_count() as u32)
            .filter(|&i| self.tree.archetype(i).is_some())
            .count()
    }

    /// Where an entity currently lives, or `None` if it is not live.
    pub fn location_of(&self, entity: EntityId) -> Option<EntityLocation> {
        self.directory.location(entity)
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create a new entity carrying only the reserved `id` component.
    pub fn new_entity(&mut self) -> Result<EntityId, StoreError> {
        let root = self
            .tree
            .archetype_mut(ArchetypeTree::ROOT)
            .expect("root archetype is always materialized");
        let row = root.append_undefined()?;
        let entity = self.directory.allocate();
        root.set_raw(row, NameId::ID, bytemuck::bytes_of(&entity));
        self.directory.insert(
            entity,
            EntityLocation {
                archetype_idx: ArchetypeTree::ROOT,
                row,
            },
        );
        Ok(entity)
    }

    /// Delete an entity, swap-removing its row and patching the directory
    /// entry of whichever entity the swap relocated.
    pub fn delete_entity(&mut self, entity: EntityId) -> Result<(), StoreError> {
        let loc = self
            .directory
            .remove(entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        let displaced = self
            .tree
            .archetype_mut(loc.archetype_idx)
            .expect("directory points at a materialized archetype")
            .remove(loc.row);
        if let Some(moved) = displaced {
            self.directory.set_row(moved, loc.row);
        }
        Ok(())
    }

    // -- component mutation -------------------------------------------------

    /// Set a component from raw bytes. Writes in place when the entity
    /// already has the component; otherwise migrates the entity to the
    /// archetype for its enlarged set.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` does not match `spec.size`, or if `spec.name` is
    /// the reserved `id` component (which only the store itself writes).
    pub fn set_component_raw(
        &mut self,
        entity: EntityId,
        spec: ColumnSpec,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        assert_ne!(
            spec.name,
            NameId::ID,
            "the reserved id component cannot be written"
        );
        assert_eq!(
            bytes.len(),
            spec.size as usize,
            "component {:?}: value is {} bytes, spec declares {}",
            spec.name,
            bytes.len(),
            spec.size
        );
        let loc = self
            .directory
            .location(entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        let archetype = self
            .tree
            .archetype(loc.archetype_idx)
            .expect("directory points at a materialized archetype");

        if archetype.has_component(spec.name) {
            archetype.debug_check_type(spec.name, spec.type_id);
            self.tree
                .archetype_mut(loc.archetype_idx)
                .expect("checked above")
                .set_raw(loc.row, spec.name, bytes);
            return Ok(());
        }

        // Migrate: resolve the enlarged set, splice the new column into the
        // old layout at its sorted position.
        let mut specs: Vec<ColumnSpec> = archetype.column_specs().collect();
        let pos = specs.partition_point(|c| c.name < spec.name);
        specs.insert(pos, spec);
        let new_idx = self.tree.add(loc.archetype_idx, spec.name);
        self.tree.materialize(new_idx, specs);
        self.migrate(entity, loc, new_idx, Some((spec.name, bytes)), None)
    }

    /// Typed convenience wrapper over [`set_component_raw`](Self::set_component_raw).
    pub fn set<T: Pod + 'static>(
        &mut self,
        entity: EntityId,
        name: NameId,
        value: T,
    ) -> Result<(), StoreError> {
        self.set_component_raw(entity, ColumnSpec::of::<T>(name), bytemuck::bytes_of(&value))
    }

    /// Remove a component, migrating the entity to the archetype for its
    /// shrunken set. Removing a component the entity does not have, or the
    /// reserved `id` component, is a no-op.
    pub fn remove_component(&mut self, entity: EntityId, name: NameId) -> Result<(), StoreError> {
        let loc = self
            .directory
            .location(entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        if name == NameId::ID {
            return Ok(());
        }
        let archetype = self
            .tree
            .archetype(loc.archetype_idx)
            .expect("directory points at a materialized archetype");
        if !archetype.has_component(name) {
            return Ok(());
        }

        let specs: Vec<ColumnSpec> = archetype
            .column_specs()
            .filter(|c| c.name != name)
            .collect();
        let new_idx = self.tree.remove(loc.archetype_idx, name);
        self.tree.materialize(new_idx, specs);
        self.migrate(entity, loc, new_idx, None, Some(name))
    }

    // -- component access ---------------------------------------------------

    /// Raw bytes of a component, or `None` if the entity does not have it.
    /// Zero-sized components yield an empty slice.
    pub fn get_component_raw(
        &self,
        entity: EntityId,
        name: NameId,
    ) -> Result<Option<&[u8]>, StoreError> {
        let loc = self
            .directory
            .location(entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        let archetype = self
            .tree
            .archetype(loc.archetype_idx)
            .expect("directory points at a materialized archetype");
        Ok(archetype.get_raw(loc.row, name))
    }

    /// Typed convenience wrapper over [`get_component_raw`](Self::get_component_raw).
    pub fn get<T: Pod + 'static>(
        &self,
        entity: EntityId,
        name: NameId,
    ) -> Result<Option<&T>, StoreError> {
        let loc = self
            .directory
            .location(entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        let archetype = self
            .tree
            .archetype(loc.archetype_idx)
            .expect("directory points at a materialized archetype");
        Ok(archetype
            .column_slice::<T>(name)
            .map(|column| &column[loc.row as usize]))
    }

    /// Whether the entity has the component. The reserved `id` component is
    /// always present.
    pub fn has_component(&self, entity: EntityId, name: NameId) -> Result<bool, StoreError> {
        let loc = self
            .directory
            .location(entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        Ok(self
            .tree
            .archetype(loc.archetype_idx)
            .expect("directory points at a materialized archetype")
            .has_component(name))
    }

    // -- queries ------------------------------------------------------------

    /// Iterate the archetypes whose component set contains every name in
    /// `all`. See [`Query`] for the borrowing contract.
    pub fn query<'s>(&'s self, all: &[NameId]) -> Query<'s> {
        Query::new(&self.tree, all)
    }

    // -- maintenance --------------------------------------------------------

    /// Drop archetype nodes that hold no entities and shield no descendants,
    /// releasing their storage. Directory entries are re-pointed at the
    /// compacted node indices.
    pub fn clear_cache(&mut self) {
        let remap = self.tree.clear_cache();
        self.directory.patch_archetypes(&remap);
    }

    // -- internals ----------------------------------------------------------

    /// Move an entity's row from its current archetype to `new_idx`, writing
    /// `added` into the new column (for `set`) or dropping the `removed`
    /// column's value (for `remove`).
    ///
    /// The target row is reserved -- the only fallible step -- before either
    /// table or the directory is touched, so a failure changes nothing
    /// observable.
    fn migrate(
        &mut self,
        entity: EntityId,
        loc: EntityLocation,
        new_idx: u32,
        added: Option<(NameId, &[u8])>,
        removed: Option<NameId>,
    ) -> Result<(), StoreError> {
        // Stage the source row.
        self.row_scratch.clear();
        let mut fields: Vec<(NameId, usize, usize)> = Vec::new();
        {
            let source = self
                .tree
                .archetype(loc.archetype_idx)
                .expect("source archetype exists");
            for spec in source.column_specs() {
                let bytes = source.get_raw(loc.row, spec.name).expect("column present");
                let start = self.row_scratch.len();
                self.row_scratch.extend_from_slice(bytes);
                fields.push((spec.name, start, bytes.len()));
            }
        }

        let new_row = self
            .tree
            .archetype_mut(new_idx)
            .expect("target node is materialized before migration")
            .append_undefined()?;

        {
            let target = self.tree.archetype_mut(new_idx).expect("checked above");
            for &(name, start, len) in &fields {
                if removed == Some(name) {
                    continue;
                }
                target.set_raw(new_row, name, &self.row_scratch[start..start + len]);
            }
            if let Some((name, bytes)) = added {
                target.set_raw(new_row, name, bytes);
            }
        }

        // Retire the old row; the swap may relocate another entity.
        let displaced = self
            .tree
            .archetype_mut(loc.archetype_idx)
            .expect("source archetype exists")
            .remove(loc.row);
        if let Some(moved) = displaced {
            self.directory.set_row(moved, loc.row);
        }
        self.directory.set_location(
            entity,
            EntityLocation {
                archetype_idx: new_idx,
                row: new_row,
            },
        );
        Ok(())
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entity_count", &self.entity_count())
            .field("node_count", &self.node_count())
            .field("archetype_count", &self.archetype_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::alloc_failure;
    use crate::name::NameTable;

    fn setup() -> (EntityStore, NameId, NameId, NameId) {
        let mut names = NameTable::new();
        let a = names.intern("a");
        let b = names.intern("b");
        let c = names.intern("c");
        (EntityStore::new(), a, b, c)
    }

    #[test]
    fn new_entity_starts_at_root() {
        let (mut store, _, _, _) = setup();
        let e = store.new_entity().unwrap();
        let loc = store.location_of(e).unwrap();
        assert_eq!(loc.archetype_idx, ArchetypeTree::ROOT);
        // The id column holds the entity's own id.
        assert_eq!(store.get::<EntityId>(e, NameId::ID).unwrap(), Some(&e));
    }

    #[test]
    fn set_new_component_migrates() {
        let (mut store, a, _, _) = setup();
        let e = store.new_entity().unwrap();
        store.set(e, a, 10u64).unwrap();
        let loc = store.location_of(e).unwrap();
        assert_ne!(loc.archetype_idx, ArchetypeTree::ROOT);
        assert_eq!(store.get::<u64>(e, a).unwrap(), Some(&10));
        // The root table no longer holds the entity.
        assert!(store.tree().archetype(ArchetypeTree::ROOT).unwrap().is_empty());
    }

    #[test]
    fn set_existing_component_writes_in_place() {
        let (mut store, a, _, _) = setup();
        let e = store.new_entity().unwrap();
        store.set(e, a, 10u64).unwrap();
        let before = store.location_of(e).unwrap();
        store.set(e, a, 99u64).unwrap();
        assert_eq!(store.location_of(e).unwrap(), before);
        assert_eq!(store.get::<u64>(e, a).unwrap(), Some(&99));
    }

    #[test]
    fn migration_preserves_existing_values() {
        let (mut store, a, b, c) = setup();
        let e = store.new_entity().unwrap();
        store.set(e, a, 10u64).unwrap();
        store.set(e, b, 20u64).unwrap();
        store.set(e, c, 30u64).unwrap();
        assert_eq!(store.get::<u64>(e, a).unwrap(), Some(&10));
        assert_eq!(store.get::<u64>(e, b).unwrap(), Some(&20));
        assert_eq!(store.get::<u64>(e, c).unwrap(), Some(&30));

        store.remove_component(e, b).unwrap();
        assert_eq!(store.get::<u64>(e, a).unwrap(), Some(&10));
        assert_eq!(store.get::<u64>(e, b).unwrap(), None);
        assert_eq!(store.get::<u64>(e, c).unwrap(), Some(&30));
        assert!(!store.has_component(e, b).unwrap());
    }

    #[test]
    fn remove_absent_component_is_a_no_op() {
        let (mut store, a, b, _) = setup();
        let e = store.new_entity().unwrap();
        store.set(e, a, 1u64).unwrap();
        let before = store.location_of(e).unwrap();
        store.remove_component(e, b).unwrap();
        assert_eq!(store.location_of(e).unwrap(), before);
    }

    #[test]
    fn remove_reserved_id_is_a_no_op() {
        let (mut store, _, _, _) = setup();
        let e = store.new_entity().unwrap();
        store.remove_component(e, NameId::ID).unwrap();
        assert!(store.has_component(e, NameId::ID).unwrap());
        assert_eq!(store.get::<EntityId>(e, NameId::ID).unwrap(), Some(&e));
    }

    #[test]
    fn delete_patches_the_displaced_entity() {
        let (mut store, a, _, _) = setup();
        let mut entities = Vec::new();
        for i in 1..=5u64 {
            let e = store.new_entity().unwrap();
            store.set(e, a, i * 10).unwrap();
            entities.push(e);
        }
        store.delete_entity(entities[2]).unwrap();
        assert_eq!(store.entity_count(), 4);
        // The last entity was pulled into the vacated row.
        let last = *entities.last().unwrap();
        assert_eq!(store.location_of(last).unwrap().row, 2);
        for (i, &e) in entities.iter().enumerate() {
            if i == 2 {
                continue;
            }
            assert_eq!(store.get::<u64>(e, a).unwrap(), Some(&((i as u64 + 1) * 10)));
            assert_eq!(store.get::<EntityId>(e, NameId::ID).unwrap(), Some(&e));
        }
    }

    #[test]
    fn unknown_entity_is_an_error_everywhere() {
        let (mut store, a, _, _) = setup();
        let e = store.new_entity().unwrap();
        store.delete_entity(e).unwrap();

        assert!(matches!(
            store.delete_entity(e),
            Err(StoreError::UnknownEntity(_))
        ));
        assert!(matches!(
            store.set(e, a, 1u64),
            Err(StoreError::UnknownEntity(_))
        ));
        assert!(matches!(
            store.get::<u64>(e, a),
            Err(StoreError::UnknownEntity(_))
        ));
        assert!(matches!(
            store.remove_component(e, a),
            Err(StoreError::UnknownEntity(_))
        ));
        assert!(matches!(
            store.has_component(e, a),
            Err(StoreError::UnknownEntity(_))
        ));
    }

    #[test]
    #[should_panic(expected = "reserved id component")]
    fn setting_the_reserved_id_panics() {
        let (mut store, _, _, _) = setup();
        let e = store.new_entity().unwrap();
        store.set(e, NameId::ID, 7u64).unwrap();
    }

    #[test]
    #[should_panic(expected = "spec declares")]
    fn mismatched_payload_size_panics() {
        let (mut store, a, _, _) = setup();
        let e = store.new_entity().unwrap();
        let spec = ColumnSpec {
            name: a,
            type_id: 0,
            size: 8,
            align: 8,
        };
        let _ = store.set_component_raw(e, spec, &[0u8; 4]);
    }

    #[test]
    fn zero_sized_component_roundtrip() {
        let (mut store, _, _, _) = setup();
        let mut names = NameTable::new();
        let frozen = names.intern("frozen");
        let e = store.new_entity().unwrap();
        store.set(e, frozen, ()).unwrap();
        assert!(store.has_component(e, frozen).unwrap());
        assert_eq!(store.get::<()>(e, frozen).unwrap(), Some(&()));
        store.remove_component(e, frozen).unwrap();
        assert!(!store.has_component(e, frozen).unwrap());
    }

    #[test]
    fn clear_cache_patches_directory_entries() {
        let (mut store, a, b, _) = setup();
        let e = store.new_entity().unwrap();
        store.set(e, a, 1u64).unwrap();
        store.set(e, b, 2u64).unwrap();
        store.remove_component(e, a).unwrap();
        // Intermediate nodes {a} and {a,b} are now empty.
        let nodes_before = store.node_count();
        store.clear_cache();
        assert!(store.node_count() < nodes_before);
        assert_eq!(store.get::<u64>(e, b).unwrap(), Some(&2));
        assert_eq!(store.get::<EntityId>(e, NameId::ID).unwrap(), Some(&e));
    }

    #[test]
    fn failed_set_is_transactional() {
        // The target migration needs three column buffers (id, a, b); fail
        // each allocation in turn against a fresh store.
        for fail_at in 0..3 {
            let (mut store, a, b, _) = setup();
            let e1 = store.new_entity().unwrap();
            store.set(e1, a, 10u64).unwrap();
            let e2 = store.new_entity().unwrap();
            store.set(e2, a, 20u64).unwrap();
            let loc_before = store.location_of(e1).unwrap();

            alloc_failure::fail_after(fail_at);
            let result = store.set(e1, b, 30u64);
            alloc_failure::reset();
            assert!(
                matches!(result, Err(StoreError::OutOfMemory { .. })),
                "allocation {fail_at} should have failed the set"
            );

            // Nothing observable changed.
            assert_eq!(store.location_of(e1).unwrap(), loc_before);
            assert_eq!(store.get::<u64>(e1, a).unwrap(), Some(&10));
            assert_eq!(store.get::<u64>(e2, a).unwrap(), Some(&20));
            assert_eq!(store.get::<u64>(e1, b).unwrap(), None);
            assert!(!store.has_component(e1, b).unwrap());
            assert_eq!(store.get::<EntityId>(e1, NameId::ID).unwrap(), Some(&e1));
            assert_eq!(store.get::<EntityId>(e2, NameId::ID).unwrap(), Some(&e2));

            // The partially materialized empty node is reclaimable.
            let nodes_before = store.node_count();
            store.clear_cache();
            assert!(store.node_count() < nodes_before);

            // With the hook disarmed the same operation succeeds.
            store.set(e1, b, 30u64).unwrap();
            assert_eq!(store.get::<u64>(e1, b).unwrap(), Some(&30));
            assert_eq!(store.get::<u64>(e1, a).unwrap(), Some(&10));
        }
    }

    #[test]
    fn failed_new_entity_is_transactional() {
        let (mut store, _, _, _) = setup();
        // Root capacity starts at zero, so the first append allocates.
        alloc_failure::fail_after(0);
        let result = store.new_entity();
        alloc_failure::reset();
        assert!(matches!(result, Err(StoreError::OutOfMemory { .. })));
        assert_eq!(store.entity_count(), 0);

        let e = store.new_entity().unwrap();
        assert_eq!(store.get::<EntityId>(e, NameId::ID).unwrap(), Some(&e));
    }
}
