//! Strata ECS -- archetype-based entity-component storage.
//!
//! Entities live in *archetypes*: dense, column-oriented tables, one per
//! distinct component set. Within a table each component is a contiguous
//! typed column and all columns share one row index, so iterating a
//! component set is a linear walk. Adding or removing a component migrates
//! an entity's row to the table for its new set, resolved through a
//! canonical archetype tree that maps each order-normalized component set
//! to exactly one node.
//!
//! Components are identified by interned [`NameId`](name::NameId)s rather
//! than Rust types, and payloads are plain old data ([`bytemuck::Pod`]),
//! stored and moved as raw bytes. A thin typed wrapper sits on top of the
//! raw byte API.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! let mut names = NameTable::new();
//! let location = names.intern("location");
//! let rotation = names.intern("rotation");
//!
//! let mut store = EntityStore::new();
//! let entity = store.new_entity().unwrap();
//! store.set(entity, location, [1.0f32, 2.0]).unwrap();
//! store.set(entity, rotation, 90.0f32).unwrap();
//!
//! assert_eq!(
//!     store.get::<[f32; 2]>(entity, location).unwrap(),
//!     Some(&[1.0, 2.0])
//! );
//!
//! for handle in store.query(&[location]) {
//!     let positions: &[[f32; 2]] = handle.column(location).unwrap();
//!     assert_eq!(positions.len(), handle.len());
//! }
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
pub mod entity;
pub mod name;
pub mod query;
pub mod store;
pub mod tree;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
///
/// Only recoverable conditions are errors; misuse (wrong payload size,
/// debug-mode type mismatches, writing the reserved id component) is a
/// caller bug and panics.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The entity is not present in the directory (never created, or
    /// already deleted).
    #[error("entity {0:?} is not present in the store")]
    UnknownEntity(entity::EntityId),

    /// A column buffer allocation failed. The failed operation changed
    /// nothing observable.
    #[error("column allocation of {bytes} bytes failed")]
    OutOfMemory {
        /// Size of the allocation that failed.
        bytes: usize,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ColumnSpec};
    pub use crate::entity::{EntityId, EntityLocation};
    pub use crate::name::{NameId, NameTable};
    pub use crate::query::{ArchetypeHandle, Query};
    pub use crate::store::EntityStore;
    pub use crate::tree::ArchetypeTree;
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
