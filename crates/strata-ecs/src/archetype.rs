//! Archetype table storage.
//!
//! An [`Archetype`] is a dense, column-oriented table holding every entity
//! that has one exact set of components. Each component is a [`Column`] --
//! a type-erased byte buffer -- and all columns of an archetype share one
//! logical length and capacity, so row `r` is the tuple of every column's
//! element `r`. Columns are kept sorted ascending by [`NameId`], which makes
//! the table layout a function of the component set alone.
//!
//! Component payloads are plain old data: columns move rows with raw byte
//! copies and never run destructors. The typed access paths are therefore
//! bounded by [`bytemuck::Pod`].
//!
//! # Safety
//!
//! This module contains `unsafe` code because component data is stored in
//! manually managed, alignment-correct byte buffers. All pointer arithmetic
//! is confined to [`Column`]; the rest of the crate only sees safe slices.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use crate::entity::EntityId;
use crate::name::{NameId, NameTable};
use crate::StoreError;

use bytemuck::Pod;
use std::alloc::{self, Layout};
use std::ptr;
use std::slice;

// ---------------------------------------------------------------------------
// Type identity
// ---------------------------------------------------------------------------

/// Derive a 32-bit identity for a Rust type, used only for debug-mode checks
/// that a column is read and written with one consistent type. Never used for
/// archetype identity, which is a function of the [`NameId`] set.
///
/// The key is never 0; callers of the raw byte API may pass 0 to mean
/// "no type identity available", which disables the check for that access.
pub fn type_key<T: 'static>() -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::any::TypeId::of::<T>().hash(&mut hasher);
    let key = hasher.finish() as u32;
    if key == 0 {
        1
    } else {
        key
    }
}

// ---------------------------------------------------------------------------
// ColumnSpec
// ---------------------------------------------------------------------------

/// Per-column metadata: which component a column stores and its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Interned component name.
    pub name: NameId,
    /// Debug-only type identity; 0 when the caller cannot supply one.
    pub type_id: u32,
    /// Element size in bytes. 0 means a zero-sized component: membership is
    /// tracked but no bytes are stored.
    pub size: u32,
    /// Element alignment.
    pub align: u16,
}

impl ColumnSpec {
    /// Spec for a column storing values of type `T` under `name`.
    pub fn of<T: Pod + 'static>(name: NameId) -> Self {
        Self {
            name,
            type_id: type_key::<T>(),
            size: std::mem::size_of::<T>() as u32,
            align: std::mem::align_of::<T>() as u16,
        }
    }

    /// Spec for the reserved `id` column present in every archetype.
    pub(crate) fn entity_id() -> Self {
        Self::of::<EntityId>(NameId::ID)
    }
}

// ---------------------------------------------------------------------------
// Component-set hash
// ---------------------------------------------------------------------------

/// Order-independent 64-bit hash of a component-name set. Two archetypes
/// with the same set hash to the same bucket no matter how the set was built.
pub fn component_set_hash(names: impl Iterator<Item = NameId>) -> u64 {
    names.fold(0u64, |acc, name| acc ^ mix(u64::from(name.0) + 1))
}

/// splitmix64 finalizer; spreads small integer NameIds over the hash space.
fn mix(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

// ---------------------------------------------------------------------------
// Fallible allocation
// ---------------------------------------------------------------------------


fn try_alloc(layout: Layout) -> Result<*mut u8, StoreError> {
    #[cfg(test)]
    if alloc_failure::should_fail() {
        return Err(StoreError::OutOfMemory {
            bytes: layout.size(),
        });
    }
    // Safety: layout has non-zero size; callers only request layouts built
    // by Column::layout_for.
    let ptr = unsafe { alloc::alloc(layout) };
    if ptr.is_null() {
        Err(StoreError::OutOfMemory {
            bytes: layout.size(),
        })
    } else {
        Ok(ptr)
    }
}

fn try_realloc(
    ptr: *mut u8,
    old_layout: Layout,
    new_size: usize,
) -> Result<*mut u8, StoreError> {
    #[cfg(test)]
    if alloc_failure::should_fail() {
        return Err(StoreError::OutOfMemory { bytes: new_size });
    }
    // Safety: ptr was allocated with old_layout by try_alloc/try_realloc.
    // On failure the original block is left untouched, which the
    // transactional mutation paths rely on.
    let new_ptr = unsafe { alloc::realloc(ptr, old_layout, new_size) };
    if new_ptr.is_null() {
        Err(StoreError::OutOfMemory { bytes: new_size })
    } else {
        Ok(new_ptr)
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// One component's densely packed, type-erased value array.
///
/// A column does not track the live row count; that lives on the owning
/// [`Archetype`], which keeps all of its columns at one shared length.
pub struct Column {
    spec: ColumnSpec,
    /// Buffer of `buf_cap * spec.size` bytes aligned to `spec.align`.
    /// Null while nothing has been allocated; dangling-aligned for
    /// zero-sized components.
    data: *mut u8,
    /// Elements the current allocation can hold. May exceed the archetype's
    /// logical capacity after a partially failed growth; never less.
    buf_cap: u32,
}

// Columns hold plain bytes of Pod components.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    fn new(spec: ColumnSpec) -> Self {
        let data = if spec.size == 0 {
            // Zero-sized component: no storage, keep an aligned dangling
            // pointer so slice construction stays valid.
            spec.align as *mut u8
        } else {
            ptr::null_mut()
        };
        Self {
            spec,
            data,
            buf_cap: 0,
        }
    }

    /// The column's metadata.
    #[inline]
    pub fn spec(&self) -> &ColumnSpec {
        &self.spec
    }

    fn layout_for(&self, cap: u32) -> Layout {
        let bytes = (self.spec.size as usize)
            .checked_mul(cap as usize)
            .expect("column layout overflow");
        Layout::from_size_align(bytes, self.spec.align as usize).expect("invalid column layout")
    }

    /// Grow the backing buffer to hold at least `cap` elements, preserving
    /// contents. On failure the existing buffer is untouched.
    fn grow_to(&mut self, cap: u32) -> Result<(), StoreError> {
        if self.spec.size == 0 || cap <= self.buf_cap {
            return Ok(());
        }
        let new_layout = self.layout_for(cap);
        let new_data = if self.buf_cap == 0 {
            try_alloc(new_layout)?
        } else {
            try_realloc(self.data, self.layout_for(self.buf_cap), new_layout.size())?
        };
        self.data = new_data;
        self.buf_cap = cap;
        Ok(())
    }

    /// Raw bytes of element `row`. Caller bounds-checks `row` against the
    /// archetype length and guarantees the row was written.
    #[inline]
    fn bytes_at(&self, row: u32) -> &[u8] {
        let size = self.spec.size as usize;
        if size == 0 {
            return &[];
        }
        debug_assert!(row < self.buf_cap);
        // Safety: row is within the allocated buffer.
        unsafe { slice::from_raw_parts(self.data.add(row as usize * size), size) }
    }

    /// Overwrite element `row` with `bytes`. Caller checks the length.
    #[inline]
    fn write_at(&mut self, row: u32, bytes: &[u8]) {
        let size = self.spec.size as usize;
        if size == 0 {
            return;
        }
        debug_assert_eq!(bytes.len(), size);
        debug_assert!(row < self.buf_cap);
        // Safety: row is within the allocated buffer; bytes has exactly
        // `size` bytes.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(row as usize * size), size);
        }
    }

    /// Copy element `src` over element `dst` (swap-remove step).
    #[inline]
    fn copy_row(&mut self, src: u32, dst: u32) {
        let size = self.spec.size as usize;
        if size == 0 || src == dst {
            return;
        }
        // Safety: both rows are within the allocated buffer and distinct.
        unsafe {
            ptr::copy_nonoverlapping(
                self.data.add(src as usize * size),
                self.data.add(dst as usize * size),
                size,
            );
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.spec.name)
            .field("size", &self.spec.size)
            .field("align", &self.spec.align)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// A dense table of every entity with one exact component set.
///
/// The first column is always the reserved `id` column ([`NameId::ID`],
/// payload [`EntityId`]); the root archetype contains only it.
pub struct Archetype {
    /// Sorted ascending by `NameId`, unique by name.
    columns: Vec<Column>,
    /// Live row count, shared by all columns.
    len: u32,
    /// Allocated row count, shared by all columns. Never shrinks.
    capacity: u32,
    /// Order-independent hash of the component-name set.
    set_hash: u64,
    /// Next archetype node in this hash bucket's collision chain.
    next: Option<u32>,
}

impl Archetype {
    /// Create an empty table for the given column layout.
    ///
    /// `specs` must be sorted ascending by name, unique, and start with the
    /// reserved `id` column.
    pub fn new(specs: Vec<ColumnSpec>) -> Self {
        debug_assert!(!specs.is_empty() && specs[0].name == NameId::ID);
        debug_assert!(specs.windows(2).all(|w| w[0].name < w[1].name));
        let set_hash = component_set_hash(specs.iter().map(|s| s.name));
        Self {
            columns: specs.into_iter().map(Column::new).collect(),
            len: 0,
            capacity: 0,
            set_hash,
            next: None,
        }
    }

    /// Live row count.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the table has no live rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated row count.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The component-set hash used for bucket lookup.
    #[inline]
    pub fn set_hash(&self) -> u64 {
        self.set_hash
    }

    /// Next node in this hash bucket's collision chain.
    #[inline]
    pub fn next(&self) -> Option<u32> {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Option<u32>) {
        self.next = next;
    }

    /// Column metadata, in canonical (ascending-name) order.
    pub fn column_specs(&self) -> impl Iterator<Item = ColumnSpec> + '_ {
        self.columns.iter().map(|c| c.spec)
    }

    /// Component names, in canonical order.
    pub fn component_names(&self) -> impl Iterator<Item = NameId> + '_ {
        self.columns.iter().map(|c| c.spec.name)
    }

    /// Number of columns (component count, including the `id` column).
    #[inline]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_position(&self, name: NameId) -> Option<usize> {
        // Linear scan: component counts are small in practice.
        self.columns.iter().position(|c| c.spec.name == name)
    }

    /// The column storing `name`, if this archetype has it.
    pub fn column_by_name(&self, name: NameId) -> Option<&Column> {
        self.column_position(name).map(|i| &self.columns[i])
    }

    /// Whether this archetype has a column for `name`.
    #[inline]
    pub fn has_component(&self, name: NameId) -> bool {
        self.column_position(name).is_some()
    }

    /// Whether this archetype has a column for every name in `names`.
    pub fn has_components(&self, names: &[NameId]) -> bool {
        names.iter().all(|&n| self.has_component(n))
    }

    /// Grow every column to hold at least `total` rows. Never shrinks. The
    /// logical capacity only advances once every column has grown, so a
    /// failed growth leaves the table usable at its previous capacity.
    pub fn ensure_total_capacity(&mut self, total: u32) -> Result<(), StoreError> {
        if total <= self.capacity {
            return Ok(());
        }
        for column in &mut self.columns {
            column.grow_to(total)?;
        }
        self.capacity = total;
        Ok(())
    }

    /// Reserve one uninitialized row and return its index. The caller must
    /// write every column of the row before reading it back.
    pub fn append_undefined(&mut self) -> Result<u32, StoreError> {
        if self.len == self.capacity {
            let grown = self
                .capacity
                .saturating_add(self.capacity / 2)
                .saturating_add(8);
            self.ensure_total_capacity(grown)?;
        }
        self.len += 1;
        Ok(self.len - 1)
    }

    /// Append a fully specified row. `values` must name every column of this
    /// archetype exactly once; each payload length must match its column.
    ///
    /// Returns the new row index.
    pub fn append(&mut self, values: &[(NameId, &[u8])]) -> Result<u32, StoreError> {
        debug_assert_eq!(
            values.len(),
            self.columns.len(),
            "append must provide a value for every column"
        );
        let row = self.append_undefined()?;
        for &(name, bytes) in values {
            self.set_raw(row, name, bytes);
        }
        Ok(row)
    }

    /// Write `bytes` into column `name` at `row`.
    ///
    /// # Panics
    ///
    /// Panics if the archetype has no such column, if `bytes` is not exactly
    /// the column's element size, or if `row` is out of bounds. All of these
    /// are caller bugs, not runtime conditions.
    pub fn set_raw(&mut self, row: u32, name: NameId, bytes: &[u8]) {
        assert!(
            row < self.len,
            "row {row} out of bounds for archetype of length {}",
            self.len
        );
        let pos = self
            .column_position(name)
            .unwrap_or_else(|| panic!("archetype has no column for component {name:?}"));
        let column = &mut self.columns[pos];
        assert_eq!(
            bytes.len(),
            column.spec.size as usize,
            "component {name:?}: value is {} bytes, column stores {}",
            bytes.len(),
            column.spec.size
        );
        column.write_at(row, bytes);
    }

    /// Raw bytes of column `name` at `row`, or `None` if the archetype has
    /// no such column. Zero-sized components yield an empty slice.
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of bounds.
    pub fn get_raw(&self, row: u32, name: NameId) -> Option<&[u8]> {
        assert!(
            row < self.len,
            "row {row} out of bounds for archetype of length {}",
            self.len
        );
        self.column_by_name(name).map(|c| c.bytes_at(row))
    }

    /// The full column for `name` as a typed slice of length `len`.
    ///
    /// # Panics
    ///
    /// Panics if `T`'s size does not match the column's element size. In
    /// debug builds, also checks the recorded type identity when both sides
    /// supplied one.
    pub fn column_slice<T: Pod + 'static>(&self, name: NameId) -> Option<&[T]> {
        let column = self.column_by_name(name)?;
        assert_eq!(
            std::mem::size_of::<T>(),
            column.spec.size as usize,
            "component {name:?}: requested type is {} bytes, column stores {}",
            std::mem::size_of::<T>(),
            column.spec.size
        );
        assert!(
            column.spec.align as usize >= std::mem::align_of::<T>(),
            "component {name:?}: column alignment {} is below the requested type's {}",
            column.spec.align,
            std::mem::align_of::<T>()
        );
        self.debug_check_type(name, type_key::<T>());
        if self.len == 0 {
            return Some(&[]);
        }
        // Safety: the buffer holds at least `len` elements of a Pod type
        // whose size and (by construction of the column) alignment match T.
        Some(unsafe { slice::from_raw_parts(column.data as *const T, self.len as usize) })
    }

    /// The `id` column as a slice of [`EntityId`], one per live row.
    pub fn entities(&self) -> &[EntityId] {
        self.column_slice::<EntityId>(NameId::ID)
            .expect("every archetype has the id column")
    }

    /// The entity stored at `row`.
    pub fn entity_at(&self, row: u32) -> EntityId {
        *bytemuck::from_bytes(self.get_raw(row, NameId::ID).expect("id column"))
    }

    /// Swap-remove `row`: the last row's bytes overwrite `row` in every
    /// column and the length drops by one. Row order is not preserved.
    ///
    /// Returns the entity that was relocated into `row`, if the removed row
    /// was not the last; the caller patches that entity's directory entry.
    pub fn remove(&mut self, row: u32) -> Option<EntityId> {
        assert!(
            row < self.len,
            "row {row} out of bounds for archetype of length {}",
            self.len
        );
        let last = self.len - 1;
        if row != last {
            for column in &mut self.columns {
                column.copy_row(last, row);
            }
        }
        self.len = last;
        if row < self.len {
            Some(self.entity_at(row))
        } else {
            None
        }
    }

    /// Debug-mode check that an access under `name` uses the type the column
    /// was created with. Skipped when either side has no type identity (0).
    #[inline]
    pub fn debug_check_type(&self, name: NameId, type_id: u32) {
        #[cfg(debug_assertions)]
        if let Some(column) = self.column_by_name(name) {
            assert!(
                column.spec.type_id == 0 || type_id == 0 || column.spec.type_id == type_id,
                "component {name:?} accessed with a different type than it was stored with"
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = (name, type_id);
    }

    /// Human-readable component set, e.g. `{id, location, rotation}`.
    /// Diagnostics only.
    pub fn describe(&self, names: &NameTable) -> String {
        let parts: Vec<&str> = self
            .columns
            .iter()
            .map(|c| names.resolve(c.spec.name).unwrap_or("?"))
            .collect();
        format!("{{{}}}", parts.join(", "))
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for column in &mut self.columns {
            if column.spec.size > 0 && column.buf_cap > 0 {
                let layout = column.layout_for(column.buf_cap);
                // Safety: data was allocated with exactly this layout.
                // Components are Pod, so no destructors run.
                unsafe { alloc::dealloc(column.data, layout) };
            }
        }
    }
}

impl std::fmt::Debug for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archetype")
            .field("components", &self.columns)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
