//! The archetype tree: a canonical index from component set to archetype.
//!
//! Every node represents one order-normalized component set. A node's set is
//! the chain of [`NameId`]s from the root down to it, and children strictly
//! increase in name, so walking root to leaf always yields components in
//! ascending order with no duplicates. Adding or removing one component from
//! a set is therefore a short parent-chain walk plus a rebuild below the
//! pivot ancestor, and two insertion orders of the same set always land on
//! the same node.
//!
//! Nodes live in a flat array and refer to their parent by index; node 0 is
//! the root, is its own parent, and represents the base set `{id}`. A node
//! owns its materialized [`Archetype`] table, if any entity currently (or
//! recently) had that exact set.
//!
//! A hash-bucket table maps the order-independent component-set hash to a
//! head node; archetypes whose sets collide on the hash are chained through
//! [`Archetype::next`].

use crate::archetype::{component_set_hash, Archetype, ColumnSpec};
use crate::name::NameId;

use std::collections::HashMap;
use std::mem;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Node {
    /// The component this node adds to its parent's set.
    name: NameId,
    /// Parent index in the flat node array; the root is its own parent.
    parent_idx: u32,
    /// Materialized table, present iff entities have (or had) this set.
    archetype: Option<Archetype>,
}

// ---------------------------------------------------------------------------
// ArchetypeTree
// ---------------------------------------------------------------------------

/// Generational tree of archetype nodes, deduplicating component sets.
#[derive(Debug)]
pub struct ArchetypeTree {
    nodes: Vec<Node>,
    /// Component-set hash -> head node index; collisions chain through
    /// `Archetype::next`. Only materialized nodes are registered.
    buckets: HashMap<u64, u32>,
    /// Reused walk buffer for `add`/`remove`.
    scratch: Vec<u32>,
}

impl ArchetypeTree {
    /// Index of the root node, whose set is `{id}`.
    pub const ROOT: u32 = 0;

    /// Create a tree holding only the root node, with the root archetype
    /// already materialized so fresh entities have a table to land in.
    pub fn new() -> Self {
        let mut tree = Self {
            nodes: vec![Node {
                name: NameId::ID,
                parent_idx: Self::ROOT,
                archetype: None,
            }],
            buckets: HashMap::new(),
            scratch: Vec::new(),
        };
        tree.materialize(Self::ROOT, vec![ColumnSpec::entity_id()]);
        tree
    }

    /// Number of nodes, including the root.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The component a node adds to its parent's set.
    #[inline]
    pub fn name_of(&self, idx: u32) -> NameId {
        self.nodes[idx as usize].name
    }

    /// A node's parent index. The root is its own parent.
    #[inline]
    pub fn parent_of(&self, idx: u32) -> u32 {
        self.nodes[idx as usize].parent_idx
    }

    /// The node's materialized table, if any.
    #[inline]
    pub fn archetype(&self, idx: u32) -> Option<&Archetype> {
        self.nodes[idx as usize].archetype.as_ref()
    }

    /// Mutable access to the node's materialized table, if any.
    #[inline]
    pub fn archetype_mut(&mut self, idx: u32) -> Option<&mut Archetype> {
        self.nodes[idx as usize].archetype.as_mut()
    }

    /// The full component set of a node, ascending, including the reserved
    /// `id` name contributed by the root.
    pub fn component_names(&self, idx: u32) -> Vec<NameId> {
        let mut names = Vec::new();
        let mut cur = idx;
        loop {
            names.push(self.nodes[cur as usize].name);
            if cur == Self::ROOT {
                break;
            }
            cur = self.nodes[cur as usize].parent_idx;
        }
        names.reverse();
        names
    }

    /// Whether the set at `idx` contains `name`.
    ///
    /// Walking the parent chain visits names in descending order, so the
    /// walk can stop as soon as it passes below the target.
    pub fn contains(&self, idx: u32, name: NameId) -> bool {
        let mut cur = idx;
        loop {
            let node = &self.nodes[cur as usize];
            if node.name == name {
                return true;
            }
            if node.name < name {
                return false;
            }
            cur = node.parent_idx;
        }
    }

    /// Find (or create) the node with `(parent, name)`. Deduplicates all
    /// shared prefixes.
    fn insert(&mut self, parent: u32, name: NameId) -> u32 {
        debug_assert!(
            name > self.nodes[parent as usize].name,
            "children must strictly increase in name"
        );
        if let Some(existing) = self
            .nodes
            .iter()
            .enumerate()
            .skip(1) // the root is its own parent; never a match
            .find(|(_, n)| n.parent_idx == parent && n.name == name)
        {
            return existing.0 as u32;
        }
        let idx = self.nodes.len() as u32;
        self.nodes.push(Node {
            name,
            parent_idx: parent,
            archetype: None,
        });
        idx
    }

    /// Resolve the node for "the set at `from`, plus `name`".
    ///
    /// Walks the parent chain past every component larger than `name`, then
    /// rebuilds the chain from the pivot ancestor with `name` spliced in at
    /// its sorted position. Returns `from` unchanged when the component is
    /// already present (including the reserved `id`).
    pub fn add(&mut self, from: u32, name: NameId) -> u32 {
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();

        let mut cur = from;
        let pivot = loop {
            let node = &self.nodes[cur as usize];
            if node.name == name {
                // Already in the set.
                self.scratch = scratch;
                return from;
            }
            if node.name < name {
                break cur;
            }
            scratch.push(cur);
            cur = node.parent_idx;
        };

        let mut rebuilt = self.insert(pivot, name);
        for &popped in scratch.iter().rev() {
            let popped_name = self.nodes[popped as usize].name;
            rebuilt = self.insert(rebuilt, popped_name);
        }
        self.scratch = scratch;
        rebuilt
    }

    /// Resolve the node for "the set at `from`, minus `name`".
    ///
    /// Returns `from` unchanged when the component is absent. Removing the
    /// reserved `id` component is a no-op.
    pub fn remove(&mut self, from: u32, name: NameId) -> u32 {
        if name == NameId::ID {
            return from;
        }
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();

        let mut cur = from;
        let pivot = loop {
            let node = &self.nodes[cur as usize];
            if node.name == name {
                break node.parent_idx;
            }
            if node.name < name {
                // Passed the target without finding it.
                self.scratch = scratch;
                return from;
            }
            scratch.push(cur);
            cur = node.parent_idx;
        };

        let mut rebuilt = pivot;
        for &popped in scratch.iter().rev() {
            let popped_name = self.nodes[popped as usize].name;
            rebuilt = self.insert(rebuilt, popped_name);
        }
        self.scratch = scratch;
        rebuilt
    }

    /// Materialize the table for a node, registering it in the hash-bucket
    /// index. Returns the (possibly pre-existing) table.
    ///
    /// `specs` must describe exactly the node's component set.
    pub fn materialize(&mut self, idx: u32, specs: Vec<ColumnSpec>) -> &mut Archetype {
        if self.nodes[idx as usize].archetype.is_none() {
            debug_assert_eq!(
                specs.iter().map(|s| s.name).collect::<Vec<_>>(),
                self.component_names(idx),
                "column specs must match the node's component set"
            );
            let mut archetype = Archetype::new(specs);
            let hash = archetype.set_hash();
            if let Some(&head) = self.buckets.get(&hash) {
                archetype.set_next(Some(head));
            }
            self.buckets.insert(hash, idx);
            tracing::debug!(node = idx, "materialized archetype table");
            self.nodes[idx as usize].archetype = Some(archetype);
        }
        self.nodes[idx as usize].archetype.as_mut().expect("just materialized")
    }

    /// Find the materialized node whose component set is exactly `names`.
    ///
    /// The reserved `id` name may be omitted from the query; it is implied.
    pub fn find_by_set(&self, names: &[NameId]) -> Option<u32> {
        let mut set: Vec<NameId> = names.to_vec();
        if !set.contains(&NameId::ID) {
            set.push(NameId::ID);
        }
        set.sort_unstable();
        set.dedup();

        let hash = component_set_hash(set.iter().copied());
        let mut cur = self.buckets.get(&hash).copied();
        while let Some(idx) = cur {
            let archetype = self.nodes[idx as usize]
                .archetype
                .as_ref()
                .expect("bucket entries are materialized");
            if archetype.component_names().eq(set.iter().copied()) {
                return Some(idx);
            }
            cur = archetype.next();
        }
        None
    }

    /// Drop every node that is not the root, has no live rows (no table or
    /// an empty one), and is not the parent of any other node.
    ///
    /// Removing a leaf can expose its parent as removable, so the pass
    /// repeats until a full sweep removes nothing. Surviving nodes are
    /// compacted and every `parent_idx` is patched; the bucket index is
    /// rebuilt over the surviving nodes.
    ///
    /// Returns the index remap: `remap[old_idx]` is the node's new index, or
    /// `None` if it was removed. Callers holding node indices (the entity
    /// directory) must apply the remap.
    pub fn clear_cache(&mut self) -> Vec<Option<u32>> {
        let original = self.nodes.len();
        let mut remap: Vec<Option<u32>> = (0..original as u32).map(Some).collect();

        loop {
            let count = self.nodes.len();
            let mut has_child = vec![false; count];
            for node in &self.nodes[1..] {
                has_child[node.parent_idx as usize] = true;
            }

            let mut new_index: Vec<Option<u32>> = Vec::with_capacity(count);
            let mut kept_count = 0u32;
            for (i, node) in self.nodes.iter().enumerate() {
                let keep = i == Self::ROOT as usize
                    || has_child[i]
                    || node.archetype.as_ref().is_some_and(|a| !a.is_empty());
                if keep {
                    new_index.push(Some(kept_count));
                    kept_count += 1;
                } else {
                    new_index.push(None);
                }
            }
            if kept_count as usize == count {
                break;
            }

            let mut kept = Vec::with_capacity(kept_count as usize);
            for (i, node) in self.nodes.drain(..).enumerate() {
                if new_index[i].is_some() {
                    kept.push(node);
                }
            }
            for node in &mut kept {
                node.parent_idx =
                    new_index[node.parent_idx as usize].expect("a parent always survives");
            }
            self.nodes = kept;

            for slot in remap.iter_mut() {
                *slot = slot.and_then(|cur| new_index[cur as usize]);
            }
        }

        self.rebuild_buckets();
        tracing::debug!(
            removed = original - self.nodes.len(),
            remaining = self.nodes.len(),
            "cleared archetype cache"
        );
        remap
    }

    fn rebuild_buckets(&mut self) {
        self.buckets.clear();
        for i in 0..self.nodes.len() {
            let Some(hash) = self.nodes[i].archetype.as_ref().map(|a| a.set_hash()) else {
                continue;
            };
            let head = self.buckets.get(&hash).copied();
            let archetype = self.nodes[i].archetype.as_mut().expect("checked above");
            archetype.set_next(head);
            self.buckets.insert(hash, i as u32);
        }
    }
}

impl Default for ArchetypeTree {
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
    use crate::entity::EntityId;

    const A: NameId = NameId(1);
    const B: NameId = NameId(2);
    const C: NameId = NameId(3);

    /// Build u64 column specs matching a node's set, for materializing in
    /// tests.
    fn specs_for(tree: &ArchetypeTree, idx: u32) -> Vec<ColumnSpec> {
        tree.component_names(idx)
            .into_iter()
            .map(|name| {
                if name == NameId::ID {
                    ColumnSpec::entity_id()
                } else {
                    ColumnSpec::of::<u64>(name)
                }
            })
            .collect()
    }

    /// Materialize a node and give it one live row.
    fn occupy(tree: &mut ArchetypeTree, idx: u32, entity: u64) {
        let specs = specs_for(tree, idx);
        let archetype = tree.materialize(idx, specs);
        let row = archetype.append_undefined().unwrap();
        let id = EntityId::from_raw(entity);
        archetype.set_raw(row, NameId::ID, bytemuck::bytes_of(&id));
        for name in tree.component_names(idx) {
            if name != NameId::ID {
                tree.archetype_mut(idx)
                    .unwrap()
                    .set_raw(row, name, &0u64.to_ne_bytes());
            }
        }
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut tree = ArchetypeTree::new();
        let abc = {
            let ab = tree.add(ArchetypeTree::ROOT, A);
            let ab = tree.add(ab, B);
            tree.add(ab, C)
        };
        let cba = {
            let c = tree.add(ArchetypeTree::ROOT, C);
            let cb = tree.add(c, B);
            tree.add(cb, A)
        };
        let bac = {
            let b = tree.add(ArchetypeTree::ROOT, B);
            let ba = tree.add(b, A);
            tree.add(ba, C)
        };
        assert_eq!(abc, cba);
        assert_eq!(abc, bac);
        assert_eq!(tree.component_names(abc), vec![NameId::ID, A, B, C]);
    }

    #[test]
    fn shared_prefixes_are_deduplicated() {
        let mut tree = ArchetypeTree::new();
        let a1 = tree.add(ArchetypeTree::ROOT, A);
        let a2 = tree.add(ArchetypeTree::ROOT, A);
        assert_eq!(a1, a2);
        let ab = tree.add(a1, B);
        // {A,C} and {A,B} share the {A} prefix node.
        let ac = tree.add(a1, C);
        assert_eq!(tree.parent_of(ab), a1);
        assert_eq!(tree.parent_of(ac), a1);
    }

    #[test]
    fn add_existing_component_is_identity() {
        let mut tree = ArchetypeTree::new();
        let ab = {
            let a = tree.add(ArchetypeTree::ROOT, A);
            tree.add(a, B)
        };
        assert_eq!(tree.add(ab, A), ab);
        assert_eq!(tree.add(ab, B), ab);
        assert_eq!(tree.add(ab, NameId::ID), ab);
    }

    #[test]
    fn remove_walks_back_to_the_right_set() {
        let mut tree = ArchetypeTree::new();
        let abc = {
            let a = tree.add(ArchetypeTree::ROOT, A);
            let ab = tree.add(a, B);
            tree.add(ab, C)
        };
        let ac = tree.remove(abc, B);
        assert_eq!(tree.component_names(ac), vec![NameId::ID, A, C]);

        // Removing from the leaf end just pops the chain.
        let ab = tree.remove(abc, C);
        assert_eq!(tree.component_names(ab), vec![NameId::ID, A, B]);

        // Rebuilt chains reuse existing nodes.
        let a = tree.add(ArchetypeTree::ROOT, A);
        assert_eq!(tree.add(a, C), ac);
    }

    #[test]
    fn remove_absent_component_is_identity() {
        let mut tree = ArchetypeTree::new();
        let ac = {
            let a = tree.add(ArchetypeTree::ROOT, A);
            tree.add(a, C)
        };
        assert_eq!(tree.remove(ac, B), ac);
        assert_eq!(tree.remove(ArchetypeTree::ROOT, A), ArchetypeTree::ROOT);
    }

    #[test]
    fn remove_reserved_id_is_identity() {
        let mut tree = ArchetypeTree::new();
        let a = tree.add(ArchetypeTree::ROOT, A);
        assert_eq!(tree.remove(a, NameId::ID), a);
        assert_eq!(tree.remove(ArchetypeTree::ROOT, NameId::ID), ArchetypeTree::ROOT);
    }

    #[test]
    fn contains_matches_the_set() {
        let mut tree = ArchetypeTree::new();
        let ac = {
            let a = tree.add(ArchetypeTree::ROOT, A);
            tree.add(a, C)
        };
        assert!(tree.contains(ac, A));
        assert!(!tree.contains(ac, B));
        assert!(tree.contains(ac, C));
        // The reserved id is part of every set.
        assert!(tree.contains(ac, NameId::ID));
        assert!(tree.contains(ArchetypeTree::ROOT, NameId::ID));
    }

    #[test]
    fn contains_after_add_and_remove() {
        let mut tree = ArchetypeTree::new();
        let a = tree.add(ArchetypeTree::ROOT, A);
        let ab = tree.add(a, B);
        assert!(tree.contains(ab, B));
        let back = tree.remove(ab, B);
        assert!(!tree.contains(back, B));
    }

    #[test]
    fn find_by_set_uses_the_bucket_table() {
        let mut tree = ArchetypeTree::new();
        let ab = {
            let a = tree.add(ArchetypeTree::ROOT, A);
            tree.add(a, B)
        };
        let specs = specs_for(&tree, ab);
        tree.materialize(ab, specs);

        // Order and the implied id do not matter.
        assert_eq!(tree.find_by_set(&[B, A]), Some(ab));
        assert_eq!(tree.find_by_set(&[NameId::ID, A, B]), Some(ab));
        assert_eq!(tree.find_by_set(&[]), Some(ArchetypeTree::ROOT));
        // Unmaterialized or unknown sets are not found.
        assert_eq!(tree.find_by_set(&[A]), None);
        assert_eq!(tree.find_by_set(&[A, B, C]), None);
    }

    #[test]
    fn clear_cache_retains_occupied_chains() {
        let mut tree = ArchetypeTree::new();
        let a = tree.add(ArchetypeTree::ROOT, A);
        let ab = tree.add(a, B);
        let abc = tree.add(ab, C);
        occupy(&mut tree, abc, 1);
        assert_eq!(tree.node_count(), 4);

        // The whole ancestor chain of the occupied leaf survives.
        let remap = tree.clear_cache();
        assert_eq!(tree.node_count(), 4);
        assert!(remap.iter().all(|r| r.is_some()));
    }

    #[test]
    fn clear_cache_removes_empty_chains_to_fixpoint() {
        let mut tree = ArchetypeTree::new();
        let a = tree.add(ArchetypeTree::ROOT, A);
        let ab = tree.add(a, B);
        let abc = tree.add(ab, C);
        occupy(&mut tree, a, 1);
        // ab and abc have no rows; abc protects ab until it is removed, so
        // a single call must iterate to the fixed point.
        let specs = specs_for(&tree, ab);
        tree.materialize(ab, specs);

        let remap = tree.clear_cache();
        assert_eq!(tree.node_count(), 2);
        let new_a = remap[a as usize].unwrap();
        assert_eq!(tree.component_names(new_a), vec![NameId::ID, A]);
        assert_eq!(remap[ab as usize], None);
        assert_eq!(remap[abc as usize], None);

        // The bucket table was rebuilt over the survivors.
        assert_eq!(tree.find_by_set(&[A]), Some(new_a));
        assert_eq!(tree.find_by_set(&[A, B]), None);
    }

    #[test]
    fn clear_cache_keeps_empty_parent_of_occupied_child() {
        let mut tree = ArchetypeTree::new();
        let a = tree.add(ArchetypeTree::ROOT, A);
        let ab = tree.add(a, B);
        occupy(&mut tree, ab, 1);
        // `a` itself is empty and unmaterialized, but it is on the occupied
        // node's parent chain.
        tree.clear_cache();
        assert_eq!(tree.node_count(), 3);
    }
}
