//! Concurrent B-link tree over an engine stack
//!
//! An ordered map stored one node per record. Every node knows its key
//! range and carries a link to its right sibling, so a reader that races
//! a split simply chases the link instead of taking a lock. Writers do
//! not lock either: a mutation builds the updated node image and
//! publishes it with one compare-and-swap on the node's record, retrying
//! from the root when another writer got there first.
//!
//! Split protocol (the write order matters):
//! 1. Allocate the new right sibling holding the upper half of the
//!    entries.
//! 2. CAS the old record to its reduced left half with the link pointing
//!    at the sibling. The tree is consistent from this moment: moved
//!    entries stay reachable through the link, so a failure later in the
//!    protocol degrades balance, never correctness.
//! 3. Insert the separator key and the sibling pointer into the parent
//!    recorded during descent, again by CAS. The separator routes there
//!    by key position alone, chasing sibling links when concurrent
//!    splits moved its range right; an overflowing parent splits the
//!    same way, one level higher.
//! 4. A root split allocates a replacement root directory and swaps the
//!    root pointer record.
//! A lost CAS at step 2 deletes the unpublished sibling and retries from
//! scratch.

use std::collections::VecDeque;
use std::sync::Arc;

use lodestore_core::{Codec, Engine, Recid, StoreError, StoreResult, NIL_RECID};

use crate::node::{decode_node, encode_node, LeafSlot, Node, NodeContent};

/// Cap on optimistic retries and link hops per operation
const RETRY_LIMIT: u32 = 10_000;

/// Smallest workable node size: a split must leave both halves room for
/// their bounds and at least one entry or child
const MIN_NODE_KEYS: usize = 4;

/// Ordered map over any [`Engine`] stack, one node per record
///
/// Keys and values pass through caller-supplied codecs; `max_node_keys`
/// caps the stored keys per node (range bounds included) and decides when
/// nodes split. The tree itself is just two recids of state: the root
/// pointer record and what it designates. Clone-free sharing comes from
/// wrapping the tree in an `Arc`; all operations take `&self`.
pub struct BTree<K, V> {
    engine: Arc<dyn Engine>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    root_pointer: Recid,
    max_node_keys: usize,
}

impl<K, V> std::fmt::Debug for BTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root_pointer", &self.root_pointer)
            .field("max_node_keys", &self.max_node_keys)
            .finish_non_exhaustive()
    }
}

/// A split separator on its way to the parent level
struct PendingSplit<K> {
    left: Recid,
    separator: K,
    right: Recid,
    /// Height of the node that split, leaves at zero; the separator
    /// belongs one level higher
    height: usize,
}

fn decode_root_pointer(payload: &[u8]) -> StoreResult<Recid> {
    let bytes: [u8; 8] = payload.try_into().map_err(|_| StoreError::Corrupted {
        context: "root pointer",
        detail: format!("expected 8 bytes, found {}", payload.len()),
    })?;
    Ok(Recid::from_le_bytes(bytes))
}

fn not_a_leaf() -> StoreError {
    StoreError::Corrupted {
        context: "b-tree descent",
        detail: "descent ended on a directory node".into(),
    }
}

fn check_node_capacity(max_node_keys: usize) -> StoreResult<()> {
    if max_node_keys < MIN_NODE_KEYS {
        return Err(StoreError::InvalidConfig {
            reason: format!(
                "max_node_keys {} is below the minimum of {}",
                max_node_keys, MIN_NODE_KEYS
            ),
        });
    }
    Ok(())
}

impl<K, V> BTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    /// Create a fresh tree: one empty root leaf plus the root pointer
    /// record. Persist [`BTree::root_pointer`] to re-attach later.
    pub fn create(
        engine: Arc<dyn Engine>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        max_node_keys: usize,
    ) -> StoreResult<Self> {
        check_node_capacity(max_node_keys)?;
        let root = Node::<K, V>::empty_root_leaf();
        let payload = encode_node(&root, key_codec.as_ref(), value_codec.as_ref())?;
        let root_recid = engine.allocate(&payload)?;
        let root_pointer = engine.allocate(&root_recid.to_le_bytes())?;
        Ok(Self {
            engine,
            key_codec,
            value_codec,
            root_pointer,
            max_node_keys,
        })
    }

    /// Re-attach to a tree created earlier. Validates the pointer record
    /// and the root node it designates before returning.
    pub fn open(
        engine: Arc<dyn Engine>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        max_node_keys: usize,
        root_pointer: Recid,
    ) -> StoreResult<Self> {
        check_node_capacity(max_node_keys)?;
        let tree = Self {
            engine,
            key_codec,
            value_codec,
            root_pointer,
            max_node_keys,
        };
        let root = tree.read_root()?;
        tree.load_node(root)?;
        Ok(tree)
    }

    /// Recid of the root pointer record; stable for the tree's lifetime
    pub fn root_pointer(&self) -> Recid {
        self.root_pointer
    }

    /// Rebind the tree to another engine handle over the same records,
    /// typically a snapshot view for a frozen, consistent read pass
    pub fn snapshot_view(&self, engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            key_codec: Arc::clone(&self.key_codec),
            value_codec: Arc::clone(&self.value_codec),
            root_pointer: self.root_pointer,
            max_node_keys: self.max_node_keys,
        }
    }

    /// Look up the value stored under `key`
    pub fn get(&self, key: &K) -> StoreResult<Option<V>> {
        let mut attempts = 0;
        let (_, _, node, _) = self.locate_leaf(key, &mut attempts)?;
        let values = match &node.content {
            NodeContent::Values(values) => values,
            NodeContent::Children(_) => return Err(not_a_leaf()),
        };
        match node.leaf_slot(key) {
            LeafSlot::Found(slot) => Ok(Some(values[slot].clone())),
            LeafSlot::Missing(_) => Ok(None),
        }
    }

    /// Insert or replace; returns the prior value when the key was present
    pub fn insert(&self, key: K, value: V) -> StoreResult<Option<V>> {
        self.upsert(key, value, true)
    }

    /// Insert only when absent. A present key keeps its stored value,
    /// which is returned; `None` means this call inserted.
    pub fn insert_if_absent(&self, key: K, value: V) -> StoreResult<Option<V>> {
        self.upsert(key, value, false)
    }

    /// Remove `key`; returns the value it held
    pub fn remove(&self, key: &K) -> StoreResult<Option<V>> {
        let mut attempts = 0;
        loop {
            let (recid, payload, node, _) = self.locate_leaf(key, &mut attempts)?;
            let slot = match node.leaf_slot(key) {
                LeafSlot::Found(slot) => slot,
                LeafSlot::Missing(_) => return Ok(None),
            };
            let offset = node.key_offset();
            let mut updated = node.clone();
            let removed = match &mut updated.content {
                NodeContent::Values(values) => values.remove(slot),
                NodeContent::Children(_) => return Err(not_a_leaf()),
            };
            updated.keys.remove(offset + slot);
            updated.refresh_double_flag();
            let fresh = self.encode(&updated)?;
            if self.engine.compare_and_swap(recid, &payload, &fresh)? {
                return Ok(Some(removed));
            }
            self.bump(&mut attempts)?;
        }
    }

    /// Entries in ascending key order, walking leaves through their
    /// sibling links. Concurrent mutations may or may not be observed;
    /// iterate through a snapshot view for a frozen picture.
    pub fn iter(&self) -> StoreResult<Iter<'_, K, V>> {
        let mut attempts = 0;
        let mut current = self.read_root()?;
        loop {
            self.bump(&mut attempts)?;
            let (_, node) = self.load_node(current)?;
            match &node.content {
                NodeContent::Children(children) => current = children[0],
                NodeContent::Values(_) => {
                    let link = node.link;
                    return Ok(Iter {
                        tree: self,
                        buffer: node.into_entries().into(),
                        next_leaf: link,
                        failed: false,
                    });
                }
            }
        }
    }

    /// Entries with keys greater than or equal to `from`, ascending
    pub fn iter_from(&self, from: &K) -> StoreResult<Iter<'_, K, V>> {
        let mut attempts = 0;
        let (_, _, node, _) = self.locate_leaf(from, &mut attempts)?;
        let link = node.link;
        let mut buffer: VecDeque<(K, V)> = node.into_entries().into();
        while let Some((key, _)) = buffer.front() {
            if *key >= *from {
                break;
            }
            buffer.pop_front();
        }
        Ok(Iter {
            tree: self,
            buffer,
            next_leaf: link,
            failed: false,
        })
    }

    /// Number of entries, counted by walking every leaf
    pub fn len(&self) -> StoreResult<usize> {
        let mut count = 0;
        for entry in self.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// True when the tree holds no entries
    pub fn is_empty(&self) -> StoreResult<bool> {
        let mut entries = self.iter()?;
        Ok(entries.next().transpose()?.is_none())
    }

    fn upsert(&self, key: K, value: V, overwrite: bool) -> StoreResult<Option<V>> {
        let mut attempts = 0;
        loop {
            let (recid, payload, node, mut path) = self.locate_leaf(&key, &mut attempts)?;
            let values = match &node.content {
                NodeContent::Values(values) => values,
                NodeContent::Children(_) => return Err(not_a_leaf()),
            };
            match node.leaf_slot(&key) {
                LeafSlot::Found(slot) => {
                    let prior = values[slot].clone();
                    if !overwrite {
                        return Ok(Some(prior));
                    }
                    let mut updated = node.clone();
                    if let NodeContent::Values(values) = &mut updated.content {
                        values[slot] = value.clone();
                    }
                    let fresh = self.encode(&updated)?;
                    if self.engine.compare_and_swap(recid, &payload, &fresh)? {
                        return Ok(Some(prior));
                    }
                }
                LeafSlot::Missing(slot) => {
                    let offset = node.key_offset();
                    let mut updated = node.clone();
                    updated.keys.insert(offset + slot, key.clone());
                    if let NodeContent::Values(values) = &mut updated.content {
                        values.insert(slot, value.clone());
                    }
                    updated.refresh_double_flag();
                    if updated.keys.len() <= self.max_node_keys {
                        let fresh = self.encode(&updated)?;
                        if self.engine.compare_and_swap(recid, &payload, &fresh)? {
                            return Ok(None);
                        }
                    } else if self.split_node(recid, &payload, updated, &mut path, &mut attempts)? {
                        return Ok(None);
                    }
                }
            }
            // lost the swap to a concurrent writer; take it from the top
            self.bump(&mut attempts)?;
        }
    }

    /// Descend to the leaf owning `key`, chasing sibling links past
    /// concurrent splits. Returns the leaf's recid, its raw payload for a
    /// later CAS, the decoded node and the directory recids visited.
    fn locate_leaf(
        &self,
        key: &K,
        attempts: &mut u32,
    ) -> StoreResult<(Recid, Vec<u8>, Node<K, V>, Vec<Recid>)> {
        let mut current = self.read_root()?;
        let mut path = Vec::new();
        loop {
            self.bump(attempts)?;
            let (payload, node) = self.load_node(current)?;
            if let Some(high) = node.high_key() {
                if key > high {
                    // a concurrent split moved this key range right
                    tracing::debug!(node = current, "chasing sibling link during descent");
                    current = node.link;
                    continue;
                }
            }
            match &node.content {
                NodeContent::Children(children) => {
                    let (_, child_slot) = node.child_position(key);
                    path.push(current);
                    current = children[child_slot];
                }
                NodeContent::Values(_) => return Ok((current, payload, node, path)),
            }
        }
    }

    /// Publish an oversized leaf image as two nodes and thread the
    /// separator up the recorded descent path. `true` when the split
    /// committed; `false` when the leaf CAS lost and the caller retries.
    fn split_node(
        &self,
        recid: Recid,
        expected: &[u8],
        oversized: Node<K, V>,
        path: &mut Vec<Recid>,
        attempts: &mut u32,
    ) -> StoreResult<bool> {
        let (mut left, right, separator) = oversized.split();
        let right_payload = self.encode(&right)?;
        let right_recid = self.engine.allocate(&right_payload)?;
        left.link = right_recid;
        let left_payload = self.encode(&left)?;
        if !self.engine.compare_and_swap(recid, expected, &left_payload)? {
            // never published; discard the sibling allocation
            self.engine.delete(right_recid)?;
            return Ok(false);
        }
        tracing::debug!(node = recid, sibling = right_recid, "split b-tree leaf");
        let mut pending = PendingSplit {
            left: recid,
            separator,
            right: right_recid,
            height: 0,
        };
        loop {
            match self.add_separator(path, pending, attempts)? {
                Some(parent_split) => pending = parent_split,
                None => return Ok(true),
            }
        }
    }

    /// Insert `split.separator` and the new sibling pointer into the
    /// level above `split.left`, returning the next pending split when
    /// that parent overflowed in turn.
    ///
    /// The recorded path names the parent seen during descent; the
    /// separator routes from there by key position alone, which stays
    /// correct when a repeat split of the same node already put a new
    /// sibling into the slot the separator lands next to. An exhausted
    /// path means the split node was the root of our descent, which
    /// grows the tree instead.
    fn add_separator(
        &self,
        path: &mut Vec<Recid>,
        split: PendingSplit<K>,
        attempts: &mut u32,
    ) -> StoreResult<Option<PendingSplit<K>>> {
        let mut current = match path.pop() {
            Some(parent) => parent,
            None => match self.grow_root(&split, attempts)? {
                Some(parent) => parent,
                None => return Ok(None),
            },
        };
        loop {
            self.bump(attempts)?;
            let (payload, node) = self.load_node(current)?;
            if !node.is_directory() {
                // sibling links and the recorded path stay on one level,
                // so only corruption lands the separator on a leaf
                return Err(StoreError::Corrupted {
                    context: "b-tree separator insert",
                    detail: "separator level holds a leaf node".into(),
                });
            }
            if let Some(high) = node.high_key() {
                if split.separator > *high {
                    current = node.link;
                    continue;
                }
            }
            let (key_slot, child_slot) = node.child_position(&split.separator);
            let mut updated = node.clone();
            updated.keys.insert(key_slot, split.separator.clone());
            if let NodeContent::Children(children) = &mut updated.content {
                children.insert(child_slot + 1, split.right);
            }
            if updated.keys.len() <= self.max_node_keys {
                let fresh = self.encode(&updated)?;
                if self.engine.compare_and_swap(current, &payload, &fresh)? {
                    return Ok(None);
                }
                continue;
            }
            // the parent is full too: split it and hand the separator up
            let (mut left, right, up_separator) = updated.split();
            let right_payload = self.encode(&right)?;
            let right_recid = self.engine.allocate(&right_payload)?;
            left.link = right_recid;
            let left_payload = self.encode(&left)?;
            if !self.engine.compare_and_swap(current, &payload, &left_payload)? {
                self.engine.delete(right_recid)?;
                continue;
            }
            tracing::debug!(
                node = current,
                sibling = right_recid,
                "split b-tree directory"
            );
            return Ok(Some(PendingSplit {
                left: current,
                separator: up_separator,
                right: right_recid,
                height: split.height + 1,
            }));
        }
    }

    /// Install a new root directory over a split of the current root.
    /// When another writer grew the tree first, report the directory one
    /// level above the split so the caller inserts there instead.
    fn grow_root(&self, split: &PendingSplit<K>, attempts: &mut u32) -> StoreResult<Option<Recid>> {
        loop {
            self.bump(attempts)?;
            let (ptr_payload, root) = self.read_root_raw()?;
            if root != split.left {
                // the tree gained levels behind us; every descent spans
                // the full height, so the separator's parent sits a fixed
                // distance from the leaf end of a fresh path
                let (_, _, _, fresh) = self.locate_leaf(&split.separator, attempts)?;
                let above = fresh
                    .len()
                    .checked_sub(split.height + 1)
                    .ok_or_else(|| StoreError::Corrupted {
                        context: "b-tree root growth",
                        detail: "descent shorter than a pending split's height".into(),
                    })?;
                return Ok(Some(fresh[above]));
            }
            let replacement = Node::root_directory(split.separator.clone(), split.left, split.right);
            let payload = self.encode(&replacement)?;
            let recid = self.engine.allocate(&payload)?;
            if self
                .engine
                .compare_and_swap(self.root_pointer, &ptr_payload, &recid.to_le_bytes())?
            {
                tracing::debug!(old_root = split.left, new_root = recid, "grew b-tree root");
                return Ok(None);
            }
            self.engine.delete(recid)?;
        }
    }

    fn read_root_raw(&self) -> StoreResult<(Vec<u8>, Recid)> {
        let payload = self
            .engine
            .get(self.root_pointer)?
            .ok_or_else(|| StoreError::Corrupted {
                context: "root pointer",
                detail: format!("record {} is missing", self.root_pointer),
            })?;
        let root = decode_root_pointer(&payload)?;
        Ok((payload, root))
    }

    fn read_root(&self) -> StoreResult<Recid> {
        Ok(self.read_root_raw()?.1)
    }

    fn load_node(&self, recid: Recid) -> StoreResult<(Vec<u8>, Node<K, V>)> {
        let payload = self
            .engine
            .get(recid)?
            .ok_or(StoreError::NotFound { recid })?;
        let node = decode_node(&payload, self.key_codec.as_ref(), self.value_codec.as_ref())?;
        Ok((payload, node))
    }

    fn encode(&self, node: &Node<K, V>) -> StoreResult<Vec<u8>> {
        encode_node(node, self.key_codec.as_ref(), self.value_codec.as_ref())
    }

    fn bump(&self, attempts: &mut u32) -> StoreResult<()> {
        *attempts += 1;
        if *attempts > RETRY_LIMIT {
            tracing::warn!(
                attempts = *attempts,
                "giving up after repeated compare-and-swap conflicts"
            );
            return Err(StoreError::RetriesExhausted {
                attempts: *attempts,
            });
        }
        Ok(())
    }
}

/// Forward iterator over tree entries in key order
///
/// Yields `Err` once and then stops when a node read fails mid-walk.
pub struct Iter<'a, K, V> {
    tree: &'a BTree<K, V>,
    buffer: VecDeque<(K, V)>,
    next_leaf: Recid,
    failed: bool,
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    type Item = StoreResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            if self.failed || self.next_leaf == NIL_RECID {
                return None;
            }
            match self.tree.load_node(self.next_leaf) {
                Ok((_, node)) => match &node.content {
                    NodeContent::Values(_) => {
                        self.next_leaf = node.link;
                        self.buffer = node.into_entries().into();
                    }
                    NodeContent::Children(_) => {
                        self.failed = true;
                        return Some(Err(StoreError::Corrupted {
                            context: "b-tree leaf walk",
                            detail: "sibling link reaches a directory node".into(),
                        }));
                    }
                },
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestore_core::{Config, MemVolume, RecordStore, U64Codec, Utf8Codec};

    fn tree_fixture(max_node_keys: usize) -> BTree<u64, String> {
        let store = RecordStore::open(Arc::new(MemVolume::new()), Config::ephemeral()).unwrap();
        BTree::create(
            Arc::new(store),
            Arc::new(U64Codec),
            Arc::new(Utf8Codec),
            max_node_keys,
        )
        .unwrap()
    }

    fn fill(tree: &BTree<u64, String>, keys: impl IntoIterator<Item = u64>) {
        for key in keys {
            assert_eq!(tree.insert(key, format!("v{}", key)).unwrap(), None);
        }
    }

    #[test]
    fn test_empty_tree() {
        let tree = tree_fixture(8);
        assert_eq!(tree.get(&7).unwrap(), None);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.len().unwrap(), 0);
        assert_eq!(tree.remove(&7).unwrap(), None);
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let tree = tree_fixture(8);
        fill(&tree, [5, 1, 9, 3]);
        assert_eq!(tree.get(&1).unwrap(), Some("v1".to_string()));
        assert_eq!(tree.get(&9).unwrap(), Some("v9".to_string()));
        assert_eq!(tree.get(&2).unwrap(), None);
        assert!(!tree.is_empty().unwrap());
        assert_eq!(tree.len().unwrap(), 4);
    }

    #[test]
    fn test_overwrite_returns_prior() {
        let tree = tree_fixture(8);
        assert_eq!(tree.insert(4, "old".to_string()).unwrap(), None);
        assert_eq!(
            tree.insert(4, "new".to_string()).unwrap(),
            Some("old".to_string())
        );
        assert_eq!(tree.get(&4).unwrap(), Some("new".to_string()));
        assert_eq!(tree.len().unwrap(), 1);
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let tree = tree_fixture(8);
        assert_eq!(tree.insert_if_absent(4, "first".to_string()).unwrap(), None);
        assert_eq!(
            tree.insert_if_absent(4, "second".to_string()).unwrap(),
            Some("first".to_string())
        );
        assert_eq!(tree.get(&4).unwrap(), Some("first".to_string()));
    }

    #[test]
    fn test_remove() {
        let tree = tree_fixture(8);
        fill(&tree, [1, 2, 3]);
        assert_eq!(tree.remove(&2).unwrap(), Some("v2".to_string()));
        assert_eq!(tree.get(&2).unwrap(), None);
        assert_eq!(tree.remove(&2).unwrap(), None);
        assert_eq!(tree.len().unwrap(), 2);
    }

    #[test]
    fn test_sequential_fill_splits() {
        let tree = tree_fixture(4);
        fill(&tree, 0..100);
        for key in 0..100 {
            assert_eq!(tree.get(&key).unwrap(), Some(format!("v{}", key)));
        }
        assert_eq!(tree.len().unwrap(), 100);
    }

    #[test]
    fn test_reverse_fill_splits() {
        let tree = tree_fixture(4);
        fill(&tree, (0..100).rev());
        for key in 0..100 {
            assert_eq!(tree.get(&key).unwrap(), Some(format!("v{}", key)));
        }
        let walked: Vec<u64> = tree
            .iter()
            .unwrap()
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(walked, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_preserves_ranges() {
        let tree = tree_fixture(4);
        fill(&tree, [10, 20, 30, 40, 50]);

        // the fifth insert split the original root leaf
        let root = tree.read_root().unwrap();
        let (_, root_node) = tree.load_node(root).unwrap();
        let children = match &root_node.content {
            NodeContent::Children(children) => children.clone(),
            NodeContent::Values(_) => panic!("root should be a directory after the split"),
        };
        assert_eq!(root_node.keys, vec![20]);
        assert_eq!(children.len(), 2);

        let (_, left) = tree.load_node(children[0]).unwrap();
        let (_, right) = tree.load_node(children[1]).unwrap();

        // old node keeps the lower range and links to the new sibling
        assert_eq!(left.link, children[1]);
        assert_eq!(left.high_key(), Some(&20));
        assert!(left.last_key_doubled());
        assert!(left.left_edge() && !left.right_edge());

        // new sibling starts where the old range ends
        assert_eq!(right.keys.first(), Some(&20));
        assert_eq!(right.link, NIL_RECID);
        assert!(!right.left_edge() && right.right_edge());

        let left_keys: Vec<u64> = left.into_entries().into_iter().map(|(k, _)| k).collect();
        let right_keys: Vec<u64> = right.into_entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(left_keys, vec![10, 20]);
        assert_eq!(right_keys, vec![30, 40, 50]);
    }

    #[test]
    fn test_boundary_lookups_after_split() {
        let tree = tree_fixture(4);
        fill(&tree, [10, 20, 30, 40, 50]);
        // 20 is both the left leaf's high bound and a live entry
        assert_eq!(tree.get(&20).unwrap(), Some("v20".to_string()));
        assert_eq!(tree.get(&25).unwrap(), None);
        assert_eq!(tree.get(&30).unwrap(), Some("v30".to_string()));
        assert_eq!(tree.get(&50).unwrap(), Some("v50".to_string()));
        assert_eq!(tree.get(&51).unwrap(), None);
        assert_eq!(tree.get(&9).unwrap(), None);
    }

    #[test]
    fn test_remove_doubled_entry_then_reinsert() {
        let tree = tree_fixture(4);
        fill(&tree, [10, 20, 30, 40, 50]);

        // 20 sits in the doubled tail of the split-off left leaf
        assert_eq!(tree.remove(&20).unwrap(), Some("v20".to_string()));
        assert_eq!(tree.get(&20).unwrap(), None);
        assert_eq!(tree.get(&10).unwrap(), Some("v10".to_string()));

        // the bound remains owned by the left leaf, so 20 can come back
        assert_eq!(tree.insert(20, "again".to_string()).unwrap(), None);
        assert_eq!(tree.get(&20).unwrap(), Some("again".to_string()));
        assert_eq!(tree.len().unwrap(), 5);
    }

    #[test]
    fn test_iter_sorted() {
        let tree = tree_fixture(4);
        fill(&tree, [8, 3, 5, 13, 1, 21, 2, 34, 55, 89, 144, 233]);
        let walked: Vec<u64> = tree
            .iter()
            .unwrap()
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(walked, vec![1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233]);
    }

    #[test]
    fn test_iter_from_mid() {
        let tree = tree_fixture(4);
        fill(&tree, (0..50).map(|k| k * 2));
        let from_31: Vec<u64> = tree
            .iter_from(&31)
            .unwrap()
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(from_31, (16..50).map(|k| k * 2).collect::<Vec<_>>());

        // inclusive start on an existing key
        let from_32: Vec<u64> = tree
            .iter_from(&32)
            .unwrap()
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(from_32.first(), Some(&32));

        // past the end
        assert_eq!(tree.iter_from(&1000).unwrap().count(), 0);
    }

    #[test]
    fn test_reopen_via_root_pointer() {
        let store = Arc::new(
            RecordStore::open(Arc::new(MemVolume::new()), Config::ephemeral()).unwrap(),
        );
        let engine: Arc<dyn Engine> = store;
        let tree = BTree::create(
            engine.clone(),
            Arc::new(U64Codec),
            Arc::new(Utf8Codec),
            8,
        )
        .unwrap();
        fill(&tree, 0..20);
        let root_pointer = tree.root_pointer();
        drop(tree);

        let again = BTree::open(
            engine,
            Arc::new(U64Codec),
            Arc::new(Utf8Codec),
            8,
            root_pointer,
        )
        .unwrap();
        assert_eq!(again.get(&11).unwrap(), Some("v11".to_string()));
        assert_eq!(again.len().unwrap(), 20);
    }

    #[test]
    fn test_open_rejects_bad_pointer() {
        let store = Arc::new(
            RecordStore::open(Arc::new(MemVolume::new()), Config::ephemeral()).unwrap(),
        );
        let engine: Arc<dyn Engine> = store;
        let result = BTree::<u64, String>::open(
            engine,
            Arc::new(U64Codec),
            Arc::new(Utf8Codec),
            8,
            999,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_tiny_node_capacity() {
        let store = RecordStore::open(Arc::new(MemVolume::new()), Config::ephemeral()).unwrap();
        let result = BTree::<u64, String>::create(
            Arc::new(store),
            Arc::new(U64Codec),
            Arc::new(Utf8Codec),
            2,
        );
        assert!(matches!(
            result.unwrap_err(),
            StoreError::InvalidConfig { .. }
        ));
    }
}
