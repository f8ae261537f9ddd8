//! B-link tree nodes and their record encoding
//!
//! A node covers the key range `(lo, hi]`: it owns keys strictly greater
//! than its low bound and up to and including its high bound. The bounds
//! are stored in the key array itself, `lo` at the front unless the node
//! is the leftmost of its level, `hi` at the back unless it is the
//! rightmost. A leaf whose high bound coincides with its last entry key
//! stores that key twice and sets the duplicate flag.
//!
//! Interior-of-level nodes carry the recid of their right sibling; the
//! rightmost node of a level carries none. Readers use the link to chase
//! entries that a concurrent split moved right.
//!
//! Encoding: one varint header packing `(key_count << 4) | flags`, a
//! varint sibling link unless right-edge, the keys, then the values or
//! child recids. Value and child counts are not stored; they follow from
//! the count invariants, which `decode_node` re-checks along with key
//! ordering before trusting a payload.

use std::cmp::Ordering;

use lodestore_core::codec::{pack_u64, unpack_u64, ByteReader, Codec};
use lodestore_core::{Recid, StoreError, StoreResult, NIL_RECID};

/// Node holds child pointers instead of values
pub(crate) const FLAG_DIRECTORY: u8 = 0b1000;
/// Leftmost node of its level; no low bound is stored
pub(crate) const FLAG_LEFT_EDGE: u8 = 0b0100;
/// Rightmost node of its level; no high bound and no sibling link
pub(crate) const FLAG_RIGHT_EDGE: u8 = 0b0010;
/// Leaf's high bound equals its last entry key and both are stored
pub(crate) const FLAG_LAST_KEY_DOUBLED: u8 = 0b0001;

const FLAG_MASK: u8 = 0b1111;

/// Payload of a node: child pointers for directories, values for leaves
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeContent<V> {
    Children(Vec<Recid>),
    Values(Vec<V>),
}

/// One B-link tree node as stored in a single record
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node<K, V> {
    /// Low-nibble flag bits, see the `FLAG_*` constants
    pub(crate) flags: u8,
    /// Right sibling recid; `NIL_RECID` iff right-edge
    pub(crate) link: Recid,
    /// Bounds and entry keys in ascending order
    pub(crate) keys: Vec<K>,
    /// Values (leaf) or child recids (directory)
    pub(crate) content: NodeContent<V>,
}

/// Where a key lives in a leaf: the value slot holding it, or the entry
/// slot where it would insert
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum LeafSlot {
    Found(usize),
    Missing(usize),
}

impl<K, V> Node<K, V> {
    pub(crate) fn empty_root_leaf() -> Self {
        Node {
            flags: FLAG_LEFT_EDGE | FLAG_RIGHT_EDGE,
            link: NIL_RECID,
            keys: Vec::new(),
            content: NodeContent::Values(Vec::new()),
        }
    }

    pub(crate) fn root_directory(separator: K, left: Recid, right: Recid) -> Self {
        Node {
            flags: FLAG_DIRECTORY | FLAG_LEFT_EDGE | FLAG_RIGHT_EDGE,
            link: NIL_RECID,
            keys: vec![separator],
            content: NodeContent::Children(vec![left, right]),
        }
    }

    pub(crate) fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub(crate) fn left_edge(&self) -> bool {
        self.flags & FLAG_LEFT_EDGE != 0
    }

    pub(crate) fn right_edge(&self) -> bool {
        self.flags & FLAG_RIGHT_EDGE != 0
    }

    pub(crate) fn last_key_doubled(&self) -> bool {
        self.flags & FLAG_LAST_KEY_DOUBLED != 0
    }

    /// Index of the first entry or separator key, past the stored low bound
    pub(crate) fn key_offset(&self) -> usize {
        usize::from(!self.left_edge())
    }

    /// Inclusive high bound, `None` on the rightmost node of a level
    pub(crate) fn high_key(&self) -> Option<&K> {
        if self.right_edge() {
            None
        } else {
            self.keys.last()
        }
    }

    /// Number of stored values; zero for directories
    pub(crate) fn value_count(&self) -> usize {
        match &self.content {
            NodeContent::Values(values) => values.len(),
            NodeContent::Children(_) => 0,
        }
    }

    /// Leaf entries in order, bounds and the doubled tail key dropped
    pub(crate) fn into_entries(self) -> Vec<(K, V)> {
        let offset = self.key_offset();
        match self.content {
            NodeContent::Values(values) => {
                let taken = values.len();
                self.keys
                    .into_iter()
                    .skip(offset)
                    .take(taken)
                    .zip(values)
                    .collect()
            }
            NodeContent::Children(_) => Vec::new(),
        }
    }
}

impl<K: Ord, V> Node<K, V> {
    /// Keys index where a separator for `key` would insert, and the child
    /// slot covering `key`. Callers chase the sibling link first when
    /// `key` lies beyond the high bound.
    pub(crate) fn child_position(&self, key: &K) -> (usize, usize) {
        let offset = self.key_offset();
        let mut index = offset;
        while index < self.keys.len() && key > &self.keys[index] {
            index += 1;
        }
        (index, index - offset)
    }

    /// Locate `key` in a leaf. A hit on the stored high bound counts only
    /// when the bound doubles as the last entry; a hit on the exclusive
    /// low bound never does.
    pub(crate) fn leaf_slot(&self, key: &K) -> LeafSlot {
        let offset = self.key_offset();
        let entries = self.value_count();
        match self.keys.binary_search(key) {
            Ok(mut position) => {
                if !self.right_edge() && position == self.keys.len() - 1 {
                    if self.last_key_doubled() {
                        position -= 1;
                    } else {
                        return LeafSlot::Missing(entries);
                    }
                }
                if position < offset {
                    return LeafSlot::Missing(0);
                }
                LeafSlot::Found(position - offset)
            }
            Err(insert_at) => LeafSlot::Missing(insert_at.saturating_sub(offset).min(entries)),
        }
    }

    /// Recompute the duplicate flag after an entry was added or removed
    pub(crate) fn refresh_double_flag(&mut self) {
        let entries = match &self.content {
            NodeContent::Values(values) => values.len(),
            NodeContent::Children(_) => return,
        };
        let offset = self.key_offset();
        let doubled = !self.right_edge()
            && entries > 0
            && self.keys[offset + entries - 1] == self.keys[offset + entries];
        if doubled {
            self.flags |= FLAG_LAST_KEY_DOUBLED;
        } else {
            self.flags &= !FLAG_LAST_KEY_DOUBLED;
        }
    }
}

impl<K: Ord + Clone, V> Node<K, V> {
    /// Split an oversized node image into a reduced left half and a new
    /// right sibling, sharing the separator as the left half's high bound
    /// and the right half's low bound. The left half keeps this node's
    /// recid and left-edge flag; the right half inherits the sibling link
    /// and right-edge flag. The caller allocates the right node and then
    /// points the left half's link at it.
    pub(crate) fn split(self) -> (Node<K, V>, Node<K, V>, K) {
        let offset = self.key_offset();
        let mut keys = self.keys;
        match self.content {
            NodeContent::Values(mut values) => {
                let keep = values.len() / 2;
                let right_values = values.split_off(keep);
                let mut right_keys = vec![keys[offset + keep - 1].clone()];
                right_keys.extend(keys.drain(offset + keep..));
                let separator = right_keys[0].clone();
                // left high bound == last entry key, stored twice
                keys.push(separator.clone());

                let left = Node {
                    flags: (self.flags & FLAG_LEFT_EDGE) | FLAG_LAST_KEY_DOUBLED,
                    link: NIL_RECID,
                    keys,
                    content: NodeContent::Values(values),
                };
                let right = Node {
                    flags: self.flags & (FLAG_RIGHT_EDGE | FLAG_LAST_KEY_DOUBLED),
                    link: self.link,
                    keys: right_keys,
                    content: NodeContent::Values(right_values),
                };
                (left, right, separator)
            }
            NodeContent::Children(mut children) => {
                let keep = children.len() / 2;
                let boundary = keep - 1 + offset;
                let right_children = children.split_off(keep);
                let right_keys = keys.split_off(boundary);
                let separator = right_keys[0].clone();
                keys.push(separator.clone());

                let left = Node {
                    flags: FLAG_DIRECTORY | (self.flags & FLAG_LEFT_EDGE),
                    link: NIL_RECID,
                    keys,
                    content: NodeContent::Children(children),
                };
                let right = Node {
                    flags: FLAG_DIRECTORY | (self.flags & FLAG_RIGHT_EDGE),
                    link: self.link,
                    keys: right_keys,
                    content: NodeContent::Children(right_children),
                };
                (left, right, separator)
            }
        }
    }
}

/// Serialize a node for storage in one record
pub(crate) fn encode_node<K, V>(
    node: &Node<K, V>,
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
) -> StoreResult<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    pack_u64((node.keys.len() as u64) << 4 | u64::from(node.flags), &mut out);
    if !node.right_edge() {
        pack_u64(node.link, &mut out);
    }
    for key in &node.keys {
        key_codec.encode(key, &mut out)?;
    }
    match &node.content {
        NodeContent::Children(children) => {
            for child in children {
                pack_u64(*child, &mut out);
            }
        }
        NodeContent::Values(values) => {
            for value in values {
                value_codec.encode(value, &mut out)?;
            }
        }
    }
    Ok(out)
}

fn corrupt(detail: String) -> StoreError {
    StoreError::Corrupted {
        context: "b-tree node",
        detail,
    }
}

/// Deserialize a node, re-checking every structural invariant
pub(crate) fn decode_node<K: Ord, V>(
    payload: &[u8],
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
) -> StoreResult<Node<K, V>> {
    let mut reader = ByteReader::new(payload);
    let header = unpack_u64(&mut reader)?;
    let flags = (header & u64::from(FLAG_MASK)) as u8;
    let stored = usize::try_from(header >> 4)
        .map_err(|_| corrupt("key count exceeds address space".into()))?;
    if stored > reader.remaining() {
        return Err(corrupt(format!(
            "header claims {} keys, {} payload bytes left",
            stored,
            reader.remaining()
        )));
    }

    let directory = flags & FLAG_DIRECTORY != 0;
    let left = flags & FLAG_LEFT_EDGE != 0;
    let right = flags & FLAG_RIGHT_EDGE != 0;
    let doubled = flags & FLAG_LAST_KEY_DOUBLED != 0;
    if doubled && directory {
        return Err(corrupt("duplicate-key flag on a directory node".into()));
    }
    if doubled && right {
        return Err(corrupt("duplicate-key flag on a right-edge node".into()));
    }

    let link = if right {
        NIL_RECID
    } else {
        let link = unpack_u64(&mut reader)?;
        if link == NIL_RECID {
            return Err(corrupt("interior node without a sibling link".into()));
        }
        link
    };

    let mut keys = Vec::with_capacity(stored);
    for _ in 0..stored {
        keys.push(key_codec.decode(&mut reader)?);
    }
    for i in 1..keys.len() {
        match keys[i - 1].cmp(&keys[i]) {
            Ordering::Less => {}
            Ordering::Equal if doubled && i == keys.len() - 1 => {}
            Ordering::Equal => {
                return Err(corrupt("duplicate key outside the doubled tail".into()));
            }
            Ordering::Greater => return Err(corrupt("keys out of order".into())),
        }
    }
    if doubled && (stored < 2 || keys[stored - 2] != keys[stored - 1]) {
        return Err(corrupt("duplicate flag without an equal tail pair".into()));
    }

    let edges = usize::from(left) + usize::from(right);
    let content = if directory {
        let child_count = match (stored + edges).checked_sub(1) {
            Some(count) if count > 0 => count,
            _ => {
                return Err(corrupt(format!(
                    "directory with {} keys cannot hold children",
                    stored
                )))
            }
        };
        if child_count > reader.remaining() {
            return Err(corrupt(format!(
                "directory claims {} children, {} payload bytes left",
                child_count,
                reader.remaining()
            )));
        }
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let child = unpack_u64(&mut reader)?;
            if child == NIL_RECID {
                return Err(corrupt("nil child pointer".into()));
            }
            children.push(child);
        }
        NodeContent::Children(children)
    } else {
        let value_count = (stored + edges).checked_sub(2).ok_or_else(|| {
            corrupt(format!(
                "leaf with {} keys and {} edge flags holds no entry region",
                stored, edges
            ))
        })?;
        if doubled && value_count == 0 {
            return Err(corrupt("duplicate-key flag on a leaf without entries".into()));
        }
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(value_codec.decode(&mut reader)?);
        }
        NodeContent::Values(values)
    };

    if reader.remaining() != 0 {
        return Err(corrupt(format!(
            "{} undecoded trailing bytes",
            reader.remaining()
        )));
    }

    Ok(Node {
        flags,
        link,
        keys,
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestore_core::{U64Codec, Utf8Codec};

    fn leaf(flags: u8, link: Recid, keys: Vec<u64>, values: Vec<String>) -> Node<u64, String> {
        Node {
            flags,
            link,
            keys,
            content: NodeContent::Values(values),
        }
    }

    fn dir(flags: u8, link: Recid, keys: Vec<u64>, children: Vec<Recid>) -> Node<u64, String> {
        Node {
            flags,
            link,
            keys,
            content: NodeContent::Children(children),
        }
    }

    fn vals(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("v{}", i)).collect()
    }

    fn roundtrip(node: &Node<u64, String>) -> Node<u64, String> {
        let bytes = encode_node(node, &U64Codec, &Utf8Codec).unwrap();
        decode_node(&bytes, &U64Codec, &Utf8Codec).unwrap()
    }

    fn decode_err(node: &Node<u64, String>) -> StoreError {
        let bytes = encode_node(node, &U64Codec, &Utf8Codec).unwrap();
        decode_node::<u64, String>(&bytes, &U64Codec, &Utf8Codec).unwrap_err()
    }

    #[test]
    fn test_leaf_roundtrip_interior() {
        // lo 10, entries 20/30, hi 40
        let node = leaf(0, 9, vec![10, 20, 30, 40], vals(2));
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn test_leaf_roundtrip_edges() {
        let both = leaf(
            FLAG_LEFT_EDGE | FLAG_RIGHT_EDGE,
            NIL_RECID,
            vec![1, 2, 3],
            vals(3),
        );
        assert_eq!(roundtrip(&both), both);

        // entries 1/2, hi 9
        let leftmost = leaf(FLAG_LEFT_EDGE, 7, vec![1, 2, 9], vals(2));
        assert_eq!(roundtrip(&leftmost), leftmost);

        // lo 5, entries 6/7
        let rightmost = leaf(FLAG_RIGHT_EDGE, NIL_RECID, vec![5, 6, 7], vals(2));
        assert_eq!(roundtrip(&rightmost), rightmost);
    }

    #[test]
    fn test_leaf_roundtrip_doubled_tail() {
        // hi 30 coincides with the last entry key
        let node = leaf(FLAG_LAST_KEY_DOUBLED, 4, vec![10, 20, 30, 30], vals(2));
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn test_directory_roundtrip() {
        let interior = dir(FLAG_DIRECTORY, 5, vec![10, 20, 30], vec![41, 42]);
        assert_eq!(roundtrip(&interior), interior);

        let root = dir(
            FLAG_DIRECTORY | FLAG_LEFT_EDGE | FLAG_RIGHT_EDGE,
            NIL_RECID,
            vec![50],
            vec![8, 9],
        );
        assert_eq!(roundtrip(&root), root);
    }

    #[test]
    fn test_rejects_count_mismatch() {
        // an interior leaf needs at least two keys for its bounds
        let node = leaf(0, 9, vec![10], vals(0));
        assert!(matches!(decode_err(&node), StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_out_of_order_keys() {
        let node = leaf(0, 9, vec![40, 30, 20, 10], vals(2));
        assert!(matches!(decode_err(&node), StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_duplicate_without_flag() {
        let node = leaf(0, 9, vec![10, 20, 20, 30], vals(2));
        assert!(matches!(decode_err(&node), StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_flag_without_equal_tail() {
        let node = leaf(FLAG_LAST_KEY_DOUBLED, 9, vec![10, 20, 30, 40], vals(2));
        assert!(matches!(decode_err(&node), StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_nil_child() {
        let node = dir(FLAG_DIRECTORY, 5, vec![10, 20, 30], vec![41, 0]);
        assert!(matches!(decode_err(&node), StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_missing_link() {
        // not right-edge, so a live sibling link is mandatory
        let node = leaf(0, NIL_RECID, vec![10, 20, 30, 40], vals(2));
        assert!(matches!(decode_err(&node), StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_doubled_directory() {
        let node = dir(
            FLAG_DIRECTORY | FLAG_LAST_KEY_DOUBLED,
            5,
            vec![10, 20, 20],
            vec![1, 2],
        );
        assert!(matches!(decode_err(&node), StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let node = leaf(0, 9, vec![10, 20, 30, 40], vals(2));
        let mut bytes = encode_node(&node, &U64Codec, &Utf8Codec).unwrap();
        bytes.push(0xAB);
        assert!(decode_node::<u64, String>(&bytes, &U64Codec, &Utf8Codec).is_err());
    }

    #[test]
    fn test_split_leaf_shares_boundary() {
        // lo 10, entries 20..50, hi 60
        let node = leaf(0, 77, vec![10, 20, 30, 40, 50, 60], vals(4));
        let (mut left, right, separator) = node.split();

        assert_eq!(separator, 30);
        assert_eq!(left.keys, vec![10, 20, 30, 30]);
        assert!(left.last_key_doubled());
        assert!(!left.right_edge());
        assert_eq!(left.content, NodeContent::Values(vals(2)));

        assert_eq!(right.keys, vec![30, 40, 50, 60]);
        assert_eq!(right.link, 77);
        assert!(!right.left_edge() && !right.right_edge());
        assert_eq!(
            right.content,
            NodeContent::Values(vec!["v2".to_string(), "v3".to_string()])
        );

        // both halves decode clean once the left link is patched in
        left.link = 78;
        assert_eq!(roundtrip(&left), left);
        assert_eq!(roundtrip(&right), right);
    }

    #[test]
    fn test_split_both_edge_leaf() {
        let node = leaf(
            FLAG_LEFT_EDGE | FLAG_RIGHT_EDGE,
            NIL_RECID,
            vec![1, 2, 3, 4, 5],
            vals(5),
        );
        let (left, right, separator) = node.split();

        assert_eq!(separator, 2);
        assert_eq!(left.keys, vec![1, 2, 2]);
        assert!(left.left_edge() && !left.right_edge());
        assert!(left.last_key_doubled());
        assert_eq!(left.value_count(), 2);

        assert_eq!(right.keys, vec![2, 3, 4, 5]);
        assert!(!right.left_edge() && right.right_edge());
        assert_eq!(right.link, NIL_RECID);
        assert_eq!(right.value_count(), 3);
    }

    #[test]
    fn test_split_directory() {
        let node = dir(FLAG_DIRECTORY, 6, vec![10, 20, 30, 40, 50], vec![1, 2, 3, 4]);
        let (left, right, separator) = node.split();

        assert_eq!(separator, 30);
        assert_eq!(left.keys, vec![10, 20, 30]);
        assert_eq!(left.content, NodeContent::Children(vec![1, 2]));
        assert!(left.is_directory() && !left.right_edge());

        assert_eq!(right.keys, vec![30, 40, 50]);
        assert_eq!(right.content, NodeContent::Children(vec![3, 4]));
        assert_eq!(right.link, 6);
    }

    #[test]
    fn test_leaf_slot_adjustments() {
        let doubled = leaf(FLAG_LAST_KEY_DOUBLED, 4, vec![10, 20, 30, 30], vals(2));
        assert_eq!(doubled.leaf_slot(&30), LeafSlot::Found(1));
        assert_eq!(doubled.leaf_slot(&20), LeafSlot::Found(0));
        // the low bound is exclusive
        assert_eq!(doubled.leaf_slot(&10), LeafSlot::Missing(0));
        assert_eq!(doubled.leaf_slot(&15), LeafSlot::Missing(0));
        assert_eq!(doubled.leaf_slot(&25), LeafSlot::Missing(1));

        let plain = leaf(0, 4, vec![10, 20, 30, 40], vals(2));
        // the high bound is owned but currently holds no entry
        assert_eq!(plain.leaf_slot(&40), LeafSlot::Missing(2));
        assert_eq!(plain.leaf_slot(&35), LeafSlot::Missing(2));
        assert_eq!(plain.leaf_slot(&30), LeafSlot::Found(1));
    }

    #[test]
    fn test_child_position_scan() {
        let interior: Node<u64, String> =
            dir(FLAG_DIRECTORY, 5, vec![10, 20, 30], vec![41, 42]);
        assert_eq!(interior.child_position(&15).1, 0);
        assert_eq!(interior.child_position(&20).1, 0);
        assert_eq!(interior.child_position(&25).1, 1);
        assert_eq!(interior.child_position(&30).1, 1);

        let root: Node<u64, String> = dir(
            FLAG_DIRECTORY | FLAG_LEFT_EDGE | FLAG_RIGHT_EDGE,
            NIL_RECID,
            vec![50],
            vec![8, 9],
        );
        assert_eq!(root.child_position(&7).1, 0);
        assert_eq!(root.child_position(&50).1, 0);
        assert_eq!(root.child_position(&51).1, 1);
    }

    #[test]
    fn test_into_entries_skips_bounds() {
        let node = leaf(
            FLAG_LAST_KEY_DOUBLED,
            4,
            vec![10, 20, 30, 30],
            vec!["a".to_string(), "b".to_string()],
        );
        assert_eq!(
            node.into_entries(),
            vec![(20, "a".to_string()), (30, "b".to_string())]
        );

        let rightmost = leaf(
            FLAG_RIGHT_EDGE,
            NIL_RECID,
            vec![5, 6, 7],
            vec!["x".to_string(), "y".to_string()],
        );
        assert_eq!(
            rightmost.into_entries(),
            vec![(6, "x".to_string()), (7, "y".to_string())]
        );
    }
}
