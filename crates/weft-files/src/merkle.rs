//! SHA-256 Merkle trees over file chunks.
//!
//! Nodes are stored breadth-first, leaves first, root last. Levels are built
//! bottom-up; when a level ends on an odd count the lone node is paired with
//! itself: its hash is used for both operands and `right` records the left
//! node's own index, so proof generation treats every node uniformly.
//!
//! Proof verification is stateless: it needs only the chunk bytes, the proof
//! hashes, the declared root, and the chunk index.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::error::MerkleError;

/// Fixed chunk size for file transfer
pub const CHUNK_SIZE: usize = 65_536;

/// Size of a node hash in bytes
pub const HASH_SIZE: usize = 32;

/// Serialized `parent_index` sentinel marking the root
pub const ROOT_PARENT_SENTINEL: u32 = 0xFFFF_FFFF;

/// Bytes per serialized node: hash plus little-endian parent index
const NODE_RECORD_SIZE: usize = HASH_SIZE + 4;

/// Hash one chunk into a leaf hash
#[must_use]
pub fn hash_chunk(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Content id: the Merkle root, rendered as base64 across peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// Wrap a root hash
    #[must_use]
    pub fn new(root: [u8; 32]) -> Self {
        Self(root)
    }

    /// The raw root hash
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Canonical base64 rendering
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse the canonical base64 rendering
    pub fn from_base64(s: &str) -> Result<Self, MerkleError> {
        let bytes = BASE64
            .decode(s)
            .map_err(|_| MerkleError::Malformed("content id is not base64"))?;
        let root: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MerkleError::Malformed("content id is not 32 bytes"))?;
        Ok(Self(root))
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// One node of a Merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    /// SHA-256 hash of the chunk (leaves) or of the concatenated children
    pub hash: [u8; 32],
    /// Left child index; `None` for leaves
    pub left: Option<u32>,
    /// Right child index; equals `left` for self-paired nodes
    pub right: Option<u32>,
    /// Parent index; `None` for the root
    pub parent: Option<u32>,
}

/// Structural links for one node, shared by the batch and incremental builders
#[derive(Debug, Clone, Copy, Default)]
struct Link {
    left: Option<u32>,
    right: Option<u32>,
    parent: Option<u32>,
}

/// Compute the full link structure for a tree with `leaf_count` leaves
fn skeleton(leaf_count: u32) -> Vec<Link> {
    let mut links: Vec<Link> = vec![Link::default(); leaf_count as usize];
    let mut level_start = 0u32;
    let mut level_len = leaf_count;

    while level_len > 1 {
        let mut i = 0;
        while i < level_len {
            let left = level_start + i;
            // Odd level end: pair the lone node with itself
            let right = if i + 1 < level_len { left + 1 } else { left };
            let parent = links.len() as u32;
            links.push(Link {
                left: Some(left),
                right: Some(right),
                parent: None,
            });
            links[left as usize].parent = Some(parent);
            links[right as usize].parent = Some(parent);
            i += 2;
        }
        level_start += level_len;
        level_len = level_len.div_ceil(2);
    }

    links
}

/// A fully built Merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    nodes: Vec<MerkleNode>,
    leaf_count: u32,
}

impl MerkleTree {
    /// Build a tree from chunk bytes
    pub fn from_chunks<C: AsRef<[u8]>>(chunks: &[C]) -> Result<Self, MerkleError> {
        let leaves: Vec<[u8; 32]> = chunks.iter().map(|c| hash_chunk(c.as_ref())).collect();
        Self::from_leaves(leaves)
    }

    /// Build a tree from precomputed leaf hashes
    pub fn from_leaves(leaves: Vec<[u8; 32]>) -> Result<Self, MerkleError> {
        let leaf_count = u32::try_from(leaves.len()).map_err(|_| MerkleError::Empty)?;
        if leaf_count == 0 {
            return Err(MerkleError::Empty);
        }

        let links = skeleton(leaf_count);
        let mut nodes: Vec<MerkleNode> = Vec::with_capacity(links.len());
        for (i, link) in links.iter().enumerate() {
            let hash = if let (Some(l), Some(r)) = (link.left, link.right) {
                // Children always precede their parent in the node array
                hash_pair(&nodes[l as usize].hash, &nodes[r as usize].hash)
            } else {
                leaves[i]
            };
            nodes.push(MerkleNode {
                hash,
                left: link.left,
                right: link.right,
                parent: link.parent,
            });
        }

        Ok(Self { nodes, leaf_count })
    }

    /// Number of leaves
    #[must_use]
    pub fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    /// Total node count (leaves plus internal levels)
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes in breadth-first, leaves-first order
    #[must_use]
    pub fn nodes(&self) -> &[MerkleNode] {
        &self.nodes
    }

    /// The root node is the last element
    #[must_use]
    pub fn root_hash(&self) -> [u8; 32] {
        self.nodes[self.nodes.len() - 1].hash
    }

    /// The root as a content id
    #[must_use]
    pub fn content_id(&self) -> ContentId {
        ContentId::new(self.root_hash())
    }

    /// Inclusion proof for leaf `index`: sibling hashes from leaf to root
    ///
    /// A single-leaf tree has an empty proof. With self-pairing the sibling
    /// may be the node itself.
    pub fn proof(&self, index: u32) -> Result<Vec<[u8; 32]>, MerkleError> {
        if index >= self.leaf_count {
            return Err(MerkleError::OutOfRange {
                index,
                leaf_count: self.leaf_count,
            });
        }

        let mut proof = Vec::new();
        let mut cur = index;
        while let Some(parent) = self.nodes[cur as usize].parent {
            let node = &self.nodes[parent as usize];
            let (left, right) = (node.left.unwrap_or(cur), node.right.unwrap_or(cur));
            let sibling = if left == cur { right } else { left };
            proof.push(self.nodes[sibling as usize].hash);
            cur = parent;
        }
        Ok(proof)
    }

    /// Serialize: `leaf_count` u32 LE, then per node `hash || parent u32 LE`
    /// with `0xFFFFFFFF` for the root
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.nodes.len() * NODE_RECORD_SIZE);
        buf.extend_from_slice(&self.leaf_count.to_le_bytes());
        for node in &self.nodes {
            buf.extend_from_slice(&node.hash);
            let parent = node.parent.unwrap_or(ROOT_PARENT_SENTINEL);
            buf.extend_from_slice(&parent.to_le_bytes());
        }
        buf
    }

    /// Deserialize a tree, checking the stored leaf count against
    /// `expected_leaf_count`
    ///
    /// Child links are rebuilt by attaching each node to its parent's first
    /// free slot; internal nodes left with a single child are self-paired.
    pub fn deserialize(bytes: &[u8], expected_leaf_count: u32) -> Result<Self, MerkleError> {
        if bytes.len() < 4 {
            return Err(MerkleError::Malformed("missing leaf count header"));
        }
        let leaf_count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if leaf_count != expected_leaf_count {
            return Err(MerkleError::LeafCountMismatch {
                expected: expected_leaf_count,
                actual: leaf_count,
            });
        }
        if leaf_count == 0 {
            return Err(MerkleError::Empty);
        }

        let body = &bytes[4..];
        if body.len() % NODE_RECORD_SIZE != 0 {
            return Err(MerkleError::Malformed("node records truncated"));
        }
        let node_count = body.len() / NODE_RECORD_SIZE;
        if node_count < leaf_count as usize {
            return Err(MerkleError::Malformed("fewer nodes than leaves"));
        }

        let mut nodes: Vec<MerkleNode> = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let record = &body[i * NODE_RECORD_SIZE..(i + 1) * NODE_RECORD_SIZE];
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&record[..HASH_SIZE]);
            let raw_parent = u32::from_le_bytes([
                record[HASH_SIZE],
                record[HASH_SIZE + 1],
                record[HASH_SIZE + 2],
                record[HASH_SIZE + 3],
            ]);
            let parent = if raw_parent == ROOT_PARENT_SENTINEL {
                None
            } else {
                if raw_parent as usize >= node_count || raw_parent as usize <= i {
                    return Err(MerkleError::Malformed("parent index out of order"));
                }
                Some(raw_parent)
            };
            nodes.push(MerkleNode {
                hash,
                left: None,
                right: None,
                parent,
            });
        }

        // Attach children in index order: first reference fills `left`,
        // second fills `right`.
        for i in 0..node_count {
            if let Some(parent) = nodes[i].parent {
                let parent = parent as usize;
                if nodes[parent].left.is_none() {
                    nodes[parent].left = Some(i as u32);
                } else if nodes[parent].right.is_none() {
                    nodes[parent].right = Some(i as u32);
                } else {
                    return Err(MerkleError::Malformed("parent has more than two children"));
                }
            }
        }

        // A lone child means the node was self-paired when built.
        for node in nodes.iter_mut().skip(leaf_count as usize) {
            if node.right.is_none() {
                node.right = node.left;
            }
            if node.left.is_none() {
                return Err(MerkleError::Malformed("internal node without children"));
            }
        }

        Ok(Self { nodes, leaf_count })
    }
}

/// Verify a chunk's inclusion proof against a declared root
///
/// Walks the proof from the leaf upward: at each step the running hash is
/// combined with the sibling on the side given by the index parity, then the
/// index halves. No access to the tree is required.
#[must_use]
pub fn verify_proof(
    chunk_data: &[u8],
    proof: &[[u8; 32]],
    root: &[u8; 32],
    chunk_index: u64,
) -> bool {
    let mut hash = hash_chunk(chunk_data);
    let mut idx = chunk_index;
    for sibling in proof {
        hash = if idx % 2 == 0 {
            hash_pair(&hash, sibling)
        } else {
            hash_pair(sibling, &hash)
        };
        idx /= 2;
    }
    hash == *root
}

/// Incremental Merkle builder for streaming uploads.
///
/// The full node structure is allocated up front from the leaf count; only
/// hashes are filled in as chunks arrive. Parent hashes propagate lazily
/// whenever both children are present, so a chunk can be emitted as soon as
/// `can_generate_proof` holds for it, before downstream siblings are filled.
#[derive(Debug)]
pub struct IncrementalMerkle {
    links: Vec<Link>,
    hashes: Vec<Option<[u8; 32]>>,
    leaf_count: u32,
    next_leaf: u32,
}

impl IncrementalMerkle {
    /// Allocate the skeletal structure for `leaf_count` leaves
    pub fn new(leaf_count: u32) -> Result<Self, MerkleError> {
        if leaf_count == 0 {
            return Err(MerkleError::Empty);
        }
        let links = skeleton(leaf_count);
        let hashes = vec![None; links.len()];
        Ok(Self {
            links,
            hashes,
            leaf_count,
            next_leaf: 0,
        })
    }

    /// Number of leaves the tree was allocated for
    #[must_use]
    pub fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    /// Number of leaves filled so far
    #[must_use]
    pub fn filled(&self) -> u32 {
        self.next_leaf
    }

    /// Whether every leaf has been added
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next_leaf == self.leaf_count
    }

    /// Hash the next chunk into its leaf slot and propagate parents
    ///
    /// Returns the index of the filled leaf.
    pub fn add_chunk(&mut self, data: &[u8]) -> Result<u32, MerkleError> {
        if self.next_leaf >= self.leaf_count {
            return Err(MerkleError::OutOfRange {
                index: self.next_leaf,
                leaf_count: self.leaf_count,
            });
        }
        let index = self.next_leaf;
        self.hashes[index as usize] = Some(hash_chunk(data));
        self.next_leaf += 1;
        self.propagate(index);
        Ok(index)
    }

    fn propagate(&mut self, from: u32) {
        let mut cur = from;
        while let Some(parent) = self.links[cur as usize].parent {
            if self.hashes[parent as usize].is_some() {
                break;
            }
            let link = self.links[parent as usize];
            let (left, right) = (link.left.unwrap_or(cur), link.right.unwrap_or(cur));
            match (self.hashes[left as usize], self.hashes[right as usize]) {
                (Some(l), Some(r)) => {
                    self.hashes[parent as usize] = Some(hash_pair(&l, &r));
                    cur = parent;
                }
                _ => break,
            }
        }
    }

    /// Whether every sibling on leaf `index`'s path to the root has a hash
    #[must_use]
    pub fn can_generate_proof(&self, index: u32) -> bool {
        if index >= self.leaf_count || self.hashes[index as usize].is_none() {
            return false;
        }
        let mut cur = index;
        while let Some(parent) = self.links[cur as usize].parent {
            let link = self.links[parent as usize];
            let (left, right) = (link.left.unwrap_or(cur), link.right.unwrap_or(cur));
            let sibling = if left == cur { right } else { left };
            if self.hashes[sibling as usize].is_none() {
                return false;
            }
            cur = parent;
        }
        true
    }

    /// Inclusion proof for leaf `index`
    ///
    /// # Errors
    ///
    /// Returns `ProofUnavailable` until `can_generate_proof(index)` holds.
    pub fn proof(&self, index: u32) -> Result<Vec<[u8; 32]>, MerkleError> {
        if index >= self.leaf_count {
            return Err(MerkleError::OutOfRange {
                index,
                leaf_count: self.leaf_count,
            });
        }
        if !self.can_generate_proof(index) {
            return Err(MerkleError::ProofUnavailable(index));
        }
        let mut proof = Vec::new();
        let mut cur = index;
        while let Some(parent) = self.links[cur as usize].parent {
            let link = self.links[parent as usize];
            let (left, right) = (link.left.unwrap_or(cur), link.right.unwrap_or(cur));
            let sibling = if left == cur { right } else { left };
            proof.push(self.hashes[sibling as usize].expect("checked by can_generate_proof"));
            cur = parent;
        }
        Ok(proof)
    }

    /// Root hash, available once every leaf has been added
    #[must_use]
    pub fn root(&self) -> Option<[u8; 32]> {
        self.hashes[self.hashes.len() - 1]
    }

    /// Convert into a complete [`MerkleTree`]
    ///
    /// # Errors
    ///
    /// Returns `Incomplete` while any leaf is missing.
    pub fn into_tree(self) -> Result<MerkleTree, MerkleError> {
        if !self.is_complete() {
            return Err(MerkleError::Incomplete);
        }
        let nodes = self
            .links
            .iter()
            .zip(self.hashes.iter())
            .map(|(link, hash)| MerkleNode {
                hash: hash.expect("complete tree has every hash"),
                left: link.left,
                right: link.right,
                parent: link.parent,
            })
            .collect();
        Ok(MerkleTree {
            nodes,
            leaf_count: self.leaf_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 64]).collect()
    }

    #[test]
    fn test_single_leaf_tree() {
        let tree = MerkleTree::from_chunks(&[b"hello".as_slice()]).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.root_hash(), hash_chunk(b"hello"));
        assert_eq!(tree.proof(0).unwrap(), Vec::<[u8; 32]>::new());
    }

    #[test]
    fn test_zero_byte_chunk_has_root() {
        let tree = MerkleTree::from_chunks(&[b"".as_slice()]).unwrap();
        assert_eq!(tree.root_hash(), hash_chunk(b""));
        assert!(verify_proof(b"", &[], &tree.root_hash(), 0));
    }

    #[test]
    fn test_empty_tree_rejected() {
        let none: Vec<Vec<u8>> = Vec::new();
        assert_eq!(MerkleTree::from_chunks(&none), Err(MerkleError::Empty));
    }

    #[test]
    fn test_two_leaves_three_nodes() {
        let tree = MerkleTree::from_chunks(&chunks(2)).unwrap();
        assert_eq!(tree.node_count(), 3);
        let root = tree.nodes().last().unwrap();
        assert_eq!(root.left, Some(0));
        assert_eq!(root.right, Some(1));
        assert_eq!(tree.proof(0).unwrap().len(), 1);
        assert_eq!(tree.proof(1).unwrap().len(), 1);
    }

    #[test]
    fn test_odd_count_self_pairs() {
        let data = chunks(3);
        let tree = MerkleTree::from_chunks(&data).unwrap();
        // 3 leaves + 2 internal + 1 root
        assert_eq!(tree.node_count(), 6);
        // The lone third leaf pairs with itself
        let pair = &tree.nodes()[4];
        assert_eq!(pair.left, Some(2));
        assert_eq!(pair.right, Some(2));
        assert_eq!(pair.hash, {
            let leaf = hash_chunk(&data[2]);
            hash_pair(&leaf, &leaf)
        });

        for (i, chunk) in data.iter().enumerate() {
            let proof = tree.proof(i as u32).unwrap();
            assert!(verify_proof(chunk, &proof, &tree.root_hash(), i as u64));
        }
    }

    #[test]
    fn test_verify_rejects_tampered_chunk() {
        let data = chunks(5);
        let tree = MerkleTree::from_chunks(&data).unwrap();
        for (i, chunk) in data.iter().enumerate() {
            let proof = tree.proof(i as u32).unwrap();
            let mut bad = chunk.clone();
            bad[0] ^= 0xFF;
            assert!(!verify_proof(&bad, &proof, &tree.root_hash(), i as u64));
        }
    }

    #[test]
    fn test_verify_rejects_wrong_index() {
        let data = chunks(4);
        let tree = MerkleTree::from_chunks(&data).unwrap();
        let proof = tree.proof(1).unwrap();
        assert!(!verify_proof(&data[1], &proof, &tree.root_hash(), 2));
    }

    #[test]
    fn test_serialize_roundtrip() {
        for n in [1usize, 2, 3, 4, 5, 8, 13] {
            let tree = MerkleTree::from_chunks(&chunks(n)).unwrap();
            let bytes = tree.serialize();
            let restored = MerkleTree::deserialize(&bytes, n as u32).unwrap();
            assert_eq!(restored.leaf_count(), tree.leaf_count());
            assert_eq!(restored.node_count(), tree.node_count());
            assert_eq!(restored.root_hash(), tree.root_hash());
            // Proofs work identically on the restored tree
            for i in 0..n as u32 {
                assert_eq!(restored.proof(i).unwrap(), tree.proof(i).unwrap());
            }
        }
    }

    #[test]
    fn test_deserialize_leaf_count_mismatch() {
        let tree = MerkleTree::from_chunks(&chunks(4)).unwrap();
        let bytes = tree.serialize();
        assert_eq!(
            MerkleTree::deserialize(&bytes, 5),
            Err(MerkleError::LeafCountMismatch {
                expected: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn test_deserialize_truncated() {
        let tree = MerkleTree::from_chunks(&chunks(4)).unwrap();
        let bytes = tree.serialize();
        assert!(matches!(
            MerkleTree::deserialize(&bytes[..bytes.len() - 1], 4),
            Err(MerkleError::Malformed(_))
        ));
    }

    #[test]
    fn test_serialized_root_sentinel() {
        let tree = MerkleTree::from_chunks(&chunks(2)).unwrap();
        let bytes = tree.serialize();
        // Last node record's parent field is the sentinel
        let tail = &bytes[bytes.len() - 4..];
        assert_eq!(tail, &ROOT_PARENT_SENTINEL.to_le_bytes());
    }

    #[test]
    fn test_incremental_matches_batch() {
        for n in [1usize, 2, 3, 5, 7, 16] {
            let data = chunks(n);
            let batch = MerkleTree::from_chunks(&data).unwrap();

            let mut inc = IncrementalMerkle::new(n as u32).unwrap();
            for chunk in &data {
                inc.add_chunk(chunk).unwrap();
            }
            assert!(inc.is_complete());
            assert_eq!(inc.root(), Some(batch.root_hash()));

            let tree = inc.into_tree().unwrap();
            assert_eq!(tree, batch);
        }
    }

    #[test]
    fn test_incremental_proof_stability() {
        // With 4 leaves, leaf 0's proof needs leaf 1 and the hash of (2,3)
        let data = chunks(4);
        let mut inc = IncrementalMerkle::new(4).unwrap();

        inc.add_chunk(&data[0]).unwrap();
        assert!(!inc.can_generate_proof(0));

        inc.add_chunk(&data[1]).unwrap();
        assert!(!inc.can_generate_proof(0));

        inc.add_chunk(&data[2]).unwrap();
        assert!(!inc.can_generate_proof(0));

        inc.add_chunk(&data[3]).unwrap();
        assert!(inc.can_generate_proof(0));
        assert!(inc.can_generate_proof(3));

        let root = inc.root().unwrap();
        for (i, chunk) in data.iter().enumerate() {
            let proof = inc.proof(i as u32).unwrap();
            assert!(verify_proof(chunk, &proof, &root, i as u64));
        }
    }

    #[test]
    fn test_incremental_early_emission_with_self_pair() {
        // 3 leaves: leaf 0 and 1 become provable as soon as the self-paired
        // third leaf fills in.
        let data = chunks(3);
        let mut inc = IncrementalMerkle::new(3).unwrap();
        inc.add_chunk(&data[0]).unwrap();
        inc.add_chunk(&data[1]).unwrap();
        assert!(!inc.can_generate_proof(0));
        inc.add_chunk(&data[2]).unwrap();
        assert!(inc.can_generate_proof(0));
        assert!(inc.can_generate_proof(2));
    }

    #[test]
    fn test_incremental_proof_before_stable_fails() {
        let mut inc = IncrementalMerkle::new(2).unwrap();
        inc.add_chunk(b"a").unwrap();
        assert_eq!(inc.proof(0), Err(MerkleError::ProofUnavailable(0)));
    }

    #[test]
    fn test_incremental_too_many_chunks() {
        let mut inc = IncrementalMerkle::new(1).unwrap();
        inc.add_chunk(b"a").unwrap();
        assert!(matches!(
            inc.add_chunk(b"b"),
            Err(MerkleError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_content_id_base64_roundtrip() {
        let id = ContentId::new(hash_chunk(&[1, 2, 3, 4, 5]));
        let parsed = ContentId::from_base64(&id.to_base64()).unwrap();
        assert_eq!(parsed, id);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_every_leaf_proof_verifies(
                n in 1usize..200,
                seed in any::<u8>(),
            ) {
                let data: Vec<Vec<u8>> =
                    (0..n).map(|i| vec![seed.wrapping_add(i as u8); 16]).collect();
                let tree = MerkleTree::from_chunks(&data).unwrap();
                let root = tree.root_hash();
                for (i, chunk) in data.iter().enumerate() {
                    let proof = tree.proof(i as u32).unwrap();
                    prop_assert!(verify_proof(chunk, &proof, &root, i as u64));
                }
            }

            #[test]
            fn prop_flipped_byte_fails(
                n in 1usize..64,
                leaf in any::<prop::sample::Index>(),
                byte in any::<prop::sample::Index>(),
            ) {
                let data: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; 8]).collect();
                let tree = MerkleTree::from_chunks(&data).unwrap();
                let i = leaf.index(n);
                let proof = tree.proof(i as u32).unwrap();
                let mut bad = data[i].clone();
                let b = byte.index(bad.len());
                bad[b] ^= 0x01;
                prop_assert!(!verify_proof(&bad, &proof, &tree.root_hash(), i as u64));
            }

            #[test]
            fn prop_serialize_roundtrip(n in 1usize..96) {
                let data: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; 4]).collect();
                let tree = MerkleTree::from_chunks(&data).unwrap();
                let restored = MerkleTree::deserialize(&tree.serialize(), n as u32).unwrap();
                prop_assert_eq!(restored.root_hash(), tree.root_hash());
                prop_assert_eq!(restored.node_count(), tree.node_count());
            }

            #[test]
            fn prop_incremental_equals_batch(n in 1usize..96) {
                let data: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; 4]).collect();
                let batch = MerkleTree::from_chunks(&data).unwrap();
                let mut inc = IncrementalMerkle::new(n as u32).unwrap();
                for chunk in &data {
                    inc.add_chunk(chunk).unwrap();
                }
                prop_assert_eq!(inc.root(), Some(batch.root_hash()));
            }
        }
    }
}
