//! Binary SHA-256 Merkle tree: construction, inclusion proofs, verification.
//!
//! Internal nodes are `SHA256(left || right)` with no domain-separation
//! prefix — a literal concatenation of the two child digests, so
//! independent verifiers must reproduce it exactly (e.g. for three leaves,
//! `root = SHA256(SHA256(L0||L1) || SHA256(L2||L2))`).

use sha2::{Digest as _, Sha256};

use crate::digest::Digest;
use crate::error::{CompressionError, Result};

fn combine(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest(hasher.finalize().into())
}

/// A built Merkle tree retaining every level so inclusion proofs can be
/// read back in constant time per query.
#[derive(Debug, Clone)]
pub struct Tree {
    levels: Vec<Vec<Digest>>,
}

impl Tree {
    /// Number of leaves the tree was built over.
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    /// Whether the tree has no leaves (never true for a built `Tree`).
    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// The tree's root digest.
    pub fn root(&self) -> Digest {
        self.levels.last().expect("tree always has a root level")[0]
    }
}

/// Build a tree over an ordered leaf vector. Leaf order is preserved as
/// index order, so leaf `i` is `leaves[i]`.
pub fn build(leaves: &[Digest]) -> Result<Tree> {
    if leaves.is_empty() {
        return Err(CompressionError::EmptyInput);
    }
    let mut levels = vec![leaves.to_vec()];
    while levels.last().unwrap().len() > 1 {
        let current = levels.last().unwrap();
        let mut next = Vec::with_capacity((current.len() + 1) / 2);
        for pair in current.chunks(2) {
            let left = &pair[0];
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            next.push(combine(left, right));
        }
        levels.push(next);
    }
    Ok(Tree { levels })
}

/// The tree's root digest.
pub fn root(tree: &Tree) -> Digest {
    tree.root()
}

/// Sibling digests from `leaves[index]` up to the root, bottom-up. Length is
/// `ceil(log2(n))` for `n > 1`, and empty for a single-leaf tree.
pub fn proof(tree: &Tree, index: usize) -> Result<Vec<Digest>> {
    let n = tree.len();
    if index >= n {
        return Err(CompressionError::IndexOutOfRange(index));
    }
    let mut path = Vec::new();
    let mut idx = index;
    for level in &tree.levels[..tree.levels.len() - 1] {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        let sibling = if sibling_idx < level.len() {
            level[sibling_idx]
        } else {
            level[idx]
        };
        path.push(sibling);
        idx /= 2;
    }
    Ok(path)
}

/// Recompute a root from `leaf` and `proof`, consuming siblings bottom-up and
/// respecting `index` parity at each level to choose concatenation order,
/// then compare to `root`. The final comparison is constant-time.
pub fn verify(root: &Digest, leaf: &Digest, index: usize, proof: &[Digest]) -> bool {
    let mut acc = *leaf;
    let mut idx = index;
    for sibling in proof {
        acc = if idx % 2 == 0 {
            combine(&acc, sibling)
        } else {
            combine(sibling, &acc)
        };
        idx /= 2;
    }
    constant_time_eq(acc.as_bytes(), root.as_bytes())
}

/// Verify a proof against a known leaf count, surfacing `MalformedProof`
/// when the supplied proof length does not match the tree's derived depth.
pub fn verify_with_len(
    root: &Digest,
    leaf: &Digest,
    index: usize,
    proof: &[Digest],
    leaf_count: usize,
) -> Result<bool> {
    if index >= leaf_count {
        return Err(CompressionError::IndexOutOfRange(index));
    }
    let expected = depth_for(leaf_count);
    if proof.len() != expected {
        return Err(CompressionError::MalformedProof {
            expected,
            got: proof.len(),
        });
    }
    Ok(verify(root, leaf, index, proof))
}

fn depth_for(leaf_count: usize) -> usize {
    if leaf_count <= 1 {
        return 0;
    }
    let mut depth = 0;
    let mut n = leaf_count - 1;
    while n > 0 {
        depth += 1;
        n >>= 1;
    }
    depth
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for i in 0..32 {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}
