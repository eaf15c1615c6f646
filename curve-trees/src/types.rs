//! Core data types shared by the curve-tree algorithms and the tree cache.
//!
//! This module defines:
//! - index aliases for layers, chunks, leaves and blocks;
//! - the records inserted into the tree ([`OutputPair`], [`OutputContext`]);
//! - the block bookkeeping of the cache ([`BlockMeta`]);
//! - the error types of the crate.

use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use tower_cycle::CurveError;

/// Index of a hash layer; layer 0 holds the hashes of the leaf chunks.
pub type LayerIdx = usize;
/// Index of a chunk within its layer.
pub type ChildChunkIdx = u64;
/// Position of an output in the leaf layer, counted in leaf tuples.
pub type LeafIdx = u64;
/// Height of a block.
pub type BlockIdx = u64;
/// 32-byte block identifier.
pub type BlockHash = [u8; 32];
/// Global, monotonically increasing output sequence number.
pub type OutputId = u64;
/// Block at which a time-locked output becomes spendable and enters the tree.
pub type UnlockBlockIdx = u64;
/// Block in which an output was announced.
pub type CreatedBlockIdx = u64;
/// Number of outputs.
pub type NumOutputs = u64;

/// Outputs grouped by the block at which they unlock.
pub type OutsByUnlockBlock = BTreeMap<UnlockBlockIdx, Vec<OutputContext>>;

/// A record of the accumulated set: two compressed ed25519 points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputPair {
    /// The one-time output key `O`.
    pub output_pubkey: [u8; 32],
    /// The amount commitment `C`.
    pub commitment: [u8; 32],
}

impl OutputPair {
    /// Key of this pair in the registered output map.
    pub fn output_ref(&self) -> OutputRef {
        let mut hasher = Sha256::new();
        hasher.update(self.output_pubkey);
        hasher.update(self.commitment);
        OutputRef(hasher.finalize().into())
    }
}

/// SHA-256 of `output_pubkey || commitment`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, From, Serialize, Deserialize,
)]
pub struct OutputRef(pub [u8; 32]);

/// An [`OutputPair`] together with its canonical position in the output set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputContext {
    /// Outputs enter the tree in ascending `output_id` order.
    pub output_id: OutputId,
    /// Set when both points are already known to be torsion-free, which lets
    /// leaf conversion skip torsion clearing.
    pub torsion_checked: bool,
    pub output_pair: OutputPair,
}

/// What the cache remembers about a synced block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub blk_idx: BlockIdx,
    pub blk_hash: BlockHash,
    /// Size of the leaf layer after this block.
    pub n_leaf_tuples: u64,
}

/// The root of the tree together with the number of layers under it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRoot {
    pub root: [u8; 32],
    pub n_layers: usize,
}

impl std::fmt::Display for TreeRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} layers)", hex::encode(self.root), self.n_layers)
    }
}

/// Leaf index a registered output occupies, once its output has been
/// inserted into the tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedLeafIdx {
    pub assigned: bool,
    pub leaf_idx: LeafIdx,
}

impl AssignedLeafIdx {
    pub fn assign(&mut self, leaf_idx: LeafIdx) {
        self.assigned = true;
        self.leaf_idx = leaf_idx;
    }

    pub fn unassign(&mut self) {
        self.assigned = false;
        self.leaf_idx = 0;
    }
}

/// Reasons a record cannot be converted into a leaf tuple.
///
/// These are expected for adversarial input: the record is simply left out of
/// the tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("{what} is not a valid compressed ed25519 point")]
    Decompress { what: &'static str },

    #[error("{what} is the identity")]
    Identity { what: &'static str },

    #[error("{what} has small order")]
    SmallOrder { what: &'static str },

    #[error("hash to point found no valid point after {tries} tries")]
    HashToPoint { tries: usize },
}

/// Errors raised by the stateless curve-tree algorithms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurveTreesError {
    #[error(transparent)]
    Curve(#[from] CurveError),

    #[error("conversion of a stored output failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: &'static str },

    #[error("invalid layer instructions: {message}")]
    InvalidInstructions { message: &'static str },

    #[error("invalid input: {message}")]
    InvalidInput { message: &'static str },

    #[error("last hash of layer {layer_idx} is missing")]
    MissingLastHash { layer_idx: LayerIdx },
}

/// Errors raised by [`crate::TreeSync`] and [`crate::TreeCache`].
///
/// Every variant is fatal: the cache is in an unexpected state or the caller
/// violated a precondition. Expected negative outcomes are reported through
/// `bool` and `Option` return values instead.
#[derive(Error, Debug)]
pub enum TreeSyncError {
    #[error(transparent)]
    CurveTrees(#[from] CurveTreesError),

    #[error(transparent)]
    Curve(#[from] CurveError),

    #[error("block {block_idx} does not extend the synced chain: {message}")]
    NonContiguousBlock {
        block_idx: BlockIdx,
        message: &'static str,
    },

    #[error("unlock block {unlock_block_idx} must be above block {block_idx}")]
    InvalidUnlockBlock {
        unlock_block_idx: UnlockBlockIdx,
        block_idx: BlockIdx,
    },

    #[error("chunk {chunk} is not cached")]
    MissingChunk { chunk: String },

    #[error("chunk {chunk} has no reference left to release")]
    ZeroRefCount { chunk: String },

    #[error("cache is inconsistent: {message}")]
    InconsistentCache { message: &'static str },

    #[error("reference count mismatch at chunk {chunk}: cached {cached}, expected {expected}")]
    RefCountMismatch {
        chunk: String,
        cached: u64,
        expected: u64,
    },

    #[error("invalid checkpoint: {message}")]
    InvalidCheckpoint { message: &'static str },

    #[error("snapshot version {found} is not supported (expected {expected})")]
    SnapshotVersion { found: u32, expected: u32 },

    #[error("snapshot was written with a different {setting}: {found} (expected {expected})")]
    SnapshotConfig {
        setting: &'static str,
        found: u64,
        expected: u64,
    },

    #[error("output id {output_id} leaves no room for a following output")]
    OutputIdOverflow { output_id: OutputId },

    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("snapshot decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_ref_binds_both_points() {
        let a = OutputPair {
            output_pubkey: [1u8; 32],
            commitment: [2u8; 32],
        };
        let b = OutputPair {
            output_pubkey: [2u8; 32],
            commitment: [1u8; 32],
        };
        assert_ne!(a.output_ref(), b.output_ref());
        assert_eq!(a.output_ref(), a.output_ref());
    }

    #[test]
    fn unassign_resets_leaf_idx() {
        let mut idx = AssignedLeafIdx::default();
        idx.assign(7);
        assert!(idx.assigned);
        idx.unassign();
        assert_eq!(idx, AssignedLeafIdx::default());
    }
}
