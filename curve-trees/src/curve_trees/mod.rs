//! The stateless curve-tree algorithms.
//!
//! A curve tree is a Merkle-like tree whose layers alternate between two
//! curves `A` and `B` forming a cycle. Outputs are converted into leaf tuples
//! of curve-B scalars; every chunk of `LEAF_TUPLE_SIZE * b_chunk_width` leaf
//! scalars is hashed into a curve-B point (hash layer 0). The x-coordinates of
//! those points are curve-A scalars, which are chunked by `a_chunk_width` and
//! hashed into curve-A points (hash layer 1), and so on until a layer holds a
//! single element: the root.
//!
//! ```text
//!   layer 2 (B)            R
//!                      /       \
//!   layer 1 (A)     a0           a1
//!                 / .. \       /    \
//!   layer 0 (B)  b0 .. b17   b18 .. b20
//!               / \
//!   leaves   [O I C][O I C] .. (38 tuples per chunk)
//! ```
//!
//! [`CurveTrees`] holds no tree state. It computes:
//! - the [`TreeExtension`] that appends new outputs to a tree, given only the
//!   last hash of every layer;
//! - the [`TreeReduction`] that removes outputs from the end of a tree, given
//!   the children of the new last chunks;
//! - path indexes and path audits.

use crate::{
    config::CurveTreesConfig,
    constant::LEAF_TUPLE_SIZE,
    types::{ChildChunkIdx, CurveTreesError, LayerIdx, LeafIdx, OutputContext, OutputPair},
};
use rayon::prelude::*;
use std::ops::Range;
use tower_cycle::{Curve, Pallas, Vesta};

pub mod grow;
pub mod instructions;
pub mod leaves;
pub mod path;
pub mod trim;

#[cfg(test)]
pub(crate) mod test_utils;

pub use instructions::{GrowLayerInstructions, TrimLayerInstructions};
pub use path::{Path, PathBytes, PathHashes};

/// The curve trees used in production: Vesta hashes the odd layers, Pallas
/// hashes the leaves and the even layers.
pub type PastaCurveTrees = CurveTrees<Vesta, Pallas>;

/// The three curve-B scalars an output contributes to the leaf layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafTuple<S> {
    pub o_x: S,
    pub i_x: S,
    pub c_x: S,
}

/// New and updated hashes of one layer.
#[derive(Clone, Debug)]
pub struct LayerExtension<C: Curve> {
    /// Index of the first hash in `hashes`.
    pub start_idx: u64,
    /// Whether `hashes[0]` replaces the layer's existing last hash.
    pub update_existing_last_hash: bool,
    pub hashes: Vec<C::Point>,
}

/// Outputs appended to the leaf layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Leaves {
    /// Leaf index of the first appended tuple.
    pub start_leaf_tuple_idx: LeafIdx,
    pub tuples: Vec<OutputContext>,
}

/// Everything needed to append a batch of outputs to a tree.
///
/// `b_layer_extensions[k]` extends hash layer `2k` and `a_layer_extensions[k]`
/// extends hash layer `2k + 1`.
#[derive(Clone, Debug)]
pub struct TreeExtension<A: Curve, B: Curve> {
    pub leaves: Leaves,
    pub a_layer_extensions: Vec<LayerExtension<A>>,
    pub b_layer_extensions: Vec<LayerExtension<B>>,
}

impl<A: Curve, B: Curve> TreeExtension<A, B> {
    /// Number of hash layers touched by this extension.
    pub fn n_layers(&self) -> usize {
        self.a_layer_extensions.len() + self.b_layer_extensions.len()
    }
}

/// The last hash of every layer of a tree, split per curve with the same
/// interleaving as [`TreeExtension`].
#[derive(Clone, Debug)]
pub struct LastHashes<A: Curve, B: Curve> {
    pub a_last_hashes: Vec<A::Point>,
    pub b_last_hashes: Vec<B::Point>,
}

impl<A: Curve, B: Curve> Default for LastHashes<A, B> {
    fn default() -> Self {
        Self {
            a_last_hashes: Vec::new(),
            b_last_hashes: Vec::new(),
        }
    }
}

impl<A: Curve, B: Curve> LastHashes<A, B> {
    pub fn n_layers(&self) -> usize {
        self.a_last_hashes.len() + self.b_last_hashes.len()
    }
}

/// The new last hash of one layer after a trim.
#[derive(Clone, Debug)]
pub struct LayerReduction<C: Curve> {
    pub new_total_parents: u64,
    pub update_existing_last_hash: bool,
    pub new_last_hash: C::Point,
}

/// Everything needed to shrink a tree to `new_total_leaf_tuples` leaves.
#[derive(Clone, Debug)]
pub struct TreeReduction<A: Curve, B: Curve> {
    pub new_total_leaf_tuples: u64,
    pub a_layer_reductions: Vec<LayerReduction<A>>,
    pub b_layer_reductions: Vec<LayerReduction<B>>,
}

/// Per layer, the children used to trim (or regrow) the new last chunk.
///
/// `b_children[0]` are leaf scalars; the remaining entries follow the usual
/// A/B interleaving, indexed by the layer that is being hashed.
#[derive(Clone, Debug)]
pub struct LastChunkChildrenToTrim<A: Curve, B: Curve> {
    pub a_children: Vec<Vec<A::Scalar>>,
    pub b_children: Vec<Vec<B::Scalar>>,
}

impl<A: Curve, B: Curve> Default for LastChunkChildrenToTrim<A, B> {
    fn default() -> Self {
        Self {
            a_children: Vec::new(),
            b_children: Vec::new(),
        }
    }
}

/// The `[start, end)` ranges of every chunk on the path of a leaf.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathIndexes {
    /// Range of leaf tuples in the leaf chunk.
    pub leaf_range: Range<LeafIdx>,
    /// Range of elements in the path chunk of every hash layer.
    pub layers: Vec<Range<u64>>,
}

/// Read access to an existing tree, used to collect what a trim needs.
pub trait TreeReader<A: Curve, B: Curve> {
    /// Custom trait's error type.
    type Error: From<CurveTreesError>;

    /// The output at `leaf_idx`.
    fn leaf(&self, leaf_idx: LeafIdx) -> Result<OutputPair, Self::Error>;

    /// Element `elem_idx` of the odd hash layer `layer_idx`.
    fn a_elem(&self, layer_idx: LayerIdx, elem_idx: u64) -> Result<A::Point, Self::Error>;

    /// Element `elem_idx` of the even hash layer `layer_idx`.
    fn b_elem(&self, layer_idx: LayerIdx, elem_idx: u64) -> Result<B::Point, Self::Error>;
}

/// The curve-tree algorithms for the cycle `(A, B)`, where the leaves and the
/// even layers are hashed by `B`.
#[derive(Clone, Debug)]
pub struct CurveTrees<A: Curve, B: Curve> {
    pub curve_a: A,
    pub curve_b: B,
    a_chunk_width: usize,
    b_chunk_width: usize,
    leaf_layer_chunk_width: usize,
    /// Minimum task batch size for parallel processing.
    min_par_batch_size: usize,
}

impl PastaCurveTrees {
    /// Builds Vesta/Pallas curve trees with generators sized for `config`.
    pub fn from_config(config: &CurveTreesConfig) -> Result<Self, CurveTreesError> {
        config.validate()?;
        let curve_a = Vesta::new(config.a_chunk_width);
        let curve_b = Pallas::new(config.b_chunk_width.max(config.leaf_layer_chunk_width()));
        Self::new(curve_a, curve_b, config)
    }
}

impl<A, B> CurveTrees<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    /// Creates the algorithm object; both curves must carry enough generators
    /// for their widest chunk.
    pub fn new(curve_a: A, curve_b: B, config: &CurveTreesConfig) -> Result<Self, CurveTreesError> {
        config.validate()?;
        let leaf_layer_chunk_width = config.leaf_layer_chunk_width();
        if curve_a.chunk_width() < config.a_chunk_width {
            return Err(CurveTreesError::InvalidConfig {
                message: "curve A has fewer generators than a_chunk_width",
            });
        }
        if curve_b.chunk_width() < leaf_layer_chunk_width.max(config.b_chunk_width) {
            return Err(CurveTreesError::InvalidConfig {
                message: "curve B has fewer generators than the leaf chunk width",
            });
        }

        Ok(Self {
            curve_a,
            curve_b,
            a_chunk_width: config.a_chunk_width,
            b_chunk_width: config.b_chunk_width,
            leaf_layer_chunk_width,
            min_par_batch_size: config.min_par_batch_size,
        })
    }

    /// Configure the minimum task batch size for parallel processing.
    pub fn with_min_par_batch_size(mut self, min_task_size: usize) -> Self {
        self.min_par_batch_size = min_task_size.max(1);
        self
    }

    pub fn a_chunk_width(&self) -> usize {
        self.a_chunk_width
    }

    pub fn b_chunk_width(&self) -> usize {
        self.b_chunk_width
    }

    pub fn leaf_layer_chunk_width(&self) -> usize {
        self.leaf_layer_chunk_width
    }

    /// Width of the chunks that group the elements of hash layer `layer_idx`,
    /// i.e. the width of the curve hashing the layer above it.
    pub fn layer_chunk_width(&self, layer_idx: LayerIdx) -> usize {
        if layer_idx % 2 == 0 {
            self.a_chunk_width
        } else {
            self.b_chunk_width
        }
    }

    /// Number of elements in every hash layer of a tree with `n_leaf_tuples`
    /// leaves, bottom-up. The last entry is always 1 (the root).
    pub fn n_elems_per_layer(&self, n_leaf_tuples: u64) -> Vec<u64> {
        if n_leaf_tuples == 0 {
            return vec![];
        }

        let mut n = n_leaf_tuples.div_ceil(self.b_chunk_width as u64);
        let mut n_elems = vec![n];
        while n > 1 {
            n = n.div_ceil(self.layer_chunk_width(n_elems.len() - 1) as u64);
            n_elems.push(n);
        }
        n_elems
    }

    /// Number of hash layers of a tree with `n_leaf_tuples` leaves.
    pub fn n_layers(&self, n_leaf_tuples: u64) -> usize {
        self.n_elems_per_layer(n_leaf_tuples).len()
    }

    /// Chunk index of the path of `leaf_idx`: the leaf chunk first, then the
    /// chunk of every hash layer, the root chunk (always 0) last.
    pub fn get_child_chunk_indexes(
        &self,
        n_leaf_tuples: u64,
        leaf_idx: LeafIdx,
    ) -> Result<Vec<ChildChunkIdx>, CurveTreesError> {
        if leaf_idx >= n_leaf_tuples {
            return Err(CurveTreesError::InvalidInput {
                message: "leaf index is outside the tree",
            });
        }

        let n_layers = self.n_layers(n_leaf_tuples);
        let mut chunk_idxs = Vec::with_capacity(n_layers + 1);
        let mut idx = leaf_idx / self.b_chunk_width as u64;
        chunk_idxs.push(idx);
        for layer_idx in 0..n_layers {
            idx /= self.layer_chunk_width(layer_idx) as u64;
            chunk_idxs.push(idx);
        }
        Ok(chunk_idxs)
    }

    /// Index ranges of every chunk on the path of `leaf_idx`.
    pub fn get_path_indexes(
        &self,
        n_leaf_tuples: u64,
        leaf_idx: LeafIdx,
    ) -> Result<PathIndexes, CurveTreesError> {
        let chunk_idxs = self.get_child_chunk_indexes(n_leaf_tuples, leaf_idx)?;
        let n_elems = self.n_elems_per_layer(n_leaf_tuples);

        let chunk_range = |chunk_idx: u64, width: usize, n: u64| {
            let start = chunk_idx * width as u64;
            start..(start + width as u64).min(n)
        };

        Ok(PathIndexes {
            leaf_range: chunk_range(chunk_idxs[0], self.b_chunk_width, n_leaf_tuples),
            layers: n_elems
                .iter()
                .enumerate()
                .map(|(layer_idx, n)| {
                    chunk_range(chunk_idxs[layer_idx + 1], self.layer_chunk_width(layer_idx), *n)
                })
                .collect(),
        })
    }

    /// Computes a reasonable task batch size for parallel processing in rayon.
    fn par_batch_size(&self, num_tasks: usize) -> usize {
        let num_batches = 10 * rayon::current_num_threads();
        self.min_par_batch_size.max(num_tasks.div_ceil(num_batches))
    }

    /// Maps `items` in order, on the rayon pool once there are enough of them.
    pub(crate) fn par_map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        if items.len() < self.min_par_batch_size {
            return items.iter().map(f).collect();
        }
        let batch_size = self.par_batch_size(items.len());
        items.par_iter().with_min_len(batch_size).map(f).collect()
    }
}
