//! Membership paths and their audit.
//!
//! The path of a leaf is the leaf chunk containing it plus, for every hash
//! layer, the chunk containing its ancestor. The hash of each chunk must
//! appear in the chunk above it, and the top chunk holds only the root.

use crate::{
    curve_trees::{CurveTrees, LastHashes},
    types::{CurveTreesError, LayerIdx, OutputPair},
};
use serde::{Deserialize, Serialize};
use tower_cycle::{Curve, PointBytes};

/// The chunks on the path of a leaf, with the A/B interleaving of
/// [`crate::curve_trees::TreeExtension`].
#[derive(Clone, Debug)]
pub struct Path<A: Curve, B: Curve> {
    pub leaves: Vec<OutputPair>,
    pub a_layers: Vec<Vec<A::Point>>,
    pub b_layers: Vec<Vec<B::Point>>,
}

impl<A: Curve, B: Curve> Default for Path<A, B> {
    fn default() -> Self {
        Self {
            leaves: Vec::new(),
            a_layers: Vec::new(),
            b_layers: Vec::new(),
        }
    }
}

impl<A: Curve, B: Curve> Path<A, B> {
    /// An empty path stands for an output that is not in the tree yet.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty() && self.a_layers.is_empty() && self.b_layers.is_empty()
    }

    pub fn n_layers(&self) -> usize {
        self.a_layers.len() + self.b_layers.len()
    }

    /// Layers alternate starting with a B layer, so there are as many B
    /// layers as A layers, or one more.
    fn check_shape(&self) -> Result<(), CurveTreesError> {
        let n_b = self.b_layers.len();
        let n_a = self.a_layers.len();
        if n_b != n_a && n_b != n_a + 1 {
            return Err(CurveTreesError::InvalidInput {
                message: "path layers do not alternate between the curves",
            });
        }
        Ok(())
    }
}

/// A [`Path`] with every point compressed, layer chunks ordered bottom-up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathBytes {
    pub leaves: Vec<OutputPair>,
    pub layer_chunks: Vec<Vec<PointBytes>>,
}

/// The hash of every chunk on a path except the top one: `b_hashes[k]` is
/// the hash of the chunk below layer `2k` (the leaves for `k = 0`), and
/// `a_hashes[k]` the hash of the chunk below layer `2k + 1`.
#[derive(Clone, Debug)]
pub struct PathHashes<A: Curve, B: Curve> {
    pub a_hashes: Vec<A::Point>,
    pub b_hashes: Vec<B::Point>,
}

impl<A, B> CurveTrees<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    pub fn path_to_bytes(&self, path: &Path<A, B>) -> Result<PathBytes, CurveTreesError> {
        path.check_shape()?;
        let layer_chunks = (0..path.n_layers())
            .map(|layer_idx| {
                if layer_idx % 2 == 0 {
                    let chunk = &path.b_layers[layer_idx / 2];
                    chunk.iter().map(|p| self.curve_b.to_bytes(p)).collect()
                } else {
                    let chunk = &path.a_layers[layer_idx / 2];
                    chunk.iter().map(|p| self.curve_a.to_bytes(p)).collect()
                }
            })
            .collect();
        Ok(PathBytes {
            leaves: path.leaves.clone(),
            layer_chunks,
        })
    }

    pub fn path_bytes_to_path(&self, path_bytes: &PathBytes) -> Result<Path<A, B>, CurveTreesError> {
        let mut path = Path {
            leaves: path_bytes.leaves.clone(),
            ..Default::default()
        };
        for (layer_idx, chunk) in path_bytes.layer_chunks.iter().enumerate() {
            if layer_idx % 2 == 0 {
                let points = chunk
                    .iter()
                    .map(|bytes| self.curve_b.from_bytes(bytes))
                    .collect::<Result<_, _>>()?;
                path.b_layers.push(points);
            } else {
                let points = chunk
                    .iter()
                    .map(|bytes| self.curve_a.from_bytes(bytes))
                    .collect::<Result<_, _>>()?;
                path.a_layers.push(points);
            }
        }
        Ok(path)
    }

    /// Hashes every chunk of `path` below the top layer.
    pub fn calc_hashes_from_path(
        &self,
        path: &Path<A, B>,
    ) -> Result<PathHashes<A, B>, CurveTreesError> {
        if path.leaves.is_empty() {
            return Err(CurveTreesError::InvalidInput {
                message: "path has no leaves",
            });
        }
        path.check_shape()?;

        let leaf_tuples = path
            .leaves
            .iter()
            .map(|output| self.leaf_tuple(output))
            .collect::<Result<Vec<_>, _>>()?;
        let leaf_scalars = self.flatten_leaves(&leaf_tuples);

        let mut hashes = PathHashes {
            a_hashes: vec![],
            b_hashes: vec![chunk_hash(&self.curve_b, &leaf_scalars)?],
        };

        for layer_idx in 0..path.n_layers().saturating_sub(1) {
            if layer_idx % 2 == 0 {
                let children: Vec<_> = path.b_layers[layer_idx / 2]
                    .iter()
                    .map(|p| self.curve_b.point_to_cycle_scalar(p))
                    .collect();
                hashes.a_hashes.push(chunk_hash(&self.curve_a, &children)?);
            } else {
                let children: Vec<_> = path.a_layers[layer_idx / 2]
                    .iter()
                    .map(|p| self.curve_a.point_to_cycle_scalar(p))
                    .collect();
                hashes.b_hashes.push(chunk_hash(&self.curve_b, &children)?);
            }
        }

        Ok(hashes)
    }

    /// Checks that `path` proves membership of `output` in a tree of
    /// `n_leaf_tuples` leaves. Any mismatch yields `false`.
    pub fn audit_path(&self, path: &Path<A, B>, output: &OutputPair, n_leaf_tuples: u64) -> bool {
        let n_layers = self.n_layers(n_leaf_tuples);
        if n_layers == 0
            || path.b_layers.len() != n_layers.div_ceil(2)
            || path.a_layers.len() != n_layers / 2
        {
            return false;
        }
        if path.leaves.len() > self.b_chunk_width() {
            return false;
        }
        // Outputs are equal in the tree when their leaf tuples are
        let Ok(output_tuple) = self.leaf_tuple(output) else {
            return false;
        };
        let in_leaves = path
            .leaves
            .iter()
            .any(|leaf| self.leaf_tuple(leaf).is_ok_and(|tuple| tuple == output_tuple));
        if !in_leaves {
            return false;
        }
        let Ok(hashes) = self.calc_hashes_from_path(path) else {
            return false;
        };

        for layer_idx in 0..n_layers {
            let found = if layer_idx % 2 == 0 {
                let hash = &hashes.b_hashes[layer_idx / 2];
                path.b_layers[layer_idx / 2].contains(hash)
            } else {
                let hash = &hashes.a_hashes[layer_idx / 2];
                path.a_layers[layer_idx / 2].contains(hash)
            };
            if !found {
                return false;
            }
        }

        top_chunk_len(path, n_layers - 1) == 1
    }

    /// The last hash of every layer, read off the path of the last leaf.
    pub fn tree_edge_to_last_hashes(&self, path: &Path<A, B>) -> LastHashes<A, B> {
        LastHashes {
            a_last_hashes: path.a_layers.iter().filter_map(|c| c.last().copied()).collect(),
            b_last_hashes: path.b_layers.iter().filter_map(|c| c.last().copied()).collect(),
        }
    }
}

fn top_chunk_len<A: Curve, B: Curve>(path: &Path<A, B>, top_layer: LayerIdx) -> usize {
    if top_layer % 2 == 0 {
        path.b_layers[top_layer / 2].len()
    } else {
        path.a_layers[top_layer / 2].len()
    }
}

fn chunk_hash<C: Curve>(curve: &C, children: &[C::Scalar]) -> Result<C::Point, CurveTreesError> {
    if children.is_empty() {
        return Err(CurveTreesError::InvalidInput {
            message: "path has an empty chunk",
        });
    }
    Ok(curve.hash_grow(&curve.hash_init_point(), 0, &curve.zero_scalar(), children)?)
}
