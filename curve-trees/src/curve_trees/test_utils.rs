//! Test utilities for the curve-tree algorithms.
//!
//! [`FullTree`] keeps every layer of a tree in memory. It grows and trims
//! through the incremental algorithms under test and can recompute all of its
//! layers from the leaves, which makes it the reference the tree cache is
//! checked against.

use crate::{
    config::CurveTreesConfig,
    curve_trees::{
        LastHashes, LayerExtension, Path, PastaCurveTrees, TreeExtension, TreeReader,
    },
    types::{CurveTreesError, LayerIdx, LeafIdx, OutputContext, OutputPair},
};
use curve25519_dalek::{
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
};
use rand::{rngs::StdRng, Rng};
use tower_cycle::{Curve, Pallas, Vesta};

type PointA = <Vesta as Curve>::Point;
type PointB = <Pallas as Curve>::Point;

/// Curve trees with narrow chunks, so that small trees already have several
/// layers.
pub(crate) fn test_curve_trees(a_chunk_width: usize, b_chunk_width: usize) -> PastaCurveTrees {
    PastaCurveTrees::from_config(&CurveTreesConfig {
        a_chunk_width,
        b_chunk_width,
        ..Default::default()
    })
    .unwrap()
}

/// A random prime-order ed25519 point, compressed.
pub(crate) fn random_point(rng: &mut StdRng) -> [u8; 32] {
    let scalar = Scalar::from_bytes_mod_order(rng.gen());
    EdwardsPoint::mul_base(&scalar).compress().to_bytes()
}

pub(crate) fn random_output_pair(rng: &mut StdRng) -> OutputPair {
    OutputPair {
        output_pubkey: random_point(rng),
        commitment: random_point(rng),
    }
}

/// `n` valid outputs with consecutive ids starting at `first_output_id`.
pub(crate) fn random_outputs(
    rng: &mut StdRng,
    first_output_id: u64,
    n: usize,
) -> Vec<OutputContext> {
    (0..n as u64)
        .map(|i| OutputContext {
            output_id: first_output_id + i,
            torsion_checked: false,
            output_pair: random_output_pair(rng),
        })
        .collect()
}

/// A distinct, non-zero hash for every block index.
pub(crate) fn block_hash(block_idx: u64) -> [u8; 32] {
    let mut hash = [0xabu8; 32];
    hash[..8].copy_from_slice(&block_idx.to_le_bytes());
    hash
}

/// The point `(0, -1)` of order 2.
pub(crate) fn small_order_point() -> EdwardsPoint {
    let mut bytes = [0xffu8; 32];
    bytes[0] = 0xec;
    bytes[31] = 0x7f;
    CompressedEdwardsY(bytes).decompress().unwrap()
}

/// Every layer of a tree, kept in memory.
#[derive(Debug)]
pub(crate) struct FullTree<'a> {
    curve_trees: &'a PastaCurveTrees,
    pub leaves: Vec<OutputPair>,
    pub a_layers: Vec<Vec<PointA>>,
    pub b_layers: Vec<Vec<PointB>>,
}

impl<'a> FullTree<'a> {
    pub fn new(curve_trees: &'a PastaCurveTrees) -> Self {
        Self {
            curve_trees,
            leaves: vec![],
            a_layers: vec![],
            b_layers: vec![],
        }
    }

    pub fn n_leaf_tuples(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn last_hashes(&self) -> LastHashes<Vesta, Pallas> {
        LastHashes {
            a_last_hashes: self.a_layers.iter().filter_map(|l| l.last().copied()).collect(),
            b_last_hashes: self.b_layers.iter().filter_map(|l| l.last().copied()).collect(),
        }
    }

    /// Appends `outputs` through [`crate::curve_trees::CurveTrees::get_tree_extension`].
    pub fn grow(
        &mut self,
        outputs: Vec<OutputContext>,
    ) -> Result<TreeExtension<Vesta, Pallas>, CurveTreesError> {
        let extension = self.curve_trees.get_tree_extension(
            self.n_leaf_tuples(),
            &self.last_hashes(),
            outputs,
        )?;
        self.apply_extension(&extension);
        Ok(extension)
    }

    pub fn apply_extension(&mut self, extension: &TreeExtension<Vesta, Pallas>) {
        assert_eq!(extension.leaves.start_leaf_tuple_idx, self.n_leaf_tuples());
        self.leaves
            .extend(extension.leaves.tuples.iter().map(|o| o.output_pair));

        fn apply<C: Curve>(layers: &mut Vec<Vec<C::Point>>, idx: usize, ext: &LayerExtension<C>) {
            if layers.len() == idx {
                layers.push(vec![]);
            }
            let layer = &mut layers[idx];
            assert!(ext.start_idx as usize <= layer.len());
            assert_eq!(
                ext.update_existing_last_hash,
                (ext.start_idx as usize) < layer.len()
            );
            layer.truncate(ext.start_idx as usize);
            layer.extend(ext.hashes.iter().copied());
        }

        for (i, ext) in extension.b_layer_extensions.iter().enumerate() {
            apply(&mut self.b_layers, i, ext);
        }
        for (i, ext) in extension.a_layer_extensions.iter().enumerate() {
            apply(&mut self.a_layers, i, ext);
        }
    }

    /// Removes the last `trim_n_leaf_tuples` leaves through
    /// [`crate::curve_trees::CurveTrees::get_tree_reduction`].
    pub fn trim(
        &mut self,
        trim_n_leaf_tuples: u64,
        always_regrow_with_remaining: bool,
    ) -> Result<(), CurveTreesError> {
        let instructions = self.curve_trees.get_trim_instructions(
            self.n_leaf_tuples(),
            trim_n_leaf_tuples,
            always_regrow_with_remaining,
        )?;
        let children = self
            .curve_trees
            .get_last_chunk_children_to_trim(&*self, &instructions)?;
        let last_hashes = self
            .curve_trees
            .get_last_hashes_to_trim(&*self, &instructions)?;
        let reduction = self
            .curve_trees
            .get_tree_reduction(&instructions, &children, &last_hashes)?;

        self.leaves
            .truncate(reduction.new_total_leaf_tuples as usize);
        self.b_layers.truncate(reduction.b_layer_reductions.len());
        self.a_layers.truncate(reduction.a_layer_reductions.len());
        for (layer, r) in self.b_layers.iter_mut().zip(&reduction.b_layer_reductions) {
            layer.truncate(r.new_total_parents as usize);
            if let Some(last) = layer.last_mut() {
                *last = r.new_last_hash;
            }
        }
        for (layer, r) in self.a_layers.iter_mut().zip(&reduction.a_layer_reductions) {
            layer.truncate(r.new_total_parents as usize);
            if let Some(last) = layer.last_mut() {
                *last = r.new_last_hash;
            }
        }
        Ok(())
    }

    /// Recomputes every layer from the leaves.
    pub fn layers_from_scratch(&self) -> (Vec<Vec<PointA>>, Vec<Vec<PointB>>) {
        let (mut a_layers, mut b_layers) = (vec![], vec![]);
        if self.leaves.is_empty() {
            return (a_layers, b_layers);
        }

        let curve_a = &self.curve_trees.curve_a;
        let curve_b = &self.curve_trees.curve_b;
        let tuples: Vec<_> = self
            .leaves
            .iter()
            .map(|o| self.curve_trees.leaf_tuple(o).unwrap())
            .collect();
        let scalars = self.curve_trees.flatten_leaves(&tuples);
        b_layers.push(hash_chunks(
            curve_b,
            &scalars,
            self.curve_trees.leaf_layer_chunk_width(),
        ));

        let mut layer_idx: LayerIdx = 0;
        loop {
            let width = self.curve_trees.layer_chunk_width(layer_idx);
            if layer_idx % 2 == 0 {
                let below = &b_layers[layer_idx / 2];
                if below.len() == 1 {
                    break;
                }
                let children: Vec<_> =
                    below.iter().map(|p| curve_b.point_to_cycle_scalar(p)).collect();
                a_layers.push(hash_chunks(curve_a, &children, width));
            } else {
                let below = &a_layers[layer_idx / 2];
                if below.len() == 1 {
                    break;
                }
                let children: Vec<_> =
                    below.iter().map(|p| curve_a.point_to_cycle_scalar(p)).collect();
                b_layers.push(hash_chunks(curve_b, &children, width));
            }
            layer_idx += 1;
        }
        (a_layers, b_layers)
    }

    pub fn assert_matches_from_scratch(&self) {
        let (a_layers, b_layers) = self.layers_from_scratch();
        assert_eq!(a_layers, self.a_layers, "A layers diverge from scratch");
        assert_eq!(b_layers, self.b_layers, "B layers diverge from scratch");
        assert_eq!(
            self.a_layers.len() + self.b_layers.len(),
            self.curve_trees.n_layers(self.n_leaf_tuples())
        );
    }

    /// Compressed root, `None` for an empty tree.
    pub fn root_bytes(&self) -> Option<[u8; 32]> {
        let n_layers = self.a_layers.len() + self.b_layers.len();
        if n_layers == 0 {
            return None;
        }
        let top = n_layers - 1;
        Some(if top % 2 == 0 {
            self.curve_trees.curve_b.to_bytes(&self.b_layers[top / 2][0])
        } else {
            self.curve_trees.curve_a.to_bytes(&self.a_layers[top / 2][0])
        })
    }

    pub fn get_path(&self, leaf_idx: LeafIdx) -> Path<Vesta, Pallas> {
        let indexes = self
            .curve_trees
            .get_path_indexes(self.n_leaf_tuples(), leaf_idx)
            .unwrap();
        let range = |r: &std::ops::Range<u64>| r.start as usize..r.end as usize;

        let mut path = Path {
            leaves: self.leaves[range(&indexes.leaf_range)].to_vec(),
            ..Default::default()
        };
        for (layer_idx, r) in indexes.layers.iter().enumerate() {
            if layer_idx % 2 == 0 {
                path.b_layers
                    .push(self.b_layers[layer_idx / 2][range(r)].to_vec());
            } else {
                path.a_layers
                    .push(self.a_layers[layer_idx / 2][range(r)].to_vec());
            }
        }
        path
    }
}

fn hash_chunks<C: Curve>(curve: &C, children: &[C::Scalar], width: usize) -> Vec<C::Point> {
    children
        .chunks(width)
        .map(|chunk| {
            curve
                .hash_grow(&curve.hash_init_point(), 0, &curve.zero_scalar(), chunk)
                .unwrap()
        })
        .collect()
}

impl TreeReader<Vesta, Pallas> for FullTree<'_> {
    type Error = CurveTreesError;

    fn leaf(&self, leaf_idx: LeafIdx) -> Result<OutputPair, Self::Error> {
        self.leaves
            .get(leaf_idx as usize)
            .copied()
            .ok_or(CurveTreesError::InvalidInput {
                message: "no such leaf",
            })
    }

    fn a_elem(&self, layer_idx: LayerIdx, elem_idx: u64) -> Result<PointA, Self::Error> {
        self.a_layers
            .get(layer_idx / 2)
            .and_then(|l| l.get(elem_idx as usize))
            .copied()
            .ok_or(CurveTreesError::InvalidInput {
                message: "no such element",
            })
    }

    fn b_elem(&self, layer_idx: LayerIdx, elem_idx: u64) -> Result<PointB, Self::Error> {
        self.b_layers
            .get(layer_idx / 2)
            .and_then(|l| l.get(elem_idx as usize))
            .copied()
            .ok_or(CurveTreesError::InvalidInput {
                message: "no such element",
            })
    }
}
