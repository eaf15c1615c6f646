//! Tree extension: appending outputs to a tree.
//!
//! Growing never needs more than the last hash of every layer. The first
//! chunk touched in each layer is either topped off with [`Curve::hash_grow`]
//! starting from the old last parent, or started from scratch; every later
//! chunk is new. New chunks are hashed in parallel.

use crate::{
    constant::LEAF_TUPLE_SIZE,
    curve_trees::{
        instructions::{get_grow_layer_instructions, get_leaf_layer_grow_instructions},
        CurveTrees, GrowLayerInstructions, LastHashes, LayerExtension, Leaves, TreeExtension,
    },
    types::{CurveTreesError, LayerIdx, OutputContext},
};
use tower_cycle::Curve;
use tracing::trace;

impl<A, B> CurveTrees<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    /// Computes the hashes that change when `new_outputs` are appended to a
    /// tree of `old_n_leaf_tuples` leaves whose last hashes are
    /// `existing_last_hashes`.
    ///
    /// Outputs are inserted in `output_id` order. Outputs that cannot be
    /// converted into leaves are dropped and do not appear in
    /// `leaves.tuples`.
    pub fn get_tree_extension(
        &self,
        old_n_leaf_tuples: u64,
        existing_last_hashes: &LastHashes<A, B>,
        mut new_outputs: Vec<OutputContext>,
    ) -> Result<TreeExtension<A, B>, CurveTreesError> {
        let mut tree_extension = TreeExtension {
            leaves: Leaves {
                start_leaf_tuple_idx: old_n_leaf_tuples,
                tuples: vec![],
            },
            a_layer_extensions: vec![],
            b_layer_extensions: vec![],
        };
        if new_outputs.is_empty() {
            return Ok(tree_extension);
        }
        if existing_last_hashes.n_layers() != self.n_layers(old_n_leaf_tuples) {
            return Err(CurveTreesError::InvalidInput {
                message: "last hashes do not match the tree size",
            });
        }

        new_outputs.sort_by_key(|output| output.output_id);
        let (flattened_leaves, valid_outputs) = self.set_valid_leaves(new_outputs);
        if valid_outputs.is_empty() {
            return Ok(tree_extension);
        }
        let new_n_leaf_tuples = old_n_leaf_tuples + valid_outputs.len() as u64;
        tree_extension.leaves.tuples = valid_outputs;

        // The leaf layer is hashed by curve B into hash layer 0.
        let mut instructions = get_leaf_layer_grow_instructions(
            old_n_leaf_tuples,
            new_n_leaf_tuples,
            LEAF_TUPLE_SIZE,
            self.leaf_layer_chunk_width(),
        )?;
        let old_last_parent = if instructions.need_old_last_parent {
            Some(
                existing_last_hashes
                    .b_last_hashes
                    .first()
                    .ok_or(CurveTreesError::MissingLastHash { layer_idx: 0 })?,
            )
        } else {
            None
        };
        let leaf_parents = self.hash_children_chunks(
            &self.curve_b,
            None,
            old_last_parent,
            instructions.start_offset,
            instructions.next_parent_start_index,
            &flattened_leaves,
            self.leaf_layer_chunk_width(),
        )?;
        trace!(
            start_idx = leaf_parents.start_idx,
            n_hashes = leaf_parents.hashes.len(),
            "hashed leaf chunks"
        );
        tree_extension.b_layer_extensions.push(leaf_parents);

        let mut parent_is_b = false;
        let mut layer_idx: LayerIdx = 1;
        while instructions.new_total_parents > 1 {
            let parent_chunk_width = if parent_is_b {
                self.b_chunk_width()
            } else {
                self.a_chunk_width()
            };
            instructions = get_grow_layer_instructions(
                instructions.old_total_parents,
                instructions.new_total_parents,
                parent_chunk_width,
                instructions.need_old_last_parent,
            )?;

            let missing_child = CurveTreesError::InvalidInstructions {
                message: "child layer was not extended",
            };
            if parent_is_b {
                let child_extension = tree_extension
                    .a_layer_extensions
                    .last()
                    .ok_or(missing_child)?;
                let extension = self.grow_layer(
                    &self.curve_a,
                    &self.curve_b,
                    &existing_last_hashes.a_last_hashes,
                    &existing_last_hashes.b_last_hashes,
                    layer_idx,
                    &instructions,
                    child_extension,
                )?;
                tree_extension.b_layer_extensions.push(extension);
            } else {
                let child_extension = tree_extension
                    .b_layer_extensions
                    .last()
                    .ok_or(missing_child)?;
                let extension = self.grow_layer(
                    &self.curve_b,
                    &self.curve_a,
                    &existing_last_hashes.b_last_hashes,
                    &existing_last_hashes.a_last_hashes,
                    layer_idx,
                    &instructions,
                    child_extension,
                )?;
                tree_extension.a_layer_extensions.push(extension);
            }

            parent_is_b = !parent_is_b;
            layer_idx += 1;
        }

        Ok(tree_extension)
    }

    /// Extends hash layer `layer_idx`, whose children are the (just extended)
    /// elements of layer `layer_idx - 1` on the other curve.
    #[allow(clippy::too_many_arguments)]
    fn grow_layer<C, P>(
        &self,
        child_curve: &C,
        parent_curve: &P,
        child_last_hashes: &[C::Point],
        parent_last_hashes: &[P::Point],
        layer_idx: LayerIdx,
        instructions: &GrowLayerInstructions,
        child_extension: &LayerExtension<C>,
    ) -> Result<LayerExtension<P>, CurveTreesError>
    where
        C: Curve<CycleScalar = <P as Curve>::Scalar>,
        P: Curve,
    {
        let child_layer_idx = layer_idx - 1;
        let old_last_child_hash = child_last_hashes.get(child_layer_idx / 2);
        let missing_child_hash = CurveTreesError::MissingLastHash {
            layer_idx: child_layer_idx,
        };

        let old_last_child = if instructions.need_old_last_child {
            let hash = old_last_child_hash.ok_or(missing_child_hash.clone())?;
            Some(child_curve.point_to_cycle_scalar(hash))
        } else {
            None
        };
        let old_last_parent = if instructions.need_old_last_parent {
            Some(
                parent_last_hashes
                    .get(layer_idx / 2)
                    .ok_or(CurveTreesError::MissingLastHash { layer_idx })?,
            )
        } else {
            None
        };

        let mut new_children = Vec::with_capacity(child_extension.hashes.len() + 1);
        // The old root becomes the first child of the new layer above it,
        // unless the extension already rewrites it.
        if instructions.setting_next_layer_after_old_root && child_extension.start_idx > 0 {
            let old_root = old_last_child_hash.ok_or(missing_child_hash)?;
            new_children.push(child_curve.point_to_cycle_scalar(old_root));
        }
        new_children.extend(self.par_map(&child_extension.hashes, |hash| {
            child_curve.point_to_cycle_scalar(hash)
        }));

        let extension = self.hash_children_chunks(
            parent_curve,
            old_last_child.as_ref(),
            old_last_parent,
            instructions.start_offset,
            instructions.next_parent_start_index,
            &new_children,
            instructions.parent_chunk_width,
        )?;
        trace!(
            layer_idx,
            curve = P::NAME,
            start_idx = extension.start_idx,
            n_hashes = extension.hashes.len(),
            "extended layer"
        );
        Ok(extension)
    }

    /// Hashes `new_child_scalars` into parent chunks of `chunk_width`.
    ///
    /// The first chunk continues the existing last chunk at `start_offset`
    /// when `old_last_parent` is given; `old_last_child` is the value being
    /// replaced at `start_offset`, if any.
    #[allow(clippy::too_many_arguments)]
    pub fn hash_children_chunks<C: Curve>(
        &self,
        curve: &C,
        old_last_child: Option<&C::Scalar>,
        old_last_parent: Option<&C::Point>,
        start_offset: usize,
        next_parent_start_index: u64,
        new_child_scalars: &[C::Scalar],
        chunk_width: usize,
    ) -> Result<LayerExtension<C>, CurveTreesError> {
        if new_child_scalars.is_empty() {
            return Err(CurveTreesError::InvalidInput {
                message: "no children to hash",
            });
        }
        if start_offset >= chunk_width {
            return Err(CurveTreesError::InvalidInstructions {
                message: "start offset is outside the chunk",
            });
        }

        let zero = curve.zero_scalar();
        let first_chunk_size = new_child_scalars.len().min(chunk_width - start_offset);
        let (first_chunk, rest) = new_child_scalars.split_at(first_chunk_size);

        let first_hash = match old_last_parent {
            Some(last_parent) => curve.hash_grow(
                last_parent,
                start_offset,
                old_last_child.unwrap_or(&zero),
                first_chunk,
            )?,
            None => curve.hash_grow(&curve.hash_init_point(), start_offset, &zero, first_chunk)?,
        };

        let init = curve.hash_init_point();
        let chunks: Vec<&[C::Scalar]> = rest.chunks(chunk_width).collect();
        let rest_hashes = self.par_map(&chunks, |chunk| curve.hash_grow(&init, 0, &zero, chunk));

        let mut hashes = Vec::with_capacity(1 + rest_hashes.len());
        hashes.push(first_hash);
        for hash in rest_hashes {
            hashes.push(hash?);
        }

        Ok(LayerExtension {
            start_idx: next_parent_start_index,
            update_existing_last_hash: old_last_parent.is_some(),
            hashes,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{constant::LEAF_TUPLE_SIZE, curve_trees::test_utils::*};
    use rand::{rngs::StdRng, SeedableRng};

    /// Growing in one batch and growing output by output reach the same root.
    #[test]
    fn batch_and_incremental_growth_agree() {
        let curve_trees = test_curve_trees(3, 2);
        let mut rng = StdRng::seed_from_u64(11);
        let outputs = random_outputs(&mut rng, 0, 23);

        let mut one_batch = FullTree::new(&curve_trees);
        one_batch.grow(outputs.clone()).unwrap();

        let mut one_by_one = FullTree::new(&curve_trees);
        for output in outputs {
            one_by_one.grow(vec![output]).unwrap();
            one_by_one.assert_matches_from_scratch();
        }

        assert_eq!(one_batch.root_bytes(), one_by_one.root_bytes());
        one_batch.assert_matches_from_scratch();
    }

    /// Leaf counts around the point where the leaf chunk, the first hash
    /// layer chunk and the second hash layer chunk fill up, grown in several
    /// splits.
    #[test]
    fn chunk_width_boundaries() {
        let (a_width, b_width) = (3usize, 2usize);
        let curve_trees = test_curve_trees(a_width, b_width);
        let mut rng = StdRng::seed_from_u64(12);

        // leaf tuples held by one full leaf chunk
        let leaf_chunk = (curve_trees.leaf_layer_chunk_width() / LEAF_TUPLE_SIZE) as u64;
        assert_eq!(leaf_chunk, b_width as u64);
        let boundaries = [
            leaf_chunk,
            leaf_chunk * a_width as u64,
            leaf_chunk * (a_width * b_width) as u64,
        ];
        for n in boundaries.into_iter().flat_map(|w| [w - 1, w, w + 1]) {
            let outputs = random_outputs(&mut rng, 0, n as usize);
            let mut reference = FullTree::new(&curve_trees);
            reference.grow(outputs.clone()).unwrap();
            reference.assert_matches_from_scratch();

            for split in [1, n / 3, n - 1] {
                let mut tree = FullTree::new(&curve_trees);
                tree.grow(outputs[..split as usize].to_vec()).unwrap();
                tree.grow(outputs[split as usize..].to_vec()).unwrap();
                assert_eq!(tree.root_bytes(), reference.root_bytes(), "n={n} split={split}");
            }
        }
    }

    /// Outputs are inserted by id, whatever order they arrive in.
    #[test]
    fn outputs_are_sorted_by_id() {
        let curve_trees = test_curve_trees(3, 2);
        let mut rng = StdRng::seed_from_u64(13);
        let outputs = random_outputs(&mut rng, 0, 5);

        let mut sorted = FullTree::new(&curve_trees);
        sorted.grow(outputs.clone()).unwrap();

        let mut reversed = FullTree::new(&curve_trees);
        reversed.grow(outputs.into_iter().rev().collect()).unwrap();
        assert_eq!(sorted.root_bytes(), reversed.root_bytes());
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let curve_trees = test_curve_trees(3, 2);
        let extension = curve_trees
            .get_tree_extension(0, &Default::default(), vec![])
            .unwrap();
        assert!(extension.leaves.tuples.is_empty());
        assert_eq!(extension.n_layers(), 0);
    }
}
