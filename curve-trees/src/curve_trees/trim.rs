//! Tree reduction: removing outputs from the end of a tree.
//!
//! A reduction is computed in three steps:
//! 1. [`CurveTrees::get_trim_instructions`] says, per layer, which children of
//!    the new last chunk are needed;
//! 2. [`CurveTrees::get_last_chunk_children_to_trim`] and
//!    [`CurveTrees::get_last_hashes_to_trim`] read them from a [`TreeReader`];
//! 3. [`CurveTrees::get_tree_reduction`] hashes the new last chunk of every
//!    layer, feeding each new last hash into the layer above.

use crate::{
    constant::LEAF_TUPLE_SIZE,
    curve_trees::{
        CurveTrees, LastChunkChildrenToTrim, LastHashes, LayerReduction, TreeReader,
        TreeReduction, TrimLayerInstructions,
    },
    types::{CurveTreesError, LayerIdx},
};
use tower_cycle::Curve;
use tracing::trace;

impl<A, B> CurveTrees<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    /// Reads the children each layer's trim (or regrow) consumes.
    ///
    /// Children are read from the tree as it is *before* the trim.
    pub fn get_last_chunk_children_to_trim<R: TreeReader<A, B>>(
        &self,
        reader: &R,
        trim_instructions: &[TrimLayerInstructions],
    ) -> Result<LastChunkChildrenToTrim<A, B>, R::Error> {
        let mut children = LastChunkChildrenToTrim::default();

        for (layer_idx, instructions) in trim_instructions.iter().enumerate() {
            let range = instructions.start_trim_idx..instructions.end_trim_idx;
            if layer_idx == 0 {
                // Leaf ranges are whole tuples: the leaf chunk width is a
                // multiple of the tuple size and leaves never change.
                let tuple_size = LEAF_TUPLE_SIZE as u64;
                let mut leaf_tuples = Vec::with_capacity(range.clone().count() / LEAF_TUPLE_SIZE);
                for leaf_idx in range.start / tuple_size..range.end / tuple_size {
                    let output = reader.leaf(leaf_idx)?;
                    leaf_tuples.push(
                        self.leaf_tuple(&output)
                            .map_err(CurveTreesError::from)?,
                    );
                }
                children.b_children.push(self.flatten_leaves(&leaf_tuples));
            } else if layer_idx % 2 == 1 {
                // children of an A layer are B points
                let mut scalars = Vec::with_capacity(range.clone().count());
                for idx in range {
                    let point = reader.b_elem(layer_idx - 1, idx)?;
                    scalars.push(self.curve_b.point_to_cycle_scalar(&point));
                }
                children.a_children.push(scalars);
            } else {
                let mut scalars = Vec::with_capacity(range.clone().count());
                for idx in range {
                    let point = reader.a_elem(layer_idx - 1, idx)?;
                    scalars.push(self.curve_a.point_to_cycle_scalar(&point));
                }
                children.b_children.push(scalars);
            }
        }

        Ok(children)
    }

    /// Reads the current hash at the position of every layer's new last
    /// element.
    pub fn get_last_hashes_to_trim<R: TreeReader<A, B>>(
        &self,
        reader: &R,
        trim_instructions: &[TrimLayerInstructions],
    ) -> Result<LastHashes<A, B>, R::Error> {
        let mut last_hashes = LastHashes::default();
        for (layer_idx, instructions) in trim_instructions.iter().enumerate() {
            let idx = instructions.new_total_parents - 1;
            if layer_idx % 2 == 0 {
                last_hashes.b_last_hashes.push(reader.b_elem(layer_idx, idx)?);
            } else {
                last_hashes.a_last_hashes.push(reader.a_elem(layer_idx, idx)?);
            }
        }
        Ok(last_hashes)
    }

    /// Computes the new last hash of every layer.
    ///
    /// `existing_last_hashes` are the hashes at each layer's new last
    /// position before the trim, as returned by
    /// [`CurveTrees::get_last_hashes_to_trim`].
    pub fn get_tree_reduction(
        &self,
        trim_instructions: &[TrimLayerInstructions],
        children_to_trim: &LastChunkChildrenToTrim<A, B>,
        existing_last_hashes: &LastHashes<A, B>,
    ) -> Result<TreeReduction<A, B>, CurveTreesError> {
        let mut tree_reduction = TreeReduction {
            new_total_leaf_tuples: 0,
            a_layer_reductions: vec![],
            b_layer_reductions: vec![],
        };
        let Some(leaf_instructions) = trim_instructions.first() else {
            // every leaf was removed
            return Ok(tree_reduction);
        };
        tree_reduction.new_total_leaf_tuples =
            leaf_instructions.new_total_children / LEAF_TUPLE_SIZE as u64;

        for (layer_idx, instructions) in trim_instructions.iter().enumerate() {
            if layer_idx % 2 == 0 {
                let new_last_child = match tree_reduction.a_layer_reductions.last() {
                    Some(child) if layer_idx > 0 => {
                        Some(self.curve_a.point_to_cycle_scalar(&child.new_last_hash))
                    }
                    _ => None,
                };
                let reduction = trim_layer(
                    &self.curve_b,
                    layer_idx,
                    instructions,
                    children_to_trim.b_children.get(layer_idx / 2),
                    existing_last_hashes.b_last_hashes.get(layer_idx / 2),
                    new_last_child,
                )?;
                tree_reduction.b_layer_reductions.push(reduction);
            } else {
                let new_last_child = tree_reduction
                    .b_layer_reductions
                    .last()
                    .map(|child| self.curve_b.point_to_cycle_scalar(&child.new_last_hash));
                let reduction = trim_layer(
                    &self.curve_a,
                    layer_idx,
                    instructions,
                    children_to_trim.a_children.get(layer_idx / 2),
                    existing_last_hashes.a_last_hashes.get(layer_idx / 2),
                    new_last_child,
                )?;
                tree_reduction.a_layer_reductions.push(reduction);
            }
        }

        Ok(tree_reduction)
    }
}

/// Computes the new last hash of one layer.
fn trim_layer<C: Curve>(
    curve: &C,
    layer_idx: LayerIdx,
    instructions: &TrimLayerInstructions,
    children: Option<&Vec<C::Scalar>>,
    existing_last_hash: Option<&C::Point>,
    new_last_child: Option<C::Scalar>,
) -> Result<LayerReduction<C>, CurveTreesError> {
    let children = children.ok_or(CurveTreesError::InvalidInput {
        message: "missing children to trim",
    })?;
    let existing_last_hash =
        existing_last_hash.ok_or(CurveTreesError::MissingLastHash { layer_idx })?;
    let expected_children = (instructions.end_trim_idx - instructions.start_trim_idx) as usize;
    if children.len() != expected_children {
        return Err(CurveTreesError::InvalidInput {
            message: "children to trim do not match the instructions",
        });
    }

    let zero = curve.zero_scalar();
    let new_last_child = if instructions.need_new_last_child {
        Some(new_last_child.ok_or(CurveTreesError::InvalidInstructions {
            message: "last child changes but no new value is known",
        })?)
    } else {
        None
    };

    let new_last_hash = if !instructions.update_existing_last_hash {
        *existing_last_hash
    } else if instructions.need_last_chunk_remaining_children {
        let mut remaining = children.clone();
        remaining.extend(new_last_child);
        curve.hash_grow(&curve.hash_init_point(), 0, &zero, &remaining)?
    } else {
        curve.hash_trim(
            existing_last_hash,
            instructions.hash_offset,
            children,
            new_last_child.as_ref().unwrap_or(&zero),
        )?
    };

    trace!(
        layer_idx,
        curve = C::NAME,
        new_total_parents = instructions.new_total_parents,
        regrow = instructions.need_last_chunk_remaining_children,
        "trimmed layer"
    );

    Ok(LayerReduction {
        new_total_parents: instructions.new_total_parents,
        update_existing_last_hash: instructions.update_existing_last_hash,
        new_last_hash,
    })
}
