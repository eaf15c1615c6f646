//! Per-layer instructions for growing and trimming a tree.
//!
//! Instructions are pure functions of element counts and chunk widths: they
//! say which existing hashes and children an update needs, and at which
//! offset the first touched chunk must be hashed.

use crate::{constant::LEAF_TUPLE_SIZE, curve_trees::CurveTrees, types::CurveTreesError};
use tower_cycle::Curve;

/// How to extend one layer of parents when its children grow from
/// `old_total_children` to `new_total_children`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GrowLayerInstructions {
    pub parent_chunk_width: usize,
    pub old_total_children: u64,
    pub new_total_children: u64,
    pub old_total_parents: u64,
    pub new_total_parents: u64,
    /// The old layer was the root; its single element becomes the first child
    /// of a new layer.
    pub setting_next_layer_after_old_root: bool,
    /// The old last child is overwritten, so its old value must be subtracted.
    pub need_old_last_child: bool,
    /// The old last parent is updated in place rather than created.
    pub need_old_last_parent: bool,
    /// Position in the first touched chunk at which the new children start.
    pub start_offset: usize,
    pub next_parent_start_index: u64,
}

/// Grow instructions of a hash layer.
pub fn get_grow_layer_instructions(
    old_total_children: u64,
    new_total_children: u64,
    parent_chunk_width: usize,
    last_child_will_change: bool,
) -> Result<GrowLayerInstructions, CurveTreesError> {
    if new_total_children == 0 || new_total_children < old_total_children {
        return Err(CurveTreesError::InvalidInstructions {
            message: "a layer can only grow to a positive size",
        });
    }
    if parent_chunk_width == 0 {
        return Err(CurveTreesError::InvalidInstructions {
            message: "chunk width must be positive",
        });
    }

    let width = parent_chunk_width as u64;
    // A single child is the root: it has no parent yet.
    let old_total_parents = if old_total_children > 1 {
        1 + (old_total_children - 1) / width
    } else {
        0
    };
    let new_total_parents = 1 + (new_total_children - 1) / width;

    let setting_next_layer_after_old_root = old_total_children == 1;

    let need_old_last_child = old_total_parents > 0 && last_child_will_change;

    let mut start_offset = if old_total_parents > 0 {
        (old_total_children % width) as usize
    } else {
        0
    };
    if need_old_last_child {
        start_offset = if start_offset == 0 {
            parent_chunk_width - 1
        } else {
            start_offset - 1
        };
    }

    let need_old_last_parent = need_old_last_child
        || (old_total_parents > 0
            && old_total_children % width != 0
            && new_total_children > old_total_children);

    let next_parent_start_index = if need_old_last_parent {
        old_total_parents - 1
    } else {
        old_total_parents
    };

    Ok(GrowLayerInstructions {
        parent_chunk_width,
        old_total_children,
        new_total_children,
        old_total_parents,
        new_total_parents,
        setting_next_layer_after_old_root,
        need_old_last_child,
        need_old_last_parent,
        start_offset,
        next_parent_start_index,
    })
}

/// Grow instructions of the leaf layer. Children are counted in scalars; any
/// non-empty leaf layer has a parent, and existing leaves never change.
pub fn get_leaf_layer_grow_instructions(
    old_n_leaf_tuples: u64,
    new_n_leaf_tuples: u64,
    leaf_tuple_size: usize,
    leaf_layer_chunk_width: usize,
) -> Result<GrowLayerInstructions, CurveTreesError> {
    if new_n_leaf_tuples <= old_n_leaf_tuples {
        return Err(CurveTreesError::InvalidInstructions {
            message: "the leaf layer must grow",
        });
    }
    if leaf_layer_chunk_width == 0 || leaf_layer_chunk_width % leaf_tuple_size != 0 {
        return Err(CurveTreesError::InvalidInstructions {
            message: "leaf chunk width must be a positive multiple of the tuple size",
        });
    }

    let width = leaf_layer_chunk_width as u64;
    let old_total_children = old_n_leaf_tuples * leaf_tuple_size as u64;
    let new_total_children = new_n_leaf_tuples * leaf_tuple_size as u64;

    let old_total_parents = if old_total_children > 0 {
        1 + (old_total_children - 1) / width
    } else {
        0
    };
    let new_total_parents = 1 + (new_total_children - 1) / width;

    let start_offset = (old_total_children % width) as usize;
    let need_old_last_parent = start_offset > 0;
    let next_parent_start_index = if need_old_last_parent {
        old_total_parents - 1
    } else {
        old_total_parents
    };

    Ok(GrowLayerInstructions {
        parent_chunk_width: leaf_layer_chunk_width,
        old_total_children,
        new_total_children,
        old_total_parents,
        new_total_parents,
        setting_next_layer_after_old_root: false,
        need_old_last_child: false,
        need_old_last_parent,
        start_offset,
        next_parent_start_index,
    })
}

/// How to shrink one layer of parents when its children drop from
/// `old_total_children` to `new_total_children`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimLayerInstructions {
    pub parent_chunk_width: usize,
    pub old_total_children: u64,
    pub new_total_children: u64,
    pub old_total_parents: u64,
    pub new_total_parents: u64,
    /// The new last parent differs from the parent at the same index today.
    pub update_existing_last_hash: bool,
    /// Subtract the trimmed children from the existing hash.
    pub need_last_chunk_children_to_trim: bool,
    /// Rehash the new last chunk from the children that remain.
    pub need_last_chunk_remaining_children: bool,
    pub need_existing_last_hash: bool,
    /// The last child of the new last chunk is itself being replaced.
    pub need_new_last_child: bool,
    /// Chunk position passed to the hash function.
    pub hash_offset: usize,
    /// First child (inclusive) the trim or regrow needs.
    pub start_trim_idx: u64,
    /// Last child (exclusive) the trim or regrow needs.
    pub end_trim_idx: u64,
}

/// Trim instructions of one layer.
///
/// When fewer children are removed than remain in the new last chunk the
/// removed ones are subtracted from the existing hash; otherwise the chunk is
/// rehashed from the children that remain. `always_regrow_with_remaining`
/// forces the latter.
pub fn get_trim_layer_instructions(
    old_total_children: u64,
    new_total_children: u64,
    parent_chunk_width: usize,
    last_child_will_change: bool,
    always_regrow_with_remaining: bool,
) -> Result<TrimLayerInstructions, CurveTreesError> {
    if new_total_children == 0 {
        return Err(CurveTreesError::InvalidInstructions {
            message: "a layer cannot be trimmed to zero children",
        });
    }
    if old_total_children < new_total_children {
        return Err(CurveTreesError::InvalidInstructions {
            message: "trimming cannot add children",
        });
    }
    if parent_chunk_width == 0 {
        return Err(CurveTreesError::InvalidInstructions {
            message: "chunk width must be positive",
        });
    }

    let width = parent_chunk_width as u64;
    let old_total_parents = 1 + (old_total_children - 1) / width;
    let new_total_parents = 1 + (new_total_children - 1) / width;

    if new_total_children <= new_total_parents && new_total_children > 1 {
        return Err(CurveTreesError::InvalidInstructions {
            message: "a layer must have more children than parents",
        });
    }

    let new_offset = new_total_children % width;
    let old_offset = old_total_children % width;

    let new_last_chunk_old_num_children = if old_total_parents > new_total_parents || old_offset == 0
    {
        width
    } else {
        old_offset
    };

    let trim_n_children = if new_offset == 0 {
        0
    } else {
        new_last_chunk_old_num_children - new_offset
    };

    let need_last_chunk_remaining_children = trim_n_children > 0
        && (trim_n_children > new_offset || always_regrow_with_remaining);
    let need_last_chunk_children_to_trim =
        trim_n_children > 0 && !need_last_chunk_remaining_children;

    let update_existing_last_hash = trim_n_children > 0 || last_child_will_change;
    let need_existing_last_hash =
        update_existing_last_hash && !need_last_chunk_remaining_children;

    let chunk_start = (new_total_parents - 1) * width;
    let (hash_offset, start_trim_idx, end_trim_idx) = if need_last_chunk_children_to_trim {
        let hash_offset = new_offset - u64::from(last_child_will_change);
        let start = chunk_start + hash_offset;
        (hash_offset, start, (chunk_start + width).min(old_total_children))
    } else if need_last_chunk_remaining_children {
        let start = new_total_children - new_offset;
        let end = new_total_children - u64::from(last_child_will_change);
        (0, start, end)
    } else if last_child_will_change {
        let hash_offset = if new_offset == 0 { width - 1 } else { new_offset - 1 };
        let start = chunk_start + hash_offset;
        (hash_offset, start, start + 1)
    } else {
        (0, 0, 0)
    };

    Ok(TrimLayerInstructions {
        parent_chunk_width,
        old_total_children,
        new_total_children,
        old_total_parents,
        new_total_parents,
        update_existing_last_hash,
        need_last_chunk_children_to_trim,
        need_last_chunk_remaining_children,
        need_existing_last_hash,
        need_new_last_child: last_child_will_change,
        hash_offset: hash_offset as usize,
        start_trim_idx,
        end_trim_idx,
    })
}

/// Trim instructions of the leaf layer; counts are in scalars.
pub fn get_leaf_layer_trim_instructions(
    old_n_leaf_tuples: u64,
    new_n_leaf_tuples: u64,
    leaf_tuple_size: usize,
    leaf_layer_chunk_width: usize,
    always_regrow_with_remaining: bool,
) -> Result<TrimLayerInstructions, CurveTreesError> {
    let tuple_size = leaf_tuple_size as u64;
    get_trim_layer_instructions(
        old_n_leaf_tuples * tuple_size,
        new_n_leaf_tuples * tuple_size,
        leaf_layer_chunk_width,
        false,
        always_regrow_with_remaining,
    )
}

impl<A, B> CurveTrees<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    /// Trim instructions of every layer, bottom-up, for removing the last
    /// `trim_n_leaf_tuples` leaves. Removing every leaf yields no instructions.
    pub fn get_trim_instructions(
        &self,
        old_n_leaf_tuples: u64,
        trim_n_leaf_tuples: u64,
        always_regrow_with_remaining: bool,
    ) -> Result<Vec<TrimLayerInstructions>, CurveTreesError> {
        if trim_n_leaf_tuples == 0 || trim_n_leaf_tuples > old_n_leaf_tuples {
            return Err(CurveTreesError::InvalidInput {
                message: "must trim between 1 and all leaves",
            });
        }
        let new_n_leaf_tuples = old_n_leaf_tuples - trim_n_leaf_tuples;
        if new_n_leaf_tuples == 0 {
            return Ok(vec![]);
        }

        let mut instructions = vec![get_leaf_layer_trim_instructions(
            old_n_leaf_tuples,
            new_n_leaf_tuples,
            LEAF_TUPLE_SIZE,
            self.leaf_layer_chunk_width(),
            always_regrow_with_remaining,
        )?];

        let mut parent_is_b = false;
        while let Some(last) = instructions.last().copied().filter(|l| l.new_total_parents > 1) {
            let parent_chunk_width = if parent_is_b {
                self.b_chunk_width()
            } else {
                self.a_chunk_width()
            };
            instructions.push(get_trim_layer_instructions(
                last.old_total_parents,
                last.new_total_parents,
                parent_chunk_width,
                last.update_existing_last_hash,
                always_regrow_with_remaining,
            )?);
            parent_is_b = !parent_is_b;
        }

        Ok(instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_first_leaves() {
        let ins = get_leaf_layer_grow_instructions(0, 2, 3, 6).unwrap();
        assert_eq!(ins.old_total_parents, 0);
        assert_eq!(ins.new_total_parents, 1);
        assert!(!ins.need_old_last_parent);
        assert_eq!(ins.start_offset, 0);
        assert_eq!(ins.next_parent_start_index, 0);
    }

    #[test]
    fn grow_tops_off_partial_leaf_chunk() {
        // 1 tuple in a 2-tuple chunk, add 2 more
        let ins = get_leaf_layer_grow_instructions(1, 3, 3, 6).unwrap();
        assert_eq!(ins.old_total_parents, 1);
        assert_eq!(ins.new_total_parents, 2);
        assert!(ins.need_old_last_parent);
        assert_eq!(ins.start_offset, 3);
        assert_eq!(ins.next_parent_start_index, 0);
    }

    #[test]
    fn grow_after_old_root() {
        // the old root becomes the first child of a new layer
        let ins = get_grow_layer_instructions(1, 2, 4, true).unwrap();
        assert!(ins.setting_next_layer_after_old_root);
        assert_eq!(ins.old_total_parents, 0);
        assert!(!ins.need_old_last_child);
        assert!(!ins.need_old_last_parent);
        assert_eq!(ins.start_offset, 0);
    }

    #[test]
    fn grow_updates_last_child_on_full_chunk() {
        // 4 children in width 4, last one changes, 1 appended
        let ins = get_grow_layer_instructions(4, 5, 4, true).unwrap();
        assert!(ins.need_old_last_child);
        assert!(ins.need_old_last_parent);
        assert_eq!(ins.start_offset, 3);
        assert_eq!(ins.next_parent_start_index, 0);
        assert_eq!(ins.new_total_parents, 2);
    }

    #[test]
    fn grow_rejects_shrinking() {
        assert!(get_grow_layer_instructions(5, 4, 4, false).is_err());
        assert!(get_leaf_layer_grow_instructions(2, 2, 3, 6).is_err());
    }

    #[test]
    fn trim_subtracts_when_few_children_go() {
        // width 4: 4 -> 3 children, one removed, three remain
        let ins = get_trim_layer_instructions(4, 3, 4, false, false).unwrap();
        assert!(ins.need_last_chunk_children_to_trim);
        assert!(!ins.need_last_chunk_remaining_children);
        assert!(ins.update_existing_last_hash);
        assert_eq!(ins.hash_offset, 3);
        assert_eq!((ins.start_trim_idx, ins.end_trim_idx), (3, 4));
    }

    #[test]
    fn trim_regrows_when_most_children_go() {
        // width 4: 8 -> 5, three removed from the last chunk, one remains
        let ins = get_trim_layer_instructions(8, 5, 4, false, false).unwrap();
        assert!(ins.need_last_chunk_remaining_children);
        assert!(!ins.need_existing_last_hash);
        assert_eq!(ins.hash_offset, 0);
        assert_eq!((ins.start_trim_idx, ins.end_trim_idx), (4, 5));
    }

    #[test]
    fn trim_tie_subtracts() {
        // width 4: 4 -> 2, two removed and two remain
        let ins = get_trim_layer_instructions(4, 2, 4, false, false).unwrap();
        assert!(ins.need_last_chunk_children_to_trim);
        assert_eq!((ins.start_trim_idx, ins.end_trim_idx), (2, 4));

        let ins = get_trim_layer_instructions(4, 2, 4, false, true).unwrap();
        assert!(ins.need_last_chunk_remaining_children);
        assert_eq!((ins.start_trim_idx, ins.end_trim_idx), (0, 2));
    }

    #[test]
    fn trim_with_changing_last_child() {
        // whole chunks removed, the last remaining child changes
        let ins = get_trim_layer_instructions(12, 8, 4, true, false).unwrap();
        assert!(!ins.need_last_chunk_children_to_trim);
        assert!(!ins.need_last_chunk_remaining_children);
        assert!(ins.update_existing_last_hash);
        assert!(ins.need_new_last_child);
        assert_eq!(ins.hash_offset, 3);
        assert_eq!((ins.start_trim_idx, ins.end_trim_idx), (7, 8));

        // trimming includes the old value of the changing child
        let ins = get_trim_layer_instructions(4, 3, 4, true, false).unwrap();
        assert_eq!(ins.hash_offset, 2);
        assert_eq!((ins.start_trim_idx, ins.end_trim_idx), (2, 4));

        // regrowing leaves the changing child out
        let ins = get_trim_layer_instructions(8, 6, 4, true, true).unwrap();
        assert_eq!((ins.start_trim_idx, ins.end_trim_idx), (4, 5));
    }

    #[test]
    fn trim_nothing_in_layer() {
        let ins = get_trim_layer_instructions(8, 8, 4, false, false).unwrap();
        assert!(!ins.update_existing_last_hash);
        assert!(!ins.need_existing_last_hash);
    }
}
