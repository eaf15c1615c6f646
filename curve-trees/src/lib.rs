#![doc = include_str!("../README.md")]

pub mod config;
pub use config::{CurveTreesConfig, TreeCacheConfig};
pub mod constant;
pub mod curve_trees;
pub use curve_trees::{
    CurveTrees, LastHashes, Path, PathBytes, PastaCurveTrees, TreeExtension, TreeReader,
    TreeReduction,
};
pub mod tree_cache;
pub use tree_cache::{PastaTreeCache, TreeCache};
pub mod tree_sync;
pub use tree_sync::{PastaTreeSync, TreeSync};

pub mod types;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve_trees::test_utils::{block_hash, random_outputs, FullTree};
    use rand::{rngs::StdRng, SeedableRng};
    use std::{collections::BTreeMap, sync::Arc};

    #[test]
    /// A simple end-to-end test of a wallet following the chain.
    fn basic_integration_test() -> Result<(), Box<dyn std::error::Error>> {
        // Small chunks so that a handful of outputs already builds several layers
        let curve_trees = Arc::new(PastaCurveTrees::from_config(&CurveTreesConfig {
            a_chunk_width: 3,
            b_chunk_width: 2,
            ..Default::default()
        })?);
        let mut cache = TreeCache::new(curve_trees.clone(), &TreeCacheConfig::default())?;

        let mut rng = StdRng::seed_from_u64(7);
        let outputs = random_outputs(&mut rng, 0, 12);
        let mine = outputs[9].output_pair;

        // The wallet learns about its output before it unlocks at block 2
        assert!(cache.register_output(&mine, 2)?);

        cache.sync_block(
            0,
            block_hash(0),
            constant::ZERO_BLOCK_HASH,
            BTreeMap::from([(1, outputs[..8].to_vec()), (2, outputs[8..].to_vec())]),
        )?;
        cache.sync_block(1, block_hash(1), block_hash(0), BTreeMap::new())?;
        assert!(cache.get_output_path(&mine)?.is_some_and(|p| p.is_empty()));
        cache.sync_block(2, block_hash(2), block_hash(1), BTreeMap::new())?;

        // Compare against a tree built from scratch
        let mut tree = FullTree::new(&curve_trees);
        tree.grow(outputs.clone())?;
        tree.assert_matches_from_scratch();
        let root = cache.get_tree_root()?.ok_or("empty tree")?;
        assert_eq!(Some(root.root), tree.root_bytes());

        // The path proves membership against the current root
        let path = cache.get_output_path(&mine)?.ok_or("not registered")?;
        assert!(curve_trees.audit_path(&path, &mine, cache.get_n_leaf_tuples()));

        // A reorg drops the output from the tree again
        assert!(cache.pop_block()?);
        assert!(cache.get_output_path(&mine)?.is_some_and(|p| p.is_empty()));
        cache.check_ref_counts()?;

        Ok(())
    }
}
