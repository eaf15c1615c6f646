//! The wallet-side tree cache.
//!
//! [`TreeCache`] wraps a [`TreeSync`] and adds what a wallet scanning the
//! chain needs on top of it:
//! - time-locked outputs: an output announced in block `b` with unlock block
//!   `u > b` is held back and enters the tree when block `u` is synced;
//! - the total number of outputs observed so far;
//! - initialization from a checkpoint, and a versioned snapshot of the whole
//!   cache.
//!
//! Unlocked groups stay in the locked output index until their block leaves
//! the reorg window, so that a popped block can be synced again without
//! re-reading the outputs created before it.

use crate::{
    config::TreeCacheConfig,
    constant::TREE_CACHE_SNAPSHOT_VERSION,
    curve_trees::{CurveTrees, Path, PathBytes},
    tree_sync::{SyncState, TreeSync},
    types::{
        BlockHash, BlockIdx, BlockMeta, CreatedBlockIdx, NumOutputs, OutputContext, OutputPair,
        OutsByUnlockBlock, TreeRoot, TreeSyncError, UnlockBlockIdx,
    },
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tower_cycle::{Curve, Pallas, Vesta};
use tracing::debug;

/// The tree cache used in production.
pub type PastaTreeCache = TreeCache<Vesta, Pallas>;

/// Number of outputs every created block added to each unlock group.
pub type LockedOutputRefs = BTreeMap<CreatedBlockIdx, BTreeMap<UnlockBlockIdx, NumOutputs>>;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    settings: SnapshotSettings,
    locked_outputs: &'a OutsByUnlockBlock,
    locked_output_refs: &'a LockedOutputRefs,
    output_count: u64,
    sync_state: &'a SyncState,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    settings: SnapshotSettings,
    locked_outputs: OutsByUnlockBlock,
    locked_output_refs: LockedOutputRefs,
    output_count: u64,
    sync_state: SyncState,
}

/// The settings a snapshot can only be loaded back with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotSettings {
    a_chunk_width: u64,
    b_chunk_width: u64,
    max_reorg_depth: u64,
}

impl SnapshotSettings {
    fn of<A, B>(curve_trees: &CurveTrees<A, B>, max_reorg_depth: u64) -> Self
    where
        A: Curve<CycleScalar = <B as Curve>::Scalar>,
        B: Curve<CycleScalar = <A as Curve>::Scalar>,
    {
        Self {
            a_chunk_width: curve_trees.a_chunk_width() as u64,
            b_chunk_width: curve_trees.b_chunk_width() as u64,
            max_reorg_depth,
        }
    }

    fn check(&self, expected: &Self) -> Result<(), TreeSyncError> {
        let mismatch = [
            ("a chunk width", self.a_chunk_width, expected.a_chunk_width),
            ("b chunk width", self.b_chunk_width, expected.b_chunk_width),
            ("max reorg depth", self.max_reorg_depth, expected.max_reorg_depth),
        ]
        .into_iter()
        .find(|(_, found, expected)| found != expected);
        match mismatch {
            Some((setting, found, expected)) => Err(TreeSyncError::SnapshotConfig {
                setting,
                found,
                expected,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct TreeCache<A: Curve, B: Curve> {
    tree_sync: TreeSync<A, B>,
    /// Outputs sorted by `output_id`, grouped by the block that unlocks them.
    locked_outputs: OutsByUnlockBlock,
    locked_output_refs: LockedOutputRefs,
    output_count: u64,
}

impl<A, B> TreeCache<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    pub fn new(
        curve_trees: Arc<CurveTrees<A, B>>,
        config: &TreeCacheConfig,
    ) -> Result<Self, TreeSyncError> {
        Ok(Self {
            tree_sync: TreeSync::new(curve_trees, config)?,
            locked_outputs: BTreeMap::new(),
            locked_output_refs: BTreeMap::new(),
            output_count: 0,
        })
    }

    pub fn tree_sync(&self) -> &TreeSync<A, B> {
        &self.tree_sync
    }

    pub fn register_output(
        &mut self,
        output: &OutputPair,
        unlock_block_idx: UnlockBlockIdx,
    ) -> Result<bool, TreeSyncError> {
        self.tree_sync.register_output(output, unlock_block_idx)
    }

    /// Syncs block `block_idx`, which announces `outs_by_unlock_block`.
    ///
    /// Every announced output must unlock after this block. The outputs
    /// unlocking at this block, announced now or earlier, enter the tree.
    pub fn sync_block(
        &mut self,
        block_idx: BlockIdx,
        block_hash: BlockHash,
        prev_block_hash: BlockHash,
        outs_by_unlock_block: OutsByUnlockBlock,
    ) -> Result<(), TreeSyncError> {
        self.tree_sync.check_contiguity(block_idx, &prev_block_hash)?;
        if let Some((&unlock_block_idx, _)) = outs_by_unlock_block
            .iter()
            .find(|(unlock_block_idx, _)| **unlock_block_idx <= block_idx)
        {
            return Err(TreeSyncError::InvalidUnlockBlock {
                unlock_block_idx,
                block_idx,
            });
        }

        let n_announced = outs_by_unlock_block
            .values()
            .map(|outputs| outputs.len() as NumOutputs)
            .sum::<NumOutputs>();
        let output_count = self.output_count.checked_add(n_announced).ok_or(
            TreeSyncError::InconsistentCache {
                message: "output count overflows",
            },
        )?;

        // Announced outputs unlock after this block, so the tree only takes
        // outputs announced earlier. Nothing changes unless the sync succeeds.
        let unlocked = self
            .locked_outputs
            .get(&block_idx)
            .cloned()
            .unwrap_or_default();
        let evicted = self
            .tree_sync
            .sync_block(block_idx, block_hash, prev_block_hash, unlocked)?;

        let mut created_refs = BTreeMap::new();
        for (unlock_block_idx, outputs) in outs_by_unlock_block {
            if outputs.is_empty() {
                continue;
            }
            created_refs.insert(unlock_block_idx, outputs.len() as NumOutputs);
            add_locked_outputs(&mut self.locked_outputs, unlock_block_idx, outputs);
        }
        self.locked_output_refs.insert(block_idx, created_refs);
        self.output_count = output_count;

        for block in evicted {
            self.locked_outputs.remove(&block.blk_idx);
            self.locked_output_refs.remove(&block.blk_idx);
        }
        Ok(())
    }

    /// Pops the top block, dropping the outputs it announced.
    pub fn pop_block(&mut self) -> Result<bool, TreeSyncError> {
        let Some(top) = self.tree_sync.top_block().copied() else {
            return Ok(false);
        };
        if !self.tree_sync.pop_block()? {
            return Ok(false);
        }
        self.remove_outputs_created_at(top.blk_idx)?;
        Ok(true)
    }

    /// Pops blocks until block `block_idx` with hash `block_hash` is the top.
    ///
    /// Returns `false`, popping nothing, unless that block is inside the
    /// reorg window.
    pub fn pop_to_block(
        &mut self,
        block_idx: BlockIdx,
        block_hash: BlockHash,
    ) -> Result<bool, TreeSyncError> {
        let target_retained = self
            .tree_sync
            .cached_blocks()
            .any(|block| block.blk_idx == block_idx && block.blk_hash == block_hash);
        if !target_retained {
            return Ok(false);
        }

        while let Some(top) = self.tree_sync.top_block().copied() {
            if top.blk_idx == block_idx {
                break;
            }
            if !self.pop_block()? {
                return Err(TreeSyncError::InconsistentCache {
                    message: "retained block could not be popped",
                });
            }
        }
        Ok(true)
    }

    /// Starts the cache from a checkpoint.
    ///
    /// `timelocked_outputs` are the outputs announced before the checkpoint
    /// that unlock after it. They cannot be popped.
    pub fn init(
        &mut self,
        start_block_idx: BlockIdx,
        start_block_hash: BlockHash,
        n_leaf_tuples: u64,
        last_path: &PathBytes,
        timelocked_outputs: OutsByUnlockBlock,
    ) -> Result<(), TreeSyncError> {
        if let Some((&unlock_block_idx, _)) = timelocked_outputs
            .iter()
            .find(|(unlock_block_idx, _)| **unlock_block_idx <= start_block_idx)
        {
            return Err(TreeSyncError::InvalidUnlockBlock {
                unlock_block_idx,
                block_idx: start_block_idx,
            });
        }
        // Leaves and time-locked outputs have distinct ids below the count
        let mut output_count = n_leaf_tuples;
        for output in timelocked_outputs.values().flatten() {
            let next_id = output
                .output_id
                .checked_add(1)
                .ok_or(TreeSyncError::OutputIdOverflow {
                    output_id: output.output_id,
                })?;
            output_count = output_count.max(next_id);
        }
        self.tree_sync
            .init(start_block_idx, start_block_hash, n_leaf_tuples, last_path)?;

        self.locked_outputs.clear();
        self.locked_output_refs.clear();
        self.output_count = output_count;
        for (unlock_block_idx, outputs) in timelocked_outputs {
            if !outputs.is_empty() {
                add_locked_outputs(&mut self.locked_outputs, unlock_block_idx, outputs);
            }
        }
        debug!(
            start_block_idx,
            n_locked_groups = self.locked_outputs.len(),
            output_count = self.output_count,
            "initialized tree cache"
        );
        Ok(())
    }

    pub fn get_output_path(&self, output: &OutputPair) -> Result<Option<Path<A, B>>, TreeSyncError> {
        self.tree_sync.get_output_path(output)
    }

    pub fn get_tree_root(&self) -> Result<Option<TreeRoot>, TreeSyncError> {
        self.tree_sync.get_tree_root()
    }

    pub fn get_n_leaf_tuples(&self) -> u64 {
        self.tree_sync.get_n_leaf_tuples()
    }

    /// Number of outputs announced so far, locked or not.
    pub fn get_output_count(&self) -> u64 {
        self.output_count
    }

    pub fn top_block(&self) -> Option<&BlockMeta> {
        self.tree_sync.top_block()
    }

    pub fn n_synced_blocks(&self) -> usize {
        self.tree_sync.n_synced_blocks()
    }

    /// Outputs waiting for block `unlock_block_idx`.
    pub fn locked_outputs(&self, unlock_block_idx: UnlockBlockIdx) -> &[OutputContext] {
        self.locked_outputs
            .get(&unlock_block_idx)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn check_ref_counts(&self) -> Result<(), TreeSyncError> {
        self.tree_sync.check_ref_counts()
    }

    pub fn clear(&mut self) {
        self.tree_sync.clear();
        self.locked_outputs.clear();
        self.locked_output_refs.clear();
        self.output_count = 0;
    }

    /// Serializes the whole cache.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, TreeSyncError> {
        let snapshot = SnapshotRef {
            version: TREE_CACHE_SNAPSHOT_VERSION,
            settings: SnapshotSettings::of(
                self.tree_sync.curve_trees(),
                self.tree_sync.max_reorg_depth(),
            ),
            locked_outputs: &self.locked_outputs,
            locked_output_refs: &self.locked_output_refs,
            output_count: self.output_count,
            sync_state: &self.tree_sync.state,
        };
        Ok(bincode::serde::encode_to_vec(
            &snapshot,
            bincode::config::legacy(),
        )?)
    }

    /// Restores a cache written by [`TreeCache::to_snapshot`], checking its
    /// reference counts.
    pub fn from_snapshot(
        curve_trees: Arc<CurveTrees<A, B>>,
        config: &TreeCacheConfig,
        bytes: &[u8],
    ) -> Result<Self, TreeSyncError> {
        let (version, _): (u32, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
        if version != TREE_CACHE_SNAPSHOT_VERSION {
            return Err(TreeSyncError::SnapshotVersion {
                found: version,
                expected: TREE_CACHE_SNAPSHOT_VERSION,
            });
        }
        let (snapshot, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
        snapshot
            .settings
            .check(&SnapshotSettings::of(&curve_trees, config.max_reorg_depth))?;

        let mut cache = Self::new(curve_trees, config)?;
        cache.locked_outputs = snapshot.locked_outputs;
        cache.locked_output_refs = snapshot.locked_output_refs;
        cache.output_count = snapshot.output_count;
        cache.tree_sync.state = snapshot.sync_state;
        cache.check_ref_counts()?;

        debug!(
            version = snapshot.version,
            n_blocks = cache.n_synced_blocks(),
            n_leaf_tuples = cache.get_n_leaf_tuples(),
            "loaded tree cache snapshot"
        );
        Ok(cache)
    }

    fn remove_outputs_created_at(&mut self, created_block_idx: BlockIdx) -> Result<(), TreeSyncError> {
        let created_refs = self
            .locked_output_refs
            .remove(&created_block_idx)
            .unwrap_or_default();

        for (unlock_block_idx, n_outputs) in created_refs {
            let locked = self.locked_outputs.get_mut(&unlock_block_idx).ok_or(
                TreeSyncError::InconsistentCache {
                    message: "created outputs are missing from the locked outputs",
                },
            )?;
            let n_remaining = (locked.len() as NumOutputs).checked_sub(n_outputs).ok_or(
                TreeSyncError::InconsistentCache {
                    message: "fewer locked outputs than were created",
                },
            )?;
            // Outputs created last have the highest ids
            locked.truncate(n_remaining as usize);
            if locked.is_empty() {
                self.locked_outputs.remove(&unlock_block_idx);
            }

            self.output_count = self.output_count.checked_sub(n_outputs).ok_or(
                TreeSyncError::InconsistentCache {
                    message: "output count below the outputs removed",
                },
            )?;
            debug!(
                created_block_idx,
                unlock_block_idx, n_outputs, "removed locked outputs of popped block"
            );
        }
        Ok(())
    }
}

/// Merges `outputs` into the group unlocking at `unlock_block_idx`, keeping
/// it sorted by `output_id`.
fn add_locked_outputs(
    locked_outputs: &mut OutsByUnlockBlock,
    unlock_block_idx: UnlockBlockIdx,
    outputs: Vec<OutputContext>,
) {
    let group = locked_outputs.entry(unlock_block_idx).or_default();
    group.extend(outputs);
    group.sort_by_key(|o| o.output_id);
}
