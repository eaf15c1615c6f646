//! Incremental tree synchronization.
//!
//! [`TreeSync`] follows a chain block by block and keeps only the chunks of
//! the tree it needs:
//! - the tip chunks (the path of the last leaf) of every block inside the
//!   reorg window, which carry the last hashes used to grow the tree and the
//!   children used to trim it back;
//! - the path chunks of every registered output that is already in the tree.
//!
//! Chunks are reference counted: every retained block holds one reference on
//! each of its tip chunks, and every assigned registered output holds one on
//! each of its path chunks. A chunk is dropped with its last reference.
//! Whenever an extension touches a cached chunk, the chunk is topped up, so a
//! cached chunk always holds every current element of its index range.

use crate::{
    config::TreeCacheConfig,
    constant::ZERO_BLOCK_HASH,
    curve_trees::{
        CurveTrees, LastHashes, LayerExtension, Path, PathBytes, TreeExtension, TreeReader,
        TreeReduction,
    },
    types::{
        AssignedLeafIdx, BlockHash, BlockIdx, BlockMeta, ChildChunkIdx, LayerIdx, LeafIdx,
        OutputContext, OutputPair, OutputRef, TreeRoot, TreeSyncError, UnlockBlockIdx,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap, VecDeque},
    fmt::Debug,
    sync::Arc,
};
use tower_cycle::{Curve, Pallas, PointBytes, Vesta};
use tracing::{debug, trace};

pub mod arena;

pub use arena::{CachedChunk, ChunkArena};

/// The tree synchronizer used in production.
pub type PastaTreeSync = TreeSync<Vesta, Pallas>;

/// Cached leaves, keyed by leaf chunk index.
pub type LeafCache = ChunkArena<ChildChunkIdx, OutputPair>;
/// Cached compressed hashes, keyed by `(layer, chunk index)`.
pub type TreeElemCache = ChunkArena<(LayerIdx, ChildChunkIdx), PointBytes>;

/// Everything a [`TreeSync`] stores about the chain. Points are kept
/// compressed, so the state does not depend on the curves.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SyncState {
    pub registered_outputs: BTreeMap<OutputRef, AssignedLeafIdx>,
    pub leaf_cache: LeafCache,
    pub tree_elem_cache: TreeElemCache,
    pub cached_blocks: VecDeque<BlockMeta>,
}

/// The chunks on the path of one leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PathChunks {
    leaf_chunk_idx: ChildChunkIdx,
    /// Chunk index in every hash layer, bottom-up.
    layer_chunk_idxs: Vec<ChildChunkIdx>,
}

impl PathChunks {
    fn layer_keys(&self) -> impl Iterator<Item = (LayerIdx, ChildChunkIdx)> + '_ {
        self.layer_chunk_idxs.iter().copied().enumerate()
    }
}

/// Keeps the tree root, the paths of registered outputs, and what is needed
/// to grow or trim the tree, without storing the whole tree.
#[derive(Debug)]
pub struct TreeSync<A: Curve, B: Curve> {
    curve_trees: Arc<CurveTrees<A, B>>,
    max_reorg_depth: u64,
    pub(crate) state: SyncState,
}

impl<A, B> TreeSync<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    pub fn new(
        curve_trees: Arc<CurveTrees<A, B>>,
        config: &TreeCacheConfig,
    ) -> Result<Self, TreeSyncError> {
        config.validate()?;
        Ok(Self {
            curve_trees,
            max_reorg_depth: config.max_reorg_depth,
            state: SyncState::default(),
        })
    }

    pub fn curve_trees(&self) -> &Arc<CurveTrees<A, B>> {
        &self.curve_trees
    }

    pub fn max_reorg_depth(&self) -> u64 {
        self.max_reorg_depth
    }

    /// Size of the leaf layer after the top synced block.
    pub fn get_n_leaf_tuples(&self) -> u64 {
        self.state
            .cached_blocks
            .back()
            .map_or(0, |block| block.n_leaf_tuples)
    }

    pub fn top_block(&self) -> Option<&BlockMeta> {
        self.state.cached_blocks.back()
    }

    /// Number of blocks inside the reorg window.
    pub fn n_synced_blocks(&self) -> usize {
        self.state.cached_blocks.len()
    }

    pub fn cached_blocks(&self) -> impl Iterator<Item = &BlockMeta> {
        self.state.cached_blocks.iter()
    }

    /// Number of chunks cached, leaves and hash layers together.
    pub fn n_cached_chunks(&self) -> usize {
        self.state.leaf_cache.len() + self.state.tree_elem_cache.len()
    }

    pub fn clear(&mut self) {
        self.state = SyncState::default();
    }

    /// Starts tracking the path of `output` once it enters the tree.
    ///
    /// Returns `false` if the output is already registered. Outputs must be
    /// registered before the block that unlocks them is synced.
    pub fn register_output(
        &mut self,
        output: &OutputPair,
        unlock_block_idx: UnlockBlockIdx,
    ) -> Result<bool, TreeSyncError> {
        if let Some(top) = self.top_block() {
            if unlock_block_idx <= top.blk_idx {
                return Err(TreeSyncError::InvalidUnlockBlock {
                    unlock_block_idx,
                    block_idx: top.blk_idx,
                });
            }
        }

        match self.state.registered_outputs.entry(output.output_ref()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(AssignedLeafIdx::default());
                debug!(unlock_block_idx, "registered output");
                Ok(true)
            }
        }
    }

    /// Appends the outputs unlocked by block `block_idx` to the tree.
    ///
    /// Returns the blocks that left the reorg window.
    pub fn sync_block(
        &mut self,
        block_idx: BlockIdx,
        block_hash: BlockHash,
        prev_block_hash: BlockHash,
        outputs: Vec<OutputContext>,
    ) -> Result<Vec<BlockMeta>, TreeSyncError> {
        self.check_contiguity(block_idx, &prev_block_hash)?;

        let old_n_leaf_tuples = self.get_n_leaf_tuples();
        let last_hashes = self.get_last_hashes()?;
        let extension =
            self.curve_trees
                .get_tree_extension(old_n_leaf_tuples, &last_hashes, outputs)?;
        let new_n_leaf_tuples = old_n_leaf_tuples + extension.leaves.tuples.len() as u64;

        // Outputs already in the tree extend their paths into new layers
        let old_n_layers = self.curve_trees.n_layers(old_n_leaf_tuples);
        if self.curve_trees.n_layers(new_n_leaf_tuples) > old_n_layers {
            let assigned: Vec<LeafIdx> = self
                .state
                .registered_outputs
                .values()
                .filter(|a| a.assigned)
                .map(|a| a.leaf_idx)
                .collect();
            for leaf_idx in assigned {
                let chunks = self.path_chunks(new_n_leaf_tuples, leaf_idx)?;
                self.acquire_path(&chunks, old_n_layers);
            }
        }

        for (i, output) in extension.leaves.tuples.iter().enumerate() {
            let leaf_idx = extension.leaves.start_leaf_tuple_idx + i as u64;
            let output_ref = output.output_pair.output_ref();
            match self.state.registered_outputs.get_mut(&output_ref) {
                Some(assigned_leaf_idx) if !assigned_leaf_idx.assigned => {
                    assigned_leaf_idx.assign(leaf_idx);
                }
                _ => continue,
            }
            debug!(leaf_idx, output_id = output.output_id, "assigned registered output");
            let chunks = self.path_chunks(new_n_leaf_tuples, leaf_idx)?;
            self.acquire_path(&chunks, 0);
        }

        if let Some(chunks) = self.tip_chunks(new_n_leaf_tuples)? {
            self.acquire_path(&chunks, 0);
        }
        self.cache_extension(&extension)?;

        self.state.cached_blocks.push_back(BlockMeta {
            blk_idx: block_idx,
            blk_hash: block_hash,
            n_leaf_tuples: new_n_leaf_tuples,
        });
        debug!(
            block_idx,
            block_hash = hex::encode(block_hash),
            n_new_leaf_tuples = extension.leaves.tuples.len(),
            n_leaf_tuples = new_n_leaf_tuples,
            "synced block"
        );

        self.evict_blocks()
    }

    /// Removes the top block and its outputs from the tree.
    ///
    /// Returns `false` when there is no block to pop: the cache is empty, or
    /// its only block is a checkpoint whose parent is unknown.
    pub fn pop_block(&mut self) -> Result<bool, TreeSyncError> {
        let Some(top) = self.top_block().copied() else {
            return Ok(false);
        };
        let n_blocks = self.state.cached_blocks.len();
        if n_blocks == 1 && top.blk_idx > 0 {
            return Ok(false);
        }

        let old_n_leaf_tuples = top.n_leaf_tuples;
        let new_n_leaf_tuples = if n_blocks > 1 {
            self.state.cached_blocks[n_blocks - 2].n_leaf_tuples
        } else {
            0
        };
        if new_n_leaf_tuples > old_n_leaf_tuples {
            return Err(TreeSyncError::InconsistentCache {
                message: "block has fewer leaves than its parent",
            });
        }

        // Read everything the reduction needs while the chunks are cached
        let reduction = if new_n_leaf_tuples > 0 && new_n_leaf_tuples < old_n_leaf_tuples {
            Some(self.get_tree_reduction(old_n_leaf_tuples, new_n_leaf_tuples)?)
        } else {
            None
        };

        if let Some(chunks) = self.tip_chunks(old_n_leaf_tuples)? {
            self.release_path(&chunks)?;
        }

        if new_n_leaf_tuples < old_n_leaf_tuples {
            let trimmed: Vec<(OutputRef, LeafIdx)> = self
                .state
                .registered_outputs
                .iter()
                .filter(|(_, a)| a.assigned && a.leaf_idx >= new_n_leaf_tuples)
                .map(|(output_ref, a)| (*output_ref, a.leaf_idx))
                .collect();
            for (output_ref, leaf_idx) in trimmed {
                let chunks = self.path_chunks(old_n_leaf_tuples, leaf_idx)?;
                self.release_path(&chunks)?;
                if let Some(assigned_leaf_idx) = self.state.registered_outputs.get_mut(&output_ref)
                {
                    assigned_leaf_idx.unassign();
                }
                debug!(leaf_idx, "unassigned registered output");
            }

            if let Some(reduction) = &reduction {
                self.apply_reduction(new_n_leaf_tuples, reduction)?;
            }
            let new_n_layers = self.curve_trees.n_layers(new_n_leaf_tuples);
            self.state
                .tree_elem_cache
                .remove_if(|(layer_idx, _)| *layer_idx >= new_n_layers);
        }

        self.state.cached_blocks.pop_back();
        debug!(
            block_idx = top.blk_idx,
            old_n_leaf_tuples,
            new_n_leaf_tuples,
            "popped block"
        );
        Ok(true)
    }

    /// The path of a registered output.
    ///
    /// Returns `None` if the output is not registered, and an empty path if
    /// it is registered but not in the tree yet.
    pub fn get_output_path(&self, output: &OutputPair) -> Result<Option<Path<A, B>>, TreeSyncError> {
        let Some(assigned_leaf_idx) = self.state.registered_outputs.get(&output.output_ref()) else {
            return Ok(None);
        };
        if !assigned_leaf_idx.assigned {
            return Ok(Some(Path::default()));
        }

        let n_leaf_tuples = self.get_n_leaf_tuples();
        let leaf_idx = assigned_leaf_idx.leaf_idx;
        let indexes = self.curve_trees.get_path_indexes(n_leaf_tuples, leaf_idx)?;
        let chunks = self.path_chunks(n_leaf_tuples, leaf_idx)?;

        let leaves = self.state.leaf_cache.elems(&chunks.leaf_chunk_idx)?;
        check_chunk_len(leaves, indexes.leaf_range.end - indexes.leaf_range.start)?;
        let mut path = Path {
            leaves: leaves.to_vec(),
            ..Default::default()
        };

        for ((layer_idx, chunk_idx), range) in chunks.layer_keys().zip(&indexes.layers) {
            let elems = self.state.tree_elem_cache.elems(&(layer_idx, chunk_idx))?;
            check_chunk_len(elems, range.end - range.start)?;
            if layer_idx % 2 == 0 {
                let points = elems
                    .iter()
                    .map(|bytes| self.curve_trees.curve_b.from_bytes(bytes))
                    .collect::<Result<_, _>>()?;
                path.b_layers.push(points);
            } else {
                let points = elems
                    .iter()
                    .map(|bytes| self.curve_trees.curve_a.from_bytes(bytes))
                    .collect::<Result<_, _>>()?;
                path.a_layers.push(points);
            }
        }

        Ok(Some(path))
    }

    /// The current root, `None` while the tree is empty.
    pub fn get_tree_root(&self) -> Result<Option<TreeRoot>, TreeSyncError> {
        let n_layers = self.curve_trees.n_layers(self.get_n_leaf_tuples());
        if n_layers == 0 {
            return Ok(None);
        }
        Ok(Some(TreeRoot {
            root: self.elem_bytes(n_layers - 1, 0)?,
            n_layers,
        }))
    }

    /// The last hash of every layer of the current tree.
    pub fn get_last_hashes(&self) -> Result<LastHashes<A, B>, TreeSyncError> {
        let mut last_hashes = LastHashes::default();
        let n_elems = self.curve_trees.n_elems_per_layer(self.get_n_leaf_tuples());
        for (layer_idx, n) in n_elems.into_iter().enumerate() {
            let width = self.curve_trees.layer_chunk_width(layer_idx) as u64;
            let chunk_idx = (n - 1) / width;
            let elems = self.state.tree_elem_cache.elems(&(layer_idx, chunk_idx))?;
            check_chunk_len(elems, n - chunk_idx * width)?;

            if layer_idx % 2 == 0 {
                last_hashes.b_last_hashes.push(self.b_elem(layer_idx, n - 1)?);
            } else {
                last_hashes.a_last_hashes.push(self.a_elem(layer_idx, n - 1)?);
            }
        }
        Ok(last_hashes)
    }

    /// Starts the cache from a checkpoint instead of the first block.
    ///
    /// `last_path` is the path of the last leaf of a tree with
    /// `n_leaf_tuples` leaves after block `start_block_idx`; it must audit.
    pub fn init(
        &mut self,
        start_block_idx: BlockIdx,
        start_block_hash: BlockHash,
        n_leaf_tuples: u64,
        last_path: &PathBytes,
    ) -> Result<(), TreeSyncError> {
        if !self.state.cached_blocks.is_empty() {
            return Err(TreeSyncError::InvalidCheckpoint {
                message: "cache already holds blocks",
            });
        }

        if n_leaf_tuples == 0 {
            if !last_path.leaves.is_empty() || !last_path.layer_chunks.is_empty() {
                return Err(TreeSyncError::InvalidCheckpoint {
                    message: "empty tree with a non-empty path",
                });
            }
        } else {
            self.check_last_path(n_leaf_tuples, last_path)?;

            let chunks = self.path_chunks(n_leaf_tuples, n_leaf_tuples - 1)?;
            self.acquire_path(&chunks, 0);
            if let Some(chunk) = self.state.leaf_cache.get_mut(&chunks.leaf_chunk_idx) {
                chunk.elems = last_path.leaves.clone();
            }
            for (key, elems) in chunks.layer_keys().zip(&last_path.layer_chunks) {
                if let Some(chunk) = self.state.tree_elem_cache.get_mut(&key) {
                    chunk.elems = elems.clone();
                }
            }
        }

        self.state.cached_blocks.push_back(BlockMeta {
            blk_idx: start_block_idx,
            blk_hash: start_block_hash,
            n_leaf_tuples,
        });
        debug!(start_block_idx, n_leaf_tuples, "initialized tree sync from checkpoint");
        Ok(())
    }

    /// Checks every cached chunk's reference count against the retained
    /// blocks and the assigned registered outputs.
    pub fn check_ref_counts(&self) -> Result<(), TreeSyncError> {
        let mut leaf_refs = BTreeMap::new();
        let mut elem_refs = BTreeMap::new();
        let mut count = |chunks: &PathChunks| {
            *leaf_refs.entry(chunks.leaf_chunk_idx).or_insert(0u64) += 1;
            for key in chunks.layer_keys() {
                *elem_refs.entry(key).or_insert(0u64) += 1;
            }
        };

        for block in &self.state.cached_blocks {
            if let Some(chunks) = self.tip_chunks(block.n_leaf_tuples)? {
                count(&chunks);
            }
        }
        let n_leaf_tuples = self.get_n_leaf_tuples();
        for assigned_leaf_idx in self.state.registered_outputs.values() {
            if assigned_leaf_idx.assigned {
                count(&self.path_chunks(n_leaf_tuples, assigned_leaf_idx.leaf_idx)?);
            }
        }

        compare_ref_counts(&self.state.leaf_cache, leaf_refs)?;
        compare_ref_counts(&self.state.tree_elem_cache, elem_refs)
    }

    pub(crate) fn check_contiguity(
        &self,
        block_idx: BlockIdx,
        prev_block_hash: &BlockHash,
    ) -> Result<(), TreeSyncError> {
        match self.top_block() {
            None if block_idx != 0 => Err(TreeSyncError::NonContiguousBlock {
                block_idx,
                message: "the first synced block must be block 0",
            }),
            None if *prev_block_hash != ZERO_BLOCK_HASH => Err(TreeSyncError::NonContiguousBlock {
                block_idx,
                message: "block 0 must have a zero parent hash",
            }),
            Some(top) if top.blk_idx + 1 != block_idx => Err(TreeSyncError::NonContiguousBlock {
                block_idx,
                message: "block index does not follow the top block",
            }),
            Some(top) if top.blk_hash != *prev_block_hash => {
                Err(TreeSyncError::NonContiguousBlock {
                    block_idx,
                    message: "parent hash does not match the top block",
                })
            }
            _ => Ok(()),
        }
    }

    fn check_last_path(&self, n_leaf_tuples: u64, last_path: &PathBytes) -> Result<(), TreeSyncError> {
        let indexes = self
            .curve_trees
            .get_path_indexes(n_leaf_tuples, n_leaf_tuples - 1)?;
        let shape_matches = last_path.leaves.len() as u64
            == indexes.leaf_range.end - indexes.leaf_range.start
            && last_path.layer_chunks.len() == indexes.layers.len()
            && last_path
                .layer_chunks
                .iter()
                .zip(&indexes.layers)
                .all(|(chunk, range)| chunk.len() as u64 == range.end - range.start);
        if !shape_matches {
            return Err(TreeSyncError::InvalidCheckpoint {
                message: "last path does not match the tree size",
            });
        }

        let path = self.curve_trees.path_bytes_to_path(last_path)?;
        let last_leaf = last_path
            .leaves
            .last()
            .ok_or(TreeSyncError::InvalidCheckpoint {
                message: "last path has no leaves",
            })?;
        if !self.curve_trees.audit_path(&path, last_leaf, n_leaf_tuples) {
            return Err(TreeSyncError::InvalidCheckpoint {
                message: "last path does not audit",
            });
        }
        Ok(())
    }

    fn get_tree_reduction(
        &self,
        old_n_leaf_tuples: u64,
        new_n_leaf_tuples: u64,
    ) -> Result<TreeReduction<A, B>, TreeSyncError> {
        let instructions = self.curve_trees.get_trim_instructions(
            old_n_leaf_tuples,
            old_n_leaf_tuples - new_n_leaf_tuples,
            false,
        )?;
        let children = self
            .curve_trees
            .get_last_chunk_children_to_trim(self, &instructions)?;
        let last_hashes = self.curve_trees.get_last_hashes_to_trim(self, &instructions)?;
        Ok(self
            .curve_trees
            .get_tree_reduction(&instructions, &children, &last_hashes)?)
    }

    /// Shrinks the tip chunks to a tree of `new_n_leaf_tuples` leaves and
    /// writes the new last hash of every layer.
    fn apply_reduction(
        &mut self,
        new_n_leaf_tuples: u64,
        reduction: &TreeReduction<A, B>,
    ) -> Result<(), TreeSyncError> {
        let leaf_width = self.curve_trees.b_chunk_width() as u64;
        let leaf_chunk_idx = (new_n_leaf_tuples - 1) / leaf_width;
        let chunk = self
            .state
            .leaf_cache
            .get_mut(&leaf_chunk_idx)
            .ok_or_else(|| missing_chunk(leaf_chunk_idx))?;
        chunk
            .elems
            .truncate((new_n_leaf_tuples - leaf_chunk_idx * leaf_width) as usize);

        let n_elems = self.curve_trees.n_elems_per_layer(new_n_leaf_tuples);
        for (layer_idx, n) in n_elems.into_iter().enumerate() {
            let new_last_hash = if layer_idx % 2 == 0 {
                reduction
                    .b_layer_reductions
                    .get(layer_idx / 2)
                    .map(|r| self.curve_trees.curve_b.to_bytes(&r.new_last_hash))
            } else {
                reduction
                    .a_layer_reductions
                    .get(layer_idx / 2)
                    .map(|r| self.curve_trees.curve_a.to_bytes(&r.new_last_hash))
            }
            .ok_or(TreeSyncError::InconsistentCache {
                message: "reduction is missing a layer",
            })?;

            let width = self.curve_trees.layer_chunk_width(layer_idx) as u64;
            let key = (layer_idx, (n - 1) / width);
            let chunk = self
                .state
                .tree_elem_cache
                .get_mut(&key)
                .ok_or_else(|| missing_chunk(key))?;
            chunk.elems.truncate((n - key.1 * width) as usize);
            check_chunk_len(&chunk.elems, n - key.1 * width)?;
            if let Some(last) = chunk.elems.last_mut() {
                *last = new_last_hash;
            }
            trace!(layer_idx, chunk_idx = key.1, n_elems = n, "shrank tip chunk");
        }
        Ok(())
    }

    /// Writes every new leaf and hash of `extension` into the chunks that are
    /// cached.
    fn cache_extension(&mut self, extension: &TreeExtension<A, B>) -> Result<(), TreeSyncError> {
        let leaf_width = self.curve_trees.b_chunk_width() as u64;
        for (i, output) in extension.leaves.tuples.iter().enumerate() {
            let leaf_idx = extension.leaves.start_leaf_tuple_idx + i as u64;
            self.state.leaf_cache.set_elem(
                leaf_idx / leaf_width,
                (leaf_idx % leaf_width) as usize,
                output.output_pair,
            )?;
        }

        for layer_idx in 0..extension.n_layers() {
            let width = self.curve_trees.layer_chunk_width(layer_idx) as u64;
            if layer_idx % 2 == 0 {
                cache_layer_extension(
                    &self.curve_trees.curve_b,
                    &mut self.state.tree_elem_cache,
                    layer_idx,
                    width,
                    &extension.b_layer_extensions[layer_idx / 2],
                )?;
            } else {
                cache_layer_extension(
                    &self.curve_trees.curve_a,
                    &mut self.state.tree_elem_cache,
                    layer_idx,
                    width,
                    &extension.a_layer_extensions[layer_idx / 2],
                )?;
            }
        }
        Ok(())
    }

    /// Drops blocks that left the reorg window along with their references.
    fn evict_blocks(&mut self) -> Result<Vec<BlockMeta>, TreeSyncError> {
        let mut evicted = vec![];
        while self.state.cached_blocks.len() as u64 > self.max_reorg_depth.saturating_add(1) {
            let Some(block) = self.state.cached_blocks.pop_front() else {
                break;
            };
            if let Some(chunks) = self.tip_chunks(block.n_leaf_tuples)? {
                self.release_path(&chunks)?;
            }
            debug!(block_idx = block.blk_idx, "evicted block from the reorg window");
            evicted.push(block);
        }
        Ok(evicted)
    }

    fn path_chunks(&self, n_leaf_tuples: u64, leaf_idx: LeafIdx) -> Result<PathChunks, TreeSyncError> {
        let chunk_idxs = self
            .curve_trees
            .get_child_chunk_indexes(n_leaf_tuples, leaf_idx)?;
        Ok(PathChunks {
            leaf_chunk_idx: chunk_idxs[0],
            layer_chunk_idxs: chunk_idxs[1..].to_vec(),
        })
    }

    /// The path of the last leaf, `None` for an empty tree.
    fn tip_chunks(&self, n_leaf_tuples: u64) -> Result<Option<PathChunks>, TreeSyncError> {
        if n_leaf_tuples == 0 {
            return Ok(None);
        }
        self.path_chunks(n_leaf_tuples, n_leaf_tuples - 1).map(Some)
    }

    /// Takes a reference on every chunk of `chunks` from hash layer
    /// `start_layer` up; `start_layer == 0` includes the leaf chunk.
    fn acquire_path(&mut self, chunks: &PathChunks, start_layer: LayerIdx) {
        if start_layer == 0 && self.state.leaf_cache.acquire(chunks.leaf_chunk_idx) {
            trace!(chunk_idx = chunks.leaf_chunk_idx, "caching leaf chunk");
        }
        for key in chunks.layer_keys().skip(start_layer) {
            if self.state.tree_elem_cache.acquire(key) {
                trace!(layer_idx = key.0, chunk_idx = key.1, "caching layer chunk");
            }
        }
    }

    fn release_path(&mut self, chunks: &PathChunks) -> Result<(), TreeSyncError> {
        if self.state.leaf_cache.release(chunks.leaf_chunk_idx)? {
            trace!(chunk_idx = chunks.leaf_chunk_idx, "dropped leaf chunk");
        }
        for key in chunks.layer_keys() {
            if self.state.tree_elem_cache.release(key)? {
                trace!(layer_idx = key.0, chunk_idx = key.1, "dropped layer chunk");
            }
        }
        Ok(())
    }

    fn elem_bytes(&self, layer_idx: LayerIdx, elem_idx: u64) -> Result<PointBytes, TreeSyncError> {
        let width = self.curve_trees.layer_chunk_width(layer_idx) as u64;
        let elems = self
            .state
            .tree_elem_cache
            .elems(&(layer_idx, elem_idx / width))?;
        elems
            .get((elem_idx % width) as usize)
            .copied()
            .ok_or(TreeSyncError::InconsistentCache {
                message: "cached chunk is missing an element",
            })
    }
}

impl<A, B> TreeReader<A, B> for TreeSync<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    type Error = TreeSyncError;

    fn leaf(&self, leaf_idx: LeafIdx) -> Result<OutputPair, Self::Error> {
        let width = self.curve_trees.b_chunk_width() as u64;
        self.state
            .leaf_cache
            .elems(&(leaf_idx / width))?
            .get((leaf_idx % width) as usize)
            .copied()
            .ok_or(TreeSyncError::InconsistentCache {
                message: "cached chunk is missing a leaf",
            })
    }

    fn a_elem(&self, layer_idx: LayerIdx, elem_idx: u64) -> Result<A::Point, Self::Error> {
        let bytes = self.elem_bytes(layer_idx, elem_idx)?;
        Ok(self.curve_trees.curve_a.from_bytes(&bytes)?)
    }

    fn b_elem(&self, layer_idx: LayerIdx, elem_idx: u64) -> Result<B::Point, Self::Error> {
        let bytes = self.elem_bytes(layer_idx, elem_idx)?;
        Ok(self.curve_trees.curve_b.from_bytes(&bytes)?)
    }
}

fn cache_layer_extension<C: Curve>(
    curve: &C,
    cache: &mut TreeElemCache,
    layer_idx: LayerIdx,
    width: u64,
    extension: &LayerExtension<C>,
) -> Result<(), TreeSyncError> {
    for (i, hash) in extension.hashes.iter().enumerate() {
        let elem_idx = extension.start_idx + i as u64;
        let key = (layer_idx, elem_idx / width);
        if cache.contains(&key) {
            cache.set_elem(key, (elem_idx % width) as usize, curve.to_bytes(hash))?;
        }
    }
    Ok(())
}

fn check_chunk_len<T>(elems: &[T], expected: u64) -> Result<(), TreeSyncError> {
    if elems.len() as u64 != expected {
        return Err(TreeSyncError::InconsistentCache {
            message: "cached chunk does not hold its whole range",
        });
    }
    Ok(())
}

fn missing_chunk(key: impl Debug) -> TreeSyncError {
    TreeSyncError::MissingChunk {
        chunk: format!("{key:?}"),
    }
}

fn compare_ref_counts<K, T>(
    arena: &ChunkArena<K, T>,
    mut expected: BTreeMap<K, u64>,
) -> Result<(), TreeSyncError>
where
    K: Ord + Copy + Debug,
{
    for (key, chunk) in arena.iter() {
        let expected_refs = expected.remove(key).unwrap_or(0);
        if chunk.ref_count != expected_refs {
            return Err(TreeSyncError::RefCountMismatch {
                chunk: format!("{key:?}"),
                cached: chunk.ref_count,
                expected: expected_refs,
            });
        }
    }
    match expected.into_keys().next() {
        Some(key) => Err(missing_chunk(key)),
        None => Ok(()),
    }
}
