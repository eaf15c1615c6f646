//! A reference-counted chunk store.
//!
//! Each chunk lives in the arena exactly as long as something references it:
//! [`ChunkArena::acquire`] creates a chunk on its first reference and
//! [`ChunkArena::release`] drops it with its last one.

use crate::types::TreeSyncError;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap, fmt::Debug};

/// The elements of one chunk and the number of references holding it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedChunk<T> {
    pub elems: Vec<T>,
    pub ref_count: u64,
}

/// Chunks keyed by `K`, present iff their reference count is positive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkArena<K: Ord, T> {
    chunks: BTreeMap<K, CachedChunk<T>>,
}

impl<K: Ord, T> Default for ChunkArena<K, T> {
    fn default() -> Self {
        Self {
            chunks: BTreeMap::new(),
        }
    }
}

impl<K, T> ChunkArena<K, T>
where
    K: Ord + Copy + Debug,
{
    pub fn get(&self, key: &K) -> Option<&CachedChunk<T>> {
        self.chunks.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut CachedChunk<T>> {
        self.chunks.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.chunks.contains_key(key)
    }

    /// The elements of a chunk that must be cached.
    pub fn elems(&self, key: &K) -> Result<&[T], TreeSyncError> {
        self.chunks
            .get(key)
            .map(|chunk| chunk.elems.as_slice())
            .ok_or_else(|| TreeSyncError::MissingChunk {
                chunk: format!("{key:?}"),
            })
    }

    /// Adds a reference to `key`, creating an empty chunk if needed.
    /// Returns whether the chunk was created.
    pub fn acquire(&mut self, key: K) -> bool {
        let chunk = self.chunks.entry(key).or_insert_with(|| CachedChunk {
            elems: Vec::new(),
            ref_count: 0,
        });
        chunk.ref_count += 1;
        chunk.ref_count == 1
    }

    /// Drops a reference to `key`, removing the chunk with its last one.
    /// Returns whether the chunk was removed.
    pub fn release(&mut self, key: K) -> Result<bool, TreeSyncError> {
        let chunk = self
            .chunks
            .get_mut(&key)
            .ok_or_else(|| TreeSyncError::MissingChunk {
                chunk: format!("{key:?}"),
            })?;
        if chunk.ref_count == 0 {
            return Err(TreeSyncError::ZeroRefCount {
                chunk: format!("{key:?}"),
            });
        }
        chunk.ref_count -= 1;
        if chunk.ref_count == 0 {
            self.chunks.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    /// Writes `elem` at `pos` of a cached chunk, appending when `pos` is the
    /// chunk's length. Returns `false` if the chunk is not cached.
    pub fn set_elem(&mut self, key: K, pos: usize, elem: T) -> Result<bool, TreeSyncError> {
        let Some(chunk) = self.chunks.get_mut(&key) else {
            return Ok(false);
        };
        match pos.cmp(&chunk.elems.len()) {
            Ordering::Less => chunk.elems[pos] = elem,
            Ordering::Equal => chunk.elems.push(elem),
            Ordering::Greater => {
                return Err(TreeSyncError::InconsistentCache {
                    message: "write past the end of a cached chunk",
                })
            }
        }
        Ok(true)
    }

    /// Removes every chunk matching `pred`, whatever its reference count.
    pub fn remove_if(&mut self, mut pred: impl FnMut(&K) -> bool) {
        self.chunks.retain(|key, _| !pred(key));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &CachedChunk<T>)> {
        self.chunks.iter()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}
