//! Tunables of the curve tree and of its local cache.

use crate::{
    constant::{
        DEFAULT_A_CHUNK_WIDTH, DEFAULT_B_CHUNK_WIDTH, DEFAULT_MAX_REORG_DEPTH,
        DEFAULT_MIN_PAR_BATCH_SIZE, LEAF_TUPLE_SIZE,
    },
    types::{CurveTreesError, TreeSyncError},
};
use serde::{Deserialize, Serialize};

/// Shape of a curve tree.
///
/// The chunk widths are consensus parameters: trees built with different
/// widths have different roots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveTreesConfig {
    /// Children per chunk in layers hashed by curve A.
    pub a_chunk_width: usize,
    /// Children per chunk in layers hashed by curve B. For the leaf layer this
    /// counts leaf tuples, not scalars.
    pub b_chunk_width: usize,
    /// Minimum task batch size for parallel processing.
    pub min_par_batch_size: usize,
}

impl Default for CurveTreesConfig {
    fn default() -> Self {
        Self {
            a_chunk_width: DEFAULT_A_CHUNK_WIDTH,
            b_chunk_width: DEFAULT_B_CHUNK_WIDTH,
            min_par_batch_size: DEFAULT_MIN_PAR_BATCH_SIZE,
        }
    }
}

impl CurveTreesConfig {
    pub fn validate(&self) -> Result<(), CurveTreesError> {
        if self.a_chunk_width < 2 || self.b_chunk_width < 2 {
            return Err(CurveTreesError::InvalidConfig {
                message: "chunk widths must be at least 2",
            });
        }
        if self.min_par_batch_size == 0 {
            return Err(CurveTreesError::InvalidConfig {
                message: "min_par_batch_size must be positive",
            });
        }
        Ok(())
    }

    /// Width of a leaf chunk counted in scalars.
    pub fn leaf_layer_chunk_width(&self) -> usize {
        LEAF_TUPLE_SIZE * self.b_chunk_width
    }
}

/// Settings of a [`crate::TreeCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeCacheConfig {
    /// How many blocks can be popped. The cache keeps the metadata of
    /// `max_reorg_depth + 1` blocks.
    pub max_reorg_depth: u64,
}

impl Default for TreeCacheConfig {
    fn default() -> Self {
        Self {
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
        }
    }
}

impl TreeCacheConfig {
    pub fn validate(&self) -> Result<(), TreeSyncError> {
        if self.max_reorg_depth == 0 {
            return Err(CurveTreesError::InvalidConfig {
                message: "max_reorg_depth must be at least 1",
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CurveTreesConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.leaf_layer_chunk_width(), 3 * DEFAULT_B_CHUNK_WIDTH);
        assert!(TreeCacheConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_values() {
        let narrow = CurveTreesConfig {
            a_chunk_width: 1,
            ..Default::default()
        };
        assert!(narrow.validate().is_err());

        let no_reorg = TreeCacheConfig { max_reorg_depth: 0 };
        assert!(no_reorg.validate().is_err());
    }

    #[test]
    fn config_survives_bincode() {
        let bytes = bincode::serde::encode_to_vec(
            CurveTreesConfig {
                a_chunk_width: 4,
                b_chunk_width: 5,
                min_par_batch_size: 1,
            },
            bincode::config::legacy(),
        )
        .unwrap();
        let (config, _): (CurveTreesConfig, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).unwrap();
        assert_eq!(config.a_chunk_width, 4);
        assert_eq!(config.b_chunk_width, 5);
    }
}
