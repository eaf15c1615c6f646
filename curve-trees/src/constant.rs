//! This module defines constants that determine the shape of a curve tree and
//! the defaults of its local cache.

/// Number of curve-B scalars a single output contributes to the leaf layer:
/// the x-coordinates of `O`, `I` and `C`.
pub const LEAF_TUPLE_SIZE: usize = 3;

/// Default chunk width of layers hashed by curve A.
pub const DEFAULT_A_CHUNK_WIDTH: usize = 18;
/// Default chunk width of layers hashed by curve B, counted in leaf tuples for
/// the leaf layer.
pub const DEFAULT_B_CHUNK_WIDTH: usize = 38;

/// Smallest batch of chunks (or outputs) worth handing to the rayon pool.
pub const DEFAULT_MIN_PAR_BATCH_SIZE: usize = 64;

/// Number of blocks a reorg may roll back by default.
pub const DEFAULT_MAX_REORG_DEPTH: u64 = 100;

/// Domain separator of the hash-to-point deriving the key-image generator `I`.
pub const KEY_IMAGE_GENERATOR_DOMAIN: &[u8] = b"curve-trees/key-image-generator";

/// Upper bound on try-and-increment rounds when hashing to an ed25519 point.
/// Each round succeeds with probability ~1/2.
pub const MAX_HASH_TO_POINT_TRIES: usize = 256;

/// Format version written into every tree cache snapshot. Snapshots with any
/// other version are rejected.
pub const TREE_CACHE_SNAPSHOT_VERSION: u32 = 1;

/// Hash of the (non-existent) parent of the first block.
pub const ZERO_BLOCK_HASH: [u8; 32] = [0u8; 32];
