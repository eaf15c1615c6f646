//! The [`Curve`] capability consumed by the curve-tree algorithms.
//!
//! A curve tree alternates between two curves whose fields are swapped: the
//! x-coordinate of a point on one curve is a scalar of the other. Each curve
//! provides a Pedersen-style vector hash over a fixed set of generators, which
//! can be updated incrementally as children are appended to (or removed from)
//! a chunk.

use std::fmt;
use thiserror::Error;

/// 32-byte compressed point encoding.
pub type PointBytes = [u8; 32];

/// 32-byte little-endian scalar encoding.
pub type ScalarBytes = [u8; 32];

/// Errors raised by curve primitives.
///
/// All of these are fatal for the caller: they indicate malformed input or a
/// violated precondition, never a condition that could succeed on retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurveError {
    #[error("{curve}: offset {offset} + {len} children exceeds {n_generators} generators")]
    ChunkOutOfRange {
        curve: &'static str,
        offset: usize,
        len: usize,
        n_generators: usize,
    },

    #[error("{curve}: invalid point encoding {bytes}")]
    InvalidPoint { curve: &'static str, bytes: String },

    #[error("{curve}: invalid scalar encoding {bytes}")]
    InvalidScalar { curve: &'static str, bytes: String },
}

/// Hashing and encoding primitives of one curve in a 2-cycle.
///
/// `CycleScalar` is the scalar type of the *other* curve of the cycle; a
/// point's x-coordinate is converted into it by [`Curve::point_to_cycle_scalar`].
pub trait Curve: Clone + fmt::Debug + Send + Sync + 'static {
    type Scalar: Clone + Copy + PartialEq + Eq + fmt::Debug + Send + Sync;
    type Point: Clone + Copy + PartialEq + Eq + fmt::Debug + Send + Sync;
    type CycleScalar: Clone + Copy + PartialEq + Eq + fmt::Debug + Send + Sync;

    /// Short name used in logs and error messages.
    const NAME: &'static str;

    /// The hash of an empty chunk.
    fn hash_init_point(&self) -> Self::Point;

    /// Appends `new_children` to a chunk whose current hash is `existing_hash`,
    /// starting at position `offset`.
    ///
    /// `existing_child_at_offset` is the value currently occupying `offset`
    /// (zero when the slot is empty). It is replaced by `new_children[0]`, which
    /// lets the caller overwrite a chunk's last child while extending it.
    /// Growing by an empty slice returns `existing_hash` unchanged.
    fn hash_grow(
        &self,
        existing_hash: &Self::Point,
        offset: usize,
        existing_child_at_offset: &Self::Scalar,
        new_children: &[Self::Scalar],
    ) -> Result<Self::Point, CurveError>;

    /// Removes `children` (occupying positions `offset..offset + len`) from a
    /// chunk hash, then writes `child_to_grow_back` at `offset`.
    ///
    /// Exact inverse of [`Curve::hash_grow`] at the same offset when
    /// `child_to_grow_back` is zero.
    fn hash_trim(
        &self,
        existing_hash: &Self::Point,
        offset: usize,
        children: &[Self::Scalar],
        child_to_grow_back: &Self::Scalar,
    ) -> Result<Self::Point, CurveError>;

    /// The affine x-coordinate of `point`, which is a scalar of the other curve.
    /// The identity maps to zero.
    fn point_to_cycle_scalar(&self, point: &Self::Point) -> Self::CycleScalar;

    fn zero_scalar(&self) -> Self::Scalar;

    /// Reduces 32 little-endian bytes into the scalar field.
    fn reduce_scalar_bytes(&self, bytes: &[u8; 32]) -> Self::Scalar;

    fn to_bytes(&self, point: &Self::Point) -> PointBytes;

    fn from_bytes(&self, bytes: &PointBytes) -> Result<Self::Point, CurveError>;

    fn scalar_to_bytes(&self, scalar: &Self::Scalar) -> ScalarBytes;

    /// Parses a canonical scalar encoding.
    fn scalar_from_bytes(&self, bytes: &ScalarBytes) -> Result<Self::Scalar, CurveError>;

    /// Number of generators, i.e. the widest chunk this curve can hash.
    fn chunk_width(&self) -> usize;

    /// Hex encoding of the compressed point.
    fn to_string(&self, point: &Self::Point) -> String {
        hex::encode(self.to_bytes(point))
    }
}
