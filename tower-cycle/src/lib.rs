//! A 2-cycle of elliptic curves with incremental Pedersen-style chunk hashing.
//!
//! [`Curve`] is the capability the curve-tree algorithms are generic over;
//! [`Pallas`] and [`Vesta`] implement it.

pub mod curve;
pub mod generators;
pub mod pasta;

pub use curve::{Curve, CurveError, PointBytes, ScalarBytes};
pub use generators::Generators;
pub use pasta::{Pallas, Vesta};
