//! Deterministic generator sets for the chunk hash.
//!
//! Every curve of the cycle hashes a chunk of children as
//! `H + Σ children[i] · G[i]`. The generators `G` and the initial point `H` are
//! derived from a seed with a hash-to-curve approach, so anyone can recompute
//! them and no discrete-log relation between them is known.

use ark_ec::short_weierstrass::{Affine, SWCurveConfig};
use ark_ff::PrimeField;
use std::fmt;

/// Value-binding generators plus the hash initialisation point.
///
/// The curve configs carry no trait impls of their own, so the impls below
/// are written without bounds on `P`.
#[allow(non_snake_case)]
pub struct Generators<P: SWCurveConfig> {
    /// One generator per chunk position.
    pub G: Vec<Affine<P>>,
    /// The hash of an empty chunk.
    pub H: Affine<P>,
}

impl<P> Generators<P>
where
    P: SWCurveConfig,
    P::BaseField: PrimeField,
{
    /// Derives `n` position generators and the init point from `seed`.
    #[allow(non_snake_case)]
    pub fn new(n: usize, seed: &[u8]) -> Self {
        // n points for G and 1 for H
        let all_points = generate_random_points::<P>(n + 1, seed);
        assert_dedup(&all_points);

        let (G, h_slice) = all_points.split_at(n);
        Self {
            G: G.to_vec(),
            H: h_slice[0],
        }
    }

    pub fn len(&self) -> usize {
        self.G.len()
    }

    pub fn is_empty(&self) -> bool {
        self.G.is_empty()
    }
}

impl<P: SWCurveConfig> fmt::Debug for Generators<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generators")
            .field("n", &self.G.len())
            .field("H", &self.H)
            .finish()
    }
}

impl<P: SWCurveConfig> Clone for Generators<P> {
    fn clone(&self) -> Self {
        Self {
            G: self.G.clone(),
            H: self.H,
        }
    }
}

impl<P: SWCurveConfig> PartialEq for Generators<P> {
    fn eq(&self, other: &Self) -> bool {
        self.G == other.G && self.H == other.H
    }
}

impl<P: SWCurveConfig> Eq for Generators<P> {}

/// Panics if two generated points coincide; duplicated generators would break
/// the binding property of the chunk hash.
fn assert_dedup<P: SWCurveConfig>(points: &[Affine<P>]) {
    use std::collections::HashSet;
    let mut seen = HashSet::new();
    for point in points {
        assert!(seen.insert(*point), "generator set has duplicated points");
    }
}

/// Try-and-increment hash to curve.
///
/// Each candidate is `SHA-256(seed || index)` read as a base field element;
/// candidates that are not the x-coordinate of a curve point are skipped.
/// Both curves of the cycle have cofactor 1, so every hit is in the prime
/// order group.
fn generate_random_points<P>(num_required_points: usize, seed: &[u8]) -> Vec<Affine<P>>
where
    P: SWCurveConfig,
    P::BaseField: PrimeField,
{
    use sha2::{Digest, Sha256};

    let hash_to_x = |index: u64| -> P::BaseField {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(index.to_be_bytes());
        P::BaseField::from_le_bytes_mod_order(&hasher.finalize())
    };

    (0u64..)
        .map(hash_to_x)
        .filter_map(|x| Affine::<P>::get_point_from_x_unchecked(x, false))
        .take(num_required_points)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_pallas::PallasConfig;

    /// Generation must be a pure function of `(n, seed)`.
    #[test]
    fn generators_are_deterministic() {
        let a = Generators::<PallasConfig>::new(16, b"deterministic");
        let b = Generators::<PallasConfig>::new(16, b"deterministic");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_eq!(a.clone(), a);
        assert!(format!("{a:?}").starts_with("Generators { n: 16"));
    }

    /// A longer set extends a shorter one from the same seed, so widening a
    /// chunk never changes the hash of existing chunks.
    #[test]
    fn generators_are_prefix_stable() {
        let short = generate_random_points::<PallasConfig>(8, b"prefix");
        let long = generate_random_points::<PallasConfig>(20, b"prefix");
        assert_eq!(short[..], long[..8]);
    }

    #[test]
    fn generators_depend_on_seed() {
        let a = Generators::<PallasConfig>::new(4, b"seed-a");
        let b = Generators::<PallasConfig>::new(4, b"seed-b");
        assert_ne!(a.G[0], b.G[0]);
        assert!(a.G.iter().all(|g| g.is_on_curve()));
    }
}
