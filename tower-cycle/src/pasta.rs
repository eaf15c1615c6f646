//! Pallas and Vesta, the two curves of the Pasta cycle.
//!
//! The base field of Pallas is the scalar field of Vesta and vice versa, so the
//! x-coordinate of a Pallas point is directly usable as a Vesta scalar.
//!
//! # Point encoding
//!
//! Both base fields are 255 bits wide, so a compressed point fits in 32 bytes:
//! the little-endian x-coordinate with the parity of `y` stored in the top bit.
//! The identity encodes as all zeroes. Neither curve has a point with `x = 0`
//! (`b = 5` is a non-residue in both fields), which keeps this unambiguous.

use crate::{
    curve::{Curve, CurveError, PointBytes, ScalarBytes},
    generators::Generators,
};
use ark_ec::{CurveGroup, VariableBaseMSM};
use ark_ff::{BigInteger, PrimeField, Zero};

/// Bit carrying the parity of `y` in a compressed point.
const Y_PARITY_MASK: u8 = 0x80;

/// Canonical little-endian encoding of a prime field element.
fn field_to_bytes<F: PrimeField>(f: &F) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    let le = f.into_bigint().to_bytes_le();
    bytes[..le.len()].copy_from_slice(&le);
    bytes
}

/// Parses a canonical little-endian field element; non-canonical
/// (unreduced) encodings are rejected.
fn field_from_bytes<F: PrimeField>(bytes: &[u8; 32]) -> Option<F> {
    let f = F::from_le_bytes_mod_order(bytes);
    (field_to_bytes(&f) == *bytes).then_some(f)
}

macro_rules! impl_pasta_curve {
    ($name:ident, $krate:ident, $config:ident, $seed:literal) => {
        #[doc = concat!("The ", stringify!($name), " curve with its chunk-hash generators.")]
        #[derive(Debug, Clone)]
        pub struct $name {
            generators: Generators<$krate::$config>,
            init: $krate::Projective,
        }

        impl $name {
            /// Derives `chunk_width` generators (plus the init point) from the
            /// curve's fixed seed.
            pub fn new(chunk_width: usize) -> Self {
                let generators = Generators::new(chunk_width, $seed);
                let init = generators.H.into();
                Self { generators, init }
            }

            fn check_range(&self, offset: usize, len: usize) -> Result<(), CurveError> {
                if offset.checked_add(len).map_or(true, |end| end > self.generators.len()) {
                    return Err(CurveError::ChunkOutOfRange {
                        curve: Self::NAME,
                        offset,
                        len,
                        n_generators: self.generators.len(),
                    });
                }
                Ok(())
            }

            fn invalid_point(bytes: &PointBytes) -> CurveError {
                CurveError::InvalidPoint {
                    curve: Self::NAME,
                    bytes: hex::encode(bytes),
                }
            }
        }

        impl Curve for $name {
            type Scalar = $krate::Fr;
            type Point = $krate::Projective;
            type CycleScalar = $krate::Fq;

            const NAME: &'static str = stringify!($name);

            fn hash_init_point(&self) -> Self::Point {
                self.init
            }

            fn hash_grow(
                &self,
                existing_hash: &Self::Point,
                offset: usize,
                existing_child_at_offset: &Self::Scalar,
                new_children: &[Self::Scalar],
            ) -> Result<Self::Point, CurveError> {
                if new_children.is_empty() {
                    return Ok(*existing_hash);
                }
                self.check_range(offset, new_children.len())?;

                // Replacing the child at `offset` is growing by the difference.
                let mut scalars = new_children.to_vec();
                scalars[0] -= existing_child_at_offset;

                let bases = &self.generators.G[offset..offset + scalars.len()];
                Ok(*existing_hash + $krate::Projective::msm_unchecked(bases, &scalars))
            }

            fn hash_trim(
                &self,
                existing_hash: &Self::Point,
                offset: usize,
                children: &[Self::Scalar],
                child_to_grow_back: &Self::Scalar,
            ) -> Result<Self::Point, CurveError> {
                self.check_range(offset, children.len().max(1))?;

                let mut hash = *existing_hash;
                if !children.is_empty() {
                    let bases = &self.generators.G[offset..offset + children.len()];
                    hash -= $krate::Projective::msm_unchecked(bases, children);
                }
                if !child_to_grow_back.is_zero() {
                    hash += self.generators.G[offset] * *child_to_grow_back;
                }
                Ok(hash)
            }

            fn point_to_cycle_scalar(&self, point: &Self::Point) -> Self::CycleScalar {
                let affine = point.into_affine();
                if affine.infinity {
                    return $krate::Fq::zero();
                }
                affine.x
            }

            fn zero_scalar(&self) -> Self::Scalar {
                $krate::Fr::zero()
            }

            fn reduce_scalar_bytes(&self, bytes: &[u8; 32]) -> Self::Scalar {
                $krate::Fr::from_le_bytes_mod_order(bytes)
            }

            fn to_bytes(&self, point: &Self::Point) -> PointBytes {
                let affine = point.into_affine();
                if affine.infinity {
                    return [0u8; 32];
                }
                let mut bytes = field_to_bytes(&affine.x);
                if affine.y.into_bigint().is_odd() {
                    bytes[31] |= Y_PARITY_MASK;
                }
                bytes
            }

            fn from_bytes(&self, bytes: &PointBytes) -> Result<Self::Point, CurveError> {
                if bytes.iter().all(|b| *b == 0) {
                    return Ok($krate::Projective::zero());
                }

                let y_is_odd = bytes[31] & Y_PARITY_MASK != 0;
                let mut x_bytes = *bytes;
                x_bytes[31] &= !Y_PARITY_MASK;

                let x = field_from_bytes::<$krate::Fq>(&x_bytes)
                    .ok_or_else(|| Self::invalid_point(bytes))?;
                let (y0, y1) = $krate::Affine::get_ys_from_x_unchecked(x)
                    .ok_or_else(|| Self::invalid_point(bytes))?;
                let y = if y0.into_bigint().is_odd() == y_is_odd { y0 } else { y1 };

                // Both curves have cofactor 1: any point on the curve is in the group.
                Ok($krate::Affine::new_unchecked(x, y).into())
            }

            fn scalar_to_bytes(&self, scalar: &Self::Scalar) -> ScalarBytes {
                field_to_bytes(scalar)
            }

            fn scalar_from_bytes(&self, bytes: &ScalarBytes) -> Result<Self::Scalar, CurveError> {
                field_from_bytes(bytes).ok_or_else(|| CurveError::InvalidScalar {
                    curve: Self::NAME,
                    bytes: hex::encode(bytes),
                })
            }

            fn chunk_width(&self) -> usize {
                self.generators.len()
            }
        }
    };
}

impl_pasta_curve!(Pallas, ark_pallas, PallasConfig, b"tower-cycle/pallas/chunk-hash");
impl_pasta_curve!(Vesta, ark_vesta, VestaConfig, b"tower-cycle/vesta/chunk-hash");

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::UniformRand;
    use rand::{rngs::StdRng, SeedableRng};

    fn random_scalars(rng: &mut StdRng, n: usize) -> Vec<ark_pallas::Fr> {
        (0..n).map(|_| ark_pallas::Fr::rand(rng)).collect()
    }

    #[test]
    fn grow_matches_single_shot_hash() {
        let pallas = Pallas::new(8);
        let mut rng = StdRng::seed_from_u64(7);
        let children = random_scalars(&mut rng, 6);
        let zero = pallas.zero_scalar();

        let init = pallas.hash_init_point();
        let all_at_once = pallas.hash_grow(&init, 0, &zero, &children).unwrap();

        let first = pallas.hash_grow(&init, 0, &zero, &children[..2]).unwrap();
        let rest = pallas.hash_grow(&first, 2, &zero, &children[2..]).unwrap();
        assert_eq!(all_at_once, rest);
    }

    #[test]
    fn grow_replaces_existing_child() {
        let pallas = Pallas::new(4);
        let mut rng = StdRng::seed_from_u64(8);
        let c = random_scalars(&mut rng, 3);
        let zero = pallas.zero_scalar();
        let init = pallas.hash_init_point();

        let before = pallas.hash_grow(&init, 0, &zero, &c[..2]).unwrap();
        // overwrite position 1 with c[2]
        let updated = pallas.hash_grow(&before, 1, &c[1], &c[2..3]).unwrap();
        let expected = pallas.hash_grow(&init, 0, &zero, &[c[0], c[2]]).unwrap();
        assert_eq!(updated, expected);
    }

    #[test]
    fn trim_inverts_grow() {
        let vesta = Vesta::new(8);
        let mut rng = StdRng::seed_from_u64(9);
        let c: Vec<ark_vesta::Fr> = (0..5).map(|_| ark_vesta::Fr::rand(&mut rng)).collect();
        let zero = vesta.zero_scalar();
        let init = vesta.hash_init_point();

        let full = vesta.hash_grow(&init, 0, &zero, &c).unwrap();
        let trimmed = vesta.hash_trim(&full, 3, &c[3..], &zero).unwrap();
        let prefix = vesta.hash_grow(&init, 0, &zero, &c[..3]).unwrap();
        assert_eq!(trimmed, prefix);

        // trim and write a new last child in one step
        let replacement = ark_vesta::Fr::rand(&mut rng);
        let swapped = vesta.hash_trim(&full, 2, &c[2..], &replacement).unwrap();
        let expected = vesta
            .hash_grow(&init, 0, &zero, &[c[0], c[1], replacement])
            .unwrap();
        assert_eq!(swapped, expected);
    }

    #[test]
    fn empty_grow_is_identity() {
        let pallas = Pallas::new(2);
        let init = pallas.hash_init_point();
        let zero = pallas.zero_scalar();
        assert_eq!(pallas.hash_grow(&init, 5, &zero, &[]).unwrap(), init);
    }

    #[test]
    fn out_of_range_offset_fails() {
        let pallas = Pallas::new(4);
        let init = pallas.hash_init_point();
        let zero = pallas.zero_scalar();
        let one = ark_pallas::Fr::from(1u64);
        assert_eq!(
            pallas.hash_grow(&init, 3, &zero, &[one, one]),
            Err(CurveError::ChunkOutOfRange {
                curve: "Pallas",
                offset: 3,
                len: 2,
                n_generators: 4,
            })
        );
        assert!(pallas.hash_trim(&init, 4, &[], &one).is_err());
    }

    #[test]
    fn point_bytes_roundtrip() {
        let pallas = Pallas::new(4);
        let mut rng = StdRng::seed_from_u64(10);
        let zero = pallas.zero_scalar();
        for _ in 0..16 {
            let children = random_scalars(&mut rng, 4);
            let point = pallas
                .hash_grow(&pallas.hash_init_point(), 0, &zero, &children)
                .unwrap();
            let bytes = pallas.to_bytes(&point);
            assert_eq!(pallas.from_bytes(&bytes).unwrap(), point);
        }

        let identity = ark_pallas::Projective::zero();
        assert_eq!(pallas.to_bytes(&identity), [0u8; 32]);
        assert_eq!(pallas.from_bytes(&[0u8; 32]).unwrap(), identity);
        assert_eq!(pallas.point_to_cycle_scalar(&identity), ark_pallas::Fq::zero());
    }

    #[test]
    fn rejects_malformed_encodings() {
        let vesta = Vesta::new(2);
        assert!(vesta.from_bytes(&[0xff; 32]).is_err());
        assert!(vesta.scalar_from_bytes(&[0xff; 32]).is_err());

        let s = ark_vesta::Fr::from(42u64);
        let bytes = vesta.scalar_to_bytes(&s);
        assert_eq!(vesta.scalar_from_bytes(&bytes).unwrap(), s);
    }

    #[test]
    fn curves_are_debug_and_clone() {
        let pallas = Pallas::new(3);
        let copy = pallas.clone();
        assert_eq!(copy.hash_init_point(), pallas.hash_init_point());
        assert!(format!("{:?}", Vesta::new(2)).starts_with("Vesta"));
    }

    /// The x-coordinate of a Pallas point must be usable as a Vesta scalar.
    #[test]
    fn cycle_scalar_feeds_other_curve() {
        let pallas = Pallas::new(2);
        let vesta = Vesta::new(2);
        let x = pallas.point_to_cycle_scalar(&pallas.hash_init_point());
        let zero = vesta.zero_scalar();
        let h = vesta
            .hash_grow(&vesta.hash_init_point(), 0, &zero, &[x])
            .unwrap();
        assert_ne!(h, vesta.hash_init_point());
    }
}
