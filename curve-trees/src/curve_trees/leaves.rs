//! Conversion of outputs into leaf tuples.
//!
//! An output `(O, C)` contributes three curve-B scalars to the leaf layer:
//! the Montgomery u-coordinates of `O`, of the key-image generator `I`
//! derived from `O`, and of `C`, each reduced into the scalar field of B.
//!
//! `O` and `C` must decompress to points that are neither the identity nor of
//! small order. Unless the output is flagged `torsion_checked`, both points
//! are projected onto the prime-order subgroup first.

use crate::{
    constant::{KEY_IMAGE_GENERATOR_DOMAIN, LEAF_TUPLE_SIZE, MAX_HASH_TO_POINT_TRIES},
    curve_trees::{CurveTrees, LeafTuple},
    types::{ConversionError, OutputContext, OutputPair},
};
use curve25519_dalek::{
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
    traits::IsIdentity,
};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use tower_cycle::Curve;
use tracing::debug;

/// `1/8 mod l`, used to clear the torsion component of a point.
static INV_EIGHT: Lazy<Scalar> = Lazy::new(|| Scalar::from(8u8).invert());

/// Decompresses a point that is usable as (part of) a leaf.
fn decompress(bytes: &[u8; 32], what: &'static str) -> Result<EdwardsPoint, ConversionError> {
    let point = CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or(ConversionError::Decompress { what })?;
    if point.is_identity() {
        return Err(ConversionError::Identity { what });
    }
    if point.is_small_order() {
        return Err(ConversionError::SmallOrder { what });
    }
    Ok(point)
}

/// Projects `point` onto the prime-order subgroup: `(8 * P) / 8`.
fn clear_torsion(point: EdwardsPoint, torsion_checked: bool) -> EdwardsPoint {
    if torsion_checked || point.is_torsion_free() {
        return point;
    }
    point.mul_by_cofactor() * *INV_EIGHT
}

/// Try-and-increment hash to a prime-order ed25519 point.
fn hash_to_point(bytes: &[u8; 32]) -> Result<EdwardsPoint, ConversionError> {
    for counter in 0..MAX_HASH_TO_POINT_TRIES {
        let mut hasher = Sha256::new();
        hasher.update(KEY_IMAGE_GENERATOR_DOMAIN);
        hasher.update(bytes);
        hasher.update([counter as u8]);
        let candidate: [u8; 32] = hasher.finalize().into();

        let Some(point) = CompressedEdwardsY(candidate).decompress() else {
            continue;
        };
        let point = point.mul_by_cofactor();
        if !point.is_identity() {
            return Ok(point);
        }
    }
    Err(ConversionError::HashToPoint {
        tries: MAX_HASH_TO_POINT_TRIES,
    })
}

impl<A, B> CurveTrees<A, B>
where
    A: Curve<CycleScalar = <B as Curve>::Scalar>,
    B: Curve<CycleScalar = <A as Curve>::Scalar>,
{
    fn point_to_leaf_scalar(&self, point: &EdwardsPoint) -> B::Scalar {
        self.curve_b
            .reduce_scalar_bytes(&point.to_montgomery().to_bytes())
    }

    fn convert(
        &self,
        output_pair: &OutputPair,
        torsion_checked: bool,
    ) -> Result<LeafTuple<B::Scalar>, ConversionError> {
        let o = decompress(&output_pair.output_pubkey, "output pubkey")?;
        let c = decompress(&output_pair.commitment, "commitment")?;
        // I is bound to the encoding of O as received, before any torsion clearing.
        let i = hash_to_point(&output_pair.output_pubkey)?;

        let o = clear_torsion(o, torsion_checked);
        let c = clear_torsion(c, torsion_checked);

        Ok(LeafTuple {
            o_x: self.point_to_leaf_scalar(&o),
            i_x: self.point_to_leaf_scalar(&i),
            c_x: self.point_to_leaf_scalar(&c),
        })
    }

    /// Converts an output into its leaf tuple, always clearing torsion.
    pub fn leaf_tuple(
        &self,
        output_pair: &OutputPair,
    ) -> Result<LeafTuple<B::Scalar>, ConversionError> {
        self.convert(output_pair, false)
    }

    /// Converts an output into its leaf tuple, skipping torsion clearing for
    /// outputs flagged as already checked.
    pub fn output_to_leaf_tuple(
        &self,
        output: &OutputContext,
    ) -> Result<LeafTuple<B::Scalar>, ConversionError> {
        self.convert(&output.output_pair, output.torsion_checked)
    }

    /// Lays leaf tuples out as leaf-layer scalars.
    pub fn flatten_leaves(&self, leaves: &[LeafTuple<B::Scalar>]) -> Vec<B::Scalar> {
        let mut flat = Vec::with_capacity(leaves.len() * LEAF_TUPLE_SIZE);
        for leaf in leaves {
            flat.extend([leaf.o_x, leaf.i_x, leaf.c_x]);
        }
        flat
    }

    /// Converts a batch of outputs in parallel and drops the ones that fail.
    ///
    /// Returns the flattened leaf scalars and the outputs that produced them,
    /// in input order.
    pub fn set_valid_leaves(
        &self,
        new_outputs: Vec<OutputContext>,
    ) -> (Vec<B::Scalar>, Vec<OutputContext>) {
        let converted = self.par_map(&new_outputs, |output| self.output_to_leaf_tuple(output));

        let mut leaves = Vec::with_capacity(converted.len());
        let mut valid_outputs = Vec::with_capacity(converted.len());
        for (output, result) in new_outputs.into_iter().zip(converted) {
            match result {
                Ok(leaf) => {
                    leaves.push(leaf);
                    valid_outputs.push(output);
                }
                Err(err) => debug!(output_id = output.output_id, %err, "skipping invalid output"),
            }
        }

        (self.flatten_leaves(&leaves), valid_outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve_trees::test_utils::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn torsion_fast_path_matches_naive_conversion() {
        let curve_trees = test_curve_trees(4, 4);
        let mut rng = StdRng::seed_from_u64(1);
        for output in random_outputs(&mut rng, 0, 8) {
            let naive = curve_trees.leaf_tuple(&output.output_pair).unwrap();
            let checked = OutputContext {
                torsion_checked: true,
                ..output
            };
            assert_eq!(curve_trees.output_to_leaf_tuple(&output).unwrap(), naive);
            assert_eq!(curve_trees.output_to_leaf_tuple(&checked).unwrap(), naive);
        }
    }

    /// Adding a torsion component to `O` changes neither `o_x` nor `c_x`, but
    /// `I` is derived from the received encoding and does change.
    #[test]
    fn torsion_is_cleared() {
        let curve_trees = test_curve_trees(4, 4);
        let mut rng = StdRng::seed_from_u64(2);
        let output = random_outputs(&mut rng, 0, 1)[0];

        let o = CompressedEdwardsY(output.output_pair.output_pubkey)
            .decompress()
            .unwrap();
        let torsioned = OutputPair {
            output_pubkey: (o + small_order_point()).compress().to_bytes(),
            commitment: output.output_pair.commitment,
        };

        let clean = curve_trees.leaf_tuple(&output.output_pair).unwrap();
        let cleared = curve_trees.leaf_tuple(&torsioned).unwrap();
        assert_eq!(clean.o_x, cleared.o_x);
        assert_eq!(clean.c_x, cleared.c_x);
        assert_ne!(clean.i_x, cleared.i_x);
    }

    #[test]
    fn rejects_invalid_points() {
        let curve_trees = test_curve_trees(4, 4);
        let mut rng = StdRng::seed_from_u64(3);
        let valid = random_outputs(&mut rng, 0, 1)[0].output_pair;

        let identity = EdwardsPoint::default().compress().to_bytes();
        let with_identity = OutputPair {
            commitment: identity,
            ..valid
        };
        assert_eq!(
            curve_trees.leaf_tuple(&with_identity),
            Err(ConversionError::Identity { what: "commitment" })
        );

        let small_order = OutputPair {
            output_pubkey: small_order_point().compress().to_bytes(),
            ..valid
        };
        assert_eq!(
            curve_trees.leaf_tuple(&small_order),
            Err(ConversionError::SmallOrder {
                what: "output pubkey"
            })
        );

        // y = 2 is not on the curve
        let mut not_on_curve = [0u8; 32];
        not_on_curve[0] = 2;
        let bad = OutputPair {
            output_pubkey: not_on_curve,
            ..valid
        };
        assert!(curve_trees.leaf_tuple(&bad).is_err());
    }

    #[test]
    fn set_valid_leaves_drops_failures() {
        let curve_trees = test_curve_trees(4, 4).with_min_par_batch_size(2);
        let mut rng = StdRng::seed_from_u64(4);
        let mut outputs = random_outputs(&mut rng, 0, 6);
        outputs[2].output_pair.commitment = EdwardsPoint::default().compress().to_bytes();

        let (scalars, valid) = curve_trees.set_valid_leaves(outputs.clone());
        assert_eq!(valid.len(), 5);
        assert_eq!(scalars.len(), 5 * LEAF_TUPLE_SIZE);
        assert!(valid.iter().all(|o| o.output_id != 2));

        let kept = curve_trees.leaf_tuple(&outputs[3].output_pair).unwrap();
        assert_eq!(&scalars[6..9], &[kept.o_x, kept.i_x, kept.c_x]);
    }
}
