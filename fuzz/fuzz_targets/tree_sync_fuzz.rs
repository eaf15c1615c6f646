#![no_main]

use curve25519_dalek::{EdwardsPoint, Scalar};
use curve_trees::{
    constant::ZERO_BLOCK_HASH, CurveTreesConfig, OutputContext, OutputPair, PastaCurveTrees,
    PastaTreeCache, TreeCacheConfig,
};
use libfuzzer_sys::fuzz_target;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tower_cycle::Curve;

/// A step of a wallet following a chain that may reorganize.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Syncs the next block, announcing this many outputs. Every output
    /// unlocks one or two blocks later.
    Sync(u8),

    /// Pops the top block.
    Pop,

    /// Registers the pool output at this index before it unlocks.
    ///
    /// The `u16` index is used modulo the number of outputs announced so far.
    Register(u16),
}

static CURVE_TREES: OnceLock<Arc<PastaCurveTrees>> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    if data.len() < 16 {
        return;
    }

    let seed: u64 = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let operations = generate_operations(seed, &data[8..]);
    e2e_test(seed, &operations);
});

/// Reads an environment variable and parses it, falling back to default if missing or invalid.
fn env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Converts raw fuzzer bytes into operations: the low bits of each byte pick
/// the kind, the rng picks the arguments.
fn generate_operations(seed: u64, data: &[u8]) -> Vec<Operation> {
    let max_outputs_per_block = env("MAX_OUTPUTS_PER_BLOCK", 12u8);
    let mut rng = StdRng::seed_from_u64(seed);
    data.iter()
        .map(|op| match op % 8 {
            0..=3 => Operation::Sync(rng.gen_range(0..=max_outputs_per_block)),
            4 | 5 => Operation::Pop,
            _ => Operation::Register(rng.gen()),
        })
        .collect()
}

fn random_output(rng: &mut StdRng, output_id: u64) -> OutputContext {
    let mut random_point = || {
        let scalar = Scalar::from_bytes_mod_order(rng.gen());
        EdwardsPoint::mul_base(&scalar).compress().to_bytes()
    };
    OutputContext {
        output_id,
        torsion_checked: false,
        output_pair: OutputPair {
            output_pubkey: random_point(),
            commitment: random_point(),
        },
    }
}

fn block_hash(block_idx: u64) -> [u8; 32] {
    let mut hash = [0xabu8; 32];
    hash[..8].copy_from_slice(&block_idx.to_le_bytes());
    hash
}

/// Root of the tree holding `outputs` in this order, computed in a single
/// extension.
fn root_from_scratch(curve_trees: &PastaCurveTrees, outputs: &[OutputContext]) -> Option<[u8; 32]> {
    // A single extension orders leaves by id
    let outputs = outputs
        .iter()
        .enumerate()
        .map(|(i, output)| OutputContext {
            output_id: i as u64,
            ..*output
        })
        .collect();
    let extension = curve_trees
        .get_tree_extension(0, &Default::default(), outputs)
        .expect("extension from scratch");
    let top = extension.n_layers().checked_sub(1)?;
    Some(if top % 2 == 0 {
        curve_trees
            .curve_b
            .to_bytes(&extension.b_layer_extensions[top / 2].hashes[0])
    } else {
        curve_trees
            .curve_a
            .to_bytes(&extension.a_layer_extensions[top / 2].hashes[0])
    })
}

/// Drives a tree cache through the operations and checks it after every step
/// against a tree rebuilt from scratch.
///
/// **Correctness Validation:**
/// - **Root consistency**: the cached root equals the root of all unlocked
///   outputs hashed in one batch.
/// - **Path soundness**: every registered output that unlocked has a path
///   auditing against the current tree; the others have an empty path.
/// - **Reference counts**: every cached chunk is held exactly by the retained
///   blocks and the assigned registered outputs crossing it.
///
/// # Panics
/// Panics if any consistency check fails.
fn e2e_test(seed: u64, operations: &[Operation]) {
    let curve_trees = CURVE_TREES
        .get_or_init(|| {
            let config = CurveTreesConfig {
                a_chunk_width: env("A_CHUNK_WIDTH", 3),
                b_chunk_width: env("B_CHUNK_WIDTH", 2),
                ..Default::default()
            };
            Arc::new(PastaCurveTrees::from_config(&config).expect("valid widths"))
        })
        .clone();
    let config = TreeCacheConfig {
        max_reorg_depth: env("MAX_REORG_DEPTH", 4),
    };
    let mut cache = PastaTreeCache::new(curve_trees.clone(), &config).expect("valid config");
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);

    // Reference state: announced outputs per synced block, with unlock blocks
    let mut announced: Vec<Vec<(u64, OutputContext)>> = vec![];
    let mut registered: Vec<OutputPair> = vec![];
    let mut next_output_id = 0;

    for op in operations {
        match op {
            Operation::Sync(n) => {
                let block_idx = announced.len() as u64;
                let prev_block_hash = match block_idx {
                    0 => ZERO_BLOCK_HASH,
                    _ => block_hash(block_idx - 1),
                };
                let outputs: Vec<_> = (0..*n)
                    .map(|_| {
                        let output = random_output(&mut rng, next_output_id);
                        next_output_id += 1;
                        (block_idx + rng.gen_range(1..=2), output)
                    })
                    .collect();

                let mut outs_by_unlock_block: BTreeMap<u64, Vec<OutputContext>> = BTreeMap::new();
                for (unlock_block_idx, output) in &outputs {
                    outs_by_unlock_block
                        .entry(*unlock_block_idx)
                        .or_default()
                        .push(*output);
                }
                cache
                    .sync_block(block_idx, block_hash(block_idx), prev_block_hash, outs_by_unlock_block)
                    .expect("sync block");
                announced.push(outputs);
            }
            Operation::Pop => {
                // Refused once only the oldest retained block is left
                if cache.pop_block().expect("pop block") {
                    announced.pop();
                    next_output_id = announced.iter().map(Vec::len).sum::<usize>() as u64;
                }
            }
            Operation::Register(idx) => {
                // Only outputs that have not unlocked yet can be registered
                let top = announced.len() as u64;
                let pending: Vec<_> = announced
                    .iter()
                    .flatten()
                    .filter(|(unlock_block_idx, _)| *unlock_block_idx >= top)
                    .collect();
                if pending.is_empty() {
                    continue;
                }
                let (unlock_block_idx, output) = pending[*idx as usize % pending.len()];
                if cache
                    .register_output(&output.output_pair, *unlock_block_idx)
                    .expect("register output")
                {
                    registered.push(output.output_pair);
                }
            }
        }

        // Outputs unlocked by the synced blocks, in the order they entered the tree
        let top = announced.len() as u64;
        let mut unlocked: Vec<_> = announced
            .iter()
            .flatten()
            .filter(|(unlock_block_idx, _)| *unlock_block_idx < top)
            .collect();
        unlocked.sort_by_key(|(unlock_block_idx, output)| (*unlock_block_idx, output.output_id));
        let unlocked: Vec<_> = unlocked.into_iter().map(|(_, output)| *output).collect();

        assert_eq!(cache.get_n_leaf_tuples(), unlocked.len() as u64);
        let root = cache.get_tree_root().expect("tree root").map(|r| r.root);
        assert_eq!(root, root_from_scratch(&curve_trees, &unlocked));
        cache.check_ref_counts().expect("ref counts");

        for output in &registered {
            let path = cache
                .get_output_path(output)
                .expect("output path")
                .expect("registered");
            if unlocked.iter().any(|o| o.output_pair == *output) {
                assert!(curve_trees.audit_path(&path, output, cache.get_n_leaf_tuples()));
            } else {
                assert!(path.is_empty());
            }
        }
    }
}
