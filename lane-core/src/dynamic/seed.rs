//! Reproducible per-gene random streams.
//!
//! Every gene gets its own ChaCha stream derived from the run seed and the
//! gene's submission index, so results do not depend on which worker
//! processes the gene or in which order.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub fn gene_rng(seed: u64, gene_index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(gene_index as u64);
    rng
}
