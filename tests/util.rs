#![allow(dead_code)]
use std::collections::BTreeMap;

use sieve_distributor::algs::communicator::RayonComm;

/// Two ranks attached to the process-global world of size 2.
pub fn rayons() -> (RayonComm, RayonComm) {
    (RayonComm::new(0, 2), RayonComm::new(1, 2))
}

/// Run `f` on `size` in-process ranks and return the per-rank results.
pub fn on_ranks<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(&RayonComm) -> R + Sync,
{
    RayonComm::run(size, f).expect("rayon pool")
}

/// Items rank `q` should get from every other rank, computed from the
/// destination lists of all ranks (the brute-force all-gather).
pub fn expected_sources(dests: &[Vec<i32>], q: usize) -> BTreeMap<usize, usize> {
    let mut out = BTreeMap::new();
    for (p, list) in dests.iter().enumerate() {
        let n = list.iter().filter(|&&d| d == q as i32).count();
        if n > 0 {
            out.insert(p, n);
        }
    }
    out
}

/// Tally of received values (each item carries its origin rank).
pub fn tally(values: &[u64]) -> BTreeMap<usize, usize> {
    let mut out = BTreeMap::new();
    for &v in values {
        *out.entry(v as usize).or_insert(0) += 1;
    }
    out
}

/// Reproducible destination list: `n` items, each either skipped (-1) or
/// bound for a rank in `0..size`.
pub fn random_dests(seed: u64, n: usize, size: usize) -> Vec<i32> {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1..size as i32)).collect()
}

/// Stable reordering of `(dest, value)` pairs grouped by destination.
pub fn grouped<T: Copy>(dests: &[i32], values: &[T]) -> (Vec<i32>, Vec<T>) {
    let mut pairs: Vec<(i32, T)> = dests.iter().copied().zip(values.iter().copied()).collect();
    pairs.sort_by_key(|&(d, _)| d);
    pairs.into_iter().unzip()
}
