// Shared plumbing for the sequential models: a seeded xorshift generator
// (threaded by value into every stochastic component — no process-global
// RNG state), Gaussian initialisation, and a CSR lookup over per-user
// sorted item lists.

pub(crate) struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { 0xbad5eed } else { seed } }
    }

    #[inline(always)]
    pub(crate) fn next(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    #[inline(always)]
    pub(crate) fn next_usize(&mut self, n: usize) -> usize {
        (self.next() as usize) % n
    }

    #[inline(always)]
    pub(crate) fn next_f32(&mut self) -> f32 {
        (self.next() & 0xFFFFFF) as f32 / 0xFFFFFF_u64 as f32
    }

    #[inline(always)]
    pub(crate) fn next_f32_range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + self.next_f32() * (hi - lo)
    }
}

/// Fill a fresh vector with N(0, scale²) samples via Box-Muller.
pub(crate) fn randn_vec(rng: &mut XorShift64, n: usize, scale: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let u = rng.next_f32_range(1e-7, 1.0);
        let v = rng.next_f32_range(0.0, std::f32::consts::TAU);
        let z = (-2.0 * u.ln()).sqrt() * v.cos();
        out.push(z * scale);
    }
    out
}

/// In-place Fisher-Yates shuffle.
pub(crate) fn shuffle(rng: &mut XorShift64, xs: &mut [usize]) {
    for i in (1..xs.len()).rev() {
        let j = rng.next_usize(i + 1);
        xs.swap(i, j);
    }
}

// ── CSR lookup over per-user sorted item id lists ──────────────────────────
// Rows are sorted and deduplicated at build time so membership checks are
// a binary search.

pub(crate) struct SeenLookup {
    indptr: Vec<i64>,
    indices: Vec<i32>,
}

impl SeenLookup {
    pub(crate) fn from_rows(rows: &[Vec<i32>]) -> Self {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        indptr.push(0i64);
        for row in rows {
            let mut sorted = row.clone();
            sorted.sort_unstable();
            sorted.dedup();
            indices.extend_from_slice(&sorted);
            indptr.push(indices.len() as i64);
        }
        Self { indptr, indices }
    }

    #[inline]
    pub(crate) fn contains(&self, u: usize, item: i32) -> bool {
        self.row(u).binary_search(&item).is_ok()
    }

    #[inline]
    pub(crate) fn row(&self, u: usize) -> &[i32] {
        let start = self.indptr[u] as usize;
        let end = self.indptr[u + 1] as usize;
        &self.indices[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_deterministic_per_seed() {
        let mut a = XorShift64::new(42);
        let mut b = XorShift64::new(42);
        for _ in 0..100 {
            assert_eq!(a.next(), b.next());
        }
        let mut c = XorShift64::new(43);
        assert_ne!(XorShift64::new(42).next(), c.next());
    }

    #[test]
    fn randn_vec_has_reasonable_spread() {
        let mut rng = XorShift64::new(7);
        let xs = randn_vec(&mut rng, 10_000, 1.0);
        let mean: f32 = xs.iter().sum::<f32>() / xs.len() as f32;
        let var: f32 = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / xs.len() as f32;
        assert!(mean.abs() < 0.05, "mean={mean}");
        assert!((var - 1.0).abs() < 0.1, "var={var}");
        assert!(xs.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn shuffle_permutes_without_loss() {
        let mut rng = XorShift64::new(99);
        let mut xs: Vec<usize> = (0..50).collect();
        shuffle(&mut rng, &mut xs);
        let mut sorted = xs.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn seen_lookup_sorts_and_dedups() {
        let lookup = SeenLookup::from_rows(&[vec![3, 1, 3, 2], vec![], vec![5]]);
        assert_eq!(lookup.row(0), &[1, 2, 3]);
        assert!(lookup.contains(0, 2));
        assert!(!lookup.contains(0, 4));
        assert!(lookup.row(1).is_empty());
        assert!(lookup.contains(2, 5));
    }
}
