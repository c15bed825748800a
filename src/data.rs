// Sequence windows and splits for next-item training and evaluation.
//
// Each user's chronological history s[0..n] is split leave-two-out:
//   train: input s[0..n-3], next-item target per position s[1..n-2]
//   valid: input s[0..n-2], answer s[n-2]
//   test:  input s[0..n-1], answer s[n-1]
// Windows are left-padded with id 0 and truncated to the most recent
// `max_seq_len` items. Evaluation excludes already-seen items per user:
// validation masks training items, test masks training + validation items.

use crate::common::{SeenLookup, XorShift64};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EvalSplit {
    Valid,
    Test,
}

pub(crate) struct TrainWindow {
    /// Length `max_seq_len`, left-padded with 0.
    pub input: Vec<i32>,
    /// `targets[t]` is the next item after `input[t]`; 0 where no target.
    pub targets: Vec<i32>,
}

pub(crate) struct EvalInstance {
    pub input: Vec<i32>,
    pub answer: i32,
}

pub(crate) struct SequenceDataset {
    user_seqs: Vec<Vec<i32>>,
    n_items: usize,
    max_seq_len: usize,
    seen: SeenLookup,
    valid_excl: SeenLookup,
    test_excl: SeenLookup,
}

const NEG_SAMPLE_RETRIES: usize = 100;

impl SequenceDataset {
    pub(crate) fn new(
        user_seqs: Vec<Vec<i32>>,
        n_items: usize,
        max_seq_len: usize,
    ) -> Result<Self, String> {
        if n_items == 0 {
            return Err("n_items must be at least 1".to_string());
        }
        if max_seq_len == 0 {
            return Err("max_seq_len must be at least 1".to_string());
        }
        for (u, seq) in user_seqs.iter().enumerate() {
            for &item in seq {
                if item < 1 || item as usize > n_items {
                    return Err(format!(
                        "User {} has item id {} outside the valid range [1, {}]; 0 is reserved padding.",
                        u, item, n_items
                    ));
                }
            }
        }

        let valid_rows: Vec<Vec<i32>> = user_seqs
            .iter()
            .map(|s| s[..s.len().saturating_sub(2)].to_vec())
            .collect();
        let test_rows: Vec<Vec<i32>> = user_seqs
            .iter()
            .map(|s| s[..s.len().saturating_sub(1)].to_vec())
            .collect();

        Ok(Self {
            seen: SeenLookup::from_rows(&user_seqs),
            valid_excl: SeenLookup::from_rows(&valid_rows),
            test_excl: SeenLookup::from_rows(&test_rows),
            user_seqs,
            n_items,
            max_seq_len,
        })
    }

    pub(crate) fn n_users(&self) -> usize {
        self.user_seqs.len()
    }

    pub(crate) fn n_items(&self) -> usize {
        self.n_items
    }

    pub(crate) fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub(crate) fn exclusions(&self, split: EvalSplit) -> &SeenLookup {
        match split {
            EvalSplit::Valid => &self.valid_excl,
            EvalSplit::Test => &self.test_excl,
        }
    }

    /// Training window for a user, or None when the history is too short to
    /// contain a single (input, next-item) transition.
    pub(crate) fn train_window(&self, u: usize) -> Option<TrainWindow> {
        let seq = &self.user_seqs[u];
        let n = seq.len();
        if n < 4 {
            return None;
        }
        let core = &seq[..n - 2];
        let pairs = core.len() - 1;
        let w = pairs.min(self.max_seq_len);
        let start = pairs - w;
        let mut input = vec![0i32; self.max_seq_len];
        let mut targets = vec![0i32; self.max_seq_len];
        let pad = self.max_seq_len - w;
        for j in 0..w {
            input[pad + j] = core[start + j];
            targets[pad + j] = core[start + j + 1];
        }
        Some(TrainWindow { input, targets })
    }

    /// Held-out evaluation instance for a user, or None when too short.
    pub(crate) fn eval_instance(&self, u: usize, split: EvalSplit) -> Option<EvalInstance> {
        let seq = &self.user_seqs[u];
        let n = seq.len();
        if n < 3 {
            return None;
        }
        let (region, answer) = match split {
            EvalSplit::Valid => (&seq[..n - 2], seq[n - 2]),
            EvalSplit::Test => (&seq[..n - 1], seq[n - 1]),
        };
        let w = region.len().min(self.max_seq_len);
        let mut input = vec![0i32; self.max_seq_len];
        let pad = self.max_seq_len - w;
        input[pad..].copy_from_slice(&region[region.len() - w..]);
        Some(EvalInstance { input, answer })
    }

    /// Uniform negative sample for a user, rejecting items present anywhere
    /// in the user's history (bounded retries).
    pub(crate) fn sample_negative(&self, u: usize, rng: &mut XorShift64) -> i32 {
        let mut j = (rng.next_usize(self.n_items) + 1) as i32;
        for _ in 0..NEG_SAMPLE_RETRIES {
            if !self.seen.contains(u, j) {
                break;
            }
            j = (rng.next_usize(self.n_items) + 1) as i32;
        }
        j
    }

    /// Users with at least one training transition.
    pub(crate) fn trainable_users(&self) -> Vec<usize> {
        (0..self.user_seqs.len())
            .filter(|&u| self.user_seqs[u].len() >= 4)
            .collect()
    }
}
