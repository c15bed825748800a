// Training and evaluation driver for the distributional sequential models.
//
// One logical thread of control: train an epoch (per-batch gradient
// accumulation in parallel, sequential Adam apply), validate full-sort,
// feed the primary metric (MRR) to the early-stopping observer, keep the
// best parameter snapshot, and finally score the held-out test split.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::time::Instant;

use ahash::AHashMap;
use numpy::{PyArray1, PyArray2, PyArrayMethods};
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::common::{shuffle, XorShift64};
use crate::data::{EvalInstance, EvalSplit, SequenceDataset};
use crate::dist::{
    accumulate_distance_grads, distance, score_from_distance, sigma_activate_grad, DistanceMetric,
};
use crate::distsa::{DistSaConfig, DistSaParams, Dropout, ModelVariant};
use crate::metrics::{hit_at_k_from_rank, ndcg_at_k_from_rank, reciprocal_rank};

const CHECKPOINT_VERSION: u32 = 1;
/// Users are scored in bounded chunks so full-sort evaluation holds at most
/// one chunk of per-user score vectors alive at a time.
const EVAL_CHUNK: usize = 256;
const SAMPLED_EVAL_NEGATIVES: usize = 99;

// ── Early stopping ──────────────────────────────────────────────────────────

/// Observes one validation score per epoch (higher is better). Raises its
/// stop flag after `patience` consecutive non-improving epochs; the caller
/// polls the flag and owns the decision to halt.
pub(crate) struct EarlyStopping {
    patience: usize,
    delta: f32,
    best: f32,
    stale: usize,
    stop: bool,
}

impl EarlyStopping {
    pub(crate) fn new(patience: usize, delta: f32) -> Self {
        Self { patience, delta, best: f32::NEG_INFINITY, stale: 0, stop: false }
    }

    /// Returns true when the score improved (the caller persists the model).
    pub(crate) fn observe(&mut self, score: f32) -> bool {
        if score > self.best + self.delta {
            self.best = score;
            self.stale = 0;
            true
        } else {
            self.stale += 1;
            if self.stale >= self.patience {
                self.stop = true;
            }
            false
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop
    }

    pub(crate) fn best(&self) -> f32 {
        self.best
    }
}

// ── Evaluation outcome ──────────────────────────────────────────────────────

pub(crate) struct UserPrediction {
    pub user: usize,
    pub answer: i32,
    /// 0-indexed rank of the answer among non-excluded candidates.
    pub rank: usize,
    pub top: Vec<i32>,
}

pub(crate) struct EvalOutcome {
    /// [HIT@5, NDCG@5, HIT@10, NDCG@10, MRR]; the last element drives
    /// early stopping.
    pub scores: [f32; 5],
    pub result_info: String,
    pub details: Option<Vec<UserPrediction>>,
}

// ── Adam (lazy moments over the embedding tables) ───────────────────────────

struct AdamTable {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl AdamTable {
    fn new(len: usize) -> Self {
        Self { m: vec![0.0; len], v: vec![0.0; len] }
    }
}

struct AdamState {
    item_mean: AdamTable,
    item_sigma: AdamTable,
    pos_mean: AdamTable,
    pos_sigma: AdamTable,
    t: u64,
}

#[allow(clippy::too_many_arguments)]
fn adam_update(
    p: &mut [f32],
    m: &mut [f32],
    v: &mut [f32],
    g: &[f32],
    lr: f32,
    b1: f32,
    b2: f32,
    wd: f32,
    bc1: f32,
    bc2: f32,
) {
    for f in 0..p.len() {
        let grad = g[f] + wd * p[f];
        m[f] = b1 * m[f] + (1.0 - b1) * grad;
        v[f] = b2 * v[f] + (1.0 - b2) * grad * grad;
        let mh = m[f] / bc1;
        let vh = v[f] / bc2;
        p[f] -= lr * mh / (vh.sqrt() + 1e-8);
    }
}

// ── Per-user gradient contribution (sparse rows) ────────────────────────────

#[derive(Default)]
struct UserGrads {
    item_mean: Vec<(usize, Vec<f32>)>,
    item_sigma: Vec<(usize, Vec<f32>)>,
    pos_mean: Vec<(usize, Vec<f32>)>,
    pos_sigma: Vec<(usize, Vec<f32>)>,
    rec_loss: f64,
    pvn_loss: f64,
    n_positions: usize,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub(crate) struct DistSaTrainer {
    pub(crate) config: DistSaConfig,
    dataset: SequenceDataset,
    pub(crate) params: DistSaParams,
    adam: AdamState,
    best_params: Option<DistSaParams>,
    rng: XorShift64,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    version: u32,
    params: DistSaParams,
}

impl DistSaTrainer {
    pub(crate) fn new(config: DistSaConfig, dataset: SequenceDataset) -> Result<Self, String> {
        config.validate()?;
        if config.n_items != dataset.n_items() {
            return Err(format!(
                "Item vocabulary mismatch: model configured for {} items, dataset has {}.",
                config.n_items,
                dataset.n_items()
            ));
        }
        if config.max_seq_len != dataset.max_seq_len() {
            return Err(format!(
                "Window length mismatch: model configured for {}, dataset windows are {}.",
                config.max_seq_len,
                dataset.max_seq_len()
            ));
        }
        let mut rng = XorShift64::new(config.seed);
        let params = DistSaParams::new(&config, &mut rng);
        let d = config.hidden_size;
        let adam = AdamState {
            item_mean: AdamTable::new((config.n_items + 1) * d),
            item_sigma: AdamTable::new((config.n_items + 1) * d),
            pos_mean: AdamTable::new(config.max_seq_len * d),
            pos_sigma: AdamTable::new(config.max_seq_len * d),
            t: 0,
        };
        Ok(Self { config, dataset, params, adam, best_params: None, rng })
    }

    pub(crate) fn dataset(&self) -> &SequenceDataset {
        &self.dataset
    }

    /// One training epoch. Returns (mean ranking loss, mean pvn penalty)
    /// over all valid positions.
    pub(crate) fn train(&mut self, epoch: usize) -> (f32, f32) {
        let mut order = self.dataset.trainable_users();
        shuffle(&mut self.rng, &mut order);

        let mut rec_sum = 0.0f64;
        let mut pvn_sum = 0.0f64;
        let mut n_total = 0usize;

        let batch_size = self.config.batch_size;
        for batch in order.chunks(batch_size) {
            let grads: Vec<UserGrads> =
                batch.par_iter().map(|&u| self.user_grads(u, epoch)).collect();
            for g in &grads {
                rec_sum += g.rec_loss;
                pvn_sum += g.pvn_loss;
                n_total += g.n_positions;
            }
            self.apply_grads(&grads);
        }

        if n_total == 0 {
            return (0.0, 0.0);
        }
        ((rec_sum / n_total as f64) as f32, (pvn_sum / n_total as f64) as f32)
    }

    /// Forward one user's training window and collect sparse gradients for
    /// the embedding tables. The context-side gradient is applied through
    /// the input path at each position (simplified update, as in the
    /// point-embedding SASRec trainer).
    fn user_grads(&self, u: usize, epoch: usize) -> UserGrads {
        let cfg = &self.config;
        let d = cfg.hidden_size;
        let metric = cfg.distance_metric;
        let mean_only = cfg.variant.mean_only();
        let kernel = cfg.kernel_param;
        let floor = cfg.sigma_floor;

        let Some(w) = self.dataset.train_window(u) else {
            return UserGrads::default();
        };
        let mut rng = XorShift64::new(
            cfg.seed.wrapping_add(epoch as u64 * 997).wrapping_add(u as u64 * 131),
        );

        let ctx = self.params.forward(
            &w.input,
            floor,
            Some(Dropout {
                rng: &mut rng,
                attn_p: cfg.attn_dropout_prob,
                hidden_p: cfg.hidden_dropout_prob,
            }),
        );

        let mut out = UserGrads::default();
        let mut ps = vec![0.0f32; d];
        let mut ns = vec![0.0f32; d];

        for t in 0..cfg.max_seq_len {
            let pos = w.targets[t];
            if pos == 0 {
                continue;
            }
            let pos = pos as usize;
            let neg = self.dataset.sample_negative(u, &mut rng) as usize;
            let input_item = w.input[t] as usize;

            let cm = &ctx.mean[t * d..(t + 1) * d];
            let cs = &ctx.sigma[t * d..(t + 1) * d];
            let pm = self.params.item_mean_row(pos);
            let nm = self.params.item_mean_row(neg);
            self.params.item_sigma_activated(pos, floor, &mut ps);
            self.params.item_sigma_activated(neg, floor, &mut ns);

            let dist_pos = distance(metric, mean_only, cm, cs, pm, &ps);
            let dist_neg = distance(metric, mean_only, cm, cs, nm, &ns);
            let s_pos = score_from_distance(dist_pos, kernel);
            let s_neg = score_from_distance(dist_neg, kernel);
            let diff = s_pos - s_neg;
            let sig = 1.0 / (1.0 + (-diff).exp());
            out.rec_loss += -((sig + 1e-24).ln()) as f64;

            // dL/ddist: ranking term pushes dist_pos down and dist_neg up.
            let mut c_pos = (1.0 - sig) / kernel;
            let c_neg = -(1.0 - sig) / kernel;

            // pvn penalty: the positive item should sit closer to the
            // context than it sits to the sampled negative.
            let mut c_pn = 0.0f32;
            if cfg.pvn_weight > 0.0 {
                let dist_pn = distance(metric, mean_only, pm, &ps, nm, &ns);
                let margin = dist_pos - dist_pn;
                if margin > 0.0 {
                    out.pvn_loss += (cfg.pvn_weight * margin) as f64;
                    c_pos += cfg.pvn_weight;
                    c_pn = -cfg.pvn_weight;
                }
            }

            let mut gcm = vec![0.0f32; d];
            let mut gcs = vec![0.0f32; d];
            let mut gpm = vec![0.0f32; d];
            let mut gps = vec![0.0f32; d];
            let mut gnm = vec![0.0f32; d];
            let mut gns = vec![0.0f32; d];

            accumulate_distance_grads(
                metric, mean_only, cm, cs, pm, &ps, c_pos, &mut gcm, &mut gcs, &mut gpm, &mut gps,
            );
            accumulate_distance_grads(
                metric, mean_only, cm, cs, nm, &ns, c_neg, &mut gcm, &mut gcs, &mut gnm, &mut gns,
            );
            if c_pn != 0.0 {
                accumulate_distance_grads(
                    metric, mean_only, pm, &ps, nm, &ns, c_pn, &mut gpm, &mut gps, &mut gnm,
                    &mut gns,
                );
            }

            // chain sigma gradients through the ELU+1 activation at the raw
            // parameters; context sigma flows to the input-path raws
            let pos_raw = self.params.item_sigma_row(pos);
            let neg_raw = self.params.item_sigma_row(neg);
            let in_raw = self.params.item_sigma_row(input_item);
            let posn_raw = &self.params.pos_sigma[t * d..(t + 1) * d];
            let mut gcs_item = vec![0.0f32; d];
            let mut gcs_posn = vec![0.0f32; d];
            for f in 0..d {
                gps[f] *= sigma_activate_grad(pos_raw[f]);
                gns[f] *= sigma_activate_grad(neg_raw[f]);
                gcs_item[f] = gcs[f] * sigma_activate_grad(in_raw[f]);
                gcs_posn[f] = gcs[f] * sigma_activate_grad(posn_raw[f]);
            }

            out.item_mean.push((pos, gpm));
            out.item_mean.push((neg, gnm));
            out.item_mean.push((input_item, gcm.clone()));
            out.item_sigma.push((pos, gps));
            out.item_sigma.push((neg, gns));
            out.item_sigma.push((input_item, gcs_item));
            out.pos_mean.push((t, gcm));
            out.pos_sigma.push((t, gcs_posn));
            out.n_positions += 1;
        }
        out
    }

    /// Coalesce the batch's sparse gradients per row (a row touched by many
    /// users gets one summed gradient and one moment update), then take a
    /// single lazy Adam step over the touched rows.
    fn apply_grads(&mut self, grads: &[UserGrads]) {
        let d = self.config.hidden_size;
        let (lr, b1, b2, wd) =
            (self.config.lr, self.config.adam_beta1, self.config.adam_beta2, self.config.weight_decay);
        self.adam.t += 1;
        let bc1 = 1.0 - b1.powi(self.adam.t.min(i32::MAX as u64) as i32);
        let bc2 = 1.0 - b2.powi(self.adam.t.min(i32::MAX as u64) as i32);

        let coalesce = |pick: fn(&UserGrads) -> &Vec<(usize, Vec<f32>)>| {
            let mut acc: AHashMap<usize, Vec<f32>> = AHashMap::new();
            for g in grads {
                for (row, gr) in pick(g) {
                    let slot = acc.entry(*row).or_insert_with(|| vec![0.0; d]);
                    for f in 0..d {
                        slot[f] += gr[f];
                    }
                }
            }
            acc
        };

        for (row, gr) in coalesce(|g| &g.item_mean) {
            let s = row * d;
            adam_update(
                &mut self.params.item_mean[s..s + d],
                &mut self.adam.item_mean.m[s..s + d],
                &mut self.adam.item_mean.v[s..s + d],
                &gr, lr, b1, b2, wd, bc1, bc2,
            );
        }
        for (row, gr) in coalesce(|g| &g.item_sigma) {
            let s = row * d;
            adam_update(
                &mut self.params.item_sigma[s..s + d],
                &mut self.adam.item_sigma.m[s..s + d],
                &mut self.adam.item_sigma.v[s..s + d],
                &gr, lr, b1, b2, wd, bc1, bc2,
            );
        }
        for (row, gr) in coalesce(|g| &g.pos_mean) {
            let s = row * d;
            adam_update(
                &mut self.params.pos_mean[s..s + d],
                &mut self.adam.pos_mean.m[s..s + d],
                &mut self.adam.pos_mean.v[s..s + d],
                &gr, lr, b1, b2, wd, bc1, bc2,
            );
        }
        for (row, gr) in coalesce(|g| &g.pos_sigma) {
            let s = row * d;
            adam_update(
                &mut self.params.pos_sigma[s..s + d],
                &mut self.adam.pos_sigma.m[s..s + d],
                &mut self.adam.pos_sigma.v[s..s + d],
                &gr, lr, b1, b2, wd, bc1, bc2,
            );
        }
    }

    pub(crate) fn valid(&self, label: &str, full_sort: bool) -> EvalOutcome {
        self.run_eval(EvalSplit::Valid, label, full_sort)
    }

    pub(crate) fn test(&self, label: &str, full_sort: bool) -> EvalOutcome {
        self.run_eval(EvalSplit::Test, label, full_sort)
    }

    fn run_eval(&self, split: EvalSplit, label: &str, full_sort: bool) -> EvalOutcome {
        let instances: Vec<(usize, EvalInstance)> = (0..self.dataset.n_users())
            .filter_map(|u| self.dataset.eval_instance(u, split).map(|e| (u, e)))
            .collect();

        let mut preds: Vec<UserPrediction> = Vec::with_capacity(instances.len());
        for chunk in instances.chunks(EVAL_CHUNK) {
            let mut part: Vec<UserPrediction> = chunk
                .par_iter()
                .map(|(u, inst)| self.score_user(*u, inst, split, full_sort))
                .collect();
            preds.append(&mut part);
        }

        let n = preds.len();
        let mut scores = [0.0f32; 5];
        if n > 0 {
            for p in &preds {
                scores[0] += hit_at_k_from_rank(p.rank, 5);
                scores[1] += ndcg_at_k_from_rank(p.rank, 5);
                scores[2] += hit_at_k_from_rank(p.rank, 10);
                scores[3] += ndcg_at_k_from_rank(p.rank, 10);
                scores[4] += reciprocal_rank(p.rank);
            }
            for s in scores.iter_mut() {
                *s /= n as f32;
            }
        }
        let result_info = format!(
            "[{}] HIT@5={:.4} NDCG@5={:.4} HIT@10={:.4} NDCG@10={:.4} MRR={:.4} ({} users)",
            label, scores[0], scores[1], scores[2], scores[3], scores[4], n
        );
        EvalOutcome { scores, result_info, details: Some(preds) }
    }

    fn score_user(
        &self,
        u: usize,
        inst: &EvalInstance,
        split: EvalSplit,
        full_sort: bool,
    ) -> UserPrediction {
        let cfg = &self.config;
        let d = cfg.hidden_size;
        let metric = cfg.distance_metric;
        let mean_only = cfg.variant.mean_only();
        let floor = cfg.sigma_floor;

        let ctx = self.params.forward(&inst.input, floor, None);
        let last = cfg.max_seq_len - 1;
        let cm = &ctx.mean[last * d..(last + 1) * d];
        let cs = &ctx.sigma[last * d..(last + 1) * d];

        let mut sbuf = vec![0.0f32; d];
        let score_item = |item: usize, sbuf: &mut Vec<f32>| -> f32 {
            self.params.item_sigma_activated(item, floor, sbuf);
            let dist =
                distance(metric, mean_only, cm, cs, self.params.item_mean_row(item), sbuf);
            score_from_distance(dist, cfg.kernel_param)
        };

        if full_sort {
            // score the whole vocabulary, then mask excluded ids in place so
            // rank positions stay comparable across users
            let mut scores = vec![f32::NEG_INFINITY; cfg.n_items + 1];
            for item in 1..=cfg.n_items {
                scores[item] = score_item(item, &mut sbuf);
            }
            for &e in self.dataset.exclusions(split).row(u) {
                scores[e as usize] = f32::NEG_INFINITY;
            }
            let target_score = scores[inst.answer as usize];
            // an excluded answer, or a NaN score from broken parameters,
            // ranks below every candidate; NaN must never look like rank 0
            let rank = if !target_score.is_finite() {
                cfg.n_items
            } else {
                scores[1..].iter().filter(|&&s| s > target_score).count()
            };
            let top = top_k_ids(&scores, 10);
            UserPrediction { user: u, answer: inst.answer, rank, top }
        } else {
            // fixed candidate set: the answer plus sampled unseen negatives;
            // the score-then-rank procedure is identical in shape
            let mut rng = XorShift64::new(
                cfg.seed ^ (u as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            );
            let want = (1 + SAMPLED_EVAL_NEGATIVES).min(cfg.n_items);
            let mut cands = vec![inst.answer];
            for _ in 0..want * 50 {
                if cands.len() >= want {
                    break;
                }
                let j = self.dataset.sample_negative(u, &mut rng);
                if j != inst.answer && !cands.contains(&j) {
                    cands.push(j);
                }
            }
            let mut cand_scores: Vec<f32> =
                cands.iter().map(|&c| score_item(c as usize, &mut sbuf)).collect();
            // the exclusion rule applies to the answer here too, exactly as
            // in the full-sort branch
            if self.dataset.exclusions(split).contains(u, inst.answer) {
                cand_scores[0] = f32::NEG_INFINITY;
            }
            let target_score = cand_scores[0];
            let rank = if !target_score.is_finite() {
                cands.len()
            } else {
                cand_scores.iter().filter(|&&s| s > target_score).count()
            };
            let mut ranked: Vec<(f32, i32)> = cand_scores
                .iter()
                .copied()
                .zip(cands.iter().copied())
                .filter(|(s, _)| s.is_finite())
                .collect();
            ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            let top = ranked.into_iter().take(10).map(|(_, id)| id).collect();
            UserPrediction { user: u, answer: inst.answer, rank, top }
        }
    }

    /// Keep the current parameters as the best-so-far snapshot.
    pub(crate) fn snapshot_best(&mut self) {
        self.best_params = Some(self.params.clone());
    }

    /// Restore the best snapshot (no-op when nothing improved yet).
    pub(crate) fn restore_best(&mut self) {
        if let Some(p) = &self.best_params {
            self.params = p.clone();
        }
    }

    pub(crate) fn save(&self, path: &str) -> io::Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        let ckpt = Checkpoint { version: CHECKPOINT_VERSION, params: self.params.clone() };
        bincode::serialize_into(writer, &ckpt)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub(crate) fn load(&mut self, path: &str) -> io::Result<()> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let ckpt: Checkpoint = bincode::deserialize_from(reader)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if ckpt.version != CHECKPOINT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported checkpoint version {}", ckpt.version),
            ));
        }
        let p = &ckpt.params;
        if p.d != self.config.hidden_size
            || p.num_layers != self.config.num_layers
            || p.max_seq_len != self.config.max_seq_len
            || p.n_items != self.config.n_items
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Checkpoint shape (d={}, layers={}, len={}, items={}) does not match the configured model",
                    p.d, p.num_layers, p.max_seq_len, p.n_items
                ),
            ));
        }
        self.params = ckpt.params;
        Ok(())
    }

    /// Activated item tables: (mean, sigma), each (n_items+1) × d.
    pub(crate) fn item_distributions(&self) -> (Vec<f32>, Vec<f32>) {
        self.params.item_distributions(self.config.sigma_floor)
    }
}

/// Top-k item ids by score, descending; masked or NaN entries never appear.
fn top_k_ids(scores: &[f32], k: usize) -> Vec<i32> {
    let mut best: Vec<(f32, i32)> = Vec::with_capacity(k + 1);
    for (id, &s) in scores.iter().enumerate().skip(1) {
        if !s.is_finite() {
            continue;
        }
        if best.len() < k || s > best.last().map(|b| b.0).unwrap_or(f32::NEG_INFINITY) {
            let at = best.partition_point(|&(bs, _)| bs > s);
            best.insert(at, (s, id as i32));
            if best.len() > k {
                best.pop();
            }
        }
    }
    best.into_iter().map(|(_, id)| id).collect()
}

// ── Fit loop: epochs + validation + early stopping + best-model test ────────

pub(crate) struct FitReport {
    pub best_valid: EvalOutcome,
    pub test: EvalOutcome,
    pub epochs_run: usize,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn fit(
    trainer: &mut DistSaTrainer,
    epochs: usize,
    patience: usize,
    delta: f32,
    full_sort: bool,
    checkpoint_path: Option<&str>,
    verbose: bool,
) -> Result<FitReport, String> {
    let mut early = EarlyStopping::new(patience, delta);
    let mut epochs_run = 0usize;

    if verbose {
        println!("  DistSA (distributional self-attention)");
        println!(
            "  Users: {}, Items: {}, d={}, layers={}, window={}",
            trainer.dataset().n_users(),
            trainer.dataset().n_items(),
            trainer.config.hidden_size,
            trainer.config.num_layers,
            trainer.config.max_seq_len,
        );
        println!("  EPOCH |  REC-LOSS |  PVN-LOSS | VALID | TIME");
        println!("  ------------------------------------------------");
    }

    for epoch in 0..epochs {
        let t0 = Instant::now();
        let (rec, pvn) = trainer.train(epoch);
        let outcome = trainer.valid(&epoch.to_string(), full_sort);
        epochs_run = epoch + 1;

        let improved = early.observe(outcome.scores[4]);
        if improved {
            trainer.snapshot_best();
            if let Some(path) = checkpoint_path {
                trainer
                    .save(path)
                    .map_err(|e| format!("Failed to write checkpoint {}: {}", path, e))?;
            }
        }

        if verbose {
            println!(
                "  {:>5} | {:>9.4} | {:>9.4} | MRR={:.4}{} | {:.2}s",
                epoch + 1,
                rec,
                pvn,
                outcome.scores[4],
                if improved { " *" } else { "" },
                t0.elapsed().as_secs_f64()
            );
        }

        if early.should_stop() {
            if verbose {
                println!("  Early stopping after epoch {} (best MRR={:.4})", epoch + 1, early.best());
            }
            break;
        }
    }

    trainer.restore_best();
    let best_valid = trainer.valid("best", full_sort);
    let test = trainer.test("best", full_sort);
    if verbose {
        println!("  ------------------------------------------------");
        println!("  {}", best_valid.result_info);
        println!("  {}", test.result_info);
    }
    Ok(FitReport { best_valid, test, epochs_run })
}

// ── Python entry points ─────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn build_trainer(
    user_seqs: Vec<Vec<i32>>,
    n_items: usize,
    hidden_size: usize,
    num_hidden_layers: usize,
    max_seq_length: usize,
    attention_probs_dropout_prob: f32,
    hidden_dropout_prob: f32,
    initializer_range: f32,
    distance_metric: &str,
    kernel_param: f32,
    pvn_weight: f32,
    sigma_floor: f32,
    model_variant: &str,
    lr: f32,
    adam_beta1: f32,
    adam_beta2: f32,
    weight_decay: f32,
    batch_size: usize,
    seed: u64,
) -> PyResult<DistSaTrainer> {
    let metric = DistanceMetric::parse(distance_metric).map_err(PyValueError::new_err)?;
    let variant = ModelVariant::parse(model_variant).map_err(PyValueError::new_err)?;
    let config = DistSaConfig {
        n_items,
        hidden_size,
        num_layers: num_hidden_layers,
        max_seq_len: max_seq_length,
        attn_dropout_prob: attention_probs_dropout_prob,
        hidden_dropout_prob,
        initializer_range,
        distance_metric: metric,
        kernel_param,
        pvn_weight,
        sigma_floor,
        variant,
        lr,
        adam_beta1,
        adam_beta2,
        weight_decay,
        batch_size,
        seed,
    };
    let dataset = SequenceDataset::new(user_seqs, n_items, max_seq_length)
        .map_err(PyValueError::new_err)?;
    DistSaTrainer::new(config, dataset).map_err(PyValueError::new_err)
}

/// Train DistSA with early stopping, then evaluate the best checkpoint on
/// the test split. Sequences are 1-indexed item ids (0 = padding token).
/// Returns (valid_scores, test_scores, result_info, item_mean, item_sigma).
#[pyfunction]
#[pyo3(signature = (
    user_seqs, n_items,
    hidden_size, num_hidden_layers, max_seq_length,
    attention_probs_dropout_prob, hidden_dropout_prob, initializer_range,
    distance_metric, kernel_param, pvn_weight, sigma_floor, model_variant,
    lr, adam_beta1, adam_beta2, weight_decay, batch_size,
    epochs, patience, delta, full_sort, checkpoint_path, warm_start, seed, verbose
))]
#[allow(clippy::too_many_arguments)]
pub fn distsa_fit<'py>(
    py: Python<'py>,
    user_seqs: Vec<Vec<i32>>,
    n_items: usize,
    hidden_size: usize,
    num_hidden_layers: usize,
    max_seq_length: usize,
    attention_probs_dropout_prob: f32,
    hidden_dropout_prob: f32,
    initializer_range: f32,
    distance_metric: String,
    kernel_param: f32,
    pvn_weight: f32,
    sigma_floor: f32,
    model_variant: String,
    lr: f32,
    adam_beta1: f32,
    adam_beta2: f32,
    weight_decay: f32,
    batch_size: usize,
    epochs: usize,
    patience: usize,
    delta: f32,
    full_sort: bool,
    checkpoint_path: Option<String>,
    warm_start: bool,
    seed: u64,
    verbose: bool,
) -> PyResult<(Vec<f32>, Vec<f32>, String, Py<PyArray2<f32>>, Py<PyArray2<f32>>)> {
    let mut trainer = build_trainer(
        user_seqs, n_items, hidden_size, num_hidden_layers, max_seq_length,
        attention_probs_dropout_prob, hidden_dropout_prob, initializer_range,
        &distance_metric, kernel_param, pvn_weight, sigma_floor, &model_variant,
        lr, adam_beta1, adam_beta2, weight_decay, batch_size, seed,
    )?;

    // optional warm start: a missing file is not an error here, the caller
    // asked to resume if possible
    if warm_start {
        if let Some(path) = checkpoint_path.as_deref() {
            match trainer.load(path) {
                Ok(()) => {
                    if verbose {
                        println!("  Warm start from {}", path);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if verbose {
                        println!("  No checkpoint at {}; starting fresh", path);
                    }
                }
                Err(e) => {
                    return Err(PyIOError::new_err(format!(
                        "Failed to load checkpoint {}: {}",
                        path, e
                    )))
                }
            }
        }
    }

    let report = py
        .detach(|| {
            fit(
                &mut trainer,
                epochs,
                patience,
                delta,
                full_sort,
                checkpoint_path.as_deref(),
                verbose,
            )
        })
        .map_err(PyIOError::new_err)?;

    let (mean, sigma) = trainer.item_distributions();
    let rows = n_items + 1;
    let mean_arr = PyArray1::from_vec(py, mean).reshape([rows, hidden_size])?;
    let sigma_arr = PyArray1::from_vec(py, sigma).reshape([rows, hidden_size])?;
    Ok((
        report.best_valid.scores.to_vec(),
        report.test.scores.to_vec(),
        report.test.result_info,
        mean_arr.into(),
        sigma_arr.into(),
    ))
}

/// Load a checkpoint and run test-split evaluation. A missing checkpoint is
/// an error here: the caller explicitly asked to evaluate it. Returns the
/// metric vector, a printable summary, and each evaluated user's
/// (user, answer, rank, top-10 ids).
#[pyfunction]
#[pyo3(signature = (
    user_seqs, n_items,
    hidden_size, num_hidden_layers, max_seq_length,
    distance_metric, kernel_param, sigma_floor, model_variant,
    checkpoint_path, full_sort, seed
))]
#[allow(clippy::too_many_arguments)]
pub fn distsa_evaluate(
    py: Python<'_>,
    user_seqs: Vec<Vec<i32>>,
    n_items: usize,
    hidden_size: usize,
    num_hidden_layers: usize,
    max_seq_length: usize,
    distance_metric: String,
    kernel_param: f32,
    sigma_floor: f32,
    model_variant: String,
    checkpoint_path: String,
    full_sort: bool,
    seed: u64,
) -> PyResult<(Vec<f32>, String, Vec<(usize, i32, usize, Vec<i32>)>)> {
    let mut trainer = build_trainer(
        user_seqs, n_items, hidden_size, num_hidden_layers, max_seq_length,
        0.0, 0.0, 0.02, &distance_metric, kernel_param, 0.0, sigma_floor,
        &model_variant, 0.001, 0.9, 0.999, 0.0, 256, seed,
    )?;
    trainer.load(&checkpoint_path).map_err(|e| {
        PyIOError::new_err(format!("Failed to load checkpoint {}: {}", checkpoint_path, e))
    })?;
    let outcome = py.detach(|| trainer.test("eval", full_sort));
    let details = outcome
        .details
        .unwrap_or_default()
        .into_iter()
        .map(|p| (p.user, p.answer, p.rank, p.top))
        .collect();
    Ok((outcome.scores.to_vec(), outcome.result_info, details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distsa::DistSaConfig;

    fn toy_trainer(seed: u64) -> DistSaTrainer {
        let seqs = vec![vec![1, 2, 3, 1, 2, 3], vec![2, 3, 4, 2, 3, 4]];
        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let mut cfg = DistSaConfig::with_defaults(5, 16, 1, 5);
        cfg.attn_dropout_prob = 0.1;
        cfg.hidden_dropout_prob = 0.1;
        cfg.lr = 0.005;
        cfg.batch_size = 2;
        cfg.seed = seed;
        DistSaTrainer::new(cfg, dataset).unwrap()
    }

    #[test]
    fn early_stopping_fires_exactly_at_patience() {
        let mut es = EarlyStopping::new(3, 1e-6);
        assert!(es.observe(1.0)); // epoch 0 improves over -inf
        assert!(!es.observe(0.9));
        assert!(!es.should_stop());
        assert!(!es.observe(0.8));
        assert!(!es.should_stop());
        assert!(!es.observe(0.7)); // third stale epoch
        assert!(es.should_stop());
        assert!((es.best() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn early_stopping_resets_on_improvement() {
        let mut es = EarlyStopping::new(2, 1e-6);
        assert!(es.observe(0.5));
        assert!(!es.observe(0.4));
        assert!(es.observe(0.6)); // improvement resets the stale counter
        assert!(!es.observe(0.5));
        assert!(!es.should_stop());
        assert!(!es.observe(0.5));
        assert!(es.should_stop());
    }

    #[test]
    fn negligible_improvement_does_not_reset() {
        let mut es = EarlyStopping::new(1, 0.01);
        assert!(es.observe(0.5));
        assert!(!es.observe(0.505)); // within delta: stale
        assert!(es.should_stop());
    }

    #[test]
    fn closest_candidate_gets_rank_one() {
        // synthetic score vector: lower distance -> higher score; the true
        // item (3) is strictly closest
        let dists = [f32::NAN, 4.0, 2.5, 0.1, 7.0, 3.0];
        let mut scores = vec![f32::NEG_INFINITY; 6];
        for item in 1..6 {
            scores[item] = score_from_distance(dists[item], 1.0);
        }
        let target = scores[3];
        let rank = scores[1..].iter().filter(|&&s| s > target).count();
        assert_eq!(rank, 0);
        assert_eq!(hit_at_k_from_rank(rank, 1), 1.0);
        assert_eq!(hit_at_k_from_rank(rank, 10), 1.0);
        assert_eq!(top_k_ids(&scores, 3)[0], 3);
    }

    #[test]
    fn top_k_ids_orders_descending_and_skips_masked() {
        let scores = vec![f32::NEG_INFINITY, 0.5, f32::NEG_INFINITY, 2.0, -1.0];
        assert_eq!(top_k_ids(&scores, 10), vec![3, 1, 4]);
        assert_eq!(top_k_ids(&scores, 2), vec![3, 1]);
    }

    #[test]
    fn construction_rejects_shape_mismatches() {
        let seqs = vec![vec![1, 2, 3, 4]];
        let dataset = SequenceDataset::new(seqs.clone(), 5, 5).unwrap();
        let cfg = DistSaConfig::with_defaults(9, 8, 1, 5); // wrong vocab
        assert!(DistSaTrainer::new(cfg, dataset).is_err());

        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let cfg = DistSaConfig::with_defaults(5, 8, 1, 7); // wrong window
        assert!(DistSaTrainer::new(cfg, dataset).is_err());
    }

    #[test]
    fn full_sort_never_ranks_excluded_items() {
        let trainer = toy_trainer(42);
        for split in [EvalSplit::Valid, EvalSplit::Test] {
            let outcome = trainer.run_eval(split, "t", true);
            for p in outcome.details.as_ref().unwrap() {
                for &e in trainer.dataset().exclusions(split).row(p.user) {
                    assert!(
                        !p.top.contains(&e),
                        "excluded item {} surfaced for user {}",
                        e,
                        p.user
                    );
                }
            }
        }
    }

    #[test]
    fn excluded_answer_is_masked_even_as_target() {
        // User re-interacted with item 1: the validation answer is also a
        // training item, so it must be masked out of the candidate set and
        // ranked below every live candidate.
        let seqs = vec![vec![1, 2, 3, 1, 5]];
        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let mut cfg = DistSaConfig::with_defaults(5, 8, 1, 5);
        cfg.attn_dropout_prob = 0.0;
        cfg.hidden_dropout_prob = 0.0;
        let trainer = DistSaTrainer::new(cfg, dataset).unwrap();
        let outcome = trainer.valid("t", true);
        let p = &outcome.details.as_ref().unwrap()[0];
        assert_eq!(p.answer, 1);
        assert_eq!(p.rank, 5, "masked answer ranks below all candidates");
        assert!(!p.top.contains(&1));
    }

    #[test]
    fn nan_parameters_never_score_perfectly() {
        // A numerically broken model (all-NaN means) must not report ideal
        // metrics: a NaN answer score ranks last, not first. The validation
        // answers here are live candidates, not exclusion-masked ones.
        let seqs = vec![vec![1, 2, 3, 4, 5], vec![2, 3, 4, 5, 1]];
        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let mut cfg = DistSaConfig::with_defaults(5, 8, 1, 5);
        cfg.attn_dropout_prob = 0.0;
        cfg.hidden_dropout_prob = 0.0;
        let mut t = DistSaTrainer::new(cfg, dataset).unwrap();
        for v in t.params.item_mean.iter_mut() {
            *v = f32::NAN;
        }
        let outcome = t.valid("nan", true);
        assert_eq!(outcome.scores[0], 0.0, "HIT@5 from an all-NaN model");
        assert_eq!(outcome.scores[1], 0.0, "NDCG@5 from an all-NaN model");
        assert!(outcome.scores[4] < 0.2, "MRR={}", outcome.scores[4]);
        for p in outcome.details.as_ref().unwrap() {
            assert_eq!(p.rank, 5);
            assert!(p.top.is_empty(), "NaN-scored items surfaced in the top list");
        }
    }

    #[test]
    fn sampled_eval_masks_excluded_answer() {
        // Same rule as full-sort: an answer inside the split's exclusion set
        // is not a live candidate, even though it anchors the candidate set.
        let seqs = vec![vec![1, 2, 3, 1, 5]];
        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let mut cfg = DistSaConfig::with_defaults(5, 8, 1, 5);
        cfg.attn_dropout_prob = 0.0;
        cfg.hidden_dropout_prob = 0.0;
        let trainer = DistSaTrainer::new(cfg, dataset).unwrap();
        let outcome = trainer.valid("t", false);
        let p = &outcome.details.as_ref().unwrap()[0];
        assert_eq!(p.answer, 1);
        assert!(p.rank >= 1, "excluded answer must not rank first");
        assert!(!p.top.contains(&1));
    }

    #[test]
    fn sampled_eval_has_the_same_shape() {
        let trainer = toy_trainer(42);
        let outcome = trainer.valid("t", false);
        assert_eq!(outcome.details.as_ref().unwrap().len(), 2);
        for p in outcome.details.as_ref().unwrap() {
            // candidate set is capped by the vocabulary on this toy corpus
            assert!(p.rank < 5);
            assert!(!p.top.is_empty());
        }
    }

    #[test]
    fn checkpoint_round_trip_reproduces_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.ckpt");
        let path = path.to_str().unwrap();

        let mut a = toy_trainer(42);
        for epoch in 0..3 {
            a.train(epoch);
        }
        let before = a.valid("a", true);
        a.save(path).unwrap();

        // different seed: genuinely different parameters until the load
        let mut b = toy_trainer(7);
        assert_ne!(a.params.item_mean, b.params.item_mean);
        b.load(path).unwrap();
        let after = b.valid("b", true);

        assert_eq!(a.params.item_mean, b.params.item_mean);
        assert_eq!(a.params.item_sigma, b.params.item_sigma);
        assert_eq!(before.scores, after.scores);
    }

    #[test]
    fn loading_a_missing_checkpoint_fails() {
        let mut t = toy_trainer(42);
        assert!(t.load("/nonexistent/path/best.ckpt").is_err());
    }

    #[test]
    fn training_reduces_the_ranking_loss() {
        let mut t = toy_trainer(42);
        let mut first = 0.0f32;
        let mut last = 0.0f32;
        let epochs = 80;
        for epoch in 0..epochs {
            let (rec, _pvn) = t.train(epoch);
            if epoch < 3 {
                first += rec;
            }
            if epoch >= epochs - 3 {
                last += rec;
            }
        }
        assert!(
            last < first,
            "mean loss did not decrease: first window={first}, last window={last}"
        );
    }

    #[test]
    fn end_to_end_toy_run_with_early_stopping() {
        let mut t = toy_trainer(42);
        let report = fit(&mut t, 30, 5, 1e-6, true, None, false).unwrap();
        assert!(report.epochs_run <= 30);
        assert!(report.best_valid.scores.iter().all(|s| s.is_finite()));
        assert!(report.test.scores.iter().all(|s| s.is_finite()));
        // leakage check: no user's top list contains a test-excluded item
        for p in report.test.details.as_ref().unwrap() {
            for &e in t.dataset().exclusions(EvalSplit::Test).row(p.user) {
                assert!(!p.top.contains(&e));
            }
        }
    }

    #[test]
    fn spec_toy_sequences_exclude_training_items() {
        // vocabulary of 5 items, 2 users, histories [1,2,3] and [2,3,4],
        // window 5 (left-padded with 0). These histories are too short to
        // yield a training transition under leave-two-out, so the
        // loss-reduction check lives in training_reduces_the_ranking_loss
        // on longer sequences; this covers the exclusion half.
        let seqs = vec![vec![1, 2, 3], vec![2, 3, 4]];
        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let mut cfg = DistSaConfig::with_defaults(5, 8, 1, 5);
        cfg.attn_dropout_prob = 0.0;
        cfg.hidden_dropout_prob = 0.0;
        let trainer = DistSaTrainer::new(cfg, dataset).unwrap();
        let outcome = trainer.valid("t", true);
        let details = outcome.details.as_ref().unwrap();
        assert_eq!(details.len(), 2);
        // user 0 trained on [1], user 1 trained on [2]
        assert!(!details[0].top.contains(&1));
        assert!(!details[1].top.contains(&2));
    }

    #[test]
    fn mean_only_variant_trains_and_evaluates() {
        let seqs = vec![vec![1, 2, 3, 1, 2, 3], vec![2, 3, 4, 2, 3, 4]];
        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let mut cfg = DistSaConfig::with_defaults(5, 8, 1, 5);
        cfg.variant = ModelVariant::DistMeanSa;
        cfg.attn_dropout_prob = 0.1;
        cfg.hidden_dropout_prob = 0.1;
        let mut t = DistSaTrainer::new(cfg, dataset).unwrap();
        let (rec, _) = t.train(0);
        assert!(rec.is_finite() && rec > 0.0);
        let outcome = t.valid("t", true);
        assert!(outcome.scores.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn kl_metric_trains_and_evaluates() {
        let seqs = vec![vec![1, 2, 3, 1, 2, 3], vec![2, 3, 4, 2, 3, 4]];
        let dataset = SequenceDataset::new(seqs, 5, 5).unwrap();
        let mut cfg = DistSaConfig::with_defaults(5, 8, 1, 5);
        cfg.distance_metric = DistanceMetric::Kl;
        cfg.attn_dropout_prob = 0.1;
        cfg.hidden_dropout_prob = 0.1;
        let mut t = DistSaTrainer::new(cfg, dataset).unwrap();
        for epoch in 0..3 {
            let (rec, pvn) = t.train(epoch);
            assert!(rec.is_finite() && pvn.is_finite());
        }
        let outcome = t.valid("t", true);
        assert!(outcome.scores.iter().all(|s| s.is_finite()));
    }
}
