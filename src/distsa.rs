// DistSA – distributional self-attentive sequential recommendation.
//
// Architecture:
//   1. Item tables  M ∈ R^{(|I|+1) × d},  Σraw ∈ R^{(|I|+1) × d}  (index 0 is padding)
//   2. Learnable positional mean/sigma tables, N × d
//   3. L transformer blocks over two channels (mean, sigma): single-head
//      causal self-attention with probabilities derived from the mean
//      channel and shared by both channels (value projections independent),
//      then per-channel FFN, each sub-layer with residual + Layer-Norm
//   4. Output per position: (mean, sigma) with sigma activated ELU+1
//
// All math is done with raw Vec<f32>; ranking uses the distributional
// distances in dist.rs rather than dot products.

use serde::{Deserialize, Serialize};

use crate::common::{randn_vec, XorShift64};
use crate::dist::{sigma_activate, DistanceMetric, DEFAULT_SIGMA_FLOOR};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ModelVariant {
    /// Full distributional scoring: mean and sigma terms.
    DistSa,
    /// Same encoder, mean-term-only scoring.
    DistMeanSa,
}

impl ModelVariant {
    pub(crate) fn parse(name: &str) -> Result<Self, String> {
        match name {
            "distsa" => Ok(ModelVariant::DistSa),
            "distmeansa" => Ok(ModelVariant::DistMeanSa),
            _ => Err(format!(
                "Unknown model variant: {}. Must be one of: distsa, distmeansa.",
                name
            )),
        }
    }

    #[inline]
    pub(crate) fn mean_only(self) -> bool {
        self == ModelVariant::DistMeanSa
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DistSaConfig {
    pub n_items: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub max_seq_len: usize,
    pub attn_dropout_prob: f32,
    pub hidden_dropout_prob: f32,
    pub initializer_range: f32,
    pub distance_metric: DistanceMetric,
    pub kernel_param: f32,
    pub pvn_weight: f32,
    pub sigma_floor: f32,
    pub variant: ModelVariant,
    // optimizer / loop
    pub lr: f32,
    pub adam_beta1: f32,
    pub adam_beta2: f32,
    pub weight_decay: f32,
    pub batch_size: usize,
    pub seed: u64,
}

impl DistSaConfig {
    /// Defaults matching the usual experiment settings; fields are public so
    /// callers override what they need.
    pub(crate) fn with_defaults(
        n_items: usize,
        hidden_size: usize,
        num_layers: usize,
        max_seq_len: usize,
    ) -> Self {
        Self {
            n_items,
            hidden_size,
            num_layers,
            max_seq_len,
            attn_dropout_prob: 0.5,
            hidden_dropout_prob: 0.5,
            initializer_range: 0.02,
            distance_metric: DistanceMetric::Wasserstein,
            kernel_param: 1.0,
            pvn_weight: 0.1,
            sigma_floor: DEFAULT_SIGMA_FLOOR,
            variant: ModelVariant::DistSa,
            lr: 0.001,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            weight_decay: 0.0,
            batch_size: 256,
            seed: 42,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.n_items == 0 {
            return Err("n_items must be at least 1".to_string());
        }
        if self.hidden_size == 0 {
            return Err("hidden_size must be positive".to_string());
        }
        if self.num_layers == 0 {
            return Err("num_hidden_layers must be positive".to_string());
        }
        if self.max_seq_len == 0 {
            return Err("max_seq_length must be positive".to_string());
        }
        if !(self.kernel_param > 0.0) {
            return Err(format!("kernel_param must be > 0, got {}", self.kernel_param));
        }
        if self.pvn_weight < 0.0 {
            return Err(format!("pvn_weight must be >= 0, got {}", self.pvn_weight));
        }
        if self.sigma_floor < 0.0 {
            return Err(format!("sigma_floor must be >= 0, got {}", self.sigma_floor));
        }
        for (name, p) in [
            ("attention_probs_dropout_prob", self.attn_dropout_prob),
            ("hidden_dropout_prob", self.hidden_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(format!("{} must lie in [0, 1), got {}", name, p));
            }
        }
        if !(self.initializer_range > 0.0) {
            return Err("initializer_range must be > 0".to_string());
        }
        if !(self.lr > 0.0) {
            return Err(format!("lr must be > 0, got {}", self.lr));
        }
        for (name, b) in [("adam_beta1", self.adam_beta1), ("adam_beta2", self.adam_beta2)] {
            if !(0.0..1.0).contains(&b) {
                return Err(format!("{} must lie in [0, 1), got {}", name, b));
            }
        }
        if self.batch_size == 0 {
            return Err("batch_size must be positive".to_string());
        }
        Ok(())
    }
}

// ── Layer Norm ──────────────────────────────────────────────────────────────

fn layer_norm(x: &mut [f32], gamma: &[f32], beta: &[f32]) {
    let n = x.len() as f32;
    let mean: f32 = x.iter().sum::<f32>() / n;
    let var: f32 = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let inv_std = 1.0 / (var + 1e-8).sqrt();
    for (i, v) in x.iter_mut().enumerate() {
        *v = gamma[i] * ((*v - mean) * inv_std) + beta[i];
    }
}

// ── FFN (2-layer, ReLU) ─────────────────────────────────────────────────────

fn ffn(x: &[f32], d: usize, w1: &[f32], b1: &[f32], w2: &[f32], b2: &[f32]) -> Vec<f32> {
    let d_ff = w1.len() / d;
    let mut h = vec![0.0_f32; d_ff];
    for j in 0..d_ff {
        let mut s = b1[j];
        for k in 0..d {
            s += x[k] * w1[k * d_ff + j];
        }
        h[j] = s.max(0.0);
    }
    let mut out = vec![0.0_f32; d];
    for j in 0..d {
        let mut s = b2[j];
        for k in 0..d_ff {
            s += h[k] * w2[k * d + j];
        }
        out[j] = s;
    }
    out
}

// ── Projection: [L × d] @ [d × d] ───────────────────────────────────────────

fn project(x: &[f32], w: &[f32], len: usize, d: usize) -> Vec<f32> {
    let mut out = vec![0.0_f32; len * d];
    for i in 0..len {
        for j in 0..d {
            let mut sum = 0.0_f32;
            for k in 0..d {
                sum += x[i * d + k] * w[k * d + j];
            }
            out[i * d + j] = sum;
        }
    }
    out
}

// ── Dropout (inverted, training only) ───────────────────────────────────────

pub(crate) struct Dropout<'a> {
    pub rng: &'a mut XorShift64,
    pub attn_p: f32,
    pub hidden_p: f32,
}

fn apply_dropout(x: &mut [f32], p: f32, rng: &mut XorShift64) {
    if p <= 0.0 {
        return;
    }
    let keep = 1.0 - p;
    let inv = 1.0 / keep;
    for v in x.iter_mut() {
        if rng.next_f32() < p {
            *v = 0.0;
        } else {
            *v *= inv;
        }
    }
}

// ── Parameters ──────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct LayerParams {
    // attention: Q/K from the mean channel, value projections per channel
    pub wq: Vec<f32>,
    pub wk: Vec<f32>,
    pub wv_mean: Vec<f32>,
    pub wv_sigma: Vec<f32>,
    // FFN, per channel
    pub w1_mean: Vec<f32>,
    pub b1_mean: Vec<f32>,
    pub w2_mean: Vec<f32>,
    pub b2_mean: Vec<f32>,
    pub w1_sigma: Vec<f32>,
    pub b1_sigma: Vec<f32>,
    pub w2_sigma: Vec<f32>,
    pub b2_sigma: Vec<f32>,
    // Layer-Norm after each sub-layer, per channel
    pub ln1_g_mean: Vec<f32>,
    pub ln1_b_mean: Vec<f32>,
    pub ln2_g_mean: Vec<f32>,
    pub ln2_b_mean: Vec<f32>,
    pub ln1_g_sigma: Vec<f32>,
    pub ln1_b_sigma: Vec<f32>,
    pub ln2_g_sigma: Vec<f32>,
    pub ln2_b_sigma: Vec<f32>,
}

#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct DistSaParams {
    pub d: usize,
    pub num_layers: usize,
    pub max_seq_len: usize,
    pub n_items: usize,
    /// (n_items+1) × d — index 0 is padding.
    pub item_mean: Vec<f32>,
    /// Raw sigma parameters; activated ELU+1 on read.
    pub item_sigma: Vec<f32>,
    /// max_seq_len × d.
    pub pos_mean: Vec<f32>,
    pub pos_sigma: Vec<f32>,
    pub layers: Vec<LayerParams>,
}

/// Encoder output: per-position context distribution, row-major L × d.
pub(crate) struct SeqContext {
    pub mean: Vec<f32>,
    pub sigma: Vec<f32>,
}

impl DistSaParams {
    pub(crate) fn new(cfg: &DistSaConfig, rng: &mut XorShift64) -> Self {
        let d = cfg.hidden_size;
        let d_ff = d * 4;
        let scale = cfg.initializer_range;

        let item_mean = randn_vec(rng, (cfg.n_items + 1) * d, scale);
        let item_sigma = randn_vec(rng, (cfg.n_items + 1) * d, scale);
        let pos_mean = randn_vec(rng, cfg.max_seq_len * d, scale);
        let pos_sigma = randn_vec(rng, cfg.max_seq_len * d, scale);

        let layers = (0..cfg.num_layers)
            .map(|_| LayerParams {
                wq: randn_vec(rng, d * d, scale),
                wk: randn_vec(rng, d * d, scale),
                wv_mean: randn_vec(rng, d * d, scale),
                wv_sigma: randn_vec(rng, d * d, scale),
                w1_mean: randn_vec(rng, d * d_ff, scale),
                b1_mean: vec![0.0; d_ff],
                w2_mean: randn_vec(rng, d_ff * d, scale),
                b2_mean: vec![0.0; d],
                w1_sigma: randn_vec(rng, d * d_ff, scale),
                b1_sigma: vec![0.0; d_ff],
                w2_sigma: randn_vec(rng, d_ff * d, scale),
                b2_sigma: vec![0.0; d],
                ln1_g_mean: vec![1.0; d],
                ln1_b_mean: vec![0.0; d],
                ln2_g_mean: vec![1.0; d],
                ln2_b_mean: vec![0.0; d],
                ln1_g_sigma: vec![1.0; d],
                ln1_b_sigma: vec![0.0; d],
                ln2_g_sigma: vec![1.0; d],
                ln2_b_sigma: vec![0.0; d],
            })
            .collect();

        Self {
            d,
            num_layers: cfg.num_layers,
            max_seq_len: cfg.max_seq_len,
            n_items: cfg.n_items,
            item_mean,
            item_sigma,
            pos_mean,
            pos_sigma,
            layers,
        }
    }

    #[inline]
    pub(crate) fn item_mean_row(&self, id: usize) -> &[f32] {
        &self.item_mean[id * self.d..(id + 1) * self.d]
    }

    #[inline]
    pub(crate) fn item_sigma_row(&self, id: usize) -> &[f32] {
        &self.item_sigma[id * self.d..(id + 1) * self.d]
    }

    /// Activated sigma row written into `out`.
    pub(crate) fn item_sigma_activated(&self, id: usize, floor: f32, out: &mut [f32]) {
        for (o, &raw) in out.iter_mut().zip(self.item_sigma_row(id)) {
            *o = sigma_activate(raw, floor);
        }
    }

    /// Full activated tables: (mean, sigma), each (n_items+1) × d.
    pub(crate) fn item_distributions(&self, floor: f32) -> (Vec<f32>, Vec<f32>) {
        let mean = self.item_mean.clone();
        let sigma = self.item_sigma.iter().map(|&r| sigma_activate(r, floor)).collect();
        (mean, sigma)
    }

    /// Encode one left-padded window. Attention is causal and skips padding
    /// keys (self always allowed so softmax rows stay defined). Dropout is
    /// applied only when a training context is passed.
    pub(crate) fn forward(
        &self,
        input: &[i32],
        floor: f32,
        mut dropout: Option<Dropout<'_>>,
    ) -> SeqContext {
        let d = self.d;
        let len = self.max_seq_len;
        assert_eq!(input.len(), len, "window length must equal max_seq_len");
        let scale = (d as f32).powf(-0.5);

        // item + position embeddings, both channels
        let mut h_m = vec![0.0_f32; len * d];
        let mut h_s = vec![0.0_f32; len * d];
        for (t, &item) in input.iter().enumerate() {
            let item = item as usize; // out-of-range id fails hard below
            let im = self.item_mean_row(item);
            let is = self.item_sigma_row(item);
            for f in 0..d {
                h_m[t * d + f] = im[f] + self.pos_mean[t * d + f];
                h_s[t * d + f] = is[f] + self.pos_sigma[t * d + f];
            }
        }
        if let Some(dp) = dropout.as_mut() {
            apply_dropout(&mut h_m, dp.hidden_p, dp.rng);
            apply_dropout(&mut h_s, dp.hidden_p, dp.rng);
        }

        for layer in &self.layers {
            // ── attention sub-layer ────────────────────────────────────────
            let q = project(&h_m, &layer.wq, len, d);
            let k = project(&h_m, &layer.wk, len, d);
            let vm = project(&h_m, &layer.wv_mean, len, d);
            let vs = project(&h_s, &layer.wv_sigma, len, d);

            let mut attn = vec![f32::NEG_INFINITY; len * len];
            for i in 0..len {
                for j in 0..=i {
                    if input[j] == 0 && j != i {
                        continue; // padding key stays masked
                    }
                    let mut dot = 0.0_f32;
                    for f in 0..d {
                        dot += q[i * d + f] * k[j * d + f];
                    }
                    attn[i * len + j] = dot * scale;
                }
            }
            for i in 0..len {
                let row = &mut attn[i * len..(i + 1) * len];
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let mut sum = 0.0_f32;
                for v in row.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
            if let Some(dp) = dropout.as_mut() {
                apply_dropout(&mut attn, dp.attn_p, dp.rng);
            }

            let mut out_m = vec![0.0_f32; len * d];
            let mut out_s = vec![0.0_f32; len * d];
            for i in 0..len {
                for j in 0..len {
                    let w = attn[i * len + j];
                    if w == 0.0 {
                        continue;
                    }
                    for f in 0..d {
                        out_m[i * d + f] += w * vm[j * d + f];
                        out_s[i * d + f] += w * vs[j * d + f];
                    }
                }
            }
            if let Some(dp) = dropout.as_mut() {
                apply_dropout(&mut out_m, dp.hidden_p, dp.rng);
                apply_dropout(&mut out_s, dp.hidden_p, dp.rng);
            }

            let mut h_m2 = vec![0.0_f32; len * d];
            let mut h_s2 = vec![0.0_f32; len * d];
            for i in 0..len {
                let mut row: Vec<f32> = (0..d).map(|f| h_m[i * d + f] + out_m[i * d + f]).collect();
                layer_norm(&mut row, &layer.ln1_g_mean, &layer.ln1_b_mean);
                h_m2[i * d..(i + 1) * d].copy_from_slice(&row);

                let mut row: Vec<f32> = (0..d).map(|f| h_s[i * d + f] + out_s[i * d + f]).collect();
                layer_norm(&mut row, &layer.ln1_g_sigma, &layer.ln1_b_sigma);
                h_s2[i * d..(i + 1) * d].copy_from_slice(&row);
            }

            // ── FFN sub-layer ──────────────────────────────────────────────
            let mut h_m3 = vec![0.0_f32; len * d];
            let mut h_s3 = vec![0.0_f32; len * d];
            for i in 0..len {
                let mut fm = ffn(
                    &h_m2[i * d..(i + 1) * d],
                    d,
                    &layer.w1_mean,
                    &layer.b1_mean,
                    &layer.w2_mean,
                    &layer.b2_mean,
                );
                let mut fs = ffn(
                    &h_s2[i * d..(i + 1) * d],
                    d,
                    &layer.w1_sigma,
                    &layer.b1_sigma,
                    &layer.w2_sigma,
                    &layer.b2_sigma,
                );
                if let Some(dp) = dropout.as_mut() {
                    apply_dropout(&mut fm, dp.hidden_p, dp.rng);
                    apply_dropout(&mut fs, dp.hidden_p, dp.rng);
                }
                let mut row: Vec<f32> = (0..d).map(|f| h_m2[i * d + f] + fm[f]).collect();
                layer_norm(&mut row, &layer.ln2_g_mean, &layer.ln2_b_mean);
                h_m3[i * d..(i + 1) * d].copy_from_slice(&row);

                let mut row: Vec<f32> = (0..d).map(|f| h_s2[i * d + f] + fs[f]).collect();
                layer_norm(&mut row, &layer.ln2_g_sigma, &layer.ln2_b_sigma);
                h_s3[i * d..(i + 1) * d].copy_from_slice(&row);
            }
            h_m = h_m3;
            h_s = h_s3;
        }

        // activate the dispersion channel at the output
        for v in h_s.iter_mut() {
            *v = sigma_activate(*v, floor);
        }
        SeqContext { mean: h_m, sigma: h_s }
    }
}
