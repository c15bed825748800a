// Distributional distances between diagonal-Gaussian embeddings.
//
// Every entity (item, position, sequence context) is a (mean, sigma) pair.
// Ranking uses a closed-form distance: squared 2-Wasserstein between
// diagonal Gaussians, or KL(a‖b) as an alternative. Lower distance maps to
// a higher score via score = -distance / kernel_param.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

pub(crate) const DEFAULT_SIGMA_FLOOR: f32 = 1e-8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum DistanceMetric {
    Wasserstein,
    Kl,
}

impl DistanceMetric {
    pub(crate) fn parse(name: &str) -> Result<Self, String> {
        match name {
            "wasserstein" => Ok(DistanceMetric::Wasserstein),
            "kl" => Ok(DistanceMetric::Kl),
            _ => Err(format!(
                "Unknown distance metric: {}. Must be one of: wasserstein, kl.",
                name
            )),
        }
    }
}

/// ELU(x) + 1 plus a small floor: strictly positive dispersion for any raw
/// parameter value, with a non-vanishing gradient on the negative side.
#[inline(always)]
pub(crate) fn sigma_activate(raw: f32, floor: f32) -> f32 {
    let elu = if raw > 0.0 { raw } else { raw.exp() - 1.0 };
    elu + 1.0 + floor
}

/// Derivative of `sigma_activate` with respect to the raw parameter.
#[inline(always)]
pub(crate) fn sigma_activate_grad(raw: f32) -> f32 {
    if raw > 0.0 { 1.0 } else { raw.exp() }
}

/// Squared 2-Wasserstein distance between two diagonal Gaussians:
/// ||μa − μb||² + ||σa − σb||².
pub(crate) fn wasserstein2_raw(ma: &[f32], sa: &[f32], mb: &[f32], sb: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for f in 0..ma.len() {
        let dm = ma[f] - mb[f];
        let ds = sa[f] - sb[f];
        acc += dm * dm + ds * ds;
    }
    acc
}

/// KL(a ‖ b) for diagonal Gaussians:
/// 0.5 · Σ( (σa² + (μa−μb)²)/σb² − 1 + 2·ln(σb/σa) ).
pub(crate) fn kl_raw(ma: &[f32], sa: &[f32], mb: &[f32], sb: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for f in 0..ma.len() {
        let dm = ma[f] - mb[f];
        let va = sa[f] * sa[f];
        let vb = sb[f] * sb[f];
        acc += (va + dm * dm) / vb - 1.0 + (vb / va).ln();
    }
    0.5 * acc
}

/// Distance under the configured metric. The mean-only variant scores with
/// the Euclidean mean term alone for either metric.
pub(crate) fn distance(
    metric: DistanceMetric,
    mean_only: bool,
    ma: &[f32],
    sa: &[f32],
    mb: &[f32],
    sb: &[f32],
) -> f32 {
    if mean_only {
        let mut acc = 0.0f32;
        for f in 0..ma.len() {
            let dm = ma[f] - mb[f];
            acc += dm * dm;
        }
        return acc;
    }
    match metric {
        DistanceMetric::Wasserstein => wasserstein2_raw(ma, sa, mb, sb),
        DistanceMetric::Kl => kl_raw(ma, sa, mb, sb),
    }
}

/// Accumulate `coef · ∂distance/∂x` into the four gradient buffers.
/// Sigma gradients are with respect to the *activated* sigma values; the
/// caller chains them through `sigma_activate_grad`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn accumulate_distance_grads(
    metric: DistanceMetric,
    mean_only: bool,
    ma: &[f32],
    sa: &[f32],
    mb: &[f32],
    sb: &[f32],
    coef: f32,
    gma: &mut [f32],
    gsa: &mut [f32],
    gmb: &mut [f32],
    gsb: &mut [f32],
) {
    let d = ma.len();
    if mean_only {
        for f in 0..d {
            let g = coef * 2.0 * (ma[f] - mb[f]);
            gma[f] += g;
            gmb[f] -= g;
        }
        return;
    }
    match metric {
        DistanceMetric::Wasserstein => {
            for f in 0..d {
                let gm = coef * 2.0 * (ma[f] - mb[f]);
                let gs = coef * 2.0 * (sa[f] - sb[f]);
                gma[f] += gm;
                gmb[f] -= gm;
                gsa[f] += gs;
                gsb[f] -= gs;
            }
        }
        DistanceMetric::Kl => {
            for f in 0..d {
                let dm = ma[f] - mb[f];
                let vb = sb[f] * sb[f];
                let gm = coef * dm / vb;
                gma[f] += gm;
                gmb[f] -= gm;
                gsa[f] += coef * (sa[f] / vb - 1.0 / sa[f]);
                gsb[f] += coef * (1.0 / sb[f] - (sa[f] * sa[f] + dm * dm) / (vb * sb[f]));
            }
        }
    }
}

/// Lower distance, higher score; `kernel_param` is validated > 0 at model
/// construction.
#[inline(always)]
pub(crate) fn score_from_distance(dist: f32, kernel_param: f32) -> f32 {
    -dist / kernel_param
}

// ── PyO3 wrappers ──────────────────────────────────────────────────

fn check_dims(ma: &[f32], sa: &[f32], mb: &[f32], sb: &[f32]) -> PyResult<()> {
    if ma.len() != mb.len() || ma.len() != sa.len() || ma.len() != sb.len() {
        return Err(PyValueError::new_err(format!(
            "Mismatched embedding dimensions: mean_a={}, sigma_a={}, mean_b={}, sigma_b={}.",
            ma.len(),
            sa.len(),
            mb.len(),
            sb.len()
        )));
    }
    Ok(())
}

#[pyfunction]
pub fn wasserstein_distance(
    mean_a: Vec<f32>,
    sigma_a: Vec<f32>,
    mean_b: Vec<f32>,
    sigma_b: Vec<f32>,
) -> PyResult<f32> {
    check_dims(&mean_a, &sigma_a, &mean_b, &sigma_b)?;
    Ok(wasserstein2_raw(&mean_a, &sigma_a, &mean_b, &sigma_b))
}

#[pyfunction]
pub fn kl_distance(
    mean_a: Vec<f32>,
    sigma_a: Vec<f32>,
    mean_b: Vec<f32>,
    sigma_b: Vec<f32>,
) -> PyResult<f32> {
    check_dims(&mean_a, &sigma_a, &mean_b, &sigma_b)?;
    Ok(kl_raw(&mean_a, &sigma_a, &mean_b, &sigma_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigma_activation_stays_positive_and_finite() {
        for raw in [-100.0f32, -10.0, -1.0, -1e-3, 0.0, 1e-3, 1.0, 10.0, 100.0] {
            let s = sigma_activate(raw, DEFAULT_SIGMA_FLOOR);
            assert!(s > 0.0, "raw={raw} gave sigma={s}");
            assert!(s.is_finite());
            let g = sigma_activate_grad(raw);
            assert!(g > 0.0 && g.is_finite());
        }
    }

    #[test]
    fn wasserstein_is_symmetric_and_zero_iff_equal() {
        let ma = [0.5f32, -1.0, 2.0];
        let sa = [1.0f32, 0.5, 2.0];
        let mb = [0.0f32, 1.0, 1.5];
        let sb = [2.0f32, 1.0, 0.5];
        let ab = wasserstein2_raw(&ma, &sa, &mb, &sb);
        let ba = wasserstein2_raw(&mb, &sb, &ma, &sa);
        assert!((ab - ba).abs() < 1e-6);
        assert!(ab > 0.0);
        assert_eq!(wasserstein2_raw(&ma, &sa, &ma, &sa), 0.0);
    }

    #[test]
    fn kl_is_zero_iff_equal_and_positive_otherwise() {
        let ma = [0.5f32, -1.0];
        let sa = [1.0f32, 0.5];
        let mb = [0.0f32, 1.0];
        let sb = [2.0f32, 1.0];
        assert!(kl_raw(&ma, &sa, &ma, &sa).abs() < 1e-6);
        assert!(kl_raw(&ma, &sa, &mb, &sb) > 0.0);
    }

    #[test]
    fn lower_distance_means_higher_score() {
        let near = score_from_distance(0.1, 1.0);
        let far = score_from_distance(5.0, 1.0);
        assert!(near > far);
        // Temperature scales but preserves ordering.
        assert!(score_from_distance(0.1, 10.0) > score_from_distance(5.0, 10.0));
    }

    #[test]
    fn unknown_metric_is_a_construction_error() {
        assert!(DistanceMetric::parse("wasserstein").is_ok());
        assert!(DistanceMetric::parse("kl").is_ok());
        assert!(DistanceMetric::parse("cosine").is_err());
    }

    // Finite-difference check of the analytic gradients.
    #[test]
    fn gradients_match_finite_differences() {
        let ma = vec![0.3f32, -0.7, 1.2];
        let sa = vec![1.1f32, 0.6, 2.0];
        let mb = vec![-0.2f32, 0.4, 0.9];
        let sb = vec![0.8f32, 1.5, 1.0];
        for metric in [DistanceMetric::Wasserstein, DistanceMetric::Kl] {
            let mut gma = vec![0.0f32; 3];
            let mut gsa = vec![0.0f32; 3];
            let mut gmb = vec![0.0f32; 3];
            let mut gsb = vec![0.0f32; 3];
            accumulate_distance_grads(
                metric, false, &ma, &sa, &mb, &sb, 1.0, &mut gma, &mut gsa, &mut gmb, &mut gsb,
            );
            let eps = 1e-3f32;
            for f in 0..3 {
                let mut ma2 = ma.clone();
                ma2[f] += eps;
                let fd = (distance(metric, false, &ma2, &sa, &mb, &sb)
                    - distance(metric, false, &ma, &sa, &mb, &sb))
                    / eps;
                assert!((fd - gma[f]).abs() < 2e-2, "{metric:?} gma[{f}]: fd={fd} an={}", gma[f]);

                let mut sb2 = sb.clone();
                sb2[f] += eps;
                let fd = (distance(metric, false, &ma, &sa, &mb, &sb2)
                    - distance(metric, false, &ma, &sa, &mb, &sb))
                    / eps;
                assert!((fd - gsb[f]).abs() < 2e-2, "{metric:?} gsb[{f}]: fd={fd} an={}", gsb[f]);
            }
        }
    }

    #[test]
    fn mean_only_ignores_sigma() {
        let ma = [1.0f32, 2.0];
        let mb = [0.0f32, 0.0];
        let sa = [5.0f32, 5.0];
        let sb = [0.1f32, 0.1];
        let d = distance(DistanceMetric::Wasserstein, true, &ma, &sa, &mb, &sb);
        assert!((d - 5.0).abs() < 1e-6);
    }
}
