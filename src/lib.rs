use mimalloc::MiMalloc;
use pyo3::prelude::*;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod common;
mod data;
mod dist;
mod distsa;
mod metrics;
mod trainer;

#[pymodule]
fn _distrec(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(trainer::distsa_fit, m)?)?;
    m.add_function(wrap_pyfunction!(trainer::distsa_evaluate, m)?)?;
    m.add_function(wrap_pyfunction!(dist::wasserstein_distance, m)?)?;
    m.add_function(wrap_pyfunction!(dist::kl_distance, m)?)?;
    m.add_function(wrap_pyfunction!(metrics::hit_rate_at_k, m)?)?;
    m.add_function(wrap_pyfunction!(metrics::ndcg_at_k, m)?)?;
    m.add_function(wrap_pyfunction!(metrics::mrr, m)?)?;
    Ok(())
}
