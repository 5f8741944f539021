use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use px_core::traits::{LogDensity, TransitionKernel};
use px_core::{Seed, SeedKey, Tensor};
use px_inference::{DiagonalMassMatrixAdaptation, HmcConfig, PreconditionedHmc, RunningVariance};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

/// Isotropic Gaussian over a `[chains, dim]` state.
struct StdNormal;

impl LogDensity for StdNormal {
    fn log_prob_and_grad(&self, state: &[Tensor]) -> px_core::Result<(Tensor, Vec<Tensor>)> {
        let x = &state[0];
        let lp = x.map(|v| -0.5 * v * v).sum_trailing(1)?;
        Ok((lp, vec![x.neg()]))
    }
}

fn bench_running_variance(c: &mut Criterion) {
    let mut group = c.benchmark_group("running_variance_update");
    for &chains in &[16usize, 256] {
        let xs: Vec<f64> = (0..chains * 32).map(|i| ((i * 7919) % 1000) as f64 * 1e-3).collect();
        let batch = Tensor::from_shape_vec(&[chains, 32], xs).unwrap();
        let rv = RunningVariance::from_shape(&[32]);
        group.bench_with_input(BenchmarkId::from_parameter(chains), &batch, |b, batch| {
            b.iter(|| black_box(rv.update(batch, Some(0)).unwrap()))
        });
    }
    group.finish();
}

fn bench_adaptive_hmc(c: &mut Criterion) {
    let mut group = c.benchmark_group("dmma_hmc_step");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    for &dim in &[4usize, 64] {
        let inner = PreconditionedHmc::new(Arc::new(StdNormal), HmcConfig { step_size: 0.2, num_leapfrog_steps: 8 })
            .unwrap();
        let initial = RunningVariance::from_stats(10.0, Tensor::zeros(&[dim]), Tensor::scalar(1.0)).unwrap();
        let kernel = DiagonalMassMatrixAdaptation::new(inner, vec![initial]);
        let state = vec![Tensor::zeros(&[8, dim])];
        let results = kernel.bootstrap_results(&state).unwrap();
        let seed = Seed::Stateless(SeedKey::from_u64(42));

        group.bench_with_input(BenchmarkId::from_parameter(dim), &dim, |b, _| {
            b.iter(|| black_box(kernel.one_step(&state, &results, Some(&seed)).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_running_variance, bench_adaptive_hmc);
criterion_main!(benches);
