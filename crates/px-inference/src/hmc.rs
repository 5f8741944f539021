//! Hamiltonian Monte Carlo with a preconditioning momentum distribution.
//!
//! [`PreconditionedHmc`] is a fixed-trajectory HMC transition kernel over a
//! list of batched state parts. Leading dims of every part (the rank of the
//! target log density) index independent chains; each chain is accepted or
//! rejected on its own. The momentum distribution lives in the kernel
//! results so that a wrapping kernel can replace it between steps (see
//! [`crate::adapt::DiagonalMassMatrixAdaptation`]).

use std::sync::Arc;

use px_core::traits::{LogDensity, TransitionKernel};
use px_core::{Error, Result, Seed, Tensor, sanitize_seed};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adapt::PreconditionedResults;
use crate::preconditioning::MomentumDistribution;

/// HMC configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmcConfig {
    /// Leapfrog step size (default 0.1).
    pub step_size: f64,
    /// Leapfrog steps per transition (default 10).
    pub num_leapfrog_steps: usize,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self { step_size: 0.1, num_leapfrog_steps: 10 }
    }
}

/// Position-dependent part of a step's results.
#[derive(Debug, Clone)]
pub struct HmcStepResults {
    /// Target log density per chain.
    pub target_log_prob: Tensor,
    /// Gradient of the target log density per state part.
    pub grads_target_log_prob: Vec<Tensor>,
    /// Momentum distribution used for the step.
    pub momentum_distribution: MomentumDistribution,
}

/// Results threaded between [`PreconditionedHmc`] steps.
#[derive(Debug, Clone)]
pub struct PreconditionedHmcResults {
    /// Results at the current (accepted) state.
    pub accepted_results: HmcStepResults,
    /// Results at the last proposal.
    pub proposed_results: HmcStepResults,
    /// Per-chain acceptance of the last proposal.
    pub is_accepted: Vec<bool>,
    /// Per-chain `log(acceptance ratio)` of the last proposal.
    pub log_accept_ratio: Tensor,
}

impl PreconditionedResults for PreconditionedHmcResults {
    fn target_log_prob(&self) -> &Tensor {
        &self.accepted_results.target_log_prob
    }

    fn with_accepted_momentum_distribution(mut self, momentum_distribution: MomentumDistribution) -> Self {
        self.accepted_results.momentum_distribution = momentum_distribution;
        self
    }

    fn with_proposed_momentum_distribution(mut self, momentum_distribution: MomentumDistribution) -> Self {
        self.proposed_results.momentum_distribution = momentum_distribution;
        self
    }
}

#[inline]
fn metropolis_accept(log_accept: f64, u: f64) -> bool {
    // Accept with prob min(1, exp(log_accept)); NaN never accepts.
    debug_assert!(u > 0.0 && u < 1.0);
    u.ln() < log_accept
}

/// Fixed-trajectory HMC over batched state parts.
#[derive(Clone)]
pub struct PreconditionedHmc {
    target: Arc<dyn LogDensity>,
    config: HmcConfig,
}

impl std::fmt::Debug for PreconditionedHmc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreconditionedHmc").field("config", &self.config).finish()
    }
}

impl PreconditionedHmc {
    /// Create a kernel targeting `target`.
    pub fn new(target: Arc<dyn LogDensity>, config: HmcConfig) -> Result<Self> {
        if !(config.step_size.is_finite() && config.step_size > 0.0) {
            return Err(Error::Value(format!("step_size must be finite and > 0, got {}", config.step_size)));
        }
        if config.num_leapfrog_steps == 0 {
            return Err(Error::Value("num_leapfrog_steps must be > 0".into()));
        }
        Ok(Self { target, config })
    }

    /// Kernel configuration.
    pub fn config(&self) -> &HmcConfig {
        &self.config
    }

    fn eval(&self, state: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        let (lp, grads) = self.target.log_prob_and_grad(state)?;
        if grads.len() != state.len() {
            return Err(Error::Computation(format!(
                "target returned {} gradients for {} state parts",
                grads.len(),
                state.len()
            )));
        }
        Ok((lp, grads))
    }

    /// Integrate `num_leapfrog_steps` steps from `(q, p)`.
    fn leapfrog(
        &self,
        momentum_distribution: &MomentumDistribution,
        mut q: Vec<Tensor>,
        mut p: Vec<Tensor>,
        mut grads: Vec<Tensor>,
    ) -> Result<(Vec<Tensor>, Vec<Tensor>, Tensor, Vec<Tensor>)> {
        let eps = self.config.step_size;
        let mut lp = Tensor::scalar(f64::NAN);
        for _ in 0..self.config.num_leapfrog_steps {
            // Half-step momentum
            p = axpy(0.5 * eps, &grads, &p)?;
            // Full-step position
            let v = momentum_distribution.velocity(&p)?;
            q = axpy(eps, &v, &q)?;
            let (new_lp, new_grads) = self.eval(&q)?;
            lp = new_lp;
            grads = new_grads;
            // Half-step momentum
            p = axpy(0.5 * eps, &grads, &p)?;
        }
        Ok((q, p, lp, grads))
    }
}

/// `y + a * x`, part by part.
fn axpy(a: f64, x: &[Tensor], y: &[Tensor]) -> Result<Vec<Tensor>> {
    x.iter().zip(y).map(|(xi, yi)| yi.add(&xi.map(|v| a * v))).collect()
}

/// Per-chain choice between `proposed` and `current` along the leading
/// `accept.len()` elements of the batch.
fn select_chains(accept: &[bool], proposed: &Tensor, current: &Tensor) -> Result<Tensor> {
    let n = accept.len();
    if proposed.shape() != current.shape() || (n > 0 && proposed.size() % n != 0) {
        return Err(Error::Validation(format!(
            "cannot select {} chains between shapes {:?} and {:?}",
            n,
            proposed.shape(),
            current.shape()
        )));
    }
    let row = if n == 0 { 0 } else { proposed.size() / n };
    let (pv, cv) = (proposed.to_vec(), current.to_vec());
    let out = pv
        .chunks(row.max(1))
        .zip(cv.chunks(row.max(1)))
        .zip(accept)
        .flat_map(|((p, c), &a)| if a { p.to_vec() } else { c.to_vec() })
        .collect();
    Tensor::from_shape_vec(proposed.shape(), out)
}

impl TransitionKernel for PreconditionedHmc {
    type Results = PreconditionedHmcResults;

    fn one_step(
        &self,
        current_state: &[Tensor],
        previous_kernel_results: &PreconditionedHmcResults,
        seed: Option<&Seed>,
    ) -> Result<(Vec<Tensor>, PreconditionedHmcResults)> {
        let accepted = &previous_kernel_results.accepted_results;
        let momentum_distribution = &accepted.momentum_distribution;
        let (momentum_key, accept_key) = sanitize_seed(seed, "hmc").split2();

        let p0 = momentum_distribution.sample(&Seed::Stateless(momentum_key))?;
        let energy0 = accepted.target_log_prob.add(&momentum_distribution.log_prob(&p0)?)?;
        let (q1, p1, lp1, grads1) =
            self.leapfrog(momentum_distribution, current_state.to_vec(), p0, accepted.grads_target_log_prob.clone())?;
        let energy1 = lp1.add(&momentum_distribution.log_prob(&p1)?)?;
        let log_accept_ratio = energy1.sub(&energy0)?;

        let mut rng = accept_key.to_rng();
        let is_accepted: Vec<bool> =
            log_accept_ratio.to_vec().into_iter().map(|la| metropolis_accept(la, rng.random_range(f64::EPSILON..1.0))).collect();
        log::trace!(
            "hmc: accepted {}/{} chains",
            is_accepted.iter().filter(|&&a| a).count(),
            is_accepted.len()
        );

        let next_state =
            q1.iter().zip(current_state).map(|(q, c)| select_chains(&is_accepted, q, c)).collect::<Result<Vec<_>>>()?;
        let next_lp = select_chains(&is_accepted, &lp1, &accepted.target_log_prob)?;
        let next_grads = grads1
            .iter()
            .zip(&accepted.grads_target_log_prob)
            .map(|(g, c)| select_chains(&is_accepted, g, c))
            .collect::<Result<Vec<_>>>()?;

        let results = PreconditionedHmcResults {
            accepted_results: HmcStepResults {
                target_log_prob: next_lp,
                grads_target_log_prob: next_grads,
                momentum_distribution: momentum_distribution.clone(),
            },
            proposed_results: HmcStepResults {
                target_log_prob: lp1,
                grads_target_log_prob: grads1,
                momentum_distribution: momentum_distribution.clone(),
            },
            is_accepted,
            log_accept_ratio,
        };
        Ok((next_state, results))
    }

    fn bootstrap_results(&self, init_state: &[Tensor]) -> Result<PreconditionedHmcResults> {
        let (lp, grads) = self.eval(init_state)?;
        let batch_ndims = lp.rank();
        let unit: Vec<Tensor> = init_state.iter().map(|_| Tensor::scalar(1.0)).collect();
        let momentum_distribution = MomentumDistribution::new(init_state, batch_ndims, &unit)?;
        let is_accepted = vec![true; lp.size()];
        let log_accept_ratio = Tensor::zeros(lp.shape());
        let step = HmcStepResults { target_log_prob: lp, grads_target_log_prob: grads, momentum_distribution };
        Ok(PreconditionedHmcResults {
            accepted_results: step.clone(),
            proposed_results: step,
            is_accepted,
            log_accept_ratio,
        })
    }

    fn is_calibrated(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use px_core::SeedKey;

    /// Independent Gaussians with per-dim scales; leading axis is the chain.
    struct DiagGaussian {
        scales: Vec<f64>,
    }

    impl LogDensity for DiagGaussian {
        fn log_prob_and_grad(&self, state: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
            let x = &state[0];
            let s = Tensor::from_vec(self.scales.clone());
            let z = x.div(&s)?;
            let lp = z.map(|v| -0.5 * v * v).sum_trailing(1)?;
            let grad = z.div(&s)?.neg();
            Ok((lp, vec![grad]))
        }
    }

    fn kernel(scales: Vec<f64>, step_size: f64) -> PreconditionedHmc {
        PreconditionedHmc::new(Arc::new(DiagGaussian { scales }), HmcConfig { step_size, num_leapfrog_steps: 10 })
            .unwrap()
    }

    #[test]
    fn test_bootstrap_uses_unit_momentum() {
        let k = kernel(vec![1.0, 2.0], 0.1);
        let r = k.bootstrap_results(&[Tensor::zeros(&[3, 2])]).unwrap();
        assert_eq!(r.accepted_results.target_log_prob.shape(), &[3]);
        assert_eq!(r.accepted_results.momentum_distribution.batch_shape(), vec![3]);
        assert_eq!(r.is_accepted, vec![true; 3]);
        assert!(r.accepted_results.momentum_distribution.variances()[0].to_vec().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_step_is_deterministic_for_seed() {
        let k = kernel(vec![1.0, 2.0], 0.2);
        let state = vec![Tensor::from_shape_vec(&[2, 2], vec![0.5, -1.0, 1.0, 0.3]).unwrap()];
        let r0 = k.bootstrap_results(&state).unwrap();
        let seed = Seed::Stateless(SeedKey::from_u64(42));
        let (s1, r1) = k.one_step(&state, &r0, Some(&seed)).unwrap();
        let (s2, r2) = k.one_step(&state, &r0, Some(&seed)).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(r1.is_accepted, r2.is_accepted);
    }

    #[test]
    fn test_small_steps_mostly_accept_and_move() {
        let k = kernel(vec![1.0, 3.0], 0.05);
        let mut state = vec![Tensor::zeros(&[4, 2])];
        let mut r = k.bootstrap_results(&state).unwrap();
        let mut accepted = 0;
        for i in 0..50u64 {
            let (s, nr) = k.one_step(&state, &r, Some(&Seed::Stateless(SeedKey::from_u64(i)))).unwrap();
            accepted += nr.is_accepted.iter().filter(|&&a| a).count();
            state = s;
            r = nr;
        }
        assert!(accepted as f64 / 200.0 > 0.9, "acceptance too low: {}", accepted);
        assert!(state[0].to_vec().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_select_chains() {
        let p = Tensor::from_shape_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let c = Tensor::zeros(&[2, 2]);
        assert_eq!(select_chains(&[false, true], &p, &c).unwrap().to_vec(), vec![0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_invalid_config() {
        let target: Arc<dyn LogDensity> = Arc::new(DiagGaussian { scales: vec![1.0] });
        assert!(PreconditionedHmc::new(Arc::clone(&target), HmcConfig { step_size: 0.0, num_leapfrog_steps: 1 }).is_err());
        assert!(PreconditionedHmc::new(target, HmcConfig { step_size: 0.1, num_leapfrog_steps: 0 }).is_err());
    }

    #[test]
    fn test_metropolis_accept_contract() {
        assert!(metropolis_accept(0.0, 0.5));
        assert!(metropolis_accept(1.0, 0.999999));
        assert!(metropolis_accept(-1.0, 0.1));
        assert!(!metropolis_accept(-1.0, 0.5));
        assert!(!metropolis_accept(f64::NAN, 0.5));
    }

    #[test]
    fn test_config_json_defaults() {
        let cfg: HmcConfig = serde_json::from_str(r#"{"num_leapfrog_steps": 3}"#).unwrap();
        assert_eq!(cfg, HmcConfig { step_size: 0.1, num_leapfrog_steps: 3 });
    }
}
