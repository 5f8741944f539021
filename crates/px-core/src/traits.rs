//! Core traits for Probaxis
//!
//! Transition kernels are the seam between the adaptation wrappers in
//! `px-inference` and whatever inner sampler they drive. A wrapper only needs
//! the operations below; it never inspects the inner kernel's internals
//! beyond its result type. Gradient-based kernels consume targets through
//! [`LogDensity`].

use crate::seed::Seed;
use crate::tensor::Tensor;
use crate::Result;

/// One step of a Markov chain over a list of state parts.
pub trait TransitionKernel: Send + Sync {
    /// Per-step bookkeeping carried between calls.
    type Results: Clone + Send;

    /// Advance the chain by one step.
    ///
    /// `previous_kernel_results` must be the value returned by the preceding
    /// `one_step` (or `bootstrap_results`).
    fn one_step(
        &self,
        current_state: &[Tensor],
        previous_kernel_results: &Self::Results,
        seed: Option<&Seed>,
    ) -> Result<(Vec<Tensor>, Self::Results)>;

    /// Results for the first call to `one_step`.
    fn bootstrap_results(&self, init_state: &[Tensor]) -> Result<Self::Results>;

    /// `true` if the chain produced by this kernel targets the intended distribution.
    fn is_calibrated(&self) -> bool;
}

/// Unnormalized target density over a list of state parts.
pub trait LogDensity: Send + Sync {
    /// Log density (one value per batch member) and its gradient with
    /// respect to every state part.
    fn log_prob_and_grad(&self, state: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)>;
}
