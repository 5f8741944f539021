//! # px-inference
//!
//! Model execution and adaptive sampling for Probaxis.
//!
//! This crate provides:
//! - a joint-distribution executor driven by resumable model definitions
//! - a preconditioned HMC transition kernel
//! - diagonal mass-matrix adaptation on top of any HMC-like kernel
//!
//! ## Architecture
//!
//! Kernels talk to each other only through the `TransitionKernel` trait from
//! px-core; the adaptation wrapper reaches into inner results through the
//! [`adapt::PreconditionedResults`] trait and a caller-supplied setter.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Diagonal mass-matrix adaptation and running variance.
pub mod adapt;
/// Preconditioned HMC kernel.
pub mod hmc;
/// Coroutine joint-distribution executor.
pub mod joint;
/// Momentum distributions built from variance estimates.
pub mod preconditioning;

pub use adapt::{
    DiagonalMassMatrixAdaptation, DiagonalMassMatrixAdaptationResults, PreconditionedResults, RunningVariance,
    hmc_like_momentum_distribution_setter,
};
pub use hmc::{HmcConfig, PreconditionedHmc, PreconditionedHmcResults};
pub use joint::{JointConfig, JointDistributionCoroutine, ModelCoroutine, SequentialModel, Step, Yielded};
pub use preconditioning::MomentumDistribution;
