//! Transformation algebra and distributions for Probaxis.
//!
//! This crate hosts the bijector contract and what it leans on:
//! - shape/rank bookkeeping for log-det-Jacobian reduction
//! - the per-instance forward/inverse result cache
//! - reference transforms and their composition
//! - base and transformed distributions
//! - small numeric helpers (stable log/exp/sigmoid primitives)

pub mod bijector;
pub mod cache;
pub mod chain;
pub mod distribution;
pub mod exponential;
pub mod gamma;
pub mod independent;
pub mod math;
pub mod normal;
pub mod params;
pub mod shape;
pub mod transformed;
pub mod transforms;

pub use bijector::{Applied, Bijector, BijectorConfig, BijectorImpl, Operand, Preimage};
pub use chain::Chain;
pub use distribution::Distribution;
pub use params::{Kwargs, ParamValue, Parameters};
pub use transformed::TransformedDistribution;
