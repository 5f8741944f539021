//! # px-core
//!
//! Core types for Probaxis.
//!
//! This crate provides:
//! - the shared error taxonomy ([`Error`], [`Result`])
//! - nested structures ([`Tree`]) used for ranks, shapes, dtypes and values
//! - immutable tensors with identity tokens ([`Tensor`])
//! - stateless and legacy seeds ([`Seed`])
//! - the [`TransitionKernel`] trait

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy.
pub mod error;
/// Stateless keys, legacy seeds and seed streams.
pub mod seed;
/// Shared immutable n-d arrays.
pub mod tensor;
/// Kernel traits.
pub mod traits;
/// Nested structures.
pub mod tree;

pub use error::{Error, Result};
pub use seed::{Seed, SeedKey, SeedStream, sanitize_seed};
pub use tensor::{DType, Tensor, TensorId, Value, WeakTensor, broadcast_shapes};
pub use traits::{LogDensity, TransitionKernel};
pub use tree::Tree;
