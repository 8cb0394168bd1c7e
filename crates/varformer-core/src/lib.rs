//! # varformer-core
//!
//! Core tensor engine for varformer.
//!
//! Provides the foundational `Tensor` type with:
//! - Contiguous f32 storage shared copy-on-write between clones
//! - NumPy-style broadcasting for element-wise ops
//! - Reverse-mode automatic differentiation with custom gradient rules
//! - Rayon-parallel reductions and batched matmul for large inputs

pub mod autograd;
pub mod error;
pub mod gradcheck;
pub mod ops;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use autograd::{GradFn, GradNode, NoGradGuard};
pub use error::VarError;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, VarError>;
