use std::fmt;
use std::sync::Arc;

use rand::Rng;

use crate::autograd::{self, GradFn, GradNode};
use crate::error::VarError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A dense, row-major f32 array with optional gradient tracking.
///
/// Clones are cheap: they share storage and, if present, the autograd node. A tensor
/// that tracks gradients carries a [`GradNode`]; parameters get a leaf node through
/// [`Tensor::set_requires_grad`], op results get an interior node when any input tracks.
///
/// ```
/// use varformer_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.dims(), &[2, 2]);
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor by copying `data`.
    ///
    /// # Panics
    /// If `data.len()` does not match the element count of `shape`.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_parts(data.to_vec(), s)
    }

    /// Take ownership of `data`, validating the element count.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(VarError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self::from_parts(data, s))
    }

    pub(crate) fn from_parts(data: Vec<f32>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.numel());
        Self {
            storage: Storage::from_vec(data),
            shape,
            requires_grad: false,
            grad_node: None,
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        Self::from_parts(vec![value; s.numel()], s)
    }

    pub fn scalar(value: f32) -> Self {
        Self::from_parts(vec![value], Shape::scalar())
    }

    /// `[0, 1, ..., n-1]` as a 1-D tensor.
    pub fn arange(n: usize) -> Self {
        Self::from_parts((0..n).map(|i| i as f32).collect(), Shape::new(&[n]))
    }

    /// Standard-normal samples from the thread RNG.
    pub fn randn(shape: &[usize]) -> Self {
        Self::randn_with(shape, 1.0, &mut rand::thread_rng())
    }

    /// Normal(0, `std`) samples via Box-Muller from the caller's RNG.
    pub fn randn_with<R: Rng + ?Sized>(shape: &[usize], std: f32, rng: &mut R) -> Self {
        let s = Shape::new(shape);
        let n = s.numel();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            data.push(r * theta.cos() * std);
            data.push(r * theta.sin() * std);
        }
        data.truncate(n);
        Self::from_parts(data, s)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn as_f32_slice(&self) -> &[f32] {
        self.storage.as_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.storage.as_slice().to_vec()
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.numel() != 1 {
            return Err(VarError::NotScalar(self.dims().to_vec()));
        }
        Ok(self.storage.as_slice()[0])
    }

    /// Element at a full multi-index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        if index.len() != self.ndim() {
            return Err(VarError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: index.to_vec(),
            });
        }
        let strides = self.shape.contiguous_strides();
        let mut offset = 0;
        for ((&i, &d), &s) in index.iter().zip(self.dims()).zip(strides.iter()) {
            if i >= d {
                return Err(VarError::IndexOutOfRange { index: i, size: d });
            }
            offset += i * s;
        }
        Ok(self.storage.as_slice()[offset])
    }

    /// Overwrite the values in place, keeping shape and autograd identity.
    ///
    /// Used by optimizers, checkpoint loading and pruning between passes.
    pub fn copy_from(&mut self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(VarError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: other.dims().to_vec(),
            });
        }
        self.storage.make_mut().copy_from_slice(other.as_f32_slice());
        Ok(())
    }

    /// Mutate the values in place, keeping shape and autograd identity.
    pub fn update_data(&mut self, f: impl FnOnce(&mut [f32])) {
        f(self.storage.make_mut());
    }

    /// Same values under a new shape. Callers guarantee matching element counts.
    pub(crate) fn with_shape(&self, shape: Shape) -> Tensor {
        Tensor {
            storage: self.storage.clone(),
            shape,
            requires_grad: false,
            grad_node: None,
        }
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Mark this tensor as a trainable leaf (or strip its tracking).
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad {
            if self.grad_node.is_none() {
                self.grad_node = Some(GradNode::leaf());
            }
        } else {
            self.grad_node = None;
        }
    }

    /// Builder form of [`Tensor::set_requires_grad`]`(true)`.
    pub fn with_requires_grad(mut self) -> Self {
        self.set_requires_grad(true);
        self
    }

    /// Whether this tensor participates in a recorded graph.
    pub fn tracks_grad(&self) -> bool {
        self.grad_node.is_some()
    }

    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    pub(crate) fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.grad_node = Some(node);
        self
    }

    /// Accumulated gradient of a leaf after [`Tensor::backward`].
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    pub fn zero_grad(&self) {
        if let Some(node) = &self.grad_node {
            node.zero_grad();
        }
    }

    /// Same values, no graph.
    pub fn detach(&self) -> Tensor {
        self.with_shape(self.shape.clone())
    }

    /// Whether two tensors are the same trainable leaf.
    pub fn same_node(&self, other: &Tensor) -> bool {
        match (&self.grad_node, &other.grad_node) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Run reverse-mode differentiation from this single-element tensor.
    pub fn backward(&self) -> Result<()> {
        if self.numel() != 1 {
            return Err(VarError::NotScalar(self.dims().to_vec()));
        }
        let Some(node) = &self.grad_node else {
            return Ok(());
        };
        autograd::backward(node, Tensor::ones(self.dims()))
    }

    /// Attach a custom backward rule to an already computed forward result.
    ///
    /// Nothing is recorded when graph recording is disabled or no input tracks
    /// gradients. The gradients returned by `grad_fn` must follow `inputs` order.
    pub fn attach_grad_fn<F: GradFn + 'static>(self, grad_fn: F, inputs: &[&Tensor]) -> Tensor {
        if !autograd::is_grad_enabled() || !inputs.iter().any(|t| t.tracks_grad()) {
            return self;
        }
        let nodes = inputs.iter().map(|t| t.grad_node.clone()).collect();
        self.with_grad_node(GradNode::with_grad_fn(Box::new(grad_fn), nodes))
    }

    /// Whether an op over `inputs` should record a graph node.
    pub fn should_record(inputs: &[&Tensor]) -> bool {
        autograd::is_grad_enabled() && inputs.iter().any(|t| t.tracks_grad())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, requires_grad={}, tracked={})",
            self.shape,
            self.requires_grad,
            self.grad_node.is_some()
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.as_f32_slice();
        let shown: Vec<String> = data.iter().take(8).map(|v| format!("{v:.4}")).collect();
        let more = if data.len() > 8 { ", ..." } else { "" };
        write!(f, "tensor([{}{}], shape={})", shown.join(", "), more, self.shape)
    }
}
