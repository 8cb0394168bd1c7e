//! Reverse-mode automatic differentiation.
//!
//! Every differentiable op records a [`GradNode`] holding a [`GradFn`] and strong
//! references to the nodes of its inputs. [`backward`] walks that graph in reverse
//! topological order so a node consumed several times (a parameter shared across
//! layers, a residual stream) has its full gradient before it propagates further.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

// ============================================================================
// GradFn trait
// ============================================================================

/// Backward rule of one differentiable operation.
///
/// This is also the extension point for custom gradients: an op can compute its
/// forward result any way it likes and pair it with an arbitrary `GradFn` through
/// [`Tensor::attach_grad_fn`].
pub trait GradFn: Send + Sync {
    /// Gradients for each input, in the order the inputs were attached.
    ///
    /// `None` means the input receives no gradient from this op.
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;

    fn name(&self) -> &str;
}

// ============================================================================
// GradNode
// ============================================================================

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the computation graph.
///
/// Inputs that do not track gradients are kept as `None` so that the gradient
/// list returned by the `GradFn` stays aligned with the op's argument order.
pub struct GradNode {
    pub id: usize,
    pub grad_fn: Option<Box<dyn GradFn>>,
    pub inputs: Vec<Option<Arc<GradNode>>>,
    pub grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    /// Leaf node for a trainable tensor.
    pub fn leaf() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: None,
            inputs: Vec::new(),
            grad: RwLock::new(None),
        })
    }

    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Option<Arc<GradNode>>>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: Some(grad_fn),
            inputs,
            grad: RwLock::new(None),
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let mut slot = self.grad.write();
        let next = match slot.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        };
        *slot = Some(next);
        Ok(())
    }

    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    pub fn zero_grad(&self) {
        *self.grad.write() = None;
    }
}

// ============================================================================
// Backward pass
// ============================================================================

/// Propagate `grad_output` from `root` to every reachable leaf.
///
/// Runs with gradient recording disabled so the backward computations themselves
/// never extend the graph.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) -> Result<()> {
    let _guard = NoGradGuard::new();
    root.accumulate_grad(&grad_output)?;

    for node in topological_order(root) {
        let Some(grad_fn) = node.grad_fn.as_ref() else {
            continue;
        };
        let Some(grad) = node.get_grad() else {
            continue;
        };

        let input_grads = grad_fn.apply(&grad)?;
        for (input, maybe_grad) in node.inputs.iter().zip(input_grads) {
            if let (Some(input), Some(g)) = (input, maybe_grad) {
                input.accumulate_grad(&g)?;
            }
        }
        // Interior gradients are consumed once propagated.
        node.zero_grad();
    }
    Ok(())
}

/// Nodes ordered so that each one precedes all of its inputs.
fn topological_order(root: &Arc<GradNode>) -> Vec<Arc<GradNode>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Arc<GradNode>, bool)> = vec![(Arc::clone(root), false)];

    while let Some((node, finished)) = stack.pop() {
        if finished {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for input in node.inputs.iter().flatten() {
            if !visited.contains(&input.id) {
                stack.push((Arc::clone(input), false));
            }
        }
    }

    order.reverse();
    order
}

// ============================================================================
// No-grad scope
// ============================================================================

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| g.replace(enabled))
}

/// RAII guard that disables graph recording on this thread while alive.
///
/// ```
/// use varformer_core::{NoGradGuard, Tensor};
///
/// let w = Tensor::ones(&[2]).with_requires_grad();
/// let y = {
///     let _guard = NoGradGuard::new();
///     w.mul_scalar(3.0).unwrap()
/// };
/// assert!(!y.tracks_grad());
/// ```
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        Self {
            prev: set_grad_enabled(false),
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

// ============================================================================
// Built-in gradient functions
// ============================================================================

/// `a + b` with broadcasting; each side gets the gradient summed back to its shape.
pub struct AddBackward {
    pub lhs_shape: Shape,
    pub rhs_shape: Shape,
}

impl GradFn for AddBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(grad_output.sum_to_shape(&self.lhs_shape)?),
            Some(grad_output.sum_to_shape(&self.rhs_shape)?),
        ])
    }
    fn name(&self) -> &str {
        "AddBackward"
    }
}

pub struct SubBackward {
    pub lhs_shape: Shape,
    pub rhs_shape: Shape,
}

impl GradFn for SubBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(grad_output.sum_to_shape(&self.lhs_shape)?),
            Some(grad_output.neg()?.sum_to_shape(&self.rhs_shape)?),
        ])
    }
    fn name(&self) -> &str {
        "SubBackward"
    }
}

pub struct MulBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for MulBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad_a = grad_output.mul(&self.rhs)?.sum_to_shape(self.lhs.shape())?;
        let grad_b = grad_output.mul(&self.lhs)?.sum_to_shape(self.rhs.shape())?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }
    fn name(&self) -> &str {
        "MulBackward"
    }
}

/// `a / b`: `da = g / b`, `db = -g * a / b^2`.
pub struct DivBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for DivBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad_a = grad_output.div(&self.rhs)?.sum_to_shape(self.lhs.shape())?;
        let rhs_sq = self.rhs.mul(&self.rhs)?;
        let grad_b = grad_output
            .mul(&self.lhs)?
            .div(&rhs_sq)?
            .neg()?
            .sum_to_shape(self.rhs.shape())?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }
    fn name(&self) -> &str {
        "DivBackward"
    }
}

/// Element-wise op whose local derivative was captured during the forward pass.
pub struct ElementwiseBackward {
    pub derivative: Tensor,
    pub op: &'static str,
}

impl GradFn for ElementwiseBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.mul(&self.derivative)?)])
    }
    fn name(&self) -> &str {
        self.op
    }
}

/// Full reduction to a scalar: the gradient is broadcast back to the input shape.
pub struct SumBackward {
    pub input_shape: Shape,
    pub scale: f32,
}

impl GradFn for SumBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let g = grad_output.item()? * self.scale;
        Ok(vec![Some(Tensor::full(self.input_shape.dims(), g))])
    }
    fn name(&self) -> &str {
        "SumBackward"
    }
}

/// `A @ B`: `dA = G @ B^T`, `dB = A^T @ G`, reduced over broadcast batch dims.
pub struct MatmulBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for MatmulBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let rhs_t = self.rhs.transpose(-2, -1)?;
        let lhs_t = self.lhs.transpose(-2, -1)?;
        let grad_a = grad_output.matmul(&rhs_t)?.sum_to_shape(self.lhs.shape())?;
        let grad_b = lhs_t.matmul(grad_output)?.sum_to_shape(self.rhs.shape())?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }
    fn name(&self) -> &str {
        "MatmulBackward"
    }
}
