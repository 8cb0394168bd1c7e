//! Finite-difference checks for the differentiable tensor ops.

use varformer_core::gradcheck::assert_gradient;
use varformer_core::{Result, Tensor};

fn weights(dims: &[usize]) -> Tensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| ((i * 7 % 11) as f32 - 5.0) / 5.0).collect();
    Tensor::from_f32(&data, dims)
}

fn input(dims: &[usize]) -> Tensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| ((i * 5 % 13) as f32 - 6.0) / 4.0).collect();
    Tensor::from_f32(&data, dims)
}

#[test]
fn grad_broadcast_div() -> Result<()> {
    let denom = input(&[3]).abs()?.add_scalar(1.0)?;
    let w = weights(&[2, 3]);
    assert_gradient(&|x| x.div(&denom)?.mul(&w)?.sum(), &input(&[2, 3]), 0.02, "div lhs")?;
    let num = input(&[2, 3]);
    assert_gradient(
        &|d| num.div(&d.abs()?.add_scalar(1.0)?)?.sum(),
        &input(&[3]),
        0.02,
        "div rhs",
    )
}

#[test]
fn grad_batched_matmul() -> Result<()> {
    let b = weights(&[2, 4, 3]);
    let w = weights(&[2, 2, 3]);
    assert_gradient(&|a| a.matmul(&b)?.mul(&w)?.sum(), &input(&[2, 2, 4]), 0.02, "matmul lhs")?;
    let a = input(&[2, 2, 4]);
    assert_gradient(&|b| a.matmul(b)?.mul(&w)?.sum(), &weights(&[4, 3]), 0.02, "matmul broadcast rhs")
}

#[test]
fn grad_softmax_and_log_softmax() -> Result<()> {
    let w = weights(&[2, 5]);
    assert_gradient(&|x| x.softmax()?.mul(&w)?.sum(), &input(&[2, 5]), 0.02, "softmax")?;
    assert_gradient(&|x| x.log_softmax()?.mul(&w)?.sum(), &input(&[2, 5]), 0.02, "log_softmax")
}

#[test]
fn grad_sum_last_keepdim_division() -> Result<()> {
    let w = weights(&[3, 4]);
    assert_gradient(
        &|x| {
            let e = x.exp()?;
            e.div(&e.sum_last_keepdim()?)?.mul(&w)?.sum()
        },
        &input(&[3, 4]),
        0.02,
        "normalize",
    )
}

#[test]
fn grad_unary_chain() -> Result<()> {
    assert_gradient(
        &|x| x.mul_scalar(0.5)?.exp()?.add_scalar(1.0)?.log()?.sqrt()?.pow_scalar(3.0)?.mean(),
        &input(&[6]),
        0.02,
        "unary chain",
    )
}

#[test]
fn grad_gather_scatter_and_cat() -> Result<()> {
    let w = weights(&[4, 3]);
    assert_gradient(
        &|x| {
            let picked = x.index_select(0, &[1, 1, 0])?;
            let merged = Tensor::zeros(&[4, 3]).index_add(0, &[3, 0, 3], &picked)?;
            let joined = Tensor::cat(&[&merged.narrow(0, 0, 2)?, &merged.narrow(0, 2, 2)?], 0)?;
            joined.mul(&w)?.sum()
        },
        &input(&[2, 3]),
        0.02,
        "gather/scatter",
    )
}

#[test]
fn grad_masked_fill_then_softmax() -> Result<()> {
    let mask = Tensor::from_f32(&[0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0], &[3, 3]);
    let w = weights(&[2, 3, 3]);
    assert_gradient(
        &|x| x.masked_fill(&mask, f32::NEG_INFINITY)?.softmax()?.mul(&w)?.sum(),
        &input(&[2, 3, 3]),
        0.02,
        "masked softmax",
    )
}
