//! Attention masks for `masked_fill`: 1.0 marks a blocked position, 0.0 an allowed one.

use varformer_core::Tensor;

/// Query `i` may attend to key `j` iff `j <= i` and, with a window, `i - j < window`.
pub fn allowed(i: usize, j: usize, window: Option<usize>) -> bool {
    j <= i && window.map_or(true, |w| i - j < w)
}

fn build(seq_len: usize, window: Option<usize>) -> Tensor {
    let data: Vec<f32> = (0..seq_len * seq_len)
        .map(|idx| {
            let (i, j) = (idx / seq_len, idx % seq_len);
            if allowed(i, j, window) {
                0.0
            } else {
                1.0
            }
        })
        .collect();
    Tensor::from_f32(&data, &[seq_len, seq_len])
}

/// `[T, T]` lower-triangular causal mask.
pub fn causal_mask(seq_len: usize) -> Tensor {
    build(seq_len, None)
}

/// Causal mask that also hides keys `window` or more positions back.
pub fn sliding_window_mask(seq_len: usize, window: usize) -> Tensor {
    build(seq_len, Some(window))
}
