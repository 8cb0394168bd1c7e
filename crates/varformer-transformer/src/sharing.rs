//! Layer-to-instance mapping for shared attention/MLP sub-units.

use tracing::debug;
use varformer_core::{Result, VarError};

/// Which arena entry each layer position uses.
///
/// A new entry starts at every layer `i` with `i % group == 0`; the layers up to the
/// next boundary alias it. With `symmetric`, only the first half (including the
/// middle layer when `N` is odd) is laid out and the rest mirrors it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedLayout {
    pub arena_len: usize,
    pub indices: Vec<usize>,
}

impl SharedLayout {
    pub fn new(n_layer: usize, group: usize, symmetric: bool) -> Result<Self> {
        if group == 0 {
            return Err(VarError::config("shared group size must be >= 1"));
        }
        let built = if symmetric { n_layer.div_ceil(2) } else { n_layer };
        let mut indices: Vec<usize> = (0..built).map(|i| i / group).collect();
        if symmetric {
            let mirrored: Vec<usize> = indices[..n_layer - built].iter().rev().copied().collect();
            indices.extend(mirrored);
        }
        let arena_len = indices.iter().max().map_or(0, |m| m + 1);
        debug!(n_layer, group, symmetric, arena_len, ?indices, "shared layout");
        Ok(Self { arena_len, indices })
    }

    /// One instance per layer.
    pub fn unshared(n_layer: usize) -> Self {
        Self {
            arena_len: n_layer,
            indices: (0..n_layer).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Layer positions that use arena entry `slot`.
    pub fn positions(&self, slot: usize) -> Vec<usize> {
        self.indices
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == slot)
            .map(|(i, _)| i)
            .collect()
    }

    /// First layer that uses `slot`; it decides the entry's kind when layers differ.
    pub fn first_use(&self, slot: usize) -> Option<usize> {
        self.indices.iter().position(|&s| s == slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(n: usize, g: usize, sym: bool) -> Vec<usize> {
        SharedLayout::new(n, g, sym).unwrap().indices
    }

    #[test]
    fn test_grouping_without_mirror() {
        assert_eq!(layout(6, 2, false), vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(layout(5, 2, false), vec![0, 0, 1, 1, 2]);
        assert_eq!(layout(4, 1, false), vec![0, 1, 2, 3]);
        assert_eq!(layout(3, 5, false), vec![0, 0, 0]);
    }

    #[test]
    fn test_symmetric_mirror() {
        assert_eq!(layout(6, 1, true), vec![0, 1, 2, 2, 1, 0]);
        assert_eq!(layout(5, 1, true), vec![0, 1, 2, 1, 0]);
        assert_eq!(layout(6, 2, true), vec![0, 0, 1, 1, 0, 0]);
        assert_eq!(layout(1, 1, true), vec![0]);
    }

    #[test]
    fn test_arena_and_positions() {
        let l = SharedLayout::new(5, 1, true).unwrap();
        assert_eq!(l.arena_len, 3);
        assert_eq!(l.positions(1), vec![1, 3]);
        assert_eq!(l.first_use(2), Some(2));
        assert_eq!(l.first_use(3), None);
        assert_eq!(SharedLayout::unshared(3), SharedLayout::new(3, 1, false).unwrap());
        assert!(SharedLayout::new(4, 0, false).unwrap_err().is_config_error());
    }
}
