//! Embedding layer: lookup table from token ids to dense vectors.

use rand::Rng;
use varformer_core::{Result, Tensor, VarError};

use crate::linear::INIT_STD;
use crate::module::Module;

pub struct Embedding {
    weight: Tensor,
}

impl Embedding {
    pub fn new(num_embeddings: usize, embedding_dim: usize) -> Self {
        Self::with_rng(num_embeddings, embedding_dim, INIT_STD, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(num_embeddings: usize, embedding_dim: usize, std: f32, rng: &mut R) -> Self {
        Self {
            weight: Tensor::randn_with(&[num_embeddings, embedding_dim], std, rng).with_requires_grad(),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Rows for `ids`, shape `[ids.len(), embedding_dim]`.
    pub fn lookup(&self, ids: &[usize]) -> Result<Tensor> {
        self.weight.index_select(0, ids)
    }

    /// Keep only the first `n` rows (used to shrink position tables).
    pub fn truncate(&mut self, n: usize) -> Result<()> {
        if n > self.num_embeddings() {
            return Err(VarError::IndexOutOfRange {
                index: n,
                size: self.num_embeddings(),
            });
        }
        self.weight = self.weight.detach().narrow(0, 0, n)?.with_requires_grad();
        Ok(())
    }
}

impl Module for Embedding {
    /// Input holds token ids stored as floats, any shape; output appends `embedding_dim`.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let ids: Vec<usize> = input.as_f32_slice().iter().map(|&v| v as usize).collect();
        let rows = self.lookup(&ids)?;
        let mut dims: Vec<isize> = input.dims().iter().map(|&d| d as isize).collect();
        dims.push(self.embedding_dim() as isize);
        rows.reshape(&dims)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".to_string(), &self.weight)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("weight".to_string(), &mut self.weight)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_lookup_and_gradient_scatter() {
        let mut rng = StdRng::seed_from_u64(0);
        let emb = Embedding::with_rng(5, 3, 1.0, &mut rng);
        let rows = emb.lookup(&[1, 4, 1]).unwrap();
        assert_eq!(rows.dims(), &[3, 3]);
        assert_eq!(&rows.to_vec()[0..3], &emb.weight().to_vec()[3..6]);
        rows.sum().unwrap().backward().unwrap();
        let g = emb.weight().grad().unwrap().to_vec();
        assert_eq!(&g[3..6], &[2.0, 2.0, 2.0]);
        assert_eq!(&g[12..15], &[1.0, 1.0, 1.0]);
        assert_eq!(&g[0..3], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_forward_shape_and_bounds() {
        let emb = Embedding::new(4, 2);
        let ids = Tensor::from_f32(&[0.0, 1.0, 2.0, 3.0], &[2, 2]);
        assert_eq!(emb.forward(&ids).unwrap().dims(), &[2, 2, 2]);
        assert!(emb.lookup(&[4]).is_err());
    }

    #[test]
    fn test_truncate() {
        let mut emb = Embedding::new(8, 2);
        let head = emb.weight().to_vec()[..6].to_vec();
        emb.truncate(3).unwrap();
        assert_eq!(emb.weight().dims(), &[3, 2]);
        assert_eq!(emb.weight().to_vec(), head);
        assert!(emb.truncate(4).is_err());
    }
}
