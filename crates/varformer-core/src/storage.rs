use std::sync::Arc;

/// Reference-counted f32 buffer backing one or more tensors.
///
/// Clones share the allocation. Mutation goes through [`Storage::make_mut`], which
/// copies the buffer first if another tensor still holds it.
#[derive(Clone, Debug)]
pub struct Storage {
    data: Arc<Vec<f32>>,
}

impl Storage {
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub fn zeros(numel: usize) -> Self {
        Self::from_vec(vec![0.0; numel])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access, copy-on-write.
    pub fn make_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Whether this is the only handle to the buffer.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    /// Whether two handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_until_written() {
        let a = Storage::from_vec(vec![1.0, 2.0]);
        let mut b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.is_unique());

        b.make_mut()[0] = 5.0;
        assert!(!a.ptr_eq(&b));
        assert_eq!(a.as_slice(), &[1.0, 2.0]);
        assert_eq!(b.as_slice(), &[5.0, 2.0]);
    }
}
