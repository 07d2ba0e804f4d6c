use num_traits::Float;

use crate::{CnError, CnResult};

/// A 4-D tensor in CRDB order: C (columns) is the fastest-varying axis,
/// then R (rows), then D (depth/channels), then B (batch).
///
/// The element `(r, c, d, b)` lives at `((b*D + d)*R + r)*C + c`, so each
/// batch item occupies one contiguous slab of `R*C*D` elements and each
/// `(d, b)` plane one contiguous run of `R*C` elements.
#[derive(Clone, Debug, PartialEq)]
pub struct LogicalCube<T = f32> {
    data: Vec<T>,
    pub r: usize,
    pub c: usize,
    pub d: usize,
    pub b: usize,
}

impl<T: Float> LogicalCube<T> {
    /// Allocates a zero-filled cube.
    pub fn new(r: usize, c: usize, d: usize, b: usize) -> Self {
        Self {
            data: vec![T::zero(); r * c * d * b],
            r,
            c,
            d,
            b,
        }
    }

    /// Wraps an existing buffer. The length must match the dimensions.
    pub fn from_vec(data: Vec<T>, r: usize, c: usize, d: usize, b: usize) -> CnResult<Self> {
        if data.len() != r * c * d * b {
            return Err(CnError::shapes(&[r, c, d, b], &[data.len()]));
        }
        Ok(Self { data, r, c, d, b })
    }

    pub fn n_elements(&self) -> usize {
        self.data.len()
    }

    /// Number of elements in one batch item's slab.
    pub fn slab_len(&self) -> usize {
        self.r * self.c * self.d
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.r, self.c, self.d, self.b]
    }

    #[inline]
    pub fn logical_index(&self, r: usize, c: usize, d: usize, b: usize) -> usize {
        debug_assert!(r < self.r && c < self.c && d < self.d && b < self.b);
        ((b * self.d + d) * self.r + r) * self.c + c
    }

    #[inline]
    pub fn logical_get(&self, r: usize, c: usize, d: usize, b: usize) -> T {
        self.data[self.logical_index(r, c, d, b)]
    }

    #[inline]
    pub fn logical_set(&mut self, r: usize, c: usize, d: usize, b: usize, value: T) {
        let idx = self.logical_index(r, c, d, b);
        self.data[idx] = value;
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// The contiguous `R*C*D` slab of batch item `b`.
    pub fn batch_slice(&self, b: usize) -> &[T] {
        let slab = self.slab_len();
        &self.data[b * slab..(b + 1) * slab]
    }

    pub fn batch_slice_mut(&mut self, b: usize) -> &mut [T] {
        let slab = self.slab_len();
        &mut self.data[b * slab..(b + 1) * slab]
    }

    /// Contiguous slabs of batch items `b0..b1`.
    pub fn batch_range(&self, b0: usize, b1: usize) -> &[T] {
        let slab = self.slab_len();
        &self.data[b0 * slab..b1 * slab]
    }

    pub fn batch_range_mut(&mut self, b0: usize, b1: usize) -> &mut [T] {
        let slab = self.slab_len();
        &mut self.data[b0 * slab..b1 * slab]
    }

    pub fn fill(&mut self, value: T) {
        for v in self.data.iter_mut() {
            *v = value;
        }
    }

    pub fn reset(&mut self) {
        self.fill(T::zero());
    }

    pub fn copy_from(&mut self, other: &Self) -> CnResult<()> {
        if self.data.len() != other.data.len() {
            return Err(CnError::shapes(&self.shape(), &other.shape()));
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_index_is_crdb() {
        let mut cube = LogicalCube::<f32>::new(2, 3, 4, 5);
        // C fastest, then R, D, B.
        assert_eq!(cube.logical_index(0, 1, 0, 0), 1);
        assert_eq!(cube.logical_index(1, 0, 0, 0), 3);
        assert_eq!(cube.logical_index(0, 0, 1, 0), 6);
        assert_eq!(cube.logical_index(0, 0, 0, 1), 24);
        cube.logical_set(1, 2, 3, 4, 7.0);
        assert_eq!(cube.logical_get(1, 2, 3, 4), 7.0);
    }

    #[test]
    fn batch_slab_is_contiguous() {
        let mut cube = LogicalCube::<f32>::new(2, 2, 3, 4);
        for b in 0..4 {
            for i in 0..cube.slab_len() {
                cube.batch_slice_mut(b)[i] = b as f32;
            }
        }
        assert!(cube.batch_slice(2).iter().all(|&v| v == 2.0));
        assert_eq!(cube.batch_range(1, 3).len(), 2 * cube.slab_len());
        assert_eq!(cube.batch_range(1, 3)[0], 1.0);
    }

    #[test]
    fn from_vec_rejects_bad_length() {
        assert!(LogicalCube::from_vec(vec![0.0f32; 5], 2, 2, 2, 2).is_err());
    }
}
