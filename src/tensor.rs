//! Tensor Operations
//!
//! A minimal tensor type for transformer computations. Tensors store a flat
//! `Vec<f32>` in row-major order with shape and stride information.
//!
//! The operation set is exactly what the forward and backward passes need:
//! matrix multiplication (plus the two transposed variants that gradient
//! computations and the tied-weight head use constantly), row softmax,
//! broadcasting addition for biases, and row-level access for embedding
//! lookups and scatter-adds.
//!
//! ## Performance
//!
//! Large matrix multiplications use a cache-blocked algorithm parallelized
//! across output rows with Rayon; small ones stay sequential to avoid the
//! parallel overhead. The 1000-operation threshold and 8x8 block size balance
//! cache efficiency against thread startup cost.

use rayon::prelude::*;

/// Work threshold below which matmuls stay sequential.
const PAR_THRESHOLD: usize = 1_000;

/// A multi-dimensional array of f32 values in row-major layout.
///
/// For shape `[2, 3]` the data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` with strides `[3, 1]`.
#[derive(Clone, Debug)]
pub struct Tensor {
    /// Flat storage of all elements.
    pub data: Vec<f32>,
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Step sizes for each dimension, computed from the shape.
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from data and shape.
    ///
    /// # Panics
    ///
    /// Panics if the product of the shape does not equal the data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );
        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a zero-filled tensor.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Strides for row-major layout: shape `[d0, d1, d2]` gives
    /// `[d1*d2, d2, 1]`.
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of rows of a 2-D tensor.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Borrow row `i` of a 2-D tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.shape[1];
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Mutably borrow row `i` of a 2-D tensor.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.shape[1];
        &mut self.data[i * cols..(i + 1) * cols]
    }

    /// Copy rows `start..end` of a 2-D tensor into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        let cols = self.shape[1];
        let data = self.data[start * cols..end * cols].to_vec();
        Tensor::new(data, vec![end - start, cols])
    }

    /// Inner loop of the blocked matmul: `result[j] += a_val * b[j]`.
    ///
    /// Written as a plain zipped loop so LLVM auto-vectorizes it.
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication: `[m, k] @ [k, n] -> [m, n]`.
    ///
    /// # Panics
    ///
    /// Panics if the inner dimensions are incompatible or either operand is
    /// not 2-D.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape.len(), 2, "matmul expects 2-D operands");
        assert_eq!(other.shape.len(), 2, "matmul expects 2-D operands");
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let n = other.shape[1];
        let k = self.shape[1];

        if m * n * k >= PAR_THRESHOLD {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::matmul_inner_simd(
                    a_val,
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Cache-blocked parallel matmul for large matrices.
    ///
    /// Processes 8x8 blocks and distributes row blocks across threads.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// `self @ other^T`: `[m, k] @ [n, k]^T -> [m, n]`.
    ///
    /// Each output element is a dot product of two contiguous rows, so this
    /// is both cache-friendly and free of the transpose copy. It is the
    /// workhorse of the tied-weight head (`hidden @ embedding^T`) and of
    /// `grad_x = grad_y @ W^T` in linear backward passes.
    pub fn matmul_transpose_b(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.shape[1], other.shape[1],
            "Inner dimensions incompatible: [{}, {}] @ [{}, {}]^T",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let n = other.shape[0];
        let k = self.shape[1];

        let mut result = vec![0.0; m * n];
        let compute_row = |i: usize, out_row: &mut [f32]| {
            let a_row = &self.data[i * k..(i + 1) * k];
            for (j, out) in out_row.iter_mut().enumerate() {
                let b_row = &other.data[j * k..(j + 1) * k];
                let mut sum = 0.0;
                for l in 0..k {
                    sum += a_row[l] * b_row[l];
                }
                *out = sum;
            }
        };

        if m * n * k >= PAR_THRESHOLD {
            result
                .par_chunks_mut(n)
                .enumerate()
                .for_each(|(i, out_row)| compute_row(i, out_row));
        } else {
            for (i, out_row) in result.chunks_mut(n).enumerate() {
                compute_row(i, out_row);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// `self^T @ other`: `[r, m]^T @ [r, n] -> [m, n]`.
    ///
    /// Used for weight gradients (`grad_W = x^T @ grad_y`) and for the
    /// embedding-table gradient of the tied head.
    pub fn matmul_transpose_a(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.shape[0], other.shape[0],
            "Outer dimensions incompatible: [{}, {}]^T @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let r = self.shape[0];
        let m = self.shape[1];
        let n = other.shape[1];

        let mut result = vec![0.0; m * n];
        let compute_row = |i: usize, out_row: &mut [f32]| {
            for t in 0..r {
                let a_val = self.data[t * m + i];
                Self::matmul_inner_simd(a_val, &other.data[t * n..(t + 1) * n], out_row);
            }
        };

        if r * m * n >= PAR_THRESHOLD {
            result
                .par_chunks_mut(n)
                .enumerate()
                .for_each(|(i, out_row)| compute_row(i, out_row));
        } else {
            for (i, out_row) in result.chunks_mut(n).enumerate() {
                compute_row(i, out_row);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Row-wise softmax of a 2-D tensor.
    ///
    /// Numerically stable: subtracts the row maximum before exponentiating,
    /// which leaves the result unchanged but prevents overflow.
    pub fn softmax_rows(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "softmax_rows expects a 2-D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];

        let result: Vec<f32> = (0..rows)
            .into_par_iter()
            .flat_map_iter(|i| {
                let row = &self.data[i * cols..(i + 1) * cols];
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let exp_values: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
                let sum: f32 = exp_values.iter().sum();
                exp_values.into_iter().map(move |val| val / sum)
            })
            .collect();

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition, broadcasting a trailing-dimension vector.
    ///
    /// Supports an exact shape match and `[*, n] + [n]` (bias addition).
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() > other.shape.len() {
            let last_dim = *self.shape.last().unwrap_or(&0);
            if other.data.len() == last_dim {
                let result: Vec<f32> = (0..self.data.len())
                    .into_par_iter()
                    .map(|i| self.data[i] + other.data[i % last_dim])
                    .collect();
                return Tensor::new(result, self.shape.clone());
            }
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// Multiply every element by a scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn matmul_identity() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let id = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
        let c = a.matmul(&id);
        assert_eq!(c.data, a.data);
    }

    #[test]
    fn matmul_large_matches_naive() {
        // Big enough to exercise the parallel blocked path.
        let m = 17;
        let k = 13;
        let n = 11;
        let a_data: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.37).sin()).collect();
        let b_data: Vec<f32> = (0..k * n).map(|i| (i as f32 * 0.11).cos()).collect();
        let a = Tensor::new(a_data, vec![m, k]);
        let b = Tensor::new(b_data, vec![k, n]);

        let c = a.matmul(&b);
        for i in 0..m {
            for j in 0..n {
                let mut expected = 0.0;
                for l in 0..k {
                    expected += a.data[i * k + l] * b.data[l * n + j];
                }
                assert_relative_eq!(
                    c.data[i * n + j],
                    expected,
                    max_relative = 1e-4,
                    epsilon = 1e-5
                );
            }
        }
    }

    #[test]
    fn transposed_matmuls_match_plain() {
        let a = Tensor::new((0..6).map(|i| i as f32).collect(), vec![2, 3]);
        let b = Tensor::new((0..12).map(|i| (i as f32) * 0.5).collect(), vec![4, 3]);

        let nt = a.matmul_transpose_b(&b);
        assert_eq!(nt.shape, vec![2, 4]);
        for i in 0..2 {
            for j in 0..4 {
                let expected: f32 = (0..3).map(|l| a.data[i * 3 + l] * b.data[j * 3 + l]).sum();
                assert_relative_eq!(nt.data[i * 4 + j], expected, max_relative = 1e-5);
            }
        }

        let c = Tensor::new((0..10).map(|i| i as f32).collect(), vec![2, 5]);
        let tn = a.matmul_transpose_a(&c);
        assert_eq!(tn.shape, vec![3, 5]);
        for i in 0..3 {
            for j in 0..5 {
                let expected: f32 = (0..2).map(|t| a.data[t * 3 + i] * c.data[t * 5 + j]).sum();
                assert_relative_eq!(tn.data[i * 5 + j], expected, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0], vec![2, 3]);
        let s = t.softmax_rows();
        for i in 0..2 {
            let sum: f32 = s.row(i).iter().sum();
            assert_relative_eq!(sum, 1.0, max_relative = 1e-5);
        }
        // Larger logits get larger probabilities.
        assert!(s.data[2] > s.data[1] && s.data[1] > s.data[0]);
    }

    #[test]
    fn add_broadcasts_bias() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![10.0, 20.0], vec![2]);
        let y = x.add(&b);
        assert_eq!(y.data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn slice_rows_copies_range() {
        let t = Tensor::new((0..12).map(|i| i as f32).collect(), vec![4, 3]);
        let s = t.slice_rows(1, 3);
        assert_eq!(s.shape, vec![2, 3]);
        assert_eq!(s.data, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }
}
