use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};
use ndarray_rand::rand_distr::{Bernoulli, Distribution, Normal};
use rand::distributions::Uniform;
use rayon::prelude::*;

use super::{ChunkFn, DeviceDriver, DstPosFn, MapFn, ReduceFn};
use crate::{CnError, CnResult};

const APPLY_CHUNK: usize = 4096;

/// The production backend. Kernels run serially when the advisory thread
/// count is 1 and through rayon otherwise; GEMM goes through ndarray.
#[derive(Debug)]
pub struct CpuDriver {
    num_threads: AtomicUsize,
}

impl CpuDriver {
    pub fn new() -> Self {
        Self {
            num_threads: AtomicUsize::new(1),
        }
    }

    fn parallel(&self) -> bool {
        self.num_threads.load(Ordering::Relaxed) > 1
    }
}

impl Default for CpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for CpuDriver {
    fn memset(&self, dst: &mut [f32], value: f32) {
        for v in dst.iter_mut() {
            *v = value;
        }
    }

    fn memcpy(&self, dst: &mut [f32], src: &[f32]) {
        dst.copy_from_slice(src);
    }

    fn saxpy(&self, alpha: f32, x: &[f32], y: &mut [f32]) {
        debug_assert_eq!(x.len(), y.len());
        for (yi, xi) in y.iter_mut().zip(x.iter()) {
            *yi += alpha * xi;
        }
    }

    fn saxpby(&self, alpha: f32, x: &[f32], beta: f32, y: &mut [f32]) {
        debug_assert_eq!(x.len(), y.len());
        for (yi, xi) in y.iter_mut().zip(x.iter()) {
            *yi = alpha * xi + beta * *yi;
        }
    }

    #[tracing::instrument(skip_all, name = "kernel_sgemm")]
    fn sgemm(
        &self,
        trans_a: bool,
        trans_b: bool,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        b: &[f32],
        beta: f32,
        c: &mut [f32],
    ) -> CnResult<()> {
        let bad = |what: &str| CnError::Backend(format!("sgemm: bad {what} buffer length"));
        let a_view = if trans_a {
            ArrayView2::from_shape((k, m), a)
                .map_err(|_| bad("A"))?
                .reversed_axes()
        } else {
            ArrayView2::from_shape((m, k), a).map_err(|_| bad("A"))?
        };
        let b_view = if trans_b {
            ArrayView2::from_shape((n, k), b)
                .map_err(|_| bad("B"))?
                .reversed_axes()
        } else {
            ArrayView2::from_shape((k, n), b).map_err(|_| bad("B"))?
        };
        let mut c_view = ArrayViewMut2::from_shape((m, n), c).map_err(|_| bad("C"))?;
        general_mat_mul(alpha, &a_view, &b_view, beta, &mut c_view);
        Ok(())
    }

    fn sapply(&self, dst: &mut [f32], f: MapFn) {
        if self.parallel() {
            dst.par_chunks_mut(APPLY_CHUNK).for_each(|chunk| {
                for v in chunk.iter_mut() {
                    *v = f(*v);
                }
            });
        } else {
            for v in dst.iter_mut() {
                *v = f(*v);
            }
        }
    }

    fn selementwise_reduce2(&self, dst: &mut [f32], src1: &[f32], src2: &[f32], f: ReduceFn) {
        debug_assert_eq!(dst.len(), src1.len());
        debug_assert_eq!(dst.len(), src2.len());
        if self.parallel() {
            dst.par_chunks_mut(APPLY_CHUNK)
                .zip(src1.par_chunks(APPLY_CHUNK))
                .zip(src2.par_chunks(APPLY_CHUNK))
                .for_each(|((d, s1), s2)| {
                    for ((di, a), b) in d.iter_mut().zip(s1).zip(s2) {
                        *di = f(*a, *b);
                    }
                });
        } else {
            for ((di, a), b) in dst.iter_mut().zip(src1).zip(src2) {
                *di = f(*a, *b);
            }
        }
    }

    fn parallel_map(
        &self,
        dst: &mut [f32],
        src: &[f32],
        src_chunk: usize,
        dst_pos: DstPosFn,
        f: ChunkFn,
    ) -> CnResult<()> {
        if src_chunk == 0 || src.len() % src_chunk != 0 {
            return Err(CnError::Backend(format!(
                "parallel_map: source length {} not divisible into chunks of {}",
                src.len(),
                src_chunk
            )));
        }
        let n = src.len() / src_chunk;
        let dst_len = dst.len();
        let offsets: Vec<usize> = (0..n).map(|i| dst_pos(i * src_chunk)).collect();

        // Carve dst into the per-chunk windows; the increasing-offset
        // contract is what guarantees they are disjoint.
        let mut windows: Vec<&mut [f32]> = Vec::with_capacity(n);
        let mut rest = dst;
        let mut cursor = 0usize;
        for (i, &start) in offsets.iter().enumerate() {
            let end = if i + 1 < n { offsets[i + 1] } else { dst_len };
            let strictly_after = i == 0 || start > offsets[i - 1];
            if start < cursor || !strictly_after || end < start || end > dst_len {
                return Err(CnError::Backend(
                    "parallel_map: destination windows must be disjoint and increasing".into(),
                ));
            }
            let (_skip, tail) = rest.split_at_mut(start - cursor);
            let (window, tail) = tail.split_at_mut(end - start);
            windows.push(window);
            rest = tail;
            cursor = end;
        }

        if self.parallel() {
            windows
                .into_par_iter()
                .zip(src.par_chunks(src_chunk))
                .enumerate()
                .for_each(|(i, (window, chunk))| f(i, chunk, window));
        } else {
            for (i, (window, chunk)) in windows.into_iter().zip(src.chunks(src_chunk)).enumerate()
            {
                f(i, chunk, window);
            }
        }
        Ok(())
    }

    fn set_num_threads(&self, n: usize) {
        self.num_threads.store(n.max(1), Ordering::Relaxed);
    }

    fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Relaxed)
    }

    fn sinitialize_xavier(&self, dst: &mut [f32], fan_in: usize) {
        let scale = (3.0 / fan_in.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-scale, scale);
        let mut rng = rand::thread_rng();
        for v in dst.iter_mut() {
            *v = dist.sample(&mut rng);
        }
    }

    fn sgaussian_initialize(&self, dst: &mut [f32], mean: f32, std_dev: f32) {
        let dist = Normal::new(mean, std_dev).unwrap_or_else(|_| Normal::new(0.0, 1.0).unwrap());
        let mut rng = rand::thread_rng();
        for v in dst.iter_mut() {
            *v = dist.sample(&mut rng);
        }
    }

    fn sbernoulli_initialize(&self, dst: &mut [f32], p: f32) {
        let dist = Bernoulli::new(p.clamp(0.0, 1.0) as f64)
            .unwrap_or_else(|_| Bernoulli::new(0.5).unwrap());
        let mut rng = rand::thread_rng();
        for v in dst.iter_mut() {
            *v = if dist.sample(&mut rng) { 1.0 } else { 0.0 };
        }
    }

    fn sconstant_initialize(&self, dst: &mut [f32], value: f32) {
        self.memset(dst, value);
    }
}
