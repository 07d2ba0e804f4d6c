use crate::CnResult;

pub mod cpu;
pub mod gpu;

pub use cpu::CpuDriver;
pub use gpu::GpuDriver;

/// Element-wise transform used by `sapply`.
pub type MapFn<'a> = &'a (dyn Fn(f32) -> f32 + Sync);
/// Two-input pointwise function used by `selementwise_reduce2`.
pub type ReduceFn<'a> = &'a (dyn Fn(f32, f32) -> f32 + Sync);
/// Source-position to destination-position mapping used by `parallel_map`.
pub type DstPosFn<'a> = &'a (dyn Fn(usize) -> usize + Sync);
/// Per-chunk kernel used by `parallel_map`: (chunk index, source chunk,
/// destination window starting at the mapped position).
pub type ChunkFn<'a> = &'a (dyn Fn(usize, &[f32], &mut [f32]) + Sync);

/// Primitive math and memory movement over one backend.
///
/// Bridges stay purely logical: every buffer they touch is caller-supplied
/// memory handed to these routines, and the driver owns nothing across
/// calls. Shape mismatches surface as errors from the fallible routines;
/// the rest are infallible slice-to-slice transforms.
pub trait DeviceDriver: Send + Sync {
    fn memset(&self, dst: &mut [f32], value: f32);
    fn memcpy(&self, dst: &mut [f32], src: &[f32]);

    /// Y += alpha * X
    fn saxpy(&self, alpha: f32, x: &[f32], y: &mut [f32]);
    /// Y = alpha * X + beta * Y
    fn saxpby(&self, alpha: f32, x: &[f32], beta: f32, y: &mut [f32]);

    /// C = alpha * op(A) * op(B) + beta * C over row-major buffers, where
    /// `op` transposes when the corresponding flag is set. `A` is
    /// `m x k` after `op`, `B` is `k x n` after `op`, `C` is `m x n`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> CnResult<()>;

    /// In-place element-wise transform.
    fn sapply(&self, dst: &mut [f32], f: MapFn);

    /// dst[i] = f(src1[i], src2[i])
    fn selementwise_reduce2(&self, dst: &mut [f32], src1: &[f32], src2: &[f32], f: ReduceFn);

    /// Applies `f` to each `src_chunk`-sized chunk of `src`, giving it the
    /// destination window that starts at `dst_pos(chunk_start)` and runs to
    /// the next chunk's window (the last window runs to the end of `dst`).
    /// Windows must therefore be non-overlapping and in increasing order;
    /// that contract is checked and is what makes the parallel dispatch
    /// race-free.
    fn parallel_map(
        &self,
        dst: &mut [f32],
        src: &[f32],
        src_chunk: usize,
        dst_pos: DstPosFn,
        f: ChunkFn,
    ) -> CnResult<()>;

    /// Advisory cap on intra-kernel parallelism: 1 runs kernels serially,
    /// anything larger lets them fan out.
    fn set_num_threads(&self, n: usize);
    fn num_threads(&self) -> usize;

    fn sinitialize_xavier(&self, dst: &mut [f32], fan_in: usize);
    fn sgaussian_initialize(&self, dst: &mut [f32], mean: f32, std_dev: f32);
    fn sbernoulli_initialize(&self, dst: &mut [f32], p: f32);
    fn sconstant_initialize(&self, dst: &mut [f32], value: f32);

    /// X -= Y, the parameter update primitive.
    fn smath_apply_grad(&self, x: &mut [f32], y: &[f32]) {
        self.saxpy(-1.0, y, x);
    }
}
