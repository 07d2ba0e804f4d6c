use super::{ChunkFn, DeviceDriver, DstPosFn, MapFn, ReduceFn};
use crate::{CnError, CnResult};

/// Placeholder GPU backend. It keeps the two-driver seam in place so the
/// bridge layer never assumes a concrete device, but every kernel fails
/// fast: the production path is [`CpuDriver`](super::CpuDriver).
#[derive(Debug, Default)]
pub struct GpuDriver;

impl GpuDriver {
    pub fn new() -> Self {
        Self
    }

    fn unsupported(op: &str) -> ! {
        panic!("GpuDriver: `{op}` is not implemented; use CpuDriver")
    }
}

impl DeviceDriver for GpuDriver {
    fn memset(&self, _dst: &mut [f32], _value: f32) {
        Self::unsupported("memset")
    }

    fn memcpy(&self, _dst: &mut [f32], _src: &[f32]) {
        Self::unsupported("memcpy")
    }

    fn saxpy(&self, _alpha: f32, _x: &[f32], _y: &mut [f32]) {
        Self::unsupported("saxpy")
    }

    fn saxpby(&self, _alpha: f32, _x: &[f32], _beta: f32, _y: &mut [f32]) {
        Self::unsupported("saxpby")
    }

    fn sgemm(
        &self,
        _trans_a: bool,
        _trans_b: bool,
        _m: usize,
        _n: usize,
        _k: usize,
        _alpha: f32,
        _a: &[f32],
        _b: &[f32],
        _beta: f32,
        _c: &mut [f32],
    ) -> CnResult<()> {
        Err(CnError::Backend("GpuDriver: sgemm not implemented".into()))
    }

    fn sapply(&self, _dst: &mut [f32], _f: MapFn) {
        Self::unsupported("sapply")
    }

    fn selementwise_reduce2(&self, _dst: &mut [f32], _src1: &[f32], _src2: &[f32], _f: ReduceFn) {
        Self::unsupported("selementwise_reduce2")
    }

    fn parallel_map(
        &self,
        _dst: &mut [f32],
        _src: &[f32],
        _src_chunk: usize,
        _dst_pos: DstPosFn,
        _f: ChunkFn,
    ) -> CnResult<()> {
        Err(CnError::Backend(
            "GpuDriver: parallel_map not implemented".into(),
        ))
    }

    fn set_num_threads(&self, _n: usize) {}

    fn num_threads(&self) -> usize {
        1
    }

    fn sinitialize_xavier(&self, _dst: &mut [f32], _fan_in: usize) {
        Self::unsupported("sinitialize_xavier")
    }

    fn sgaussian_initialize(&self, _dst: &mut [f32], _mean: f32, _std_dev: f32) {
        Self::unsupported("sgaussian_initialize")
    }

    fn sbernoulli_initialize(&self, _dst: &mut [f32], _p: f32) {
        Self::unsupported("sbernoulli_initialize")
    }

    fn sconstant_initialize(&self, _dst: &mut [f32], _value: f32) {
        Self::unsupported("sconstant_initialize")
    }
}
