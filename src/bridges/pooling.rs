use std::sync::Arc;

use rayon::prelude::*;

use super::{conv_output_dim, ShardBridge};
use crate::driver::DeviceDriver;
use crate::{CnError, CnResult};

/// Max-pooling over one batch shard. Each `(d, b)` plane is independent;
/// the companion `max_index` buffer records, per output element, the
/// within-plane index (`h*iC + w`) of the input element that supplied the
/// maximum, and the backward pass routes each output gradient to exactly
/// that element.
pub struct MaxPoolingBridge {
    kernel: usize,
    stride: usize,
    i_r: usize,
    i_c: usize,
    o_r: usize,
    o_c: usize,
    depth: usize,
    max_index: Vec<usize>,
    driver: Arc<dyn DeviceDriver>,
}

impl MaxPoolingBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        i_r: usize,
        i_c: usize,
        depth: usize,
        batch: usize,
        kernel: usize,
        stride: usize,
        driver: Arc<dyn DeviceDriver>,
    ) -> CnResult<Self> {
        if kernel == 0 || stride == 0 || kernel > i_r || kernel > i_c {
            return Err(CnError::Config(format!(
                "pooling kernel {kernel} / stride {stride} does not fit a {i_r}x{i_c} input"
            )));
        }
        let o_r = conv_output_dim(i_r, kernel, 0, stride);
        let o_c = conv_output_dim(i_c, kernel, 0, stride);
        Ok(Self {
            kernel,
            stride,
            i_r,
            i_c,
            o_r,
            o_c,
            depth,
            max_index: vec![0; depth * batch * o_r * o_c],
            driver,
        })
    }

    pub fn output_shape(&self) -> (usize, usize) {
        (self.o_r, self.o_c)
    }

    pub fn max_index(&self) -> &[usize] {
        &self.max_index
    }

    fn pool_plane(&self, input: &[f32], output: &mut [f32], max_index: &mut [usize]) {
        for v in output.iter_mut() {
            *v = f32::NEG_INFINITY;
        }
        for ph in 0..self.o_r {
            let h_start = ph * self.stride;
            let h_end = (h_start + self.kernel).min(self.i_r);
            for pw in 0..self.o_c {
                let w_start = pw * self.stride;
                let w_end = (w_start + self.kernel).min(self.i_c);
                let pool_index = ph * self.o_c + pw;
                for h in h_start..h_end {
                    for w in w_start..w_end {
                        let index = h * self.i_c + w;
                        if input[index] > output[pool_index] {
                            output[pool_index] = input[index];
                            max_index[pool_index] = index;
                        }
                    }
                }
            }
        }
    }
}

impl ShardBridge for MaxPoolingBridge {
    fn forward_shard(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        batch: usize,
        _model: Option<&[f32]>,
        _bias: Option<&[f32]>,
    ) -> CnResult<()> {
        let planes = self.depth * batch;
        let in_plane = self.i_r * self.i_c;
        let out_plane = self.o_r * self.o_c;
        let mut max_index = std::mem::take(&mut self.max_index);
        if self.driver.num_threads() > 1 {
            output[..planes * out_plane]
                .par_chunks_mut(out_plane)
                .zip(input[..planes * in_plane].par_chunks(in_plane))
                .zip(max_index[..planes * out_plane].par_chunks_mut(out_plane))
                .for_each(|((out, inp), idx)| self.pool_plane(inp, out, idx));
        } else {
            for ((out, inp), idx) in output[..planes * out_plane]
                .chunks_mut(out_plane)
                .zip(input[..planes * in_plane].chunks(in_plane))
                .zip(max_index[..planes * out_plane].chunks_mut(out_plane))
            {
                self.pool_plane(inp, out, idx);
            }
        }
        self.max_index = max_index;
        Ok(())
    }

    fn backward_shard(
        &mut self,
        _input_data: &[f32],
        input_grad: Option<&mut [f32]>,
        _output_data: &[f32],
        output_grad: &[f32],
        batch: usize,
        _model: Option<&[f32]>,
    ) -> CnResult<()> {
        let Some(input_grad) = input_grad else {
            return Ok(());
        };
        let planes = self.depth * batch;
        let in_plane = self.i_r * self.i_c;
        let out_plane = self.o_r * self.o_c;
        let scatter = |in_grad: &mut [f32], out_grad: &[f32], idx: &[usize]| {
            for (pool_index, &g) in out_grad.iter().enumerate() {
                in_grad[idx[pool_index]] += g;
            }
        };
        if self.driver.num_threads() > 1 {
            input_grad[..planes * in_plane]
                .par_chunks_mut(in_plane)
                .zip(output_grad[..planes * out_plane].par_chunks(out_plane))
                .zip(self.max_index[..planes * out_plane].par_chunks(out_plane))
                .for_each(|((ig, og), idx)| scatter(ig, og, idx));
        } else {
            for ((ig, og), idx) in input_grad[..planes * in_plane]
                .chunks_mut(in_plane)
                .zip(output_grad[..planes * out_plane].chunks(out_plane))
                .zip(self.max_index[..planes * out_plane].chunks(out_plane))
            {
                scatter(ig, og, idx);
            }
        }
        Ok(())
    }
}
