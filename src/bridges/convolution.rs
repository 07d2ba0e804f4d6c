use std::sync::Arc;

use super::{conv_output_dim, ShardBridge};
use crate::cube::LogicalCube;
use crate::driver::DeviceDriver;
use crate::kernels::{inverse_lower_cube, lower_cube, LoweringConfig};
use crate::{CnError, CnResult};

/// Convolution over one batch shard, computed as im2col lowering followed
/// by one GEMM per image: `O_b = W * Mt_b^T`. The backward pass reuses the
/// forward-pass lowered matrix for the weight gradient, then overwrites it
/// with the lowered input gradient and scatters that back through the
/// inverse lowering.
pub struct ConvolutionBridge {
    cfg: LoweringConfig,
    o_d: usize,
    lowered: Vec<f32>,
    model_grad: LogicalCube,
    bias_grad: LogicalCube,
    driver: Arc<dyn DeviceDriver>,
}

impl ConvolutionBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        i_r: usize,
        i_c: usize,
        i_d: usize,
        o_d: usize,
        batch: usize,
        kernel: usize,
        padding: usize,
        stride: usize,
        driver: Arc<dyn DeviceDriver>,
    ) -> CnResult<Self> {
        if kernel == 0 || stride == 0 {
            return Err(CnError::Config(
                "convolution kernel_size and stride must be positive".into(),
            ));
        }
        if i_r + 2 * padding < kernel || i_c + 2 * padding < kernel {
            return Err(CnError::Config(format!(
                "convolution kernel {kernel} does not fit a {i_r}x{i_c} input with padding {padding}"
            )));
        }
        let o_r = conv_output_dim(i_r, kernel, padding, stride);
        let o_c = conv_output_dim(i_c, kernel, padding, stride);
        let cfg = LoweringConfig {
            kernel,
            padding,
            stride,
            i_r,
            i_c,
            i_d,
            o_r,
            o_c,
        };
        Ok(Self {
            cfg,
            o_d,
            lowered: vec![0.0; batch * cfg.block_len()],
            model_grad: LogicalCube::new(kernel, kernel, i_d, o_d),
            bias_grad: LogicalCube::new(1, 1, o_d, 1),
            driver,
        })
    }

    pub fn output_shape(&self) -> (usize, usize, usize) {
        (self.cfg.o_r, self.cfg.o_c, self.o_d)
    }

    pub fn model_shape(&self) -> [usize; 4] {
        self.model_grad.shape()
    }
}

impl ShardBridge for ConvolutionBridge {
    fn forward_shard(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        batch: usize,
        model: Option<&[f32]>,
        bias: Option<&[f32]>,
    ) -> CnResult<()> {
        let model = model.ok_or_else(|| CnError::Backend("convolution without a model".into()))?;
        lower_cube(
            self.driver.as_ref(),
            input,
            &mut self.lowered,
            &self.cfg,
            batch,
        )?;

        let kd = self.cfg.row_len();
        let positions = self.cfg.rows_per_image();
        let block = self.cfg.block_len();
        let out_slab = self.o_d * positions;
        for b in 0..batch {
            self.driver.sgemm(
                false,
                true,
                self.o_d,
                positions,
                kd,
                1.0,
                model,
                &self.lowered[b * block..(b + 1) * block],
                0.0,
                &mut output[b * out_slab..(b + 1) * out_slab],
            )?;
        }
        if let Some(bias) = bias {
            for b in 0..batch {
                let image = &mut output[b * out_slab..(b + 1) * out_slab];
                for d in 0..self.o_d {
                    let shift = bias[d];
                    for v in &mut image[d * positions..(d + 1) * positions] {
                        *v += shift;
                    }
                }
            }
        }
        Ok(())
    }

    fn backward_shard(
        &mut self,
        _input_data: &[f32],
        input_grad: Option<&mut [f32]>,
        _output_data: &[f32],
        output_grad: &[f32],
        batch: usize,
        model: Option<&[f32]>,
    ) -> CnResult<()> {
        let model = model.ok_or_else(|| CnError::Backend("convolution without a model".into()))?;
        let kd = self.cfg.row_len();
        let positions = self.cfg.rows_per_image();
        let block = self.cfg.block_len();
        let out_slab = self.o_d * positions;

        self.model_grad.reset();
        self.bias_grad.reset();

        // The lowered buffer still holds the forward-pass Mt; consume it
        // for dW (and dO for db) before the input-gradient pass below
        // overwrites it.
        for b in 0..batch {
            let d_out = &output_grad[b * out_slab..(b + 1) * out_slab];
            self.driver.sgemm(
                false,
                false,
                self.o_d,
                kd,
                positions,
                1.0,
                d_out,
                &self.lowered[b * block..(b + 1) * block],
                1.0,
                self.model_grad.data_mut(),
            )?;
            let bias_grad = self.bias_grad.data_mut();
            for d in 0..self.o_d {
                let mut sum = 0.0;
                for &g in &d_out[d * positions..(d + 1) * positions] {
                    sum += g;
                }
                bias_grad[d] += sum;
            }
        }

        if let Some(input_grad) = input_grad {
            for b in 0..batch {
                self.driver.sgemm(
                    true,
                    false,
                    positions,
                    kd,
                    self.o_d,
                    1.0,
                    &output_grad[b * out_slab..(b + 1) * out_slab],
                    model,
                    0.0,
                    &mut self.lowered[b * block..(b + 1) * block],
                )?;
            }
            inverse_lower_cube(
                self.driver.as_ref(),
                input_grad,
                &self.lowered,
                &self.cfg,
                batch,
            )?;
        }
        Ok(())
    }

    fn model_grad(&self) -> Option<&LogicalCube> {
        Some(&self.model_grad)
    }

    fn bias_grad(&self) -> Option<&LogicalCube> {
        Some(&self.bias_grad)
    }

    fn forward_flops(&self, batch: usize) -> u64 {
        (2 * self.cfg.row_len() * self.cfg.rows_per_image() * self.o_d * batch) as u64
    }

    fn backward_flops(&self, batch: usize) -> u64 {
        2 * self.forward_flops(batch)
    }
}
