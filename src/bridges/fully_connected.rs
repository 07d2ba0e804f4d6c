use std::sync::Arc;

use super::ShardBridge;
use crate::cube::LogicalCube;
use crate::driver::DeviceDriver;
use crate::{CnError, CnResult};

/// Inner-product layer over one batch shard. Equivalent to a convolution
/// whose kernel covers the whole input plane, which is why the weight cube
/// keeps the `(iR, iC, iD, oD)` filter shape: one filter slab per output
/// unit, in the same physical order as one flattened input image. The
/// whole shard is a single GEMM: `O = X * W^T + b`.
pub struct FullyConnectedBridge {
    i_len: usize,
    o_d: usize,
    model_grad: LogicalCube,
    bias_grad: LogicalCube,
    driver: Arc<dyn DeviceDriver>,
}

impl FullyConnectedBridge {
    pub fn new(
        i_r: usize,
        i_c: usize,
        i_d: usize,
        o_d: usize,
        driver: Arc<dyn DeviceDriver>,
    ) -> CnResult<Self> {
        if i_r * i_c * i_d == 0 || o_d == 0 {
            return Err(CnError::Config(
                "fully-connected layer needs non-empty input and output".into(),
            ));
        }
        Ok(Self {
            i_len: i_r * i_c * i_d,
            o_d,
            model_grad: LogicalCube::new(i_r, i_c, i_d, o_d),
            bias_grad: LogicalCube::new(1, 1, o_d, 1),
            driver,
        })
    }
}

impl ShardBridge for FullyConnectedBridge {
    fn forward_shard(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        batch: usize,
        model: Option<&[f32]>,
        bias: Option<&[f32]>,
    ) -> CnResult<()> {
        let model = model.ok_or_else(|| CnError::Backend("fc without a model".into()))?;
        self.driver.sgemm(
            false,
            true,
            batch,
            self.o_d,
            self.i_len,
            1.0,
            &input[..batch * self.i_len],
            model,
            0.0,
            &mut output[..batch * self.o_d],
        )?;
        if let Some(bias) = bias {
            for row in output[..batch * self.o_d].chunks_mut(self.o_d) {
                for (v, &b) in row.iter_mut().zip(bias) {
                    *v += b;
                }
            }
        }
        Ok(())
    }

    fn backward_shard(
        &mut self,
        input_data: &[f32],
        input_grad: Option<&mut [f32]>,
        _output_data: &[f32],
        output_grad: &[f32],
        batch: usize,
        model: Option<&[f32]>,
    ) -> CnResult<()> {
        let model = model.ok_or_else(|| CnError::Backend("fc without a model".into()))?;
        self.model_grad.reset();
        self.bias_grad.reset();

        // dW = dO^T * X
        self.driver.sgemm(
            true,
            false,
            self.o_d,
            self.i_len,
            batch,
            1.0,
            &output_grad[..batch * self.o_d],
            &input_data[..batch * self.i_len],
            1.0,
            self.model_grad.data_mut(),
        )?;

        let bias_grad = self.bias_grad.data_mut();
        for row in output_grad[..batch * self.o_d].chunks(self.o_d) {
            for (g, &v) in bias_grad.iter_mut().zip(row) {
                *g += v;
            }
        }

        if let Some(input_grad) = input_grad {
            // dX = dO * W
            self.driver.sgemm(
                false,
                false,
                batch,
                self.i_len,
                self.o_d,
                1.0,
                &output_grad[..batch * self.o_d],
                model,
                0.0,
                &mut input_grad[..batch * self.i_len],
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
        (2 * self.i_len * self.o_d * batch) as u64
    }

    fn backward_flops(&self, batch: usize) -> u64 {
        2 * self.forward_flops(batch)
    }
}
