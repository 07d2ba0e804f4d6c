use std::sync::Arc;

use super::ShardBridge;
use crate::driver::DeviceDriver;
use crate::CnResult;

/// Rectifier over one batch shard: `y = max(0, x)`, `dx = dy * [x > 0]`.
/// Stateless between passes; the backward re-reads the input activations.
pub struct ReLUBridge {
    slab: usize,
    driver: Arc<dyn DeviceDriver>,
}

impl ReLUBridge {
    pub fn new(i_r: usize, i_c: usize, i_d: usize, driver: Arc<dyn DeviceDriver>) -> Self {
        Self {
            slab: i_r * i_c * i_d,
            driver,
        }
    }
}

impl ShardBridge for ReLUBridge {
    fn forward_shard(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        batch: usize,
        _model: Option<&[f32]>,
        _bias: Option<&[f32]>,
    ) -> CnResult<()> {
        let n = batch * self.slab;
        self.driver.memcpy(&mut output[..n], &input[..n]);
        self.driver
            .sapply(&mut output[..n], &|x| if x > 0.0 { x } else { 0.0 });
        Ok(())
    }

    fn backward_shard(
        &mut self,
        input_data: &[f32],
        input_grad: Option<&mut [f32]>,
        _output_data: &[f32],
        output_grad: &[f32],
        batch: usize,
        _model: Option<&[f32]>,
    ) -> CnResult<()> {
        let Some(input_grad) = input_grad else {
            return Ok(());
        };
        let n = batch * self.slab;
        self.driver.selementwise_reduce2(
            &mut input_grad[..n],
            &output_grad[..n],
            &input_data[..n],
            &|dy, x| if x > 0.0 { dy } else { 0.0 },
        );
        Ok(())
    }
}
