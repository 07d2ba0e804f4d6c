use std::sync::Arc;

use rayon::prelude::*;

use super::ShardBridge;
use crate::driver::DeviceDriver;
use crate::{CnError, CnResult};

/// Across-channel local response normalization over one batch shard.
///
/// For each element, `denom = 1 + (alpha/n) * sum of x^2 over the channel
/// window`, `y = x * denom^(-beta)`. The denominators are kept for the
/// backward pass, whose second term runs the same sliding channel window
/// over `dy * y'`.
pub struct LRNBridge {
    alpha: f32,
    beta: f32,
    local_size: usize,
    plane: usize,
    i_d: usize,
    denoms: Vec<f32>,
    driver: Arc<dyn DeviceDriver>,
}

impl LRNBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        i_r: usize,
        i_c: usize,
        i_d: usize,
        batch: usize,
        alpha: f32,
        beta: f32,
        local_size: usize,
        driver: Arc<dyn DeviceDriver>,
    ) -> CnResult<Self> {
        if local_size == 0 || local_size % 2 == 0 {
            return Err(CnError::Config(format!(
                "lrn local_size must be odd and positive, got {local_size}"
            )));
        }
        Ok(Self {
            alpha,
            beta,
            local_size,
            plane: i_r * i_c,
            i_d,
            denoms: vec![0.0; i_r * i_c * i_d * batch],
            driver,
        })
    }

    pub fn denoms(&self) -> &[f32] {
        &self.denoms
    }

    fn forward_image(&self, input: &[f32], output: &mut [f32], denoms: &mut [f32]) {
        let half = self.local_size / 2;
        let ratio = self.alpha / self.local_size as f32;
        for s in 0..self.plane {
            for d in 0..self.i_d {
                let lo = d.saturating_sub(half);
                let hi = (d + half).min(self.i_d - 1);
                let mut sum = 0.0f32;
                for k in lo..=hi {
                    let x = input[k * self.plane + s];
                    sum += x * x;
                }
                let denom = 1.0 + ratio * sum;
                let idx = d * self.plane + s;
                denoms[idx] = denom;
                output[idx] = input[idx] * denom.powf(-self.beta);
            }
        }
    }

    fn backward_image(
        &self,
        input: &[f32],
        input_grad: &mut [f32],
        output_grad: &[f32],
        denoms: &[f32],
    ) {
        let half = self.local_size / 2;
        let ratio = 2.0 * self.alpha * self.beta / self.local_size as f32;
        for s in 0..self.plane {
            for d in 0..self.i_d {
                let lo = d.saturating_sub(half);
                let hi = (d + half).min(self.i_d - 1);
                let mut window = 0.0f32;
                for k in lo..=hi {
                    let idx = k * self.plane + s;
                    window += output_grad[idx] * input[idx] * denoms[idx].powf(-self.beta - 1.0);
                }
                let idx = d * self.plane + s;
                input_grad[idx] =
                    denoms[idx].powf(-self.beta) * output_grad[idx] - ratio * input[idx] * window;
            }
        }
    }
}

impl ShardBridge for LRNBridge {
    fn forward_shard(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        batch: usize,
        _model: Option<&[f32]>,
        _bias: Option<&[f32]>,
    ) -> CnResult<()> {
        let image = self.plane * self.i_d;
        let n = batch * image;
        let mut denoms = std::mem::take(&mut self.denoms);
        if self.driver.num_threads() > 1 {
            output[..n]
                .par_chunks_mut(image)
                .zip(input[..n].par_chunks(image))
                .zip(denoms[..n].par_chunks_mut(image))
                .for_each(|((out, inp), den)| self.forward_image(inp, out, den));
        } else {
            for ((out, inp), den) in output[..n]
                .chunks_mut(image)
                .zip(input[..n].chunks(image))
                .zip(denoms[..n].chunks_mut(image))
            {
                self.forward_image(inp, out, den);
            }
        }
        self.denoms = denoms;
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
        let image = self.plane * self.i_d;
        let n = batch * image;
        if self.driver.num_threads() > 1 {
            input_grad[..n]
                .par_chunks_mut(image)
                .zip(input_data[..n].par_chunks(image))
                .zip(output_grad[..n].par_chunks(image))
                .zip(self.denoms[..n].par_chunks(image))
                .for_each(|(((ig, inp), og), den)| self.backward_image(inp, ig, og, den));
        } else {
            for (((ig, inp), og), den) in input_grad[..n]
                .chunks_mut(image)
                .zip(input_data[..n].chunks(image))
                .zip(output_grad[..n].chunks(image))
                .zip(self.denoms[..n].chunks(image))
            {
                self.backward_image(inp, ig, og, den);
            }
        }
        Ok(())
    }
}
