use std::sync::Arc;

use rayon::prelude::*;

use super::{Bridge, ShardBridge, UpdateParams};
use crate::cube::LogicalCube;
use crate::driver::DeviceDriver;
use crate::layer::{LayerArena, LayerId};
use crate::report::{Report, Timer};
use crate::CnResult;

/// Presents `n` per-shard kernels as one bridge. The mini-batch is split
/// into near-equal contiguous shards along the batch axis (views into the
/// parent layer's slabs, never copies); shards run in parallel on forward
/// and backward, reading the single canonical model, and their parameter
/// gradients are reduced serially in shard-index order so the result is
/// deterministic for a fixed shard count.
pub struct ParallelizedBridge<B: ShardBridge> {
    name: String,
    input: LayerId,
    output: LayerId,
    shards: Vec<B>,
    model: Option<LogicalCube>,
    bias: Option<LogicalCube>,
    model_grad: Option<LogicalCube>,
    bias_grad: Option<LogicalCube>,
    model_hist: Option<LogicalCube>,
    bias_hist: Option<LogicalCube>,
    max_batch: usize,
    curr_batch: usize,
    inner_threads: usize,
    needs_backward_grad: bool,
    driver: Arc<dyn DeviceDriver>,
    report_fw: Report,
    report_bw: Report,
}

fn split_slices<'a>(mut data: &'a [f32], sizes: &[usize], slab: usize) -> Vec<&'a [f32]> {
    let mut out = Vec::with_capacity(sizes.len());
    for &s in sizes {
        let (head, tail) = data.split_at(s * slab);
        out.push(head);
        data = tail;
    }
    out
}

fn split_slices_mut<'a>(
    mut data: &'a mut [f32],
    sizes: &[usize],
    slab: usize,
) -> Vec<&'a mut [f32]> {
    let mut out = Vec::with_capacity(sizes.len());
    for &s in sizes {
        let (head, tail) = data.split_at_mut(s * slab);
        out.push(head);
        data = tail;
    }
    out
}

impl<B: ShardBridge> ParallelizedBridge<B> {
    /// `make` builds one shard kernel sized for the given shard capacity
    /// (the ceiling split of `batch` over `n_partitions`).
    #[allow(clippy::too_many_arguments)]
    pub fn new<F>(
        name: impl Into<String>,
        input: LayerId,
        output: LayerId,
        batch: usize,
        n_partitions: usize,
        inner_threads: usize,
        model: Option<LogicalCube>,
        bias: Option<LogicalCube>,
        driver: Arc<dyn DeviceDriver>,
        mut make: F,
    ) -> CnResult<Self>
    where
        F: FnMut(usize) -> CnResult<B>,
    {
        let n = n_partitions.max(1).min(batch.max(1));
        let capacity = batch.div_ceil(n);
        let shards = (0..n).map(|_| make(capacity)).collect::<CnResult<Vec<B>>>()?;
        let grad_of = |c: &LogicalCube| LogicalCube::new(c.r, c.c, c.d, c.b);
        let model_grad = model.as_ref().map(grad_of);
        let bias_grad = bias.as_ref().map(grad_of);
        let model_hist = model.as_ref().map(grad_of);
        let bias_hist = bias.as_ref().map(grad_of);
        Ok(Self {
            name: name.into(),
            input,
            output,
            shards,
            model,
            bias,
            model_grad,
            bias_grad,
            model_hist,
            bias_hist,
            max_batch: batch,
            curr_batch: batch,
            inner_threads: inner_threads.max(1),
            needs_backward_grad: true,
            driver,
            report_fw: Report::new(),
            report_bw: Report::new(),
        })
    }

    pub fn n_partitions(&self) -> usize {
        self.shards.len()
    }

    pub fn model_grad_cube(&self) -> Option<&LogicalCube> {
        self.model_grad.as_ref()
    }

    pub fn bias_grad_cube(&self) -> Option<&LogicalCube> {
        self.bias_grad.as_ref()
    }

    fn shard_sizes(&self) -> Vec<usize> {
        let n = self.shards.len();
        let base = self.curr_batch / n;
        let extra = self.curr_batch % n;
        (0..n).map(|i| base + usize::from(i < extra)).collect()
    }

    fn update_one(
        driver: &dyn DeviceDriver,
        params: &UpdateParams,
        value: &mut LogicalCube,
        grad: &mut LogicalCube,
        hist: &mut LogicalCube,
    ) {
        if params.weight_decay != 0.0 {
            driver.saxpy(params.weight_decay, value.data(), grad.data_mut());
        }
        // hist = momentum * hist + lr * grad; value -= hist
        driver.saxpby(params.lr, grad.data(), params.momentum, hist.data_mut());
        driver.smath_apply_grad(value.data_mut(), hist.data());
    }
}

impl<B: ShardBridge> Bridge for ParallelizedBridge<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_id(&self) -> LayerId {
        self.input
    }

    fn output_id(&self) -> LayerId {
        self.output
    }

    fn forward(&mut self, arena: &mut LayerArena) -> CnResult<()> {
        let timer = Timer::start();
        self.driver.set_num_threads(self.inner_threads);
        let sizes = self.shard_sizes();
        let (input, output) = arena.pair_mut(self.input, self.output);
        let in_slab = input.data.slab_len();
        let out_slab = output.data.slab_len();
        let model = self.model.as_ref().map(|m| m.data());
        let bias = self.bias.as_ref().map(|b| b.data());
        let in_chunks = split_slices(input.data.data(), &sizes, in_slab);
        let out_chunks = split_slices_mut(output.data.data_mut(), &sizes, out_slab);

        self.shards
            .par_iter_mut()
            .zip(in_chunks.into_par_iter())
            .zip(out_chunks.into_par_iter())
            .zip(sizes.par_iter().copied())
            .try_for_each(|(((shard, inp), out), size)| {
                if size == 0 {
                    return Ok(());
                }
                shard.forward_shard(inp, out, size, model, bias)
            })?;

        let flops: u64 = self
            .shards
            .iter()
            .zip(&sizes)
            .map(|(s, &b)| s.forward_flops(b))
            .sum();
        let mut sample = Report::new();
        sample.end(
            &timer,
            4 * (self.curr_batch * in_slab) as u64,
            4 * (self.curr_batch * out_slab) as u64,
            flops,
        );
        self.report_fw.aggregate(&sample);
        Ok(())
    }

    fn backward(&mut self, arena: &mut LayerArena) -> CnResult<()> {
        let timer = Timer::start();
        self.driver.set_num_threads(self.inner_threads);
        let sizes = self.shard_sizes();
        let (input, output) = arena.pair_mut(self.input, self.output);
        let in_slab = input.data.slab_len();
        let out_slab = output.data.slab_len();
        let model = self.model.as_ref().map(|m| m.data());
        let in_data = split_slices(input.data.data(), &sizes, in_slab);
        let out_data = split_slices(output.data.data(), &sizes, out_slab);
        let out_grad = split_slices(output.grad.data(), &sizes, out_slab);
        let in_grad: Vec<Option<&mut [f32]>> = if self.needs_backward_grad {
            split_slices_mut(input.grad.data_mut(), &sizes, in_slab)
                .into_iter()
                .map(Some)
                .collect()
        } else {
            sizes.iter().map(|_| None).collect()
        };

        self.shards
            .par_iter_mut()
            .zip(in_data.into_par_iter())
            .zip(in_grad.into_par_iter())
            .zip(out_data.into_par_iter())
            .zip(out_grad.into_par_iter())
            .zip(sizes.par_iter().copied())
            .try_for_each(|(((((shard, ind), ing), outd), outg), size)| {
                if size == 0 {
                    return Ok(());
                }
                shard.backward_shard(ind, ing, outd, outg, size, model)
            })?;

        // Reduce shard gradients into the canonical cubes, in shard order.
        if let Some(canonical) = self.model_grad.as_mut() {
            canonical.reset();
            for (shard, &size) in self.shards.iter().zip(&sizes) {
                if size == 0 {
                    continue;
                }
                if let Some(g) = shard.model_grad() {
                    self.driver.saxpy(1.0, g.data(), canonical.data_mut());
                }
            }
        }
        if let Some(canonical) = self.bias_grad.as_mut() {
            canonical.reset();
            for (shard, &size) in self.shards.iter().zip(&sizes) {
                if size == 0 {
                    continue;
                }
                if let Some(g) = shard.bias_grad() {
                    self.driver.saxpy(1.0, g.data(), canonical.data_mut());
                }
            }
        }

        let flops: u64 = self
            .shards
            .iter()
            .zip(&sizes)
            .map(|(s, &b)| s.backward_flops(b))
            .sum();
        let mut sample = Report::new();
        sample.end(
            &timer,
            4 * (self.curr_batch * (in_slab + out_slab)) as u64,
            4 * (self.curr_batch * in_slab) as u64,
            flops,
        );
        self.report_bw.aggregate(&sample);
        Ok(())
    }

    fn set_curr_batch_size(&mut self, batch: usize) {
        self.curr_batch = batch.min(self.max_batch);
    }

    fn model_cube(&self) -> Option<&LogicalCube> {
        self.model.as_ref()
    }

    fn model_cube_mut(&mut self) -> Option<&mut LogicalCube> {
        self.model.as_mut()
    }

    fn bias_cube(&self) -> Option<&LogicalCube> {
        self.bias.as_ref()
    }

    fn bias_cube_mut(&mut self) -> Option<&mut LogicalCube> {
        self.bias.as_mut()
    }

    fn needs_backward_grad(&self) -> bool {
        self.needs_backward_grad
    }

    fn set_needs_backward_grad(&mut self, needs: bool) {
        self.needs_backward_grad = needs;
    }

    fn apply_update(&mut self, params: &UpdateParams) {
        if let (Some(model), Some(grad), Some(hist)) = (
            self.model.as_mut(),
            self.model_grad.as_mut(),
            self.model_hist.as_mut(),
        ) {
            Self::update_one(self.driver.as_ref(), params, model, grad, hist);
        }
        if let (Some(bias), Some(grad), Some(hist)) = (
            self.bias.as_mut(),
            self.bias_grad.as_mut(),
            self.bias_hist.as_mut(),
        ) {
            Self::update_one(self.driver.as_ref(), params, bias, grad, hist);
        }
    }

    fn report_forward(&self) -> &Report {
        &self.report_fw
    }

    fn report_backward(&self) -> &Report {
        &self.report_bw
    }
}
