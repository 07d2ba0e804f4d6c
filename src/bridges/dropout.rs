use std::sync::Arc;

use rand::distributions::{Bernoulli, Distribution};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::Bridge;
use crate::cube::LogicalCube;
use crate::driver::DeviceDriver;
use crate::layer::{LayerArena, LayerId};
use crate::report::{Report, Timer};
use crate::{CnError, CnResult, Phase};

/// Inverted dropout. In the training phase each forward pass draws a fresh
/// Bernoulli mask with keep probability `1 - ratio` and scales survivors by
/// `1/(1 - ratio)`; the backward pass reuses the stored mask. In the test
/// phase both passes are the identity.
pub struct DropoutBridge {
    name: String,
    input: LayerId,
    output: LayerId,
    ratio: f32,
    scale: f32,
    mask: LogicalCube,
    rng: StdRng,
    phase: Phase,
    curr_batch: usize,
    max_batch: usize,
    driver: Arc<dyn DeviceDriver>,
    report_fw: Report,
    report_bw: Report,
}

impl DropoutBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        input: LayerId,
        output: LayerId,
        shape: [usize; 4],
        ratio: f32,
        phase: Phase,
        driver: Arc<dyn DeviceDriver>,
    ) -> CnResult<Self> {
        Self::with_seed(name, input, output, shape, ratio, phase, driver, rand::random())
    }

    /// Deterministic variant: fixed inputs plus a fixed seed give a fixed
    /// forward output.
    #[allow(clippy::too_many_arguments)]
    pub fn with_seed(
        name: impl Into<String>,
        input: LayerId,
        output: LayerId,
        shape: [usize; 4],
        ratio: f32,
        phase: Phase,
        driver: Arc<dyn DeviceDriver>,
        seed: u64,
    ) -> CnResult<Self> {
        if !(0.0..1.0).contains(&ratio) {
            return Err(CnError::Config(format!(
                "dropout_ratio must be in [0, 1), got {ratio}"
            )));
        }
        let [r, c, d, b] = shape;
        Ok(Self {
            name: name.into(),
            input,
            output,
            ratio,
            scale: 1.0 / (1.0 - ratio),
            mask: LogicalCube::new(r, c, d, b),
            rng: StdRng::seed_from_u64(seed),
            phase,
            curr_batch: b,
            max_batch: b,
            driver,
            report_fw: Report::new(),
            report_bw: Report::new(),
        })
    }

    pub fn mask(&self) -> &LogicalCube {
        &self.mask
    }
}

impl Bridge for DropoutBridge {
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
        let (input, output) = arena.pair_mut(self.input, self.output);
        let n = self.curr_batch * input.data.slab_len();
        let src = &input.data.data()[..n];
        let dst = &mut output.data.data_mut()[..n];
        if self.phase == Phase::Train {
            let keep = Bernoulli::new((1.0 - self.ratio) as f64)
                .map_err(|e| CnError::Backend(format!("dropout mask: {e}")))?;
            let mask = &mut self.mask.data_mut()[..n];
            for m in mask.iter_mut() {
                *m = if keep.sample(&mut self.rng) { 1.0 } else { 0.0 };
            }
            for ((d, &x), &m) in dst.iter_mut().zip(src).zip(mask.iter()) {
                *d = x * m * self.scale;
            }
        } else {
            self.driver.memcpy(dst, src);
        }
        let mut sample = Report::new();
        sample.end(&timer, 4 * n as u64, 4 * n as u64, n as u64);
        self.report_fw.aggregate(&sample);
        Ok(())
    }

    fn backward(&mut self, arena: &mut LayerArena) -> CnResult<()> {
        let timer = Timer::start();
        let (input, output) = arena.pair_mut(self.input, self.output);
        let n = self.curr_batch * input.grad.slab_len();
        let src = &output.grad.data()[..n];
        let dst = &mut input.grad.data_mut()[..n];
        if self.phase == Phase::Train {
            let scale = self.scale;
            self.driver
                .selementwise_reduce2(dst, src, &self.mask.data()[..n], &move |dy, m| {
                    dy * m * scale
                });
        } else {
            self.driver.memcpy(dst, src);
        }
        let mut sample = Report::new();
        sample.end(&timer, 4 * n as u64, 4 * n as u64, n as u64);
        self.report_bw.aggregate(&sample);
        Ok(())
    }

    fn set_curr_batch_size(&mut self, batch: usize) {
        self.curr_batch = batch.min(self.max_batch);
    }

    fn report_forward(&self) -> &Report {
        &self.report_fw
    }

    fn report_backward(&self) -> &Report {
        &self.report_bw
    }
}
