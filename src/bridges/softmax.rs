use super::Bridge;
use crate::cube::LogicalCube;
use crate::layer::{LayerArena, LayerId};
use crate::report::{Report, Timer};
use crate::{CnError, CnResult};

/// Softmax with multinomial logistic loss over a `(1, 1, D, B)` cube, D
/// being the class count. Forward writes per-sample probabilities into the
/// output layer (max-subtracted for stability) and accumulates
/// `-log p[label]`; backward seeds the sweep with `p - onehot(label)`.
/// The bridge owns its labels cube; the solver refills it per mini-batch.
pub struct SoftmaxLossBridge {
    name: String,
    input: LayerId,
    output: LayerId,
    labels: LogicalCube,
    n_classes: usize,
    loss: f32,
    curr_batch: usize,
    max_batch: usize,
    report_fw: Report,
    report_bw: Report,
}

impl SoftmaxLossBridge {
    pub fn new(
        name: impl Into<String>,
        input: LayerId,
        output: LayerId,
        arena: &LayerArena,
    ) -> CnResult<Self> {
        let shape = arena.get(input).shape();
        if shape[0] != 1 || shape[1] != 1 {
            return Err(CnError::Shape(format!(
                "softmax loss expects a (1, 1, D, B) input, got {shape:?}"
            )));
        }
        if arena.get(output).shape() != shape {
            return Err(CnError::shapes(&shape, &arena.get(output).shape()));
        }
        Ok(Self {
            name: name.into(),
            input,
            output,
            labels: LogicalCube::new(1, 1, 1, shape[3]),
            n_classes: shape[2],
            loss: 0.0,
            curr_batch: shape[3],
            max_batch: shape[3],
            report_fw: Report::new(),
            report_bw: Report::new(),
        })
    }

    pub fn labels(&self) -> &LogicalCube {
        &self.labels
    }

    pub fn get_loss(&self) -> f32 {
        self.loss
    }
}

impl Bridge for SoftmaxLossBridge {
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
        let d = self.n_classes;
        for b in 0..self.curr_batch {
            let x = &input.data.batch_slice(b)[..d];
            let p = &mut output.data.batch_slice_mut(b)[..d];

            let mut max = f32::NEG_INFINITY;
            for &v in x {
                max = max.max(v);
            }
            let mut sum = 0.0f32;
            for (pi, &v) in p.iter_mut().zip(x) {
                *pi = (v - max).exp();
                sum += *pi;
            }
            for pi in p.iter_mut() {
                *pi /= sum;
            }

            let label = self.labels.data()[b];
            let class = label as usize;
            if label < 0.0 || class >= d {
                return Err(CnError::Corpus(format!(
                    "label {label} outside the {d}-class output"
                )));
            }
            self.loss -= p[class].ln();
        }
        let n = (self.curr_batch * d) as u64;
        let mut sample = Report::new();
        sample.end(&timer, 4 * n, 4 * n, 4 * n);
        self.report_fw.aggregate(&sample);
        Ok(())
    }

    fn backward(&mut self, arena: &mut LayerArena) -> CnResult<()> {
        let timer = Timer::start();
        let (input, output) = arena.pair_mut(self.input, self.output);
        let d = self.n_classes;
        for b in 0..self.curr_batch {
            let p = &output.data.batch_slice(b)[..d];
            let dx = &mut input.grad.batch_slice_mut(b)[..d];
            dx.copy_from_slice(p);
            let class = self.labels.data()[b] as usize;
            dx[class] -= 1.0;
        }
        let n = (self.curr_batch * d) as u64;
        let mut sample = Report::new();
        sample.end(&timer, 4 * n, 4 * n, n);
        self.report_bw.aggregate(&sample);
        Ok(())
    }

    fn set_curr_batch_size(&mut self, batch: usize) {
        self.curr_batch = batch.min(self.max_batch);
    }

    fn loss(&self) -> Option<f32> {
        Some(self.loss)
    }

    fn reset_loss(&mut self) {
        self.loss = 0.0;
    }

    fn set_labels(&mut self, labels: &[f32]) {
        let n = labels.len().min(self.max_batch);
        self.labels.data_mut()[..n].copy_from_slice(&labels[..n]);
    }

    fn report_forward(&self) -> &Report {
        &self.report_fw
    }

    fn report_backward(&self) -> &Report {
        &self.report_bw
    }
}
