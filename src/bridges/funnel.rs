use super::Bridge;
use crate::layer::{LayerArena, LayerId};
use crate::report::{Report, Timer};
use crate::{CnError, CnResult};

/// Concatenates several input groups along the depth axis into one output
/// cube (`output.D = sum of input depths`; R, C, B preserved). Forward
/// copies; backward splits the output gradient back into each input's
/// gradient. Inserted by the builder in front of a fully-connected layer
/// whenever the upstream grouping is greater than one.
pub struct FunnelBridge {
    name: String,
    inputs: Vec<LayerId>,
    output: LayerId,
    curr_batch: usize,
    max_batch: usize,
    report_fw: Report,
    report_bw: Report,
}

impl FunnelBridge {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<LayerId>,
        output: LayerId,
        arena: &LayerArena,
    ) -> CnResult<Self> {
        if inputs.is_empty() {
            return Err(CnError::Config("funnel needs at least one input".into()));
        }
        let out = arena.get(output).shape();
        let first = arena.get(inputs[0]).shape();
        let mut total_depth = 0;
        for &id in &inputs {
            let shape = arena.get(id).shape();
            if shape[0] != first[0] || shape[1] != first[1] || shape[3] != first[3] {
                return Err(CnError::shapes(&first, &shape));
            }
            total_depth += shape[2];
        }
        if out[0] != first[0] || out[1] != first[1] || out[2] != total_depth || out[3] != first[3] {
            return Err(CnError::shapes(&[first[0], first[1], total_depth, first[3]], &out));
        }
        Ok(Self {
            name: name.into(),
            inputs,
            output,
            curr_batch: first[3],
            max_batch: first[3],
            report_fw: Report::new(),
            report_bw: Report::new(),
        })
    }

    pub fn input_ids(&self) -> &[LayerId] {
        &self.inputs
    }
}

impl Bridge for FunnelBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_id(&self) -> LayerId {
        self.inputs[0]
    }

    fn output_id(&self) -> LayerId {
        self.output
    }

    fn forward(&mut self, arena: &mut LayerArena) -> CnResult<()> {
        let timer = Timer::start();
        let mut moved = 0u64;
        let mut depth_offset = 0;
        let inputs = self.inputs.clone();
        for id in inputs {
            let (input, output) = arena.pair_mut(id, self.output);
            let plane = input.data.r * input.data.c;
            let in_slab = input.data.slab_len();
            let out_depth = output.data.d;
            for b in 0..self.curr_batch {
                let src = input.data.batch_slice(b);
                let dst_start = (b * out_depth + depth_offset) * plane;
                output.data.data_mut()[dst_start..dst_start + in_slab].copy_from_slice(src);
            }
            moved += (self.curr_batch * in_slab) as u64;
            depth_offset += input.data.d;
        }
        let mut sample = Report::new();
        sample.end(&timer, 4 * moved, 4 * moved, 0);
        self.report_fw.aggregate(&sample);
        Ok(())
    }

    fn backward(&mut self, arena: &mut LayerArena) -> CnResult<()> {
        let timer = Timer::start();
        let mut moved = 0u64;
        let mut depth_offset = 0;
        let inputs = self.inputs.clone();
        for id in inputs {
            let (input, output) = arena.pair_mut(id, self.output);
            let plane = input.grad.r * input.grad.c;
            let in_slab = input.grad.slab_len();
            let out_depth = output.grad.d;
            for b in 0..self.curr_batch {
                let src_start = (b * out_depth + depth_offset) * plane;
                let src = &output.grad.data()[src_start..src_start + in_slab];
                input.grad.batch_slice_mut(b).copy_from_slice(src);
            }
            moved += (self.curr_batch * in_slab) as u64;
            depth_offset += input.grad.d;
        }
        let mut sample = Report::new();
        sample.end(&timer, 4 * moved, 4 * moved, 0);
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
