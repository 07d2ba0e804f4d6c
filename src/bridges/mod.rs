pub mod convolution;
pub mod dropout;
pub mod fully_connected;
pub mod funnel;
pub mod lrn;
pub mod parallelized;
pub mod pooling;
pub mod relu;
pub mod softmax;

pub use convolution::ConvolutionBridge;
pub use dropout::DropoutBridge;
pub use fully_connected::FullyConnectedBridge;
pub use funnel::FunnelBridge;
pub use lrn::LRNBridge;
pub use parallelized::ParallelizedBridge;
pub use pooling::MaxPoolingBridge;
pub use relu::ReLUBridge;
pub use softmax::SoftmaxLossBridge;

use crate::cube::LogicalCube;
use crate::layer::{LayerArena, LayerId};
use crate::report::Report;
use crate::CnResult;

/// Effective solver step for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct UpdateParams {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

/// One network layer's executor. A bridge reads its input layer and writes
/// its output layer on `forward`, and propagates gradients (plus parameter
/// gradients when it owns a model) on `backward`. Layers are addressed
/// through the arena; bridges only carry ids.
pub trait Bridge: Send {
    fn name(&self) -> &str;
    fn input_id(&self) -> LayerId;
    fn output_id(&self) -> LayerId;

    fn forward(&mut self, arena: &mut LayerArena) -> CnResult<()>;
    fn backward(&mut self, arena: &mut LayerArena) -> CnResult<()>;

    /// Trailing mini-batches may be smaller than the allocated batch.
    fn set_curr_batch_size(&mut self, batch: usize);

    fn model_cube(&self) -> Option<&LogicalCube> {
        None
    }
    fn model_cube_mut(&mut self) -> Option<&mut LogicalCube> {
        None
    }
    fn bias_cube(&self) -> Option<&LogicalCube> {
        None
    }
    fn bias_cube_mut(&mut self) -> Option<&mut LogicalCube> {
        None
    }

    /// False only for the first convolution, which has no upstream bridge
    /// to propagate an input gradient to.
    fn needs_backward_grad(&self) -> bool {
        true
    }
    fn set_needs_backward_grad(&mut self, _needs: bool) {}

    /// Applies one solver step to the owned parameters, if any.
    fn apply_update(&mut self, _params: &UpdateParams) {}

    /// Loss-side surface, implemented by the softmax-loss bridge only.
    fn loss(&self) -> Option<f32> {
        None
    }
    fn reset_loss(&mut self) {}
    fn set_labels(&mut self, _labels: &[f32]) {}

    fn report_forward(&self) -> &Report;
    fn report_backward(&self) -> &Report;
}

/// The per-shard kernel driven by [`ParallelizedBridge`]: the same math as
/// a full bridge, restricted to one contiguous batch shard handed in as raw
/// CRDB slices. The canonical model and bias are shared read-only across
/// shards; each shard accumulates into its own gradient cubes, which the
/// wrapper reduces afterwards.
pub trait ShardBridge: Send {
    fn forward_shard(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        batch: usize,
        model: Option<&[f32]>,
        bias: Option<&[f32]>,
    ) -> CnResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn backward_shard(
        &mut self,
        input_data: &[f32],
        input_grad: Option<&mut [f32]>,
        output_data: &[f32],
        output_grad: &[f32],
        batch: usize,
        model: Option<&[f32]>,
    ) -> CnResult<()>;

    fn model_grad(&self) -> Option<&LogicalCube> {
        None
    }
    fn bias_grad(&self) -> Option<&LogicalCube> {
        None
    }

    fn forward_flops(&self, _batch: usize) -> u64 {
        0
    }
    fn backward_flops(&self, _batch: usize) -> u64 {
        0
    }
}

/// Output spatial extent of a convolution-shaped window sweep.
pub fn conv_output_dim(input: usize, kernel: usize, padding: usize, stride: usize) -> usize {
    (input + 2 * padding - kernel) / stride + 1
}
