use std::sync::Arc;

use tracing::info;

use crate::bridges::{
    conv_output_dim, Bridge, ConvolutionBridge, DropoutBridge, FullyConnectedBridge, FunnelBridge,
    LRNBridge, MaxPoolingBridge, ParallelizedBridge, ReLUBridge, SoftmaxLossBridge, UpdateParams,
};
use crate::config::{FillerConfig, FillerKind, LayerConfig, LayerType, NetConfig, Phase};
use crate::cube::LogicalCube;
use crate::driver::DeviceDriver;
use crate::layer::{LayerArena, LayerId};
use crate::{CnError, CnResult};

/// Outer-shard and inner-kernel parallelism per bridge family. The
/// defaults reproduce the stock heuristics (convolution-shaped bridges
/// fan wide across the batch with serial kernels; fully-connected runs one
/// shard with a parallel GEMM-side), but they are plain data so callers
/// can tune them.
#[derive(Debug, Clone, Copy)]
pub struct PartitionPlan {
    pub conv_partitions: usize,
    pub conv_inner_threads: usize,
    pub fc_partitions: usize,
    pub fc_inner_threads: usize,
}

impl Default for PartitionPlan {
    fn default() -> Self {
        Self {
            conv_partitions: 16,
            conv_inner_threads: 1,
            fc_partitions: 1,
            fc_inner_threads: 16,
        }
    }
}

/// An ordered bridge list plus the layer arena they execute over.
pub struct Network {
    pub arena: LayerArena,
    pub bridges: Vec<Box<dyn Bridge>>,
    input_layer: LayerId,
    phase: Phase,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("arena", &self.arena)
            .field("bridges", &self.bridges.len())
            .field("input_layer", &self.input_layer)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Network {
    /// Translates a parsed network description into bridges, seeding the
    /// first layer from `input_shape` (`[R, C, D, B]`, normally the
    /// corpus geometry).
    pub fn build(
        net: &NetConfig,
        input_shape: [usize; 4],
        phase: Phase,
        plan: &PartitionPlan,
        driver: Arc<dyn DeviceDriver>,
    ) -> CnResult<Network> {
        Builder {
            phase,
            plan: *plan,
            driver,
            batch: input_shape[3],
            arena: LayerArena::new(),
            bridges: Vec::new(),
        }
        .build(net, input_shape)
    }

    pub fn input_layer(&self) -> LayerId {
        self.input_layer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn input_data_mut(&mut self) -> &mut LogicalCube {
        &mut self.arena.get_mut(self.input_layer).data
    }

    /// Data cube of the last bridge's output layer.
    pub fn output_data(&self) -> &LogicalCube {
        let last = self.bridges.last().expect("network has no bridges");
        &self.arena.get(last.output_id()).data
    }

    pub fn forward(&mut self) -> CnResult<()> {
        for bridge in self.bridges.iter_mut() {
            bridge.forward(&mut self.arena)?;
        }
        Ok(())
    }

    /// Reverse sweep. Every layer gradient is zeroed first so that
    /// scatter-style writers can accumulate freely.
    pub fn backward(&mut self) -> CnResult<()> {
        self.arena.reset_grads();
        for bridge in self.bridges.iter_mut().rev() {
            bridge.backward(&mut self.arena)?;
        }
        Ok(())
    }

    pub fn set_curr_batch_size(&mut self, batch: usize) {
        for bridge in self.bridges.iter_mut() {
            bridge.set_curr_batch_size(batch);
        }
    }

    pub fn apply_update(&mut self, params: &UpdateParams) {
        for bridge in self.bridges.iter_mut() {
            bridge.apply_update(params);
        }
    }

    pub fn loss(&self) -> f32 {
        self.bridges
            .last()
            .and_then(|b| b.loss())
            .unwrap_or_default()
    }

    pub fn reset_loss(&mut self) {
        if let Some(bridge) = self.bridges.last_mut() {
            bridge.reset_loss();
        }
    }

    pub fn set_labels(&mut self, labels: &[f32]) {
        if let Some(bridge) = self.bridges.last_mut() {
            bridge.set_labels(labels);
        }
    }
}

fn checked_output_dim(
    name: &str,
    input: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
) -> CnResult<usize> {
    if kernel == 0 || stride == 0 || input + 2 * padding < kernel {
        return Err(CnError::Config(format!(
            "layer `{name}`: kernel {kernel} / stride {stride} does not fit a {input}-wide input with padding {padding}"
        )));
    }
    Ok(conv_output_dim(input, kernel, padding, stride))
}

struct Builder {
    phase: Phase,
    plan: PartitionPlan,
    driver: Arc<dyn DeviceDriver>,
    batch: usize,
    arena: LayerArena,
    bridges: Vec<Box<dyn Bridge>>,
}

impl Builder {
    fn build(mut self, net: &NetConfig, input_shape: [usize; 4]) -> CnResult<Network> {
        let [mut input_r, mut input_c, mut input_d, _] = input_shape;
        let input_layer = self.arena.alloc(input_r, input_c, input_d, self.batch);
        let mut prev_layers: Vec<LayerId> = vec![input_layer];
        let mut is_first_conv = true;

        // Layers that belong to this phase, DATA included (its geometry is
        // already reflected in input_shape).
        let layers: Vec<&LayerConfig> = net
            .layers
            .iter()
            .filter(|l| l.include_phase.map_or(true, |p| p == self.phase))
            .collect();

        for (index, layer) in layers.iter().enumerate() {
            if layer.layer_type == LayerType::Data {
                continue;
            }
            let n_prev = prev_layers.len();
            let mut next_layers: Vec<LayerId> = Vec::new();
            let (mut output_r, mut output_c, mut output_d) = (input_r, input_c, input_d);

            match layer.layer_type {
                LayerType::Convolution => {
                    let param = layer.convolution.as_ref().ok_or_else(|| {
                        CnError::Config(format!("layer `{}`: missing convolution_param", layer.name))
                    })?;
                    let mut grouping = param.group.max(1);

                    // Grouping syntax compatibility: when this convolution
                    // says group 1 but the next convolution in the net is
                    // grouped, this one inherits that grouping.
                    for later in &layers[index + 1..] {
                        if later.layer_type == LayerType::Convolution {
                            if let Some(p) = later.convolution.as_ref() {
                                if grouping == 1 && p.group > 1 {
                                    grouping = p.group;
                                }
                            }
                            break;
                        }
                    }

                    if param.num_output % grouping != 0 {
                        return Err(CnError::Config(format!(
                            "layer `{}`: num_output {} is not divisible by group {grouping}",
                            layer.name, param.num_output
                        )));
                    }
                    output_r = checked_output_dim(
                        &layer.name,
                        input_r,
                        param.kernel_size,
                        param.pad,
                        param.stride,
                    )?;
                    output_c = checked_output_dim(
                        &layer.name,
                        input_c,
                        param.kernel_size,
                        param.pad,
                        param.stride,
                    )?;
                    output_d = param.num_output / grouping;

                    if is_first_conv && !self.bridges.is_empty() {
                        return Err(CnError::Config(format!(
                            "layer `{}`: the first convolution must directly follow the data layer",
                            layer.name
                        )));
                    }

                    let sources: Vec<LayerId> = if grouping == n_prev {
                        prev_layers.clone()
                    } else if grouping > 1 && n_prev == 1 {
                        vec![prev_layers[0]; grouping]
                    } else {
                        return Err(CnError::Config(format!(
                            "layer `{}`: cannot go from {n_prev} input groups to {grouping} groups",
                            layer.name
                        )));
                    };
                    info!(
                        layer = %layer.name,
                        grouping,
                        input_groups = n_prev,
                        "constructing CONV bridge(s)"
                    );

                    for &source in &sources {
                        let next = self.arena.alloc(output_r, output_c, output_d, self.batch);
                        let mut model =
                            LogicalCube::new(param.kernel_size, param.kernel_size, input_d, output_d);
                        let fan_in = param.kernel_size * param.kernel_size * input_d;
                        self.fill(&mut model, &param.weight_filler, fan_in);
                        let mut bias = LogicalCube::new(1, 1, output_d, 1);
                        self.fill(&mut bias, &param.bias_filler, fan_in);

                        let driver = self.driver.clone();
                        let (k, p, s) = (param.kernel_size, param.pad, param.stride);
                        let (ir, ic, id, od) = (input_r, input_c, input_d, output_d);
                        let mut bridge = ParallelizedBridge::new(
                            layer.name.clone(),
                            source,
                            next,
                            self.batch,
                            self.plan.conv_partitions,
                            self.plan.conv_inner_threads,
                            Some(model),
                            Some(bias),
                            self.driver.clone(),
                            |capacity| {
                                ConvolutionBridge::new(
                                    ir,
                                    ic,
                                    id,
                                    od,
                                    capacity,
                                    k,
                                    p,
                                    s,
                                    driver.clone(),
                                )
                            },
                        )?;
                        bridge.set_needs_backward_grad(!is_first_conv);
                        self.bridges.push(Box::new(bridge));
                        next_layers.push(next);
                    }
                    is_first_conv = false;
                }

                LayerType::InnerProduct => {
                    let param = layer.inner_product.as_ref().ok_or_else(|| {
                        CnError::Config(format!(
                            "layer `{}`: missing inner_product_param",
                            layer.name
                        ))
                    })?;

                    let mut source = prev_layers[0];
                    if n_prev != 1 {
                        // Multiple upstream groups feed one fully-connected
                        // layer only through a funnel.
                        info!(input_groups = n_prev, "constructing FUNNEL bridge");
                        let funneled_d = input_d * n_prev;
                        let funnel_out = self.arena.alloc(input_r, input_c, funneled_d, self.batch);
                        let funnel = FunnelBridge::new(
                            "FUNNEL",
                            prev_layers.clone(),
                            funnel_out,
                            &self.arena,
                        )?;
                        self.bridges.push(Box::new(funnel));
                        input_d = funneled_d;
                        source = funnel_out;
                    }

                    info!(layer = %layer.name, "constructing FC bridge");
                    output_r = 1;
                    output_c = 1;
                    output_d = param.num_output;
                    let next = self.arena.alloc(1, 1, output_d, self.batch);
                    let mut model = LogicalCube::new(input_r, input_c, input_d, output_d);
                    let fan_in = input_r * input_c * input_d;
                    self.fill(&mut model, &param.weight_filler, fan_in);
                    let mut bias = LogicalCube::new(1, 1, output_d, 1);
                    self.fill(&mut bias, &param.bias_filler, fan_in);

                    let driver = self.driver.clone();
                    let (ir, ic, id, od) = (input_r, input_c, input_d, output_d);
                    let bridge = ParallelizedBridge::new(
                        layer.name.clone(),
                        source,
                        next,
                        self.batch,
                        self.plan.fc_partitions,
                        self.plan.fc_inner_threads,
                        Some(model),
                        Some(bias),
                        self.driver.clone(),
                        |_capacity| FullyConnectedBridge::new(ir, ic, id, od, driver.clone()),
                    )?;
                    self.bridges.push(Box::new(bridge));
                    next_layers.push(next);
                }

                LayerType::Pooling => {
                    let param = layer.pooling.as_ref().ok_or_else(|| {
                        CnError::Config(format!("layer `{}`: missing pooling_param", layer.name))
                    })?;
                    output_r = checked_output_dim(&layer.name, input_r, param.kernel_size, 0, param.stride)?;
                    output_c = checked_output_dim(&layer.name, input_c, param.kernel_size, 0, param.stride)?;
                    info!(layer = %layer.name, input_groups = n_prev, "constructing MAXPOOLING bridge(s)");
                    for &source in &prev_layers {
                        let next = self.arena.alloc(output_r, output_c, input_d, self.batch);
                        let driver = self.driver.clone();
                        let (ir, ic, id) = (input_r, input_c, input_d);
                        let (k, s) = (param.kernel_size, param.stride);
                        let bridge = ParallelizedBridge::new(
                            layer.name.clone(),
                            source,
                            next,
                            self.batch,
                            self.plan.conv_partitions,
                            self.plan.conv_inner_threads,
                            None,
                            None,
                            self.driver.clone(),
                            |capacity| {
                                MaxPoolingBridge::new(ir, ic, id, capacity, k, s, driver.clone())
                            },
                        )?;
                        self.bridges.push(Box::new(bridge));
                        next_layers.push(next);
                    }
                }

                LayerType::ReLU => {
                    info!(layer = %layer.name, input_groups = n_prev, "constructing RELU bridge(s)");
                    for &source in &prev_layers {
                        let next = self.arena.alloc(input_r, input_c, input_d, self.batch);
                        let driver = self.driver.clone();
                        let (ir, ic, id) = (input_r, input_c, input_d);
                        let bridge = ParallelizedBridge::new(
                            layer.name.clone(),
                            source,
                            next,
                            self.batch,
                            self.plan.conv_partitions,
                            self.plan.conv_inner_threads,
                            None,
                            None,
                            self.driver.clone(),
                            |_capacity| Ok(ReLUBridge::new(ir, ic, id, driver.clone())),
                        )?;
                        self.bridges.push(Box::new(bridge));
                        next_layers.push(next);
                    }
                }

                LayerType::Lrn => {
                    let param = layer.lrn.as_ref().ok_or_else(|| {
                        CnError::Config(format!("layer `{}`: missing lrn_param", layer.name))
                    })?;
                    info!(layer = %layer.name, input_groups = n_prev, "constructing LRN bridge(s)");
                    for &source in &prev_layers {
                        let next = self.arena.alloc(input_r, input_c, input_d, self.batch);
                        let driver = self.driver.clone();
                        let (ir, ic, id) = (input_r, input_c, input_d);
                        let (alpha, beta, local) = (param.alpha, param.beta, param.local_size);
                        let bridge = ParallelizedBridge::new(
                            layer.name.clone(),
                            source,
                            next,
                            self.batch,
                            self.plan.conv_partitions,
                            self.plan.conv_inner_threads,
                            None,
                            None,
                            self.driver.clone(),
                            |capacity| {
                                LRNBridge::new(
                                    ir,
                                    ic,
                                    id,
                                    capacity,
                                    alpha,
                                    beta,
                                    local,
                                    driver.clone(),
                                )
                            },
                        )?;
                        self.bridges.push(Box::new(bridge));
                        next_layers.push(next);
                    }
                }

                LayerType::Dropout => {
                    let param = layer.dropout.as_ref().ok_or_else(|| {
                        CnError::Config(format!("layer `{}`: missing dropout_param", layer.name))
                    })?;
                    info!(layer = %layer.name, input_groups = n_prev, "constructing DROPOUT bridge(s)");
                    for &source in &prev_layers {
                        let next = self.arena.alloc(input_r, input_c, input_d, self.batch);
                        let bridge = DropoutBridge::new(
                            layer.name.clone(),
                            source,
                            next,
                            [input_r, input_c, input_d, self.batch],
                            param.dropout_ratio,
                            self.phase,
                            self.driver.clone(),
                        )?;
                        self.bridges.push(Box::new(bridge));
                        next_layers.push(next);
                    }
                }

                LayerType::SoftmaxLoss => {
                    if n_prev != 1 {
                        return Err(CnError::Config(format!(
                            "layer `{}`: softmax loss requires a single input group, found {n_prev}",
                            layer.name
                        )));
                    }
                    info!(layer = %layer.name, "constructing SOFTMAX bridge");
                    let next = self.arena.alloc(input_r, input_c, input_d, self.batch);
                    let bridge =
                        SoftmaxLossBridge::new(layer.name.clone(), prev_layers[0], next, &self.arena)?;
                    self.bridges.push(Box::new(bridge));
                    next_layers.push(next);
                }

                LayerType::Data => unreachable!("data layers are skipped above"),
            }

            input_r = output_r;
            input_c = output_c;
            input_d = output_d;
            prev_layers = next_layers;
        }

        if self.bridges.is_empty() {
            return Err(CnError::Config(
                "network defines no executable layers".into(),
            ));
        }
        if self.bridges.last().map_or(true, |b| b.loss().is_none()) {
            return Err(CnError::Config(
                "network must end in a SOFTMAX_LOSS layer".into(),
            ));
        }

        Ok(Network {
            arena: self.arena,
            bridges: self.bridges,
            input_layer,
            phase: self.phase,
        })
    }

    fn fill(&self, cube: &mut LogicalCube, filler: &FillerConfig, fan_in: usize) {
        match filler.kind {
            FillerKind::Xavier => self.driver.sinitialize_xavier(cube.data_mut(), fan_in),
            FillerKind::Gaussian => {
                self.driver
                    .sgaussian_initialize(cube.data_mut(), filler.mean, filler.std)
            }
            FillerKind::Constant => self.driver.sconstant_initialize(cube.data_mut(), filler.value),
        }
    }
}
