use std::sync::Arc;

use cubenet::config::NetConfig;
use cubenet::driver::CpuDriver;
use cubenet::net::{Network, PartitionPlan};
use cubenet::Phase;

fn build(net_text: &str, input_shape: [usize; 4], phase: Phase) -> cubenet::CnResult<Network> {
    let cfg = NetConfig::from_str(net_text).unwrap();
    Network::build(
        &cfg,
        input_shape,
        phase,
        &PartitionPlan::default(),
        Arc::new(CpuDriver::new()),
    )
}

const GROUPED_NET: &str = r#"
name: "grouped"
layer {
  name: "data"
  type: DATA
  data_param { batch_size: 4 channels: 3 height: 12 width: 12 }
}
layer {
  name: "conv1"
  type: CONVOLUTION
  convolution_param { num_output: 8 kernel_size: 3 stride: 1 weight_filler { type: "constant" value: 0.01 } }
}
layer { name: "relu1" type: RELU }
layer {
  name: "conv2"
  type: CONVOLUTION
  convolution_param { num_output: 8 kernel_size: 3 stride: 1 group: 2 weight_filler { type: "constant" value: 0.01 } }
}
layer {
  name: "fc"
  type: INNER_PRODUCT
  inner_product_param { num_output: 6 weight_filler { type: "constant" value: 0.01 } }
}
layer { name: "loss" type: SOFTMAX_LOSS }
"#;

// conv1 declares group 1 but the next convolution is grouped, so conv1
// inherits group 2: the single input forks into two bridges, relu runs
// per group, conv2 stays two-group, and the fully-connected layer pulls
// everything back together through a funnel.
#[test]
fn group_promotion_quirk_forks_the_earlier_convolution() {
    let net = build(GROUPED_NET, [12, 12, 3, 4], Phase::Train).unwrap();
    let names: Vec<&str> = net.bridges.iter().map(|b| b.name()).collect();
    assert_eq!(
        names,
        vec!["conv1", "conv1", "relu1", "relu1", "conv2", "conv2", "FUNNEL", "fc", "loss"]
    );

    // Promoted grouping halves the per-bridge output depth: 8 / 2 = 4.
    let conv1_model = net.bridges[0].model_cube().unwrap();
    assert_eq!(conv1_model.shape(), [3, 3, 3, 4]);
    // conv2 sees the 4-channel group output.
    let conv2_model = net.bridges[4].model_cube().unwrap();
    assert_eq!(conv2_model.shape(), [3, 3, 4, 4]);
}

#[test]
fn first_convolution_skips_backward_grad() {
    let net = build(GROUPED_NET, [12, 12, 3, 4], Phase::Train).unwrap();
    assert!(!net.bridges[0].needs_backward_grad());
    assert!(!net.bridges[1].needs_backward_grad());
    // Later convolutions propagate.
    assert!(net.bridges[4].needs_backward_grad());
}

#[test]
fn grouped_net_trains_end_to_end() {
    let mut net = build(GROUPED_NET, [12, 12, 3, 4], Phase::Train).unwrap();
    for (i, v) in net.input_data_mut().data_mut().iter_mut().enumerate() {
        *v = (i % 17) as f32 / 17.0;
    }
    net.set_labels(&[0.0, 1.0, 2.0, 3.0]);
    net.reset_loss();
    net.forward().unwrap();
    let loss = net.loss();
    assert!(loss.is_finite() && loss > 0.0);
    net.backward().unwrap();
    net.apply_update(&cubenet::bridges::UpdateParams {
        lr: 0.01,
        momentum: 0.9,
        weight_decay: 0.0005,
    });
}

#[test]
fn convolution_must_follow_the_data_layer() {
    let err = build(
        r#"
        layer { name: "data" type: DATA data_param { batch_size: 2 channels: 1 height: 8 width: 8 } }
        layer { name: "pool" type: POOLING pooling_param { kernel_size: 2 stride: 2 } }
        layer { name: "conv" type: CONVOLUTION convolution_param { num_output: 4 kernel_size: 3 } }
        layer { name: "loss" type: SOFTMAX_LOSS }
        "#,
        [8, 8, 1, 2],
        Phase::Train,
    )
    .unwrap_err();
    assert!(err.to_string().contains("directly follow the data layer"));
}

#[test]
fn output_depth_must_divide_by_group() {
    let err = build(
        r#"
        layer { name: "data" type: DATA data_param { batch_size: 2 channels: 1 height: 8 width: 8 } }
        layer { name: "conv" type: CONVOLUTION convolution_param { num_output: 9 kernel_size: 3 group: 2 } }
        layer { name: "loss" type: SOFTMAX_LOSS }
        "#,
        [8, 8, 1, 2],
        Phase::Train,
    )
    .unwrap_err();
    assert!(err.to_string().contains("not divisible by group"));
}

#[test]
fn softmax_rejects_multiple_groups() {
    let err = build(
        r#"
        layer { name: "data" type: DATA data_param { batch_size: 2 channels: 1 height: 6 width: 6 } }
        layer { name: "conv" type: CONVOLUTION convolution_param { num_output: 4 kernel_size: 6 group: 2 } }
        layer { name: "loss" type: SOFTMAX_LOSS }
        "#,
        [6, 6, 1, 2],
        Phase::Train,
    )
    .unwrap_err();
    assert!(err.to_string().contains("single input group"));
}

#[test]
fn network_must_end_in_a_loss_layer() {
    let err = build(
        r#"
        layer { name: "data" type: DATA data_param { batch_size: 2 channels: 1 height: 6 width: 6 } }
        layer { name: "conv" type: CONVOLUTION convolution_param { num_output: 4 kernel_size: 3 } }
        "#,
        [6, 6, 1, 2],
        Phase::Train,
    )
    .unwrap_err();
    assert!(err.to_string().contains("SOFTMAX_LOSS"));
}

// Phase-tagged layers only exist in their own phase: dropout marked TRAIN
// disappears from the test-phase network.
#[test]
fn phase_includes_filter_layers() {
    let text = r#"
        layer { name: "data" type: DATA data_param { batch_size: 2 channels: 2 height: 1 width: 1 } }
        layer { name: "fc1" type: INNER_PRODUCT inner_product_param { num_output: 4 } }
        layer { name: "drop" type: DROPOUT include { phase: TRAIN } dropout_param { dropout_ratio: 0.5 } }
        layer { name: "fc2" type: INNER_PRODUCT inner_product_param { num_output: 2 } }
        layer { name: "loss" type: SOFTMAX_LOSS }
    "#;
    let train = build(text, [1, 1, 2, 2], Phase::Train).unwrap();
    let test = build(text, [1, 1, 2, 2], Phase::Test).unwrap();
    assert_eq!(train.bridges.len(), 4);
    assert_eq!(test.bridges.len(), 3);
    assert!(train.bridges.iter().any(|b| b.name() == "drop"));
    assert!(test.bridges.iter().all(|b| b.name() != "drop"));
}

// A full stack with pooling, LRN and dropout holds its shapes together
// and produces finite loss in both sweeps.
#[test]
fn full_stack_smoke() {
    let text = r#"
        name: "smoke"
        layer { name: "data" type: DATA data_param { batch_size: 3 channels: 2 height: 12 width: 12 } }
        layer { name: "conv1" type: CONVOLUTION convolution_param { num_output: 4 kernel_size: 3 pad: 1 } }
        layer { name: "relu1" type: RELU }
        layer { name: "pool1" type: POOLING pooling_param { kernel_size: 2 stride: 2 } }
        layer { name: "norm1" type: LRN lrn_param { local_size: 3 alpha: 0.0001 beta: 0.75 } }
        layer { name: "drop1" type: DROPOUT dropout_param { dropout_ratio: 0.3 } }
        layer { name: "fc1" type: INNER_PRODUCT inner_product_param { num_output: 5 } }
        layer { name: "loss" type: SOFTMAX_LOSS }
    "#;
    let mut net = build(text, [12, 12, 2, 3], Phase::Train).unwrap();
    for (i, v) in net.input_data_mut().data_mut().iter_mut().enumerate() {
        *v = ((i % 23) as f32 - 11.0) / 23.0;
    }
    net.set_labels(&[0.0, 2.0, 4.0]);
    net.reset_loss();
    net.forward().unwrap();
    assert!(net.loss().is_finite());
    net.backward().unwrap();

    // Partial batch path.
    net.set_curr_batch_size(2);
    net.reset_loss();
    net.forward().unwrap();
    assert!(net.loss().is_finite());
    net.backward().unwrap();
}
