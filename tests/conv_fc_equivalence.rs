use std::sync::Arc;

use cubenet::bridges::{Bridge, ConvolutionBridge, FullyConnectedBridge, ParallelizedBridge};
use cubenet::driver::{CpuDriver, DeviceDriver};
use cubenet::layer::{LayerArena, LayerId};
use cubenet::LogicalCube;

const EPS: f32 = 1e-2;

fn driver() -> Arc<dyn DeviceDriver> {
    Arc::new(CpuDriver::new())
}

fn fill_pattern(data: &mut [f32], seed: u32) {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(12345) | 1;
    for v in data.iter_mut() {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        *v = (state >> 8) as f32 / (1u32 << 24) as f32;
    }
}

fn close(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() <= tol + 1e-3 * a.abs().max(b.abs())
}

#[allow(clippy::too_many_arguments)]
fn conv_bridge(
    arena_input: LayerId,
    arena_output: LayerId,
    dims: (usize, usize, usize, usize, usize),
    kernel: usize,
    padding: usize,
    stride: usize,
    partitions: usize,
    model: LogicalCube,
    bias: LogicalCube,
    driver: Arc<dyn DeviceDriver>,
) -> ParallelizedBridge<ConvolutionBridge> {
    let (i_r, i_c, i_d, o_d, batch) = dims;
    let d2 = driver.clone();
    let mut bridge = ParallelizedBridge::new(
        "conv",
        arena_input,
        arena_output,
        batch,
        partitions,
        1,
        Some(model),
        Some(bias),
        driver,
        |capacity| {
            ConvolutionBridge::new(
                i_r,
                i_c,
                i_d,
                o_d,
                capacity,
                kernel,
                padding,
                stride,
                d2.clone(),
            )
        },
    )
    .unwrap();
    bridge.set_needs_backward_grad(true);
    bridge
}

// When the kernel covers the whole input plane with no padding, the
// convolution and the fully-connected layer are the same linear map, so
// both bridges must agree on the forward output and on every gradient.
#[test]
fn conv_and_fc_agree_when_kernel_equals_input() {
    let (m_b, i_d, o_d, i_r, i_c, k, s, p) = (7, 12, 25, 20, 20, 20, 1, 0);
    let driver = driver();

    let mut arena = LayerArena::new();
    let conv_in = arena.alloc(i_r, i_c, i_d, m_b);
    let conv_out = arena.alloc(1, 1, o_d, m_b);
    let fc_in = arena.alloc(i_r, i_c, i_d, m_b);
    let fc_out = arena.alloc(1, 1, o_d, m_b);

    let mut model = LogicalCube::new(k, k, i_d, o_d);
    fill_pattern(model.data_mut(), 1);
    let mut bias = LogicalCube::new(1, 1, o_d, 1);
    fill_pattern(bias.data_mut(), 2);

    let mut input = vec![0.0f32; i_r * i_c * i_d * m_b];
    fill_pattern(&mut input, 3);
    arena.get_mut(conv_in).data.data_mut().copy_from_slice(&input);
    arena.get_mut(fc_in).data.data_mut().copy_from_slice(&input);

    let mut conv = conv_bridge(
        conv_in,
        conv_out,
        (i_r, i_c, i_d, o_d, m_b),
        k,
        p,
        s,
        1,
        model.clone(),
        bias.clone(),
        driver.clone(),
    );
    let d2 = driver.clone();
    let mut fc = ParallelizedBridge::new(
        "fc",
        fc_in,
        fc_out,
        m_b,
        1,
        1,
        Some(model),
        Some(bias),
        driver.clone(),
        |_capacity| FullyConnectedBridge::new(i_r, i_c, i_d, o_d, d2.clone()),
    )
    .unwrap();

    conv.forward(&mut arena).unwrap();
    fc.forward(&mut arena).unwrap();

    let conv_y = arena.get(conv_out).data.data().to_vec();
    let fc_y = arena.get(fc_out).data.data().to_vec();
    for (i, (&a, &b)) in conv_y.iter().zip(&fc_y).enumerate() {
        assert!(close(a, b, EPS), "forward mismatch at {i}: {a} vs {b}");
    }

    // Identical upstream gradients.
    for (i, v) in arena.get_mut(conv_out).grad.data_mut().iter_mut().enumerate() {
        *v = i as f32 * 0.01;
    }
    for (i, v) in arena.get_mut(fc_out).grad.data_mut().iter_mut().enumerate() {
        *v = i as f32 * 0.01;
    }
    conv.backward(&mut arena).unwrap();
    fc.backward(&mut arena).unwrap();

    let conv_dx = arena.get(conv_in).grad.data().to_vec();
    let fc_dx = arena.get(fc_in).grad.data().to_vec();
    for (i, (&a, &b)) in conv_dx.iter().zip(&fc_dx).enumerate() {
        assert!(close(a, b, EPS), "input grad mismatch at {i}: {a} vs {b}");
    }

    let conv_dw = conv.model_grad_cube().unwrap().data();
    let fc_dw = fc.model_grad_cube().unwrap().data();
    for (i, (&a, &b)) in conv_dw.iter().zip(fc_dw).enumerate() {
        assert!(close(a, b, EPS), "weight grad mismatch at {i}: {a} vs {b}");
    }

    let conv_db = conv.bias_grad_cube().unwrap().data();
    let fc_db = fc.bias_grad_cube().unwrap().data();
    for (i, (&a, &b)) in conv_db.iter().zip(fc_db).enumerate() {
        assert!(close(a, b, EPS), "bias grad mismatch at {i}: {a} vs {b}");
    }
}

// Sharding the mini-batch must not change the math: any partition count
// produces the same activations and gradients as a single shard, up to
// floating-point reduction order.
#[test]
fn parallelized_sharding_matches_single_shard() {
    let (m_b, i_d, o_d, i_r, i_c, k, s, p) = (8, 3, 5, 9, 9, 3, 2, 1);
    let o_r = (i_r + 2 * p - k) / s + 1;
    let driver = driver();

    let mut arena = LayerArena::new();
    let in_1 = arena.alloc(i_r, i_c, i_d, m_b);
    let out_1 = arena.alloc(o_r, o_r, o_d, m_b);
    let in_4 = arena.alloc(i_r, i_c, i_d, m_b);
    let out_4 = arena.alloc(o_r, o_r, o_d, m_b);

    let mut model = LogicalCube::new(k, k, i_d, o_d);
    fill_pattern(model.data_mut(), 11);
    let mut bias = LogicalCube::new(1, 1, o_d, 1);
    fill_pattern(bias.data_mut(), 12);
    let mut input = vec![0.0f32; i_r * i_c * i_d * m_b];
    fill_pattern(&mut input, 13);
    arena.get_mut(in_1).data.data_mut().copy_from_slice(&input);
    arena.get_mut(in_4).data.data_mut().copy_from_slice(&input);

    let dims = (i_r, i_c, i_d, o_d, m_b);
    let mut single = conv_bridge(
        in_1,
        out_1,
        dims,
        k,
        p,
        s,
        1,
        model.clone(),
        bias.clone(),
        driver.clone(),
    );
    let mut sharded = conv_bridge(in_4, out_4, dims, k, p, s, 4, model, bias, driver.clone());
    assert_eq!(sharded.n_partitions(), 4);

    single.forward(&mut arena).unwrap();
    sharded.forward(&mut arena).unwrap();
    let y1 = arena.get(out_1).data.data().to_vec();
    let y4 = arena.get(out_4).data.data().to_vec();
    for (i, (&a, &b)) in y1.iter().zip(&y4).enumerate() {
        assert!((a - b).abs() < 1e-5, "forward mismatch at {i}: {a} vs {b}");
    }

    let mut seed = vec![0.0f32; y1.len()];
    fill_pattern(&mut seed, 14);
    arena.get_mut(out_1).grad.data_mut().copy_from_slice(&seed);
    arena.get_mut(out_4).grad.data_mut().copy_from_slice(&seed);
    single.backward(&mut arena).unwrap();
    sharded.backward(&mut arena).unwrap();

    let dx1 = arena.get(in_1).grad.data().to_vec();
    let dx4 = arena.get(in_4).grad.data().to_vec();
    for (i, (&a, &b)) in dx1.iter().zip(&dx4).enumerate() {
        assert!((a - b).abs() < 1e-5, "input grad mismatch at {i}");
    }
    let dw1 = single.model_grad_cube().unwrap().data();
    let dw4 = sharded.model_grad_cube().unwrap().data();
    for (i, (&a, &b)) in dw1.iter().zip(dw4).enumerate() {
        assert!((a - b).abs() < 1e-4, "weight grad mismatch at {i}: {a} vs {b}");
    }
}

// A trailing partial batch must flow through the same shard split.
#[test]
fn parallelized_handles_partial_batches() {
    let (m_b, i_d, o_d, i_r, i_c, k, s, p) = (6, 2, 4, 5, 5, 3, 1, 0);
    let o_r = (i_r + 2 * p - k) / s + 1;
    let driver = driver();
    let mut arena = LayerArena::new();
    let input = arena.alloc(i_r, i_c, i_d, m_b);
    let output = arena.alloc(o_r, o_r, o_d, m_b);
    let mut model = LogicalCube::new(k, k, i_d, o_d);
    fill_pattern(model.data_mut(), 41);
    let bias = LogicalCube::new(1, 1, o_d, 1);
    fill_pattern(arena.get_mut(input).data.data_mut(), 42);

    let mut bridge = conv_bridge(
        input,
        output,
        (i_r, i_c, i_d, o_d, m_b),
        k,
        p,
        s,
        4,
        model,
        bias,
        driver,
    );
    bridge.set_curr_batch_size(3);
    bridge.forward(&mut arena).unwrap();
    fill_pattern(arena.get_mut(output).grad.data_mut(), 43);
    arena.get_mut(input).grad.reset();
    bridge.backward(&mut arena).unwrap();

    // Only the first three batch items were computed.
    let out = &arena.get(output).data;
    assert!(out.batch_slice(3).iter().all(|&v| v == 0.0));
    assert!(out.batch_slice(0).iter().any(|&v| v != 0.0));
}

// The analytic convolution gradients agree with central finite
// differences on a small instance.
#[test]
fn conv_gradients_match_finite_differences() {
    let (m_b, i_d, o_d, i_r, i_c, k, s, p) = (2, 2, 2, 4, 4, 3, 2, 1);
    let o_r = (i_r + 2 * p - k) / s + 1;
    let driver = driver();

    let mut input = vec![0.0f32; i_r * i_c * i_d * m_b];
    fill_pattern(&mut input, 61);
    let mut model = LogicalCube::new(k, k, i_d, o_d);
    fill_pattern(model.data_mut(), 62);
    let bias = LogicalCube::new(1, 1, o_d, 1);
    let mut grad_seed = vec![0.0f32; o_r * o_r * o_d * m_b];
    fill_pattern(&mut grad_seed, 63);

    let run = |input: &[f32], model: &LogicalCube| -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let mut arena = LayerArena::new();
        let in_id = arena.alloc(i_r, i_c, i_d, m_b);
        let out_id = arena.alloc(o_r, o_r, o_d, m_b);
        arena.get_mut(in_id).data.data_mut().copy_from_slice(input);
        let mut bridge = conv_bridge(
            in_id,
            out_id,
            (i_r, i_c, i_d, o_d, m_b),
            k,
            p,
            s,
            1,
            model.clone(),
            bias.clone(),
            driver.clone(),
        );
        bridge.forward(&mut arena).unwrap();
        let y = arena.get(out_id).data.data().to_vec();
        arena.get_mut(out_id).grad.data_mut().copy_from_slice(&grad_seed);
        arena.get_mut(in_id).grad.reset();
        bridge.backward(&mut arena).unwrap();
        let dx = arena.get(in_id).grad.data().to_vec();
        let dw = bridge.model_grad_cube().unwrap().data().to_vec();
        (y, dx, dw)
    };

    let (_, dx, dw) = run(&input, &model);
    let loss_of = |y: &[f32]| -> f32 { y.iter().zip(&grad_seed).map(|(a, b)| a * b).sum() };
    let eps = 1e-2f32;

    for i in [0, 5, input.len() / 2, input.len() - 1] {
        let mut plus = input.clone();
        plus[i] += eps;
        let mut minus = input.clone();
        minus[i] -= eps;
        let numeric = (loss_of(&run(&plus, &model).0) - loss_of(&run(&minus, &model).0)) / (2.0 * eps);
        assert!(
            (dx[i] - numeric).abs() < 5e-2,
            "input grad {i}: analytic {} vs numeric {numeric}",
            dx[i]
        );
    }

    for i in [0, 7, model.n_elements() - 1] {
        let mut plus = model.clone();
        plus.data_mut()[i] += eps;
        let mut minus = model.clone();
        minus.data_mut()[i] -= eps;
        let numeric = (loss_of(&run(&input, &plus).0) - loss_of(&run(&input, &minus).0)) / (2.0 * eps);
        assert!(
            (dw[i] - numeric).abs() < 5e-2,
            "weight grad {i}: analytic {} vs numeric {numeric}",
            dw[i]
        );
    }
}
