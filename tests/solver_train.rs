use std::io::Write;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use cubenet::config::{NetConfig, SolverConfig};
use cubenet::corpus::Corpus;
use cubenet::driver::CpuDriver;
use cubenet::net::{Network, PartitionPlan};
use cubenet::solver::{find_accuracy, read_model, write_model, Solver};
use cubenet::Phase;

const NET_TEXT: &str = r#"
name: "separable"
layer {
  name: "data"
  type: DATA
  include { phase: TRAIN }
  data_param { batch_size: 16 channels: 1 height: 2 width: 2 }
}
layer {
  name: "data_test"
  type: DATA
  include { phase: TEST }
  data_param { batch_size: 16 channels: 1 height: 2 width: 2 }
}
layer {
  name: "fc1"
  type: INNER_PRODUCT
  inner_product_param { num_output: 8 weight_filler { type: "gaussian" std: 0.1 } }
}
layer { name: "relu1" type: RELU }
layer {
  name: "fc2"
  type: INNER_PRODUCT
  inner_product_param { num_output: 2 weight_filler { type: "gaussian" std: 0.1 } }
}
layer { name: "loss" type: SOFTMAX_LOSS }
"#;

/// Writes a linearly separable two-class corpus: class 0 lights up the
/// first two pixels, class 1 the last two.
fn write_corpus(path: &std::path::Path, n_images: usize) {
    let mut out = std::fs::File::create(path).unwrap();
    for i in 0..n_images {
        let class = i % 2;
        let pixels: [f32; 4] = if class == 0 {
            [1.0, 1.0, 0.0, 0.0]
        } else {
            [0.0, 0.0, 1.0, 1.0]
        };
        for v in pixels {
            out.write_f32::<LittleEndian>(v).unwrap();
        }
        out.write_f32::<LittleEndian>(class as f32).unwrap();
    }
    out.flush().unwrap();
}

fn solver_text(epochs: usize) -> String {
    format!(
        "net: \"net.conf\"\nbase_lr: 0.01\nmomentum: 0.9\nlr_policy: \"fixed\"\nmax_iter: {epochs}\n"
    )
}

fn first_batch_loss(net: &mut Network, corpus: &Corpus) -> f32 {
    let mut reader = corpus.reader().unwrap();
    let batch = corpus.batch_size_of(0);
    reader.fill_batch(net.input_data_mut(), batch).unwrap();
    net.set_curr_batch_size(batch);
    net.set_labels(corpus.batch_labels(0));
    net.reset_loss();
    net.forward().unwrap();
    net.loss() / batch as f32
}

// Solver smoke per the classic recipe: a 2-layer classifier on separable
// data must at least halve its loss within 200 iterations at lr 0.01.
#[test]
fn training_halves_the_loss_on_separable_data() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("corpus.bin");
    write_corpus(&data_path, 64);

    let net_cfg = NetConfig::from_str(NET_TEXT).unwrap();
    let data_param = net_cfg.layers[0].data.clone().unwrap();
    let mut corpus = Corpus::open(&data_param, &data_path).unwrap();
    assert_eq!(corpus.n_images, 64);
    assert_eq!(corpus.num_mini_batches, 4);
    assert_eq!(corpus.last_batch_size, 16);

    let driver = Arc::new(CpuDriver::new());
    let mut net = Network::build(
        &net_cfg,
        corpus.input_shape(),
        Phase::Train,
        &PartitionPlan::default(),
        driver,
    )
    .unwrap();

    let initial_loss = first_batch_loss(&mut net, &corpus);
    assert!(initial_loss.is_finite() && initial_loss > 0.0);

    // 50 epochs x 4 mini-batches = 200 iterations.
    let solver_cfg = SolverConfig::from_str(&solver_text(50)).unwrap();
    let mut solver = Solver::new(solver_cfg);
    solver.train(&mut net, &mut corpus).unwrap();

    let final_loss = first_batch_loss(&mut net, &corpus);
    assert!(
        final_loss < initial_loss / 2.0,
        "loss did not halve: {initial_loss} -> {final_loss}"
    );

    // The trained net separates the batch.
    let correct = find_accuracy(corpus.batch_labels(0), net.output_data(), 16, 1);
    assert!(correct >= 15, "only {correct}/16 correct");
}

#[test]
fn model_file_round_trips_bit_for_bit() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("corpus.bin");
    let model_path = dir.path().join("model.bin");
    write_corpus(&data_path, 32);

    let net_cfg = NetConfig::from_str(NET_TEXT).unwrap();
    let data_param = net_cfg.layers[0].data.clone().unwrap();
    let mut corpus = Corpus::open(&data_param, &data_path).unwrap();

    let driver = Arc::new(CpuDriver::new());
    let mut net = Network::build(
        &net_cfg,
        corpus.input_shape(),
        Phase::Train,
        &PartitionPlan::default(),
        driver.clone(),
    )
    .unwrap();

    let solver_cfg = SolverConfig::from_str(&solver_text(3)).unwrap();
    let mut solver = Solver::new(solver_cfg);
    solver.train(&mut net, &mut corpus).unwrap();
    write_model(&net, &model_path).unwrap();

    let mut fresh = Network::build(
        &net_cfg,
        corpus.input_shape(),
        Phase::Train,
        &PartitionPlan::default(),
        driver,
    )
    .unwrap();
    read_model(&mut fresh, &model_path).unwrap();

    for (a, b) in net.bridges.iter().zip(&fresh.bridges) {
        match (a.model_cube(), b.model_cube()) {
            (Some(ma), Some(mb)) => {
                for (x, y) in ma.data().iter().zip(mb.data()) {
                    assert_eq!(x.to_bits(), y.to_bits());
                }
            }
            (None, None) => {}
            _ => panic!("bridge parameter mismatch"),
        }
        match (a.bias_cube(), b.bias_cube()) {
            (Some(ba), Some(bb)) => {
                for (x, y) in ba.data().iter().zip(bb.data()) {
                    assert_eq!(x.to_bits(), y.to_bits());
                }
            }
            (None, None) => {}
            _ => panic!("bridge bias mismatch"),
        }
    }
}

// End-to-end inference path: train, persist, rebuild in the test phase,
// and score the held-out stream.
#[test]
fn test_phase_scores_a_trained_model() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("corpus.bin");
    let model_path = dir.path().join("model.bin");
    write_corpus(&data_path, 48);

    let net_cfg = NetConfig::from_str(NET_TEXT).unwrap();
    let data_param = net_cfg.layers[0].data.clone().unwrap();
    let mut corpus = Corpus::open(&data_param, &data_path).unwrap();
    let driver = Arc::new(CpuDriver::new());

    let mut net = Network::build(
        &net_cfg,
        corpus.input_shape(),
        Phase::Train,
        &PartitionPlan::default(),
        driver.clone(),
    )
    .unwrap();
    let mut solver = Solver::new(SolverConfig::from_str(&solver_text(60)).unwrap());
    solver.train(&mut net, &mut corpus).unwrap();
    write_model(&net, &model_path).unwrap();

    let test_param = net_cfg.layers[1].data.clone().unwrap();
    let mut test_corpus = Corpus::open(&test_param, &data_path).unwrap();
    let mut test_net = Network::build(
        &net_cfg,
        test_corpus.input_shape(),
        Phase::Test,
        &PartitionPlan::default(),
        driver,
    )
    .unwrap();
    read_model(&mut test_net, &model_path).unwrap();

    let mut scorer = Solver::new(SolverConfig::from_str(&solver_text(1)).unwrap());
    let accuracy = scorer.test(&mut test_net, &mut test_corpus).unwrap();
    assert!(accuracy >= 0.9, "accuracy {accuracy}");
}

#[test]
fn corpus_rejects_truncated_streams() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("corpus.bin");
    write_corpus(&data_path, 8);
    // Chop the file mid-record.
    let bytes = std::fs::read(&data_path).unwrap();
    std::fs::write(&data_path, &bytes[..bytes.len() - 6]).unwrap();

    let net_cfg = NetConfig::from_str(NET_TEXT).unwrap();
    let data_param = net_cfg.layers[0].data.clone().unwrap();
    let err = Corpus::open(&data_param, &data_path).unwrap_err();
    assert!(err.to_string().contains("image records"));
}
