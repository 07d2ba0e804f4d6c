use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::info;

use crate::bridges::UpdateParams;
use crate::config::SolverConfig;
use crate::corpus::Corpus;
use crate::cube::LogicalCube;
use crate::net::Network;
use crate::report::Timer;
use crate::{CnError, CnResult};

const DISPLAY_ITER: usize = 50;

/// Drives the epoch/mini-batch loop: stream a batch in, forward sweep,
/// loss and top-1 accuracy, backward sweep, parameter update under the
/// configured learning-rate policy.
pub struct Solver {
    config: SolverConfig,
    iter: usize,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config, iter: 0 }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Trains for `max_iter` epochs over the corpus.
    pub fn train(&mut self, net: &mut Network, corpus: &mut Corpus) -> CnResult<()> {
        let total = Timer::start();
        for epoch in 0..self.config.max_iter {
            info!(epoch, "starting epoch");
            let mut reader = corpus.reader()?;

            for batch in 0..corpus.num_mini_batches {
                let mut timer = Timer::start();
                let curr_batch = corpus.batch_size_of(batch);

                // Refill the corpus staging cube in place, then hand the
                // batch slab to the first layer.
                reader
                    .fill_batch(&mut corpus.images, curr_batch)
                    .map_err(|e| {
                        CnError::Corpus(format!(
                            "short read in batch {batch} of {}: {e}",
                            corpus.num_mini_batches
                        ))
                    })?;
                let loaded = curr_batch * corpus.images.slab_len();
                net.input_data_mut().data_mut()[..loaded]
                    .copy_from_slice(&corpus.images.data()[..loaded]);
                let t_load = timer.elapsed();

                net.set_curr_batch_size(curr_batch);
                net.set_labels(corpus.batch_labels(batch));
                net.reset_loss();

                timer.restart();
                net.forward()?;
                let t_forward = timer.elapsed();

                let loss = net.loss() / curr_batch as f32;
                let correct =
                    find_accuracy(corpus.batch_labels(batch), net.output_data(), curr_batch, 1);

                timer.restart();
                net.backward()?;
                let t_backward = timer.elapsed();

                let params = UpdateParams {
                    lr: self.config.learning_rate(self.iter),
                    momentum: self.config.momentum,
                    weight_decay: self.config.weight_decay,
                };
                net.apply_update(&params);
                self.iter += 1;

                if batch % DISPLAY_ITER == 0 {
                    info!(
                        epoch,
                        batch,
                        load_seconds = t_load,
                        forward_seconds = t_forward,
                        backward_seconds = t_backward,
                        loss,
                        accuracy = correct as f32 / curr_batch as f32,
                        lr = params.lr,
                        "batch"
                    );
                }
            }
            info!(
                epoch,
                avg_seconds_per_epoch = total.elapsed() / (epoch + 1) as f64,
                "epoch complete"
            );
        }
        info!(total_seconds = total.elapsed(), "training complete");
        for bridge in &net.bridges {
            bridge
                .report_forward()
                .print(&format!("{}/forward", bridge.name()));
            bridge
                .report_backward()
                .print(&format!("{}/backward", bridge.name()));
        }
        Ok(())
    }

    /// One forward-only pass over the corpus; returns overall top-1
    /// accuracy.
    pub fn test(&mut self, net: &mut Network, corpus: &mut Corpus) -> CnResult<f32> {
        let mut reader = corpus.reader()?;
        let mut total_correct = 0usize;
        for batch in 0..corpus.num_mini_batches {
            let curr_batch = corpus.batch_size_of(batch);
            reader.fill_batch(&mut corpus.images, curr_batch)?;
            let loaded = curr_batch * corpus.images.slab_len();
            net.input_data_mut().data_mut()[..loaded]
                .copy_from_slice(&corpus.images.data()[..loaded]);
            net.set_curr_batch_size(curr_batch);
            net.set_labels(corpus.batch_labels(batch));
            net.reset_loss();
            net.forward()?;

            let correct =
                find_accuracy(corpus.batch_labels(batch), net.output_data(), curr_batch, 1);
            total_correct += correct;
            if batch % DISPLAY_ITER == 0 {
                info!(
                    batch,
                    loss = net.loss() / curr_batch as f32,
                    accuracy = correct as f32 / curr_batch as f32,
                    "test batch"
                );
            }
        }
        let accuracy = total_correct as f32 / corpus.n_images as f32;
        info!(accuracy, "overall accuracy");
        Ok(accuracy)
    }
}

/// Counts samples whose true label lands in the top-k predictions.
pub fn find_accuracy(labels: &[f32], output: &LogicalCube, batch: usize, top_k: usize) -> usize {
    let dim = output.d;
    let mut correct = 0;
    for (i, &label) in labels.iter().enumerate().take(batch) {
        let scores = &output.batch_slice(i)[..dim];
        let mut ranked: Vec<(f32, usize)> = scores.iter().copied().zip(0..dim).collect();
        ranked.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
        if ranked[..top_k.min(dim)]
            .iter()
            .any(|&(_, class)| class == label as usize)
        {
            correct += 1;
        }
    }
    correct
}

/// Writes each bridge's model cube then bias cube, in bridge order, as raw
/// little-endian f32. Bridges without parameters contribute nothing.
pub fn write_model(net: &Network, path: impl AsRef<Path>) -> CnResult<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    for bridge in &net.bridges {
        for cube in [bridge.model_cube(), bridge.bias_cube()].into_iter().flatten() {
            for &v in cube.data() {
                out.write_f32::<LittleEndian>(v)?;
            }
        }
    }
    Ok(())
}

/// Loads parameters in the same order `write_model` emitted them.
pub fn read_model(net: &mut Network, path: impl AsRef<Path>) -> CnResult<()> {
    let path = path.as_ref();
    let mut input = BufReader::new(File::open(path).map_err(|e| {
        CnError::Config(format!("cannot open model file {}: {e}", path.display()))
    })?);
    for bridge in net.bridges.iter_mut() {
        if let Some(cube) = bridge.model_cube_mut() {
            input.read_f32_into::<LittleEndian>(cube.data_mut())?;
        }
        if let Some(cube) = bridge.bias_cube_mut() {
            input.read_f32_into::<LittleEndian>(cube.data_mut())?;
        }
    }
    Ok(())
}
