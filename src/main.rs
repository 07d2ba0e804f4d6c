use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use cubenet::config::{LayerType, NetConfig, SolverConfig};
use cubenet::corpus::Corpus;
use cubenet::driver::CpuDriver;
use cubenet::net::{Network, PartitionPlan};
use cubenet::solver::{read_model, write_model, Solver};
use cubenet::Phase;

const DEFAULT_MODEL_FILE: &str = "cubenet_model.bin";

#[derive(Parser)]
#[command(name = "cubenet", version, about = "Convolutional network training engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a network and write the resulting model file.
    Train {
        /// Solver configuration (points at the network configuration).
        solver: PathBuf,
        /// Image + label binary stream.
        data: Option<PathBuf>,
        /// Optional model file to warm-start from.
        model_in: Option<PathBuf>,
        /// Where to write the trained model.
        model_out: Option<PathBuf>,
    },
    /// Evaluate a trained model; prints top-1 accuracy.
    Test {
        solver: PathBuf,
        data: PathBuf,
        model: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("cubenet: {e:#}");
        std::process::exit(1);
    }
}

fn load_configs(solver_path: &PathBuf) -> anyhow::Result<(SolverConfig, NetConfig)> {
    let solver_cfg = SolverConfig::from_file(solver_path)
        .with_context(|| format!("loading solver config {}", solver_path.display()))?;
    debug!(config = %serde_json::to_string(&solver_cfg)?, "parsed solver config");
    // The net path is resolved relative to the solver file when relative.
    let net_path = {
        let raw = PathBuf::from(&solver_cfg.net);
        if raw.is_relative() {
            solver_path
                .parent()
                .map(|dir| dir.join(&raw))
                .unwrap_or(raw)
        } else {
            raw
        }
    };
    let net_cfg = NetConfig::from_file(&net_path)
        .with_context(|| format!("loading network config {}", net_path.display()))?;
    debug!(config = %serde_json::to_string(&net_cfg)?, "parsed network config");
    Ok((solver_cfg, net_cfg))
}

fn open_corpus(net_cfg: &NetConfig, phase: Phase, data: &PathBuf) -> anyhow::Result<Corpus> {
    let data_layer = net_cfg
        .layers
        .iter()
        .find(|l| {
            l.layer_type == LayerType::Data && l.include_phase.map_or(true, |p| p == phase)
        })
        .and_then(|l| l.data.as_ref());
    let Some(param) = data_layer else {
        bail!("network config has no DATA layer for phase {phase}");
    };
    let corpus = Corpus::open(param, data)?;
    info!(
        images = corpus.n_images,
        rows = corpus.n_rows,
        cols = corpus.n_cols,
        channels = corpus.dim,
        mini_batch = corpus.mini_batch_size,
        batches = corpus.num_mini_batches,
        last_batch = corpus.last_batch_size,
        "corpus loaded"
    );
    Ok(corpus)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Train {
            solver,
            data,
            model_in,
            model_out,
        } => {
            let (solver_cfg, net_cfg) = load_configs(&solver)?;
            let Some(data) = data else {
                bail!("no data binary provided");
            };
            let mut corpus = open_corpus(&net_cfg, Phase::Train, &data)?;
            let driver = Arc::new(CpuDriver::new());
            let mut net = Network::build(
                &net_cfg,
                corpus.input_shape(),
                Phase::Train,
                &PartitionPlan::default(),
                driver,
            )?;
            if let Some(path) = model_in {
                read_model(&mut net, &path)
                    .with_context(|| format!("loading model {}", path.display()))?;
            }
            let mut solver = Solver::new(solver_cfg);
            solver.train(&mut net, &mut corpus)?;
            let out = model_out.unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_FILE));
            write_model(&net, &out)
                .with_context(|| format!("writing model {}", out.display()))?;
            info!(model = %out.display(), "model written");
        }
        Command::Test {
            solver,
            data,
            model,
        } => {
            let (solver_cfg, net_cfg) = load_configs(&solver)?;
            let mut corpus = open_corpus(&net_cfg, Phase::Test, &data)?;
            let driver = Arc::new(CpuDriver::new());
            let mut net = Network::build(
                &net_cfg,
                corpus.input_shape(),
                Phase::Test,
                &PartitionPlan::default(),
                driver,
            )?;
            read_model(&mut net, &model)
                .with_context(|| format!("loading model {}", model.display()))?;
            let mut solver = Solver::new(solver_cfg);
            let accuracy = solver.test(&mut net, &mut corpus)?;
            println!("accuracy: {accuracy:.4}");
        }
    }
    Ok(())
}
