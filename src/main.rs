use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mini_nmt::data::copy_task_batch;
use mini_nmt::{Activation, Estimator, ModelArgs, Params};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::Device;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Trains the Transformer on a synthetic copy task and greedy-decodes a batch.
#[derive(Parser, Debug)]
#[command(name = "mini-nmt", about = "Encoder-decoder Transformer on a copy task")]
struct Cli {
    /// JSON file with model arguments (missing fields use defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of optimizer steps
    #[arg(long, default_value_t = 500)]
    steps: i64,

    #[arg(long, default_value_t = 32)]
    batch_size: i64,

    /// Longest sequence in a batch
    #[arg(long, default_value_t = 10)]
    seq_len: i64,

    /// Size of both vocabularies (ids 0 and 1 are reserved)
    #[arg(long, default_value_t = 20)]
    vocab_size: i64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Run on the first CUDA device when available
    #[arg(long)]
    cuda: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let args = match &cli.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading model args from {}", path.display()))?;
            ModelArgs::from_json(&json)?
        }
        None => ModelArgs::default(),
    };
    let params = Params {
        source_vocab_size: cli.vocab_size,
        target_vocab_size: cli.vocab_size,
        start_symbol: 1,
        activation: Activation::Elu,
    };
    let device = if cli.cuda { Device::cuda_if_available() } else { Device::Cpu };

    tch::manual_seed(cli.seed as i64);
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut estimator = Estimator::new(device, &args, &params)?;

    info!(steps = cli.steps, ?device, "starting copy-task training");
    for _ in 0..cli.steps {
        let batch = copy_task_batch(&mut rng, cli.batch_size, cli.seq_len, cli.vocab_size, device)?;
        estimator.train_step(&batch)?;
    }

    let batch = copy_task_batch(&mut rng, 4, cli.seq_len, cli.vocab_size, device)?;
    info!(loss = estimator.evaluate_loss(&batch)?, "held-out batch");

    let decoded = estimator.greedy_decode(&batch.source, cli.seq_len)?;
    let sources = Vec::<i64>::try_from(&batch.source.view([-1]).to_device(Device::Cpu))?;
    let outputs = Vec::<i64>::try_from(&decoded.view([-1]).to_device(Device::Cpu))?;
    let width = cli.seq_len as usize;
    for (source, output) in sources.chunks(width).zip(outputs.chunks(width)) {
        println!("{source:?} -> {output:?}");
    }
    Ok(())
}
