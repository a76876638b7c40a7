#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Context;
use burn::backend::Autodiff;
use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::config::Config;
use burn::data::dataset::vision::MnistDataset;
use burn::tensor::backend::AutodiffBackend;
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use infovae::LossStrategy;
use infovae::conv_model::ConvVaeConfig;
use infovae::dense_model::DenseVaeConfig;
use infovae::mnist_data::build_loader;
use infovae::training::{TrainedModels, TrainingConfig, train};

/// File name of the saved model configuration inside the checkpoint directory.
const MODEL_CONFIG_FILE: &str = "model.config.json";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    /// Standard VAE: Gaussian posterior, ELBO loss.
    Elbo,
    /// Info-VAE: deterministic embedding, MMD loss.
    Mmd,
}

impl From<StrategyArg> for LossStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Elbo => LossStrategy::Elbo,
            StrategyArg::Mmd => LossStrategy::Mmd,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Architecture {
    Conv,
    Dense,
}

/// Train an autoencoder on MNIST with ELBO or MMD latent regularization.
#[derive(Parser, Debug)]
#[command(author, version, about = "VAE / Info-VAE trainer")]
struct Args {
    #[arg(long, value_enum, default_value_t = StrategyArg::Mmd)]
    strategy: StrategyArg,

    #[arg(long, value_enum, default_value_t = Architecture::Conv)]
    architecture: Architecture,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 2)]
    latent_dim: usize,

    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f64,

    /// Directory for weights, optimizer state, configs and the loss log.
    #[arg(long, default_value = "checkpoints/vae")]
    checkpoint_dir: PathBuf,

    /// Continue from the last epoch saved in `--checkpoint-dir`.
    #[arg(long)]
    resume: bool,

    /// Epochs between latent diagnostics (0 disables).
    #[arg(long, default_value_t = 5)]
    diagnostics_interval: usize,

    /// Skip the per-epoch pass over the MNIST test split.
    #[arg(long)]
    no_validation: bool,

    /// Train on the CPU (NdArray) instead of the default GPU (WGPU) backend.
    #[arg(long)]
    cpu: bool,
}

fn run<B: AutodiffBackend>(args: &Args, device: B::Device) -> anyhow::Result<()> {
    let strategy = LossStrategy::from(args.strategy);
    let config = TrainingConfig::new()
        .with_strategy(strategy)
        .with_num_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_learning_rate(args.learning_rate)
        .with_diagnostics_interval(args.diagnostics_interval)
        .with_checkpoint_dir(args.checkpoint_dir.display().to_string());

    tracing::info!(?device, ?config, "Configuration");
    B::seed(config.seed);
    std::fs::create_dir_all(&args.checkpoint_dir).with_context(|| {
        format!("Failed to create checkpoint dir {}", args.checkpoint_dir.display())
    })?;

    let train_loader = build_loader::<B, _>(
        MnistDataset::train(),
        config.batch_size,
        Some(config.seed),
        config.num_workers,
        &device,
    );
    let valid_loader = (!args.no_validation).then(|| {
        build_loader::<B::InnerBackend, _>(
            MnistDataset::test(),
            config.batch_size,
            None,
            config.num_workers,
            &device,
        )
    });

    let model_config_path = args.checkpoint_dir.join(MODEL_CONFIG_FILE);
    match args.architecture {
        Architecture::Conv => {
            let model_config =
                ConvVaeConfig::for_strategy(strategy).with_latent_dim(args.latent_dim);
            model_config.save(&model_config_path)?;
            let encoder = model_config.init_encoder::<B>(&device)?;
            let decoder = model_config.init_decoder::<B>(&device)?;
            let TrainedModels { history, .. } = train(
                &config,
                encoder,
                decoder,
                train_loader,
                valid_loader,
                &device,
                args.resume,
            )?;
            report(&history);
        }
        Architecture::Dense => {
            let model_config =
                DenseVaeConfig::for_strategy(strategy).with_latent_dim(args.latent_dim);
            model_config.save(&model_config_path)?;
            let encoder = model_config.init_encoder::<B>(&device);
            let decoder = model_config.init_decoder::<B>(&device);
            let TrainedModels { history, .. } = train(
                &config,
                encoder,
                decoder,
                train_loader,
                valid_loader,
                &device,
                args.resume,
            )?;
            report(&history);
        }
    }

    tracing::info!(dir = %args.checkpoint_dir.display(), "Model saved");
    Ok(())
}

fn report(history: &[infovae::training::EpochSummary]) {
    match history.last() {
        Some(last) => tracing::info!("Training complete: {last}"),
        None => tracing::info!("Nothing to train: checkpoint already covers every epoch"),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.cpu {
        run::<Autodiff<NdArray>>(&args, NdArrayDevice::Cpu)
    } else {
        // Metal on Mac, Vulkan/DX12 on Windows/Linux
        run::<Autodiff<Wgpu>>(&args, WgpuDevice::DefaultDevice)
    }
}
