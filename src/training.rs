//! Autoencoder training loop with a pluggable latent regularization loss.
//!
//! Each batch is processed fully (forward, loss, backward, update) before the
//! next one. Gradients are computed once from the total loss and then split
//! into the encoder's and the decoder's parameter sets, each stepped by its
//! own Adam optimizer.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::data::dataloader::DataLoader;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, CheckpointMeta, DECODER_OPTIM_FILE, ENCODER_OPTIM_FILE};
use crate::error::VaeError;
use crate::latent::{LatentDecoder, LatentEncoder};
use crate::loss::{LossBreakdown, LossStrategy, compute_loss};
use crate::mnist_data::ImageBatch;

/// Loader of validation batches on the inner backend of `B`.
pub type ValidLoader<B> = Arc<
    dyn DataLoader<
            <B as AutodiffBackend>::InnerBackend,
            ImageBatch<<B as AutodiffBackend>::InnerBackend>,
        >,
>;

/// File name of the saved [`TrainingConfig`] inside the checkpoint directory.
pub const TRAINING_CONFIG_FILE: &str = "training.config.json";

/// Configuration for autoencoder training.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Latent regularization: ELBO (standard VAE) or MMD (Info-VAE).
    #[config(default = "LossStrategy::Mmd")]
    pub strategy: LossStrategy,
    /// Adam learning rate, shared by encoder and decoder.
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// L2 penalty for Adam; 0 disables weight decay.
    #[config(default = 1e-5)]
    pub weight_decay: f32,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 100)]
    pub batch_size: usize,
    /// Data loader worker threads; 0 loads on the training thread.
    #[config(default = 4)]
    pub num_workers: usize,
    /// Seed for the backend RNG and data shuffling.
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = "String::from(\"checkpoints/vae\")")]
    pub checkpoint_dir: String,
    /// Per-epoch loss summary file, relative to `checkpoint_dir`.
    #[config(default = "String::from(\"losses.log\")")]
    pub loss_log: String,
    /// Epochs between latent-space diagnostics; 0 disables them.
    #[config(default = 5)]
    pub diagnostics_interval: usize,
    /// Batches between debug-level progress events; 0 disables them.
    #[config(default = 100)]
    pub log_interval: usize,
}

impl TrainingConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(&self.checkpoint_dir)
    }

    pub fn loss_log_path(&self) -> PathBuf {
        self.checkpoint_path().join(&self.loss_log)
    }
}

/// Host-side scalar values of a [`LossBreakdown`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub total: f64,
    pub reconstruction: f64,
    pub regularization: f64,
}

impl<B: Backend> From<&LossBreakdown<B>> for LossValues {
    fn from(loss: &LossBreakdown<B>) -> Self {
        Self {
            total: loss.total.clone().into_scalar().elem(),
            reconstruction: loss.reconstruction.clone().into_scalar().elem(),
            regularization: loss.regularization.clone().into_scalar().elem(),
        }
    }
}

/// Running sum of loss components over an epoch.
#[derive(Debug, Default, Clone)]
pub struct RunningTotals {
    total: f64,
    reconstruction: f64,
    regularization: f64,
    batches: usize,
}

impl RunningTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, values: LossValues) {
        self.total += values.total;
        self.reconstruction += values.reconstruction;
        self.regularization += values.regularization;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Per-batch averages, or `None` before the first update.
    pub fn average(&self) -> Option<LossValues> {
        if self.batches == 0 {
            return None;
        }
        let n = self.batches as f64;
        Some(LossValues {
            total: self.total / n,
            reconstruction: self.reconstruction / n,
            regularization: self.regularization / n,
        })
    }
}

/// One line of the loss log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub strategy: LossStrategy,
    pub batches: usize,
    pub total: f64,
    pub reconstruction: f64,
    pub regularization: f64,
    pub validation: Option<f64>,
    pub elapsed_secs: f64,
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch={} strategy={} batches={} loss={:.6} reconstruction={:.6} regularization={:.6}",
            self.epoch,
            self.strategy,
            self.batches,
            self.total,
            self.reconstruction,
            self.regularization,
        )?;
        if let Some(v) = self.validation {
            write!(f, " validation={v:.6}")?;
        }
        write!(f, " elapsed={:.1}s", self.elapsed_secs)
    }
}

/// Per-dimension location and spread of latent codes for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

/// Summarize `codes` (`[batch, latent_dim]`) per latent dimension.
pub fn latent_statistics<B: Backend>(codes: Tensor<B, 2>) -> anyhow::Result<LatentStats> {
    let mean = codes.clone().mean_dim(0);
    let std = codes.var_bias(0).sqrt();
    let to_vec = |t: Tensor<B, 2>| -> anyhow::Result<Vec<f32>> {
        t.into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("Failed to read latent statistics: {e:?}"))
    };
    Ok(LatentStats {
        mean: to_vec(mean)?,
        std: to_vec(std)?,
    })
}

/// Trained parameter sets plus the per-epoch summaries of this run.
#[derive(Debug)]
pub struct TrainedModels<E, D> {
    pub encoder: E,
    pub decoder: D,
    pub history: Vec<EpochSummary>,
}

/// Check that `encoder` and `decoder` fit together and fit `strategy`.
pub fn check_models<B, E, D>(
    strategy: LossStrategy,
    encoder: &E,
    decoder: &D,
) -> Result<(), VaeError>
where
    B: Backend,
    E: LatentEncoder<B>,
    D: LatentDecoder<B>,
{
    strategy.check_compatible(encoder.head(), decoder.output_activation())?;
    if encoder.latent_dim() != decoder.latent_dim() {
        return Err(VaeError::LatentDimMismatch {
            encoder: encoder.latent_dim(),
            decoder: decoder.latent_dim(),
        });
    }
    Ok(())
}

fn check_batch_shape<B: Backend>(
    expected: [usize; 3],
    images: &Tensor<B, 4>,
) -> Result<(), VaeError> {
    let actual = images.dims();
    if actual[1..] != expected {
        return Err(VaeError::ShapeMismatch { expected, actual });
    }
    Ok(())
}

/// Average loss of `encoder`/`decoder` over every batch of `loader`, without
/// updating parameters. Returns `None` for an empty loader.
pub fn evaluate<B, E, D>(
    strategy: LossStrategy,
    encoder: &E,
    decoder: &D,
    loader: &Arc<dyn DataLoader<B, ImageBatch<B>>>,
) -> Result<Option<LossValues>, VaeError>
where
    B: Backend,
    E: LatentEncoder<B>,
    D: LatentDecoder<B>,
{
    let mut totals = RunningTotals::new();
    for batch in loader.iter() {
        check_batch_shape(encoder.input_shape(), &batch.images)?;
        let loss = compute_loss(strategy, encoder, decoder, batch.images)?;
        totals.update(LossValues::from(&loss));
    }
    Ok(totals.average())
}

fn append_loss_log(path: &Path, summary: &EpochSummary) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{summary}")
}

fn log_latent_diagnostics<B, E>(
    epoch: usize,
    encoder: &E,
    images: Tensor<B, 4>,
) -> anyhow::Result<()>
where
    B: Backend,
    E: LatentEncoder<B>,
{
    let code = encoder.encode(images);
    let stats = latent_statistics(code.location())?;
    tracing::info!(
        epoch,
        mean = ?stats.mean,
        std = ?stats.std,
        "Latent diagnostics"
    );
    Ok(())
}

/// Run the training loop.
///
/// Trains `encoder` and `decoder` with `config.strategy` on `train_loader`,
/// optionally scoring `valid_loader` after every epoch. Validation runs on
/// the inner (non-autodiff) backend. After every epoch a summary line is
/// appended to the loss log and a checkpoint (weights, optimizer state,
/// metadata) is written to `config.checkpoint_dir`.
///
/// With `resume`, training continues after the last epoch recorded in the
/// checkpoint directory and keeps appending to its loss log. A run that
/// starts from epoch 1 truncates the loss log first.
///
/// A non-finite loss stops training with [`VaeError::NonFiniteLoss`].
pub fn train<B, E, D>(
    config: &TrainingConfig,
    mut encoder: E,
    mut decoder: D,
    train_loader: Arc<dyn DataLoader<B, ImageBatch<B>>>,
    valid_loader: Option<ValidLoader<B>>,
    device: &B::Device,
    resume: bool,
) -> anyhow::Result<TrainedModels<E, D>>
where
    B: AutodiffBackend,
    E: AutodiffModule<B> + LatentEncoder<B>,
    E::InnerModule: LatentEncoder<B::InnerBackend>,
    D: AutodiffModule<B> + LatentDecoder<B>,
    D::InnerModule: LatentDecoder<B::InnerBackend>,
{
    let strategy = config.strategy;
    check_models(strategy, &encoder, &decoder)?;

    let checkpoint_dir = config.checkpoint_path();
    std::fs::create_dir_all(&checkpoint_dir)?;
    config.save(checkpoint_dir.join(TRAINING_CONFIG_FILE))?;

    let weight_decay =
        (config.weight_decay > 0.0).then(|| WeightDecayConfig::new(config.weight_decay));
    let optim_config = AdamConfig::new().with_weight_decay(weight_decay);
    let mut encoder_optim = optim_config.init::<B, E>();
    let mut decoder_optim = optim_config.init::<B, D>();

    let mut start_epoch = 1;
    if resume {
        match checkpoint::load_meta(&checkpoint_dir)? {
            Some(meta) => {
                if meta.strategy != strategy {
                    anyhow::bail!(
                        "Checkpoint in {} was trained with {} loss, not {}",
                        checkpoint_dir.display(),
                        meta.strategy,
                        strategy
                    );
                }
                (encoder, decoder) =
                    checkpoint::load_models(&checkpoint_dir, encoder, decoder, device)?;
                encoder_optim = checkpoint::load_optimizer(
                    &checkpoint_dir,
                    ENCODER_OPTIM_FILE,
                    encoder_optim,
                    device,
                )?;
                decoder_optim = checkpoint::load_optimizer(
                    &checkpoint_dir,
                    DECODER_OPTIM_FILE,
                    decoder_optim,
                    device,
                )?;
                start_epoch = meta.epoch + 1;
                tracing::info!(
                    epoch = meta.epoch,
                    train_loss = meta.train_loss,
                    "Resumed from checkpoint"
                );
            }
            None => tracing::info!(
                dir = %checkpoint_dir.display(),
                "No checkpoint to resume from, starting fresh"
            ),
        }
    }

    tracing::info!(
        strategy = %strategy,
        epochs = config.num_epochs,
        start_epoch,
        batch_size = config.batch_size,
        learning_rate = config.learning_rate,
        encoder_params = encoder.num_params(),
        decoder_params = decoder.num_params(),
        "Starting training"
    );

    let input_shape = encoder.input_shape();
    let log_path = config.loss_log_path();
    if start_epoch == 1 {
        File::create(&log_path)?;
    }
    let mut history = Vec::new();

    for epoch in start_epoch..=config.num_epochs {
        let epoch_start = Instant::now();
        let mut totals = RunningTotals::new();

        for (batch_num, batch) in train_loader.iter().enumerate() {
            check_batch_shape(input_shape, &batch.images)?;

            let loss = compute_loss(strategy, &encoder, &decoder, batch.images)?;

            // Extract scalar values before backward
            let values = LossValues::from(&loss);
            if !values.total.is_finite() {
                return Err(VaeError::NonFiniteLoss {
                    epoch,
                    batch: batch_num,
                    value: values.total,
                }
                .into());
            }

            let mut grads = loss.total.backward();
            let encoder_grads = GradientsParams::from_module(&mut grads, &encoder);
            let decoder_grads = GradientsParams::from_module(&mut grads, &decoder);
            encoder = encoder_optim.step(config.learning_rate, encoder, encoder_grads);
            decoder = decoder_optim.step(config.learning_rate, decoder, decoder_grads);

            totals.update(values);

            if config.log_interval > 0 && batch_num % config.log_interval == 0 {
                tracing::debug!(
                    epoch,
                    batch = batch_num,
                    loss = values.total,
                    reconstruction = values.reconstruction,
                    regularization = values.regularization,
                    "Batch"
                );
            }
        }

        let Some(avg) = totals.average() else {
            anyhow::bail!("Training loader produced no batches in epoch {epoch}");
        };

        let valid_encoder = encoder.valid();
        let valid_decoder = decoder.valid();
        let validation = match &valid_loader {
            Some(loader) => {
                evaluate(strategy, &valid_encoder, &valid_decoder, loader)?.map(|v| v.total)
            }
            None => None,
        };

        let summary = EpochSummary {
            epoch,
            strategy,
            batches: totals.batches(),
            total: avg.total,
            reconstruction: avg.reconstruction,
            regularization: avg.regularization,
            validation,
            elapsed_secs: epoch_start.elapsed().as_secs_f64(),
        };
        append_loss_log(&log_path, &summary)?;
        tracing::info!(
            epoch,
            epochs = config.num_epochs,
            loss = format!("{:.4}", summary.total),
            reconstruction = format!("{:.4}", summary.reconstruction),
            regularization = format!("{:.4}", summary.regularization),
            validation = ?summary.validation,
            "Epoch finished"
        );

        if config.diagnostics_interval > 0 && epoch % config.diagnostics_interval == 0 {
            let images = match &valid_loader {
                Some(loader) => loader.iter().next().map(|batch| batch.images),
                None => train_loader.iter().next().map(|batch| batch.images.inner()),
            };
            if let Some(images) = images {
                log_latent_diagnostics(epoch, &valid_encoder, images)?;
            }
        }

        checkpoint::save_models(&checkpoint_dir, &encoder, &decoder)?;
        checkpoint::save_optimizer(&checkpoint_dir, ENCODER_OPTIM_FILE, &encoder_optim)?;
        checkpoint::save_optimizer(&checkpoint_dir, DECODER_OPTIM_FILE, &decoder_optim)?;
        checkpoint::save_meta(
            &checkpoint_dir,
            &CheckpointMeta {
                epoch,
                strategy,
                train_loss: summary.total,
            },
        )?;
        tracing::debug!(epoch, dir = %checkpoint_dir.display(), "Checkpoint saved");

        history.push(summary);
    }

    Ok(TrainedModels {
        encoder,
        decoder,
        history,
    })
}
