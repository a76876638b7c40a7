use crate::latent::{EncoderHead, OutputActivation};
use crate::loss::LossStrategy;

/// Errors raised while configuring, training or checkpointing an autoencoder.
#[derive(Debug, thiserror::Error)]
pub enum VaeError {
    /// The encoder head or decoder output does not fit the loss strategy.
    #[error(
        "{strategy} loss requires a {expected_head} encoder and {expected_output} decoder output, \
         got {head} encoder and {output} output"
    )]
    IncompatibleModel {
        strategy: LossStrategy,
        head: EncoderHead,
        output: OutputActivation,
        expected_head: EncoderHead,
        expected_output: OutputActivation,
    },

    /// Encoder output and decoder input disagree on the latent size.
    #[error("encoder latent_dim={encoder} does not match decoder latent_dim={decoder}")]
    LatentDimMismatch { encoder: usize, decoder: usize },

    /// The configured image size cannot be processed by the architecture.
    #[error("invalid image shape {height}x{width}: {reason}")]
    InvalidImageShape {
        height: usize,
        width: usize,
        reason: &'static str,
    },

    /// A batch arrived with a shape the models were not built for.
    #[error("batch shape {actual:?} does not match model input shape {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 4],
    },

    /// The loss became NaN or infinite.
    #[error("non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize, value: f64 },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] burn::record::RecorderError),

    #[error("config error: {0}")]
    Config(#[from] burn::config::ConfigError),

    #[error("checkpoint metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
