use std::fmt;

use burn::tensor::{Distribution, Tensor, backend::Backend};
use serde::{Deserialize, Serialize};

/// Which latent parameters an encoder produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderHead {
    /// Mean and log-variance of a diagonal Gaussian posterior.
    Gaussian,
    /// A single embedding per sample.
    Deterministic,
}

impl fmt::Display for EncoderHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderHead::Gaussian => write!(f, "gaussian"),
            EncoderHead::Deterministic => write!(f, "deterministic"),
        }
    }
}

/// Final nonlinearity applied by a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputActivation {
    /// Raw logits, to be paired with a cross-entropy computed on logits.
    Logits,
    /// Values squashed into `(0, 1)`.
    Sigmoid,
}

impl fmt::Display for OutputActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputActivation::Logits => write!(f, "logits"),
            OutputActivation::Sigmoid => write!(f, "sigmoid"),
        }
    }
}

impl OutputActivation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            OutputActivation::Logits => x,
            OutputActivation::Sigmoid => burn::tensor::activation::sigmoid(x),
        }
    }
}

/// Encoder output for one batch, shape `[batch, latent_dim]` per tensor.
#[derive(Debug, Clone)]
pub enum LatentCode<B: Backend> {
    Deterministic(Tensor<B, 2>),
    Gaussian {
        mean: Tensor<B, 2>,
        logvar: Tensor<B, 2>,
    },
}

impl<B: Backend> LatentCode<B> {
    /// Latent vector fed to the decoder.
    ///
    /// Gaussian codes are sampled with [`reparameterize`], so every call
    /// draws fresh noise.
    pub fn sample(&self) -> Tensor<B, 2> {
        match self {
            LatentCode::Deterministic(z) => z.clone(),
            LatentCode::Gaussian { mean, logvar } => reparameterize(mean.clone(), logvar.clone()),
        }
    }

    /// Embedding or posterior mean; the noise-free location of each sample.
    pub fn location(&self) -> Tensor<B, 2> {
        match self {
            LatentCode::Deterministic(z) => z.clone(),
            LatentCode::Gaussian { mean, .. } => mean.clone(),
        }
    }

    pub fn head(&self) -> EncoderHead {
        match self {
            LatentCode::Deterministic(_) => EncoderHead::Deterministic,
            LatentCode::Gaussian { .. } => EncoderHead::Gaussian,
        }
    }

    pub fn dims(&self) -> [usize; 2] {
        match self {
            LatentCode::Deterministic(z) => z.dims(),
            LatentCode::Gaussian { mean, .. } => mean.dims(),
        }
    }
}

/// Maps an image batch `[batch, channels, height, width]` into latent space.
pub trait LatentEncoder<B: Backend> {
    fn encode(&self, x: Tensor<B, 4>) -> LatentCode<B>;

    fn head(&self) -> EncoderHead;

    fn latent_dim(&self) -> usize;

    /// Expected `[channels, height, width]` of every input sample.
    fn input_shape(&self) -> [usize; 3];
}

/// Maps latent vectors `[batch, latent_dim]` back to image batches.
pub trait LatentDecoder<B: Backend> {
    fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 4>;

    fn output_activation(&self) -> OutputActivation;

    fn latent_dim(&self) -> usize;
}

/// Apply the reparameterization trick.
///
/// ```text
/// std = exp(0.5 * logvar)
/// eps ~ N(0, 1)
/// z = mean + eps * std
/// ```
///
/// The sample stays differentiable with respect to `mean` and `logvar`.
pub fn reparameterize<B: Backend>(mean: Tensor<B, 2>, logvar: Tensor<B, 2>) -> Tensor<B, 2> {
    let eps = Tensor::random_like(&mean, Distribution::Normal(0.0, 1.0));
    reparameterize_with_noise(mean, logvar, eps)
}

/// [`reparameterize`] with caller-supplied standard-normal noise.
pub fn reparameterize_with_noise<B: Backend>(
    mean: Tensor<B, 2>,
    logvar: Tensor<B, 2>,
    eps: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let std = logvar.mul_scalar(0.5).exp();
    mean + eps * std
}
