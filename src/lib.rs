//! Autoencoder training with a pluggable latent regularization loss.
//!
//! An encoder maps images into a low-dimensional latent space and a decoder
//! maps latent vectors back to images. Two interchangeable losses shape the
//! latent space:
//!
//! - **ELBO** (standard VAE): the encoder outputs a Gaussian posterior per
//!   sample, a latent is drawn with the reparameterization trick, and each
//!   posterior is pulled toward the standard normal prior.
//! - **MMD** (Info-VAE): the encoder outputs a deterministic embedding and
//!   the batch of embeddings is matched to prior samples with a kernel
//!   maximum mean discrepancy.
//!
//! See [`loss::LossStrategy`] and [`training::train`].

pub mod checkpoint;
pub mod conv_model;
pub mod dense_model;
pub mod error;
pub mod latent;
pub mod loss;
pub mod mnist_data;
pub mod training;

pub use error::VaeError;
pub use latent::{
    EncoderHead, LatentCode, LatentDecoder, LatentEncoder, OutputActivation, reparameterize,
};
pub use loss::{LossBreakdown, LossStrategy, compute_loss};

/// Width of MNIST images in pixels (28).
pub const MNIST_DIM_X: u32 = 28;

/// Height of MNIST images in pixels (28).
pub const MNIST_DIM_Y: u32 = 28;
