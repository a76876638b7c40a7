use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{Linear, LinearConfig, Relu},
    tensor::{Tensor, backend::Backend},
};

use crate::latent::{EncoderHead, LatentCode, LatentDecoder, LatentEncoder, OutputActivation};
use crate::loss::LossStrategy;

// --- CONFIG ---

/// Configuration for a fully connected autoencoder pair.
///
/// Images are flattened to `channels * image_height * image_width` inputs,
/// passed through the `hidden_dims` stack, and projected to the latent.
/// The decoder mirrors the stack in reverse.
#[derive(Config, Debug)]
pub struct DenseVaeConfig {
    #[config(default = 1)]
    pub channels: usize,
    #[config(default = 28)]
    pub image_height: usize,
    #[config(default = 28)]
    pub image_width: usize,

    /// List of hidden layer sizes.
    /// e.g., vec![512, 256] creates: Input -> 512 -> 256 -> Latent
    #[config(default = "vec![512, 256]")]
    pub hidden_dims: Vec<usize>,

    #[config(default = 2)]
    pub latent_dim: usize,

    #[config(default = "EncoderHead::Gaussian")]
    pub head: EncoderHead,
    #[config(default = "OutputActivation::Logits")]
    pub output: OutputActivation,
}

impl DenseVaeConfig {
    /// Default configuration with the head and output activation the given
    /// loss strategy expects.
    pub fn for_strategy(strategy: LossStrategy) -> Self {
        Self::new()
            .with_head(strategy.encoder_head())
            .with_output(strategy.output_activation())
    }

    fn input_dim(&self) -> usize {
        self.channels * self.image_height * self.image_width
    }

    /// Build the encoder half on `device`.
    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> DenseEncoder<B> {
        DenseEncoder::new(self, device)
    }

    /// Build the decoder half on `device`.
    pub fn init_decoder<B: Backend>(&self, device: &B::Device) -> DenseDecoder<B> {
        DenseDecoder::new(self, device)
    }
}

// --- ENCODER ---

/// Fully connected encoder.
///
/// Structure:
/// - Flatten `[Batch, C, H, W]` to `[Batch, C*H*W]`
/// - Hidden `Linear` + ReLU layers, one per entry of `hidden_dims`
/// - Project to the latent mean (and log-variance for a Gaussian head)
#[derive(Module, Debug)]
pub struct DenseEncoder<B: Backend> {
    // Vector of Linear layers for the dynamic hidden stack
    pub layers: Vec<Linear<B>>,
    pub fc_mean: Linear<B>,
    pub fc_logvar: Option<Linear<B>>,
    activation: Relu,
    latent_dim: usize,
    input_shape: Ignored<[usize; 3]>,
}

impl<B: Backend> DenseEncoder<B> {
    /// Construct a new dense encoder.
    ///
    /// # Arguments
    /// * `config` – layer sizes, image shape and encoder head
    /// * `device` – Backend device where parameters are allocated
    pub fn new(config: &DenseVaeConfig, device: &B::Device) -> Self {
        let mut layers = Vec::new();
        let mut current_dim = config.input_dim();

        for &dim in &config.hidden_dims {
            layers.push(LinearConfig::new(current_dim, dim).init(device));
            current_dim = dim;
        }

        let fc_mean = LinearConfig::new(current_dim, config.latent_dim).init(device);
        let fc_logvar = match config.head {
            EncoderHead::Gaussian => {
                Some(LinearConfig::new(current_dim, config.latent_dim).init(device))
            }
            EncoderHead::Deterministic => None,
        };

        Self {
            layers,
            fc_mean,
            fc_logvar,
            activation: Relu::new(),
            latent_dim: config.latent_dim,
            input_shape: Ignored([config.channels, config.image_height, config.image_width]),
        }
    }

    /// Forward pass for the encoder.
    ///
    /// # Arguments
    /// * `x` – Input batch of shape `[Batch, C, H, W]`
    ///
    /// # Returns
    /// Latent code with tensors of shape `[Batch, latent_dim]`
    pub fn forward(&self, x: Tensor<B, 4>) -> LatentCode<B> {
        let mut x: Tensor<B, 2> = x.flatten(1, 3);

        for layer in &self.layers {
            x = layer.forward(x);
            x = self.activation.forward(x);
        }

        let mean = self.fc_mean.forward(x.clone());
        match &self.fc_logvar {
            Some(fc_logvar) => LatentCode::Gaussian {
                mean,
                logvar: fc_logvar.forward(x),
            },
            None => LatentCode::Deterministic(mean),
        }
    }
}

impl<B: Backend> LatentEncoder<B> for DenseEncoder<B> {
    fn encode(&self, x: Tensor<B, 4>) -> LatentCode<B> {
        self.forward(x)
    }

    fn head(&self) -> EncoderHead {
        if self.fc_logvar.is_some() {
            EncoderHead::Gaussian
        } else {
            EncoderHead::Deterministic
        }
    }

    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn input_shape(&self) -> [usize; 3] {
        self.input_shape.0
    }
}

// --- DECODER ---

/// Fully connected decoder mirroring [`DenseEncoder`].
#[derive(Module, Debug)]
pub struct DenseDecoder<B: Backend> {
    pub layers: Vec<Linear<B>>,
    pub output_layer: Linear<B>,
    activation: Relu,
    output: Ignored<OutputActivation>,
    latent_dim: usize,
    output_shape: Ignored<[usize; 3]>,
}

impl<B: Backend> DenseDecoder<B> {
    /// Construct a new dense decoder.
    ///
    /// # Arguments
    /// * `config` – layer sizes, image shape and output activation
    /// * `device` – Backend device
    pub fn new(config: &DenseVaeConfig, device: &B::Device) -> Self {
        let mut layers = Vec::new();
        let mut current_dim = config.latent_dim;

        // Reverse order for a symmetric decoder:
        // Encoder 784 -> 512 -> 256 -> Latent, Decoder Latent -> 256 -> 512 -> 784
        for &dim in config.hidden_dims.iter().rev() {
            layers.push(LinearConfig::new(current_dim, dim).init(device));
            current_dim = dim;
        }

        let output_layer = LinearConfig::new(current_dim, config.input_dim()).init(device);

        Self {
            layers,
            output_layer,
            activation: Relu::new(),
            output: Ignored(config.output),
            latent_dim: config.latent_dim,
            output_shape: Ignored([config.channels, config.image_height, config.image_width]),
        }
    }

    /// Forward pass for the decoder.
    ///
    /// # Arguments
    /// * `z` – Latent sample, shape `[Batch, latent_dim]`
    ///
    /// # Returns
    /// Reconstructed images with shape `[Batch, C, H, W]`, passed through the
    /// configured output activation
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch_size, _] = z.dims();
        let [c, h, w] = self.output_shape.0;
        let mut x = z;

        for layer in &self.layers {
            x = layer.forward(x);
            x = self.activation.forward(x);
        }

        let x = self.output.apply(self.output_layer.forward(x));
        x.reshape([batch_size, c, h, w])
    }
}

impl<B: Backend> LatentDecoder<B> for DenseDecoder<B> {
    fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        self.forward(z)
    }

    fn output_activation(&self) -> OutputActivation {
        self.output.0
    }

    fn latent_dim(&self) -> usize {
        self.latent_dim
    }
}
