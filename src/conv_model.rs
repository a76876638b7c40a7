use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        Linear, LinearConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    tensor::{Tensor, backend::Backend},
};

use crate::error::VaeError;
use crate::latent::{EncoderHead, LatentCode, LatentDecoder, LatentEncoder, OutputActivation};
use crate::loss::LossStrategy;

// --- CONFIG ---

/// Configuration for a convolutional autoencoder pair.
///
/// The encoder head and decoder output activation select between a
/// standard VAE (Gaussian head, logits) and an Info-VAE (deterministic head,
/// sigmoid); see [`ConvVaeConfig::for_strategy`].
#[derive(Config, Debug)]
pub struct ConvVaeConfig {
    /// Input channels (1 for grayscale).
    #[config(default = 1)]
    pub channels: usize,
    /// Input height in pixels; must be divisible by 4.
    #[config(default = 28)]
    pub image_height: usize,
    /// Input width in pixels; must be divisible by 4.
    #[config(default = 28)]
    pub image_width: usize,
    /// Dimensionality of the latent vector.
    #[config(default = 2)]
    pub latent_dim: usize,
    /// Base convolution channel depth (first conv layer = `base_channels`).
    #[config(default = 32)]
    pub base_channels: usize,
    #[config(default = "EncoderHead::Gaussian")]
    pub head: EncoderHead,
    #[config(default = "OutputActivation::Logits")]
    pub output: OutputActivation,
}

impl ConvVaeConfig {
    /// Default configuration with the head and output activation the given
    /// loss strategy expects.
    pub fn for_strategy(strategy: LossStrategy) -> Self {
        Self::new()
            .with_head(strategy.encoder_head())
            .with_output(strategy.output_activation())
    }

    /// Check the image size survives two stride-2 downsamplings.
    pub fn validate(&self) -> Result<(), VaeError> {
        if self.image_height == 0
            || self.image_width == 0
            || self.image_height % 4 != 0
            || self.image_width % 4 != 0
        {
            return Err(VaeError::InvalidImageShape {
                height: self.image_height,
                width: self.image_width,
                reason: "convolutional autoencoder needs sides divisible by 4",
            });
        }
        Ok(())
    }

    /// Spatial size after the encoder's two downsampling steps.
    fn feature_hw(&self) -> (usize, usize) {
        (self.image_height / 4, self.image_width / 4)
    }

    fn flattened_dim(&self) -> usize {
        let (h, w) = self.feature_hw();
        (self.base_channels * 2) * h * w
    }

    pub fn init_encoder<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<ConvEncoder<B>, VaeError> {
        self.validate()?;
        Ok(ConvEncoder::new(self, device))
    }

    pub fn init_decoder<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<ConvDecoder<B>, VaeError> {
        self.validate()?;
        Ok(ConvDecoder::new(self, device))
    }
}

// --- CONV ENCODER ---

/// Convolutional encoder.
///
/// Structure:
/// - Two conv layers downsampling H×W → H/2×W/2 → H/4×W/4
/// - Flatten to a linear vector
/// - Project to the latent mean (and log-variance for a Gaussian head)
#[derive(Module, Debug)]
pub struct ConvEncoder<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
    pub fc_mean: Linear<B>,
    /// Present only for a Gaussian head.
    pub fc_logvar: Option<Linear<B>>,
    activation: Relu,
    latent_dim: usize,
    input_shape: Ignored<[usize; 3]>,
}

impl<B: Backend> ConvEncoder<B> {
    /// Construct a new convolutional encoder.
    ///
    /// Assumes `config` passed [`ConvVaeConfig::validate`].
    pub fn new(config: &ConvVaeConfig, device: &B::Device) -> Self {
        let c = config.base_channels;

        // [channels, H, W] -> [c, H/2, W/2]
        let conv1 = Conv2dConfig::new([config.channels, c], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        // [c, H/2, W/2] -> [2c, H/4, W/4]
        let conv2 = Conv2dConfig::new([c, c * 2], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let flattened_dim = config.flattened_dim();

        let fc_mean = LinearConfig::new(flattened_dim, config.latent_dim).init(device);
        let fc_logvar = match config.head {
            EncoderHead::Gaussian => {
                Some(LinearConfig::new(flattened_dim, config.latent_dim).init(device))
            }
            EncoderHead::Deterministic => None,
        };

        Self {
            conv1,
            conv2,
            fc_mean,
            fc_logvar,
            activation: Relu::new(),
            latent_dim: config.latent_dim,
            input_shape: Ignored([config.channels, config.image_height, config.image_width]),
        }
    }

    /// Forward pass: `[batch, channels, H, W]` to a latent code of shape
    /// `[batch, latent_dim]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> LatentCode<B> {
        let x = self.activation.forward(self.conv1.forward(x));
        let x = self.activation.forward(self.conv2.forward(x));

        // [B, 2c, H/4, W/4] -> [B, 2c*H/4*W/4]
        let x = x.flatten(1, 3);

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

impl<B: Backend> LatentEncoder<B> for ConvEncoder<B> {
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

// --- CONV DECODER ---

/// Convolutional decoder.
///
/// Structure:
/// - Linear layer expands the latent vector into (2c × H/4 × W/4)
/// - Two transposed convolutions upsample H/4 → H/2 → H
/// - Optional sigmoid on the output
#[derive(Module, Debug)]
pub struct ConvDecoder<B: Backend> {
    pub fc_initial: Linear<B>,
    pub convt1: ConvTranspose2d<B>,
    pub convt2: ConvTranspose2d<B>,
    activation: Relu,
    output: Ignored<OutputActivation>,
    base_channels: usize,
    latent_dim: usize,
    feature_hw: Ignored<[usize; 2]>,
}

impl<B: Backend> ConvDecoder<B> {
    /// Construct a new convolutional decoder.
    ///
    /// Assumes `config` passed [`ConvVaeConfig::validate`].
    pub fn new(config: &ConvVaeConfig, device: &B::Device) -> Self {
        let c = config.base_channels;
        let (h, w) = config.feature_hw();

        let fc_initial = LinearConfig::new(config.latent_dim, config.flattened_dim()).init(device);

        // [2c, H/4, W/4] -> [c, H/2, W/2]
        let convt1 = ConvTranspose2dConfig::new([c * 2, c], [3, 3])
            .with_stride([2, 2])
            // ConvTranspose takes a raw array, not PaddingConfig2d
            .with_padding([1, 1])
            .with_padding_out([1, 1])
            .init(device);

        // [c, H/2, W/2] -> [channels, H, W]
        let convt2 = ConvTranspose2dConfig::new([c, config.channels], [3, 3])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .with_padding_out([1, 1])
            .init(device);

        Self {
            fc_initial,
            convt1,
            convt2,
            activation: Relu::new(),
            output: Ignored(config.output),
            base_channels: c,
            latent_dim: config.latent_dim,
            feature_hw: Ignored([h, w]),
        }
    }

    /// Forward pass: `[batch, latent_dim]` to `[batch, channels, H, W]`.
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch_size, _] = z.dims();
        let [h, w] = self.feature_hw.0;

        let x = self.activation.forward(self.fc_initial.forward(z));
        let x = x.reshape([batch_size, self.base_channels * 2, h, w]);

        let x = self.activation.forward(self.convt1.forward(x));
        self.output.apply(self.convt2.forward(x))
    }
}

impl<B: Backend> LatentDecoder<B> for ConvDecoder<B> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_encoder_decoder_shapes() {
        let device = Default::default();
        let config = ConvVaeConfig::for_strategy(LossStrategy::Elbo)
            .with_base_channels(4)
            .with_latent_dim(3);
        let encoder: ConvEncoder<TestBackend> = config.init_encoder(&device).unwrap();
        let decoder: ConvDecoder<TestBackend> = config.init_decoder(&device).unwrap();

        let x = Tensor::<TestBackend, 4>::random([5, 1, 28, 28], Distribution::Default, &device);
        let code = encoder.encode(x);
        assert_eq!(code.head(), EncoderHead::Gaussian);
        assert_eq!(code.dims(), [5, 3]);

        let out = decoder.decode(code.sample());
        assert_eq!(out.dims(), [5, 1, 28, 28]);
    }

    #[test]
    fn test_deterministic_head_and_sigmoid_output() {
        let device = Default::default();
        let config = ConvVaeConfig::for_strategy(LossStrategy::Mmd).with_base_channels(4);
        let encoder: ConvEncoder<TestBackend> = config.init_encoder(&device).unwrap();
        let decoder: ConvDecoder<TestBackend> = config.init_decoder(&device).unwrap();

        assert!(encoder.fc_logvar.is_none());
        assert_eq!(LatentEncoder::head(&encoder), EncoderHead::Deterministic);
        assert_eq!(decoder.output_activation(), OutputActivation::Sigmoid);

        let z = Tensor::<TestBackend, 2>::random([4, 2], Distribution::Normal(0.0, 3.0), &device);
        let values: Vec<f32> = decoder.decode(z).into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_non_square_image() {
        let device = Default::default();
        let config = ConvVaeConfig::new()
            .with_image_height(16)
            .with_image_width(8)
            .with_base_channels(2);
        let encoder: ConvEncoder<TestBackend> = config.init_encoder(&device).unwrap();
        let decoder: ConvDecoder<TestBackend> = config.init_decoder(&device).unwrap();

        let x = Tensor::<TestBackend, 4>::zeros([2, 1, 16, 8], &device);
        let out = decoder.decode(encoder.encode(x).location());
        assert_eq!(out.dims(), [2, 1, 16, 8]);
    }

    #[test]
    fn test_rejects_indivisible_image() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let config = ConvVaeConfig::new().with_image_height(30);
        let result = config.init_encoder::<TestBackend>(&device);
        assert!(matches!(result, Err(VaeError::InvalidImageShape { height: 30, .. })));
    }
}
