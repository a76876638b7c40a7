//! Reconstruction and latent regularization losses.
//!
//! Two interchangeable strategies share the encode -> sample -> decode
//! pipeline and differ in how the latent space is regularized:
//!
//! - [`LossStrategy::Elbo`]: negative single-sample Monte Carlo ELBO. Each
//!   sample's posterior is pulled toward the standard normal prior.
//! - [`LossStrategy::Mmd`]: squared reconstruction error plus the maximum mean
//!   discrepancy between the batch of latent codes and prior samples, which
//!   matches aggregate statistics instead of per-sample posteriors.
//!
//! The MMD estimate depends on batch size and is only unbiased
//! asymptotically; callers should keep batch size fixed across a run.

use std::f64::consts::PI;
use std::fmt;

use burn::prelude::*;
use burn::tensor::Distribution;
use serde::{Deserialize, Serialize};

use crate::error::VaeError;
use crate::latent::{EncoderHead, LatentCode, LatentDecoder, LatentEncoder, OutputActivation};

/// Latent regularization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossStrategy {
    /// Evidence lower bound with a Gaussian posterior.
    Elbo,
    /// Maximum mean discrepancy against the prior (Info-VAE).
    Mmd,
}

impl fmt::Display for LossStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossStrategy::Elbo => write!(f, "elbo"),
            LossStrategy::Mmd => write!(f, "mmd"),
        }
    }
}

/// Scalar loss components for one batch, each of shape `[1]`.
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub reconstruction: Tensor<B, 1>,
    pub regularization: Tensor<B, 1>,
}

impl LossStrategy {
    /// Encoder head this strategy regularizes.
    pub fn encoder_head(&self) -> EncoderHead {
        match self {
            LossStrategy::Elbo => EncoderHead::Gaussian,
            LossStrategy::Mmd => EncoderHead::Deterministic,
        }
    }

    /// Decoder output activation this strategy's reconstruction term expects.
    ///
    /// The Bernoulli likelihood is evaluated on logits (cross-entropy fused
    /// with the sigmoid); squared error is evaluated on probabilities.
    pub fn output_activation(&self) -> OutputActivation {
        match self {
            LossStrategy::Elbo => OutputActivation::Logits,
            LossStrategy::Mmd => OutputActivation::Sigmoid,
        }
    }

    /// Reject encoder/decoder pairs whose head or output activation does not
    /// fit this strategy.
    pub fn check_compatible(
        &self,
        head: EncoderHead,
        output: OutputActivation,
    ) -> Result<(), VaeError> {
        let expected_head = self.encoder_head();
        let expected_output = self.output_activation();
        if head != expected_head || output != expected_output {
            return Err(VaeError::IncompatibleModel {
                strategy: *self,
                head,
                output,
                expected_head,
                expected_output,
            });
        }
        Ok(())
    }

    /// Reconstruction term, averaged over the batch.
    ///
    /// ELBO: summed sigmoid cross-entropy per sample (`-log p(x|z)`).
    /// MMD: mean squared error over every element.
    pub fn reconstruction<B: Backend>(
        &self,
        decoded: Tensor<B, 4>,
        target: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        match self {
            LossStrategy::Elbo => {
                let cross_ent = sigmoid_cross_entropy_with_logits(decoded, target);
                cross_ent.flatten::<2>(1, 3).sum_dim(1).mean()
            }
            LossStrategy::Mmd => mean_squared_error(decoded, target),
        }
    }

    /// Latent regularization term given the encoder output and the latent
    /// sample `z` that was decoded. The batch size is taken from `z`.
    ///
    /// ELBO: `mean(log q(z|x) - log p(z))`.
    /// MMD: `mmd(prior_samples, z)` with one prior draw per batch row.
    pub fn regularization<B: Backend>(
        &self,
        code: &LatentCode<B>,
        z: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>, VaeError> {
        match (self, code) {
            (LossStrategy::Elbo, LatentCode::Gaussian { mean, logvar }) => {
                let logpz = log_normal_pdf(z.clone(), z.zeros_like(), z.zeros_like());
                let logqz_x = log_normal_pdf(z, mean.clone(), logvar.clone());
                Ok((logqz_x - logpz).mean())
            }
            (LossStrategy::Mmd, LatentCode::Deterministic(_)) => {
                let [batch_size, latent_dim] = z.dims();
                let true_samples = Tensor::<B, 2>::random(
                    [batch_size, latent_dim],
                    Distribution::Normal(0.0, 1.0),
                    &z.device(),
                );
                Ok(compute_mmd(true_samples, z))
            }
            (strategy, code) => Err(VaeError::IncompatibleModel {
                strategy: *strategy,
                head: code.head(),
                output: strategy.output_activation(),
                expected_head: strategy.encoder_head(),
                expected_output: strategy.output_activation(),
            }),
        }
    }
}

/// Run one forward pass through `encoder` and `decoder` and score it.
pub fn compute_loss<B, E, D>(
    strategy: LossStrategy,
    encoder: &E,
    decoder: &D,
    x: Tensor<B, 4>,
) -> Result<LossBreakdown<B>, VaeError>
where
    B: Backend,
    E: LatentEncoder<B>,
    D: LatentDecoder<B>,
{
    let code = encoder.encode(x.clone());
    let z = code.sample();
    let decoded = decoder.decode(z.clone());

    let reconstruction = strategy.reconstruction(decoded, x);
    let regularization = strategy.regularization(&code, z)?;
    let total = reconstruction.clone() + regularization.clone();

    Ok(LossBreakdown {
        total,
        reconstruction,
        regularization,
    })
}

/// Log-density of `sample` under a diagonal Gaussian, summed over the
/// latent dimension.
///
/// ```text
/// log N(x; mean, exp(logvar)) = -0.5 * (log 2π + logvar + exp(-logvar) * (x - mean)²)
/// ```
///
/// Inputs are `[batch, dim]`; the result is `[batch]`.
pub fn log_normal_pdf<B: Backend>(
    sample: Tensor<B, 2>,
    mean: Tensor<B, 2>,
    logvar: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log2pi = (2.0 * PI).ln();
    let squared = (sample - mean).powf_scalar(2.0);
    let per_dim = (squared * logvar.clone().neg().exp() + logvar)
        .add_scalar(log2pi)
        .mul_scalar(-0.5);
    per_dim.sum_dim(1).flatten::<1>(0, 1)
}

/// Element-wise binary cross-entropy on logits.
///
/// Uses `max(l, 0) - l * x + log(1 + exp(-|l|))`, which never exponentiates
/// a positive number.
pub fn sigmoid_cross_entropy_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    labels: Tensor<B, D>,
) -> Tensor<B, D> {
    logits.clone().clamp_min(0.0) - logits.clone() * labels + logits.abs().neg().exp().log1p()
}

/// Mean of squared differences over all elements, shape `[1]`.
pub fn mean_squared_error<B: Backend, const D: usize>(
    output: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, 1> {
    (output - target).powf_scalar(2.0).mean()
}

/// Gaussian kernel matrix between the rows of `x` (`[n, dim]`) and `y`
/// (`[m, dim]`).
///
/// ```text
/// k(a, b) = exp(-mean((a - b)²) / dim)
/// ```
///
/// Returns `[n, m]`.
pub fn compute_kernel<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, dim] = x.dims();
    let [m, _] = y.dims();

    let tiled_x = x.unsqueeze_dim::<3>(1).expand([n, m, dim]);
    let tiled_y = y.unsqueeze_dim::<3>(0).expand([n, m, dim]);

    (tiled_x - tiled_y)
        .powf_scalar(2.0)
        .mean_dim(2)
        .reshape([n, m])
        .div_scalar(dim as f32)
        .neg()
        .exp()
}

/// Maximum mean discrepancy estimate between the sample sets `x` and `y`.
///
/// ```text
/// MMD(X, Y) = mean(k(X, X)) + mean(k(Y, Y)) - 2 * mean(k(X, Y))
/// ```
pub fn compute_mmd<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 1> {
    let x_kernel = compute_kernel(x.clone(), x.clone());
    let y_kernel = compute_kernel(y.clone(), y.clone());
    let xy_kernel = compute_kernel(x, y);
    x_kernel.mean() + y_kernel.mean() - xy_kernel.mean().mul_scalar(2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem()
    }

    #[test]
    fn test_log_normal_pdf_standard_normal_at_zero() {
        let device = Default::default();
        let zeros = Tensor::<TestBackend, 2>::zeros([3, 4], &device);

        let logp: Vec<f32> = log_normal_pdf(zeros.clone(), zeros.clone(), zeros)
            .into_data()
            .to_vec()
            .unwrap();

        let expected = -0.5 * (2.0 * std::f32::consts::PI).ln() * 4.0;
        assert_eq!(logp.len(), 3);
        for v in logp {
            assert!((v - expected).abs() < 1e-5, "expected {expected}, got {v}");
        }
    }

    #[test]
    fn test_log_normal_pdf_matches_closed_form() {
        let device = Default::default();
        // N(x=2; mean=1, var=e) per dim
        let sample = Tensor::<TestBackend, 2>::from_data(TensorData::from([[2.0_f32]]), &device);
        let mean = Tensor::<TestBackend, 2>::from_data(TensorData::from([[1.0_f32]]), &device);
        let logvar = Tensor::<TestBackend, 2>::from_data(TensorData::from([[1.0_f32]]), &device);

        let got = scalar(log_normal_pdf(sample, mean, logvar));
        let var = 1.0_f32.exp();
        let expected = -0.5 * ((2.0 * std::f32::consts::PI).ln() + 1.0 + 1.0 / var);
        assert!((got - expected).abs() < 1e-5, "expected {expected}, got {got}");
    }

    #[test]
    fn test_sigmoid_cross_entropy_matches_naive() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_data(
            TensorData::from([-3.0_f32, -0.5, 0.0, 0.5, 3.0]),
            &device,
        );
        let labels = Tensor::<TestBackend, 1>::from_data(
            TensorData::from([0.0_f32, 1.0, 0.5, 0.2, 1.0]),
            &device,
        );

        let stable: Vec<f32> = sigmoid_cross_entropy_with_logits(logits.clone(), labels.clone())
            .into_data()
            .to_vec()
            .unwrap();
        let l: Vec<f32> = logits.into_data().to_vec().unwrap();
        let x: Vec<f32> = labels.into_data().to_vec().unwrap();

        for i in 0..l.len() {
            let p = 1.0 / (1.0 + (-l[i]).exp());
            let naive = -(x[i] * p.ln() + (1.0 - x[i]) * (1.0 - p).ln());
            assert!(
                (stable[i] - naive).abs() < 1e-5,
                "index {i}: stable={} naive={naive}",
                stable[i]
            );
        }
    }

    #[test]
    fn test_sigmoid_cross_entropy_large_logits_finite() {
        let device = Default::default();
        let logits =
            Tensor::<TestBackend, 1>::from_data(TensorData::from([-500.0_f32, 500.0]), &device);
        let labels = Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0_f32, 0.0]), &device);

        let ce: Vec<f32> = sigmoid_cross_entropy_with_logits(logits, labels)
            .into_data()
            .to_vec()
            .unwrap();
        for v in ce {
            assert!(v.is_finite());
            assert!((v - 500.0).abs() < 1e-3, "expected ~500, got {v}");
        }
    }

    #[test]
    fn test_kernel_diagonal_is_one() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::random([6, 3], Distribution::Normal(0.0, 1.0), &device);

        let k: Vec<f32> = compute_kernel(x.clone(), x).into_data().to_vec().unwrap();
        for i in 0..6 {
            assert_eq!(k[i * 6 + i], 1.0, "k[{i},{i}] should be exactly 1");
        }
        for v in k {
            assert!(v > 0.0 && v <= 1.0, "kernel value {v} outside (0, 1]");
        }
    }

    #[test]
    fn test_kernel_value() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0_f32, 0.0]]), &device);
        let y = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0_f32, 1.0], [2.0, 0.0]]),
            &device,
        );

        let k: Vec<f32> = compute_kernel(x, y).into_data().to_vec().unwrap();
        // mean((a-b)^2) = 1 and 2, divided by dim=2
        assert!((k[0] - (-0.5_f32).exp()).abs() < 1e-6);
        assert!((k[1] - (-1.0_f32).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_mmd_identical_samples_is_zero() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::random([32, 2], Distribution::Normal(0.0, 1.0), &device);

        let mmd = scalar(compute_mmd(x.clone(), x));
        assert!(mmd.abs() < 1e-5, "MMD(X, X) should be ~0, got {mmd}");
    }

    #[test]
    fn test_mmd_separated_distributions_is_positive() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::random([64, 2], Distribution::Normal(0.0, 1.0), &device);
        let y = Tensor::<TestBackend, 2>::random([64, 2], Distribution::Normal(5.0, 1.0), &device);

        let far = scalar(compute_mmd(x.clone(), y));
        let near = scalar(compute_mmd(x.clone(), x));
        assert!(far > 0.1, "shifted distributions should have large MMD, got {far}");
        assert!(far > near);
    }

    #[test]
    fn test_mse() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 2>::from_data(TensorData::from([[1.0_f32, 2.0]]), &device);
        let b = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0_f32, 4.0]]), &device);
        let mse = scalar(mean_squared_error(a, b));
        assert!((mse - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_check_compatible() {
        assert!(
            LossStrategy::Elbo
                .check_compatible(EncoderHead::Gaussian, OutputActivation::Logits)
                .is_ok()
        );
        assert!(
            LossStrategy::Mmd
                .check_compatible(EncoderHead::Deterministic, OutputActivation::Sigmoid)
                .is_ok()
        );

        let err = LossStrategy::Mmd
            .check_compatible(EncoderHead::Deterministic, OutputActivation::Logits)
            .unwrap_err();
        assert!(matches!(err, VaeError::IncompatibleModel { .. }));
        assert!(
            LossStrategy::Elbo
                .check_compatible(EncoderHead::Deterministic, OutputActivation::Logits)
                .is_err()
        );
    }

    #[test]
    fn test_elbo_regularization_rejects_deterministic_code() {
        let device = Default::default();
        let z = Tensor::<TestBackend, 2>::zeros([4, 2], &device);
        let code = LatentCode::Deterministic(z.clone());

        let result = LossStrategy::Elbo.regularization(&code, z);
        assert!(matches!(result, Err(VaeError::IncompatibleModel { .. })));
    }

    #[test]
    fn test_elbo_regularization_zero_when_posterior_is_prior() {
        let device = Default::default();
        let z = Tensor::<TestBackend, 2>::random([8, 3], Distribution::Normal(0.0, 1.0), &device);
        let code = LatentCode::Gaussian {
            mean: z.zeros_like(),
            logvar: z.zeros_like(),
        };

        let reg = scalar(LossStrategy::Elbo.regularization(&code, z).unwrap());
        assert!(reg.abs() < 1e-5, "q == p should give zero regularization, got {reg}");
    }

    #[test]
    fn test_elbo_reconstruction_sums_over_pixels() {
        let device = Default::default();
        // logit 0 => per-pixel CE = ln 2 regardless of label
        let decoded = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);
        let target = Tensor::<TestBackend, 4>::ones([2, 1, 4, 4], &device);

        let recon = scalar(LossStrategy::Elbo.reconstruction(decoded, target));
        let expected = 16.0 * 2.0_f32.ln();
        assert!((recon - expected).abs() < 1e-4, "expected {expected}, got {recon}");
    }
}
