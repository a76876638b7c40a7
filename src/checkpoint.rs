//! Persistence of the encoder/decoder parameter sets and resume metadata.
//!
//! Layout under a checkpoint directory:
//!
//! ```text
//! encoder.bin  decoder.bin              model weights (full precision)
//! encoder_optim.mpk  decoder_optim.mpk  optimizer state
//! meta.json                             last completed epoch
//! ```

use std::path::Path;

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};

use crate::error::VaeError;
use crate::loss::LossStrategy;

const ENCODER_FILE: &str = "encoder";
const DECODER_FILE: &str = "decoder";
pub const ENCODER_OPTIM_FILE: &str = "encoder_optim";
pub const DECODER_OPTIM_FILE: &str = "decoder_optim";
const META_FILE: &str = "meta.json";

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Last fully completed epoch (1-based).
    pub epoch: usize,
    pub strategy: LossStrategy,
    /// Average training loss of `epoch`.
    pub train_loss: f64,
}

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

/// Save both parameter sets into `dir`, creating it if needed.
pub fn save_models<B, E, D>(dir: &Path, encoder: &E, decoder: &D) -> Result<(), VaeError>
where
    B: Backend,
    E: Module<B>,
    D: Module<B>,
{
    std::fs::create_dir_all(dir)?;
    encoder.clone().save_file(dir.join(ENCODER_FILE), &recorder())?;
    decoder.clone().save_file(dir.join(DECODER_FILE), &recorder())?;
    Ok(())
}

/// Load weights from `dir` on top of freshly initialized `encoder` and
/// `decoder`. Their architecture must match the one that was saved.
pub fn load_models<B, E, D>(
    dir: &Path,
    encoder: E,
    decoder: D,
    device: &B::Device,
) -> Result<(E, D), VaeError>
where
    B: Backend,
    E: Module<B>,
    D: Module<B>,
{
    let encoder = encoder.load_file(dir.join(ENCODER_FILE), &recorder(), device)?;
    let decoder = decoder.load_file(dir.join(DECODER_FILE), &recorder(), device)?;
    Ok((encoder, decoder))
}

pub fn save_meta(dir: &Path, meta: &CheckpointMeta) -> Result<(), VaeError> {
    std::fs::create_dir_all(dir)?;
    let file = std::fs::File::create(dir.join(META_FILE))?;
    serde_json::to_writer_pretty(file, meta)?;
    Ok(())
}

/// Read `meta.json` from `dir`, or `None` when no checkpoint was written yet.
pub fn load_meta(dir: &Path) -> Result<Option<CheckpointMeta>, VaeError> {
    let path = dir.join(META_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let file = std::fs::File::open(&path)?;
    Ok(Some(serde_json::from_reader(file)?))
}

/// Save an optimizer's state (e.g. Adam moments) as `{dir}/{name}.mpk`.
pub fn save_optimizer<B, M, O>(dir: &Path, name: &str, optimizer: &O) -> Result<(), VaeError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    std::fs::create_dir_all(dir)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    <NamedMpkFileRecorder<FullPrecisionSettings> as Recorder<B>>::record(
        &recorder,
        optimizer.to_record(),
        dir.join(name),
    )?;
    Ok(())
}

/// Restore an optimizer's state saved by [`save_optimizer`].
pub fn load_optimizer<B, M, O>(
    dir: &Path,
    name: &str,
    optimizer: O,
    device: &B::Device,
) -> Result<O, VaeError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record: O::Record = <NamedMpkFileRecorder<FullPrecisionSettings> as Recorder<B>>::load(
        &recorder,
        dir.join(name),
        device,
    )?;
    Ok(optimizer.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv_model::{ConvDecoder, ConvEncoder, ConvVaeConfig};
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Tensor;

    type TestBackend = NdArray<f32>;

    fn values<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    fn encoder_params(e: &ConvEncoder<TestBackend>) -> Vec<Vec<f32>> {
        let mut out = vec![
            values(e.conv1.weight.val()),
            values(e.conv2.weight.val()),
            values(e.fc_mean.weight.val()),
        ];
        if let Some(fc) = &e.fc_logvar {
            out.push(values(fc.weight.val()));
        }
        out
    }

    fn decoder_params(d: &ConvDecoder<TestBackend>) -> Vec<Vec<f32>> {
        vec![
            values(d.fc_initial.weight.val()),
            values(d.convt1.weight.val()),
            values(d.convt2.weight.val()),
        ]
    }

    #[test]
    fn test_save_then_load_is_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ConvVaeConfig::new().with_base_channels(4);
        let encoder: ConvEncoder<TestBackend> = config.init_encoder(&device).unwrap();
        let decoder: ConvDecoder<TestBackend> = config.init_decoder(&device).unwrap();

        save_models(tmp.path(), &encoder, &decoder).unwrap();

        // Fresh modules have different random weights until loaded.
        let fresh_encoder: ConvEncoder<TestBackend> = config.init_encoder(&device).unwrap();
        let fresh_decoder: ConvDecoder<TestBackend> = config.init_decoder(&device).unwrap();
        let (loaded_encoder, loaded_decoder) =
            load_models(tmp.path(), fresh_encoder, fresh_decoder, &device).unwrap();

        assert_eq!(encoder_params(&encoder), encoder_params(&loaded_encoder));
        assert_eq!(decoder_params(&decoder), decoder_params(&loaded_decoder));

        // A second save/load cycle without updates changes nothing either.
        save_models(tmp.path(), &loaded_encoder, &loaded_decoder).unwrap();
        let (again_encoder, again_decoder) =
            load_models(tmp.path(), loaded_encoder, loaded_decoder, &device).unwrap();
        assert_eq!(encoder_params(&encoder), encoder_params(&again_encoder));
        assert_eq!(decoder_params(&decoder), decoder_params(&again_decoder));
    }

    #[test]
    fn test_meta_round_trip_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(load_meta(tmp.path()).unwrap(), None);

        let meta = CheckpointMeta {
            epoch: 3,
            strategy: LossStrategy::Mmd,
            train_loss: 0.125,
        };
        save_meta(tmp.path(), &meta).unwrap();
        assert_eq!(load_meta(tmp.path()).unwrap(), Some(meta));
    }

    #[test]
    fn test_load_missing_weights_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ConvVaeConfig::new().with_base_channels(2);
        let encoder: ConvEncoder<TestBackend> = config.init_encoder(&device).unwrap();
        let decoder: ConvDecoder<TestBackend> = config.init_decoder(&device).unwrap();

        let result = load_models(tmp.path(), encoder, decoder, &device);
        assert!(matches!(result, Err(VaeError::Checkpoint(_))));
    }
}
