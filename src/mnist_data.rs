use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder, batcher::Batcher},
        dataset::{Dataset, vision::MnistItem},
    },
    tensor::{Int, Tensor, TensorData, backend::Backend},
};

use std::marker::PhantomData;
use std::sync::Arc;

use crate::{MNIST_DIM_X, MNIST_DIM_Y};

/// A batch of grayscale images with their digit labels.
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, 1, 28, 28]`, pixel values in `[0.0, 1.0]`.
    pub images: Tensor<B, 4>,
    /// `[batch]`; carried along for diagnostics, unused by the losses.
    pub labels: Tensor<B, 1, Int>,
}

// --- Data Handling ---
/// A batcher for MNIST data that converts a list of `MnistItem`s
/// (each containing a 28×28 grayscale image) into a normalized image tensor.
///
/// # Normalization
/// ```text
/// pixel_normalized = pixel / 255.0
/// ```
#[derive(Clone)]
pub struct MnistBatcher<B: Backend> {
    _b: PhantomData<B>,
}

impl<B: Backend> MnistBatcher<B> {
    pub fn new() -> Self {
        Self { _b: PhantomData }
    }
}

impl<B: Backend> Default for MnistBatcher<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Batcher<B, MnistItem, ImageBatch<B>> for MnistBatcher<B> {
    /// Packs `items` into `[batch, 1, 28, 28]` images and `[batch]` labels.
    fn batch(&self, items: Vec<MnistItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();

        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|item| {
                item.image
                    .iter()
                    .flat_map(|row| row.iter())
                    .map(|&pixel| pixel as f32 / 255.0)
            })
            .collect();

        let images = Tensor::from_floats(
            TensorData::new(
                pixels,
                vec![batch_size, 1, MNIST_DIM_Y as usize, MNIST_DIM_X as usize],
            ),
            device,
        );

        let labels_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let labels = Tensor::from_ints(TensorData::new(labels_data, vec![batch_size]), device);

        ImageBatch { images, labels }
    }
}

/// Build a data loader over `dataset`.
///
/// With `shuffle_seed` set the item order is reshuffled on every pass
/// (every call to `iter()`), seeded once for reproducibility.
pub fn build_loader<B, D>(
    dataset: D,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    num_workers: usize,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, ImageBatch<B>>>
where
    B: Backend,
    D: Dataset<MnistItem> + 'static,
{
    let mut builder = DataLoaderBuilder::new(MnistBatcher::<B>::new())
        .batch_size(batch_size)
        .set_device(device.clone());
    if let Some(seed) = shuffle_seed {
        builder = builder.shuffle(seed);
    }
    if num_workers > 0 {
        builder = builder.num_workers(num_workers);
    }
    builder.build(dataset)
}
