use crate::Tensor;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use rayon::prelude::*;

const TRAIN_FILES: &[&str] = &[
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILES: &[&str] = &["test_batch.bin"];

// One record: label byte + 32x32x3 pixels in CHW order.
const RECORD_BYTES: usize = 1 + IMAGE_PIXELS;
const IMAGE_PIXELS: usize = 3 * 32 * 32;
const PLANE: usize = 32 * 32;

const NORM_MEAN: [f32; 3] = [0.49139968, 0.48215827, 0.44653124];
const NORM_STD: [f32; 3] = [0.24703233, 0.24348505, 0.26158768];

pub struct Cifar10Dataset {
    pub images: Tensor, // [N, 3072] normalized CHW planes
    pub labels: Tensor, // [N] with values 0-9
    pub train: bool,
}

impl Cifar10Dataset {
    /// Load the CIFAR-10 binary distribution from `data_dir`
    /// (default `./data/cifar-10-batches-bin`). The archive ships as a tar;
    /// extract it first, the loader names the missing files otherwise.
    pub fn new(train: bool, data_dir: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let data_dir = data_dir.unwrap_or("./data/cifar-10-batches-bin");
        let data_path = Path::new(data_dir);

        let files = if train { TRAIN_FILES } else { TEST_FILES };

        let mut images: Vec<f32> = Vec::new();
        let mut labels: Vec<f32> = Vec::new();

        for name in files {
            let path = data_path.join(name);
            let mut buffer = Vec::new();
            File::open(&path)
                .map_err(|e| {
                    format!(
                        "failed to open {:?}: {} (expected the extracted CIFAR-10 \
                         binary files {:?} under {})",
                        path, e, files, data_dir
                    )
                })?
                .read_to_end(&mut buffer)?;

            if buffer.len() % RECORD_BYTES != 0 {
                return Err(format!(
                    "{:?}: size {} is not a multiple of the {}-byte record",
                    path,
                    buffer.len(),
                    RECORD_BYTES
                )
                .into());
            }

            let records = buffer.len() / RECORD_BYTES;
            images.reserve(records * IMAGE_PIXELS);
            labels.reserve(records);

            for r in 0..records {
                let record = &buffer[r * RECORD_BYTES..(r + 1) * RECORD_BYTES];
                labels.push(record[0] as f32);
                for ch in 0..3 {
                    let mean = NORM_MEAN[ch];
                    let std = NORM_STD[ch];
                    for &byte in &record[1 + ch * PLANE..1 + (ch + 1) * PLANE] {
                        images.push((byte as f32 / 255.0 - mean) / std);
                    }
                }
            }
        }

        let n = labels.len();
        println!("Loaded {} CIFAR-10 {} images", n, if train { "train" } else { "test" });

        Ok(Cifar10Dataset {
            images: Tensor::new(images, &[n, IMAGE_PIXELS]),
            labels: Tensor::new(labels, &[n]),
            train,
        })
    }

    /// Gather a batch by indices (parallelized with Rayon).
    /// Returns images as [B, 3, 32, 32] and labels as [B].
    pub fn get_batch(&self, indices: &[usize]) -> (Tensor, Tensor) {
        let batch_size = indices.len();

        let mut batch_images = vec![0.0f32; batch_size * IMAGE_PIXELS];
        let mut batch_labels = vec![0.0f32; batch_size];

        let images_guard = self.images.data();
        let labels_guard = self.labels.data();
        let images_data: &[f32] = &images_guard;
        let labels_data: &[f32] = &labels_guard;

        // each chunk writes a disjoint [i*3072 .. (i+1)*3072) range
        batch_images
            .par_chunks_mut(IMAGE_PIXELS)
            .enumerate()
            .for_each(|(i, dst)| {
                let idx = indices[i];
                dst.copy_from_slice(&images_data[idx * IMAGE_PIXELS..(idx + 1) * IMAGE_PIXELS]);
            });

        batch_labels.par_iter_mut().enumerate().for_each(|(i, y)| {
            *y = labels_data[indices[i]];
        });

        drop(images_guard);
        drop(labels_guard);

        (
            Tensor::new(batch_images, &[batch_size, 3, 32, 32]),
            Tensor::new(batch_labels, &[batch_size]),
        )
    }

    pub fn len(&self) -> usize {
        self.labels.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DataLoader {
    dataset: Cifar10Dataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<usize>,
    current: usize,
}

impl DataLoader {
    pub fn new(dataset: Cifar10Dataset, batch_size: usize, shuffle: bool) -> Self {
        let n = dataset.len();
        let mut indices: Vec<usize> = (0..n).collect();

        if shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            indices.shuffle(&mut rng);
        }

        DataLoader {
            dataset,
            batch_size,
            shuffle,
            indices,
            current: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current = 0;

        if self.shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }
}

impl Iterator for DataLoader {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.dataset.len() {
            return None;
        }

        let end = (self.current + self.batch_size).min(self.dataset.len());
        let batch = self.dataset.get_batch(&self.indices[self.current..end]);
        self.current = end;

        Some(batch)
    }
}
