//! Dataset collaborator and index-driven batching.
//!
//! The controller never touches examples directly: it holds index sets and asks
//! a [`BatchLoader`] to turn them into minibatches. The labeled set is visited
//! in a fresh random order every epoch; subpools are visited sequentially so
//! scores line up with the indices they were computed for.

use std::io::BufRead;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{ActiveLearningError, Result};

/// One dataset item: a dense feature vector and its class label.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Example {
    pub features: Vec<f32>,
    pub label: usize,
}

/// Random-access labeled dataset addressed by example index.
pub trait Dataset: Send + Sync {
    /// Total number of examples; valid indices are `0..len()`.
    fn len(&self) -> usize;

    /// Look up one example.
    fn get(&self, index: usize) -> Option<Example>;

    /// Width of every feature vector.
    fn feature_dim(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dataset held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    examples: Vec<Example>,
    feature_dim: usize,
    num_classes: usize,
}

impl InMemoryDataset {
    /// Build from examples, checking that all feature vectors share one width.
    pub fn new(examples: Vec<Example>) -> Result<Self> {
        let feature_dim = examples.first().map(|e| e.features.len()).unwrap_or(0);
        if let Some((i, e)) = examples
            .iter()
            .enumerate()
            .find(|(_, e)| e.features.len() != feature_dim)
        {
            return Err(ActiveLearningError::Dataset(format!(
                "example {i} has {} features, expected {feature_dim}",
                e.features.len()
            )));
        }
        let num_classes = examples.iter().map(|e| e.label + 1).max().unwrap_or(0);
        Ok(Self {
            examples,
            feature_dim,
            num_classes,
        })
    }

    /// Load from a JSON-lines file of `{"features": [...], "label": k}` records.
    ///
    /// Blank lines are skipped.
    pub fn from_jsonl(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        let reader = std::io::BufReader::new(file);

        let mut examples = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(&line).map_err(|e| {
                anyhow::anyhow!("{}:{}: invalid example: {e}", path.display(), line_no + 1)
            })?;
            examples.push(example);
        }

        let dataset = Self::new(examples)?;
        tracing::info!(
            path = %path.display(),
            examples = dataset.len(),
            feature_dim = dataset.feature_dim,
            classes = dataset.num_classes,
            "Loaded dataset"
        );
        Ok(dataset)
    }

    /// Seeded synthetic dataset of `num_classes` Gaussian-like blobs.
    ///
    /// Class centers are drawn uniformly in `[-3, 3]^dim`; each example adds
    /// uniform noise of half-width `spread` to its class center. Labels cycle
    /// through the classes so every class has `n / num_classes` examples.
    pub fn gaussian_blobs(n: usize, num_classes: usize, dim: usize, spread: f32, seed: u64) -> Self {
        assert!(num_classes > 0, "num_classes must be > 0");
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let centers: Vec<Vec<f32>> = (0..num_classes)
            .map(|_| (0..dim).map(|_| rng.gen_range(-3.0..3.0)).collect())
            .collect();

        let examples = (0..n)
            .map(|i| {
                let label = i % num_classes;
                let features = centers[label]
                    .iter()
                    .map(|c| c + rng.gen_range(-spread..=spread))
                    .collect();
                Example { features, label }
            })
            .collect();

        Self {
            examples,
            feature_dim: dim,
            num_classes,
        }
    }

    /// Number of distinct classes (max label + 1).
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Split into the first `at` examples and the rest.
    pub fn split(mut self, at: usize) -> (Self, Self) {
        let rest = self.examples.split_off(at.min(self.examples.len()));
        let tail = Self {
            examples: rest,
            feature_dim: self.feature_dim,
            num_classes: self.num_classes,
        };
        (self, tail)
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Option<Example> {
        self.examples.get(index).cloned()
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

/// A materialized minibatch, still backend-agnostic.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Dataset indices, in batch order.
    pub indices: Vec<usize>,
    /// Row-major features, `indices.len() * dim` values.
    pub features: Vec<f32>,
    pub labels: Vec<usize>,
    pub dim: usize,
}

impl Batch {
    /// Gather the examples at `indices` from `dataset`, preserving order.
    pub fn gather(dataset: &dyn Dataset, indices: &[usize]) -> Result<Self> {
        let dim = dataset.feature_dim();
        let mut features = Vec::with_capacity(indices.len() * dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            let example = dataset.get(idx).ok_or_else(|| {
                ActiveLearningError::Dataset(format!(
                    "index {idx} out of range for dataset of {}",
                    dataset.len()
                ))
            })?;
            features.extend_from_slice(&example.features);
            labels.push(example.label);
        }
        Ok(Self {
            indices: indices.to_vec(),
            features,
            labels,
            dim,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Features as a `(batch, dim)` tensor.
    pub fn features_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::from_data(
            TensorData::new(self.features.clone(), [self.len(), self.dim]),
            device,
        )
    }

    /// Labels as a `(batch,)` integer tensor.
    pub fn labels_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let labels: Vec<i64> = self.labels.iter().map(|&l| l as i64).collect();
        Tensor::from_data(TensorData::new(labels, [self.len()]), device)
    }
}

/// Order in which a loader visits its indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderOrder {
    /// Reshuffled every epoch.
    Random,
    /// Exactly the given order, every epoch.
    Sequential,
}

/// Splits a fixed index set into minibatches.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    indices: Vec<usize>,
    batch_size: usize,
    order: LoaderOrder,
    even_batches: bool,
}

impl BatchLoader {
    /// Loader over `indices` with a fresh shuffle each epoch.
    pub fn random(indices: Vec<usize>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        Self {
            indices,
            batch_size,
            order: LoaderOrder::Random,
            even_batches: false,
        }
    }

    /// Order-preserving loader over `indices`.
    pub fn sequential(indices: Vec<usize>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        Self {
            indices,
            batch_size,
            order: LoaderOrder::Sequential,
            even_batches: false,
        }
    }

    /// Drop one example from an odd-sized final batch.
    ///
    /// Pairwise ranking pairs examples within a batch; with an even
    /// `batch_size` only the tail can be odd, and its dropped example changes
    /// from epoch to epoch under random order.
    pub fn with_even_batches(mut self, even: bool) -> Self {
        self.even_batches = even;
        self
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn order(&self) -> LoaderOrder {
        self.order
    }

    /// Number of batches produced per epoch.
    pub fn num_batches(&self) -> usize {
        let full = self.indices.len() / self.batch_size;
        let tail = self.indices.len() % self.batch_size;
        let tail = if self.even_batches { tail - tail % 2 } else { tail };
        full + usize::from(tail > 0)
    }

    /// Index chunks for one epoch.
    pub fn epoch_chunks(&self, rng: &mut impl Rng) -> Vec<Vec<usize>> {
        let mut order = self.indices.clone();
        if self.order == LoaderOrder::Random {
            order.shuffle(rng);
        }
        order
            .chunks(self.batch_size)
            .filter_map(|chunk| {
                let keep = if self.even_batches {
                    chunk.len() - chunk.len() % 2
                } else {
                    chunk.len()
                };
                (keep > 0).then(|| chunk[..keep].to_vec())
            })
            .collect()
    }
}

/// Training loader over the current labeled set.
///
/// The single place a labeled loader is built: at trial start and again after
/// every acquisition.
pub fn rebuild_training_loader(labeled: &[usize], batch_size: usize, even_batches: bool) -> BatchLoader {
    BatchLoader::random(labeled.to_vec(), batch_size).with_even_batches(even_batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::rngs::StdRng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_sequential_preserves_order() {
        let loader = BatchLoader::sequential(vec![9, 3, 7, 1, 5], 2);
        let mut rng = StdRng::seed_from_u64(0);
        let chunks = loader.epoch_chunks(&mut rng);
        assert_eq!(chunks, vec![vec![9, 3], vec![7, 1], vec![5]]);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn test_random_covers_every_index_once() {
        let indices: Vec<usize> = (0..37).collect();
        let loader = BatchLoader::random(indices.clone(), 8);
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen: Vec<usize> = loader.epoch_chunks(&mut rng).concat();
        seen.sort_unstable();
        assert_eq!(seen, indices);
    }

    #[test]
    fn test_even_batches_trim_odd_tail() {
        let loader = BatchLoader::random((0..13).collect(), 4).with_even_batches(true);
        let mut rng = StdRng::seed_from_u64(2);
        let chunks = loader.epoch_chunks(&mut rng);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() % 2 == 0));
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 12);
        assert_eq!(loader.num_batches(), 4);

        // A tail of one example disappears entirely.
        let loader = BatchLoader::random((0..9).collect(), 4).with_even_batches(true);
        assert_eq!(loader.epoch_chunks(&mut rng).len(), 2);
        assert_eq!(loader.num_batches(), 2);
    }

    #[test]
    fn test_same_seed_same_shuffle() {
        let loader = rebuild_training_loader(&(0..50).collect::<Vec<_>>(), 16, true);
        let a = loader.epoch_chunks(&mut StdRng::seed_from_u64(42));
        let b = loader.epoch_chunks(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_blobs_shape_and_labels() {
        let ds = InMemoryDataset::gaussian_blobs(30, 3, 5, 0.5, 7);
        assert_eq!(ds.len(), 30);
        assert_eq!(ds.feature_dim(), 5);
        assert_eq!(ds.num_classes(), 3);
        assert_eq!(ds.get(4).unwrap().label, 1);
        assert!(ds.get(30).is_none());

        let (train, test) = ds.split(24);
        assert_eq!(train.len(), 24);
        assert_eq!(test.len(), 6);
        assert_eq!(test.num_classes(), 3);
        assert_eq!(test.get(0).unwrap().label, 0);
    }

    #[test]
    fn test_batch_tensors() {
        let ds = InMemoryDataset::new(vec![
            Example { features: vec![1.0, 2.0], label: 0 },
            Example { features: vec![3.0, 4.0], label: 1 },
            Example { features: vec![5.0, 6.0], label: 2 },
        ])
        .unwrap();
        let batch = Batch::gather(&ds, &[2, 0]).unwrap();
        assert_eq!(batch.labels, vec![2, 0]);

        let device = Default::default();
        let x = batch.features_tensor::<TestBackend>(&device);
        assert_eq!(x.dims(), [2, 2]);
        let values: Vec<f32> = x.into_data().to_vec().unwrap();
        assert_eq!(values, vec![5.0, 6.0, 1.0, 2.0]);

        let y: Vec<i64> = batch
            .labels_tensor::<TestBackend>(&device)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(y, vec![2, 0]);
    }

    #[test]
    fn test_gather_out_of_range() {
        let ds = InMemoryDataset::gaussian_blobs(4, 2, 2, 0.1, 0);
        assert!(matches!(
            Batch::gather(&ds, &[0, 4]),
            Err(ActiveLearningError::Dataset(_))
        ));
    }

    #[test]
    fn test_ragged_features_rejected() {
        let result = InMemoryDataset::new(vec![
            Example { features: vec![1.0, 2.0], label: 0 },
            Example { features: vec![3.0], label: 1 },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_jsonl() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(
            &path,
            "{\"features\": [0.5, 1.5], \"label\": 1}\n\n{\"features\": [2.0, -1.0], \"label\": 0}\n",
        )
        .unwrap();

        let ds = InMemoryDataset::from_jsonl(&path).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.feature_dim(), 2);
        assert_eq!(ds.num_classes(), 2);
        assert_eq!(ds.get(0).unwrap().features, vec![0.5, 1.5]);
    }
}
