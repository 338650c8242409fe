//! Balancing weight estimation.
//!
//! Balancing weights tell the fine-tune stage how much each cell should
//! count in cross-dataset alignment. Cells whose neighbourhood has no
//! counterpart in the other modalities receive little weight; cells from
//! over-represented populations are scaled down.
//!
//! Embeddings are passed explicitly through an [`EmbeddingSet`], so the
//! datasets never carry a temporary embedding annotation.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::BalanceConfig;
use crate::dataset::{DatasetCollection, Matrix};
use crate::error::{Result, SccrossError};

/// Per-dataset embeddings keyed like the [`DatasetCollection`].
pub type EmbeddingSet = BTreeMap<String, Matrix>;

/// Per-dataset balancing weights, one value per cell.
pub type BalancingWeights = BTreeMap<String, Vec<f32>>;

/// Computes per-cell balancing weights from embeddings.
pub trait BalancingWeightEstimator {
    /// Estimate weights for every dataset.
    ///
    /// `use_batch` names a categorical `obs` column shared by all datasets;
    /// weights are normalised within each batch when it is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the embeddings do not
    /// match the datasets.
    fn estimate(
        &self,
        datasets: &DatasetCollection,
        embeddings: &EmbeddingSet,
        use_batch: Option<&str>,
        config: &BalanceConfig,
    ) -> Result<BalancingWeights>;
}

/// Pick the batch column shared by all datasets.
///
/// Returns `None` unless `shared_batches` is set and every dataset names the
/// same `use_batch` column. Disagreeing datasets fall back to `None` with a
/// warning.
///
/// # Example
///
/// ```rust
/// use sccross_rs::balance::shared_batch;
/// use sccross_rs::{Dataset, DatasetCollection, Matrix};
///
/// let mut rna = Dataset::new(Matrix::new(0, 1, vec![]).unwrap());
/// rna.uns.use_batch = Some("batch".into());
/// let atac = rna.clone();
/// let datasets: DatasetCollection = [("rna", rna), ("atac", atac)].into_iter().collect();
///
/// assert_eq!(shared_batch(&datasets, true).as_deref(), Some("batch"));
/// assert_eq!(shared_batch(&datasets, false), None);
/// ```
#[must_use]
pub fn shared_batch(datasets: &DatasetCollection, shared_batches: bool) -> Option<String> {
    if !shared_batches {
        return None;
    }
    let mut values: BTreeSet<Option<&str>> = datasets
        .iter()
        .map(|(_, d)| d.uns.use_batch.as_deref())
        .collect();
    if values.len() == 1 {
        return values.pop_first().flatten().map(str::to_string);
    }
    tracing::warn!(
        "shared_batches requested but datasets disagree on use_batch ({:?}); \
         estimating balancing weights without batches",
        values
    );
    None
}

/// Cluster-level balancing.
///
/// Each dataset's embedding is clustered with k-means. A cluster scores the
/// sum, over the other datasets, of its best cosine similarity to their
/// centroids (zeroed below `cutoff`, raised to `power`). A cell receives its
/// cluster's score divided by the cluster size, and weights are rescaled to
/// average 1 within each dataset and batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterBalancer;

impl BalancingWeightEstimator for ClusterBalancer {
    fn estimate(
        &self,
        datasets: &DatasetCollection,
        embeddings: &EmbeddingSet,
        use_batch: Option<&str>,
        config: &BalanceConfig,
    ) -> Result<BalancingWeights> {
        config.validate()?;
        check_embeddings(datasets, embeddings)?;

        let clusterings: BTreeMap<&str, Clustering> = embeddings
            .iter()
            .map(|(key, emb)| (key.as_str(), kmeans(emb, config.n_clusters, config.max_iter)))
            .collect();

        let mut weights = BalancingWeights::new();
        for (key, dataset) in datasets.iter() {
            let own = &clusterings[key];
            let scores: Vec<f32> = own
                .centroids
                .iter()
                .map(|centroid| {
                    if clusterings.len() == 1 {
                        return 1.0;
                    }
                    clusterings
                        .iter()
                        .filter(|(other, _)| **other != key)
                        .map(|(_, c)| best_similarity(centroid, &c.centroids, config))
                        .sum()
                })
                .collect();

            let raw: Vec<f32> = own
                .labels
                .iter()
                .map(|&l| scores[l] / own.sizes[l] as f32)
                .collect();

            let groups = match use_batch {
                Some(column) => dataset.categorical(column)?.to_vec(),
                None => vec![String::new(); dataset.n_obs()],
            };
            let normalized = normalize_by_group(&raw, &groups);
            tracing::debug!(
                "Balancing weights for '{}': {} cells, {} clusters",
                key,
                normalized.len(),
                own.centroids.len()
            );
            weights.insert(key.to_string(), normalized);
        }
        Ok(weights)
    }
}

fn check_embeddings(datasets: &DatasetCollection, embeddings: &EmbeddingSet) -> Result<()> {
    if !datasets.keys().eq(embeddings.keys().map(String::as_str)) {
        return Err(SccrossError::Balance(format!(
            "embeddings cover {:?}, datasets are {:?}",
            embeddings.keys().collect::<Vec<_>>(),
            datasets.keys().collect::<Vec<_>>()
        )));
    }
    for (key, dataset) in datasets.iter() {
        let rows = embeddings[key].rows();
        if rows != dataset.n_obs() {
            return Err(SccrossError::Balance(format!(
                "embedding of '{key}' has {rows} rows, dataset has {} cells",
                dataset.n_obs()
            )));
        }
    }
    Ok(())
}

fn best_similarity(centroid: &[f32], others: &[Vec<f32>], config: &BalanceConfig) -> f32 {
    others
        .iter()
        .map(|other| {
            let sim = cosine(centroid, other);
            if sim < config.cutoff {
                0.0
            } else {
                sim.powf(config.power)
            }
        })
        .fold(0.0, f32::max)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Rescale so that weights average 1 within each group. A group whose
/// weights sum to zero gets uniform weights.
fn normalize_by_group(raw: &[f32], groups: &[String]) -> Vec<f32> {
    let mut totals: BTreeMap<&str, (f32, usize)> = BTreeMap::new();
    for (w, g) in raw.iter().zip(groups) {
        let entry = totals.entry(g.as_str()).or_insert((0.0, 0));
        entry.0 += w;
        entry.1 += 1;
    }
    raw.iter()
        .zip(groups)
        .map(|(w, g)| {
            let (sum, count) = totals[g.as_str()];
            if sum > 0.0 {
                w * count as f32 / sum
            } else {
                1.0
            }
        })
        .collect()
}

#[derive(Debug)]
struct Clustering {
    labels: Vec<usize>,
    centroids: Vec<Vec<f32>>,
    sizes: Vec<usize>,
}

/// Lloyd's k-means with evenly spaced initial centroids.
fn kmeans(data: &Matrix, n_clusters: usize, max_iter: usize) -> Clustering {
    let n = data.rows();
    let k = n_clusters.min(n);
    let mut centroids: Vec<Vec<f32>> = (0..k).map(|c| data.row(c * n / k).to_vec()).collect();
    let mut labels = vec![0usize; n];

    for iter in 0..max_iter.max(1) {
        let mut changed = iter == 0;
        for (label, row) in labels.iter_mut().zip(data.iter_rows()) {
            let nearest = nearest_centroid(row, &centroids);
            if nearest != *label {
                *label = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f32; data.cols()]; k];
        let mut counts = vec![0usize; k];
        for (row, &l) in data.iter_rows().zip(&labels) {
            counts[l] += 1;
            for (s, v) in sums[l].iter_mut().zip(row) {
                *s += v;
            }
        }
        for ((centroid, sum), &count) in centroids.iter_mut().zip(sums).zip(&counts) {
            // empty clusters keep their previous centroid
            if count > 0 {
                *centroid = sum.into_iter().map(|s| s / count as f32).collect();
            }
        }
    }

    let mut sizes = vec![0usize; k];
    for &l in &labels {
        sizes[l] += 1;
    }
    Clustering {
        labels,
        centroids,
        sizes,
    }
}

fn nearest_centroid(row: &[f32], centroids: &[Vec<f32>]) -> usize {
    centroids
        .iter()
        .map(|c| c.iter().zip(row).map(|(a, b)| (a - b) * (a - b)).sum::<f32>())
        .enumerate()
        .fold((0, f32::INFINITY), |best, (i, d)| if d < best.1 { (i, d) } else { best })
        .0
}
