//! Annotated single-cell datasets.
//!
//! A [`Dataset`] holds one modality: a cells × features observation matrix,
//! per-cell annotations (`obs`), per-cell multi-dimensional arrays (`obsm`)
//! and the settings the trainer reads (`uns`). A [`DatasetCollection`] maps
//! dataset keys to datasets in sorted key order.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SccrossError};

/// Per-cell annotation holding the balancing weights written by the trainer.
pub const BALANCING_WEIGHT_KEY: &str = "balancing_weight";

/// Row-major dense `f32` matrix.
///
/// # Example
///
/// ```rust
/// use sccross_rs::Matrix;
///
/// let m = Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
/// assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
/// assert_eq!(m.data()[2], 3.0);
/// assert!(Matrix::new(2, 2, vec![1.0]).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MatrixRepr")]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct MatrixRepr {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl TryFrom<MatrixRepr> for Matrix {
    type Error = SccrossError;

    fn try_from(repr: MatrixRepr) -> Result<Self> {
        Self::new(repr.rows, repr.cols, repr.data)
    }
}

impl Matrix {
    /// Build a matrix from row-major data.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] if `data.len() != rows * cols` or
    /// the shape overflows.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        let len = rows.checked_mul(cols).ok_or_else(|| {
            SccrossError::Dataset(format!("matrix shape {rows} x {cols} overflows"))
        })?;
        if data.len() != len {
            return Err(SccrossError::Dataset(format!(
                "matrix data has {} values, expected {rows} x {cols}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from equally long rows.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] on ragged rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|r| r.len() != cols) {
            return Err(SccrossError::Dataset(format!(
                "row {bad} has {} values, expected {cols}",
                rows[bad].len()
            )));
        }
        Self::new(rows.len(), cols, rows.concat())
    }

    /// Number of rows (cells).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major values.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// One row.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.rows()`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Iterate over rows.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on a zero chunk size
        self.data.chunks_exact(self.cols.max(1)).take(self.rows)
    }

    /// Copy into a `(rows, cols)` tensor.
    ///
    /// # Errors
    ///
    /// Returns a candle error if the tensor cannot be allocated.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.data, (self.rows, self.cols), device)?)
    }

    /// Copy a 2-D `f32` tensor.
    ///
    /// # Errors
    ///
    /// Returns a candle error if the tensor is not 2-D `f32`.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (rows, cols) = tensor.dims2()?;
        let data = tensor.flatten_all()?.to_vec1::<f32>()?;
        Self::new(rows, cols, data)
    }
}

/// A per-cell annotation column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "values")]
pub enum Annotation {
    /// Categorical labels such as batch or cell type.
    Categorical(Vec<String>),
    /// Numeric values such as balancing weights.
    Numeric(Vec<f32>),
}

impl Annotation {
    /// Number of cells covered.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Annotation::Categorical(v) => v.len(),
            Annotation::Numeric(v) => v.len(),
        }
    }

    /// Whether the column is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Categorical labels, if this is a categorical column.
    #[must_use]
    pub fn as_categorical(&self) -> Option<&[String]> {
        match self {
            Annotation::Categorical(v) => Some(v),
            Annotation::Numeric(_) => None,
        }
    }

    /// Numeric values, if this is a numeric column.
    #[must_use]
    pub fn as_numeric(&self) -> Option<&[f32]> {
        match self {
            Annotation::Numeric(v) => Some(v),
            Annotation::Categorical(_) => None,
        }
    }
}

/// Dataset-level settings read by models and the trainer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// Categorical `obs` column with batch membership.
    #[serde(default)]
    pub use_batch: Option<String>,

    /// Categorical `obs` column with cell types.
    #[serde(default)]
    pub use_cell_type: Option<String>,

    /// Numeric `obs` column with per-cell alignment weights.
    #[serde(default)]
    pub use_dsc_weight: Option<String>,
}

/// One modality of a multi-omics experiment.
///
/// # Example
///
/// ```rust
/// use sccross_rs::{Annotation, Dataset, Matrix};
///
/// # fn main() -> sccross_rs::Result<()> {
/// let x = Matrix::new(3, 2, vec![0.0, 1.0, 1.0, 0.0, 0.5, 0.5])?;
/// let mut rna = Dataset::new(x);
/// rna.insert_obs(
///     "batch",
///     Annotation::Categorical(vec!["a".into(), "a".into(), "b".into()]),
/// )?;
/// assert_eq!(rna.n_obs(), 3);
/// assert_eq!(rna.n_vars(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Observation matrix, cells × features.
    pub x: Matrix,

    /// Per-cell annotations.
    #[serde(default)]
    pub obs: BTreeMap<String, Annotation>,

    /// Per-cell multi-dimensional arrays.
    #[serde(default)]
    pub obsm: BTreeMap<String, Matrix>,

    /// Settings namespace.
    #[serde(default)]
    pub uns: DatasetSettings,
}

impl Dataset {
    /// Wrap an observation matrix with empty annotations.
    #[must_use]
    pub fn new(x: Matrix) -> Self {
        Self {
            x,
            obs: BTreeMap::new(),
            obsm: BTreeMap::new(),
            uns: DatasetSettings::default(),
        }
    }

    /// Number of cells.
    #[must_use]
    pub fn n_obs(&self) -> usize {
        self.x.rows()
    }

    /// Number of features.
    #[must_use]
    pub fn n_vars(&self) -> usize {
        self.x.cols()
    }

    /// Add or replace a per-cell annotation.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] if the column length differs from
    /// the number of cells.
    pub fn insert_obs(&mut self, key: impl Into<String>, annotation: Annotation) -> Result<()> {
        let key = key.into();
        if annotation.len() != self.n_obs() {
            return Err(SccrossError::Dataset(format!(
                "obs '{key}' has {} entries, expected {}",
                annotation.len(),
                self.n_obs()
            )));
        }
        self.obs.insert(key, annotation);
        Ok(())
    }

    /// Add or replace a per-cell array.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] if the row count differs from the
    /// number of cells.
    pub fn insert_obsm(&mut self, key: impl Into<String>, value: Matrix) -> Result<()> {
        let key = key.into();
        if value.rows() != self.n_obs() {
            return Err(SccrossError::Dataset(format!(
                "obsm '{key}' has {} rows, expected {}",
                value.rows(),
                self.n_obs()
            )));
        }
        self.obsm.insert(key, value);
        Ok(())
    }

    /// Categorical column lookup.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] if the column is missing or numeric.
    pub fn categorical(&self, key: &str) -> Result<&[String]> {
        self.obs
            .get(key)
            .ok_or_else(|| SccrossError::Dataset(format!("obs '{key}' not found")))?
            .as_categorical()
            .ok_or_else(|| SccrossError::Dataset(format!("obs '{key}' is not categorical")))
    }

    /// Numeric column lookup.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] if the column is missing or
    /// categorical.
    pub fn numeric(&self, key: &str) -> Result<&[f32]> {
        self.obs
            .get(key)
            .ok_or_else(|| SccrossError::Dataset(format!("obs '{key}' not found")))?
            .as_numeric()
            .ok_or_else(|| SccrossError::Dataset(format!("obs '{key}' is not numeric")))
    }

    /// Per-cell alignment weights named by `uns.use_dsc_weight`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] if the setting names a missing or
    /// non-numeric column.
    pub fn dsc_weight(&self) -> Result<Option<&[f32]>> {
        self.uns
            .use_dsc_weight
            .as_deref()
            .map(|key| self.numeric(key))
            .transpose()
    }

    /// Check that annotations match the cell count and that every column
    /// named in `uns` exists with the right kind.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] describing the first mismatch.
    pub fn validate(&self) -> Result<()> {
        for (key, annotation) in &self.obs {
            if annotation.len() != self.n_obs() {
                return Err(SccrossError::Dataset(format!(
                    "obs '{key}' has {} entries, expected {}",
                    annotation.len(),
                    self.n_obs()
                )));
            }
        }
        for (key, value) in &self.obsm {
            if value.rows() != self.n_obs() {
                return Err(SccrossError::Dataset(format!(
                    "obsm '{key}' has {} rows, expected {}",
                    value.rows(),
                    self.n_obs()
                )));
            }
        }
        if let Some(key) = &self.uns.use_batch {
            self.categorical(key)?;
        }
        if let Some(key) = &self.uns.use_cell_type {
            self.categorical(key)?;
        }
        self.dsc_weight()?;
        Ok(())
    }

    /// Read a dataset from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SccrossError::Dataset(format!(
                "Dataset not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let dataset: Self = serde_json::from_str(&content)?;
        dataset.validate()?;
        Ok(dataset)
    }

    /// Write the dataset as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Install dataset settings after checking the columns they reference.
///
/// # Example
///
/// ```rust
/// use sccross_rs::{configure_dataset, Annotation, Dataset, DatasetSettings, Matrix};
///
/// # fn main() -> sccross_rs::Result<()> {
/// let mut atac = Dataset::new(Matrix::new(2, 1, vec![0.0, 1.0])?);
/// atac.insert_obs("batch", Annotation::Categorical(vec!["s1".into(), "s2".into()]))?;
///
/// configure_dataset(
///     &mut atac,
///     DatasetSettings {
///         use_batch: Some("batch".into()),
///         ..Default::default()
///     },
/// )?;
/// assert_eq!(atac.uns.use_batch.as_deref(), Some("batch"));
///
/// let missing = DatasetSettings {
///     use_cell_type: Some("cell_type".into()),
///     ..Default::default()
/// };
/// assert!(configure_dataset(&mut atac, missing).is_err());
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns [`SccrossError::Dataset`] if a referenced column is missing or of
/// the wrong kind; the dataset is left unchanged in that case.
pub fn configure_dataset(dataset: &mut Dataset, settings: DatasetSettings) -> Result<()> {
    let previous = std::mem::replace(&mut dataset.uns, settings);
    if let Err(e) = dataset.validate() {
        dataset.uns = previous;
        return Err(e);
    }
    Ok(())
}

/// Datasets keyed by name, iterated in sorted key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetCollection {
    datasets: BTreeMap<String, Dataset>,
}

impl DatasetCollection {
    /// Empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a dataset.
    pub fn insert(&mut self, key: impl Into<String>, dataset: Dataset) -> Option<Dataset> {
        self.datasets.insert(key.into(), dataset)
    }

    /// Dataset lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Dataset> {
        self.datasets.get(key)
    }

    /// Mutable dataset lookup.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Dataset> {
        self.datasets.get_mut(key)
    }

    /// Number of datasets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Dataset keys in iteration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// `(key, dataset)` pairs in iteration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dataset)> {
        self.datasets.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Mutable `(key, dataset)` pairs in iteration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Dataset)> {
        self.datasets.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Validate every dataset.
    ///
    /// # Errors
    ///
    /// Returns the first failure, prefixed with the dataset key.
    pub fn validate(&self) -> Result<()> {
        for (key, dataset) in self.iter() {
            dataset
                .validate()
                .map_err(|e| SccrossError::Dataset(format!("'{key}': {e}")))?;
        }
        Ok(())
    }
}

impl<K: Into<String>> FromIterator<(K, Dataset)> for DatasetCollection {
    fn from_iter<I: IntoIterator<Item = (K, Dataset)>>(iter: I) -> Self {
        Self {
            datasets: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn toy_dataset(n_obs: usize) -> Dataset {
        let data = (0..n_obs * 2).map(|i| i as f32).collect();
        Dataset::new(Matrix::new(n_obs, 2, data).unwrap())
    }

    #[test]
    fn test_matrix_shape_check() {
        assert!(Matrix::new(2, 2, vec![0.0; 4]).is_ok());
        assert!(Matrix::new(2, 2, vec![0.0; 3]).is_err());
        assert!(Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn test_matrix_deserialize_checks_shape() {
        let ok = r#"{"rows": 1, "cols": 2, "data": [1.0, 2.0]}"#;
        assert!(serde_json::from_str::<Matrix>(ok).is_ok());

        let bad = r#"{"rows": 2, "cols": 2, "data": [1.0, 2.0]}"#;
        assert!(serde_json::from_str::<Matrix>(bad).is_err());
    }

    #[test]
    fn test_matrix_shape_overflow_rejected() {
        let result = Matrix::new(usize::MAX / 2 + 1, 2, vec![]);
        assert!(matches!(result, Err(SccrossError::Dataset(_))));

        let huge = r#"{"rows": 9223372036854775808, "cols": 2, "data": []}"#;
        assert!(serde_json::from_str::<Matrix>(huge).is_err());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.json");
        std::fs::write(&path, format!(r#"{{"x": {huge}}}"#)).unwrap();
        assert!(Dataset::from_file(&path).is_err());
    }

    #[test]
    fn test_matrix_rows() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let rows: Vec<&[f32]> = m.iter_rows().collect();
        assert_eq!(rows, vec![&[1.0, 2.0][..], &[3.0, 4.0][..]]);
    }

    #[test]
    fn test_matrix_tensor_roundtrip() {
        let m = Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = m.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 3]);
        assert_eq!(Matrix::from_tensor(&t).unwrap(), m);
    }

    #[test]
    fn test_insert_obs_length_check() {
        let mut d = toy_dataset(3);
        assert!(d.insert_obs("w", Annotation::Numeric(vec![1.0; 3])).is_ok());
        assert!(d.insert_obs("w", Annotation::Numeric(vec![1.0; 2])).is_err());
        assert!(d.insert_obsm("emb", Matrix::new(2, 1, vec![0.0; 2]).unwrap()).is_err());
    }

    #[test]
    fn test_column_kinds() {
        let mut d = toy_dataset(2);
        d.insert_obs("batch", Annotation::Categorical(vec!["a".into(), "b".into()]))
            .unwrap();
        assert!(d.categorical("batch").is_ok());
        assert!(d.numeric("batch").is_err());
        assert!(d.categorical("missing").is_err());
    }

    #[test]
    fn test_dsc_weight_lookup() {
        let mut d = toy_dataset(2);
        assert_eq!(d.dsc_weight().unwrap(), None);

        d.uns.use_dsc_weight = Some(BALANCING_WEIGHT_KEY.into());
        assert!(d.dsc_weight().is_err());

        d.insert_obs(BALANCING_WEIGHT_KEY, Annotation::Numeric(vec![0.5, 1.5]))
            .unwrap();
        assert_eq!(d.dsc_weight().unwrap(), Some(&[0.5, 1.5][..]));
    }

    #[test]
    fn test_configure_dataset_rolls_back() {
        let mut d = toy_dataset(2);
        let settings = DatasetSettings {
            use_batch: Some("batch".into()),
            ..Default::default()
        };
        assert!(configure_dataset(&mut d, settings).is_err());
        assert_eq!(d.uns, DatasetSettings::default());
    }

    #[test]
    fn test_dataset_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rna.json");

        let mut d = toy_dataset(2);
        d.insert_obs("batch", Annotation::Categorical(vec!["a".into(), "b".into()]))
            .unwrap();
        d.uns.use_batch = Some("batch".into());
        d.to_file(&path).unwrap();

        assert_eq!(Dataset::from_file(&path).unwrap(), d);
    }

    #[test]
    fn test_dataset_missing_file() {
        let result = Dataset::from_file("/nonexistent/rna.json");
        assert!(matches!(result, Err(SccrossError::Dataset(_))));
    }

    #[test]
    fn test_collection_order_is_sorted() {
        let datasets: DatasetCollection = [("rna", toy_dataset(1)), ("atac", toy_dataset(1))]
            .into_iter()
            .collect();
        let keys: Vec<&str> = datasets.keys().collect();
        assert_eq!(keys, vec!["atac", "rna"]);
    }

    #[test]
    fn test_collection_validate_names_dataset() {
        let mut bad = toy_dataset(2);
        bad.uns.use_batch = Some("batch".into());
        let datasets: DatasetCollection = [("atac", bad)].into_iter().collect();
        let err = datasets.validate().unwrap_err();
        assert!(err.to_string().contains("'atac'"));
    }
}
