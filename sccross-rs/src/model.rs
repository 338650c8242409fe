//! The model capability set consumed by the staged trainer.
//!
//! The trainer never looks inside a model. It constructs two instances of
//! the same [`Model`] type, drives them through `compile` and `fit`, reads
//! embeddings through [`Model::encode_data`] and hands the pretrained
//! parameters over with [`Model::adopt_pretrained_model`].

use std::path::Path;

use crate::config::{CompileConfig, FitConfig, InitConfig};
use crate::dataset::{Dataset, DatasetCollection, Matrix};
use crate::error::Result;

/// A cross-modal embedding model.
///
/// # Example
///
/// ```no_run
/// use sccross_rs::{load_model, LinearCrossModel, Model};
///
/// # fn main() -> sccross_rs::Result<()> {
/// // Resume from the pretrain checkpoint written by a previous run
/// let pretrain: LinearCrossModel = load_model("outputs/pretrain/pretrain.safetensors")?;
/// # Ok(())
/// # }
/// ```
pub trait Model: Sized {
    /// File extension of persisted models, without the dot.
    const FILE_EXTENSION: &'static str;

    /// Build an untrained model sized for `datasets`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or the datasets are unusable.
    fn new(datasets: &DatasetCollection, config: &InitConfig) -> Result<Self>;

    /// Configure optimisation.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    fn compile(&mut self, config: &CompileConfig) -> Result<()>;

    /// Train on `datasets`. Blocks until training finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if training fails.
    fn fit(&mut self, datasets: &DatasetCollection, config: &FitConfig) -> Result<()>;

    /// Embed the cells of the dataset stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is unknown to the model or the dataset does
    /// not match its shape.
    fn encode_data(&self, key: &str, dataset: &Dataset) -> Result<Matrix>;

    /// Take over every learned parameter of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are incompatible.
    fn adopt_pretrained_model(&mut self, source: &Self) -> Result<()>;

    /// Persist the model.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn save(&self, path: &Path) -> Result<()>;

    /// Restore a persisted model.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or does not hold a model of
    /// this type.
    fn load(path: &Path) -> Result<Self>;
}

/// Load a persisted model.
///
/// # Errors
///
/// Returns [`SccrossError::Io`](crate::SccrossError::Io) if the file cannot
/// be read and [`SccrossError::Checkpoint`](crate::SccrossError::Checkpoint)
/// if it does not contain a valid model.
pub fn load_model<M: Model, P: AsRef<Path>>(path: P) -> Result<M> {
    let path = path.as_ref();
    tracing::info!("Loading model from {}", path.display());
    M::load(path)
}
