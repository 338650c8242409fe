//! # sccross-rs
//!
//! Staged training of cross-modal single-cell embedding models.
//!
//! A staged fit pretrains a model on every modality without alignment,
//! estimates per-cell balancing weights from the pretrained embeddings and
//! fine-tunes a second model, initialised from the first, with those weights
//! steering cross-dataset alignment.
//!
//! ## Features
//!
//! - **Staged fit** - Pretrain, weight estimation and fine-tune in one call
//! - **Pluggable models** - Any [`Model`] implementation can be trained
//! - **Pluggable balancing** - Swap the [`BalancingWeightEstimator`]
//! - **YAML run files** - Describe datasets and options in one file
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a sample run file
//! sccross init sccross.yaml
//!
//! # Validate it
//! sccross validate sccross.yaml
//!
//! # Run the staged fit
//! sccross fit sccross.yaml --write-back
//!
//! # Embed a dataset with a trained model
//! sccross encode --model outputs/fine-tune/fine-tune.safetensors --dataset rna \
//!     --input data/rna.json --output data/rna.embedded.json
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use sccross_rs::{fit_sccross, LinearCrossModel, RunConfig};
//!
//! # fn main() -> sccross_rs::Result<()> {
//! let run = RunConfig::from_file("sccross.yaml")?;
//! let mut datasets = run.load_datasets()?;
//!
//! let model: LinearCrossModel = fit_sccross(
//!     &mut datasets,
//!     Some(run.init),
//!     Some(run.compile),
//!     Some(run.fit),
//!     Some(run.balance),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Estimators
//!
//! ```rust
//! use sccross_rs::balance::{BalancingWeightEstimator, BalancingWeights, EmbeddingSet};
//! use sccross_rs::{BalanceConfig, DatasetCollection, StagedTrainer};
//!
//! /// Every cell counts the same.
//! struct Uniform;
//!
//! impl BalancingWeightEstimator for Uniform {
//!     fn estimate(
//!         &self,
//!         datasets: &DatasetCollection,
//!         _embeddings: &EmbeddingSet,
//!         _use_batch: Option<&str>,
//!         _config: &BalanceConfig,
//!     ) -> sccross_rs::Result<BalancingWeights> {
//!         Ok(datasets
//!             .iter()
//!             .map(|(k, d)| (k.to_string(), vec![1.0; d.n_obs()]))
//!             .collect())
//!     }
//! }
//!
//! let trainer = StagedTrainer::new(
//!     Default::default(),
//!     Default::default(),
//!     Default::default(),
//!     Default::default(),
//! )
//! .with_estimator(Uniform);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod models;
pub mod trainer;

pub use balance::{BalancingWeightEstimator, ClusterBalancer, EmbeddingSet};
pub use config::{BalanceConfig, CompileConfig, FitConfig, InitConfig, RunConfig};
pub use dataset::{
    configure_dataset, Annotation, Dataset, DatasetCollection, DatasetSettings, Matrix,
    BALANCING_WEIGHT_KEY,
};
pub use error::{Result, SccrossError};
pub use model::{load_model, Model};
pub use models::LinearCrossModel;
pub use trainer::{fit_sccross, StagedTrainer};
