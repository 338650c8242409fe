//! Staged fit orchestration.
//!
//! A staged fit runs in three steps:
//!
//! 1. **Pretrain** a model with alignment disabled and batches unshared.
//! 2. **Estimate balancing weights** from the pretrained embeddings and
//!    attach them to every dataset as the `balancing_weight` annotation.
//! 3. **Fine-tune** a fresh model, initialised from the pretrained
//!    parameters, with the caller's options and the balancing weights.

use std::path::{Path, PathBuf};

use crate::balance::{
    shared_batch, BalancingWeightEstimator, BalancingWeights, ClusterBalancer, EmbeddingSet,
};
use crate::config::{
    BalanceConfig, CompileConfig, FitConfig, InitConfig, FINETUNE_SUBDIR, PRETRAIN_SUBDIR,
};
use crate::dataset::{Annotation, DatasetCollection, BALANCING_WEIGHT_KEY};
use crate::error::{Result, SccrossError};
use crate::model::Model;

/// Staged fit orchestrator.
///
/// # Example
///
/// ```rust
/// use sccross_rs::{
///     Dataset, DatasetCollection, FitConfig, InitConfig, LinearCrossModel, Matrix,
///     StagedTrainer,
/// };
/// use sccross_rs::config::AlignBurnin;
///
/// # fn main() -> sccross_rs::Result<()> {
/// let rna = Dataset::new(Matrix::new(2, 3, vec![1.0, 0.0, 0.5, 0.0, 1.0, 0.5])?);
/// let atac = Dataset::new(Matrix::new(2, 2, vec![1.0, 0.0, 0.0, 1.0])?);
/// let mut datasets: DatasetCollection = [("rna", rna), ("atac", atac)].into_iter().collect();
///
/// let trainer = StagedTrainer::new(
///     InitConfig { latent_dim: 2, ..Default::default() },
///     Default::default(),
///     FitConfig { max_epochs: 3, align_burnin: AlignBurnin::Epochs(1), ..Default::default() },
///     Default::default(),
/// );
/// let model: LinearCrossModel = trainer.run(&mut datasets)?;
///
/// assert_eq!(model.latent_dim(), 2);
/// assert!(datasets.get("rna").unwrap().dsc_weight()?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StagedTrainer<E = ClusterBalancer> {
    init: InitConfig,
    compile: CompileConfig,
    fit: FitConfig,
    balance: BalanceConfig,
    estimator: E,
}

impl StagedTrainer<ClusterBalancer> {
    /// Create a trainer using the [`ClusterBalancer`] estimator.
    #[must_use]
    pub fn new(
        init: InitConfig,
        compile: CompileConfig,
        fit: FitConfig,
        balance: BalanceConfig,
    ) -> Self {
        Self {
            init,
            compile,
            fit,
            balance,
            estimator: ClusterBalancer,
        }
    }
}

impl<E: BalancingWeightEstimator> StagedTrainer<E> {
    /// Replace the balancing weight estimator.
    #[must_use]
    pub fn with_estimator<F: BalancingWeightEstimator>(self, estimator: F) -> StagedTrainer<F> {
        StagedTrainer {
            init: self.init,
            compile: self.compile,
            fit: self.fit,
            balance: self.balance,
            estimator,
        }
    }

    /// Run the staged fit and return the fine-tuned model.
    ///
    /// On success every dataset carries a numeric `balancing_weight`
    /// annotation and `uns.use_dsc_weight` names it. When
    /// [`FitConfig::directory`] is set, the pretrained and fine-tuned models
    /// are saved to `<dir>/pretrain/pretrain.<ext>` and
    /// `<dir>/fine-tune/fine-tune.<ext>`.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Dataset`] for an empty or invalid collection,
    /// [`SccrossError::Balance`] if the estimator returns weights that do not
    /// cover the datasets, and otherwise the first error raised by the model
    /// or the estimator.
    pub fn run<M: Model>(&self, datasets: &mut DatasetCollection) -> Result<M> {
        if datasets.is_empty() {
            return Err(SccrossError::Dataset(
                "at least one dataset is required".into(),
            ));
        }
        datasets.validate()?;

        tracing::info!("Pretraining SCCROSS model...");
        let pretrain = self.pretrain::<M>(datasets)?;

        tracing::info!("Estimating balancing weight...");
        let weights = self.estimate_weights(&pretrain, datasets)?;
        apply_balancing_weights(datasets, weights)?;

        tracing::info!("Fine-tuning SCCROSS model...");
        self.finetune(&pretrain, datasets)
    }

    fn pretrain<M: Model>(&self, datasets: &DatasetCollection) -> Result<M> {
        let fit = self.fit.for_pretrain();
        let mut model = M::new(datasets, &self.init.for_pretrain())?;
        model.compile(&self.compile)?;
        model.fit(datasets, &fit)?;
        save_artifact(&model, self.fit.directory.as_deref(), PRETRAIN_SUBDIR)?;
        Ok(model)
    }

    fn estimate_weights<M: Model>(
        &self,
        pretrain: &M,
        datasets: &DatasetCollection,
    ) -> Result<BalancingWeights> {
        let mut embeddings = EmbeddingSet::new();
        for (key, dataset) in datasets.iter() {
            embeddings.insert(key.to_string(), pretrain.encode_data(key, dataset)?);
        }
        let use_batch = shared_batch(datasets, self.init.shared_batches);
        if let Some(column) = &use_batch {
            tracing::debug!("Balancing within batches of '{}'", column);
        }
        self.estimator
            .estimate(datasets, &embeddings, use_batch.as_deref(), &self.balance)
    }

    fn finetune<M: Model>(&self, pretrain: &M, datasets: &DatasetCollection) -> Result<M> {
        let fit = self.fit.for_finetune();
        let mut model = M::new(datasets, &self.init)?;
        model.adopt_pretrained_model(pretrain)?;
        model.compile(&self.compile)?;
        model.fit(datasets, &fit)?;
        save_artifact(&model, self.fit.directory.as_deref(), FINETUNE_SUBDIR)?;
        Ok(model)
    }
}

/// Run a staged fit with the default estimator.
///
/// Missing configuration bundles fall back to their defaults.
///
/// # Example
///
/// ```no_run
/// use sccross_rs::{fit_sccross, FitConfig, LinearCrossModel, RunConfig};
///
/// # fn main() -> sccross_rs::Result<()> {
/// let run = RunConfig::from_file("sccross.yaml")?;
/// let mut datasets = run.load_datasets()?;
///
/// let fit = FitConfig {
///     directory: Some("./outputs".into()),
///     ..run.fit.clone()
/// };
/// let model: LinearCrossModel = fit_sccross(&mut datasets, None, None, Some(fit), None)?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// See [`StagedTrainer::run`].
pub fn fit_sccross<M: Model>(
    datasets: &mut DatasetCollection,
    init: Option<InitConfig>,
    compile: Option<CompileConfig>,
    fit: Option<FitConfig>,
    balance: Option<BalanceConfig>,
) -> Result<M> {
    StagedTrainer::new(
        init.unwrap_or_default(),
        compile.unwrap_or_default(),
        fit.unwrap_or_default(),
        balance.unwrap_or_default(),
    )
    .run(datasets)
}

/// Path of the artifact saved for a stage under `directory`.
#[must_use]
pub fn artifact_path<M: Model>(directory: &Path, stage: &str) -> PathBuf {
    directory
        .join(stage)
        .join(format!("{stage}.{}", M::FILE_EXTENSION))
}

fn save_artifact<M: Model>(model: &M, directory: Option<&Path>, stage: &str) -> Result<()> {
    let Some(directory) = directory else {
        return Ok(());
    };
    std::fs::create_dir_all(directory.join(stage))?;
    model.save(&artifact_path::<M>(directory, stage))
}

/// Attach estimated weights as the `balancing_weight` annotation.
fn apply_balancing_weights(
    datasets: &mut DatasetCollection,
    mut weights: BalancingWeights,
) -> Result<()> {
    if !datasets.keys().eq(weights.keys().map(String::as_str)) {
        return Err(SccrossError::Balance(format!(
            "estimator returned weights for {:?}, datasets are {:?}",
            weights.keys().collect::<Vec<_>>(),
            datasets.keys().collect::<Vec<_>>()
        )));
    }
    for (key, dataset) in datasets.iter() {
        let n = weights[key].len();
        if n != dataset.n_obs() {
            return Err(SccrossError::Balance(format!(
                "estimator returned {n} weights for '{key}', which has {} cells",
                dataset.n_obs()
            )));
        }
    }

    for (key, dataset) in datasets.iter_mut() {
        if let Some(w) = weights.remove(key) {
            dataset.insert_obs(BALANCING_WEIGHT_KEY, Annotation::Numeric(w))?;
            dataset.uns.use_dsc_weight = Some(BALANCING_WEIGHT_KEY.to_string());
        }
    }
    Ok(())
}
