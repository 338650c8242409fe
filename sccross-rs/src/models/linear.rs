//! Linear cross-modal autoencoder.
//!
//! Every dataset gets its own linear encoder into a shared latent space and
//! a linear decoder back to its features. Training minimises reconstruction
//! error and, once alignment is active, the distance between the
//! balancing-weighted mean embeddings of the datasets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::config::{CompileConfig, FitConfig, InitConfig};
use crate::dataset::{Dataset, DatasetCollection, Matrix};
use crate::error::{Result, SccrossError};
use crate::model::Model;

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u32 = 1;

const VERSION_KEY: &str = "format_version";
const HEADER_KEY: &str = "sccross_model";

/// Loss summary of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Total weighted loss.
    pub loss: f64,
    /// Unweighted alignment loss (zero while alignment is inactive).
    pub align_loss: f64,
    /// Whether the alignment term was part of the loss.
    pub aligning: bool,
}

/// Reference [`Model`] implementation.
///
/// # Example
///
/// ```rust
/// use sccross_rs::{Dataset, DatasetCollection, InitConfig, LinearCrossModel, Matrix, Model};
///
/// # fn main() -> sccross_rs::Result<()> {
/// let rna = Dataset::new(Matrix::new(2, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0])?);
/// let datasets: DatasetCollection = [("rna", rna)].into_iter().collect();
///
/// let init = InitConfig { latent_dim: 2, ..Default::default() };
/// let model = LinearCrossModel::new(&datasets, &init)?;
///
/// let z = model.encode_data("rna", datasets.get("rna").unwrap())?;
/// assert_eq!((z.rows(), z.cols()), (2, 2));
/// # Ok(())
/// # }
/// ```
pub struct LinearCrossModel {
    init: InitConfig,
    features: BTreeMap<String, usize>,
    varmap: VarMap,
    encoders: BTreeMap<String, Linear>,
    decoders: BTreeMap<String, Linear>,
    compile: Option<CompileConfig>,
    history: Vec<EpochRecord>,
    device: Device,
}

impl fmt::Debug for LinearCrossModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearCrossModel")
            .field("latent_dim", &self.init.latent_dim)
            .field("features", &self.features)
            .field("compiled", &self.compile.is_some())
            .field("epochs_trained", &self.history.len())
            .finish()
    }
}

impl LinearCrossModel {
    fn build(features: BTreeMap<String, usize>, init: InitConfig) -> Result<Self> {
        if init.latent_dim == 0 {
            return Err(SccrossError::Model("latent_dim must be > 0".into()));
        }
        if features.is_empty() {
            return Err(SccrossError::Model("no datasets to model".into()));
        }

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut encoders = BTreeMap::new();
        let mut decoders = BTreeMap::new();
        for (key, &n_vars) in &features {
            let vb = vb.pp(key.as_str());
            encoders.insert(
                key.clone(),
                candle_nn::linear(n_vars, init.latent_dim, vb.pp("encoder"))?,
            );
            decoders.insert(
                key.clone(),
                candle_nn::linear(init.latent_dim, n_vars, vb.pp("decoder"))?,
            );
        }

        Ok(Self {
            init,
            features,
            varmap,
            encoders,
            decoders,
            compile: None,
            history: Vec::new(),
            device,
        })
    }

    /// Latent space dimension.
    #[must_use]
    pub fn latent_dim(&self) -> usize {
        self.init.latent_dim
    }

    /// Feature count per dataset key.
    #[must_use]
    pub fn features(&self) -> &BTreeMap<String, usize> {
        &self.features
    }

    /// Per-epoch losses of every `fit` call so far.
    #[must_use]
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    /// Flattened copy of every parameter, keyed by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter store cannot be read.
    pub fn parameters(&self) -> Result<BTreeMap<String, Vec<f32>>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| SccrossError::Model("parameter store lock poisoned".into()))?;
        let mut params = BTreeMap::new();
        for (name, var) in vars.iter() {
            params.insert(
                name.clone(),
                var.as_tensor().flatten_all()?.to_vec1::<f32>()?,
            );
        }
        Ok(params)
    }

    fn write_checkpoint(&self, path: &Path, version: u32) -> Result<()> {
        let header = serde_json::to_string(&ModelHeader {
            init: self.init.clone(),
            features: self.features.clone(),
        })?;
        let metadata: HashMap<String, String> = [
            (VERSION_KEY.to_string(), version.to_string()),
            (HEADER_KEY.to_string(), header),
        ]
        .into_iter()
        .collect();

        let tensors: Vec<(String, Tensor)> = {
            let vars = self
                .varmap
                .data()
                .lock()
                .map_err(|_| SccrossError::Model("parameter store lock poisoned".into()))?;
            vars.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };

        safetensors::tensor::serialize_to_file(tensors, &Some(metadata), path)
            .map_err(|e| SccrossError::Checkpoint(format!("Failed to save model: {e}")))?;
        Ok(())
    }

    fn check_dataset(&self, key: &str, dataset: &Dataset) -> Result<()> {
        let expected = self
            .features
            .get(key)
            .ok_or_else(|| SccrossError::Model(format!("unknown dataset '{key}'")))?;
        if dataset.n_vars() != *expected {
            return Err(SccrossError::Model(format!(
                "dataset '{key}' has {} features, model expects {expected}",
                dataset.n_vars()
            )));
        }
        Ok(())
    }
}

/// Per-cell weights for the weighted mean embedding, summing to 1.
fn alignment_weights(key: &str, dataset: &Dataset) -> Result<Vec<f32>> {
    let n = dataset.n_obs();
    let Some(weights) = dataset.dsc_weight()? else {
        return Ok(vec![1.0 / n as f32; n]);
    };
    let total: f32 = weights.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(SccrossError::Training(format!(
            "alignment weights of '{key}' must have a positive finite sum, got {total}"
        )));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Model options stored in the checkpoint metadata.
#[derive(Debug, Serialize, Deserialize)]
struct ModelHeader {
    init: InitConfig,
    features: BTreeMap<String, usize>,
}

impl Model for LinearCrossModel {
    const FILE_EXTENSION: &'static str = "safetensors";

    fn new(datasets: &DatasetCollection, config: &InitConfig) -> Result<Self> {
        let features = datasets
            .iter()
            .map(|(key, d)| (key.to_string(), d.n_vars()))
            .collect();
        Self::build(features, config.clone())
    }

    fn compile(&mut self, config: &CompileConfig) -> Result<()> {
        if config.lr <= 0.0 {
            return Err(SccrossError::Config("lr must be > 0".into()));
        }
        self.compile = Some(config.clone());
        Ok(())
    }

    fn fit(&mut self, datasets: &DatasetCollection, config: &FitConfig) -> Result<()> {
        let compile = self
            .compile
            .clone()
            .ok_or_else(|| SccrossError::Training("model must be compiled before fit".into()))?;

        let mut inputs = Vec::with_capacity(datasets.len());
        for (key, dataset) in datasets.iter() {
            self.check_dataset(key, dataset)?;
            if dataset.n_obs() == 0 {
                return Err(SccrossError::Training(format!("dataset '{key}' has no cells")));
            }
            let x = dataset.x.to_tensor(&self.device)?;
            let w = Tensor::from_vec(
                alignment_weights(key, dataset)?,
                (dataset.n_obs(), 1),
                &self.device,
            )?;
            inputs.push((key, x, w));
        }

        if let Some(directory) = &config.directory {
            std::fs::create_dir_all(directory)?;
        }

        let mut optimizer = AdamW::new(
            self.varmap.all_vars(),
            ParamsAdamW {
                lr: compile.lr,
                weight_decay: compile.weight_decay,
                ..ParamsAdamW::default()
            },
        )?;

        tracing::info!(
            "Fitting {} datasets for up to {} epochs (align burn-in: {})",
            inputs.len(),
            config.max_epochs,
            config.align_burnin
        );

        let pb = ProgressBar::new(config.max_epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")?
                .progress_chars("#>-"),
        );

        let mut best = f64::INFINITY;
        let mut stale = 0usize;
        for epoch in 0..config.max_epochs {
            let aligning = config.align_burnin.is_aligning(epoch);

            let mut recon = Tensor::zeros((), DType::F32, &self.device)?;
            let mut means = Vec::with_capacity(inputs.len());
            for (key, x, w) in &inputs {
                let z = self.encoders[*key].forward(x)?;
                let x_hat = self.decoders[*key].forward(&z)?;
                recon = (recon + candle_nn::loss::mse(&x_hat, x)?)?;
                if aligning {
                    means.push(w.broadcast_mul(&z)?.sum(0)?);
                }
            }

            let mut loss = (recon * compile.lam_data)?;
            let mut align_loss = 0.0;
            if means.len() > 1 {
                let mut align = Tensor::zeros((), DType::F32, &self.device)?;
                for (i, a) in means.iter().enumerate() {
                    for b in &means[i + 1..] {
                        align = (align + (a - b)?.sqr()?.sum_all()?)?;
                    }
                }
                align_loss = f64::from(align.to_scalar::<f32>()?);
                loss = (loss + (align * compile.lam_align)?)?;
            }

            optimizer.backward_step(&loss)?;
            let loss_value = f64::from(loss.to_scalar::<f32>()?);
            if !loss_value.is_finite() {
                pb.abandon();
                return Err(SccrossError::Training(format!(
                    "loss is not finite at epoch {epoch}"
                )));
            }

            self.history.push(EpochRecord {
                epoch,
                loss: loss_value,
                align_loss,
                aligning,
            });
            pb.set_message(format!("{loss_value:.4}"));
            pb.inc(1);
            if epoch % 10 == 0 {
                tracing::debug!(
                    "Epoch {}, Loss: {:.4}, Align: {:.4}",
                    epoch,
                    loss_value,
                    align_loss
                );
            }

            // early stopping only watches the loss once alignment has
            // started when safe_burnin is set
            if let Some(patience) = config.patience {
                if !config.safe_burnin || aligning {
                    if loss_value < best - config.min_delta {
                        best = loss_value;
                        stale = 0;
                    } else {
                        stale += 1;
                        if stale >= patience {
                            tracing::info!("Early stopping at epoch {}", epoch + 1);
                            break;
                        }
                    }
                }
            }
        }

        pb.finish_with_message("Training complete");
        Ok(())
    }

    fn encode_data(&self, key: &str, dataset: &Dataset) -> Result<Matrix> {
        self.check_dataset(key, dataset)?;
        let x = dataset.x.to_tensor(&self.device)?;
        let z = self.encoders[key].forward(&x)?;
        Matrix::from_tensor(&z)
    }

    fn adopt_pretrained_model(&mut self, source: &Self) -> Result<()> {
        let source_vars = source
            .varmap
            .data()
            .lock()
            .map_err(|_| SccrossError::Model("parameter store lock poisoned".into()))?;
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| SccrossError::Model("parameter store lock poisoned".into()))?;

        let mut adopted = 0usize;
        for (name, var) in vars.iter() {
            match source_vars.get(name) {
                Some(src) if src.dims() == var.dims() => {
                    var.set(src.as_tensor())?;
                    adopted += 1;
                }
                _ => tracing::warn!("Parameter '{}' not adopted from pretrained model", name),
            }
        }
        if adopted == 0 {
            return Err(SccrossError::Model(
                "pretrained model shares no parameters with this model".into(),
            ));
        }
        tracing::info!(
            "Adopted {}/{} parameters from pretrained model",
            adopted,
            vars.len()
        );
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.write_checkpoint(path, CHECKPOINT_VERSION)?;
        tracing::info!("Saved model to: {}", path.display());
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let buffer = std::fs::read(path)?;
        let (_, metadata) = SafeTensors::read_metadata(&buffer)
            .map_err(|e| SccrossError::Checkpoint(format!("Failed to load model: {e}")))?;
        let info = metadata
            .metadata()
            .as_ref()
            .ok_or_else(|| SccrossError::Checkpoint("checkpoint has no model metadata".into()))?;

        let version = info
            .get(VERSION_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| SccrossError::Checkpoint("checkpoint version missing".into()))?;
        if version != CHECKPOINT_VERSION {
            return Err(SccrossError::Checkpoint(format!(
                "Incompatible checkpoint version: {version} (expected {CHECKPOINT_VERSION})"
            )));
        }
        let header: ModelHeader = info
            .get(HEADER_KEY)
            .ok_or_else(|| SccrossError::Checkpoint("model options missing".into()))
            .and_then(|h| {
                serde_json::from_str(h)
                    .map_err(|e| SccrossError::Checkpoint(format!("bad model options: {e}")))
            })?;

        let model = Self::build(header.features, header.init)
            .map_err(|e| SccrossError::Checkpoint(e.to_string()))?;
        let tensors = candle_core::safetensors::load_buffer(&buffer, &model.device)
            .map_err(|e| SccrossError::Checkpoint(format!("Failed to load model: {e}")))?;
        {
            let vars = model
                .varmap
                .data()
                .lock()
                .map_err(|_| SccrossError::Model("parameter store lock poisoned".into()))?;
            if vars.len() != tensors.len() {
                return Err(SccrossError::Checkpoint(format!(
                    "checkpoint has {} parameters, model has {}",
                    tensors.len(),
                    vars.len()
                )));
            }
            for (name, var) in vars.iter() {
                let tensor = tensors.get(name).ok_or_else(|| {
                    SccrossError::Checkpoint(format!("parameter '{name}' missing"))
                })?;
                if tensor.dims() != var.dims() || tensor.dtype() != DType::F32 {
                    return Err(SccrossError::Checkpoint(format!(
                        "parameter '{name}' is {:?} {:?}, expected F32 {:?}",
                        tensor.dtype(),
                        tensor.dims(),
                        var.dims()
                    )));
                }
                var.set(tensor)?;
            }
        }
        tracing::info!("Loaded {} parameters from {}", tensors.len(), path.display());
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Annotation, BALANCING_WEIGHT_KEY};

    fn toy_datasets() -> DatasetCollection {
        let rna = Dataset::new(
            Matrix::from_rows(&[
                vec![1.0, 0.0, 0.5],
                vec![0.0, 1.0, 0.5],
                vec![0.5, 0.5, 0.0],
            ])
            .unwrap(),
        );
        let atac = Dataset::new(
            Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap(),
        );
        [("rna", rna), ("atac", atac)].into_iter().collect()
    }

    fn init() -> InitConfig {
        InitConfig {
            latent_dim: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_registers_parameters() {
        let model = LinearCrossModel::new(&toy_datasets(), &init()).unwrap();
        let params = model.parameters().unwrap();
        assert_eq!(params.len(), 8);
        assert_eq!(params["rna.encoder.weight"].len(), 2 * 3);
        assert_eq!(params["atac.decoder.bias"].len(), 2);
    }

    #[test]
    fn test_new_rejects_zero_latent_dim() {
        let config = InitConfig {
            latent_dim: 0,
            ..Default::default()
        };
        assert!(LinearCrossModel::new(&toy_datasets(), &config).is_err());
        assert!(LinearCrossModel::new(&DatasetCollection::new(), &init()).is_err());
    }

    #[test]
    fn test_fit_requires_compile() {
        let datasets = toy_datasets();
        let mut model = LinearCrossModel::new(&datasets, &init()).unwrap();
        let result = model.fit(&datasets, &FitConfig::default());
        assert!(matches!(result, Err(SccrossError::Training(_))));
    }

    #[test]
    fn test_fit_records_alignment_phase() {
        let datasets = toy_datasets();
        let mut model = LinearCrossModel::new(&datasets, &init()).unwrap();
        model.compile(&CompileConfig::default()).unwrap();

        let config = FitConfig {
            max_epochs: 6,
            align_burnin: crate::config::AlignBurnin::Epochs(3),
            ..Default::default()
        };
        model.fit(&datasets, &config).unwrap();

        let aligning: Vec<bool> = model.history().iter().map(|r| r.aligning).collect();
        assert_eq!(aligning, vec![false, false, false, true, true, true]);
        assert!(model.history()[..3].iter().all(|r| r.align_loss == 0.0));
    }

    #[test]
    fn test_fit_without_alignment() {
        let datasets = toy_datasets();
        let mut model = LinearCrossModel::new(&datasets, &init()).unwrap();
        model.compile(&CompileConfig::default()).unwrap();
        model
            .fit(&datasets, &FitConfig::default().for_pretrain())
            .unwrap();
        assert!(model.history().iter().all(|r| !r.aligning));
    }

    #[test]
    fn test_early_stopping_suspended_by_safe_burnin() {
        let datasets = toy_datasets();
        let config = FitConfig {
            max_epochs: 20,
            align_burnin: crate::config::AlignBurnin::Never,
            safe_burnin: true,
            patience: Some(1),
            min_delta: 1e9,
            ..Default::default()
        };

        let mut model = LinearCrossModel::new(&datasets, &init()).unwrap();
        model.compile(&CompileConfig::default()).unwrap();
        model.fit(&datasets, &config).unwrap();
        assert_eq!(model.history().len(), 20);

        let eager = FitConfig {
            safe_burnin: false,
            ..config
        };
        let mut model = LinearCrossModel::new(&datasets, &init()).unwrap();
        model.compile(&CompileConfig::default()).unwrap();
        model.fit(&datasets, &eager).unwrap();
        // the first epoch sets the best loss, the second cannot beat it by 1e9
        assert_eq!(model.history().len(), 2);
    }

    #[test]
    fn test_fit_rejects_bad_weights() {
        let mut datasets = toy_datasets();
        {
            let atac = datasets.get_mut("atac").unwrap();
            atac.insert_obs(BALANCING_WEIGHT_KEY, Annotation::Numeric(vec![0.0, 0.0]))
                .unwrap();
            atac.uns.use_dsc_weight = Some(BALANCING_WEIGHT_KEY.into());
        }
        let mut model = LinearCrossModel::new(&datasets, &init()).unwrap();
        model.compile(&CompileConfig::default()).unwrap();
        let result = model.fit(&datasets, &FitConfig::default());
        assert!(matches!(result, Err(SccrossError::Training(_))));
    }

    #[test]
    fn test_encode_unknown_dataset() {
        let datasets = toy_datasets();
        let model = LinearCrossModel::new(&datasets, &init()).unwrap();
        let rna = datasets.get("rna").unwrap();
        assert!(matches!(
            model.encode_data("adt", rna),
            Err(SccrossError::Model(_))
        ));
        // feature count mismatch
        assert!(model.encode_data("atac", rna).is_err());
    }

    #[test]
    fn test_checkpoint_version_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let model = LinearCrossModel::new(&toy_datasets(), &init()).unwrap();

        model.write_checkpoint(&path, CHECKPOINT_VERSION + 1).unwrap();
        let result = LinearCrossModel::load(&path);
        assert!(matches!(result, Err(SccrossError::Checkpoint(_))));

        model.write_checkpoint(&path, CHECKPOINT_VERSION).unwrap();
        let loaded = LinearCrossModel::load(&path).unwrap();
        assert_eq!(loaded.parameters().unwrap(), model.parameters().unwrap());
        assert_eq!(loaded.features(), model.features());
    }

    #[test]
    fn test_checkpoint_requires_model_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bare.safetensors");
        let weight = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        safetensors::tensor::serialize_to_file(vec![("rna.encoder.weight", weight)], &None, &path)
            .unwrap();

        let result = LinearCrossModel::load(&path);
        assert!(matches!(result, Err(SccrossError::Checkpoint(_))));
    }

    #[test]
    fn test_alignment_weights_uniform_default() {
        let datasets = toy_datasets();
        let w = alignment_weights("atac", datasets.get("atac").unwrap()).unwrap();
        assert_eq!(w, vec![0.5, 0.5]);
    }
}
