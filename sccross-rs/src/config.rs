//! Configuration bundles and run-file parsing.
//!
//! A staged fit is driven by four independent bundles: [`InitConfig`],
//! [`CompileConfig`], [`FitConfig`] and [`BalanceConfig`]. Each is an
//! immutable value; the pretrain and fine-tune variants are produced by
//! explicit constructors ([`InitConfig::for_pretrain`],
//! [`FitConfig::for_pretrain`], [`FitConfig::for_finetune`]) instead of
//! mutating the caller's copy.
//!
//! Options a bundle does not recognise are kept in its `extra` map and
//! forwarded untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, DatasetCollection};
use crate::error::{Result, SccrossError};

/// Subdirectory of [`FitConfig::directory`] holding pretrain artifacts.
pub const PRETRAIN_SUBDIR: &str = "pretrain";

/// Subdirectory of [`FitConfig::directory`] holding fine-tune artifacts.
pub const FINETUNE_SUBDIR: &str = "fine-tune";

/// Opaque caller options carried by every bundle.
pub type ExtraOptions = BTreeMap<String, serde_yaml::Value>;

/// Model construction options.
///
/// # Example
///
/// ```rust
/// use sccross_rs::InitConfig;
///
/// let init = InitConfig {
///     latent_dim: 16,
///     shared_batches: true,
///     ..Default::default()
/// };
///
/// let pretrain = init.for_pretrain();
/// assert!(!pretrain.shared_batches);
/// assert_eq!(pretrain.latent_dim, 16);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    /// Dimension of the shared latent space.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Whether datasets share a batch annotation for balancing.
    #[serde(default)]
    pub shared_batches: bool,

    /// Caller-defined options.
    #[serde(flatten)]
    pub extra: ExtraOptions,
}

fn default_latent_dim() -> usize {
    50
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            latent_dim: default_latent_dim(),
            shared_batches: false,
            extra: ExtraOptions::new(),
        }
    }
}

impl InitConfig {
    /// Pretrain variant: batches are never assumed to be shared before any
    /// alignment has happened.
    #[must_use]
    pub fn for_pretrain(&self) -> Self {
        Self {
            shared_batches: false,
            ..self.clone()
        }
    }
}

/// Optimizer and loss options, forwarded verbatim to both phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileConfig {
    /// AdamW learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// AdamW weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Weight of the reconstruction loss.
    #[serde(default = "default_lam_data")]
    pub lam_data: f64,

    /// Weight of the cross-dataset alignment loss.
    #[serde(default = "default_lam_align")]
    pub lam_align: f64,

    /// Caller-defined options.
    #[serde(flatten)]
    pub extra: ExtraOptions,
}

fn default_lr() -> f64 {
    2e-3
}
fn default_lam_data() -> f64 {
    1.0
}
fn default_lam_align() -> f64 {
    0.05
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: 0.0,
            lam_data: default_lam_data(),
            lam_align: default_lam_align(),
            extra: ExtraOptions::new(),
        }
    }
}

/// When cross-dataset alignment starts during `fit`.
///
/// Serialised as an epoch count (`align_burnin: 50`), as `never` / `inf`, or
/// as the YAML infinity `.inf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BurninRepr", into = "BurninRepr")]
pub enum AlignBurnin {
    /// Alignment is suppressed for the first `n` epochs.
    Epochs(usize),
    /// Alignment never starts (infinite warm-up).
    Never,
}

impl AlignBurnin {
    /// Whether alignment is active at the given (zero-based) epoch.
    #[must_use]
    pub fn is_aligning(self, epoch: usize) -> bool {
        match self {
            AlignBurnin::Epochs(n) => epoch >= n,
            AlignBurnin::Never => false,
        }
    }
}

impl Default for AlignBurnin {
    fn default() -> Self {
        AlignBurnin::Epochs(50)
    }
}

impl fmt::Display for AlignBurnin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignBurnin::Epochs(n) => write!(f, "{n} epochs"),
            AlignBurnin::Never => f.write_str("never"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BurninRepr {
    Epochs(usize),
    Float(f64),
    Keyword(String),
}

impl TryFrom<BurninRepr> for AlignBurnin {
    type Error = String;

    fn try_from(repr: BurninRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            BurninRepr::Epochs(n) => Ok(AlignBurnin::Epochs(n)),
            BurninRepr::Float(f) if f.is_infinite() && f > 0.0 => Ok(AlignBurnin::Never),
            BurninRepr::Float(f) => Err(format!("invalid align_burnin: {f}")),
            BurninRepr::Keyword(k) => match k.to_ascii_lowercase().as_str() {
                "never" | "inf" | "infinite" => Ok(AlignBurnin::Never),
                other => Err(format!("invalid align_burnin: {other}")),
            },
        }
    }
}

impl From<AlignBurnin> for BurninRepr {
    fn from(burnin: AlignBurnin) -> Self {
        match burnin {
            AlignBurnin::Epochs(n) => BurninRepr::Epochs(n),
            AlignBurnin::Never => BurninRepr::Keyword("never".into()),
        }
    }
}

/// Training loop options.
///
/// # Example
///
/// ```rust
/// use sccross_rs::FitConfig;
/// use sccross_rs::config::AlignBurnin;
///
/// let fit = FitConfig {
///     directory: Some("out".into()),
///     ..Default::default()
/// };
///
/// let pretrain = fit.for_pretrain();
/// assert_eq!(pretrain.align_burnin, AlignBurnin::Never);
/// assert!(!pretrain.safe_burnin);
/// assert_eq!(pretrain.directory, Some("out/pretrain".into()));
///
/// let finetune = fit.for_finetune();
/// assert_eq!(finetune.directory, Some("out/fine-tune".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Maximum number of training epochs.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    /// Alignment warm-up length.
    #[serde(default)]
    pub align_burnin: AlignBurnin,

    /// Suspend early stopping until alignment has started.
    #[serde(default = "default_true")]
    pub safe_burnin: bool,

    /// Early stopping patience in epochs.
    #[serde(default)]
    pub patience: Option<usize>,

    /// Minimum loss decrease counted as an improvement.
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,

    /// Base directory for artifacts.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Caller-defined options.
    #[serde(flatten)]
    pub extra: ExtraOptions,
}

fn default_max_epochs() -> usize {
    200
}
fn default_true() -> bool {
    true
}
fn default_min_delta() -> f64 {
    1e-4
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            align_burnin: AlignBurnin::default(),
            safe_burnin: true,
            patience: None,
            min_delta: default_min_delta(),
            directory: None,
            extra: ExtraOptions::new(),
        }
    }
}

impl FitConfig {
    /// Pretrain variant: alignment disabled for the whole run, no safe
    /// burn-in, artifacts under `<directory>/pretrain`.
    #[must_use]
    pub fn for_pretrain(&self) -> Self {
        Self {
            align_burnin: AlignBurnin::Never,
            safe_burnin: false,
            directory: self.directory.as_ref().map(|d| d.join(PRETRAIN_SUBDIR)),
            ..self.clone()
        }
    }

    /// Fine-tune variant: caller options untouched, artifacts under
    /// `<directory>/fine-tune`.
    #[must_use]
    pub fn for_finetune(&self) -> Self {
        Self {
            directory: self.directory.as_ref().map(|d| d.join(FINETUNE_SUBDIR)),
            ..self.clone()
        }
    }
}

/// Balancing weight estimator options, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Number of k-means clusters per dataset.
    #[serde(default = "default_n_clusters")]
    pub n_clusters: usize,

    /// k-means iterations.
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Cosine similarity below this value contributes nothing.
    #[serde(default = "default_cutoff")]
    pub cutoff: f32,

    /// Exponent applied to the thresholded similarity.
    #[serde(default = "default_power")]
    pub power: f32,

    /// Caller-defined options.
    #[serde(flatten)]
    pub extra: ExtraOptions,
}

fn default_n_clusters() -> usize {
    10
}
fn default_max_iter() -> usize {
    50
}
fn default_cutoff() -> f32 {
    0.5
}
fn default_power() -> f32 {
    4.0
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            n_clusters: default_n_clusters(),
            max_iter: default_max_iter(),
            cutoff: default_cutoff(),
            power: default_power(),
            extra: ExtraOptions::new(),
        }
    }
}

impl BalanceConfig {
    /// Validate estimator options.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Config`] for a zero cluster count, a cutoff
    /// outside `[0, 1)` or a non-positive power.
    pub fn validate(&self) -> Result<()> {
        if self.n_clusters == 0 {
            return Err(SccrossError::Config("balance.n_clusters must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.cutoff) {
            return Err(SccrossError::Config(
                "balance.cutoff must be in [0, 1)".into(),
            ));
        }
        if self.power <= 0.0 {
            return Err(SccrossError::Config("balance.power must be > 0".into()));
        }
        Ok(())
    }
}

/// A complete run described in one YAML file.
///
/// # Example
///
/// ```rust
/// use sccross_rs::RunConfig;
///
/// let yaml = r#"
/// datasets:
///   rna: data/rna.json
///   atac: data/atac.json
/// fit:
///   max_epochs: 20
///   align_burnin: 5
///   directory: ./outputs
/// "#;
///
/// let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
/// assert_eq!(config.datasets.len(), 2);
/// assert_eq!(config.fit.max_epochs, 20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Dataset key to JSON dataset file.
    pub datasets: BTreeMap<String, String>,

    /// Model construction options.
    #[serde(default)]
    pub init: InitConfig,

    /// Optimizer options.
    #[serde(default)]
    pub compile: CompileConfig,

    /// Training loop options.
    #[serde(default)]
    pub fit: FitConfig,

    /// Balancing weight options.
    #[serde(default)]
    pub balance: BalanceConfig,
}

impl RunConfig {
    /// Load a run file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Write the run file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A two-modality sample run.
    #[must_use]
    pub fn sample() -> Self {
        let datasets = [("rna", "./data/rna.json"), ("atac", "./data/atac.json")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            datasets,
            init: InitConfig {
                latent_dim: 16,
                ..Default::default()
            },
            compile: CompileConfig::default(),
            fit: FitConfig {
                max_epochs: 100,
                align_burnin: AlignBurnin::Epochs(20),
                patience: Some(10),
                directory: Some("./outputs".into()),
                ..Default::default()
            },
            balance: BalanceConfig::default(),
        }
    }

    /// Validate the run.
    ///
    /// # Errors
    ///
    /// Returns [`SccrossError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            return Err(SccrossError::Config("at least one dataset is required".into()));
        }
        if let Some((key, _)) = self.datasets.iter().find(|(_, path)| path.is_empty()) {
            return Err(SccrossError::Config(format!(
                "dataset path for '{key}' is empty"
            )));
        }
        if self.init.latent_dim == 0 {
            return Err(SccrossError::Config("init.latent_dim must be > 0".into()));
        }
        if self.compile.lr <= 0.0 {
            return Err(SccrossError::Config("compile.lr must be > 0".into()));
        }
        if self.fit.max_epochs == 0 {
            return Err(SccrossError::Config("fit.max_epochs must be > 0".into()));
        }
        self.balance.validate()
    }

    /// Read every dataset file named by the run.
    ///
    /// # Errors
    ///
    /// Returns the first read or parse failure.
    pub fn load_datasets(&self) -> Result<DatasetCollection> {
        let mut datasets = DatasetCollection::new();
        for (key, path) in &self.datasets {
            tracing::info!("Loading dataset '{}' from {}", key, path);
            datasets.insert(key.clone(), Dataset::from_file(path)?);
        }
        Ok(datasets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_pretrain_init_forces_unshared_batches() {
        let init = InitConfig {
            shared_batches: true,
            latent_dim: 8,
            ..Default::default()
        };
        let pretrain = init.for_pretrain();
        assert!(!pretrain.shared_batches);
        assert_eq!(pretrain.latent_dim, 8);
        // caller copy is untouched
        assert!(init.shared_batches);
    }

    #[test]
    fn test_pretrain_fit_overrides_burnin() {
        let fit = FitConfig {
            align_burnin: AlignBurnin::Epochs(3),
            safe_burnin: true,
            max_epochs: 7,
            ..Default::default()
        };
        let pretrain = fit.for_pretrain();
        assert_eq!(pretrain.align_burnin, AlignBurnin::Never);
        assert!(!pretrain.safe_burnin);
        assert_eq!(pretrain.max_epochs, 7);
        assert_eq!(pretrain.directory, None);
    }

    #[test]
    fn test_finetune_fit_keeps_caller_options() {
        let fit = FitConfig {
            align_burnin: AlignBurnin::Epochs(3),
            safe_burnin: true,
            directory: Some(PathBuf::from("runs/a")),
            ..Default::default()
        };
        let finetune = fit.for_finetune();
        assert_eq!(finetune.align_burnin, AlignBurnin::Epochs(3));
        assert!(finetune.safe_burnin);
        assert_eq!(finetune.directory, Some(PathBuf::from("runs/a/fine-tune")));
    }

    #[test]
    fn test_phase_directories_differ() {
        let fit = FitConfig {
            directory: Some(PathBuf::from("out")),
            ..Default::default()
        };
        assert_ne!(fit.for_pretrain().directory, fit.for_finetune().directory);
    }

    #[test]
    fn test_align_burnin_parsing() {
        let fit: FitConfig = serde_yaml::from_str("align_burnin: 12").unwrap();
        assert_eq!(fit.align_burnin, AlignBurnin::Epochs(12));

        let fit: FitConfig = serde_yaml::from_str("align_burnin: never").unwrap();
        assert_eq!(fit.align_burnin, AlignBurnin::Never);

        let fit: FitConfig = serde_yaml::from_str("align_burnin: inf").unwrap();
        assert_eq!(fit.align_burnin, AlignBurnin::Never);

        let fit: FitConfig = serde_yaml::from_str("align_burnin: .inf").unwrap();
        assert_eq!(fit.align_burnin, AlignBurnin::Never);

        assert!(serde_yaml::from_str::<FitConfig>("align_burnin: 2.5").is_err());
        assert!(serde_yaml::from_str::<FitConfig>("align_burnin: -.inf").is_err());

        assert!(serde_yaml::from_str::<FitConfig>("align_burnin: soon").is_err());
    }

    #[test]
    fn test_align_burnin_is_aligning() {
        assert!(!AlignBurnin::Epochs(2).is_aligning(1));
        assert!(AlignBurnin::Epochs(2).is_aligning(2));
        assert!(AlignBurnin::Epochs(0).is_aligning(0));
        assert!(!AlignBurnin::Never.is_aligning(usize::MAX));
    }

    #[test]
    fn test_extra_options_are_preserved() {
        let init: InitConfig =
            serde_yaml::from_str("latent_dim: 4\nh_depth: 2\nnote: rna-first").unwrap();
        assert_eq!(init.latent_dim, 4);
        assert_eq!(init.extra.len(), 2);
        assert_eq!(init.extra["h_depth"].as_u64(), Some(2));

        // survives the pretrain derivation
        assert_eq!(init.for_pretrain().extra, init.extra);
    }

    #[test]
    fn test_balance_config_validation() {
        assert!(BalanceConfig::default().validate().is_ok());

        let zero = BalanceConfig {
            n_clusters: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let cutoff = BalanceConfig {
            cutoff: 1.0,
            ..Default::default()
        };
        assert!(cutoff.validate().is_err());

        let power = BalanceConfig {
            power: 0.0,
            ..Default::default()
        };
        assert!(power.validate().is_err());
    }

    #[test]
    fn test_run_config_validation() {
        let mut config = RunConfig::sample();
        assert!(config.validate().is_ok());

        config.init.latent_dim = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::sample();
        config.datasets.clear();
        assert!(config.validate().is_err());

        let mut config = RunConfig::sample();
        config.datasets.insert("adt".into(), String::new());
        assert!(config.validate().is_err());

        let mut config = RunConfig::sample();
        config.fit.max_epochs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = RunConfig::from_file("/nonexistent/path/sccross.yaml");
        assert!(matches!(result, Err(SccrossError::Io(_))));
    }

    #[test]
    fn test_load_config_malformed_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "datasets: [[[").unwrap();

        let result = RunConfig::from_file(temp_file.path());
        assert!(matches!(result, Err(SccrossError::ConfigParse(_))));
    }

    #[test]
    fn test_save_config_roundtrip() {
        let config = RunConfig::sample();
        let temp_file = NamedTempFile::new().unwrap();

        config.to_file(temp_file.path()).unwrap();
        let loaded = RunConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.datasets, config.datasets);
        assert_eq!(loaded.init, config.init);
        assert_eq!(loaded.fit, config.fit);
        assert_eq!(loaded.balance, config.balance);
    }
}
