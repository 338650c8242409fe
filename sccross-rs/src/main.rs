//! CLI entry point for sccross-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sccross_rs::{fit_sccross, load_model, Dataset, LinearCrossModel, Model, Result, RunConfig};

#[derive(Parser)]
#[command(name = "sccross")]
#[command(about = "Staged training of cross-modal single-cell embedding models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a run file
    Validate {
        /// Path to run file
        config: String,
    },
    /// Generate a sample run file
    Init {
        /// Output path for run file
        #[arg(default_value = "sccross.yaml")]
        output: String,
    },
    /// Run the staged fit
    Fit {
        /// Path to run file
        config: String,
        /// Rewrite the dataset files with their balancing weights
        #[arg(long)]
        write_back: bool,
    },
    /// Embed a dataset with a trained model
    Encode {
        /// Path to saved model
        #[arg(long)]
        model: String,
        /// Dataset key the model knows the data under
        #[arg(long)]
        dataset: String,
        /// Dataset file to embed
        #[arg(long)]
        input: String,
        /// Output dataset file
        #[arg(long)]
        output: String,
        /// `obsm` key receiving the embedding
        #[arg(long, default_value = "X_sccross")]
        key: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating run file: {}", config);
            let config = RunConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Datasets: {}",
                config.datasets.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            println!("  Latent dim: {}", config.init.latent_dim);
            println!("  Max epochs: {}", config.fit.max_epochs);
            println!("  Align burn-in: {}", config.fit.align_burnin);
        }
        Commands::Init { output } => {
            tracing::info!("Generating sample run file");
            RunConfig::sample().to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Fit { config, write_back } => {
            tracing::info!("Starting staged fit with run file: {}", config);
            let run = RunConfig::from_file(&config)?;
            run.validate()?;
            let mut datasets = run.load_datasets()?;

            let model: LinearCrossModel = fit_sccross(
                &mut datasets,
                Some(run.init.clone()),
                Some(run.compile.clone()),
                Some(run.fit.clone()),
                Some(run.balance.clone()),
            )?;
            println!(
                "✓ Staged fit complete ({} fine-tune epochs)",
                model.history().len()
            );
            if let Some(directory) = &run.fit.directory {
                println!("  Artifacts: {}", directory.display());
            }

            if write_back {
                for (key, dataset) in datasets.iter() {
                    let path = &run.datasets[key];
                    dataset.to_file(path)?;
                    println!("  Balancing weights written to: {path}");
                }
            }
        }
        Commands::Encode {
            model,
            dataset,
            input,
            output,
            key,
        } => {
            let trained: LinearCrossModel = load_model(&model)?;
            let mut data = Dataset::from_file(&input)?;
            tracing::info!("Encoding '{}' ({} cells)", dataset, data.n_obs());
            let embedding = trained.encode_data(&dataset, &data)?;
            data.insert_obsm(key.as_str(), embedding)?;
            data.to_file(&output)?;
            println!("✓ Embedding stored in obsm['{key}'] of: {output}");
        }
    }

    Ok(())
}
