mod tracing;

use crate::tracing::setup_tracing;
use ::tracing::info;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use riverine_core::schema::Schema;
use riverine_core::{Model, Settings};
use std::fs::File;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Turn debugging information on
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a schema file without running it.
    Validate {
        /// Path to the schema JSON.
        schema: PathBuf,
    },
    /// Run a simulation.
    Run {
        /// Path to the schema JSON.
        schema: PathBuf,
        /// Directory for the CSV result streams.
        #[arg(short, long, default_value = "results")]
        output_path: PathBuf,
        /// Run duration in seconds.
        #[arg(long, default_value_t = 86_400.0)]
        duration: f64,
        /// Save interval in seconds.
        #[arg(long, default_value_t = 86_400.0)]
        saveat: f64,
        /// Allocation interval in seconds; omit to disable allocation.
        #[arg(long)]
        allocation_timestep: Option<f64>,
        /// Start of the run, e.g. `2024-01-01T00:00:00`.
        #[arg(long)]
        start: Option<NaiveDateTime>,
    },
}

fn load_schema(path: &PathBuf) -> Result<Schema> {
    let file = File::open(path).with_context(|| format!("could not open schema `{}`", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("could not parse schema `{}`", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.debug).unwrap();

    match cli.command {
        Commands::Validate { schema } => {
            let schema = load_schema(&schema)?;
            riverine_core::validate::validate(&schema)?;
            info!("schema is valid");
        }
        Commands::Run {
            schema,
            output_path,
            duration,
            saveat,
            allocation_timestep,
            start,
        } => {
            let schema = load_schema(&schema)?;
            let settings = Settings {
                start: start.unwrap_or_default(),
                duration,
                saveat,
                allocation_timestep,
                ..Settings::default()
            };
            let mut model = Model::from_schema(&schema, settings)?;
            model.run()?;
            std::fs::create_dir_all(&output_path)
                .with_context(|| format!("could not create `{}`", output_path.display()))?;
            model.write_results(&output_path)?;
            info!(output = %output_path.display(), "results written");
        }
    }

    Ok(())
}
