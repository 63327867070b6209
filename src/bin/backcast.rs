//! backcast CLI - historical land-cover back-casting

use anyhow::{Context, Result};
use backcast::core::{Pipeline, Stage};
use backcast::io::{raster_io, ArtifactWriter, LoadedInputs};
use backcast::{BackcastError, PipelineConfig};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "backcast")]
#[command(author, version, about = "Historical land-cover back-casting", long_about = None)]
struct Cli {
    /// Pipeline configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Stage to run: compose, harmonize, classify, transitions or all
    #[arg(short, long, default_value = "all")]
    stage: String,

    /// Output directory, overriding the configured one
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: &Cli) -> Result<u8> {
    let start = Instant::now();
    raster_io::ensure_available()?;
    // parsed here so an unknown stage is a configuration error (exit 1)
    let stage: Stage = cli.stage.parse()?;
    let mut config = PipelineConfig::from_json_file(&cli.config)?;
    if let Some(output) = &cli.output {
        config.output_dir = output.clone();
    }

    let inputs = LoadedInputs::load(&config)?;
    let writer = ArtifactWriter::new(&config.output_dir)
        .with_context(|| format!("Cannot create output directory {}", config.output_dir.display()))?;
    let pipeline = Pipeline::new(config)?;

    let outputs = pipeline.run(stage, &inputs.as_pipeline_inputs())?;
    writer.write_outputs(&outputs)?;

    for (job, _) in outputs.failures() {
        log::error!("Failed: {}", job);
    }
    log::info!("Stage '{}' finished in {:.1?}", stage, start.elapsed());
    Ok(outputs.exit_code())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<BackcastError>().map_or(3, BackcastError::exit_code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}
