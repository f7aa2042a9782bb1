/// bnd: build and deploy
use std::sync::Arc;
use std::time::Duration;
use bnd::build::{DockerImageBuilder, ImageBuilder};
use bnd::config::runtime::PipelineConfig;
use bnd::deploy::{Kubectl, RolloutDriver};
use bnd::notify::WebhookNotifier;
use bnd::pipeline::Pipeline;
use bnd::publish::{DockerRegistry, Publisher};
use bnd::report::PipelineReport;
use bnd::{auth, build, config, deploy, notify, pipeline};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info};
use thiserror::Error;

/// Build a container image, push it to its registry and roll it out on a cluster.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Root of the source code tree; the Docker build context.
    #[arg(short = 'C', long, default_value = ".")]
    source_directory: String,

    /// Path to the bnd configuration file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Declaration {
    /// Pipeline declaration file (TOML, or YAML with a .yaml/.yml extension).
    #[arg(default_value = "pipeline.toml")]
    pipeline: String,

    /// Override a declaration entry, e.g. `--set environment=production`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a pipeline declaration and print the resolved configuration.
    Resolve(Declaration),
    /// Build the Docker image without publishing or deploying it.
    Build(Declaration),
    /// Build, publish and deploy. Several declarations run concurrently.
    Run {
        /// Pipeline declaration files.
        #[arg(required = true)]
        pipelines: Vec<String>,

        /// Override a declaration entry in every pipeline.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Write the pipeline reports to this file as JSON.
        #[arg(long)]
        report: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::file::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::runtime::Error),

    #[error("build error: {0}")]
    Build(#[from] build::Error),

    #[error("cluster client: {0}")]
    Deploy(#[from] deploy::Error),

    #[error("notification: {0}")]
    Notify(#[from] notify::Error),

    #[error("pipeline: {0}")]
    Pipeline(#[from] pipeline::Error),

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` built-in config.
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists on disk.
/// If it does, it is used implicitly.
fn read_config(args: &Cli) -> Result<config::file::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "bnd.toml";

    // Typically found in project root, e.g. ./bnd.toml
    let config_path = format!("{}/{}", args.source_directory, DEFAULT_CONFIG_FILE);

    let config_file = match &args.config {
        None => std::fs::metadata(&config_path)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
            .then_some(config_path),
        Some(c) => Some(c.clone()),
    };

    Ok(match config_file {
        Some(config_file) => {
            debug!("Using configuration file {config_file}");
            config::file::File::default_with_user_config_file(&config_file)?
        }
        None => config::file::File::builtin()?,
    })
}

fn resolve_declaration(path: &str, overrides: &[String]) -> Result<PipelineConfig, Error> {
    let mut raw = config::runtime::load_file(path)?;
    config::runtime::apply_overrides(&mut raw, overrides)?;
    let cfg = config::runtime::resolve(&raw)?;
    info!("Pipeline {path}: {}/{}", cfg.app_name, cfg.environment);
    Ok(cfg)
}

/// Wire up the production collaborators for one pipeline.
fn assemble(
    cfg: &PipelineConfig,
    cfg_file: &config::file::File,
    source_directory: &str,
) -> Result<Pipeline, Error> {
    let publisher = Publisher::new(
        DockerRegistry::new()?,
        auth::from_env(&cfg.region),
        cfg_file.publish.retry_policy(),
    );
    let driver = RolloutDriver::new(Kubectl::new()?, &cfg_file.deploy);

    let pipeline = Pipeline::new(
        Box::new(DockerImageBuilder::new(source_directory)),
        Box::new(publisher),
        Box::new(driver),
    );
    Ok(match &cfg_file.notify.webhook_url {
        Some(url) => pipeline.with_notifier(Box::new(WebhookNotifier::new(
            url,
            Duration::from_secs(cfg_file.notify.timeout_secs),
        )?)),
        None => pipeline,
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("fatal: {}", err);
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<i32, Error> {
    env_logger::init();

    let args = Cli::parse();
    let cfg_file = read_config(&args)?;

    info!("bnd {}", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Commands::Resolve(declaration) => {
            let cfg = resolve_declaration(&declaration.pipeline, &declaration.overrides)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(0)
        }
        Commands::Build(declaration) => {
            let cfg = resolve_declaration(&declaration.pipeline, &declaration.overrides)?;
            let artifact = DockerImageBuilder::new(&args.source_directory)
                .build(&cfg)
                .await?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(0)
        }
        Commands::Run {
            pipelines,
            overrides,
            report,
        } => {
            // Every declaration is validated before any pipeline has side effects.
            let configs = pipelines
                .iter()
                .map(|path| resolve_declaration(path, overrides))
                .collect::<Result<Vec<_>, _>>()?;

            let runs = configs
                .into_iter()
                .map(|cfg| {
                    assemble(&cfg, &cfg_file, &args.source_directory)
                        .map(|pipeline| (Arc::new(pipeline), cfg))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let reports = pipeline::run_many(runs).await?;
            for r in &reports {
                println!("{r}");
            }
            if let Some(path) = report {
                std::fs::write(path, serde_json::to_string_pretty(&reports)?)?;
                info!("Report written to {path}");
            }
            Ok(reports.iter().map(PipelineReport::exit_code).max().unwrap_or(0))
        }
    }
}
