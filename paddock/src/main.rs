use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use paddock::{load_config, logging, plugin_registry, Orchestrator};

#[derive(Parser)]
#[command(name = "paddock")]
#[command(about = "Cluster lab manager for containers and virtual machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Import a cluster description and run it until Ctrl-C
    Run {
        /// Description file (YAML or JSON)
        file: PathBuf,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Create nodes without starting them
        #[arg(long)]
        no_start: bool,
    },
    /// Validate the configuration and print the effective values
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List registered plugins per extension point
    Drivers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, config, no_start } => {
            let config = load_config(config.as_deref()).context("Failed to load configuration")?;
            logging::init(&config.logging)?;

            let orchestrator = Orchestrator::new(config)?;
            if let Err(e) = orchestrator.import_file(&file, !no_start).await {
                tracing::error!("Import of {} failed: {}", file.display(), e);
                if let Err(teardown) = orchestrator.shutdown().await {
                    eprintln!("{}", teardown);
                }
                return Err(e).with_context(|| format!("Failed to import {}", file.display()));
            }

            if let Err(e) = orchestrator.run_until_signal().await {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref()).context("Invalid configuration")?;
            let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Commands::Drivers => {
            let registry = plugin_registry();
            let mut current = String::new();
            for plugin in registry.info() {
                if plugin.extension != current {
                    println!("{}", plugin.extension);
                    current = plugin.extension.clone();
                }
                println!("  {:<10} {}", plugin.name, plugin.description);
            }
        }
    }

    Ok(())
}
