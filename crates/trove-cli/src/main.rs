//! Trove CLI - Command-line interface for Trove
//!
//! Scans and watches configured libraries, keeping the content index
//! and its assets in step with what is on disk.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trove_core::TroveConfig;

mod commands;
mod handlers;
mod original;

#[derive(Parser)]
#[command(name = "trove")]
#[command(author = "Trove Contributors")]
#[command(version)]
#[command(about = "Content-addressed indexing for media libraries", long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/trove/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Register this directory as the first library
        #[arg(long)]
        root: Option<PathBuf>,

        /// Id of the first library
        #[arg(long, default_value = "library")]
        id: String,

        /// Handler context of the first library
        #[arg(long, default_value = handlers::GALLERY)]
        context: String,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Add a library to the config
    Add {
        id: String,

        /// Source URI such as file:///srv/photos, or a plain directory
        source: String,

        #[arg(long, default_value = handlers::GALLERY)]
        context: String,
    },

    /// Run one full scan
    Scan {
        /// Only this library
        #[arg(short, long)]
        library: Option<String>,
    },

    /// Keep libraries in sync until interrupted
    Watch {
        #[arg(short, long)]
        library: Option<String>,

        /// Rescan every N seconds instead of using change notifications
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show index status
    Status {
        #[arg(short, long)]
        library: Option<String>,

        /// List indexed files
        #[arg(long)]
        files: bool,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a rendition of an asset to a file
    Render {
        /// Asset id, as shown by the index
        asset: String,

        #[arg(long, default_value = original::ORIGINAL)]
        spec: String,

        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => match TroveConfig::default_path() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                std::process::exit(1);
            }
        },
    };

    let result = match cli.command {
        Commands::Init {
            root,
            id,
            context,
            force,
        } => commands::init(&config_path, root.as_deref(), &id, &context, force),
        Commands::Add {
            id,
            source,
            context,
        } => commands::add(&config_path, &id, &source, &context),
        Commands::Scan { library } => commands::scan(&config_path, library.as_deref()).await,
        Commands::Watch { library, interval } => {
            commands::watch(&config_path, library.as_deref(), interval).await
        }
        Commands::Status {
            library,
            files,
            json,
        } => commands::status(&config_path, library.as_deref(), files, json),
        Commands::Render {
            asset,
            spec,
            output,
        } => commands::render(&config_path, &asset, &spec, &output).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
