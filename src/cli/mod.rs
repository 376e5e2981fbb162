pub mod commands;
pub mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::runtime::{Builder, Runtime};
use tracing::info;

use crate::protocol::TaskType;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Gateway {
        /// Address to listen on (overrides gateway.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run the task dispatcher
    Dispatcher {
        /// Address to listen on (overrides dispatcher.bind)
        #[arg(short, long)]
        bind: Option<String>,

        /// Number of pool slots (overrides dispatcher.pool_size)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Serve dispatcher jobs over stdin/stdout
    #[command(hide = true)]
    Worker,

    /// Send one task to a dispatcher and print the reply
    Submit {
        /// Task type: screenshot, performance, images, technologies, seo or all
        #[arg(required = true)]
        task: TaskType,

        /// Page URL
        #[arg(required = true)]
        url: String,

        /// Dispatcher address (overrides gateway.processing_addr)
        #[arg(short, long)]
        addr: Option<String>,

        /// Fetch the page first and send its HTML and headers along
        #[arg(long)]
        fetch: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

impl Cli {
    /// Runtime for the selected command: the dispatcher spreads connection
    /// handlers over every core, everything else is I/O bound on one thread
    pub fn runtime(&self) -> Result<Runtime> {
        let mut builder = match self.command {
            Commands::Dispatcher { .. } => Builder::new_multi_thread(),
            _ => Builder::new_current_thread(),
        };

        builder.enable_all().build().context("Failed to build async runtime")
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config;

    match cli.command {
        Commands::Gateway { bind } => {
            info!("Starting gateway");
            commands::run_gateway(config_path, bind).await
        }
        Commands::Dispatcher { bind, workers } => {
            info!("Starting dispatcher");
            commands::run_dispatcher(config_path, bind, workers).await
        }
        Commands::Worker => commands::run_worker(config_path).await,
        Commands::Submit { task, url, addr, fetch } => {
            info!("Submitting {} task for {}", task, url);
            commands::submit(config_path, task, url, addr, fetch).await
        }
        Commands::Config { init } => {
            if init {
                info!("Writing default configuration");
                commands::init_config(config_path).await
            } else {
                commands::show_config(config_path).await
            }
        }
    }
}
