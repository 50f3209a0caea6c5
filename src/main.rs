// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-postproc")]
#[command(about = "Camera post-processing and JPEG pipeline")]
#[command(version = camera_postproc::constants::app_info::version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run captures through the pipeline on the simulated camera
    Simulate {
        /// Reprocess passes per capture
        #[arg(short, long, default_value = "0")]
        passes: u8,

        /// Number of frames to capture
        #[arg(short, long, default_value = "3")]
        frames: u32,

        /// Capture settings file (JSON)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Post-processor config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory (default: ~/Pictures/camera-postproc/TIMESTAMP)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective post-processor configuration
    Config {
        /// Config file to load (defaults apply when missing)
        path: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camera_postproc=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            passes,
            frames,
            settings,
            config,
            output,
        } => cli::simulate(cli::SimulateArgs {
            passes,
            frames,
            settings,
            config,
            output,
        }),
        Commands::Config { path } => cli::print_config(path),
    }
}
