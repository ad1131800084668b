use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use depres::evaluation::Dispatch;

mod config;
mod runner;
mod toy;

use config::RunConfig;

#[derive(ClapParser)]
#[command(name = "depres")]
#[command(about = "Resolve and evaluate capability graphs over parameter points")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every point of a run file, printing one JSON line per point
    Run {
        /// Run file (defaults to run.toml in the config directory)
        file: Option<PathBuf>,
        /// Directory scanned for backend plugins
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
        /// Evaluate independent nodes of a point concurrently
        #[arg(long)]
        parallel: bool,
    },
    /// List registered providers and discovered backends
    List {
        /// Directory scanned for backend plugins
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
    },
    /// Write an example run file
    Init {
        /// Destination (defaults to run.toml in the config directory)
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn run_file(file: Option<PathBuf>) -> Result<PathBuf> {
    file.or_else(config::default_run_path)
        .context("no run file given and no config directory available")
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            plugin_dir,
            parallel,
        } => {
            let path = run_file(file)?;
            let config = config::load_run_config(&path)?;
            let dispatch = parallel.then_some(Dispatch::Parallel);
            runner::run(&config, plugin_dir.as_deref(), dispatch, &mut io::stdout().lock())?;
        }
        Commands::List { plugin_dir } => {
            let config = RunConfig::example();
            let backends = runner::discover_backends(&config, plugin_dir.as_deref())?;
            let mut registry = toy::registry()?;
            registry.apply_backend_status(&backends);
            runner::list(&registry, &backends, &mut io::stdout().lock())?;
        }
        Commands::Init { path, force } => {
            let path = run_file(path)?;
            config::save_run_config(&RunConfig::example(), &path, force)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
