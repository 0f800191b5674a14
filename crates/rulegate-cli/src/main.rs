//! Rulegate CLI
//!
//! Offline tooling over the rulegate pipeline components.
//!
//! # Usage
//! ```bash
//! rulegate compile rules.md
//! rulegate analyze answer.txt --json
//! rulegate check --rules rules.md answer.txt
//! rulegate audit --log audit.jsonl --subject alice --since-hours 24
//! rulegate -c rulegate.toml audit --subject alice
//! rulegate init-config
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rulegate_core::config::DEFAULT_CONFIG_FILE;
use rulegate_core::RulegateConfig;

/// Rulegate - rule compilation, quality scoring and audit inspection
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to $RULEGATE_CONFIG, then ./rulegate.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a rule file and print the rules with diagnostics
    Compile {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Score a result file with the quality validator
    Analyze {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Run the quality gate and compliance check; exits with 2 when blocked
    Check {
        /// Rule file to compile
        #[arg(short, long)]
        rules: PathBuf,

        /// Result file to check
        result: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Summarize the audit trail for one subject
    Audit {
        /// JSON lines audit log; defaults to the configured audit sink
        #[arg(short, long)]
        log: Option<PathBuf>,

        #[arg(short, long)]
        subject: String,

        /// Only records from the last N hours
        #[arg(long)]
        since_hours: Option<i64>,

        #[arg(long)]
        json: bool,
    },

    /// Write the default configuration file
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RulegateConfig> {
    match path {
        Some(path) => Ok(RulegateConfig::from_file(path)?),
        None => Ok(RulegateConfig::load()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    tracing::debug!("Configuration: {:?}", config);

    match cli.command {
        Commands::Compile { file, json } => commands::compile(&file, json)?,
        Commands::Analyze { file, json } => commands::analyze(&file, json, &config)?,
        Commands::Check {
            rules,
            result,
            json,
        } => {
            let status = commands::check(&rules, &result, json, &config)?;
            if status != 0 {
                std::process::exit(status);
            }
        }
        Commands::Audit {
            log,
            subject,
            since_hours,
            json,
        } => commands::audit(log.as_deref(), &subject, since_hours, json, &config).await?,
        Commands::InitConfig { path, force } => commands::init_config(&path, force)?,
    }

    Ok(())
}
