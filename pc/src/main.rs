//! Picard - coupled field and heat-fluids iteration
//!
//! CLI entry point for running and checking coupled simulations.

use std::fs;
use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches};
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use picard::cli::{Cli, Command, OutputFormat, generate_after_help, get_log_path};
use picard::config::Config;
use picard::engine::RunSummary;
use picard::launcher::launch;
use picard::topology::Partition;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run { format } => {
            debug!(%format, "main: matched Run command");
            cmd_run(&config, format).await
        }
        Command::Check => {
            debug!("main: matched Check command");
            cmd_check(&config)
        }
    }
}

async fn cmd_run(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_run: called");
    let summary = launch(config).await.context("Coupled run failed")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary).context("Failed to encode summary")?);
        }
        OutputFormat::Text => print_summary(&summary),
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("{} {}", "Run".bold(), summary.run_id.to_string().cyan());
    println!(
        "  norm: {}  epsilon: {:e}  iterations: {}",
        summary.norm,
        summary.epsilon,
        summary.total_iterations()
    );
    if let Some(secs) = summary.elapsed_secs() {
        println!("  elapsed: {:.3}s", secs);
    }

    for step in &summary.timesteps {
        let status = if step.converged {
            "converged".green()
        } else {
            "not converged".yellow()
        };
        let norm = step
            .final_norm
            .map(|n| format!("{:e}", n))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  time step {:>3}: {} after {} iterations (norm {})",
            step.timestep, status, step.iterations, norm
        );
    }
}

fn cmd_check(config: &Config) -> Result<()> {
    debug!("cmd_check: called");
    config.validate().context("Invalid configuration")?;
    let partition = Partition::new(config.pool_size(), config.field.ranks(), config.heat_fluids.ranks())
        .context("Invalid partition")?;

    println!("{} Configuration is valid", "✓".green());
    println!("  pool:        {} ranks", partition.pool);
    println!(
        "  field:       ranks {:?} ({} driver)",
        partition.field_ranks(),
        config.field.driver.cyan()
    );
    println!(
        "  heat-fluids: ranks {:?} ({} driver)",
        partition.heat_ranks(),
        config.heat_fluids.driver.cyan()
    );
    if !partition.idle_ranks().is_empty() {
        println!("  idle:        ranks {:?}", partition.idle_ranks());
    }

    let coupling = &config.coupling;
    println!(
        "  picard:      {} time steps x {} iterations, {} norm < {:e}",
        coupling.max_timesteps, coupling.max_picard_iter, coupling.convergence_norm, coupling.epsilon
    );
    Ok(())
}
