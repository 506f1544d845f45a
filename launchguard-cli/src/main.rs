//! Launchguard host binary
//!
//! Runs the startup migration sequence before handing over to the service process, and
//! offers a couple of operator commands around it.
//!
//! ```text
//! launchguard run -- ./catalog-service --port 8080
//! launchguard status
//! launchguard new "add product sku index"
//! launchguard new "demo catalog" --seed development
//! ```

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use launchguard::migration::{MigrationEngine, MigrationStatus};
use launchguard::script::new_script_name;
use launchguard::{
    resolve_connection_string, DirectoryScriptSource, MigrationConfig, MigrationOrchestrator,
    PgSession, ScriptSource, SeedEnvironment, SystemClock,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "launchguard")]
#[command(about = "Startup schema migrations for PostgreSQL services")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (optional; LAUNCHGUARD__* env vars override it)
    #[arg(long, default_value = launchguard::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate and seed once, then exec the follow-up command
    Run {
        /// Write Prometheus metrics to this file after the run
        #[arg(long)]
        metrics_file: Option<PathBuf>,

        /// Command started after the run unless a migration failed
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Show applied, pending and changed migration scripts
    Status,

    /// Create an empty, correctly named script file
    New {
        /// Short description, e.g. "add product sku index"
        description: String,

        /// Create a seed script for this environment instead of a migration
        #[arg(long)]
        seed: Option<String>,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let result = match cli.command {
        Commands::Run { metrics_file, command } => handle_run(&cli.config, metrics_file.as_deref(), &command),
        Commands::Status => handle_status(&cli.config).map(|()| 0),
        Commands::New { description, seed } => {
            handle_new(&cli.config, &description, seed.as_deref()).map(|()| 0)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            process::exit(1);
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<MigrationConfig> {
    MigrationConfig::load_from(path).with_context(|| format!("loading {}", path.display()))
}

fn handle_run(config_path: &Path, metrics_file: Option<&Path>, command: &[String]) -> anyhow::Result<i32> {
    let config = load_config(config_path)?;
    let orchestrator = MigrationOrchestrator::from_config(config);

    let result = orchestrator.run_then(|| follow_up(command));

    if let Some(path) = metrics_file {
        if let Err(e) = write_metrics(path) {
            log::warn!("{:#}", e);
        }
    }

    // Err here means a migration failed; seed and other failures were logged by the
    // orchestrator and the follow-up command has already run.
    let continued = result?;
    if let Err(e) = &continued.report {
        eprintln!("{} {}", "warning:".yellow().bold(), e);
    }
    continued.output
}

/// Run the follow-up command and return its exit code (0 when there is none).
fn follow_up(command: &[String]) -> anyhow::Result<i32> {
    let Some((program, args)) = command.split_first() else {
        return Ok(0);
    };
    log::info!("starting {}", program);
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to start {}", program))?;
    Ok(status.code().unwrap_or(1))
}

fn write_metrics(path: &Path) -> anyhow::Result<()> {
    let text = launchguard::metrics::METRICS
        .gather()
        .context("encoding metrics")?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn handle_status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let connection_string = resolve_connection_string(&config.database, &config.application_name);
    if connection_string.is_empty() {
        bail!(
            "database connection is not configured (missing: {})",
            config.database.missing_fields().join(", ")
        );
    }

    let scripts = DirectoryScriptSource::new(&config.scripts_dir).list(&config.migrations_location)?;
    let session = PgSession::connect(&connection_string)?;
    let engine = MigrationEngine::new(config.ledger_table.as_str(), Arc::new(SystemClock::new()));
    let status = engine.status(&scripts, &session)?;

    print_status(&status);
    Ok(())
}

fn print_status(status: &MigrationStatus) {
    println!("\n{}\n", "Migration Status".bold());

    if status.applied.is_empty() {
        println!("{} none", "Applied:".green());
    } else {
        println!("{} ({})", "Applied:".green(), status.applied.len());
        for record in &status.applied {
            let time = record
                .execution_time_ms
                .map_or_else(|| "N/A".to_string(), |ms| format!("{}ms", ms));
            println!(
                "  ✓ {} ({}, {})",
                record.script_id,
                record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                time
            );
        }
    }

    println!();
    if status.pending.is_empty() {
        println!("{} none", "Pending:".yellow());
    } else {
        println!("{} ({})", "Pending:".yellow(), status.pending.len());
        for id in &status.pending {
            println!("  ⏳ {}", id);
        }
    }

    if !status.drifted.is_empty() {
        println!();
        println!("{} ({})", "Changed after apply:".red(), status.drifted.len());
        for id in &status.drifted {
            println!("  ! {}", id);
        }
    }

    if !status.unknown.is_empty() {
        println!();
        println!("{} ({})", "In ledger without a script:".dimmed(), status.unknown.len());
        for id in &status.unknown {
            println!("  ? {}", id);
        }
    }

    println!(
        "\nSummary: {} applied, {} pending",
        status.applied.len(),
        status.pending.len()
    );
}

fn handle_new(config_path: &Path, description: &str, seed: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let path = create_script(&config, description, seed)?;
    println!("{} {}", "Created".green(), path.display());
    Ok(())
}

fn create_script(config: &MigrationConfig, description: &str, seed: Option<&str>) -> anyhow::Result<PathBuf> {
    if description.trim().is_empty() {
        bail!("description must not be empty");
    }
    let location = match seed {
        Some(environment) => SeedEnvironment::new(environment)?.location(&config.seeds_location),
        None => config.migrations_location.clone(),
    };
    let directory = DirectoryScriptSource::new(&config.scripts_dir).directory(&location)?;
    fs::create_dir_all(&directory).with_context(|| format!("creating {}", directory.display()))?;

    let name = new_script_name(description, Utc::now());
    let path = directory.join(format!("{}.sql", name));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("creating {}", path.display()))?;
    writeln!(file, "-- {}", description.trim())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> MigrationConfig {
        MigrationConfig {
            scripts_dir: root.to_path_buf(),
            ..MigrationConfig::default()
        }
    }

    #[test]
    fn test_create_migration_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = create_script(&config(dir.path()), "add product sku index", None).unwrap();

        assert!(path.starts_with(dir.path().join("migrations")));
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert!(launchguard::script::is_valid_script_id(stem));
        assert!(stem.ends_with("-add_product_sku_index"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "-- add product sku index\n");
    }

    #[test]
    fn test_create_seed_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = create_script(&config(dir.path()), "demo catalog", Some("staging")).unwrap();

        assert!(path.starts_with(dir.path().join("seeds").join("staging")));
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(create_script(&config(dir.path()), "  ", None).is_err());
        assert!(create_script(&config(dir.path()), "demo", Some("../prod")).is_err());
    }

    #[test]
    fn test_follow_up_without_command() {
        assert_eq!(follow_up(&[]).unwrap(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn test_run_starts_follow_up_when_database_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("launchguard.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[migrations]
scripts_dir = "{}"
lock_max_wait_seconds = 1

[migrations.database]
host = "127.0.0.1"
port = 1
name = "catalog"
user = "catalog"
password = "secret"
"#,
                dir.path().display()
            ),
        )
        .unwrap();
        let marker = dir.path().join("started");
        let command = vec![
            "touch".to_string(),
            marker.to_string_lossy().into_owned(),
        ];

        let code = handle_run(&config_path, None, &command).unwrap();

        assert_eq!(code, 0);
        assert!(marker.exists());
    }
}
