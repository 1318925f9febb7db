use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cmorize_core::checkpoint::PipelineDb;
use cmorize_core::{CmorizeConfig, Cmorizer};

#[derive(Parser, Debug)]
#[command(author, version, about = "CMORize climate-model output", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every rule in a configuration file
    Run(RunArgs),
    /// Load and validate a configuration file without processing anything
    Validate {
        config: PathBuf,
    },
    /// Inspect or clear pipeline checkpoint state
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    config: PathBuf,
    /// Run rules one after another even when the configuration enables
    /// parallel processing
    #[arg(long)]
    serial: bool,
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
    /// Show the recorded step state of one pipeline run
    Inspect(CheckpointArgs),
    /// Drop the recorded state and cached artifacts of one pipeline run
    Clear(CheckpointArgs),
}

#[derive(Args, Debug)]
struct CheckpointArgs {
    /// Flow name, `<pipeline>-<rule>`
    name: String,
    /// Directory holding the checkpoint stores
    #[arg(long, default_value = ".checkpoints")]
    dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Validate { config } => validate(&config),
        Command::Checkpoint { command } => match command {
            CheckpointCommand::Inspect(args) => inspect_checkpoint(&args),
            CheckpointCommand::Clear(args) => clear_checkpoint(&args),
        },
    }
}

fn load_config(path: &Path) -> Result<CmorizeConfig> {
    CmorizeConfig::from_file(path)
        .with_context(|| format!("cannot load configuration from {}", path.display()))
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if args.serial && config.settings.parallel {
        warn!("parallel processing disabled from the command line");
        config.settings.parallel = false;
    }

    let mut cmorizer = Cmorizer::from_config(config)?;
    let summary = cmorizer.process()?;
    info!(
        rules = summary.rules_processed,
        files = summary.written_files.len(),
        "cmorization finished"
    );
    for file in &summary.written_files {
        println!("{}", file.display());
    }
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let cmorizer = Cmorizer::from_config(config)?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["rule", "variable", "pipelines", "data request"]);
    for rule in cmorizer.rules() {
        let pipelines = rule
            .pipelines()
            .map(|ps| {
                ps.iter()
                    .map(|p| p.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|_| "<unresolved>".to_string());
        let request = match &rule.data_request_variable {
            Some(drv) => format!("{} [{}]", drv.unit, drv.tables.join(", ")),
            None => "missing".to_string(),
        };
        table.add_row(vec![
            rule.name.clone(),
            rule.cmor_variable.clone(),
            pipelines,
            request,
        ]);
    }
    println!("{table}");

    for dr_table in &cmorizer.data_request().tables {
        let missing = cmorizer.check_rules_for_table(&dr_table.table_id);
        if !missing.is_empty() {
            warn!(
                table = dr_table.table_id,
                variables = missing.join(", "),
                "table variables without a producing rule"
            );
        }
    }
    println!("configuration ok");
    Ok(())
}

fn inspect_checkpoint(args: &CheckpointArgs) -> Result<()> {
    let mut db = PipelineDb::new(args.name.as_str(), &args.dir);
    db.load()
        .with_context(|| format!("cannot read checkpoint store for {}", args.name))?;
    if db.is_empty() {
        println!("no recorded state for {}", args.name);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["step", "status", "started", "finished"]);
    let keys: Vec<String> = db.keys().map(|k| k.to_string()).collect();
    for key in keys {
        let entry = db
            .entry_by_key(&key)
            .map(|e| e.clone())
            .unwrap_or_default();
        let field = |name: &str| {
            entry
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("-")
                .to_string()
        };
        table.add_row(vec![
            key,
            field("status"),
            field("started_at"),
            field("finished_at"),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn clear_checkpoint(args: &CheckpointArgs) -> Result<()> {
    let mut db = PipelineDb::new(args.name.as_str(), &args.dir);
    db.load()
        .with_context(|| format!("cannot read checkpoint store for {}", args.name))?;
    db.clear()
        .with_context(|| format!("cannot clear checkpoint store for {}", args.name))?;
    info!(flow = args.name, "checkpoint state cleared");
    Ok(())
}
