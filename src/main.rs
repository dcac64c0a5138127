use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use sheetpool::engine::workbook::{CellValue, Workbook};
use sheetpool::{
    ActionRegistry, OperationResult, Orchestrator, OrchestratorConfig, REQUIRED_ACTIONS,
    WorkbookFactory,
};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "sheetpool")]
#[command(about = "Run workbook actions through a pooled, session-based engine layer")]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty workbook
    Create { file: PathBuf },
    /// Set one cell and save
    Set {
        file: PathBuf,
        sheet: String,
        cell: String,
        /// JSON literal (42, true, "text", null) or bare text
        value: String,
    },
    /// Print one cell
    Get {
        file: PathBuf,
        sheet: String,
        cell: String,
    },
    /// Run a JSON-lines script of {"action": .., "args": {..}} calls
    Exec {
        file: PathBuf,
        script: PathBuf,
        /// Run every line in one batch, saving once at the end
        #[arg(long)]
        batch: bool,
        /// Discard changes instead of saving
        #[arg(long)]
        no_save: bool,
    },
    /// List registered actions
    Actions,
}

#[derive(Deserialize)]
struct ScriptLine {
    action: String,
    #[serde(default)]
    args: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_json_file(path)?,
        None => OrchestratorConfig::default(),
    };

    let registry = ActionRegistry::with_default_actions();
    registry.validate(REQUIRED_ACTIONS)?;

    match cli.command {
        Command::Create { file } => {
            Workbook::create_file(&file)?;
            println!("Created {}", file.display());
            Ok(())
        }
        Command::Actions => {
            for action in registry.list() {
                println!(
                    "{:<18} {:<9} {}",
                    action.name,
                    action.category.to_string(),
                    action.description
                );
            }
            Ok(())
        }
        Command::Set {
            file,
            sheet,
            cell,
            value,
        } => {
            let args = json!({ "sheet": sheet, "cell": cell, "value": parse_value(&value) });
            run_single(config, &registry, &file, "range.set", args).await
        }
        Command::Get { file, sheet, cell } => {
            let args = json!({ "sheet": sheet, "cell": cell });
            run_single(config, &registry, &file, "range.get", args).await
        }
        Command::Exec {
            file,
            script,
            batch,
            no_save,
        } => run_script(config, &registry, &file, &script, batch, !no_save).await,
    }
}

fn parse_value(raw: &str) -> Option<CellValue> {
    serde_json::from_str::<Option<CellValue>>(raw)
        .unwrap_or_else(|_| Some(CellValue::Text(raw.to_string())))
}

fn print_result(result: &OperationResult<Value>) -> Result<()> {
    println!("{}", serde_json::to_string(result)?);
    Ok(())
}

async fn run_single(
    config: OrchestratorConfig,
    registry: &ActionRegistry,
    file: &Path,
    action: &str,
    args: Value,
) -> Result<()> {
    let orchestrator = Orchestrator::initialize(WorkbookFactory::new(), config).await?;
    let result = orchestrator
        .dispatch(registry, None, file, true, action, &args)
        .await;
    orchestrator.shutdown().await?;

    print_result(&result)?;
    if !result.success {
        bail!(
            "{} failed: {}",
            action,
            result.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_script(
    config: OrchestratorConfig,
    registry: &ActionRegistry,
    file: &Path,
    script: &Path,
    batch: bool,
    save: bool,
) -> Result<()> {
    let text = fs::read_to_string(script)
        .with_context(|| format!("Failed to read script {}", script.display()))?;
    let mut lines = Vec::new();
    for (no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed: ScriptLine = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid script line", script.display(), no + 1))?;
        lines.push(parsed);
    }

    let orchestrator = Orchestrator::initialize(WorkbookFactory::new(), config).await?;
    let batch_id = if batch {
        Some(orchestrator.begin_batch(file).await?)
    } else {
        None
    };

    let mut failed = 0;
    for line in &lines {
        let result = orchestrator
            .dispatch(registry, batch_id, file, save, &line.action, &line.args)
            .await;
        if !result.success {
            failed += 1;
        }
        print_result(&result)?;
    }

    let committed = match batch_id {
        Some(id) => orchestrator.commit_batch(id, save).await,
        None => Ok(()),
    };
    orchestrator.shutdown().await?;
    committed.context("Failed to commit batch")?;

    if failed > 0 {
        return Err(anyhow!("{} of {} action(s) failed", failed, lines.len()));
    }
    Ok(())
}
