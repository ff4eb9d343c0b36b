use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vaultkeeper_api::{BackupRequest, DeleteAllRequest, VaultApi, VaultConfig};
use vaultkeeper_archive::{
    AutoApprove, BackupError, ErrorKind, ImportMode, Operator, Question, RestoreOptions,
    DELETE_CONFIRMATION_TOKEN,
};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const EXIT_FAILURE: u8 = 1;
const EXIT_ABORTED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "vk")]
#[command(about = "Vaultkeeper backup and restore CLI")]
struct Cli {
    /// YAML config file; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    asset_root: Option<PathBuf>,

    /// Answer yes to every yes/no prompt
    #[arg(long, global = true, default_value_t = false)]
    yes: bool,

    /// Repeat for more log output on stderr
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    Data {
        #[command(subcommand)]
        command: DataCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    Create(CreateArgs),
    Verify(VerifyArgs),
    Restore(RestoreArgs),
    Analyze(AnalyzeArgs),
    RestoreSelected(RestoreSelectedArgs),
    ValidateStore,
}

#[derive(Debug, Subcommand)]
enum DataCommand {
    DeleteAll(DeleteAllArgs),
    Renumber,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    no_media: bool,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    archive: PathBuf,
    #[arg(long, default_value_t = false)]
    detailed: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    archive: PathBuf,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Restore despite validation warnings and skip the clear confirmation
    #[arg(long, default_value_t = false)]
    force: bool,
    #[arg(long, default_value_t = false)]
    clear: bool,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    archive: PathBuf,
}

#[derive(Debug, Args)]
struct RestoreSelectedArgs {
    archive: PathBuf,
    #[arg(long = "model", required = true)]
    models: Vec<String>,
    #[arg(long, value_enum, default_value_t = ModeArg::Overwrite)]
    mode: ModeArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Overwrite,
    SkipExisting,
}

impl From<ModeArg> for ImportMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Overwrite => ImportMode::Overwrite,
            ModeArg::SkipExisting => ImportMode::SkipExisting,
        }
    }
}

#[derive(Debug, Args)]
struct DeleteAllArgs {
    /// Skip the typed confirmation and continue past a failed safety backup
    #[arg(long, default_value_t = false)]
    force: bool,
    #[arg(long, default_value_t = false)]
    no_backup: bool,
    #[arg(long, default_value_t = false)]
    skip_backup_on_failure: bool,
    /// Confirmation token, instead of typing it at the prompt
    #[arg(long)]
    confirm: Option<String>,
}

/// Asks on stderr and reads answers from stdin. A closed stdin answers no.
struct TerminalOperator;

impl TerminalOperator {
    fn ask(prompt: &str) -> Option<String> {
        eprint!("{prompt}");
        io::stderr().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }

    fn describe(question: &Question<'_>) -> String {
        match question {
            Question::ProceedWithWarnings { warnings } => {
                let mut text = format!(
                    "archive validation produced {} warnings:\n",
                    warnings.len()
                );
                for warning in warnings.iter().take(vaultkeeper_archive::DISPLAY_LIMIT) {
                    text.push_str(&format!("  - {warning}\n"));
                }
                text.push_str("continue with the restore? [y/N] ");
                text
            }
            Question::ClearExisting { records } => {
                format!("delete all {records} existing records before restoring? [y/N] ")
            }
            Question::ContinueWithoutBackup { error } => {
                format!("safety backup failed: {error}\ndelete data without a backup? [y/N] ")
            }
            Question::ConfirmDeletion { preview } => {
                let mut text = String::from("the following records will be permanently deleted:\n");
                for (model, count) in preview.iter() {
                    text.push_str(&format!("  {model}: {count}\n"));
                }
                text.push_str(&format!("type {DELETE_CONFIRMATION_TOKEN} to confirm: "));
                text
            }
        }
    }
}

impl Operator for TerminalOperator {
    fn confirm(&self, question: &Question<'_>) -> bool {
        Self::ask(&Self::describe(question))
            .is_some_and(|answer| matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    fn typed_token(&self, question: &Question<'_>) -> Option<String> {
        Self::ask(&Self::describe(question))
    }
}

/// `--yes` answers prompts but never types the delete token.
struct YesOperator;

impl Operator for YesOperator {
    fn confirm(&self, question: &Question<'_>) -> bool {
        AutoApprove.confirm(question)
    }

    fn typed_token(&self, question: &Question<'_>) -> Option<String> {
        TerminalOperator.typed_token(question)
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(&with_contract_version(value))?;
    println!("{rendered}");
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<VaultConfig> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => VaultConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.database.clone_from(db);
    }
    if let Some(backup_dir) = &cli.backup_dir {
        config.backup_dir.clone_from(backup_dir);
    }
    if let Some(asset_root) = &cli.asset_root {
        config.asset_root.clone_from(asset_root);
    }
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_failure(&err),
    }
}

fn report_failure(err: &anyhow::Error) -> ExitCode {
    let backup_error = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<BackupError>());
    let aborted = backup_error.is_some_and(BackupError::is_operator_abort);
    let mut payload = serde_json::json!({
        "status": if aborted { "aborted" } else { "failed" },
        "aborted": aborted,
        "error": format!("{err:#}"),
        "kind": backup_error.map(|error| error.kind().as_str()),
    });
    if let Some(validation) = backup_error.and_then(BackupError::validation) {
        payload["validation"] = serde_json::to_value(validation).unwrap_or(Value::Null);
    }
    if emit_json(payload).is_err() {
        eprintln!("{err:#}");
    }
    ExitCode::from(if aborted { EXIT_ABORTED } else { EXIT_FAILURE })
}

fn run(cli: &Cli) -> Result<()> {
    let api = VaultApi::new(load_config(cli)?)?;
    debug!(database = %api.config().database.display(), "configuration loaded");
    let operator: &dyn Operator = if cli.yes {
        &YesOperator
    } else {
        &TerminalOperator
    };
    match &cli.command {
        Command::Backup { command } => run_backup(command, &api, operator),
        Command::Data { command } => run_data(command, &api, operator),
        Command::Db { command } => run_db(command, &api),
    }
}

fn run_backup(command: &BackupCommand, api: &VaultApi, operator: &dyn Operator) -> Result<()> {
    match command {
        BackupCommand::Create(args) => {
            let summary = api.create_backup(&BackupRequest {
                output: args.out.clone(),
                include_assets: !args.no_media,
            })?;
            emit_json(serde_json::json!({
                "status": "ok",
                "archive": summary.path,
                "archive_bytes": summary.archive_bytes,
                "sha256": summary.sha256,
                "manifest": summary.manifest
            }))
        }
        BackupCommand::Verify(args) => {
            let outcome = api.verify_backup(&args.archive, args.detailed)?;
            for line in outcome.view.lines() {
                eprintln!("{line}");
            }
            if !outcome.result.success {
                return Err(BackupError::ValidationFailed {
                    kind: outcome.failure.unwrap_or(ErrorKind::Structural),
                    result: Box::new(outcome.result),
                }
                .into());
            }
            emit_json(serde_json::json!({
                "archive": outcome.archive,
                "valid": true,
                "summary": outcome.view.summary,
                "validation": outcome.result
            }))
        }
        BackupCommand::Restore(args) => {
            let options = RestoreOptions {
                clear_first: args.clear,
                dry_run: args.dry_run,
                force_ignore_warnings: args.force,
            };
            let report = api.restore_backup(&args.archive, &options, operator)?;
            emit_json(serde_json::json!({
                "status": "ok",
                "archive": args.archive,
                "report": report
            }))
        }
        BackupCommand::Analyze(args) => {
            let analysis = api.analyze_archive(&args.archive)?;
            emit_json(serde_json::to_value(&analysis).context("failed to serialize analysis")?)
        }
        BackupCommand::RestoreSelected(args) => {
            let token = api.stage_upload(&args.archive)?;
            let report = api.restore_selected(token, &args.models, args.mode.into());
            api.discard_upload(token);
            emit_json(serde_json::json!({
                "status": "ok",
                "archive": args.archive,
                "report": report?
            }))
        }
        BackupCommand::ValidateStore => {
            let scan = api.validate_store()?;
            if !scan.result.success {
                return Err(BackupError::ValidationFailed {
                    kind: ErrorKind::Integrity,
                    result: Box::new(scan.result),
                }
                .into());
            }
            emit_json(serde_json::json!({
                "valid": true,
                "orphaned_records": scan.orphaned_records,
                "validation": scan.result
            }))
        }
    }
}

fn run_data(command: &DataCommand, api: &VaultApi, operator: &dyn Operator) -> Result<()> {
    match command {
        DataCommand::DeleteAll(args) => {
            let report = api.delete_all(
                &DeleteAllRequest {
                    force: args.force,
                    skip_backup: args.no_backup,
                    skip_backup_on_failure: args.skip_backup_on_failure,
                    confirmation: args.confirm.clone(),
                },
                operator,
            )?;
            emit_json(serde_json::json!({
                "status": if report.failures.is_empty() { "ok" } else { "partial" },
                "report": report
            }))
        }
        DataCommand::Renumber => {
            let outcome = api.renumber_identifiers()?;
            let value =
                serde_json::to_value(outcome).context("failed to serialize renumber outcome")?;
            emit_json(value)
        }
    }
}

fn run_db(command: &DbCommand, api: &VaultApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let result = api.migrate()?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            emit_json(value)
        }
    }
}
