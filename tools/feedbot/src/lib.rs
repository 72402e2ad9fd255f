pub mod action_policy;
pub mod audit;
pub mod config;
pub mod dedup_ledger;
pub mod driver;
pub mod engagement;
pub mod errors;
pub mod fsm;
pub mod item_identity;
pub mod logging;
pub mod run_controller;
pub mod runtime;
pub mod session_store;
pub mod text_generation;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use audit::JsonlAuditSink;
use clap::{error::ErrorKind, Parser, ValueEnum};
use config::{load_config, AppConfig, CliOverrides};
use driver::scripted::{FeedScript, ScriptedDriverFactory};
use engagement::{AccountRun, Engagement};
use errors::FeedbotError;
use logging::{append_run_log, init_run_logger, structured_fallback_line, JsonlLogger};
use run_controller::StopSignal;
use runtime::{ProductionRandomFactory, RandomSourceFactory, Runtime};
use serde_json::json;
use session_store::{SessionFilter, SessionStore};
use text_generation::TemplateTextGenerator;
use types::SessionMaterial;

#[derive(Debug, Clone, Parser)]
#[command(name = "feedbot")]
#[command(about = "Unattended feed engagement runs with persisted account sessions")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Account to run as. Repeat to run several accounts concurrently.
    #[arg(long = "account")]
    pub accounts: Vec<String>,
    #[arg(long)]
    pub target: Option<u32>,
    /// Seed the action policy RNG for a replayable run.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Store the file's bytes as the session material of the single `--account`.
    #[arg(long)]
    pub import_session: Option<PathBuf>,
    #[arg(long)]
    pub bot_type: Option<String>,
    #[arg(long)]
    pub user_agent: Option<String>,
    #[arg(long, default_value_t = false)]
    pub session_stats: bool,
    #[arg(long, default_value_t = false)]
    pub cleanup_sessions: bool,
    #[arg(long, default_value_t = false)]
    pub purge_invalidated: bool,
    #[arg(long)]
    pub invalidate_session: Option<String>,
    #[arg(long)]
    pub delete_session: Option<String>,
    #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "all")]
    pub list_sessions: Option<CliSessionFilter>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliSessionFilter {
    All,
    Valid,
    Invalid,
}

impl From<CliSessionFilter> for SessionFilter {
    fn from(value: CliSessionFilter) -> Self {
        match value {
            CliSessionFilter::All => SessionFilter::All,
            CliSessionFilter::Valid => SessionFilter::Valid,
            CliSessionFilter::Invalid => SessionFilter::Invalid,
        }
    }
}

impl Cli {
    fn is_session_command(&self) -> bool {
        self.import_session.is_some()
            || self.session_stats
            || self.cleanup_sessions
            || self.purge_invalidated
            || self.invalidate_session.is_some()
            || self.delete_session.is_some()
            || self.list_sessions.is_some()
    }
}

pub fn run() -> Result<i32, FeedbotError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| FeedbotError::Io(e.to_string()))?;
    let runtime = Runtime::production();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &Runtime,
) -> Result<i32, FeedbotError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(FeedbotError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        target: cli.target,
        bot_type: cli.bot_type.clone(),
        user_agent: cli.user_agent.clone(),
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;

    let mut logger = JsonlLogger::new(&cfg.logging.run_log_path);
    logger.max_payload_bytes = cfg.logging.max_payload_bytes;
    logger.budget_bytes = cfg.logging.budget_bytes;
    init_run_logger(logger)?;
    append_run_log(
        "info",
        "cli.started",
        json!({
            "accounts": cli.accounts,
            "session_command": cli.is_session_command(),
            "db_path": cfg.session.db_path.display().to_string(),
        }),
    );

    let store = SessionStore::open(
        &cfg.session.db_path,
        Arc::clone(&runtime.clock),
        cfg.session.max_session_age(),
    )?;

    if cli.is_session_command() {
        run_session_commands(&cli, &cfg, &store, runtime)?;
        return Ok(0);
    }

    run_engagement(&cli, &cfg, &store, runtime)
}

fn run_session_commands(
    cli: &Cli,
    cfg: &AppConfig,
    store: &SessionStore,
    runtime: &Runtime,
) -> Result<(), FeedbotError> {
    let terminal = runtime.terminal.as_ref();

    if let Some(path) = &cli.import_session {
        let [account] = cli.accounts.as_slice() else {
            return Err(FeedbotError::Cli(
                "--import-session needs exactly one --account".to_string(),
            ));
        };
        let bytes = runtime.file_system.read_bytes(path)?;
        if bytes.is_empty() {
            return Err(FeedbotError::Cli(format!(
                "session file is empty: {}",
                path.display()
            )));
        }
        let record = store.upsert(
            account,
            SessionMaterial::new(bytes),
            &cfg.session.bot_type,
            cfg.session.user_agent.as_deref(),
        )?;
        terminal.write_line(&format!(
            "imported session for {} (login_count={})",
            record.account_id, record.metadata.login_count
        ))?;
    }

    if let Some(account) = &cli.invalidate_session {
        store.invalidate(account)?;
        terminal.write_line(&format!("invalidated session for {account}"))?;
    }

    if let Some(account) = &cli.delete_session {
        let removed = store.delete(account)?;
        terminal.write_line(&format!(
            "{} session for {account}",
            if removed { "deleted" } else { "no" }
        ))?;
    }

    if cli.cleanup_sessions {
        let flipped = store.cleanup_expired()?;
        terminal.write_line(&format!("expired sessions invalidated: {flipped}"))?;
    }

    if cli.purge_invalidated {
        let deleted = store.delete_old_invalidated(cfg.session.invalidated_retention())?;
        terminal.write_line(&format!("invalidated sessions purged: {deleted}"))?;
    }

    if let Some(filter) = cli.list_sessions {
        let now = runtime.clock.now_unix_ms();
        for record in store.list(filter.into())? {
            terminal.write_line(&format!(
                "{} valid={} bot_type={} login_count={} age_hours={:.1}",
                record.account_id,
                record.is_valid_at(now, store.max_age()),
                record.metadata.bot_type,
                record.metadata.login_count,
                record.age_hours(now)
            ))?;
        }
    }

    if cli.session_stats {
        let stats = store.stats()?;
        let rendered =
            serde_json::to_string_pretty(&stats).map_err(|e| FeedbotError::Io(e.to_string()))?;
        for line in rendered.lines() {
            terminal.write_line(line)?;
        }
    }

    Ok(())
}

fn run_engagement(
    cli: &Cli,
    cfg: &AppConfig,
    store: &SessionStore,
    runtime: &Runtime,
) -> Result<i32, FeedbotError> {
    if cli.accounts.is_empty() {
        return Err(FeedbotError::Cli(
            "at least one --account is required to start a run".to_string(),
        ));
    }
    let Some(script_path) = &cfg.driver.feed_script else {
        return Err(FeedbotError::InvalidConfig(
            "driver.feed_script must be set to start a run".to_string(),
        ));
    };
    let script = FeedScript::from_json(&runtime.file_system.read_to_string(script_path)?)?;
    let factory = ScriptedDriverFactory::new(script);

    let random: Arc<dyn RandomSourceFactory> = match cli.seed {
        Some(seed) => Arc::new(ProductionRandomFactory::seeded(seed)),
        None => Arc::clone(&runtime.random),
    };
    let engagement = Engagement {
        store,
        run_config: &cfg.run,
        bot_type: &cfg.session.bot_type,
        user_agent: cfg.session.user_agent.as_deref(),
        clock: Arc::clone(&runtime.clock),
        random,
        text: Arc::new(TemplateTextGenerator::from_config(&cfg.text)),
        audit: Arc::new(JsonlAuditSink::open(&cfg.logging.audit_log_path)?),
        stop: StopSignal::new(),
    };

    let results = engagement.run_accounts(&cli.accounts, &factory);
    let mut exit_code = 0;
    for (account, result) in results {
        match result {
            Ok(run) => {
                if run.report.outcome.is_failed() {
                    exit_code = 1;
                }
                report_run(runtime, &run)?;
            }
            Err(err) => {
                exit_code = 1;
                append_run_log(
                    "error",
                    "cli.account.failed",
                    json!({ "account_id": account, "error": err.to_string() }),
                );
                runtime
                    .terminal
                    .write_line(&format!("{account}: {err}"))?;
            }
        }
    }
    Ok(exit_code)
}

fn report_run(runtime: &Runtime, run: &AccountRun) -> Result<(), FeedbotError> {
    let stats = run.report.stats;
    let mut message = format!(
        "account={} processed={} favorites={} comments={} replies={}",
        run.account_id, stats.items_processed, stats.favorites, stats.comments, stats.replies
    );
    if let run_controller::RunOutcome::Failed(failure) = &run.report.outcome {
        message.push_str(&format!(" error={failure}"));
    }
    if run.session_refreshed {
        message.push_str(" session=refreshed");
    }
    if run.session_invalidated {
        message.push_str(" session=invalidated");
    }

    let line = if runtime.terminal.stdin_is_tty() {
        format!("{} [{}] {message}", run.report.run_id, run.report.outcome.label())
    } else {
        structured_fallback_line(&run.report.run_id, run.report.outcome.label(), &message)
    };
    runtime.terminal.write_line(&line)
}
