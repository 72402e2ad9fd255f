use crate::errors::FeedbotError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub target: Option<u32>,
    pub bot_type: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub run: RunConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    pub text: TextConfig,
    pub driver: DriverConfig,
}

/// Per-run policy. The three probabilities are independent Bernoulli
/// parameters, so their sum may exceed 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub target_item_count: u32,
    pub favorite_probability: f64,
    pub comment_probability: f64,
    pub reply_probability: f64,
    pub max_consecutive_empty_scrolls: u32,
    pub initial_load_attempts: u32,
    pub reply_target_limit: u32,
    pub settle_wait_ms: u64,
    pub interruption_wait_ms: u64,
    pub retry_backoff_ms: u64,
}

impl RunConfig {
    pub fn settle_wait(&self) -> Duration {
        Duration::from_millis(self.settle_wait_ms)
    }

    pub fn interruption_wait(&self) -> Duration {
        Duration::from_millis(self.interruption_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_item_count: 10,
            favorite_probability: 0.7,
            comment_probability: 0.3,
            reply_probability: 0.1,
            max_consecutive_empty_scrolls: 3,
            initial_load_attempts: 3,
            reply_target_limit: 5,
            settle_wait_ms: 1500,
            interruption_wait_ms: 3000,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub db_path: PathBuf,
    pub max_session_age_hours: u64,
    pub invalidated_retention_days: u64,
    pub bot_type: String,
    pub user_agent: Option<String>,
}

impl SessionConfig {
    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_hours.saturating_mul(3600))
    }

    pub fn invalidated_retention(&self) -> Duration {
        Duration::from_secs(self.invalidated_retention_days.saturating_mul(86_400))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub run_log_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextConfig {
    pub comment_templates: Vec<String>,
    pub reply_templates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DriverConfig {
    pub feed_script: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            session: SessionConfig {
                db_path: PathBuf::from(".feedbot/sessions.sqlite"),
                max_session_age_hours: 23,
                invalidated_retention_days: 7,
                bot_type: "engagement".to_string(),
                user_agent: None,
            },
            logging: LoggingConfig {
                run_log_path: PathBuf::from(".feedbot/logs/run.jsonl"),
                audit_log_path: PathBuf::from(".feedbot/audit/audit.jsonl"),
                max_payload_bytes: crate::logging::DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
            text: TextConfig {
                comment_templates: vec![
                    "Great point, {author}!".to_string(),
                    "Really interesting take.".to_string(),
                    "Thanks for sharing this.".to_string(),
                ],
                reply_templates: vec![
                    "Agreed, {author}.".to_string(),
                    "Good question, {author}.".to_string(),
                ],
            },
            driver: DriverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    run: Option<PartialRunConfig>,
    session: Option<PartialSessionConfig>,
    logging: Option<PartialLoggingConfig>,
    text: Option<PartialTextConfig>,
    driver: Option<DriverConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRunConfig {
    target_item_count: Option<u32>,
    favorite_probability: Option<f64>,
    comment_probability: Option<f64>,
    reply_probability: Option<f64>,
    max_consecutive_empty_scrolls: Option<u32>,
    initial_load_attempts: Option<u32>,
    reply_target_limit: Option<u32>,
    settle_wait_ms: Option<u64>,
    interruption_wait_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSessionConfig {
    db_path: Option<PathBuf>,
    max_session_age_hours: Option<u64>,
    invalidated_retention_days: Option<u64>,
    bot_type: Option<String>,
    user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    run_log_path: Option<PathBuf>,
    audit_log_path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTextConfig {
    comment_templates: Option<Vec<String>>,
    reply_templates: Option<Vec<String>>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, FeedbotError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| FeedbotError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    resolve_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(run) = partial.run {
        if let Some(value) = run.target_item_count {
            cfg.run.target_item_count = value;
        }
        if let Some(value) = run.favorite_probability {
            cfg.run.favorite_probability = value;
        }
        if let Some(value) = run.comment_probability {
            cfg.run.comment_probability = value;
        }
        if let Some(value) = run.reply_probability {
            cfg.run.reply_probability = value;
        }
        if let Some(value) = run.max_consecutive_empty_scrolls {
            cfg.run.max_consecutive_empty_scrolls = value;
        }
        if let Some(value) = run.initial_load_attempts {
            cfg.run.initial_load_attempts = value;
        }
        if let Some(value) = run.reply_target_limit {
            cfg.run.reply_target_limit = value;
        }
        if let Some(value) = run.settle_wait_ms {
            cfg.run.settle_wait_ms = value;
        }
        if let Some(value) = run.interruption_wait_ms {
            cfg.run.interruption_wait_ms = value;
        }
        if let Some(value) = run.retry_backoff_ms {
            cfg.run.retry_backoff_ms = value;
        }
    }

    if let Some(session) = partial.session {
        if let Some(value) = session.db_path {
            cfg.session.db_path = value;
        }
        if let Some(value) = session.max_session_age_hours {
            cfg.session.max_session_age_hours = value;
        }
        if let Some(value) = session.invalidated_retention_days {
            cfg.session.invalidated_retention_days = value;
        }
        if let Some(value) = session.bot_type {
            cfg.session.bot_type = value;
        }
        if let Some(value) = session.user_agent {
            cfg.session.user_agent = Some(value);
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.run_log_path {
            cfg.logging.run_log_path = value;
        }
        if let Some(value) = logging.audit_log_path {
            cfg.logging.audit_log_path = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(text) = partial.text {
        if let Some(value) = text.comment_templates {
            cfg.text.comment_templates = value;
        }
        if let Some(value) = text.reply_templates {
            cfg.text.reply_templates = value;
        }
    }

    if let Some(driver) = partial.driver {
        cfg.driver = driver;
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(target) = overrides.target {
        cfg.run.target_item_count = target;
    }
    if let Some(bot_type) = &overrides.bot_type {
        cfg.session.bot_type = bot_type.clone();
    }
    if let Some(user_agent) = &overrides.user_agent {
        cfg.session.user_agent = Some(user_agent.clone());
    }
}

fn resolve_paths(cfg: &mut AppConfig, process_cwd: &Path) {
    cfg.session.db_path = absolutize_path(process_cwd, &cfg.session.db_path);
    cfg.logging.run_log_path = absolutize_path(process_cwd, &cfg.logging.run_log_path);
    cfg.logging.audit_log_path = absolutize_path(process_cwd, &cfg.logging.audit_log_path);
    if let Some(script) = &cfg.driver.feed_script {
        cfg.driver.feed_script = Some(absolutize_path(process_cwd, script));
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

pub fn validate_config(cfg: &AppConfig) -> Result<(), FeedbotError> {
    for (name, value) in [
        ("run.favorite_probability", cfg.run.favorite_probability),
        ("run.comment_probability", cfg.run.comment_probability),
        ("run.reply_probability", cfg.run.reply_probability),
    ] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(FeedbotError::InvalidConfig(format!(
                "{name} must be within [0, 1], got {value}"
            )));
        }
    }

    for (name, value) in [
        ("run.target_item_count", cfg.run.target_item_count),
        (
            "run.max_consecutive_empty_scrolls",
            cfg.run.max_consecutive_empty_scrolls,
        ),
        ("run.initial_load_attempts", cfg.run.initial_load_attempts),
        ("run.reply_target_limit", cfg.run.reply_target_limit),
    ] {
        if value == 0 {
            return Err(FeedbotError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }
    }

    if cfg.session.max_session_age_hours == 0 {
        return Err(FeedbotError::InvalidConfig(
            "session.max_session_age_hours must be greater than zero".to_string(),
        ));
    }
    if cfg.session.invalidated_retention() < cfg.session.max_session_age() {
        return Err(FeedbotError::InvalidConfig(
            "session.invalidated_retention_days must cover the session validity window"
                .to_string(),
        ));
    }
    if cfg.session.bot_type.trim().is_empty() {
        return Err(FeedbotError::InvalidConfig(
            "session.bot_type must not be empty".to_string(),
        ));
    }

    if cfg.text.comment_templates.iter().all(|t| t.trim().is_empty())
        || cfg.text.reply_templates.iter().all(|t| t.trim().is_empty())
    {
        return Err(FeedbotError::InvalidConfig(
            "text.comment_templates and text.reply_templates need at least one entry".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    fn load(text: &str, overrides: CliOverrides) -> Result<AppConfig, FeedbotError> {
        let fs = FakeFileSystem::with_file("/cfg.toml", text);
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/cfg.toml")),
            ..overrides
        };
        load_config(&overrides, Path::new("/work"), &fs)
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let cfg = load_config(
            &CliOverrides::default(),
            Path::new("/work"),
            &FakeFileSystem::default(),
        )
        .expect("defaults");
        assert_eq!(cfg.run.target_item_count, 10);
        assert_eq!(cfg.session.max_session_age_hours, 23);
        assert_eq!(cfg.session.db_path, PathBuf::from("/work/.feedbot/sessions.sqlite"));
    }

    #[test]
    fn partial_file_overlays_only_present_keys() {
        let cfg = load(
            "[run]\nfavorite_probability = 1.0\nreply_probability = 0.0\n\n[session]\nbot_type = \"reply-bot\"\n",
            CliOverrides::default(),
        )
        .expect("config");
        assert_eq!(cfg.run.favorite_probability, 1.0);
        assert_eq!(cfg.run.reply_probability, 0.0);
        assert_eq!(cfg.run.comment_probability, 0.3);
        assert_eq!(cfg.session.bot_type, "reply-bot");
        assert_eq!(cfg.session.invalidated_retention_days, 7);
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let cfg = load(
            "[run]\ntarget_item_count = 4\n",
            CliOverrides {
                target: Some(25),
                user_agent: Some("ua/1".to_string()),
                ..CliOverrides::default()
            },
        )
        .expect("config");
        assert_eq!(cfg.run.target_item_count, 25);
        assert_eq!(cfg.session.user_agent.as_deref(), Some("ua/1"));
    }

    #[test]
    fn relative_paths_resolve_against_process_cwd() {
        let cfg = load(
            "[driver]\nfeed_script = \"feeds/home.json\"\n[logging]\naudit_log_path = \"/abs/audit.jsonl\"\n",
            CliOverrides::default(),
        )
        .expect("config");
        assert_eq!(
            cfg.driver.feed_script,
            Some(PathBuf::from("/work/feeds/home.json"))
        );
        assert_eq!(cfg.logging.audit_log_path, PathBuf::from("/abs/audit.jsonl"));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let err = load("[run]\ncomment_probability = 1.5\n", CliOverrides::default())
            .expect_err("must reject");
        assert!(
            matches!(err, FeedbotError::InvalidConfig(message) if message.contains("comment_probability"))
        );
    }

    #[test]
    fn rejects_zero_quota_and_zero_scroll_valve() {
        let err = load("[run]\ntarget_item_count = 0\n", CliOverrides::default())
            .expect_err("quota");
        assert!(matches!(err, FeedbotError::InvalidConfig(message) if message.contains("target_item_count")));

        let err = load(
            "[run]\nmax_consecutive_empty_scrolls = 0\n",
            CliOverrides::default(),
        )
        .expect_err("valve");
        assert!(matches!(err, FeedbotError::InvalidConfig(message) if message.contains("empty_scrolls")));
    }

    #[test]
    fn rejects_retention_shorter_than_validity_window() {
        let err = load(
            "[session]\nmax_session_age_hours = 72\ninvalidated_retention_days = 1\n",
            CliOverrides::default(),
        )
        .expect_err("retention");
        assert!(matches!(err, FeedbotError::InvalidConfig(message) if message.contains("retention")));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = load("[run\n", CliOverrides::default()).expect_err("parse");
        assert!(matches!(err, FeedbotError::ConfigParse(_)));
    }
}
