use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedbotError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("text generation error: {0}")]
    TextGeneration(String),
    #[error("illegal transition: {0}")]
    InvalidTransition(String),
    #[error("audit error: {0}")]
    Audit(String),
}
