//! The automation capability the run controller consumes.
//!
//! Implementations own rendering, element lookup and timeouts. Every call
//! is expected to return within its own bounded wait; the controller only
//! sees a result or a classified [`DriverError`].

pub mod scripted;

use crate::errors::FeedbotError;
use crate::item_identity::{ContentItem, ReplyTarget};
use crate::types::{ActionKind, SessionMaterial};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    Favorite,
    SubmitComment { text: String },
    SubmitReply { reply_target_id: String, text: String },
}

impl DriverAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Favorite => ActionKind::Favorite,
            Self::SubmitComment { .. } => ActionKind::Comment,
            Self::SubmitReply { .. } => ActionKind::Reply,
        }
    }

    /// Safe to resend after a timeout. A timed-out submit may already be posted.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Favorite)
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Favorite => None,
            Self::SubmitComment { text } | Self::SubmitReply { text, .. } => Some(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// The control for an action is not on the page.
    ElementMissing,
    /// The page refused the submission.
    Rejected,
    /// Navigation or wait exceeded its bound. Worth one retry.
    Timeout,
    AuthenticationLost,
    Unrecoverable,
}

impl DriverErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ElementMissing => "element_missing",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::AuthenticationLost => "authentication_lost",
            Self::Unrecoverable => "unrecoverable",
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, Self::AuthenticationLost | Self::Unrecoverable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}", kind.as_str())]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    pub fn element_missing(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ElementMissing, message)
    }

    pub fn authentication_lost(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::AuthenticationLost, message)
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Unrecoverable, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl From<DriverError> for FeedbotError {
    fn from(value: DriverError) -> Self {
        FeedbotError::Driver(value.to_string())
    }
}

pub trait AutomationDriver {
    /// Install previously persisted authentication state before the feed loads.
    fn attach_session(&mut self, material: &SessionMaterial) -> Result<(), DriverError>;
    fn extract_visible_items(&mut self) -> Result<Vec<ContentItem>, DriverError>;
    fn scroll_for_more(&mut self) -> Result<(), DriverError>;
    /// `Ok(false)` means the page ignored the action without raising.
    fn perform_action(&mut self, item_id: &str, action: &DriverAction) -> Result<bool, DriverError>;
    /// Best effort. `Ok(false)` means no interruption was present.
    fn resolve_transient_interruption(&mut self, max_wait: Duration) -> Result<bool, DriverError>;
    fn open_item_detail(&mut self, item_id: &str) -> Result<(), DriverError>;
    fn extract_reply_targets(&mut self, limit: usize) -> Result<Vec<ReplyTarget>, DriverError>;
    fn return_to_feed(&mut self) -> Result<(), DriverError>;

    /// Authentication state after re-authentication, if the driver refreshed it.
    fn export_session(&mut self) -> Result<Option<SessionMaterial>, DriverError> {
        Ok(None)
    }
}

/// Builds one driver per account so concurrent runs never share a page.
pub trait DriverFactory: Send + Sync {
    fn driver_for(&self, account_id: &str) -> Result<Box<dyn AutomationDriver>, FeedbotError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_follow_taxonomy() {
        assert!(DriverError::timeout("nav").is_transient());
        assert!(!DriverError::timeout("nav").is_fatal());
        assert!(DriverError::authentication_lost("logged out").is_fatal());
        assert!(DriverError::unrecoverable("crash").is_fatal());
        let missing = DriverError::element_missing("like button");
        assert!(!missing.is_fatal() && !missing.is_transient());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = DriverError::timeout("detail view");
        assert_eq!(err.to_string(), "timeout: detail view");
        let converted: FeedbotError = err.into();
        assert!(matches!(converted, FeedbotError::Driver(message) if message == "timeout: detail view"));
    }

    #[test]
    fn action_kind_and_text_mapping() {
        let reply = DriverAction::SubmitReply {
            reply_target_id: "r1".to_string(),
            text: "hi".to_string(),
        };
        assert_eq!(reply.kind(), ActionKind::Reply);
        assert_eq!(reply.text(), Some("hi"));
        assert_eq!(DriverAction::Favorite.text(), None);
    }
}
