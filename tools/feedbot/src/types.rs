use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Favorite,
    Comment,
    Reply,
    RunComplete,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Favorite => "FAVORITE",
            Self::Comment => "COMMENT",
            Self::Reply => "REPLY",
            Self::RunComplete => "RUN_COMPLETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Traversing,
    ProcessingItem,
    Scrolling,
    Terminated,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Traversing => "traversing",
            Self::ProcessingItem => "processing_item",
            Self::Scrolling => "scrolling",
            Self::Terminated => "terminated",
        }
    }
}

/// Opaque authentication state captured from the automation driver.
///
/// The store and the controller only move these bytes around; the driver is
/// the only party that knows how to interpret them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMaterial {
    pub cookies: Vec<u8>,
    pub local_state: Option<Vec<u8>>,
}

impl SessionMaterial {
    pub fn new(cookies: impl Into<Vec<u8>>) -> Self {
        Self {
            cookies: cookies.into(),
            local_state: None,
        }
    }

    pub fn with_local_state(mut self, local_state: impl Into<Vec<u8>>) -> Self {
        self.local_state = Some(local_state.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.local_state.as_ref().map_or(true, Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionKind, ActionStatus, RunState, SessionMaterial};

    #[test]
    fn audit_strings_match_contract() {
        assert_eq!(ActionKind::Favorite.as_str(), "FAVORITE");
        assert_eq!(ActionKind::RunComplete.as_str(), "RUN_COMPLETE");
        assert_eq!(ActionStatus::Skipped.as_str(), "SKIPPED");
        let json = serde_json::to_string(&ActionKind::RunComplete).expect("serialize");
        assert_eq!(json, "\"RUN_COMPLETE\"");
    }

    #[test]
    fn run_state_strings_are_snake_case() {
        assert_eq!(RunState::ProcessingItem.as_str(), "processing_item");
        let json = serde_json::to_string(&RunState::ProcessingItem).expect("serialize");
        assert_eq!(json, "\"processing_item\"");
    }

    #[test]
    fn session_material_emptiness_considers_both_blobs() {
        assert!(SessionMaterial::default().is_empty());
        assert!(!SessionMaterial::new("sid=1").is_empty());
        assert!(!SessionMaterial::default().with_local_state("{}").is_empty());
    }
}
