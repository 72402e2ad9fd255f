//! Deterministic driver that replays a scripted feed.
//!
//! Each batch is what the page shows after the matching number of scrolls;
//! scrolling past the last batch keeps showing it, like a feed that has run
//! dry. Faults are injected per call so tests can walk every error path.

use super::{AutomationDriver, DriverAction, DriverError, DriverErrorKind, DriverFactory};
use crate::errors::FeedbotError;
use crate::item_identity::{ContentItem, ReplyTarget};
use crate::types::{ActionKind, SessionMaterial};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedScript {
    pub batches: Vec<Vec<ScriptedPost>>,
    /// Keyed by item id or by the raw link of a scripted post.
    #[serde(default)]
    pub reply_targets: HashMap<String, Vec<ReplyTarget>>,
    #[serde(default)]
    pub refreshed_session: Option<ScriptedSession>,
    #[serde(default)]
    pub interruption_after_each_action: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedPost {
    pub author: String,
    pub content: String,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedSession {
    pub cookies: String,
    #[serde(default)]
    pub local_state: Option<String>,
}

impl FeedScript {
    pub fn from_json(text: &str) -> Result<Self, FeedbotError> {
        serde_json::from_str(text).map_err(|e| FeedbotError::ConfigParse(format!("feed script: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    AttachSession,
    ExtractItems,
    Scroll,
    Action { item_id: String, action: DriverAction },
    ResolveInterruption { resolved: bool },
    OpenDetail { item_id: String },
    ExtractReplyTargets { limit: usize },
    ReturnToFeed,
    ExportSession,
}

#[derive(Debug, Default)]
pub struct ScriptedDriver {
    batches: Vec<Vec<ContentItem>>,
    cursor: usize,
    reply_targets: HashMap<String, Vec<ReplyTarget>>,
    refreshed_session: Option<SessionMaterial>,
    interruption_after_each_action: bool,
    pending_interruptions: u32,
    empty_extractions: u32,
    attach_error: Option<DriverError>,
    extract_errors: VecDeque<DriverError>,
    scroll_errors: VecDeque<DriverError>,
    detail_errors: VecDeque<DriverError>,
    return_errors: VecDeque<DriverError>,
    action_errors: HashMap<(String, ActionKind), VecDeque<DriverError>>,
    rejected: HashSet<(String, ActionKind)>,
    attached: Option<SessionMaterial>,
    detail_open: Option<String>,
    calls: Vec<DriverCall>,
}

impl ScriptedDriver {
    pub fn new(batches: Vec<Vec<ContentItem>>) -> Self {
        Self {
            batches,
            ..Self::default()
        }
    }

    pub fn from_script(script: &FeedScript) -> Self {
        let batches = script
            .batches
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .enumerate()
                    .map(|(idx, post)| {
                        ContentItem::new(&post.author, &post.content, post.link.clone(), idx)
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut driver = Self::new(batches);
        for (key, targets) in &script.reply_targets {
            let item_id = driver
                .batches
                .iter()
                .flatten()
                .find(|item| item.link.as_deref() == Some(key.as_str()))
                .map(|item| item.id.clone())
                .unwrap_or_else(|| key.clone());
            driver.reply_targets.insert(item_id, targets.clone());
        }
        driver.refreshed_session = script.refreshed_session.as_ref().map(|session| {
            let material = SessionMaterial::new(session.cookies.as_bytes().to_vec());
            match &session.local_state {
                Some(local) => material.with_local_state(local.as_bytes().to_vec()),
                None => material,
            }
        });
        driver.interruption_after_each_action = script.interruption_after_each_action;
        driver
    }

    pub fn with_reply_targets(mut self, item_id: &str, targets: Vec<ReplyTarget>) -> Self {
        self.reply_targets.insert(item_id.to_string(), targets);
        self
    }

    pub fn with_refreshed_session(mut self, material: SessionMaterial) -> Self {
        self.refreshed_session = Some(material);
        self
    }

    /// Every successful action leaves an overlay behind for the controller to dismiss.
    pub fn with_interruption_after_each_action(mut self) -> Self {
        self.interruption_after_each_action = true;
        self
    }

    /// The first `count` extractions come back empty, as if the feed were still loading.
    pub fn with_empty_extractions(mut self, count: u32) -> Self {
        self.empty_extractions = count;
        self
    }

    pub fn fail_attach(mut self, error: DriverError) -> Self {
        self.attach_error = Some(error);
        self
    }

    pub fn queue_extract_error(mut self, error: DriverError) -> Self {
        self.extract_errors.push_back(error);
        self
    }

    pub fn queue_scroll_error(mut self, error: DriverError) -> Self {
        self.scroll_errors.push_back(error);
        self
    }

    pub fn queue_detail_error(mut self, error: DriverError) -> Self {
        self.detail_errors.push_back(error);
        self
    }

    pub fn queue_return_error(mut self, error: DriverError) -> Self {
        self.return_errors.push_back(error);
        self
    }

    pub fn queue_action_error(mut self, item_id: &str, kind: ActionKind, error: DriverError) -> Self {
        self.action_errors
            .entry((item_id.to_string(), kind))
            .or_default()
            .push_back(error);
        self
    }

    pub fn reject_action(mut self, item_id: &str, kind: ActionKind) -> Self {
        self.rejected.insert((item_id.to_string(), kind));
        self
    }

    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    pub fn performed_actions(&self) -> Vec<(String, DriverAction)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                DriverCall::Action { item_id, action } => Some((item_id.clone(), action.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn scroll_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, DriverCall::Scroll))
            .count()
    }

    pub fn attached_session(&self) -> Option<&SessionMaterial> {
        self.attached.as_ref()
    }

    pub fn detail_open(&self) -> Option<&str> {
        self.detail_open.as_deref()
    }
}

impl AutomationDriver for ScriptedDriver {
    fn attach_session(&mut self, material: &SessionMaterial) -> Result<(), DriverError> {
        self.calls.push(DriverCall::AttachSession);
        if let Some(error) = self.attach_error.take() {
            return Err(error);
        }
        self.attached = Some(material.clone());
        Ok(())
    }

    fn extract_visible_items(&mut self) -> Result<Vec<ContentItem>, DriverError> {
        self.calls.push(DriverCall::ExtractItems);
        if let Some(error) = self.extract_errors.pop_front() {
            return Err(error);
        }
        if self.detail_open.is_some() {
            return Err(DriverError::unrecoverable("feed is not visible from the detail view"));
        }
        if self.empty_extractions > 0 {
            self.empty_extractions -= 1;
            return Ok(Vec::new());
        }
        let batch = self.batches.get(self.cursor).cloned().unwrap_or_default();
        Ok(batch
            .into_iter()
            .enumerate()
            .map(|(idx, item)| ContentItem {
                feed_position: idx,
                ..item
            })
            .collect())
    }

    fn scroll_for_more(&mut self) -> Result<(), DriverError> {
        self.calls.push(DriverCall::Scroll);
        if let Some(error) = self.scroll_errors.pop_front() {
            return Err(error);
        }
        if self.cursor + 1 < self.batches.len() {
            self.cursor += 1;
        }
        Ok(())
    }

    fn perform_action(&mut self, item_id: &str, action: &DriverAction) -> Result<bool, DriverError> {
        self.calls.push(DriverCall::Action {
            item_id: item_id.to_string(),
            action: action.clone(),
        });
        let key = (item_id.to_string(), action.kind());
        if let Some(error) = self
            .action_errors
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let DriverAction::SubmitReply { .. } = action {
            if self.detail_open.as_deref() != Some(item_id) {
                return Err(DriverError::new(
                    DriverErrorKind::ElementMissing,
                    "reply box only exists in the detail view",
                ));
            }
        }
        if self.rejected.contains(&key) {
            return Ok(false);
        }
        if self.interruption_after_each_action {
            self.pending_interruptions += 1;
        }
        Ok(true)
    }

    fn resolve_transient_interruption(&mut self, _max_wait: Duration) -> Result<bool, DriverError> {
        let resolved = self.pending_interruptions > 0;
        if resolved {
            self.pending_interruptions -= 1;
        }
        self.calls.push(DriverCall::ResolveInterruption { resolved });
        Ok(resolved)
    }

    fn open_item_detail(&mut self, item_id: &str) -> Result<(), DriverError> {
        self.calls.push(DriverCall::OpenDetail {
            item_id: item_id.to_string(),
        });
        if let Some(error) = self.detail_errors.pop_front() {
            return Err(error);
        }
        self.detail_open = Some(item_id.to_string());
        Ok(())
    }

    fn extract_reply_targets(&mut self, limit: usize) -> Result<Vec<ReplyTarget>, DriverError> {
        self.calls.push(DriverCall::ExtractReplyTargets { limit });
        let Some(item_id) = self.detail_open.as_ref() else {
            return Err(DriverError::element_missing("no detail view open"));
        };
        Ok(self
            .reply_targets
            .get(item_id)
            .map(|targets| targets.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn return_to_feed(&mut self) -> Result<(), DriverError> {
        self.calls.push(DriverCall::ReturnToFeed);
        if let Some(error) = self.return_errors.pop_front() {
            return Err(error);
        }
        self.detail_open = None;
        Ok(())
    }

    fn export_session(&mut self) -> Result<Option<SessionMaterial>, DriverError> {
        self.calls.push(DriverCall::ExportSession);
        Ok(self.refreshed_session.clone())
    }
}

/// Hands every account its own replay of the same script.
#[derive(Debug, Clone)]
pub struct ScriptedDriverFactory {
    script: FeedScript,
}

impl ScriptedDriverFactory {
    pub fn new(script: FeedScript) -> Self {
        Self { script }
    }
}

impl DriverFactory for ScriptedDriverFactory {
    fn driver_for(&self, _account_id: &str) -> Result<Box<dyn AutomationDriver>, FeedbotError> {
        Ok(Box::new(ScriptedDriver::from_script(&self.script)))
    }
}
