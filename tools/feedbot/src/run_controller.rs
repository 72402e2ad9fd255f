//! The engagement loop: traverse, dedup, decide, act, scroll, terminate.

use crate::action_policy::decide;
use crate::audit::{emit, AuditRecord, AuditSink};
use crate::config::RunConfig;
use crate::dedup_ledger::DedupLedger;
use crate::driver::{AutomationDriver, DriverAction, DriverError};
use crate::errors::FeedbotError;
use crate::fsm::{RunFsm, ScrollVerdict};
use crate::item_identity::ContentItem;
use crate::logging::append_run_log;
use crate::runtime::{Clock, RandomSource};
use crate::text_generation::TextGenerator;
use crate::types::{ActionKind, ActionStatus, RunState, SessionMaterial};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub items_processed: u32,
    pub favorites: u32,
    pub comments: u32,
    pub replies: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    FeedExhausted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    FeedNeverLoaded { attempts: u32 },
    Driver(DriverError),
    /// The loop reached a state it has no move for.
    Internal(String),
}

impl RunFailure {
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Driver(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FeedNeverLoaded { attempts } => {
                write!(f, "feed never loaded after {attempts} attempts")
            }
            Self::Driver(err) => write!(f, "{err}"),
            Self::Internal(message) => write!(f, "internal: {message}"),
        }
    }
}

impl From<FeedbotError> for RunFailure {
    fn from(value: FeedbotError) -> Self {
        Self::Internal(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Quota reached.
    Completed,
    /// A safety valve tripped or the run was stopped.
    PartiallyCompleted(PartialReason),
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PartiallyCompleted(PartialReason::FeedExhausted) => "feed_exhausted",
            Self::PartiallyCompleted(PartialReason::Cancelled) => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub stats: RunStats,
    pub outcome: RunOutcome,
    /// Item ids in the order they were processed.
    pub processed_ids: Vec<String>,
}

/// Cooperative cancellation, observed between items and between scrolls.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct RunController {
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    text: Arc<dyn TextGenerator>,
    audit: Arc<dyn AuditSink>,
    stop: StopSignal,
    run_id: String,
    actor: String,
}

/// Everything one run owns exclusively.
struct Pass<'d> {
    config: &'d RunConfig,
    driver: &'d mut dyn AutomationDriver,
    stats: RunStats,
    ledger: DedupLedger,
    fsm: RunFsm,
    snapshot: Vec<ContentItem>,
}

impl RunController {
    pub fn new(
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        text: Arc<dyn TextGenerator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let run_id = format!("run-{}", clock.now_unix_ms());
        Self {
            clock,
            random,
            text,
            audit,
            stop: StopSignal::new(),
            run_id,
            actor: "anonymous".to_string(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run(
        &self,
        config: &RunConfig,
        driver: &mut dyn AutomationDriver,
        session: &SessionMaterial,
    ) -> RunReport {
        append_run_log(
            "info",
            "run.started",
            json!({
                "run_id": self.run_id,
                "actor": self.actor,
                "target_item_count": config.target_item_count,
            }),
        );

        let mut pass = Pass {
            config,
            driver,
            stats: RunStats::default(),
            ledger: DedupLedger::new(),
            fsm: RunFsm::new(config.max_consecutive_empty_scrolls),
            snapshot: Vec::new(),
        };

        let outcome = match self.drive(&mut pass, session) {
            Ok(outcome) => outcome,
            Err(failure) => RunOutcome::Failed(failure),
        };
        pass.fsm.terminate();
        self.finish(pass.stats, outcome, pass.ledger.processed_ids().to_vec())
    }

    fn drive(&self, pass: &mut Pass<'_>, session: &SessionMaterial) -> Result<RunOutcome, RunFailure> {
        if self.stop.is_stopped() {
            return Ok(RunOutcome::PartiallyCompleted(PartialReason::Cancelled));
        }
        if pass.config.target_item_count == 0 {
            return Ok(RunOutcome::Completed);
        }

        self.retry_once(pass.config, "attach_session", || {
            pass.driver.attach_session(session)
        })
        .map_err(RunFailure::Driver)?;
        pass.snapshot = self.initial_load(pass)?;
        pass.fsm.transition(RunState::Traversing)?;

        loop {
            if self.stop.is_stopped() {
                append_run_log(
                    "info",
                    "run.cancelled",
                    json!({
                        "run_id": self.run_id,
                        "items_processed": pass.stats.items_processed,
                    }),
                );
                return Ok(RunOutcome::PartiallyCompleted(PartialReason::Cancelled));
            }

            match pass.fsm.state {
                RunState::Traversing => {
                    let Some(item) = pass.ledger.first_unseen(&pass.snapshot).cloned() else {
                        pass.fsm.transition(RunState::Scrolling)?;
                        continue;
                    };
                    pass.fsm.transition(RunState::ProcessingItem)?;
                    self.process_item(pass, &item).map_err(RunFailure::Driver)?;
                    pass.stats.items_processed += 1;
                    if pass
                        .fsm
                        .on_item_processed(pass.stats.items_processed, pass.config.target_item_count)?
                    {
                        return Ok(RunOutcome::Completed);
                    }
                }
                RunState::Scrolling => {
                    let found_unseen = match self.scroll(pass).map_err(RunFailure::Driver)? {
                        Some(items) => {
                            let unseen = pass.ledger.has_unseen(&items);
                            pass.snapshot = items;
                            unseen
                        }
                        None => false,
                    };
                    let verdict = pass.fsm.on_scroll_completed(found_unseen)?;
                    append_run_log(
                        "debug",
                        "run.scroll",
                        json!({
                            "run_id": self.run_id,
                            "found_unseen": found_unseen,
                            "consecutive_empty_scrolls": pass.fsm.consecutive_empty_scrolls,
                            "total_scrolls": pass.fsm.total_scrolls,
                        }),
                    );
                    if verdict == ScrollVerdict::Exhausted {
                        return Ok(RunOutcome::PartiallyCompleted(PartialReason::FeedExhausted));
                    }
                }
                other => {
                    return Err(RunFailure::Internal(format!(
                        "loop resumed in {} state",
                        other.as_str()
                    )));
                }
            }
        }
    }

    fn initial_load(&self, pass: &mut Pass<'_>) -> Result<Vec<ContentItem>, RunFailure> {
        let attempts = pass.config.initial_load_attempts.max(1);
        for attempt in 1..=attempts {
            let items = self
                .retry_once(pass.config, "extract_visible_items", || {
                    pass.driver.extract_visible_items()
                })
                .map_err(RunFailure::Driver)?;
            if !items.is_empty() {
                return Ok(items);
            }
            append_run_log(
                "warn",
                "run.initial_load.empty",
                json!({
                    "run_id": self.run_id,
                    "attempt": attempt,
                    "attempts": attempts,
                }),
            );
            if attempt < attempts {
                self.settle(pass.config);
            }
        }
        Err(RunFailure::FeedNeverLoaded { attempts })
    }

    /// `Ok(None)` means the scroll produced nothing usable; only fatal errors escape.
    fn scroll(&self, pass: &mut Pass<'_>) -> Result<Option<Vec<ContentItem>>, DriverError> {
        if let Err(err) = self.retry_once(pass.config, "scroll_for_more", || {
            pass.driver.scroll_for_more()
        }) {
            return self.absorb("scroll_for_more", err).map(|()| None);
        }
        self.settle(pass.config);
        match self.retry_once(pass.config, "extract_visible_items", || {
            pass.driver.extract_visible_items()
        }) {
            Ok(items) => Ok(Some(items)),
            Err(err) => self.absorb("extract_visible_items", err).map(|()| None),
        }
    }

    fn process_item(&self, pass: &mut Pass<'_>, item: &ContentItem) -> Result<(), DriverError> {
        pass.ledger.mark_processed(&item.id);
        append_run_log(
            "info",
            "run.item.processing",
            json!({
                "run_id": self.run_id,
                "item_id": item.id,
                "feed_position": item.feed_position,
            }),
        );

        let decision = decide(pass.config, &mut || self.random.draw());

        if decision.favorite && self.attempt(pass, item, &item.id, DriverAction::Favorite)? {
            pass.stats.favorites += 1;
        }

        if decision.comment {
            match self.text.comment_for(item) {
                Ok(text) => {
                    if self.attempt(pass, item, &item.id, DriverAction::SubmitComment { text })? {
                        pass.stats.comments += 1;
                    }
                }
                Err(err) => self.audit_action(
                    item,
                    ActionKind::Comment,
                    ActionStatus::Skipped,
                    &item.id,
                    None,
                    Some(err.to_string()),
                ),
            }
        }

        if decision.reply {
            self.reply(pass, item)?;
        }
        Ok(())
    }

    fn reply(&self, pass: &mut Pass<'_>, item: &ContentItem) -> Result<(), DriverError> {
        if let Err(err) = self.retry_once(pass.config, "open_item_detail", || {
            pass.driver.open_item_detail(&item.id)
        }) {
            self.audit_action(
                item,
                ActionKind::Reply,
                ActionStatus::Failed,
                &item.id,
                None,
                Some(err.to_string()),
            );
            return self.absorb("open_item_detail", err);
        }

        self.reply_in_detail(pass, item)?;

        // Traversal continues from the feed, so losing it ends the run.
        self.retry_once(pass.config, "return_to_feed", || pass.driver.return_to_feed())
            .map_err(|err| {
                if err.is_fatal() {
                    err
                } else {
                    DriverError::unrecoverable(format!("could not return to feed: {err}"))
                }
            })
    }

    fn reply_in_detail(&self, pass: &mut Pass<'_>, item: &ContentItem) -> Result<(), DriverError> {
        let limit = pass.config.reply_target_limit as usize;
        let targets = match self.retry_once(pass.config, "extract_reply_targets", || {
            pass.driver.extract_reply_targets(limit)
        }) {
            Ok(targets) => targets,
            Err(err) => {
                self.audit_action(
                    item,
                    ActionKind::Reply,
                    ActionStatus::Failed,
                    &item.id,
                    None,
                    Some(err.to_string()),
                );
                return self.absorb("extract_reply_targets", err);
            }
        };

        let Some(target) = targets.first() else {
            self.audit_action(
                item,
                ActionKind::Reply,
                ActionStatus::Skipped,
                &item.id,
                None,
                Some("no reply targets".to_string()),
            );
            return Ok(());
        };

        let text = match self.text.reply_for(item, target) {
            Ok(text) => text,
            Err(err) => {
                self.audit_action(
                    item,
                    ActionKind::Reply,
                    ActionStatus::Skipped,
                    &target.id,
                    None,
                    Some(err.to_string()),
                );
                return Ok(());
            }
        };

        let action = DriverAction::SubmitReply {
            reply_target_id: target.id.clone(),
            text,
        };
        if self.attempt(pass, item, &target.id, action)? {
            pass.stats.replies += 1;
        }
        Ok(())
    }

    /// Perform one mutating action and audit it. `Ok(false)` covers every
    /// recoverable failure; only fatal driver errors are returned.
    fn attempt(
        &self,
        pass: &mut Pass<'_>,
        item: &ContentItem,
        target: &str,
        action: DriverAction,
    ) -> Result<bool, DriverError> {
        let kind = action.kind();
        let text = action.text().map(str::to_string);
        let result = if action.is_idempotent() {
            self.retry_once(pass.config, kind.as_str(), || {
                pass.driver.perform_action(&item.id, &action)
            })
        } else {
            pass.driver.perform_action(&item.id, &action)
        };

        match result {
            Ok(true) => {
                self.audit_action(item, kind, ActionStatus::Success, target, text.as_deref(), None);
                self.resolve_interruption(pass)?;
                Ok(true)
            }
            Ok(false) => {
                self.audit_action(
                    item,
                    kind,
                    ActionStatus::Failed,
                    target,
                    text.as_deref(),
                    Some("action not accepted".to_string()),
                );
                Ok(false)
            }
            Err(err) => {
                self.audit_action(
                    item,
                    kind,
                    ActionStatus::Failed,
                    target,
                    text.as_deref(),
                    Some(err.to_string()),
                );
                self.absorb(kind.as_str(), err).map(|()| false)
            }
        }
    }

    fn resolve_interruption(&self, pass: &mut Pass<'_>) -> Result<(), DriverError> {
        match pass
            .driver
            .resolve_transient_interruption(pass.config.interruption_wait())
        {
            Ok(true) => {
                append_run_log(
                    "debug",
                    "run.interruption.resolved",
                    json!({ "run_id": self.run_id }),
                );
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => self.absorb("resolve_transient_interruption", err),
        }
    }

    /// Fatal errors pass through; everything else is logged and dropped.
    fn absorb(&self, operation: &str, err: DriverError) -> Result<(), DriverError> {
        if err.is_fatal() {
            append_run_log(
                "error",
                "run.driver.fatal",
                json!({
                    "run_id": self.run_id,
                    "operation": operation,
                    "error": err.to_string(),
                }),
            );
            return Err(err);
        }
        append_run_log(
            "warn",
            "run.driver.recovered",
            json!({
                "run_id": self.run_id,
                "operation": operation,
                "error": err.to_string(),
            }),
        );
        Ok(())
    }

    /// Transient failures get exactly one more try after the configured backoff.
    fn retry_once<T>(
        &self,
        config: &RunConfig,
        operation: &str,
        mut call: impl FnMut() -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        match call() {
            Err(err) if err.is_transient() => {
                append_run_log(
                    "warn",
                    "run.driver.retry",
                    json!({
                        "run_id": self.run_id,
                        "operation": operation,
                        "error": err.to_string(),
                        "backoff_ms": config.retry_backoff_ms,
                    }),
                );
                let _ = self.clock.sleep_for(config.retry_backoff());
                call()
            }
            other => other,
        }
    }

    fn settle(&self, config: &RunConfig) {
        let _ = self.clock.sleep_for(config.settle_wait());
    }

    fn audit_action(
        &self,
        item: &ContentItem,
        kind: ActionKind,
        status: ActionStatus,
        target: &str,
        text: Option<&str>,
        error: Option<String>,
    ) {
        append_run_log(
            if status == ActionStatus::Failed { "warn" } else { "info" },
            "run.action",
            json!({
                "run_id": self.run_id,
                "item_id": item.id,
                "action_kind": kind.as_str(),
                "status": status.as_str(),
                "error": error,
            }),
        );
        emit(
            self.audit.as_ref(),
            &AuditRecord {
                timestamp_ms: self.clock.now_unix_ms(),
                action_kind: kind,
                status,
                actor: self.actor.clone(),
                target: Some(target.to_string()),
                text: text.map(str::to_string),
                link: item.link.clone(),
                error,
                run_id: self.run_id.clone(),
            },
        );
    }

    fn finish(&self, stats: RunStats, outcome: RunOutcome, processed_ids: Vec<String>) -> RunReport {
        let (status, error) = match &outcome {
            RunOutcome::Failed(failure) => (ActionStatus::Failed, Some(failure.to_string())),
            _ => (ActionStatus::Success, None),
        };
        let summary = format!(
            "outcome={} processed={} favorites={} comments={} replies={}",
            outcome.label(),
            stats.items_processed,
            stats.favorites,
            stats.comments,
            stats.replies
        );
        emit(
            self.audit.as_ref(),
            &AuditRecord {
                timestamp_ms: self.clock.now_unix_ms(),
                action_kind: ActionKind::RunComplete,
                status,
                actor: self.actor.clone(),
                target: None,
                text: Some(summary),
                link: None,
                error: error.clone(),
                run_id: self.run_id.clone(),
            },
        );
        append_run_log(
            if outcome.is_failed() { "error" } else { "info" },
            "run.terminated",
            json!({
                "run_id": self.run_id,
                "outcome": outcome.label(),
                "stats": stats,
                "error": error,
            }),
        );
        RunReport {
            run_id: self.run_id.clone(),
            stats,
            outcome,
            processed_ids,
        }
    }
}
