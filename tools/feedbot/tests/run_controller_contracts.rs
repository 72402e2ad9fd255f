use std::collections::HashSet;
use std::sync::Arc;

use feedbot::audit::{summarize, MemoryAuditSink};
use feedbot::config::RunConfig;
use feedbot::driver::scripted::{DriverCall, ScriptedDriver};
use feedbot::driver::{AutomationDriver, DriverAction, DriverError};
use feedbot::item_identity::{ContentItem, ReplyTarget};
use feedbot::run_controller::{PartialReason, RunController, RunOutcome};
use feedbot::runtime::{FakeClock, FakeRandom};
use feedbot::text_generation::TemplateTextGenerator;
use feedbot::types::{ActionKind, SessionMaterial};

fn post(idx: usize) -> ContentItem {
    ContentItem::new(
        format!("author{idx}"),
        format!("post body {idx}"),
        Some(format!("https://feed.test/status/{idx}")),
        idx,
    )
}

fn controller(draw: f64) -> (RunController, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let controller = RunController::new(
        Arc::new(FakeClock::default()),
        Arc::new(FakeRandom::constant(draw)),
        Arc::new(TemplateTextGenerator::new(
            vec!["nice one {author}".to_string()],
            vec!["@{author} agreed".to_string()],
        )),
        audit.clone(),
    )
    .with_actor("acct-1");
    (controller, audit)
}

fn run_config(favorite: f64, comment: f64, reply: f64, target: u32, max_empty: u32) -> RunConfig {
    RunConfig {
        target_item_count: target,
        favorite_probability: favorite,
        comment_probability: comment,
        reply_probability: reply,
        max_consecutive_empty_scrolls: max_empty,
        ..RunConfig::default()
    }
}

#[test]
fn quota_is_reached_across_two_batches_with_overlap() {
    let first: Vec<_> = (0..8).map(post).collect();
    // The second batch re-shows item 7 and reveals three new ones.
    let second: Vec<_> = (7..11).map(post).collect();
    let mut driver = ScriptedDriver::new(vec![first, second]);
    let (controller, audit) = controller(0.0);

    let report = controller.run(
        &run_config(1.0, 0.0, 0.0, 10, 3),
        &mut driver,
        &SessionMaterial::new("sid"),
    );

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.stats.items_processed, 10);
    assert_eq!(report.stats.favorites, 10);
    assert_eq!(report.stats.comments, 0);
    assert_eq!(report.stats.replies, 0);
    let distinct: HashSet<_> = report.processed_ids.iter().collect();
    assert_eq!(distinct.len(), 10);
    assert!(!report.processed_ids.contains(&post(10).id));
    assert_eq!(driver.scroll_count(), 1);

    let summary = summarize(&audit.records());
    assert_eq!(summary.kind(ActionKind::Favorite).succeeded, 10);
    assert_eq!(summary.runs_completed, 1);
}

#[test]
fn exhausted_feed_stops_after_empty_scroll_limit() {
    let batch: Vec<_> = (0..5).map(post).collect();
    let mut driver = ScriptedDriver::new(vec![batch]);
    let (controller, _audit) = controller(0.0);

    let report = controller.run(
        &run_config(1.0, 0.0, 0.0, 10, 3),
        &mut driver,
        &SessionMaterial::default(),
    );

    assert_eq!(
        report.outcome,
        RunOutcome::PartiallyCompleted(PartialReason::FeedExhausted)
    );
    assert_eq!(report.stats.items_processed, 5);
    assert_eq!(driver.scroll_count(), 3);
}

#[test]
fn productive_scroll_resets_the_empty_counter() {
    // empty, empty, productive, then empty x3
    let batches = vec![
        vec![post(0)],
        vec![post(0)],
        vec![post(0)],
        vec![post(0), post(1)],
    ];
    let mut driver = ScriptedDriver::new(batches);
    let (controller, _audit) = controller(0.0);

    let report = controller.run(
        &run_config(1.0, 0.0, 0.0, 10, 3),
        &mut driver,
        &SessionMaterial::default(),
    );
    assert_eq!(report.stats.items_processed, 2);
    assert_eq!(driver.scroll_count(), 6);
    assert_eq!(
        report.outcome,
        RunOutcome::PartiallyCompleted(PartialReason::FeedExhausted)
    );
}

#[test]
fn independent_action_law_favorite_and_reply_never_comment() {
    let batch: Vec<_> = (0..3).map(post).collect();
    let mut driver = ScriptedDriver::new(vec![batch.clone()]);
    for item in &batch {
        driver = driver.with_reply_targets(
            &item.id,
            vec![ReplyTarget {
                id: format!("{}-r", item.id),
                author: "replier".to_string(),
                content: "first!".to_string(),
            }],
        );
    }
    let (controller, audit) = controller(0.5);

    let report = controller.run(
        &run_config(1.0, 0.0, 1.0, 3, 3),
        &mut driver,
        &SessionMaterial::default(),
    );

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.stats.favorites, 3);
    assert_eq!(report.stats.replies, 3);
    assert_eq!(report.stats.comments, 0);
    for item in &batch {
        let kinds: Vec<_> = driver
            .performed_actions()
            .into_iter()
            .filter(|(id, _)| id == &item.id)
            .map(|(_, action)| action.kind())
            .collect();
        assert_eq!(kinds, vec![ActionKind::Favorite, ActionKind::Reply]);
    }
    assert_eq!(summarize(&audit.records()).kind(ActionKind::Comment).attempted, 0);
}

#[test]
fn no_item_is_processed_twice_when_batches_repeat() {
    let batches = vec![
        (0..4).map(post).collect::<Vec<_>>(),
        (2..6).map(post).collect(),
        (0..8).map(post).collect(),
    ];
    let mut driver = ScriptedDriver::new(batches);
    let (controller, _audit) = controller(0.0);

    let report = controller.run(
        &run_config(1.0, 0.0, 0.0, 100, 2),
        &mut driver,
        &SessionMaterial::default(),
    );
    let distinct: HashSet<_> = report.processed_ids.iter().collect();
    assert_eq!(distinct.len(), report.processed_ids.len());
    assert_eq!(report.stats.items_processed, 8);

    let favorited: Vec<_> = driver
        .performed_actions()
        .into_iter()
        .filter(|(_, action)| *action == DriverAction::Favorite)
        .map(|(id, _)| id)
        .collect();
    let unique: HashSet<_> = favorited.iter().collect();
    assert_eq!(unique.len(), favorited.len());
}

/// Stops the run from inside the driver after a number of actions, which is
/// what an operator pressing stop mid-run looks like to the controller.
struct StoppingDriver {
    inner: ScriptedDriver,
    stop_after: usize,
    actions: usize,
    stop: feedbot::run_controller::StopSignal,
}

impl AutomationDriver for StoppingDriver {
    fn attach_session(&mut self, material: &SessionMaterial) -> Result<(), DriverError> {
        self.inner.attach_session(material)
    }
    fn extract_visible_items(&mut self) -> Result<Vec<ContentItem>, DriverError> {
        self.inner.extract_visible_items()
    }
    fn scroll_for_more(&mut self) -> Result<(), DriverError> {
        self.inner.scroll_for_more()
    }
    fn perform_action(&mut self, item_id: &str, action: &DriverAction) -> Result<bool, DriverError> {
        self.actions += 1;
        if self.actions == self.stop_after {
            self.stop.stop();
        }
        self.inner.perform_action(item_id, action)
    }
    fn resolve_transient_interruption(
        &mut self,
        max_wait: std::time::Duration,
    ) -> Result<bool, DriverError> {
        self.inner.resolve_transient_interruption(max_wait)
    }
    fn open_item_detail(&mut self, item_id: &str) -> Result<(), DriverError> {
        self.inner.open_item_detail(item_id)
    }
    fn extract_reply_targets(&mut self, limit: usize) -> Result<Vec<ReplyTarget>, DriverError> {
        self.inner.extract_reply_targets(limit)
    }
    fn return_to_feed(&mut self) -> Result<(), DriverError> {
        self.inner.return_to_feed()
    }
}

#[test]
fn cancellation_lands_between_items_never_mid_item() {
    let batch: Vec<_> = (0..6).map(post).collect();
    let (controller, audit) = controller(0.0);
    let mut driver = StoppingDriver {
        inner: ScriptedDriver::new(vec![batch]),
        stop_after: 3,
        actions: 0,
        stop: controller.stop_signal(),
    };

    // Favorite and comment on every item: the stop lands on the second item's favorite.
    let report = controller.run(
        &run_config(1.0, 1.0, 0.0, 6, 3),
        &mut driver,
        &SessionMaterial::default(),
    );

    assert_eq!(
        report.outcome,
        RunOutcome::PartiallyCompleted(PartialReason::Cancelled)
    );
    assert_eq!(report.stats.items_processed, 2);
    assert_eq!(report.stats.favorites, 2);
    assert_eq!(report.stats.comments, 2);
    let last = audit.records().pop().expect("run complete");
    assert_eq!(last.action_kind, ActionKind::RunComplete);
    assert!(last.text.unwrap_or_default().contains("outcome=cancelled"));
}

#[test]
fn authentication_loss_mid_run_is_fatal_with_partial_stats() {
    let batch: Vec<_> = (0..4).map(post).collect();
    let mut driver = ScriptedDriver::new(vec![batch.clone()]).queue_action_error(
        &batch[2].id,
        ActionKind::Favorite,
        DriverError::authentication_lost("session cookie rejected"),
    );
    let (controller, audit) = controller(0.0);

    let report = controller.run(
        &run_config(1.0, 0.0, 0.0, 4, 3),
        &mut driver,
        &SessionMaterial::default(),
    );

    assert!(report.outcome.is_failed());
    assert_eq!(report.stats.items_processed, 2);
    assert_eq!(report.stats.favorites, 2);
    assert!(!driver
        .calls()
        .iter()
        .any(|call| matches!(call, DriverCall::Action { item_id, .. } if item_id == &batch[3].id)));
    let summary = summarize(&audit.records());
    assert_eq!(summary.kind(ActionKind::Favorite).attempted, 3);
    assert_eq!(summary.kind(ActionKind::Favorite).failed, 1);
}
