//! Per-account glue between the session store and the run controller.

use crate::audit::AuditSink;
use crate::config::RunConfig;
use crate::driver::{AutomationDriver, DriverErrorKind, DriverFactory};
use crate::errors::FeedbotError;
use crate::logging::append_run_log;
use crate::run_controller::{RunController, RunFailure, RunOutcome, RunReport, StopSignal};
use crate::runtime::{Clock, RandomSourceFactory};
use crate::session_store::{Checkout, SessionStore};
use crate::text_generation::TextGenerator;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRun {
    pub account_id: String,
    pub report: RunReport,
    /// The driver exported fresh session material and it was upserted.
    pub session_refreshed: bool,
    /// The driver lost authentication and the stored session was invalidated.
    pub session_invalidated: bool,
}

pub struct Engagement<'a> {
    pub store: &'a SessionStore,
    pub run_config: &'a RunConfig,
    pub bot_type: &'a str,
    pub user_agent: Option<&'a str>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSourceFactory>,
    pub text: Arc<dyn TextGenerator>,
    pub audit: Arc<dyn AuditSink>,
    pub stop: StopSignal,
}

impl Engagement<'_> {
    pub fn run_account(
        &self,
        account_id: &str,
        driver: &mut dyn AutomationDriver,
    ) -> Result<AccountRun, FeedbotError> {
        let record = match self.store.checkout(account_id)? {
            Checkout::Ready(record) => record,
            Checkout::Expired(_) => {
                return Err(FeedbotError::SessionUnavailable(format!(
                    "session for {account_id} is expired or invalidated"
                )));
            }
            Checkout::Missing => {
                return Err(FeedbotError::SessionUnavailable(format!(
                    "no session stored for {account_id}"
                )));
            }
        };

        let controller = RunController::new(
            Arc::clone(&self.clock),
            self.random.random_for(account_id),
            Arc::clone(&self.text),
            Arc::clone(&self.audit),
        )
        .with_run_id(format!("{account_id}-{}", self.clock.now_unix_ms()))
        .with_actor(account_id)
        .with_stop_signal(self.stop.clone());
        let report = controller.run(self.run_config, driver, &record.material);

        let auth_lost = matches!(
            &report.outcome,
            RunOutcome::Failed(RunFailure::Driver(err)) if err.kind == DriverErrorKind::AuthenticationLost
        );
        let mut session_invalidated = false;
        let mut session_refreshed = false;
        if auth_lost {
            match self.store.invalidate(account_id) {
                Ok(()) => session_invalidated = true,
                // Deleted by someone else mid-run; nothing left to invalidate.
                Err(FeedbotError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        } else {
            match driver.export_session() {
                Ok(Some(material)) if !material.is_empty() => {
                    self.store
                        .upsert(account_id, material, self.bot_type, self.user_agent)?;
                    session_refreshed = true;
                }
                Ok(_) => {}
                Err(err) => append_run_log(
                    "warn",
                    "engagement.export_session.failed",
                    json!({ "account_id": account_id, "error": err.to_string() }),
                ),
            }
        }

        append_run_log(
            "info",
            "engagement.account.finished",
            json!({
                "account_id": account_id,
                "run_id": report.run_id,
                "outcome": report.outcome.label(),
                "session_refreshed": session_refreshed,
                "session_invalidated": session_invalidated,
            }),
        );
        Ok(AccountRun {
            account_id: account_id.to_string(),
            report,
            session_refreshed,
            session_invalidated,
        })
    }

    /// One thread and one driver per distinct account. Runs share nothing
    /// but the session store.
    pub fn run_accounts(
        &self,
        accounts: &[String],
        factory: &dyn DriverFactory,
    ) -> Vec<(String, Result<AccountRun, FeedbotError>)> {
        let mut seen = HashSet::new();
        let distinct = accounts
            .iter()
            .filter(|account| seen.insert(account.as_str()))
            .collect::<Vec<_>>();

        thread::scope(|scope| {
            let handles = distinct
                .iter()
                .map(|account| {
                    let handle = scope.spawn(move || {
                        let mut driver = factory.driver_for(account)?;
                        self.run_account(account, driver.as_mut())
                    });
                    (account.to_string(), handle)
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|(account, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(FeedbotError::Driver(format!("run thread for {account} panicked")))
                    });
                    (account, result)
                })
                .collect()
        })
    }
}
