//! One reactive pass over a user's unread mail.
//!
//! A cycle moves through Fetching -> Evaluating -> Executing -> Logging and
//! back to Idle. Processed ids and the audit log are written in one
//! transaction at the end, so a crash mid-cycle leaves every email eligible
//! for the next run.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::executor::{ActionContext, ActionExecutor};
use crate::agent::lock::UserLocks;
use crate::agent::log::{ActionRecord, AgentLog, ErrorRecord, LogBuilder, LogKind};
use crate::agent::settings::UserSettings;
use crate::agent::tracker::IdempotencyTracker;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::mail::types::ClassifiedEmail;
use crate::rules::RuleEngine;
use crate::store::Database;

/// Where a user's cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Fetching,
    Evaluating,
    Executing,
    Logging,
}

type StateMap = Mutex<HashMap<String, CycleState>>;

/// Tracks the state of one running cycle and resets it to idle on drop.
struct StateGuard<'a> {
    states: &'a StateMap,
    user_id: String,
}

impl<'a> StateGuard<'a> {
    fn new(states: &'a StateMap, user_id: &str) -> Self {
        let guard = Self {
            states,
            user_id: user_id.to_string(),
        };
        guard.set(CycleState::Fetching);
        guard
    }

    fn set(&self, state: CycleState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(self.user_id.clone(), state);
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(&self.user_id);
    }
}

pub struct AgentCycleRunner {
    config: AgentConfig,
    store: Arc<dyn Database>,
    executor: Arc<ActionExecutor>,
    locks: UserLocks,
    states: StateMap,
}

impl AgentCycleRunner {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn Database>,
        executor: Arc<ActionExecutor>,
        locks: UserLocks,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            locks,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn current_state(&self, user_id: &str) -> CycleState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(user_id).copied().unwrap_or_default()
    }

    /// Run one cycle for `user_id`.
    ///
    /// Fails with [`AgentError::CycleInProgress`] when the user's cycle or
    /// automation is already running. Per-email failures do not fail the
    /// cycle; they are recorded in the returned log.
    pub async fn run_cycle(&self, user_id: &str) -> Result<AgentLog> {
        let Some(_lock) = self.locks.try_acquire(user_id) else {
            return Err(AgentError::CycleInProgress {
                user_id: user_id.to_string(),
            }
            .into());
        };
        let state = StateGuard::new(&self.states, user_id);
        let started = Instant::now();
        let mut log = LogBuilder::new(user_id, LogKind::Cycle, Utc::now());

        let settings = UserSettings::load(self.store.as_ref(), user_id).await?;
        let mut tracker = IdempotencyTracker::load(self.store.as_ref(), user_id).await?;
        let rule_set = self.store.load_enabled_rules(user_id).await?;

        for bad in &rule_set.malformed {
            warn!(user_id, rule_id = bad.id, reason = %bad.reason, "Disabling malformed rule");
            self.store.flag_malformed_rule(bad.id, &bad.reason).await?;
            log.record_error(ErrorRecord {
                rule_id: Some(bad.id),
                ..ErrorRecord::new(format!("malformed rule disabled: {}", bad.reason))
            });
        }

        let fetched = match self.executor.fetch_unread(user_id, self.config.batch_size).await {
            Ok(emails) => emails,
            Err(e) => {
                error!(user_id, "Fetch failed: {e}");
                log.record_error(ErrorRecord {
                    action: Some("fetch".into()),
                    ..ErrorRecord::new(e.to_string())
                });
                Vec::new()
            }
        };
        let pending = tracker.retain_unprocessed(fetched);
        debug!(user_id, count = pending.len(), "Unprocessed emails");

        let ctx = ActionContext {
            user_id,
            settings: &settings,
        };
        let mut counted_rules = HashSet::new();
        let total = pending.len();

        for (index, email) in pending.into_iter().enumerate() {
            if started.elapsed() >= self.config.cycle_budget {
                let deferred = total - index;
                warn!(user_id, deferred, "Cycle budget exhausted");
                log.record_error(ErrorRecord::new(format!(
                    "cycle budget exhausted; {deferred} email(s) deferred to the next cycle"
                )));
                break;
            }

            state.set(CycleState::Evaluating);
            let classification = match self.executor.classify(&email).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(user_id, email_id = %email.id, "Classification failed: {e}");
                    log.record_error(ErrorRecord {
                        action: Some("classify".into()),
                        ..ErrorRecord::for_email(&email.id, e.to_string())
                    });
                    log.record_processed(None);
                    tracker.stage(&email.id);
                    continue;
                }
            };
            let classified = ClassifiedEmail::new(email, classification, &settings.vip_contacts);
            log.record_processed(Some(classified.category));

            let triggered = RuleEngine::evaluate(&classified, &rule_set.rules);

            state.set(CycleState::Executing);
            for hit in triggered {
                if counted_rules.insert(hit.rule.id) {
                    self.store.increment_rule_trigger_count(hit.rule.id).await?;
                }
                let tag = hit.action.type_tag();
                match self.executor.execute(ctx, &classified, hit.action).await {
                    Ok(outcome) => log.record_action(ActionRecord {
                        email_id: Some(classified.email.id.clone()),
                        rule_id: Some(hit.rule.id),
                        action: tag.to_string(),
                        detail: outcome.detail(),
                    }),
                    Err(e) => {
                        warn!(
                            user_id,
                            email_id = %classified.email.id,
                            rule_id = hit.rule.id,
                            action = tag,
                            "Action failed: {e}"
                        );
                        log.record_error(ErrorRecord {
                            email_id: Some(classified.email.id.clone()),
                            rule_id: Some(hit.rule.id),
                            action: Some(tag.to_string()),
                            message: e.to_string(),
                        });
                    }
                }
            }
            tracker.stage(&classified.email.id);
        }

        state.set(CycleState::Logging);
        let agent_log = log.finish(Utc::now());
        self.store
            .record_cycle(user_id, tracker.staged(), &agent_log)
            .await?;
        tracker.commit_staged();

        info!(
            user_id,
            processed = agent_log.processed_count,
            actions = agent_log.actions.len(),
            errors = agent_log.errors.len(),
            "Cycle complete"
        );
        Ok(agent_log)
    }

    /// Run a cycle for every known user, a bounded number at a time.
    ///
    /// Users whose cycle is already running are skipped.
    pub async fn run_for_all_users(&self) -> Vec<(String, Result<AgentLog>)> {
        let users = match self.store.list_agent_users().await {
            Ok(users) => users,
            Err(e) => {
                error!("Failed to list users for sweep: {e}");
                return Vec::new();
            }
        };
        let limit = self.config.max_concurrent_users.max(1);
        futures::stream::iter(users)
            .map(|user_id| async move {
                let result = self.run_cycle(&user_id).await;
                (user_id, result)
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }
}

/// Spawn the periodic all-users sweep.
///
/// Returns a join handle and a shutdown flag; set the flag to stop the loop
/// at its next tick.
pub fn spawn_agent_sweep(
    runner: Arc<AgentCycleRunner>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Agent sweep started");
        let mut tick = tokio::time::interval(interval);
        // Skip immediate first tick
        tick.tick().await;

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Agent sweep shutting down");
                return;
            }

            for (user_id, result) in runner.run_for_all_users().await {
                match result {
                    Ok(_) => {}
                    Err(crate::error::Error::Agent(AgentError::CycleInProgress { .. })) => {
                        debug!(user_id, "Skipped sweep, cycle already running");
                    }
                    Err(e) => error!(user_id, "Sweep cycle failed: {e}"),
                }
            }
        }
    });

    (handle, shutdown_flag)
}
