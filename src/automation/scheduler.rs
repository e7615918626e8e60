//! Fires due automations on a fixed polling interval.
//!
//! The scheduler owns no timers per automation. Each tick asks the store for
//! automations whose persisted `next_fire_at` has passed, runs them, and
//! advances their fire state with a compare-and-swap on `run_count`. Because
//! the persisted row is the only source of truth, a restart picks up exactly
//! where the last commit left off.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::executor::ActionExecutor;
use crate::agent::lock::UserLocks;
use crate::agent::log::ErrorRecord;
use crate::agent::settings::UserSettings;
use crate::automation::model::Automation;
use crate::config::SchedulerConfig;
use crate::error::DatabaseError;
use crate::store::Database;

/// Permission for one process to advance automations.
#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Try to take or renew the lease. `false` means another instance holds it.
    async fn acquire(&self) -> bool;

    async fn release(&self);
}

/// Lease for a single-instance deployment; always granted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLease;

#[async_trait]
impl LeaderLease for LocalLease {
    async fn acquire(&self) -> bool {
        true
    }

    async fn release(&self) {}
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Automations whose occurrence was committed.
    pub fired: Vec<Uuid>,
    /// Left due: user busy, or another writer advanced it first.
    pub skipped: Vec<Uuid>,
    /// Could not be committed because of a store error.
    pub failed: Vec<Uuid>,
    /// Set when the leader lease was not granted.
    pub not_leader: bool,
}

pub struct AutomationScheduler {
    config: SchedulerConfig,
    store: Arc<dyn Database>,
    executor: Arc<ActionExecutor>,
    locks: UserLocks,
    lease: Arc<dyn LeaderLease>,
}

impl AutomationScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Database>,
        executor: Arc<ActionExecutor>,
        locks: UserLocks,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            locks,
            lease: Arc::new(LocalLease),
        }
    }

    pub fn with_lease(mut self, lease: Arc<dyn LeaderLease>) -> Self {
        self.lease = lease;
        self
    }

    /// Fire every automation due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, DatabaseError> {
        let mut report = TickReport::default();
        if !self.config.enabled {
            return Ok(report);
        }
        if !self.lease.acquire().await {
            debug!("Leader lease held elsewhere, skipping tick");
            report.not_leader = true;
            return Ok(report);
        }

        let due = self.store.list_due_automations(now).await?;
        if !due.is_empty() {
            debug!(count = due.len(), "Due automations");
        }

        for automation in due {
            let id = automation.id;
            match self.fire(&automation, now).await {
                Ok(true) => report.fired.push(id),
                Ok(false) => report.skipped.push(id),
                Err(e) => {
                    error!(automation_id = %id, name = %automation.name, "Automation fire failed: {e}");
                    report.failed.push(id);
                }
            }
        }
        Ok(report)
    }

    /// Run one occurrence. `Ok(false)` means it was left for a later tick.
    async fn fire(&self, automation: &Automation, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let user_id = automation.user_id.as_str();
        let Some(_lock) = self.locks.try_acquire(user_id) else {
            debug!(automation_id = %automation.id, user_id, "User busy, automation stays due");
            return Ok(false);
        };

        let mut log = ActionExecutor::automation_log(automation, now);

        // Several missed occurrences collapse into this one firing.
        let next_fire_at = match automation.next_fire_after(now) {
            Ok(next) => next,
            Err(e) => {
                warn!(automation_id = %automation.id, "Cannot schedule next occurrence: {e}");
                log.record_error(ErrorRecord::new(format!("no further occurrences: {e}")));
                None
            }
        };

        let settings = UserSettings::load(self.store.as_ref(), user_id).await?;
        if let Err(e) = self
            .executor
            .execute_automation(automation, &settings, now, &mut log)
            .await
        {
            warn!(automation_id = %automation.id, user_id, "Automation action failed: {e}");
            log.record_error(ErrorRecord {
                action: Some(automation.action.type_tag().to_string()),
                ..ErrorRecord::new(e.to_string())
            });
        }

        let agent_log = log.finish(Utc::now());
        let committed = self
            .store
            .record_automation_fire(
                automation.id,
                automation.run_count,
                now,
                next_fire_at,
                &agent_log,
            )
            .await?;

        if committed {
            info!(
                automation_id = %automation.id,
                name = %automation.name,
                user_id,
                run_count = automation.run_count + 1,
                next_fire_at = ?next_fire_at,
                errors = agent_log.errors.len(),
                "Automation fired"
            );
        } else {
            warn!(automation_id = %automation.id, "Automation advanced concurrently, discarding this firing");
        }
        Ok(committed)
    }
}

/// Spawn the scheduler's polling loop.
pub fn spawn_scheduler(
    scheduler: Arc<AutomationScheduler>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Automation scheduler started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                scheduler.lease.release().await;
                info!("Automation scheduler shutting down");
                return;
            }

            match scheduler.tick(Utc::now()).await {
                Ok(report) if !report.fired.is_empty() || !report.failed.is_empty() => {
                    info!(
                        fired = report.fired.len(),
                        skipped = report.skipped.len(),
                        failed = report.failed.len(),
                        "Scheduler tick"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Scheduler tick failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::agent::retry::RetryPolicy;
    use crate::automation::model::{AutomationAction, AutomationInput, Schedule};
    use crate::store::LibSqlBackend;
    use crate::testing::{FakeAnalysis, FakeMail, FakeTasks};

    struct Harness {
        mail: Arc<FakeMail>,
        store: Arc<LibSqlBackend>,
        locks: UserLocks,
        scheduler: AutomationScheduler,
    }

    async fn harness_on(store: Arc<LibSqlBackend>) -> Harness {
        let mail = Arc::new(FakeMail::new(vec![]));
        let executor = Arc::new(ActionExecutor::new(
            mail.clone(),
            Arc::new(FakeAnalysis::new()),
            Arc::new(FakeTasks::new()),
            store.clone(),
            RetryPolicy::immediate(),
        ));
        let locks = UserLocks::new();
        let scheduler =
            AutomationScheduler::new(SchedulerConfig::default(), store.clone(), executor, locks.clone());
        Harness {
            mail,
            store,
            locks,
            scheduler,
        }
    }

    async fn harness() -> Harness {
        harness_on(Arc::new(LibSqlBackend::new_memory().await.unwrap())).await
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    /// Monday 09:00 UTC digest, created on Sunday 2026-03-01.
    fn weekly_digest(store_user: &str) -> Automation {
        Automation::new(
            store_user,
            AutomationInput {
                name: "Monday digest".into(),
                schedule: Schedule::Weekly {
                    day_of_week: 1,
                    hour: 9,
                    minute: 0,
                },
                timezone: "UTC".into(),
                action: AutomationAction::WeeklyDigest {
                    send_to: Some("me@example.com".into()),
                },
                enabled: true,
            },
            at(2026, 3, 1, 12, 0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn nothing_fires_before_the_instant() {
        let h = harness().await;
        let automation = weekly_digest("u1");
        h.store.create_automation(&automation).await.unwrap();

        let report = h.scheduler.tick(at(2026, 3, 2, 8, 59)).await.unwrap();
        assert!(report.fired.is_empty());
        assert!(h.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn fires_once_when_time_crosses() {
        let h = harness().await;
        let automation = weekly_digest("u1");
        h.store.create_automation(&automation).await.unwrap();

        let report = h.scheduler.tick(at(2026, 3, 2, 9, 0)).await.unwrap();
        assert_eq!(report.fired, vec![automation.id]);
        let again = h.scheduler.tick(at(2026, 3, 2, 9, 1)).await.unwrap();
        assert!(again.fired.is_empty());

        let stored = h.store.get_automation("u1", automation.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_fired, Some(at(2026, 3, 2, 9, 0)));
        assert_eq!(stored.next_fire_at, Some(at(2026, 3, 9, 9, 0)));
        assert_eq!(h.mail.sent().len(), 1);

        let logs = h.store.list_agent_logs("u1", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn missed_occurrences_coalesce() {
        let h = harness().await;
        let automation = weekly_digest("u1");
        h.store.create_automation(&automation).await.unwrap();

        // Three Mondays later.
        let report = h.scheduler.tick(at(2026, 3, 20, 12, 0)).await.unwrap();
        assert_eq!(report.fired.len(), 1);
        let stored = h.store.get_automation("u1", automation.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.next_fire_at, Some(at(2026, 3, 23, 9, 0)));
    }

    #[tokio::test]
    async fn busy_user_stays_due() {
        let h = harness().await;
        let automation = weekly_digest("u1");
        h.store.create_automation(&automation).await.unwrap();

        let guard = h.locks.try_acquire("u1").unwrap();
        let report = h.scheduler.tick(at(2026, 3, 2, 9, 0)).await.unwrap();
        assert_eq!(report.skipped, vec![automation.id]);
        drop(guard);

        let report = h.scheduler.tick(at(2026, 3, 2, 9, 1)).await.unwrap();
        assert_eq!(report.fired, vec![automation.id]);
    }

    #[tokio::test]
    async fn failed_action_still_advances() {
        let h = harness().await;
        h.mail.fail_sends(true);
        let automation = weekly_digest("u1");
        h.store.create_automation(&automation).await.unwrap();

        let report = h.scheduler.tick(at(2026, 3, 2, 9, 0)).await.unwrap();
        assert_eq!(report.fired, vec![automation.id]);

        let logs = h.store.list_agent_logs("u1", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].errors.is_empty());
        let stored = h.store.get_automation("u1", automation.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
    }

    #[tokio::test]
    async fn disabled_automation_never_fires() {
        let h = harness().await;
        let mut automation = weekly_digest("u1");
        automation.enabled = false;
        h.store.create_automation(&automation).await.unwrap();

        let report = h.scheduler.tick(at(2026, 3, 2, 9, 0)).await.unwrap();
        assert!(report.fired.is_empty());
    }

    struct DeniedLease;

    #[async_trait]
    impl LeaderLease for DeniedLease {
        async fn acquire(&self) -> bool {
            false
        }

        async fn release(&self) {}
    }

    #[tokio::test]
    async fn follower_does_not_fire() {
        let mut h = harness().await;
        let automation = weekly_digest("u1");
        h.store.create_automation(&automation).await.unwrap();
        h.scheduler = h.scheduler.with_lease(Arc::new(DeniedLease));

        let report = h.scheduler.tick(at(2026, 3, 2, 9, 0)).await.unwrap();
        assert!(report.not_leader);
        assert!(report.fired.is_empty());
        let stored = h.store.get_automation("u1", automation.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 0);
    }

    #[tokio::test]
    async fn restart_does_not_refire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.db");
        let automation = weekly_digest("u1");

        {
            let store = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
            store.create_automation(&automation).await.unwrap();
            let h = harness_on(store).await;
            let report = h.scheduler.tick(at(2026, 3, 2, 9, 0)).await.unwrap();
            assert_eq!(report.fired.len(), 1);
        }

        let store = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let h = harness_on(store).await;
        let report = h.scheduler.tick(at(2026, 3, 2, 9, 5)).await.unwrap();
        assert!(report.fired.is_empty());
        assert!(h.mail.sent().is_empty());

        let report = h.scheduler.tick(at(2026, 3, 9, 9, 0)).await.unwrap();
        assert_eq!(report.fired.len(), 1);
        let stored = h.store.get_automation("u1", automation.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 2);
    }
}
