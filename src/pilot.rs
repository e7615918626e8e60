//! The public entry point: one handle over the agent, rules, automations,
//! and draft review.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::agent::cycle::{AgentCycleRunner, CycleState};
use crate::agent::executor::ActionExecutor;
use crate::agent::lock::UserLocks;
use crate::agent::log::AgentLog;
use crate::agent::settings::UserSettings;
use crate::automation::model::{Automation, AutomationInput};
use crate::automation::scheduler::{AutomationScheduler, LeaderLease, TickReport};
use crate::config::{AgentConfig, SchedulerConfig};
use crate::drafts::{Draft, DraftApprovals, DraftStatus};
use crate::error::{DatabaseError, Result};
use crate::mail::provider::{AnalysisService, MailProvider, TaskSink};
use crate::rules::{Rule, RuleInput, RuleSet};
use crate::safety::DraftSafetyReviewer;
use crate::store::Database;

/// External collaborators the pilot is built from.
pub struct PilotDeps {
    pub store: Arc<dyn Database>,
    pub mail: Arc<dyn MailProvider>,
    pub analysis: Arc<dyn AnalysisService>,
    pub tasks: Arc<dyn TaskSink>,
}

/// Snapshot of a user's agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub user_id: String,
    pub state: CycleState,
    /// A cycle or automation currently holds the user's lock.
    pub busy: bool,
    pub processed_total: usize,
    pub pending_drafts: usize,
    /// Pending drafts an auto-send policy would accept.
    pub auto_send_eligible: usize,
    pub enabled_rules: usize,
    pub malformed_rules: usize,
    pub automations: usize,
    pub next_automation_at: Option<DateTime<Utc>>,
    pub last_log: Option<AgentLog>,
}

pub struct InboxPilot {
    store: Arc<dyn Database>,
    locks: UserLocks,
    runner: Arc<AgentCycleRunner>,
    scheduler: Arc<AutomationScheduler>,
    approvals: DraftApprovals,
}

fn not_found(entity: &str, id: impl ToString) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

impl InboxPilot {
    pub fn new(deps: PilotDeps, agent: AgentConfig, scheduler: SchedulerConfig) -> Self {
        Self::build(deps, agent, scheduler, None)
    }

    /// Like [`Self::new`] with a shared leader lease for the scheduler.
    pub fn with_lease(
        deps: PilotDeps,
        agent: AgentConfig,
        scheduler: SchedulerConfig,
        lease: Arc<dyn LeaderLease>,
    ) -> Self {
        Self::build(deps, agent, scheduler, Some(lease))
    }

    fn build(
        deps: PilotDeps,
        agent: AgentConfig,
        scheduler_config: SchedulerConfig,
        lease: Option<Arc<dyn LeaderLease>>,
    ) -> Self {
        let PilotDeps {
            store,
            mail,
            analysis,
            tasks,
        } = deps;

        let executor = Arc::new(
            ActionExecutor::new(
                mail.clone(),
                analysis,
                tasks,
                store.clone(),
                agent.retry.clone(),
            )
            .with_reviewer(Arc::new(DraftSafetyReviewer::new()))
            .with_batch_size(agent.batch_size),
        );
        let locks = UserLocks::new();
        let approvals = DraftApprovals::new(store.clone(), mail, agent.retry.clone());

        let mut scheduler = AutomationScheduler::new(
            scheduler_config,
            store.clone(),
            executor.clone(),
            locks.clone(),
        );
        if let Some(lease) = lease {
            scheduler = scheduler.with_lease(lease);
        }
        let runner = Arc::new(AgentCycleRunner::new(
            agent,
            store.clone(),
            executor,
            locks.clone(),
        ));

        Self {
            store,
            locks,
            runner,
            scheduler: Arc::new(scheduler),
            approvals,
        }
    }

    pub fn runner(&self) -> Arc<AgentCycleRunner> {
        Arc::clone(&self.runner)
    }

    pub fn scheduler(&self) -> Arc<AutomationScheduler> {
        Arc::clone(&self.scheduler)
    }

    // ── Agent ───────────────────────────────────────────────────────

    pub async fn run_cycle(&self, user_id: &str) -> Result<AgentLog> {
        self.runner.run_cycle(user_id).await
    }

    pub async fn get_agent_status(&self, user_id: &str) -> Result<AgentStatus> {
        let processed_total = self.store.load_processed_ids(user_id).await?.len();
        let settings = UserSettings::load(self.store.as_ref(), user_id).await?;
        let pending = self
            .store
            .list_drafts(user_id, Some(DraftStatus::Pending))
            .await?;
        let auto_send_eligible = pending
            .iter()
            .filter(|d| d.auto_send_eligible(&settings.auto_send_categories))
            .count();
        let RuleSet { rules, malformed } = self.store.list_rules(user_id).await?;
        let automations = self.store.list_automations(user_id).await?;
        let next_automation_at = automations
            .iter()
            .filter(|a| a.enabled)
            .filter_map(|a| a.next_fire_at)
            .min();
        let last_log = self.store.list_agent_logs(user_id, 1).await?.into_iter().next();

        Ok(AgentStatus {
            user_id: user_id.to_string(),
            state: self.runner.current_state(user_id),
            busy: self.locks.is_held(user_id),
            processed_total,
            pending_drafts: pending.len(),
            auto_send_eligible,
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
            malformed_rules: malformed.len(),
            automations: automations.len(),
            next_automation_at,
            last_log,
        })
    }

    pub async fn get_settings(&self, user_id: &str) -> Result<UserSettings> {
        Ok(UserSettings::load(self.store.as_ref(), user_id).await?)
    }

    pub async fn update_settings(&self, user_id: &str, settings: UserSettings) -> Result<UserSettings> {
        settings.save(self.store.as_ref(), user_id).await?;
        info!(user_id, vip_contacts = settings.vip_contacts.len(), "Settings updated");
        Ok(settings)
    }

    // ── Rules ───────────────────────────────────────────────────────

    pub async fn rule_create(&self, user_id: &str, input: RuleInput) -> Result<Rule> {
        input.validate()?;
        let rule = self.store.create_rule(user_id, &input).await?;
        info!(user_id, rule_id = rule.id, name = %rule.name, "Rule created");
        Ok(rule)
    }

    pub async fn rule_update(&self, user_id: &str, rule_id: i64, input: RuleInput) -> Result<Rule> {
        input.validate()?;
        let rule = self
            .store
            .update_rule(user_id, rule_id, &input)
            .await?
            .ok_or_else(|| not_found("rule", rule_id))?;
        info!(user_id, rule_id, "Rule updated");
        Ok(rule)
    }

    pub async fn rule_delete(&self, user_id: &str, rule_id: i64) -> Result<()> {
        if !self.store.delete_rule(user_id, rule_id).await? {
            return Err(not_found("rule", rule_id).into());
        }
        info!(user_id, rule_id, "Rule deleted");
        Ok(())
    }

    pub async fn rule_toggle(&self, user_id: &str, rule_id: i64, enabled: bool) -> Result<Rule> {
        let rule = self
            .store
            .set_rule_enabled(user_id, rule_id, enabled)
            .await?
            .ok_or_else(|| not_found("rule", rule_id))?;
        info!(user_id, rule_id, enabled, "Rule toggled");
        Ok(rule)
    }

    pub async fn list_rules(&self, user_id: &str) -> Result<RuleSet> {
        Ok(self.store.list_rules(user_id).await?)
    }

    // ── Automations ─────────────────────────────────────────────────

    pub async fn automation_create(&self, user_id: &str, input: AutomationInput) -> Result<Automation> {
        let automation = Automation::new(user_id, input, Utc::now())?;
        self.store.create_automation(&automation).await?;
        info!(
            user_id,
            automation_id = %automation.id,
            name = %automation.name,
            next_fire_at = ?automation.next_fire_at,
            "Automation created"
        );
        Ok(automation)
    }

    pub async fn automation_delete(&self, user_id: &str, automation_id: Uuid) -> Result<()> {
        if !self.store.delete_automation(user_id, automation_id).await? {
            return Err(not_found("automation", automation_id).into());
        }
        info!(user_id, automation_id = %automation_id, "Automation deleted");
        Ok(())
    }

    pub async fn list_automations(&self, user_id: &str) -> Result<Vec<Automation>> {
        Ok(self.store.list_automations(user_id).await?)
    }

    /// Fire whatever is due at `now`. The background loop calls the same code.
    pub async fn run_scheduler_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        Ok(self.scheduler.tick(now).await?)
    }

    // ── Drafts ──────────────────────────────────────────────────────

    pub async fn list_drafts(&self, user_id: &str, status: Option<DraftStatus>) -> Result<Vec<Draft>> {
        Ok(self.store.list_drafts(user_id, status).await?)
    }

    pub async fn approve_draft(&self, draft_id: Uuid, edited_body: Option<&str>) -> Result<Draft> {
        self.approvals.approve(draft_id, edited_body).await
    }

    pub async fn send_approved_draft(&self, draft_id: Uuid) -> Result<Draft> {
        self.approvals.send_approved(draft_id).await
    }

    pub async fn reject_draft(&self, draft_id: Uuid) -> Result<Draft> {
        self.approvals.reject(draft_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::retry::RetryPolicy;
    use crate::automation::model::{AutomationAction, Schedule};
    use crate::error::{Error, ValidationError};
    use crate::rules::{RuleAction, Trigger};
    use crate::store::LibSqlBackend;
    use crate::testing::{FakeAnalysis, FakeMail, FakeTasks, make_email};

    async fn pilot(inbox: Vec<crate::mail::types::Email>) -> (InboxPilot, Arc<FakeMail>) {
        let mail = Arc::new(FakeMail::new(inbox));
        let deps = PilotDeps {
            store: Arc::new(LibSqlBackend::new_memory().await.unwrap()),
            mail: mail.clone(),
            analysis: Arc::new(FakeAnalysis::new()),
            tasks: Arc::new(FakeTasks::new()),
        };
        let agent = AgentConfig {
            retry: RetryPolicy::immediate(),
            ..AgentConfig::default()
        };
        (InboxPilot::new(deps, agent, SchedulerConfig::default()), mail)
    }

    fn archive_rule(name: &str) -> RuleInput {
        RuleInput::new(name, Trigger::VipSender, RuleAction::Archive)
    }

    #[tokio::test]
    async fn empty_rule_name_is_rejected() {
        let (pilot, _) = pilot(vec![]).await;
        let err = pilot.rule_create("u1", archive_rule("  ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::Rule(_))));
    }

    #[tokio::test]
    async fn other_users_rule_is_not_found() {
        let (pilot, _) = pilot(vec![]).await;
        let rule = pilot.rule_create("u1", archive_rule("mine")).await.unwrap();

        let err = pilot.rule_toggle("u2", rule.id, false).await.unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::NotFound { .. })));
        let err = pilot.rule_delete("u2", rule.id).await.unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::NotFound { .. })));

        let toggled = pilot.rule_toggle("u1", rule.id, false).await.unwrap();
        assert!(!toggled.enabled);
        pilot.rule_delete("u1", rule.id).await.unwrap();
        assert!(pilot.list_rules("u1").await.unwrap().rules.is_empty());
    }

    #[tokio::test]
    async fn rule_update_replaces_definition() {
        let (pilot, _) = pilot(vec![]).await;
        let rule = pilot.rule_create("u1", archive_rule("old")).await.unwrap();
        let updated = pilot
            .rule_update(
                "u1",
                rule.id,
                RuleInput::new("new", Trigger::PriorityHigh, RuleAction::Label { name: None }),
            )
            .await
            .unwrap();
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.name, "new");
        assert_eq!(updated.trigger, Trigger::PriorityHigh);
    }

    #[tokio::test]
    async fn bad_timezone_is_a_validation_error() {
        let (pilot, _) = pilot(vec![]).await;
        let err = pilot
            .automation_create(
                "u1",
                AutomationInput {
                    name: "digest".into(),
                    schedule: Schedule::Daily { hour: 8, minute: 0 },
                    timezone: "Mars/Olympus".into(),
                    action: AutomationAction::WeeklyDigest { send_to: None },
                    enabled: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::Timezone(_))));
        assert!(pilot.list_automations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_followup_window_is_rejected() {
        let (pilot, _) = pilot(vec![]).await;
        let err = pilot
            .automation_create(
                "u1",
                AutomationInput {
                    name: "chase drafts".into(),
                    schedule: Schedule::Daily { hour: 8, minute: 0 },
                    timezone: "UTC".into(),
                    action: AutomationAction::FollowupCheck { after_days: 100_000_000 },
                    enabled: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::Automation(_))));
        assert!(pilot.list_automations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn automation_delete_checks_owner() {
        let (pilot, _) = pilot(vec![]).await;
        let automation = pilot
            .automation_create(
                "u1",
                AutomationInput {
                    name: "cleanup".into(),
                    schedule: Schedule::Daily { hour: 23, minute: 30 },
                    timezone: "Europe/Berlin".into(),
                    action: AutomationAction::Cleanup {
                        categories: vec![crate::mail::types::Category::Promotional],
                    },
                    enabled: true,
                },
            )
            .await
            .unwrap();
        assert!(pilot.automation_delete("u2", automation.id).await.is_err());
        pilot.automation_delete("u1", automation.id).await.unwrap();
    }

    #[tokio::test]
    async fn status_reflects_last_cycle() {
        let (pilot, _) = pilot(vec![make_email("e1", "a@example.com", "Hi", "")]).await;
        pilot.rule_create("u1", archive_rule("vip")).await.unwrap();
        pilot.run_cycle("u1").await.unwrap();

        let status = pilot.get_agent_status("u1").await.unwrap();
        assert_eq!(status.state, CycleState::Idle);
        assert!(!status.busy);
        assert_eq!(status.processed_total, 1);
        assert_eq!(status.enabled_rules, 1);
        assert_eq!(status.last_log.map(|l| l.processed_count), Some(1));
    }

    #[tokio::test]
    async fn settings_roundtrip_through_pilot() {
        let (pilot, _) = pilot(vec![]).await;
        let settings = UserSettings {
            vip_contacts: vec!["boss@example.com".into()],
            ..UserSettings::default()
        };
        pilot.update_settings("u1", settings.clone()).await.unwrap();
        assert_eq!(pilot.get_settings("u1").await.unwrap(), settings);
    }
}
