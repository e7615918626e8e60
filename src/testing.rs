//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::log::AgentLog;
use crate::automation::model::Automation;
use crate::drafts::{Draft, DraftStatus};
use crate::error::{AnalysisError, DatabaseError, ProviderError};
use crate::mail::provider::{AnalysisService, MailProvider, TaskSink};
use crate::mail::types::{Category, Classification, Email, Priority, TaskRecord};
use crate::rules::{Rule, RuleInput, RuleSet};
use crate::store::{Database, DraftTransition, LibSqlBackend};

pub fn make_email(id: &str, sender: &str, subject: &str, body: &str) -> Email {
    Email {
        id: id.into(),
        sender: sender.into(),
        sender_name: None,
        subject: subject.into(),
        body: body.into(),
        received_at: Utc::now(),
        is_read: false,
        priority: None,
        category: None,
        is_vip: false,
    }
}

fn transient(operation: &str) -> ProviderError {
    ProviderError::Transient {
        operation: operation.into(),
        reason: "injected failure".into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub user_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Mailbox that serves a fixed inbox and records every mutation.
#[derive(Default)]
pub struct FakeMail {
    inbox: Mutex<Vec<Email>>,
    sent: Mutex<Vec<SentMessage>>,
    labels: Mutex<Vec<(String, String)>>,
    read: Mutex<Vec<String>>,
    fetch_calls: AtomicUsize,
    label_attempts: AtomicUsize,
    label_failures: AtomicU32,
    fail_fetch: AtomicBool,
    fail_send: AtomicBool,
}

impl FakeMail {
    pub fn new(inbox: Vec<Email>) -> Self {
        Self {
            inbox: Mutex::new(inbox),
            ..Self::default()
        }
    }

    pub fn push(&self, email: Email) {
        self.inbox.lock().unwrap().push(email);
    }

    /// Fail the next `n` label calls with a transient error.
    pub fn fail_next_labels(&self, n: u32) {
        self.label_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self) {
        self.fail_fetch.store(true, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<(String, String)> {
        self.labels.lock().unwrap().clone()
    }

    pub fn read(&self) -> Vec<String> {
        self.read.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn label_attempts(&self) -> usize {
        self.label_attempts.load(Ordering::SeqCst)
    }

    /// Successful sends, labels, and mark-reads.
    pub fn mutation_count(&self) -> usize {
        self.sent.lock().unwrap().len()
            + self.labels.lock().unwrap().len()
            + self.read.lock().unwrap().len()
    }
}

#[async_trait]
impl MailProvider for FakeMail {
    async fn fetch_unread(&self, _user_id: &str, limit: usize) -> Result<Vec<Email>, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(transient("fetch_unread"));
        }
        let inbox = self.inbox.lock().unwrap();
        Ok(inbox.iter().filter(|e| !e.is_read).take(limit).cloned().collect())
    }

    async fn send(&self, user_id: &str, to: &str, subject: &str, body: &str) -> Result<(), ProviderError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(transient("send"));
        }
        self.sent.lock().unwrap().push(SentMessage {
            user_id: user_id.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        });
        Ok(())
    }

    async fn label(&self, _user_id: &str, email_id: &str, name: &str) -> Result<(), ProviderError> {
        self.label_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.label_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.label_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(transient("label"));
        }
        self.labels.lock().unwrap().push((email_id.into(), name.into()));
        Ok(())
    }

    async fn mark_read(&self, _user_id: &str, email_id: &str) -> Result<(), ProviderError> {
        let mut inbox = self.inbox.lock().unwrap();
        if let Some(email) = inbox.iter_mut().find(|e| e.id == email_id) {
            email.is_read = true;
        }
        self.read.lock().unwrap().push(email_id.into());
        Ok(())
    }
}

/// Analysis double with per-email classifications and injectable failures.
pub struct FakeAnalysis {
    classifications: Mutex<HashMap<String, Classification>>,
    failing: Mutex<HashSet<String>>,
    draft_body: Mutex<String>,
    fail_drafts: AtomicBool,
    classify_calls: AtomicUsize,
    draft_calls: AtomicUsize,
}

impl Default for FakeAnalysis {
    fn default() -> Self {
        Self {
            classifications: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            draft_body: Mutex::new("Thanks for your note. I'll get back to you shortly.".into()),
            fail_drafts: AtomicBool::new(false),
            classify_calls: AtomicUsize::new(0),
            draft_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify_as(&self, email_id: &str, category: Category, priority: Priority) {
        self.classifications.lock().unwrap().insert(
            email_id.into(),
            Classification {
                category,
                priority,
                summary: format!("{category} email"),
            },
        );
    }

    pub fn fail_classify(&self, email_id: &str) {
        self.failing.lock().unwrap().insert(email_id.into());
    }

    pub fn set_draft_body(&self, body: &str) {
        *self.draft_body.lock().unwrap() = body.into();
    }

    pub fn fail_drafts(&self) {
        self.fail_drafts.store(true, Ordering::SeqCst);
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub fn draft_calls(&self) -> usize {
        self.draft_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisService for FakeAnalysis {
    async fn classify(&self, email: &Email) -> Result<Classification, AnalysisError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&email.id) {
            return Err(AnalysisError::RequestFailed {
                reason: "injected failure".into(),
            });
        }
        Ok(self
            .classifications
            .lock()
            .unwrap()
            .get(&email.id)
            .cloned()
            .unwrap_or(Classification {
                category: Category::Fyi,
                priority: Priority::Normal,
                summary: String::new(),
            }))
    }

    async fn draft(&self, _email: &Email, _instructions: &str, _tone: &str) -> Result<String, AnalysisError> {
        self.draft_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_drafts.load(Ordering::SeqCst) {
            return Err(AnalysisError::RequestFailed {
                reason: "injected failure".into(),
            });
        }
        Ok(self.draft_body.lock().unwrap().clone())
    }
}

/// Task list that remembers what it was given.
#[derive(Default)]
pub struct FakeTasks {
    tasks: Mutex<Vec<TaskRecord>>,
    fail: AtomicBool,
}

impl FakeTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskSink for FakeTasks {
    async fn create_task(&self, _user_id: &str, task: &TaskRecord) -> Result<String, ProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::Permanent {
                operation: "create_task".into(),
                reason: "injected failure".into(),
            });
        }
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(task.clone());
        Ok(format!("task-{}", tasks.len()))
    }
}

/// In-memory store whose cycle writes can be made to fail.
pub struct FlakyStore {
    inner: LibSqlBackend,
    fail_record_cycle: AtomicBool,
    fail_trigger_count: AtomicBool,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_record_cycle: AtomicBool::new(false),
            fail_trigger_count: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &LibSqlBackend {
        &self.inner
    }

    pub fn fail_record_cycle(&self, fail: bool) {
        self.fail_record_cycle.store(fail, Ordering::SeqCst);
    }

    pub fn fail_trigger_count(&self, fail: bool) {
        self.fail_trigger_count.store(fail, Ordering::SeqCst);
    }
}

fn write_failed(operation: &str) -> DatabaseError {
    DatabaseError::Query(format!("{operation}: injected failure"))
}

#[async_trait]
impl Database for FlakyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn create_rule(&self, user_id: &str, input: &RuleInput) -> Result<Rule, DatabaseError> {
        self.inner.create_rule(user_id, input).await
    }

    async fn get_rule(&self, user_id: &str, id: i64) -> Result<Option<Rule>, DatabaseError> {
        self.inner.get_rule(user_id, id).await
    }

    async fn update_rule(
        &self,
        user_id: &str,
        id: i64,
        input: &RuleInput,
    ) -> Result<Option<Rule>, DatabaseError> {
        self.inner.update_rule(user_id, id, input).await
    }

    async fn delete_rule(&self, user_id: &str, id: i64) -> Result<bool, DatabaseError> {
        self.inner.delete_rule(user_id, id).await
    }

    async fn set_rule_enabled(
        &self,
        user_id: &str,
        id: i64,
        enabled: bool,
    ) -> Result<Option<Rule>, DatabaseError> {
        self.inner.set_rule_enabled(user_id, id, enabled).await
    }

    async fn list_rules(&self, user_id: &str) -> Result<RuleSet, DatabaseError> {
        self.inner.list_rules(user_id).await
    }

    async fn load_enabled_rules(&self, user_id: &str) -> Result<RuleSet, DatabaseError> {
        self.inner.load_enabled_rules(user_id).await
    }

    async fn increment_rule_trigger_count(&self, id: i64) -> Result<(), DatabaseError> {
        if self.fail_trigger_count.load(Ordering::SeqCst) {
            return Err(write_failed("increment_rule_trigger_count"));
        }
        self.inner.increment_rule_trigger_count(id).await
    }

    async fn flag_malformed_rule(&self, id: i64, reason: &str) -> Result<(), DatabaseError> {
        self.inner.flag_malformed_rule(id, reason).await
    }

    async fn create_automation(&self, automation: &Automation) -> Result<(), DatabaseError> {
        self.inner.create_automation(automation).await
    }

    async fn get_automation(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<Automation>, DatabaseError> {
        self.inner.get_automation(user_id, id).await
    }

    async fn delete_automation(&self, user_id: &str, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.delete_automation(user_id, id).await
    }

    async fn list_automations(&self, user_id: &str) -> Result<Vec<Automation>, DatabaseError> {
        self.inner.list_automations(user_id).await
    }

    async fn list_due_automations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Automation>, DatabaseError> {
        self.inner.list_due_automations(now).await
    }

    async fn record_automation_fire(
        &self,
        id: Uuid,
        expected_run_count: u64,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        log: &AgentLog,
    ) -> Result<bool, DatabaseError> {
        self.inner
            .record_automation_fire(id, expected_run_count, fired_at, next_fire_at, log)
            .await
    }

    async fn insert_draft(&self, draft: &Draft) -> Result<(), DatabaseError> {
        self.inner.insert_draft(draft).await
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        self.inner.get_draft(id).await
    }

    async fn list_drafts(
        &self,
        user_id: &str,
        status: Option<DraftStatus>,
    ) -> Result<Vec<Draft>, DatabaseError> {
        self.inner.list_drafts(user_id, status).await
    }

    async fn transition_draft(
        &self,
        id: Uuid,
        from: DraftStatus,
        to: DraftStatus,
        body: Option<&str>,
    ) -> Result<DraftTransition, DatabaseError> {
        self.inner.transition_draft(id, from, to, body).await
    }

    async fn load_processed_ids(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        self.inner.load_processed_ids(user_id).await
    }

    async fn record_cycle(
        &self,
        user_id: &str,
        email_ids: &[String],
        log: &AgentLog,
    ) -> Result<(), DatabaseError> {
        if self.fail_record_cycle.load(Ordering::SeqCst) {
            return Err(write_failed("record_cycle"));
        }
        self.inner.record_cycle(user_id, email_ids, log).await
    }

    async fn append_agent_log(&self, log: &AgentLog) -> Result<(), DatabaseError> {
        self.inner.append_agent_log(log).await
    }

    async fn list_agent_logs(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentLog>, DatabaseError> {
        self.inner.list_agent_logs(user_id, limit).await
    }

    async fn list_agent_logs_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AgentLog>, DatabaseError> {
        self.inner.list_agent_logs_since(user_id, since).await
    }

    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        self.inner.get_setting(user_id, key).await
    }

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.inner.set_setting(user_id, key, value).await
    }

    async fn list_agent_users(&self) -> Result<Vec<String>, DatabaseError> {
        self.inner.list_agent_users().await
    }
}
