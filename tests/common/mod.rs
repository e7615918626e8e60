//! Stub collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use inbox_pilot::agent::RetryPolicy;
use inbox_pilot::config::{AgentConfig, SchedulerConfig};
use inbox_pilot::error::{AnalysisError, ProviderError};
use inbox_pilot::mail::{
    AnalysisService, Category, Classification, Email, MailProvider, Priority, TaskRecord, TaskSink,
};
use inbox_pilot::store::{Database, LibSqlBackend};
use inbox_pilot::{InboxPilot, PilotDeps};

pub fn email(id: &str, sender: &str, subject: &str, body: &str) -> Email {
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

/// Mailbox with a fixed inbox. Counts every call that touches the provider.
#[derive(Default)]
pub struct StubMail {
    inbox: Mutex<Vec<Email>>,
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub fetches: AtomicUsize,
    pub mutations: AtomicUsize,
    fail_send: AtomicBool,
}

impl StubMail {
    pub fn new(inbox: Vec<Email>) -> Self {
        Self {
            inbox: Mutex::new(inbox),
            ..Self::default()
        }
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MailProvider for StubMail {
    async fn fetch_unread(&self, _user_id: &str, limit: usize) -> Result<Vec<Email>, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let inbox = self.inbox.lock().unwrap();
        Ok(inbox.iter().filter(|e| !e.is_read).take(limit).cloned().collect())
    }

    async fn send(&self, _user_id: &str, to: &str, subject: &str, body: &str) -> Result<(), ProviderError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient {
                operation: "send".into(),
                reason: "smtp unavailable".into(),
            });
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap()
            .push((to.into(), subject.into(), body.into()));
        Ok(())
    }

    async fn label(&self, _user_id: &str, _email_id: &str, _name: &str) -> Result<(), ProviderError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn mark_read(&self, _user_id: &str, _email_id: &str) -> Result<(), ProviderError> {
        // Left unread on purpose so later fetches return the same mail.
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Classifies by subject keywords and drafts a fixed body.
pub struct StubAnalysis {
    pub draft_body: Mutex<String>,
    pub classifies: AtomicUsize,
    pub drafts: AtomicUsize,
}

impl StubAnalysis {
    pub fn new(draft_body: &str) -> Self {
        Self {
            draft_body: Mutex::new(draft_body.into()),
            classifies: AtomicUsize::new(0),
            drafts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnalysisService for StubAnalysis {
    async fn classify(&self, email: &Email) -> Result<Classification, AnalysisError> {
        self.classifies.fetch_add(1, Ordering::SeqCst);
        let subject = email.subject.to_lowercase();
        let (category, priority) = if subject.contains("urgent") {
            (Category::ActionRequired, Priority::Urgent)
        } else if subject.contains("newsletter") {
            (Category::Newsletter, Priority::Low)
        } else {
            (Category::Fyi, Priority::Normal)
        };
        Ok(Classification {
            category,
            priority,
            summary: email.subject.clone(),
        })
    }

    async fn draft(&self, _email: &Email, _instructions: &str, _tone: &str) -> Result<String, AnalysisError> {
        self.drafts.fetch_add(1, Ordering::SeqCst);
        Ok(self.draft_body.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct StubTasks {
    pub created: Mutex<Vec<TaskRecord>>,
}

#[async_trait]
impl TaskSink for StubTasks {
    async fn create_task(&self, _user_id: &str, task: &TaskRecord) -> Result<String, ProviderError> {
        let mut created = self.created.lock().unwrap();
        created.push(task.clone());
        Ok(format!("t{}", created.len()))
    }
}

pub struct TestPilot {
    pub pilot: Arc<InboxPilot>,
    pub store: Arc<dyn Database>,
    pub mail: Arc<StubMail>,
    pub analysis: Arc<StubAnalysis>,
    pub tasks: Arc<StubTasks>,
}

pub fn build_pilot(store: Arc<dyn Database>, inbox: Vec<Email>, draft_body: &str) -> TestPilot {
    let mail = Arc::new(StubMail::new(inbox));
    let analysis = Arc::new(StubAnalysis::new(draft_body));
    let tasks = Arc::new(StubTasks::default());
    let agent = AgentConfig {
        retry: RetryPolicy::immediate(),
        ..AgentConfig::default()
    };
    let pilot = InboxPilot::new(
        PilotDeps {
            store: store.clone(),
            mail: mail.clone(),
            analysis: analysis.clone(),
            tasks: tasks.clone(),
        },
        agent,
        SchedulerConfig::default(),
    );
    TestPilot {
        pilot: Arc::new(pilot),
        store,
        mail,
        analysis,
        tasks,
    }
}

pub async fn memory_pilot(inbox: Vec<Email>, draft_body: &str) -> TestPilot {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    build_pilot(store, inbox, draft_body)
}
