//! Applies rule and automation actions through the collaborators.
//!
//! The executor holds only shared handles and configuration, so one instance
//! serves every user and every concurrent cycle.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Days, TimeDelta, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::log::{ActionRecord, AgentLog, ErrorRecord, LogBuilder, LogKind};
use crate::agent::retry::{RetryPolicy, with_retry, with_timeout};
use crate::agent::settings::UserSettings;
use crate::automation::model::{Automation, AutomationAction};
use crate::drafts::{Draft, DraftStatus, Severity, reply_subject};
use crate::error::{ActionError, AnalysisError, ProviderError};
use crate::mail::provider::{AnalysisService, MailProvider, TaskSink};
use crate::mail::types::{
    Category, Classification, ClassifiedEmail, Email, Priority, TaskRecord, VIP_LABEL, truncate,
};
use crate::rules::RuleAction;
use crate::safety::DraftSafetyReviewer;
use crate::store::Database;

/// Longest subject kept in a generated task title.
const TASK_SUBJECT_MAX: usize = 80;

/// Window the monthly report covers.
const REPORT_WINDOW_DAYS: i64 = 30;

/// Default number of emails fetched per call.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Who an action runs for.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub user_id: &'a str,
    pub settings: &'a UserSettings,
}

/// What an action did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Labeled { labels: Vec<String> },
    DraftCreated { draft_id: Uuid, severity: Severity },
    TaskCreated { task_id: String },
    Forwarded { to: String },
    Archived { already_read: bool },
    Notified { message: String },
}

impl ActionOutcome {
    /// Short human-readable description for the audit log.
    pub fn detail(&self) -> String {
        match self {
            ActionOutcome::Labeled { labels } => labels.join(", "),
            ActionOutcome::DraftCreated { draft_id, severity } => {
                format!("draft {draft_id} (severity {severity})")
            }
            ActionOutcome::TaskCreated { task_id } => format!("task {task_id}"),
            ActionOutcome::Forwarded { to } => format!("forwarded to {to}"),
            ActionOutcome::Archived { already_read: true } => "already read".to_string(),
            ActionOutcome::Archived { already_read: false } => "marked read".to_string(),
            ActionOutcome::Notified { message } => message.clone(),
        }
    }
}

pub struct ActionExecutor {
    mail: Arc<dyn MailProvider>,
    analysis: Arc<dyn AnalysisService>,
    tasks: Arc<dyn TaskSink>,
    store: Arc<dyn Database>,
    reviewer: Arc<DraftSafetyReviewer>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl ActionExecutor {
    pub fn new(
        mail: Arc<dyn MailProvider>,
        analysis: Arc<dyn AnalysisService>,
        tasks: Arc<dyn TaskSink>,
        store: Arc<dyn Database>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            mail,
            analysis,
            tasks,
            store,
            reviewer: Arc::new(DraftSafetyReviewer::new()),
            retry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<DraftSafetyReviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fetch unread mail with retry.
    pub async fn fetch_unread(&self, user_id: &str, limit: usize) -> Result<Vec<Email>, ProviderError> {
        with_retry(&self.retry, "fetch_unread", || {
            self.mail.fetch_unread(user_id, limit)
        })
        .await
    }

    /// Classify one email, bounded by the call timeout.
    pub async fn classify(&self, email: &Email) -> Result<Classification, AnalysisError> {
        with_timeout(&self.retry, self.analysis.classify(email)).await
    }

    /// Apply one rule action to one email.
    pub async fn execute(
        &self,
        ctx: ActionContext<'_>,
        email: &ClassifiedEmail,
        action: &RuleAction,
    ) -> Result<ActionOutcome, ActionError> {
        match action {
            RuleAction::Label { name } => self.label(ctx, email, name.as_deref()).await,
            RuleAction::DraftReply { instructions, tone } => {
                self.draft_reply(ctx, email, instructions, tone.as_deref())
                    .await
            }
            RuleAction::CreateTask { title } => self.create_task(ctx, email, title.as_deref()).await,
            RuleAction::Forward { to } => self.forward(ctx, email, to).await,
            RuleAction::Archive => self.archive(ctx.user_id, &email.email).await,
            RuleAction::Notify { message } => Ok(ActionOutcome::Notified {
                message: message.clone().unwrap_or_else(|| {
                    format!(
                        "New {} email from {}: {}",
                        email.category,
                        email.email.sender_display(),
                        email.email.subject
                    )
                }),
            }),
        }
    }

    async fn label(
        &self,
        ctx: ActionContext<'_>,
        email: &ClassifiedEmail,
        name: Option<&str>,
    ) -> Result<ActionOutcome, ActionError> {
        let name = name.unwrap_or_else(|| email.category.label());
        let email_id = email.email.id.as_str();
        with_retry(&self.retry, "label", || {
            self.mail.label(ctx.user_id, email_id, name)
        })
        .await?;

        let mut labels = vec![name.to_string()];
        if email.is_vip && name != VIP_LABEL {
            match with_retry(&self.retry, "label", || {
                self.mail.label(ctx.user_id, email_id, VIP_LABEL)
            })
            .await
            {
                Ok(()) => labels.push(VIP_LABEL.to_string()),
                Err(e) => warn!(user_id = ctx.user_id, email_id, "VIP label failed: {e}"),
            }
        }
        Ok(ActionOutcome::Labeled { labels })
    }

    async fn draft_reply(
        &self,
        ctx: ActionContext<'_>,
        email: &ClassifiedEmail,
        instructions: &str,
        tone: Option<&str>,
    ) -> Result<ActionOutcome, ActionError> {
        let tone = tone.unwrap_or(&ctx.settings.draft_tone);
        let body = with_timeout(
            &self.retry,
            self.analysis.draft(&email.email, instructions, tone),
        )
        .await?;

        let review = self.reviewer.review(&body);
        let now = Utc::now();
        let draft = Draft {
            id: Uuid::new_v4(),
            user_id: ctx.user_id.to_string(),
            source_email_id: email.email.id.clone(),
            recipient: email.email.sender.clone(),
            subject: reply_subject(&email.email.subject),
            body,
            status: DraftStatus::Pending,
            instructions: instructions.to_string(),
            tone: tone.to_string(),
            severity: review.severity,
            safety_flags: review.flags,
            source_category: Some(email.category),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_draft(&draft).await?;

        if draft.severity == Severity::High {
            info!(
                user_id = ctx.user_id,
                draft_id = %draft.id,
                flags = ?draft.safety_flags,
                "High-risk draft held for review"
            );
        }
        Ok(ActionOutcome::DraftCreated {
            draft_id: draft.id,
            severity: draft.severity,
        })
    }

    async fn create_task(
        &self,
        ctx: ActionContext<'_>,
        email: &ClassifiedEmail,
        title: Option<&str>,
    ) -> Result<ActionOutcome, ActionError> {
        let title = match title {
            Some(t) => t.to_string(),
            None => default_task_title(email),
        };
        let task = TaskRecord {
            title,
            notes: task_notes(email),
            due: due_date(Utc::now(), email.priority),
            source_email_id: Some(email.email.id.clone()),
        };
        let task_id = with_retry(&self.retry, "create_task", || {
            self.tasks.create_task(ctx.user_id, &task)
        })
        .await?;
        Ok(ActionOutcome::TaskCreated { task_id })
    }

    async fn forward(
        &self,
        ctx: ActionContext<'_>,
        email: &ClassifiedEmail,
        to: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let subject = format!("Fwd: {}", email.email.subject);
        let body = forwarded_body(&email.email);
        with_retry(&self.retry, "forward", || {
            self.mail.send(ctx.user_id, to, &subject, &body)
        })
        .await?;
        Ok(ActionOutcome::Forwarded { to: to.to_string() })
    }

    async fn archive(&self, user_id: &str, email: &Email) -> Result<ActionOutcome, ActionError> {
        if email.is_read {
            return Ok(ActionOutcome::Archived { already_read: true });
        }
        with_retry(&self.retry, "archive", || self.mail.mark_read(user_id, &email.id))
        .await?;
        Ok(ActionOutcome::Archived {
            already_read: false,
        })
    }

    // ── Automations ─────────────────────────────────────────────────

    /// Run a scheduled automation, recording what it did into `log`.
    ///
    /// Per-email and per-draft failures are recorded and skipped. An error is
    /// returned only when the automation could not run at all.
    pub async fn execute_automation(
        &self,
        automation: &Automation,
        settings: &UserSettings,
        now: DateTime<Utc>,
        log: &mut LogBuilder,
    ) -> Result<(), ActionError> {
        let user_id = automation.user_id.as_str();
        match &automation.action {
            AutomationAction::WeeklyDigest { send_to } => {
                let classified = self.fetch_and_classify(user_id, settings, log).await?;
                let digest = weekly_digest(&classified, now);
                let subject = format!("Weekly digest: {} unread emails", classified.len());
                self.deliver(user_id, send_to.as_deref(), &subject, digest, "digest_sent", log)
                    .await
            }
            AutomationAction::MonthlyReport { send_to } => {
                let since = now - TimeDelta::days(REPORT_WINDOW_DAYS);
                let logs = self.store.list_agent_logs_since(user_id, since).await?;
                let pending = self
                    .store
                    .list_drafts(user_id, Some(DraftStatus::Pending))
                    .await?
                    .len();
                let report = monthly_report(&logs, pending);
                let subject = format!("Monthly report ({} days)", REPORT_WINDOW_DAYS);
                self.deliver(user_id, send_to.as_deref(), &subject, report, "report_sent", log)
                    .await
            }
            AutomationAction::FollowupCheck { after_days } => {
                self.followup_check(user_id, *after_days, now, log).await
            }
            AutomationAction::Cleanup { categories } => {
                let classified = self.fetch_and_classify(user_id, settings, log).await?;
                for (email, category) in classified {
                    if !category.is_some_and(|c| categories.contains(&c)) {
                        continue;
                    }
                    match self.archive(user_id, &email).await {
                        Ok(outcome) => log.record_action(ActionRecord {
                            email_id: Some(email.id.clone()),
                            rule_id: None,
                            action: "archive".into(),
                            detail: outcome.detail(),
                        }),
                        Err(e) => {
                            warn!(user_id, email_id = %email.id, "Cleanup archive failed: {e}");
                            log.record_error(ErrorRecord {
                                action: Some("archive".into()),
                                ..ErrorRecord::for_email(&email.id, e.to_string())
                            });
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Fetch a batch and classify each email; failures leave it uncategorised.
    async fn fetch_and_classify(
        &self,
        user_id: &str,
        settings: &UserSettings,
        log: &mut LogBuilder,
    ) -> Result<Vec<(Email, Option<Category>)>, ActionError> {
        let emails = self.fetch_unread(user_id, self.batch_size).await?;
        let mut out = Vec::with_capacity(emails.len());
        for mut email in emails {
            let category = match self.classify(&email).await {
                Ok(c) => {
                    email.priority = Some(c.priority);
                    email.category = Some(c.category);
                    email.is_vip = email.is_vip || settings.is_vip(&email.sender);
                    Some(c.category)
                }
                Err(e) => {
                    log.record_error(ErrorRecord {
                        action: Some("classify".into()),
                        ..ErrorRecord::for_email(&email.id, e.to_string())
                    });
                    None
                }
            };
            log.record_processed(category);
            out.push((email, category));
        }
        Ok(out)
    }

    /// Email a summary to `send_to`, or record it in the log when unset.
    async fn deliver(
        &self,
        user_id: &str,
        send_to: Option<&str>,
        subject: &str,
        body: String,
        action: &str,
        log: &mut LogBuilder,
    ) -> Result<(), ActionError> {
        match send_to {
            Some(to) => {
                with_retry(&self.retry, action, || self.mail.send(user_id, to, subject, &body))
                    .await?;
                log.record_action(ActionRecord {
                    email_id: None,
                    rule_id: None,
                    action: action.to_string(),
                    detail: format!("sent to {to}"),
                });
            }
            None => log.record_action(ActionRecord {
                email_id: None,
                rule_id: None,
                action: "notify".into(),
                detail: body,
            }),
        }
        Ok(())
    }

    async fn followup_check(
        &self,
        user_id: &str,
        after_days: u32,
        now: DateTime<Utc>,
        log: &mut LogBuilder,
    ) -> Result<(), ActionError> {
        let Some(cutoff) = now.checked_sub_signed(TimeDelta::days(i64::from(after_days))) else {
            warn!(user_id, after_days, "Follow-up window out of range");
            log.record_error(ErrorRecord {
                action: Some("followup_check".into()),
                ..ErrorRecord::new(format!("after_days {after_days} is out of range"))
            });
            return Ok(());
        };
        let stale: Vec<Draft> = self
            .store
            .list_drafts(user_id, Some(DraftStatus::Pending))
            .await?
            .into_iter()
            .filter(|d| d.created_at <= cutoff)
            .collect();
        debug!(user_id, stale = stale.len(), "Follow-up check");

        for draft in stale {
            let task = TaskRecord {
                title: format!("Follow up: {} ({})", draft.subject, draft.recipient),
                notes: format!(
                    "Draft reply pending since {}.\n\n{}",
                    draft.created_at.format("%Y-%m-%d"),
                    truncate(&draft.body, 500)
                ),
                due: now.date_naive(),
                source_email_id: Some(draft.source_email_id.clone()),
            };
            match with_retry(&self.retry, "create_task", || {
                self.tasks.create_task(user_id, &task)
            })
            .await
            {
                Ok(task_id) => log.record_action(ActionRecord {
                    email_id: Some(draft.source_email_id.clone()),
                    rule_id: None,
                    action: "create_task".into(),
                    detail: format!("task {task_id} for draft {}", draft.id),
                }),
                Err(e) => {
                    warn!(user_id, draft_id = %draft.id, "Follow-up task failed: {e}");
                    log.record_error(ErrorRecord {
                        action: Some("create_task".into()),
                        ..ErrorRecord::for_email(&draft.source_email_id, e.to_string())
                    });
                }
            }
        }
        Ok(())
    }

    /// Start a log for a firing of `automation`.
    pub fn automation_log(automation: &Automation, started_at: DateTime<Utc>) -> LogBuilder {
        LogBuilder::new(
            &automation.user_id,
            LogKind::Automation {
                automation_id: automation.id,
                action: automation.action.type_tag().to_string(),
            },
            started_at,
        )
    }
}

// ── Formatting ──────────────────────────────────────────────────────

/// `[PRIORITY] Action: <subject> (from <sender>)`.
fn default_task_title(email: &ClassifiedEmail) -> String {
    format!(
        "[{}] Action: {} (from {})",
        email.priority.to_string().to_uppercase(),
        truncate(&email.email.subject, TASK_SUBJECT_MAX),
        email.email.sender_display()
    )
}

fn task_notes(email: &ClassifiedEmail) -> String {
    let mut notes = String::new();
    if !email.summary.is_empty() {
        let _ = writeln!(notes, "{}\n", email.summary);
    }
    let _ = write!(
        notes,
        "From: {}\nReceived: {}\nEmail id: {}",
        email.email.sender,
        email.email.received_at.format("%Y-%m-%d %H:%M UTC"),
        email.email.id
    );
    notes
}

fn due_date(now: DateTime<Utc>, priority: Priority) -> chrono::NaiveDate {
    let today = now.date_naive();
    today
        .checked_add_days(Days::new(priority.due_offset_days()))
        .unwrap_or(today)
}

fn forwarded_body(email: &Email) -> String {
    let from = match email.sender_name.as_deref() {
        Some(name) if !name.trim().is_empty() => format!("{name} <{}>", email.sender),
        _ => email.sender.clone(),
    };
    format!(
        "---------- Forwarded message ----------\nFrom: {from}\nDate: {}\nSubject: {}\n\n{}",
        email.received_at.to_rfc2822(),
        email.subject,
        email.body
    )
}

fn weekly_digest(emails: &[(Email, Option<Category>)], now: DateTime<Utc>) -> String {
    let mut out = format!("Weekly digest for {}\n", now.format("%Y-%m-%d"));
    if emails.is_empty() {
        out.push_str("\nInbox zero. Nothing unread.");
        return out;
    }

    let mut groups: BTreeMap<Option<Priority>, Vec<&Email>> = BTreeMap::new();
    for (email, category) in emails {
        let priority = category.and(email.priority);
        groups.entry(priority).or_default().push(email);
    }
    // Classified groups first, most urgent first.
    let ordered = groups
        .iter()
        .filter(|(p, _)| p.is_some())
        .chain(groups.iter().filter(|(p, _)| p.is_none()));
    for (priority, group) in ordered {
        let heading = priority.map_or_else(|| "unclassified".to_string(), |p| p.to_string());
        let _ = write!(out, "\n{} ({})", heading.to_uppercase(), group.len());
        for email in group {
            let _ = write!(
                out,
                "\n  - {}: {}",
                email.sender_display(),
                truncate(&email.subject, TASK_SUBJECT_MAX)
            );
        }
    }
    out
}

fn monthly_report(logs: &[AgentLog], pending_drafts: usize) -> String {
    let cycles = logs.iter().filter(|l| l.kind == LogKind::Cycle).count();
    let firings = logs.len() - cycles;
    let processed: u64 = logs.iter().map(|l| u64::from(l.processed_count)).sum();
    let errors: usize = logs.iter().map(|l| l.errors.len()).sum();
    let mut by_action: BTreeMap<&str, usize> = BTreeMap::new();
    for record in logs.iter().flat_map(|l| &l.actions) {
        *by_action.entry(record.action.as_str()).or_default() += 1;
    }

    let mut out = format!(
        "Last {REPORT_WINDOW_DAYS} days:\n  Cycles: {cycles}\n  Automation runs: {firings}\n  Emails processed: {processed}\n  Errors: {errors}\n  Pending drafts: {pending_drafts}"
    );
    if !by_action.is_empty() {
        out.push_str("\nActions:");
        for (action, count) in by_action {
            let _ = write!(out, "\n  {action}: {count}");
        }
    }
    out
}
