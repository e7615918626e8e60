//! libSQL backend: async `Database` trait implementation.
//!
//! All statements run on one connection behind an async mutex, so a
//! multi-statement transaction is never interleaved with another caller's
//! writes. Supports local file and in-memory databases.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::log::{AgentLog, LogKind};
use crate::automation::model::{Automation, AutomationAction, Schedule};
use crate::drafts::{Draft, DraftStatus};
use crate::error::DatabaseError;
use crate::mail::types::Category;
use crate::rules::{MalformedRule, Rule, RuleAction, RuleInput, RuleSet, Trigger};
use crate::store::migrations;
use crate::store::traits::{Database, DraftTransition};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Run raw SQL against the connection, bypassing row validation.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(sql, ()).await.map_err(query_err("execute_raw"))
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

// ── Row mapping ─────────────────────────────────────────────────────

const RULE_COLUMNS: &str = "id, user_id, name, trigger_type, trigger_config, action_type, action_config, enabled, trigger_count, warning, created_at, updated_at";

const AUTOMATION_COLUMNS: &str = "id, user_id, name, schedule_type, day_of_week, day_of_month, hour, minute, timezone, action_type, action_config, enabled, last_fired, run_count, next_fire_at, created_at, updated_at";

const DRAFT_COLUMNS: &str = "id, user_id, source_email_id, recipient, subject, body, status, instructions, tone, severity, safety_flags, source_category, created_at, updated_at";

const LOG_COLUMNS: &str = "id, user_id, kind, automation_id, automation_action, started_at, finished_at, processed_count, actions, errors, summary";

fn parse_config(raw: Option<String>, column: &str) -> Result<serde_json::Value, String> {
    match raw {
        Some(s) if !s.trim().is_empty() => {
            serde_json::from_str(&s).map_err(|e| format!("invalid {column} JSON: {e}"))
        }
        _ => Ok(serde_json::json!({})),
    }
}

/// Column order matches RULE_COLUMNS. A row whose trigger or action
/// cannot be parsed comes back as `MalformedRule`.
fn row_to_rule(row: &libsql::Row) -> Result<Rule, MalformedRule> {
    let id: i64 = row.get(0).unwrap_or_default();
    let malformed = move |reason: String| MalformedRule { id, reason };

    let trigger_type: String = row.get(3).unwrap_or_default();
    let trigger_config = parse_config(row.get::<String>(4).ok(), "trigger_config").map_err(malformed)?;
    let action_type: String = row.get(5).unwrap_or_default();
    let action_config = parse_config(row.get::<String>(6).ok(), "action_config").map_err(malformed)?;

    let trigger = Trigger::from_db(&trigger_type, trigger_config).map_err(malformed)?;
    let action = RuleAction::from_db(&action_type, action_config).map_err(malformed)?;

    let created_str: String = row.get(10).unwrap_or_default();
    let updated_str: String = row.get(11).unwrap_or_default();

    Ok(Rule {
        id,
        user_id: row.get(1).unwrap_or_default(),
        name: row.get(2).unwrap_or_default(),
        trigger,
        action,
        enabled: row.get::<i64>(7).unwrap_or(0) != 0,
        trigger_count: row.get::<i64>(8).unwrap_or(0).max(0) as u64,
        warning: row.get::<String>(9).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn malformed_to_db(m: MalformedRule) -> DatabaseError {
    DatabaseError::Serialization(format!("rule {}: {}", m.id, m.reason))
}

async fn collect_rules(mut rows: libsql::Rows, op: &'static str) -> Result<RuleSet, DatabaseError> {
    let mut set = RuleSet::default();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        match row_to_rule(&row) {
            Ok(rule) => set.rules.push(rule),
            Err(m) => {
                warn!(rule_id = m.id, reason = %m.reason, "Malformed rule row");
                set.malformed.push(m);
            }
        }
    }
    Ok(set)
}

async fn first_rule(mut rows: libsql::Rows, op: &'static str) -> Result<Option<Rule>, DatabaseError> {
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => row_to_rule(&row).map(Some).map_err(malformed_to_db),
        None => Ok(None),
    }
}

fn row_to_automation(row: &libsql::Row) -> Result<Automation, DatabaseError> {
    let id_str: String = row.get(0).unwrap_or_default();
    let id: Uuid = id_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("automation id {id_str}: {e}")))?;

    let schedule_type: String = row.get(3).unwrap_or_default();
    let day_of_week = row.get::<i64>(4).ok().map(|d| d as u32);
    let day_of_month = row.get::<i64>(5).ok().map(|d| d as u32);
    let hour = row.get::<i64>(6).unwrap_or(0) as u32;
    let minute = row.get::<i64>(7).unwrap_or(0) as u32;
    let schedule = Schedule::from_db(&schedule_type, day_of_week, day_of_month, hour, minute)
        .map_err(|e| DatabaseError::Serialization(format!("automation {id}: {e}")))?;

    let action_type: String = row.get(9).unwrap_or_default();
    let action_config = parse_config(row.get::<String>(10).ok(), "action_config")
        .map_err(|e| DatabaseError::Serialization(format!("automation {id}: {e}")))?;
    let action = AutomationAction::from_db(&action_type, action_config)
        .map_err(|e| DatabaseError::Serialization(format!("automation {id}: {e}")))?;

    let created_str: String = row.get(15).unwrap_or_default();
    let updated_str: String = row.get(16).unwrap_or_default();

    Ok(Automation {
        id,
        user_id: row.get(1).unwrap_or_default(),
        name: row.get(2).unwrap_or_default(),
        schedule,
        timezone: row.get(8).unwrap_or_else(|_| "UTC".to_string()),
        action,
        enabled: row.get::<i64>(11).unwrap_or(0) != 0,
        last_fired: parse_optional_datetime(row.get::<String>(12).ok()),
        run_count: row.get::<i64>(13).unwrap_or(0).max(0) as u64,
        next_fire_at: parse_optional_datetime(row.get::<String>(14).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Skip rows that no longer parse so one bad automation cannot block the rest.
async fn collect_automations(
    mut rows: libsql::Rows,
    op: &'static str,
) -> Result<Vec<Automation>, DatabaseError> {
    let mut automations = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        match row_to_automation(&row) {
            Ok(a) => automations.push(a),
            Err(e) => warn!(operation = op, "Skipping unreadable automation: {e}"),
        }
    }
    Ok(automations)
}

fn row_to_draft(row: &libsql::Row) -> Result<Draft, DatabaseError> {
    let id_str: String = row.get(0).unwrap_or_default();
    let id: Uuid = id_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("draft id {id_str}: {e}")))?;
    let status_str: String = row.get(6).unwrap_or_default();
    let status: DraftStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let severity = row
        .get::<String>(9)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    let safety_flags: Vec<String> = row
        .get::<String>(10)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let source_category = row
        .get::<String>(11)
        .ok()
        .and_then(|s| s.parse::<Category>().ok());
    let created_str: String = row.get(12).unwrap_or_default();
    let updated_str: String = row.get(13).unwrap_or_default();

    Ok(Draft {
        id,
        user_id: row.get(1).unwrap_or_default(),
        source_email_id: row.get(2).unwrap_or_default(),
        recipient: row.get(3).unwrap_or_default(),
        subject: row.get(4).unwrap_or_default(),
        body: row.get(5).unwrap_or_default(),
        status,
        instructions: row.get(7).unwrap_or_default(),
        tone: row.get(8).unwrap_or_default(),
        severity,
        safety_flags,
        source_category,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<AgentLog, DatabaseError> {
    let id_str: String = row.get(0).unwrap_or_default();
    let id: Uuid = id_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("log id {id_str}: {e}")))?;

    let kind_str: String = row.get(2).unwrap_or_default();
    let kind = match kind_str.as_str() {
        "automation" => {
            let automation_id = row
                .get::<String>(3)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            LogKind::Automation {
                automation_id,
                action: row.get(4).unwrap_or_default(),
            }
        }
        _ => LogKind::Cycle,
    };

    let started_str: String = row.get(5).unwrap_or_default();
    let finished_str: String = row.get(6).unwrap_or_default();
    let actions = row
        .get::<String>(8)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let errors = row
        .get::<String>(9)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(AgentLog {
        id,
        user_id: row.get(1).unwrap_or_default(),
        kind,
        started_at: parse_datetime(&started_str),
        finished_at: parse_datetime(&finished_str),
        processed_count: row.get::<i64>(7).unwrap_or(0).max(0) as u32,
        actions,
        errors,
        summary: row.get(10).unwrap_or_default(),
    })
}

async fn insert_log(conn: &Connection, log: &AgentLog) -> Result<(), DatabaseError> {
    let (automation_id, automation_action) = match &log.kind {
        LogKind::Cycle => (libsql::Value::Null, libsql::Value::Null),
        LogKind::Automation {
            automation_id,
            action,
        } => (
            libsql::Value::Text(automation_id.to_string()),
            libsql::Value::Text(action.clone()),
        ),
    };

    conn.execute(
        &format!("INSERT INTO agent_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
        params![
            log.id.to_string(),
            log.user_id.clone(),
            log.kind.type_tag(),
            automation_id,
            automation_action,
            ts(log.started_at),
            ts(log.finished_at),
            log.processed_count as i64,
            to_json(&log.actions)?,
            to_json(&log.errors)?,
            log.summary.clone(),
        ],
    )
    .await
    .map_err(query_err("insert_agent_log"))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, user_id: &str, input: &RuleInput) -> Result<Rule, DatabaseError> {
        let trigger_config = to_json(&input.trigger.to_config_json())?;
        let action_config = to_json(&input.action.to_config_json())?;
        let now = ts(Utc::now());

        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "INSERT INTO rules (user_id, name, trigger_type, trigger_config, action_type, action_config, enabled, trigger_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8) RETURNING {RULE_COLUMNS}"
                ),
                params![
                    user_id,
                    input.name.trim(),
                    input.trigger.type_tag(),
                    trigger_config,
                    input.action.type_tag(),
                    action_config,
                    input.enabled as i64,
                    now,
                ],
            )
            .await
            .map_err(query_err("create_rule"))?;

        first_rule(rows, "create_rule")
            .await?
            .ok_or_else(|| DatabaseError::Query("create_rule: no row returned".into()))
    }

    async fn get_rule(&self, user_id: &str, id: i64) -> Result<Option<Rule>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1 AND user_id = ?2"),
                params![id, user_id],
            )
            .await
            .map_err(query_err("get_rule"))?;
        first_rule(rows, "get_rule").await
    }

    async fn update_rule(
        &self,
        user_id: &str,
        id: i64,
        input: &RuleInput,
    ) -> Result<Option<Rule>, DatabaseError> {
        let trigger_config = to_json(&input.trigger.to_config_json())?;
        let action_config = to_json(&input.action.to_config_json())?;
        let now = ts(Utc::now());

        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "UPDATE rules SET name = ?1, trigger_type = ?2, trigger_config = ?3, action_type = ?4, action_config = ?5, enabled = ?6, warning = NULL, updated_at = ?7 \
                     WHERE id = ?8 AND user_id = ?9 RETURNING {RULE_COLUMNS}"
                ),
                params![
                    input.name.trim(),
                    input.trigger.type_tag(),
                    trigger_config,
                    input.action.type_tag(),
                    action_config,
                    input.enabled as i64,
                    now,
                    id,
                    user_id,
                ],
            )
            .await
            .map_err(query_err("update_rule"))?;
        first_rule(rows, "update_rule").await
    }

    async fn delete_rule(&self, user_id: &str, id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let count = conn
            .execute(
                "DELETE FROM rules WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .await
            .map_err(query_err("delete_rule"))?;
        Ok(count > 0)
    }

    async fn set_rule_enabled(
        &self,
        user_id: &str,
        id: i64,
        enabled: bool,
    ) -> Result<Option<Rule>, DatabaseError> {
        let now = ts(Utc::now());
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "UPDATE rules SET enabled = ?1, warning = CASE WHEN ?1 = 1 THEN NULL ELSE warning END, updated_at = ?2 \
                     WHERE id = ?3 AND user_id = ?4 RETURNING {RULE_COLUMNS}"
                ),
                params![enabled as i64, now, id, user_id],
            )
            .await
            .map_err(query_err("set_rule_enabled"))?;
        first_rule(rows, "set_rule_enabled").await
    }

    async fn list_rules(&self, user_id: &str) -> Result<RuleSet, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE user_id = ?1 ORDER BY id"),
                params![user_id],
            )
            .await
            .map_err(query_err("list_rules"))?;
        collect_rules(rows, "list_rules").await
    }

    async fn load_enabled_rules(&self, user_id: &str) -> Result<RuleSet, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE user_id = ?1 AND enabled = 1 ORDER BY id"
                ),
                params![user_id],
            )
            .await
            .map_err(query_err("load_enabled_rules"))?;
        collect_rules(rows, "load_enabled_rules").await
    }

    async fn increment_rule_trigger_count(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE rules SET trigger_count = trigger_count + 1 WHERE id = ?1",
            params![id],
        )
        .await
        .map_err(query_err("increment_rule_trigger_count"))?;
        Ok(())
    }

    async fn flag_malformed_rule(&self, id: i64, reason: &str) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE rules SET enabled = 0, warning = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, now, id],
        )
        .await
        .map_err(query_err("flag_malformed_rule"))?;
        Ok(())
    }

    // ── Automations ─────────────────────────────────────────────────

    async fn create_automation(&self, automation: &Automation) -> Result<(), DatabaseError> {
        let action_config = to_json(&automation.action.to_config_json())?;
        let (hour, minute) = automation.schedule.time_of_day();
        let day_of_week = match automation.schedule.day_of_week() {
            Some(d) => libsql::Value::Integer(d as i64),
            None => libsql::Value::Null,
        };
        let day_of_month = match automation.schedule.day_of_month() {
            Some(d) => libsql::Value::Integer(d as i64),
            None => libsql::Value::Null,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO automations ({AUTOMATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                automation.id.to_string(),
                automation.user_id.clone(),
                automation.name.clone(),
                automation.schedule.type_tag(),
                day_of_week,
                day_of_month,
                hour as i64,
                minute as i64,
                automation.timezone.clone(),
                automation.action.type_tag(),
                action_config,
                automation.enabled as i64,
                opt_ts(automation.last_fired),
                automation.run_count as i64,
                opt_ts(automation.next_fire_at),
                ts(automation.created_at),
                ts(automation.updated_at),
            ],
        )
        .await
        .map_err(query_err("create_automation"))?;
        Ok(())
    }

    async fn get_automation(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<Automation>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations WHERE id = ?1 AND user_id = ?2"
                ),
                params![id.to_string(), user_id],
            )
            .await
            .map_err(query_err("get_automation"))?;

        match rows.next().await.map_err(query_err("get_automation"))? {
            Some(row) => Ok(Some(row_to_automation(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_automation(&self, user_id: &str, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let count = conn
            .execute(
                "DELETE FROM automations WHERE id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id],
            )
            .await
            .map_err(query_err("delete_automation"))?;
        Ok(count > 0)
    }

    async fn list_automations(&self, user_id: &str) -> Result<Vec<Automation>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations WHERE user_id = ?1 ORDER BY created_at, name"
                ),
                params![user_id],
            )
            .await
            .map_err(query_err("list_automations"))?;
        collect_automations(rows, "list_automations").await
    }

    async fn list_due_automations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Automation>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations \
                     WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1 \
                     ORDER BY next_fire_at"
                ),
                params![ts(now)],
            )
            .await
            .map_err(query_err("list_due_automations"))?;
        collect_automations(rows, "list_due_automations").await
    }

    async fn record_automation_fire(
        &self,
        id: Uuid,
        expected_run_count: u64,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        log: &AgentLog,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("record_automation_fire"))?;

        let result: Result<bool, DatabaseError> = async {
            let updated = tx
                .execute(
                    "UPDATE automations SET last_fired = ?1, run_count = run_count + 1, next_fire_at = ?2, updated_at = ?1 \
                     WHERE id = ?3 AND run_count = ?4",
                    params![
                        ts(fired_at),
                        opt_ts(next_fire_at),
                        id.to_string(),
                        expected_run_count as i64,
                    ],
                )
                .await
                .map_err(query_err("record_automation_fire"))?;
            if updated == 0 {
                return Ok(false);
            }
            insert_log(&tx, log).await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => {
                tx.commit()
                    .await
                    .map_err(query_err("record_automation_fire"))?;
                Ok(true)
            }
            other => {
                let _ = tx.rollback().await;
                other
            }
        }
    }

    // ── Drafts ──────────────────────────────────────────────────────

    async fn insert_draft(&self, draft: &Draft) -> Result<(), DatabaseError> {
        let flags = to_json(&draft.safety_flags)?;
        let category = draft.source_category.map(|c| c.to_string());

        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO drafts ({DRAFT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                draft.id.to_string(),
                draft.user_id.clone(),
                draft.source_email_id.clone(),
                draft.recipient.clone(),
                draft.subject.clone(),
                draft.body.clone(),
                draft.status.as_str(),
                draft.instructions.clone(),
                draft.tone.clone(),
                draft.severity.to_string(),
                flags,
                opt_text(category.as_deref()),
                ts(draft.created_at),
                ts(draft.updated_at),
            ],
        )
        .await
        .map_err(query_err("insert_draft"))?;
        Ok(())
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_draft"))?;

        match rows.next().await.map_err(query_err("get_draft"))? {
            Some(row) => Ok(Some(row_to_draft(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_drafts(
        &self,
        user_id: &str,
        status: Option<DraftStatus>,
    ) -> Result<Vec<Draft>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = match status {
            Some(status) => conn
                .query(
                    &format!(
                        "SELECT {DRAFT_COLUMNS} FROM drafts WHERE user_id = ?1 AND status = ?2 ORDER BY created_at DESC"
                    ),
                    params![user_id, status.as_str()],
                )
                .await,
            None => conn
                .query(
                    &format!(
                        "SELECT {DRAFT_COLUMNS} FROM drafts WHERE user_id = ?1 ORDER BY created_at DESC"
                    ),
                    params![user_id],
                )
                .await,
        }
        .map_err(query_err("list_drafts"))?;

        let mut drafts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_drafts"))? {
            drafts.push(row_to_draft(&row)?);
        }
        Ok(drafts)
    }

    async fn transition_draft(
        &self,
        id: Uuid,
        from: DraftStatus,
        to: DraftStatus,
        body: Option<&str>,
    ) -> Result<DraftTransition, DatabaseError> {
        if !from.can_transition_to(to) {
            return Err(DatabaseError::Constraint(format!(
                "draft transition {from} -> {to} is not allowed"
            )));
        }
        let now = ts(Utc::now());

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE drafts SET status = ?1, body = COALESCE(?2, body), updated_at = ?3 \
                     WHERE id = ?4 AND status = ?5 RETURNING {DRAFT_COLUMNS}"
                ),
                params![to.as_str(), opt_text(body), now, id.to_string(), from.as_str()],
            )
            .await
            .map_err(query_err("transition_draft"))?;

        if let Some(row) = rows.next().await.map_err(query_err("transition_draft"))? {
            return Ok(DraftTransition::Applied(row_to_draft(&row)?));
        }
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT status FROM drafts WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("transition_draft"))?;
        match rows.next().await.map_err(query_err("transition_draft"))? {
            Some(row) => {
                let current: String = row.get(0).unwrap_or_default();
                let current = current.parse().map_err(DatabaseError::Serialization)?;
                Ok(DraftTransition::Conflict(current))
            }
            None => Ok(DraftTransition::NotFound),
        }
    }

    // ── Agent state and logs ────────────────────────────────────────

    async fn load_processed_ids(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT email_id FROM processed_emails WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err("load_processed_ids"))?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("load_processed_ids"))? {
            ids.push(row.get::<String>(0).map_err(query_err("load_processed_ids"))?);
        }
        Ok(ids)
    }

    async fn record_cycle(
        &self,
        user_id: &str,
        email_ids: &[String],
        log: &AgentLog,
    ) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("record_cycle"))?;

        let result: Result<(), DatabaseError> = async {
            for email_id in email_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO processed_emails (user_id, email_id, processed_at) VALUES (?1, ?2, ?3)",
                    params![user_id, email_id.as_str(), now.as_str()],
                )
                .await
                .map_err(query_err("record_cycle"))?;
            }
            insert_log(&tx, log).await
        }
        .await;

        match result {
            Ok(()) => tx.commit().await.map_err(query_err("record_cycle")),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn append_agent_log(&self, log: &AgentLog) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        insert_log(&conn, log).await
    }

    async fn list_agent_logs(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentLog>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM agent_logs WHERE user_id = ?1 ORDER BY started_at DESC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(query_err("list_agent_logs"))?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_agent_logs"))? {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }

    async fn list_agent_logs_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AgentLog>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM agent_logs WHERE user_id = ?1 AND started_at >= ?2 ORDER BY started_at ASC"
                ),
                params![user_id, ts(since)],
            )
            .await
            .map_err(query_err("list_agent_logs_since"))?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_agent_logs_since"))? {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT value FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(query_err("get_setting"))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let value_str = to_json(value)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (user_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![user_id, key, value_str, now],
        )
        .await
        .map_err(query_err("set_setting"))?;

        Ok(())
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn list_agent_users(&self) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT user_id FROM rules UNION SELECT user_id FROM automations \
                 UNION SELECT user_id FROM settings ORDER BY 1",
                (),
            )
            .await
            .map_err(query_err("list_agent_users"))?;

        let mut users = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_agent_users"))? {
            users.push(row.get::<String>(0).map_err(query_err("list_agent_users"))?);
        }
        Ok(users)
    }
}
