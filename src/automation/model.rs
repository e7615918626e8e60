//! Core types for recurring automations.
//!
//! An automation is a user-owned job on a daily, weekly, or monthly
//! schedule in the user's timezone. Its next fire instant is persisted and
//! recomputed after every firing, so a restart never loses or repeats an
//! occurrence.

use chrono::{
    DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::mail::types::Category;

/// Days searched for the next occurrence; covers any monthly schedule.
const LOOKAHEAD_DAYS: u64 = 400;

/// A persisted automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub schedule: Schedule,
    /// IANA timezone name the schedule is expressed in.
    pub timezone: String,
    pub action: AutomationAction,
    pub enabled: bool,

    // Runtime state (scheduler-managed)
    pub last_fired: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub next_fire_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User-supplied fields for a new automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationInput {
    pub name: String,
    pub schedule: Schedule,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub action: AutomationAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Automation {
    /// Validate input and compute the first fire instant after `now`.
    pub fn new(
        user_id: &str,
        input: AutomationInput,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if input.name.trim().is_empty() {
            return Err(ValidationError::Automation("name must not be empty".into()));
        }
        input.schedule.validate()?;
        input.action.validate()?;
        let tz = parse_timezone(&input.timezone)?;
        let next_fire_at = next_occurrence(&input.schedule, tz, now);

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: input.name.trim().to_string(),
            schedule: input.schedule,
            timezone: input.timezone,
            action: input.action,
            enabled: input.enabled,
            last_fired: None,
            run_count: 0,
            next_fire_at,
            created_at: now,
            updated_at: now,
        })
    }

    /// Next occurrence strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ValidationError> {
        let tz = parse_timezone(&self.timezone)?;
        Ok(next_occurrence(&self.schedule, tz, after))
    }
}

/// When an automation fires, in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Daily {
        hour: u32,
        minute: u32,
    },
    /// `day_of_week` follows cron: 0 and 7 are Sunday, 1 is Monday.
    Weekly {
        day_of_week: u32,
        hour: u32,
        minute: u32,
    },
    /// Days past the end of a short month fire on its last day.
    Monthly {
        day_of_month: u32,
        hour: u32,
        minute: u32,
    },
}

impl Schedule {
    /// The string tag stored in the DB schedule_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Schedule::Daily { .. } => "daily",
            Schedule::Weekly { .. } => "weekly",
            Schedule::Monthly { .. } => "monthly",
        }
    }

    /// Rebuild from the DB columns.
    pub fn from_db(
        schedule_type: &str,
        day_of_week: Option<u32>,
        day_of_month: Option<u32>,
        hour: u32,
        minute: u32,
    ) -> Result<Self, String> {
        match schedule_type {
            "daily" => Ok(Schedule::Daily { hour, minute }),
            "weekly" => Ok(Schedule::Weekly {
                day_of_week: day_of_week.ok_or("weekly schedule missing day_of_week")?,
                hour,
                minute,
            }),
            "monthly" => Ok(Schedule::Monthly {
                day_of_month: day_of_month.ok_or("monthly schedule missing day_of_month")?,
                hour,
                minute,
            }),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }

    pub fn time_of_day(&self) -> (u32, u32) {
        match *self {
            Schedule::Daily { hour, minute }
            | Schedule::Weekly { hour, minute, .. }
            | Schedule::Monthly { hour, minute, .. } => (hour, minute),
        }
    }

    pub fn day_of_week(&self) -> Option<u32> {
        match *self {
            Schedule::Weekly { day_of_week, .. } => Some(day_of_week),
            _ => None,
        }
    }

    pub fn day_of_month(&self) -> Option<u32> {
        match *self {
            Schedule::Monthly { day_of_month, .. } => Some(day_of_month),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let (hour, minute) = self.time_of_day();
        if hour > 23 {
            return Err(ValidationError::Schedule(format!("hour {hour} is out of range 0-23")));
        }
        if minute > 59 {
            return Err(ValidationError::Schedule(format!(
                "minute {minute} is out of range 0-59"
            )));
        }
        match *self {
            Schedule::Weekly { day_of_week, .. } if day_of_week > 7 => Err(
                ValidationError::Schedule(format!("day_of_week {day_of_week} is out of range 0-7")),
            ),
            Schedule::Monthly { day_of_month, .. } if !(1..=31).contains(&day_of_month) => {
                Err(ValidationError::Schedule(format!(
                    "day_of_month {day_of_month} is out of range 1-31"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Whether the schedule has an occurrence on this local date.
    fn runs_on(&self, date: NaiveDate) -> bool {
        match *self {
            Schedule::Daily { .. } => true,
            Schedule::Weekly { day_of_week, .. } => {
                date.weekday().num_days_from_sunday() == day_of_week % 7
            }
            Schedule::Monthly { day_of_month, .. } => {
                date.day() == day_of_month.min(days_in_month(date))
            }
        }
    }
}

/// What an automation does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationAction {
    /// Summarize unread mail; email it to `send_to` or record it in the log.
    WeeklyDigest {
        #[serde(default)]
        send_to: Option<String>,
    },
    /// Summarize the last 30 days of agent activity.
    MonthlyReport {
        #[serde(default)]
        send_to: Option<String>,
    },
    /// Create tasks for drafts left pending longer than `after_days`.
    FollowupCheck {
        #[serde(default = "default_followup_days")]
        after_days: u32,
    },
    /// Archive unread mail in the given categories.
    Cleanup {
        #[serde(default = "default_cleanup_categories")]
        categories: Vec<Category>,
    },
}

fn default_followup_days() -> u32 {
    3
}

/// Longest follow-up window accepted, in days.
pub const MAX_FOLLOWUP_DAYS: u32 = 3650;

fn default_cleanup_categories() -> Vec<Category> {
    vec![Category::Newsletter, Category::Promotional, Category::Spam]
}

impl AutomationAction {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            AutomationAction::FollowupCheck { after_days }
                if !(1..=MAX_FOLLOWUP_DAYS).contains(&after_days) =>
            {
                Err(ValidationError::Automation(format!(
                    "after_days {after_days} is out of range 1-{MAX_FOLLOWUP_DAYS}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// The string tag stored in the DB action_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            AutomationAction::WeeklyDigest { .. } => "weekly_digest",
            AutomationAction::MonthlyReport { .. } => "monthly_report",
            AutomationAction::FollowupCheck { .. } => "followup_check",
            AutomationAction::Cleanup { .. } => "cleanup",
        }
    }

    /// Parse an action from its DB representation.
    pub fn from_db(action_type: &str, config: serde_json::Value) -> Result<Self, String> {
        let send_to = || {
            config
                .get("send_to")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        match action_type {
            "weekly_digest" => Ok(AutomationAction::WeeklyDigest { send_to: send_to() }),
            "monthly_report" => Ok(AutomationAction::MonthlyReport { send_to: send_to() }),
            "followup_check" => {
                let after_days = match config.get("after_days").and_then(|v| v.as_u64()) {
                    Some(days) => u32::try_from(days)
                        .map_err(|_| format!("after_days {days} is out of range"))?,
                    None => default_followup_days(),
                };
                Ok(AutomationAction::FollowupCheck { after_days })
            }
            "cleanup" => {
                let categories = match config.get("categories").and_then(|v| v.as_array()) {
                    Some(arr) => arr
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.parse::<Category>())
                        .collect::<Result<Vec<_>, _>>()?,
                    None => default_cleanup_categories(),
                };
                Ok(AutomationAction::Cleanup { categories })
            }
            other => Err(format!("unknown automation action: {other}")),
        }
    }

    /// Serialize action config to JSON for DB storage.
    pub fn to_config_json(&self) -> serde_json::Value {
        match self {
            AutomationAction::WeeklyDigest { send_to }
            | AutomationAction::MonthlyReport { send_to } => {
                serde_json::json!({ "send_to": send_to })
            }
            AutomationAction::FollowupCheck { after_days } => {
                serde_json::json!({ "after_days": after_days })
            }
            AutomationAction::Cleanup { categories } => serde_json::json!({
                "categories": categories.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            }),
        }
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ValidationError::Timezone(name.to_string()))
}

/// Compute the first occurrence of `schedule` in `tz` strictly after `after`.
///
/// Local times that fall into a DST gap are shifted forward one hour;
/// ambiguous local times resolve to the earlier instant.
pub fn next_occurrence(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (hour, minute) = schedule.time_of_day();
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let start = after.with_timezone(&tz).date_naive();

    for offset in 0..=LOOKAHEAD_DAYS {
        let date = start.checked_add_days(Days::new(offset))?;
        if !schedule.runs_on(date) {
            continue;
        }
        if let Some(candidate) = resolve_local(tz, date.and_time(time))
            && candidate > after
        {
            return Some(candidate);
        }
    }
    None
}

fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + TimeDelta::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |last| last.day())
}
