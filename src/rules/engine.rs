//! Rule engine: decides which of a user's rules fire for one email.
//!
//! Pure and synchronous. Every enabled rule is evaluated independently, so
//! several rules may fire for the same email; there is no first-match-wins.

use tracing::debug;

use crate::mail::types::ClassifiedEmail;
use crate::rules::model::{Rule, RuleAction, Trigger};

/// A rule whose trigger matched, paired with the action to run.
#[derive(Debug, Clone, Copy)]
pub struct TriggeredAction<'a> {
    pub rule: &'a Rule,
    pub action: &'a RuleAction,
}

pub struct RuleEngine;

impl RuleEngine {
    /// Matching rules in ascending id order. Disabled rules are ignored.
    pub fn evaluate<'a>(email: &ClassifiedEmail, rules: &'a [Rule]) -> Vec<TriggeredAction<'a>> {
        let mut triggered: Vec<TriggeredAction<'a>> = rules
            .iter()
            .filter(|rule| rule.enabled && Self::matches(&rule.trigger, email))
            .map(|rule| TriggeredAction {
                rule,
                action: &rule.action,
            })
            .collect();
        triggered.sort_by_key(|t| t.rule.id);

        debug!(
            email_id = %email.email.id,
            evaluated = rules.len(),
            matched = triggered.len(),
            "Rules evaluated"
        );
        triggered
    }

    /// Whether a single trigger matches a classified email.
    pub fn matches(trigger: &Trigger, email: &ClassifiedEmail) -> bool {
        match trigger {
            Trigger::EmailReceived { from, contains } => {
                if from.is_none() && contains.is_none() {
                    return true;
                }
                let from_matches = from
                    .as_deref()
                    .is_some_and(|f| f.trim().eq_ignore_ascii_case(email.email.sender.trim()));
                let text_matches = contains.as_deref().is_some_and(|c| email.mentions(c));
                from_matches || text_matches
            }
            Trigger::PriorityHigh => email.priority.is_high(),
            Trigger::VipSender => email.is_vip,
            Trigger::KeywordMatch { keywords } => keywords.iter().any(|k| email.mentions(k)),
        }
    }
}
