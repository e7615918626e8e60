//! Draft safety review.
//!
//! Scans a generated reply for language the user probably did not authorize:
//! financial or legal commitments, irreversible actions, and leaked
//! sensitive data. The review never blocks drafting; it assigns a severity
//! and the reasons, and the approval workflow decides what to do with them.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use tracing::debug;

use crate::drafts::Severity;

/// Number of distinct risk categories that forces `Severity::High`.
const ESCALATION_CATEGORIES: usize = 3;

/// Kinds of risk the reviewer looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskCategory {
    FinancialCommitment,
    LegalCommitment,
    IrreversibleAction,
    SensitiveData,
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskCategory::FinancialCommitment => write!(f, "financial commitment"),
            RiskCategory::LegalCommitment => write!(f, "legal commitment"),
            RiskCategory::IrreversibleAction => write!(f, "irreversible action"),
            RiskCategory::SensitiveData => write!(f, "sensitive data"),
        }
    }
}

/// A single risk pattern with a compiled regex.
#[derive(Debug, Clone)]
pub struct RiskPattern {
    pub category: RiskCategory,
    pub regex: Regex,
    pub severity: Severity,
    /// Why this pattern is risky.
    pub reason: String,
}

/// Outcome of reviewing one draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyReview {
    pub severity: Severity,
    /// One entry per matched reason: "<category>: <reason>".
    pub flags: Vec<String>,
}

impl SafetyReview {
    pub fn is_clean(&self) -> bool {
        self.severity == Severity::None
    }
}

/// Pattern-based reviewer for generated drafts.
pub struct DraftSafetyReviewer {
    patterns: Vec<RiskPattern>,
}

impl DraftSafetyReviewer {
    /// Create a reviewer with the default risk patterns.
    pub fn new() -> Self {
        let table: &[(RiskCategory, &str, Severity, &str)] = &[
            (
                RiskCategory::FinancialCommitment,
                r"(?i)\b(i|we)('ll| will| can| shall| would be happy to)\s+(pay|transfer|wire|refund|reimburse|cover)\b",
                Severity::High,
                "promises a payment",
            ),
            (
                RiskCategory::FinancialCommitment,
                r"(?i)\b(wire|bank) transfer\b",
                Severity::Medium,
                "mentions a bank transfer",
            ),
            (
                RiskCategory::FinancialCommitment,
                r"(?i)([$€£]\s?\d[\d,]*(\.\d+)?|\b\d[\d,]*(\.\d+)?\s?(usd|eur|gbp|dollars)\b)",
                Severity::Low,
                "mentions a monetary amount",
            ),
            (
                RiskCategory::LegalCommitment,
                r"(?i)\b(legally binding|binding agreement|hereby agree|sign(ed)? the (contract|agreement))\b",
                Severity::High,
                "contract language",
            ),
            (
                RiskCategory::LegalCommitment,
                r"(?i)\b(i|we) (agree|accept|consent) to\b",
                Severity::Medium,
                "accepts terms on the user's behalf",
            ),
            (
                RiskCategory::LegalCommitment,
                r"(?i)\b(waive|indemnif(y|ication)|liabilit(y|ies)|terms and conditions)\b",
                Severity::Medium,
                "liability or waiver language",
            ),
            (
                RiskCategory::IrreversibleAction,
                r"(?i)\b(permanently|irrevocabl[ey]|cannot be undone|non-refundable)\b",
                Severity::High,
                "irreversible wording",
            ),
            (
                RiskCategory::IrreversibleAction,
                r"(?i)\b(delete|cancel|terminate|close)\s+(the |your |my |our )?(account|subscription|contract|order|repository|database)s?\b",
                Severity::Medium,
                "cancels or deletes something",
            ),
            (
                RiskCategory::SensitiveData,
                r"(?i)\b(password|passcode|pin)\s*(is|:)",
                Severity::High,
                "shares a credential",
            ),
            (
                RiskCategory::SensitiveData,
                r"\b\d{3}-\d{2}-\d{4}\b",
                Severity::High,
                "looks like a social security number",
            ),
            (
                RiskCategory::SensitiveData,
                r"\b(?:\d[ -]?){13,16}\b",
                Severity::High,
                "looks like a card number",
            ),
            (
                RiskCategory::SensitiveData,
                r"(?i)\b(api[ _-]?key|secret[ _-]?key|access token|routing number|account number)\b",
                Severity::Medium,
                "mentions a secret or account identifier",
            ),
        ];

        let patterns = table
            .iter()
            .map(|(category, pattern, severity, reason)| RiskPattern {
                category: *category,
                regex: Regex::new(pattern).expect("static risk pattern"),
                severity: *severity,
                reason: (*reason).to_string(),
            })
            .collect();

        Self { patterns }
    }

    /// Create a reviewer with no patterns; every draft comes back clean.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Add a custom pattern.
    pub fn add_pattern(
        &mut self,
        category: RiskCategory,
        pattern: &str,
        severity: Severity,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.patterns.push(RiskPattern {
            category,
            regex: Regex::new(pattern)?,
            severity,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Review a draft body.
    pub fn review(&self, body: &str) -> SafetyReview {
        let mut severity = Severity::None;
        let mut categories = BTreeSet::new();
        let mut flags: Vec<String> = Vec::new();

        for pattern in &self.patterns {
            if !pattern.regex.is_match(body) {
                continue;
            }
            severity = severity.max(pattern.severity);
            categories.insert(pattern.category);
            let flag = format!("{}: {}", pattern.category, pattern.reason);
            if !flags.contains(&flag) {
                flags.push(flag);
            }
        }

        if categories.len() >= ESCALATION_CATEGORIES {
            severity = Severity::High;
        }

        debug!(severity = %severity, flags = flags.len(), "Draft reviewed");
        SafetyReview { severity, flags }
    }
}

impl Default for DraftSafetyReviewer {
    fn default() -> Self {
        Self::new()
    }
}
