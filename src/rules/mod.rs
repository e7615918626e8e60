//! User-defined triage rules and the engine that evaluates them.

pub mod engine;
pub mod model;

pub use engine::{RuleEngine, TriggeredAction};
pub use model::{MalformedRule, Rule, RuleAction, RuleInput, RuleSet, Trigger};
