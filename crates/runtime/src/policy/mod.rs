//! Governance policies and per-table data-operation rules.

pub mod enforcer;
pub mod rules;

pub use enforcer::{ContextEvaluation, PolicyDecision, PolicyEnforcer};
pub use rules::{Condition, RuleDecision, RuleEngine, RuleOptions};
