//! Policy Layer - User-authored behavioral rules
//!
//! Free-text rules are compiled into typed [`Rule`]s ([`compiler`]),
//! scoped into [`PolicySet`]s by a [`PolicyStore`] ([`store`]) and checked
//! against handler output by the [`PolicyValidator`] ([`validator`]).
//!
//! Categorization and predicates are keyword heuristics. They are
//! incomplete by construction: a rule the heuristics do not understand is
//! treated as satisfied, never as an error.

pub mod compiler;
pub mod store;
pub mod validator;

pub use compiler::{CompiledRules, PolicyCompiler, RuleParseWarning};
pub use store::{CachingPolicyStore, InMemoryPolicyStore, PolicyDocument, PolicyStore};
pub use validator::{ComplianceVerdict, PolicyValidator};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category a rule is assigned at compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Security,
    Quality,
    Architecture,
    Performance,
    Custom,
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleCategory::Security => "security",
            RuleCategory::Quality => "quality",
            RuleCategory::Architecture => "architecture",
            RuleCategory::Performance => "performance",
            RuleCategory::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Rule priority; evaluation runs from `High` down to `Low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePriority {
    /// Whole-text fallback rule only
    Low,
    Medium,
    /// Rule carries an explicit rationale
    High,
}

impl fmt::Display for RulePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RulePriority::Low => "low",
            RulePriority::Medium => "medium",
            RulePriority::High => "high",
        };
        f.write_str(name)
    }
}

/// A single compiled rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    /// Trimmed rule text without bullet markup
    pub raw_text: String,
    pub category: RuleCategory,
    pub priority: RulePriority,
    /// Position in registration order within its set
    pub ordinal: usize,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {}",
            self.category, self.priority, self.raw_text
        )
    }
}

/// Scope a policy document applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "project_id", rename_all = "snake_case")]
pub enum PolicyScope {
    /// Applies to every project of the subject
    Global,
    /// Applies to one project; takes precedence over global rules
    Project(String),
}

impl PolicyScope {
    pub fn from_project(project_id: Option<&str>) -> Self {
        match project_id {
            Some(id) => PolicyScope::Project(id.to_string()),
            None => PolicyScope::Global,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            PolicyScope::Global => None,
            PolicyScope::Project(id) => Some(id.as_str()),
        }
    }
}

/// Ordered, versioned collection of rules for a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    pub subject_id: String,
    pub project_id: Option<String>,
    pub version: u64,
    pub active: bool,
    pub rules: Vec<Rule>,
    /// BLAKE3 digest of the source text(s)
    pub source_digest: String,
}

impl PolicySet {
    /// A set with no rules; every result is compliant against it
    pub fn empty(subject_id: impl Into<String>, project_id: Option<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            project_id,
            version: 0,
            active: true,
            rules: Vec::new(),
            source_digest: crate::types::digest_bytes(b""),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in evaluation order: descending priority, then ordinal
    pub fn evaluation_order(&self) -> Vec<&Rule> {
        let mut ordered: Vec<&Rule> = self.rules.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.ordinal.cmp(&b.ordinal)));
        ordered
    }
}
