//! Policy Validator - compliance of handler output against a policy set
//!
//! Rules run in descending priority, then ordinal; the first violation
//! stops evaluation. Each category maps to a best-effort predicate:
//!
//! - security: literal secret and dangerous-call patterns
//! - quality: required test / documentation markers
//! - everything else: keyword presence for "never X" / "always X" phrasing
//!
//! None of these are verifiers. A rule whose phrasing the heuristics cannot
//! read is reported as satisfied.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::compiler::{contains_term, word_set};
use super::{PolicySet, Rule, RuleCategory};

lazy_static! {
    static ref SECRET_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("AWS access key", Regex::new(r"AKIA[0-9A-Z]{16}").unwrap()),
        (
            "private key block",
            Regex::new(r"-----BEGIN (RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----").unwrap()
        ),
        ("API key identifier", Regex::new(r"(?i)api[_\-]?key").unwrap()),
        (
            "password literal",
            Regex::new(r#"(?i)password\s*[:=]\s*['"][^'"]+['"]"#).unwrap()
        ),
        (
            "secret literal",
            Regex::new(r#"(?i)(client_)?secret(_key)?\s*[:=]\s*['"][^'"]+['"]"#).unwrap()
        ),
        (
            "token literal",
            Regex::new(r#"(?i)(access_|auth_)?token\s*[:=]\s*['"][^'"]+['"]"#).unwrap()
        ),
        (
            "private key literal",
            Regex::new(r#"(?i)private_key\s*[:=]\s*['"][^'"]+['"]"#).unwrap()
        ),
        ("bearer token", Regex::new(r"(?i)bearer\s+[a-z0-9\-_.=]{16,}").unwrap()),
    ];
    static ref DANGEROUS_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("eval call", Regex::new(r"\beval\s*\(").unwrap()),
        ("exec call", Regex::new(r"\bexec\s*\(").unwrap()),
        ("shell escape", Regex::new(r"os\.system\s*\(").unwrap()),
        ("shell subprocess", Regex::new(r"shell\s*=\s*True").unwrap()),
        ("destructive SQL", Regex::new(r"(?i)drop\s+table").unwrap()),
        ("recursive delete", Regex::new(r"rm\s+-rf").unwrap()),
    ];
}

const SECRET_TOPIC: &[&str] = &[
    "secret", "secrets", "credential", "credentials", "password", "passwords", "key",
    "keys", "token", "tokens", "api_key", "apikey", "hardcoded", "hardcode",
];

const DANGEROUS_TOPIC: &[&str] = &[
    "injection", "eval", "exec", "shell", "sql", "command", "commands", "sanitize",
    "sanitise",
];

const TEST_TOPIC: &[&str] = &["test", "tests", "testing", "tested", "coverage", "unit"];

const DOC_TOPIC: &[&str] = &[
    "documentation", "document", "documented", "docs", "docstring", "docstrings", "comment",
    "comments",
];

const TEST_MARKERS: &[&str] = &[
    "#[test]", "#[tokio::test]", "#[cfg(test)]", "assert", "def test", "test_", "describe(",
    "it(\"", "it('", "expect(", "@test",
];

const DOC_MARKERS: &[&str] = &[
    "///", "//!", "/**", "\"\"\"", "<!--", "@param", "@return", "# ", "//",
];

/// Longest phrases first so "must not use" wins over "must not"
const PROHIBITIVE: &[&str] = &[
    "must not use", "do not use", "don't use", "dont use", "never use", "avoid using",
    "must not", "should not", "shouldn't", "do not", "don't", "never", "avoid", "without",
    "forbid", "disallow", "no",
];

const MANDATORY: &[&str] = &[
    "must use", "always use", "must", "always", "require", "requires", "required", "ensure",
];

const RATIONALE_CUTS: &[&str] = &["because", "so that", " -- ", " — ", "=>"];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "any", "all", "in", "of", "to", "for", "and", "or", "with", "on", "at",
    "by", "be", "is", "are", "use", "using", "code", "our", "your", "we", "it", "its", "this",
    "that", "there", "every", "each", "have", "has", "should", "must", "always", "never",
];

/// Pass/fail judgment of a result against a policy set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub compliant: bool,
    pub violated_rule: Option<Rule>,
    pub reason: Option<String>,
    /// Rules checked before evaluation stopped
    pub rules_evaluated: usize,
}

impl ComplianceVerdict {
    pub fn compliant(rules_evaluated: usize) -> Self {
        Self {
            compliant: true,
            violated_rule: None,
            reason: None,
            rules_evaluated,
        }
    }

    pub fn violation(rule: Rule, detail: impl AsRef<str>, rules_evaluated: usize) -> Self {
        let reason = format!("Rule \"{}\" violated: {}", rule.raw_text, detail.as_ref());
        Self {
            compliant: false,
            violated_rule: Some(rule),
            reason: Some(reason),
            rules_evaluated,
        }
    }
}

/// Stateless evaluator of category predicates
#[derive(Debug, Clone, Default)]
pub struct PolicyValidator;

impl PolicyValidator {
    pub fn new() -> Self {
        Self
    }

    /// Check `result` against `policy_set`, stopping at the first violation
    pub fn validate(&self, result: &str, policy_set: &PolicySet) -> ComplianceVerdict {
        if !policy_set.active {
            return ComplianceVerdict::compliant(0);
        }

        let lower = result.to_lowercase();
        let words = stemmed_words(&lower);

        for (index, rule) in policy_set.evaluation_order().into_iter().enumerate() {
            if let Some(detail) = self.check_rule(rule, result, &lower, &words) {
                tracing::debug!("Rule violated: {} ({})", rule, detail);
                return ComplianceVerdict::violation(rule.clone(), detail, index + 1);
            }
        }

        ComplianceVerdict::compliant(policy_set.rules.len())
    }

    /// `Some(detail)` when the rule is violated
    pub fn check_rule(
        &self,
        rule: &Rule,
        result: &str,
        lower: &str,
        words: &HashSet<String>,
    ) -> Option<String> {
        let rule_lower = rule.raw_text.to_lowercase();
        let rule_words = word_set(&rule_lower);
        let mentions = |topic: &[&str]| {
            topic
                .iter()
                .any(|t| contains_term(&rule_lower, &rule_words, t))
        };

        match rule.category {
            RuleCategory::Security if mentions(SECRET_TOPIC) => {
                first_match(&SECRET_PATTERNS, result)
                    .map(|name| format!("possible hardcoded secret detected ({})", name))
            }
            RuleCategory::Security if mentions(DANGEROUS_TOPIC) => {
                first_match(&DANGEROUS_PATTERNS, result)
                    .map(|name| format!("dangerous construct detected ({})", name))
            }
            RuleCategory::Quality if !is_prohibitive(&rule_lower) && mentions(TEST_TOPIC) => {
                (!TEST_MARKERS.iter().any(|m| lower.contains(m)))
                    .then(|| "required test marker missing from result".to_string())
            }
            RuleCategory::Quality if !is_prohibitive(&rule_lower) && mentions(DOC_TOPIC) => {
                (!DOC_MARKERS.iter().any(|m| result.contains(m)))
                    .then(|| "required documentation marker missing from result".to_string())
            }
            _ => keyword_presence(&rule_lower, words),
        }
    }
}

fn first_match(patterns: &[(&'static str, Regex)], text: &str) -> Option<&'static str> {
    patterns
        .iter()
        .find(|(_, regex)| regex.is_match(text))
        .map(|(name, _)| *name)
}

fn is_prohibitive(rule_lower: &str) -> bool {
    find_directive(rule_lower, PROHIBITIVE).is_some()
}

/// Generic heuristic for rules phrased as prohibitions or mandates
fn keyword_presence(rule_lower: &str, words: &HashSet<String>) -> Option<String> {
    if let Some(object) = find_directive(rule_lower, PROHIBITIVE) {
        let terms = significant_terms(&object);
        if !terms.is_empty() && terms.iter().all(|t| words.contains(t)) {
            return Some(format!("prohibited term present ({})", terms.join(", ")));
        }
        return None;
    }

    if let Some(object) = find_directive(rule_lower, MANDATORY) {
        let terms = significant_terms(&object);
        if !terms.is_empty() && !terms.iter().any(|t| words.contains(t)) {
            return Some(format!("required term absent ({})", terms.join(", ")));
        }
    }
    None
}

/// Text following the first matching directive phrase, up to any rationale
fn find_directive(rule_lower: &str, phrases: &[&str]) -> Option<String> {
    let directive = RATIONALE_CUTS
        .iter()
        .filter_map(|cut| rule_lower.find(cut))
        .min()
        .map(|at| &rule_lower[..at])
        .unwrap_or(rule_lower);

    let tokens: Vec<&str> = directive
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '\''))
        .filter(|w| !w.is_empty())
        .collect();

    for phrase in phrases {
        let phrase_tokens: Vec<&str> = phrase.split(' ').collect();
        let width = phrase_tokens.len();
        if tokens.len() < width {
            continue;
        }
        for start in 0..=tokens.len() - width {
            if tokens[start..start + width] == phrase_tokens[..] {
                return Some(tokens[start + width..].join(" "));
            }
        }
    }
    None
}

fn significant_terms(object: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in object.split(' ') {
        let word = word.trim_matches('\'');
        if word.len() < 3 || STOPWORDS.contains(&word) {
            continue;
        }
        let stemmed = stem(word);
        if !terms.contains(&stemmed) {
            terms.push(stemmed);
        }
    }
    terms
}

fn stemmed_words(lower: &str) -> HashSet<String> {
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(stem)
        .collect()
}

fn stem(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}
