//! Policy Compiler - free text to typed rules
//!
//! One rule per line (or inline `•` bullet). Categorization checks keyword
//! sets in a fixed order: security, performance, quality, architecture,
//! then falls back to custom. Compilation is pure and never fails.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use super::{Rule, RuleCategory, RulePriority};
use crate::types::digest_bytes;

const SECURITY_TERMS: &[&str] = &[
    "secret", "secrets", "credential", "credentials", "password", "passwords", "token",
    "tokens", "api_key", "apikey", "auth", "authentication", "authorization", "encrypt",
    "encryption", "encrypted", "security", "secure", "vulnerability", "vulnerabilities",
    "injection", "xss", "csrf", "sanitize", "sanitise", "permission", "permissions", "tls",
    "https", "ssl", "api key", "private key", "access key",
];

const PERFORMANCE_TERMS: &[&str] = &[
    "performance", "performant", "fast", "faster", "latency", "slow", "efficient",
    "efficiency", "optimize", "optimise", "optimized", "optimization", "cache", "caching",
    "memory", "allocation", "allocations", "throughput", "benchmark", "benchmarks",
    "o(n)", "n+1", "big-o",
];

const QUALITY_TERMS: &[&str] = &[
    "test", "tests", "testing", "tested", "coverage", "documentation", "document",
    "documented", "docs", "docstring", "docstrings", "comment", "comments", "readable",
    "readability", "lint", "linting", "clean", "naming", "maintainable",
    "maintainability", "quality", "unit", "error handling",
];

const ARCHITECTURE_TERMS: &[&str] = &[
    "architecture", "architectural", "module", "modules", "modular", "layer", "layers",
    "layered", "pattern", "patterns", "dependency", "dependencies", "interface",
    "interfaces", "separation", "microservice", "microservices", "component",
    "components", "coupling", "decouple", "decoupled", "structure", "design", "mvc",
    "service", "services", "abstraction", "abstractions", "inheritance", "composition",
    "monolith",
];

/// Phrases marking an explicit rationale; such rules compile as `High`
const RATIONALE_SEPARATORS: &[&str] = &["because", "so that", " -- ", " — ", "=>"];

/// Non-fatal, informational diagnostics from compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleParseWarning {
    /// Line held only bullet or separator markup
    MarkupOnly { line: usize },
    /// Markdown heading, treated as a section title
    Heading { line: usize, text: String },
    /// Same rule text appeared earlier; the later copy was dropped
    Duplicate { line: usize, text: String },
    /// No keyword set matched
    Uncategorized { line: usize, text: String },
    /// Non-blank text produced no rule; the whole text became one rule
    Fallback,
}

/// Compilation output with diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRules {
    pub rules: Vec<Rule>,
    pub warnings: Vec<RuleParseWarning>,
    /// BLAKE3 digest of the source text
    pub source_digest: String,
}

/// Compile rule text into an ordered rule list
pub fn compile(raw_text: &str) -> Vec<Rule> {
    compile_with_diagnostics(raw_text).rules
}

/// Compile rule text, keeping per-line diagnostics
pub fn compile_with_diagnostics(raw_text: &str) -> CompiledRules {
    let mut rules = Vec::new();
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();

    for (index, line) in raw_text.lines().enumerate() {
        let line_no = index + 1;

        for fragment in line.split('•') {
            let trimmed = fragment.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with('#') && trimmed.trim_start_matches('#').starts_with(' ') {
                warnings.push(RuleParseWarning::Heading {
                    line: line_no,
                    text: trimmed.trim_start_matches('#').trim().to_string(),
                });
                continue;
            }

            let text = normalize_whitespace(strip_markup(trimmed));
            if text.is_empty() || is_markup_only(&text) {
                warnings.push(RuleParseWarning::MarkupOnly { line: line_no });
                continue;
            }

            if !seen.insert(text.to_lowercase()) {
                warnings.push(RuleParseWarning::Duplicate {
                    line: line_no,
                    text,
                });
                continue;
            }

            let category = categorize(&text);
            if category == RuleCategory::Custom {
                warnings.push(RuleParseWarning::Uncategorized {
                    line: line_no,
                    text: text.clone(),
                });
            }

            let priority = if has_rationale(&text) {
                RulePriority::High
            } else {
                RulePriority::Medium
            };

            rules.push(Rule {
                raw_text: text,
                category,
                priority,
                ordinal: rules.len(),
            });
        }
    }

    if rules.is_empty() && !raw_text.trim().is_empty() {
        warnings.push(RuleParseWarning::Fallback);
        rules.push(Rule {
            raw_text: normalize_whitespace(raw_text.trim()),
            category: RuleCategory::Custom,
            priority: RulePriority::Low,
            ordinal: 0,
        });
    }

    CompiledRules {
        rules,
        warnings,
        source_digest: digest_bytes(raw_text.as_bytes()),
    }
}

/// Assign a category by keyword membership, in fixed priority order
pub fn categorize(text: &str) -> RuleCategory {
    let lower = text.to_lowercase();
    let words = word_set(&lower);

    let ordered: [(RuleCategory, &[&str]); 4] = [
        (RuleCategory::Security, SECURITY_TERMS),
        (RuleCategory::Performance, PERFORMANCE_TERMS),
        (RuleCategory::Quality, QUALITY_TERMS),
        (RuleCategory::Architecture, ARCHITECTURE_TERMS),
    ];

    for (category, terms) in ordered {
        if terms.iter().any(|term| contains_term(&lower, &words, term)) {
            return category;
        }
    }
    RuleCategory::Custom
}

fn has_rationale(text: &str) -> bool {
    let lower = text.to_lowercase();
    // Word separators must match whole words: "because", not "becauses".
    let padded = format!(
        " {} ",
        lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    );

    RATIONALE_SEPARATORS.iter().any(|sep| {
        if sep.chars().all(|c| c.is_alphabetic() || c == ' ') {
            padded.contains(&format!(" {} ", sep.trim()))
        } else {
            lower.contains(sep)
        }
    })
}

/// Lowercased words split on anything but alphanumerics and `_`
pub(crate) fn word_set(lower: &str) -> HashSet<&str> {
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Single words match whole words; phrases and symbols match as substrings
pub(crate) fn contains_term(lower: &str, words: &HashSet<&str>, term: &str) -> bool {
    if term.chars().all(|c| c.is_alphanumeric() || c == '_') {
        words.contains(term)
    } else {
        lower.contains(term)
    }
}

fn strip_markup(mut line: &str) -> &str {
    loop {
        let before = line;
        line = line.trim_start();

        for marker in ["[ ]", "[x]", "[X]", "- ", "* ", "+ ", "> ", "•"] {
            if let Some(rest) = line.strip_prefix(marker) {
                line = rest;
            }
        }

        // Numbered bullets: "1." or "12)"
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 {
            let rest = &line[digits..];
            if let Some(stripped) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
                line = stripped;
            }
        }

        if line == before {
            return line.trim();
        }
    }
}

fn is_markup_only(text: &str) -> bool {
    text.chars().all(|c| {
        c.is_whitespace() || matches!(c, '-' | '*' | '_' | '=' | '+' | '>' | '#' | '•' | '|')
    })
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compiler with a digest-keyed cache shared across requests
#[derive(Debug)]
pub struct PolicyCompiler {
    cache: DashMap<String, Arc<CompiledRules>>,
    max_entries: usize,
}

impl PolicyCompiler {
    /// Create a compiler with the default cache size (1024 texts)
    pub fn new() -> Self {
        Self::with_capacity(1_024)
    }

    /// Create a compiler caching at most `max_entries` distinct texts
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Compile through the cache; identical text yields the same `Arc`
    pub fn compile_cached(&self, raw_text: &str) -> Arc<CompiledRules> {
        let key = digest_bytes(raw_text.as_bytes());
        if let Some(hit) = self.cache.get(&key) {
            return Arc::clone(hit.value());
        }

        let compiled = Arc::new(compile_with_diagnostics(raw_text));
        for warning in &compiled.warnings {
            tracing::debug!("Rule parse warning: {:?}", warning);
        }

        if self.cache.len() >= self.max_entries {
            tracing::debug!("Policy compile cache full ({} entries), clearing", self.max_entries);
            self.cache.clear();
        }
        self.cache
            .entry(key)
            .or_insert_with(|| Arc::clone(&compiled))
            .value()
            .clone()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

impl Default for PolicyCompiler {
    fn default() -> Self {
        Self::new()
    }
}
