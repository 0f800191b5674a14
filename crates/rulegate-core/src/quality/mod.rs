//! Quality Validator - heuristic scoring of handler output
//!
//! Scores are derived purely from the result text:
//!
//! - completeness: coverage of the [`lexicon::COVERAGE_CATEGORIES`]
//! - clarity: density of vague wording and intensifiers
//! - bias: density of loaded language, damped for short results
//!
//! Nothing here calls out or samples, so the same text always produces the
//! same [`QualityVerdict`]. The [`QualityGate`] maps a verdict onto the two
//! configured thresholds.

pub mod lexicon;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::QualitySettings;
use lexicon::{COVERAGE_CATEGORIES, INTENSIFIER_TERMS, LOADED_TERMS, VAGUE_TERMS};

/// Word count at which length stops discounting the quality score
const FULL_LENGTH_WORDS: f64 = 20.0;

/// Word count at which confidence saturates
const FULL_CONFIDENCE_WORDS: f64 = 100.0;

const COMPLETENESS_WEIGHT: f64 = 0.6;
const CLARITY_WEIGHT: f64 = 0.4;

/// Each vague term costs this much clarity per word of text
const VAGUE_PENALTY: f64 = 4.0;

/// Each intensifier costs this much clarity per word of text
const INTENSIFIER_PENALTY: f64 = 1.0;

/// Each loaded term adds this much bias per word of text
const LOADED_WEIGHT: f64 = 8.0;

/// Shorter results are scored for bias as if they had this many words, so a
/// single loaded term can never reach the default block threshold on its own
const BIAS_MIN_WORDS: f64 = 20.0;

/// Heuristic assessment of a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// 0.0 (empty / incomplete) to 1.0
    pub quality_score: f64,
    /// 0.0 (neutral) to 1.0 (heavily loaded)
    pub bias_score: f64,
    /// Grows with the amount of text scored
    pub confidence: f64,
    /// Human-readable reasons the score is not higher
    pub context_gaps: Vec<String>,
}

/// Outcome of checking a verdict against the configured thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum QualityGate {
    Pass,
    /// Quality below minimum; the response still succeeds with a warning
    SoftFail { reason: String },
    /// Bias above maximum; the response is blocked
    HardFail { reason: String },
}

impl QualityGate {
    pub fn is_blocking(&self) -> bool {
        matches!(self, QualityGate::HardFail { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            QualityGate::Pass => None,
            QualityGate::SoftFail { reason } | QualityGate::HardFail { reason } => Some(reason),
        }
    }
}

impl fmt::Display for QualityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityGate::Pass => f.write_str("pass"),
            QualityGate::SoftFail { reason } => write!(f, "soft fail: {}", reason),
            QualityGate::HardFail { reason } => write!(f, "hard fail: {}", reason),
        }
    }
}

/// Deterministic quality scorer
#[derive(Debug, Clone, Default)]
pub struct QualityValidator {
    settings: QualitySettings,
}

impl QualityValidator {
    pub fn new(settings: QualitySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QualitySettings {
        &self.settings
    }

    /// Score a result text
    pub fn analyze(&self, result: &str) -> QualityVerdict {
        let lower = result.to_lowercase();
        let tokens = tokenize(&lower);
        let word_count = tokens.len();

        if word_count == 0 {
            let mut context_gaps = vec!["result is empty".to_string()];
            context_gaps.extend(COVERAGE_CATEGORIES.iter().map(|c| c.gap.to_string()));
            return QualityVerdict {
                quality_score: 0.0,
                bias_score: 0.0,
                confidence: 0.0,
                context_gaps,
            };
        }

        let mut context_gaps = Vec::new();

        let mut covered = 0usize;
        for category in COVERAGE_CATEGORIES {
            if category
                .terms
                .iter()
                .any(|term| count_term(&lower, &tokens, term) > 0)
            {
                covered += 1;
            } else {
                context_gaps.push(category.gap.to_string());
            }
        }
        let completeness = covered as f64 / COVERAGE_CATEGORIES.len() as f64;

        let words = word_count as f64;
        let (vague_hits, vague_found) = find_terms(&lower, &tokens, VAGUE_TERMS);
        if !vague_found.is_empty() {
            context_gaps.push(format!("vague wording: {}", vague_found.join(", ")));
        }
        let (intensifier_hits, intensifiers_found) =
            find_terms(&lower, &tokens, INTENSIFIER_TERMS);
        if !intensifiers_found.is_empty() {
            context_gaps.push(format!(
                "overconfident wording: {}",
                intensifiers_found.join(", ")
            ));
        }
        let clarity = (1.0
            - (VAGUE_PENALTY * vague_hits as f64 + INTENSIFIER_PENALTY * intensifier_hits as f64)
                / words)
            .max(0.0);

        let (loaded_hits, _) = find_terms(&lower, &tokens, LOADED_TERMS);
        let bias = (LOADED_WEIGHT * loaded_hits as f64 / words.max(BIAS_MIN_WORDS)).min(1.0);

        let length_factor = (words / FULL_LENGTH_WORDS).min(1.0);
        let quality =
            (COMPLETENESS_WEIGHT * completeness + CLARITY_WEIGHT * clarity) * length_factor;

        let verdict = QualityVerdict {
            quality_score: round4(quality),
            bias_score: round4(bias),
            confidence: round4((words / FULL_CONFIDENCE_WORDS).min(1.0)),
            context_gaps,
        };

        tracing::debug!(
            "Quality analyzed: quality={:.3} bias={:.3} confidence={:.3} words={}",
            verdict.quality_score,
            verdict.bias_score,
            verdict.confidence,
            word_count
        );

        verdict
    }

    /// Apply the thresholds. Bias is checked first: a hard failure wins.
    pub fn gate(&self, verdict: &QualityVerdict) -> QualityGate {
        if verdict.bias_score > self.settings.max_bias {
            return QualityGate::HardFail {
                reason: format!(
                    "bias score {:.2} exceeds maximum {:.2}",
                    verdict.bias_score, self.settings.max_bias
                ),
            };
        }

        if verdict.quality_score < self.settings.min_quality {
            return QualityGate::SoftFail {
                reason: format!(
                    "quality score {:.2} below minimum {:.2}",
                    verdict.quality_score, self.settings.min_quality
                ),
            };
        }

        QualityGate::Pass
    }
}

fn tokenize(lower: &str) -> Vec<&str> {
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Total hits and the distinct terms that matched
fn find_terms(
    lower: &str,
    tokens: &[&str],
    terms: &[&'static str],
) -> (usize, Vec<&'static str>) {
    let mut hits = 0;
    let mut found = Vec::new();
    for term in terms {
        let count = count_term(lower, tokens, term);
        if count > 0 {
            hits += count;
            found.push(*term);
        }
    }
    (hits, found)
}

/// Whole-word occurrences for single words, substring occurrences otherwise
fn count_term(lower: &str, tokens: &[&str], term: &str) -> usize {
    if term.chars().all(|c| c.is_alphanumeric() || c == '_') {
        tokens.iter().filter(|t| **t == term).count()
    } else {
        lower.matches(term).count()
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
