//! Subcommand implementations
//!
//! Each command builds a serializable report and renders it either as
//! pretty JSON or as plain text.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use rulegate_core::audit::{open_sink, AuditRecord, AuditSink, AuditSummary, JsonlAuditSink};
use rulegate_core::config::AuditSinkConfig;
use rulegate_core::policy::{compiler, CompiledRules, ComplianceVerdict, PolicySet, PolicyValidator};
use rulegate_core::quality::{QualityGate, QualityValidator, QualityVerdict};
use rulegate_core::types::TimeWindow;
use rulegate_core::RulegateConfig;

/// Exit status when `check` blocks a result
pub const EXIT_BLOCKED: i32 = 2;

#[derive(Debug, Serialize)]
pub struct AnalyzeReport {
    pub verdict: QualityVerdict,
    pub gate: QualityGate,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub quality: QualityVerdict,
    pub gate: QualityGate,
    /// Not evaluated when the quality gate already blocked
    pub compliance: Option<ComplianceVerdict>,
    pub blocked: bool,
}

#[derive(Debug, Serialize)]
pub struct AuditReport {
    pub subject_id: String,
    pub summary: AuditSummary,
    pub records: Vec<AuditRecord>,
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn analyze_text(text: &str, config: &RulegateConfig) -> AnalyzeReport {
    let validator = QualityValidator::new(config.quality.clone());
    let verdict = validator.analyze(text);
    let gate = validator.gate(&verdict);
    AnalyzeReport { verdict, gate }
}

/// Same order as the pipeline: quality gate first, then compliance
pub fn check_text(rules_text: &str, result_text: &str, config: &RulegateConfig) -> CheckReport {
    let AnalyzeReport { verdict, gate } = analyze_text(result_text, config);

    if gate.is_blocking() {
        return CheckReport {
            quality: verdict,
            gate,
            compliance: None,
            blocked: true,
        };
    }

    let mut policy_set = PolicySet::empty("cli", None);
    policy_set.rules = compiler::compile(rules_text);
    let compliance = PolicyValidator::new().validate(result_text, &policy_set);
    let blocked = !compliance.compliant;

    CheckReport {
        quality: verdict,
        gate,
        compliance: Some(compliance),
        blocked,
    }
}

pub fn compile(path: &Path, json: bool) -> Result<()> {
    let compiled: CompiledRules = compiler::compile_with_diagnostics(&read(path)?);

    if json {
        return print_json(&compiled);
    }

    println!("{} rule(s) from {}", compiled.rules.len(), path.display());
    for rule in &compiled.rules {
        println!("  {:>3}. {}", rule.ordinal + 1, rule);
    }
    if !compiled.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &compiled.warnings {
            println!("  - {:?}", warning);
        }
    }
    Ok(())
}

pub fn analyze(path: &Path, json: bool, config: &RulegateConfig) -> Result<()> {
    let report = analyze_text(&read(path)?, config);

    if json {
        return print_json(&report);
    }

    print_verdict(&report.verdict);
    println!("Gate:        {}", report.gate);
    Ok(())
}

/// Returns the process exit status
pub fn check(rules: &Path, result: &Path, json: bool, config: &RulegateConfig) -> Result<i32> {
    let report = check_text(&read(rules)?, &read(result)?, config);

    if json {
        print_json(&report)?;
    } else {
        print_verdict(&report.quality);
        println!("Gate:        {}", report.gate);
        match &report.compliance {
            Some(verdict) if verdict.compliant => {
                println!("Compliance:  ok ({} rule(s) evaluated)", verdict.rules_evaluated)
            }
            Some(verdict) => println!(
                "Compliance:  VIOLATION - {}",
                verdict.reason.as_deref().unwrap_or("unknown rule")
            ),
            None => println!("Compliance:  not evaluated"),
        }
        println!("Result:      {}", if report.blocked { "BLOCKED" } else { "ALLOWED" });
    }

    Ok(if report.blocked { EXIT_BLOCKED } else { 0 })
}

/// Query window for `--since-hours`
pub fn since_window(since_hours: Option<i64>) -> Result<TimeWindow> {
    let Some(hours) = since_hours else {
        return Ok(TimeWindow::all());
    };
    if hours < 0 {
        bail!("--since-hours must not be negative (got {})", hours);
    }
    let span = chrono::TimeDelta::try_hours(hours)
        .with_context(|| format!("--since-hours {} is out of range", hours))?;
    TimeWindow::try_last(span).with_context(|| format!("--since-hours {} is out of range", hours))
}

/// Summarize the audit trail in `log`, or in the configured sink when no log
/// file is given
pub async fn audit(
    log: Option<&Path>,
    subject_id: &str,
    since_hours: Option<i64>,
    json: bool,
    config: &RulegateConfig,
) -> Result<()> {
    let window = since_window(since_hours)?;

    let sink: Arc<dyn AuditSink> = match log {
        Some(log) => {
            if !log.exists() {
                bail!("Audit log not found: {}", log.display());
            }
            Arc::new(JsonlAuditSink::open(log).await?)
        }
        None => match &config.audit.sink {
            AuditSinkConfig::Memory => {
                bail!("The configured audit sink is in-memory; pass --log <FILE>")
            }
            configured => open_sink(configured).await?,
        },
    };
    let records = sink.query(subject_id, &window).await?;
    let report = AuditReport {
        subject_id: subject_id.to_string(),
        summary: AuditSummary::from_records(&records),
        records,
    };

    if json {
        return print_json(&report);
    }

    let summary = &report.summary;
    println!("Audit summary for {}", report.subject_id);
    println!("  Total:      {}", summary.total);
    println!("  Succeeded:  {}", summary.succeeded);
    println!("  Blocked:    {}", summary.blocked);
    println!("  Failed:     {}", summary.failed);
    println!("  Mean time:  {:.1}ms", summary.mean_duration_ms);
    for (handler, count) in &summary.by_handler {
        println!("  {:<12}{}", handler, count);
    }
    if !report.records.is_empty() {
        println!();
        for record in &report.records {
            let outcome = match record.error_kind {
                Some(kind) => kind.to_string(),
                None => "ok".to_string(),
            };
            println!(
                "  {}  {}  {}::{}  {}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.request_id,
                record.handler_id,
                record.action,
                outcome
            );
        }
    }
    Ok(())
}

pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    RulegateConfig::default()
        .to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_verdict(verdict: &QualityVerdict) {
    println!("Quality:     {:.2}", verdict.quality_score);
    println!("Bias:        {:.2}", verdict.bias_score);
    println!("Confidence:  {:.2}", verdict.confidence);
    if !verdict.context_gaps.is_empty() {
        println!("Gaps:");
        for gap in &verdict.context_gaps {
            println!("  - {}", gap);
        }
    }
}
