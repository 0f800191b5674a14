//! Request Coordinator - the per-request pipeline
//!
//! ```text
//! RECEIVED → POLICY_LOADED → ROUTED → EXECUTED → QUALITY_CHECKED → POLICY_CHECKED → AUDITED → RESPONDED
//!                                                        │                 │
//!                                                        └──── BLOCKED ────┘
//! ```
//!
//! Any failure before a verdict jumps straight to `AUDITED` and then
//! `RESPONDED` with an error. Exactly one audit record is handed to the
//! recorder per request, whatever the outcome, including a caller dropping
//! the [`RequestCoordinator::handle`] future mid-flight. The handler call is
//! the only suspension point on the response path; the audit write is
//! fire-and-forget.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditRecord, AuditRecorder};
use crate::config::RulegateConfig;
use crate::error::{ErrorKind, RegistrationError, Result};
use crate::policy::{
    CachingPolicyStore, ComplianceVerdict, InMemoryPolicyStore, PolicyCompiler, PolicySet,
    PolicyStore, PolicyValidator,
};
use crate::quality::{QualityGate, QualityValidator, QualityVerdict};
use crate::registry::{
    CapabilityHandler, CapabilityRegistry, HandlerHealth, HandlerOptions, RegistryBuilder,
};
use crate::types::{digest_json, now};

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Received,
    PolicyLoaded,
    Routed,
    Executed,
    QualityChecked,
    PolicyChecked,
    Audited,
    Responded,
    /// Terminal: a quality or policy gate refused the result
    Blocked,
}

impl PipelineStage {
    pub fn can_transition_to(self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        match (self, next) {
            (Received, PolicyLoaded) => true,
            (PolicyLoaded, Routed) => true,
            (Routed, Executed) => true,
            (Executed, QualityChecked) => true,
            (QualityChecked, PolicyChecked) | (QualityChecked, Blocked) => true,
            (PolicyChecked, Audited) | (PolicyChecked, Blocked) => true,
            (Audited, Responded) => true,
            (Responded, _) | (Blocked, _) => false,
            // Abort path
            (_, Audited) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Responded | PipelineStage::Blocked)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Inbound action from the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    pub request_id: String,
    pub subject_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub handler_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl InboundRequest {
    /// New request with a random id
    pub fn new(
        subject_id: impl Into<String>,
        handler_id: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            project_id: None,
            handler_id: handler_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    fn digest(&self) -> String {
        digest_json(&serde_json::json!({
            "subject_id": self.subject_id,
            "project_id": self.project_id,
            "handler_id": self.handler_id,
            "action": self.action,
            "payload": self.payload,
        }))
    }
}

/// Response handed back to the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub request_id: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
    /// Why the request failed or was blocked
    pub error_message: Option<String>,
    pub quality_verdict: Option<QualityVerdict>,
    pub compliance_verdict: Option<ComplianceVerdict>,
    /// Non-blocking annotations such as a quality soft failure
    pub warnings: Vec<String>,
    pub stages: Vec<PipelineStage>,
}

impl PipelineResponse {
    pub fn is_blocked(&self) -> bool {
        self.error_kind.map(|k| k.is_block()).unwrap_or(false)
    }

    pub fn final_stage(&self) -> Option<PipelineStage> {
        self.stages.last().copied()
    }
}

struct StageTrail<'a> {
    request_id: &'a str,
    stages: Vec<PipelineStage>,
}

impl<'a> StageTrail<'a> {
    fn new(request_id: &'a str) -> Self {
        tracing::debug!("[{}] {}", request_id, PipelineStage::Received);
        Self {
            request_id,
            stages: vec![PipelineStage::Received],
        }
    }

    fn current(&self) -> PipelineStage {
        *self.stages.last().unwrap_or(&PipelineStage::Received)
    }

    fn advance(&mut self, next: PipelineStage) {
        let current = self.current();
        if !current.can_transition_to(next) {
            tracing::error!(
                "[{}] Illegal stage transition {} -> {}",
                self.request_id,
                current,
                next
            );
        }
        tracing::debug!("[{}] {} -> {}", self.request_id, current, next);
        self.stages.push(next);
    }
}

/// Everything the terminal step needs to audit and respond
#[derive(Default)]
struct Outcome {
    result: Option<serde_json::Value>,
    result_digest: Option<String>,
    error_kind: Option<ErrorKind>,
    error_message: Option<String>,
    quality_verdict: Option<QualityVerdict>,
    compliance_verdict: Option<ComplianceVerdict>,
    warnings: Vec<String>,
}

impl Outcome {
    fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind: Some(kind),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

enum Verdicts {
    Passed {
        quality: QualityVerdict,
        compliance: ComplianceVerdict,
        warnings: Vec<String>,
    },
    QualityBlocked {
        quality: QualityVerdict,
        reason: String,
    },
    PolicyBlocked {
        quality: QualityVerdict,
        compliance: ComplianceVerdict,
        warnings: Vec<String>,
    },
}

/// Glues the pipeline components together for each request
pub struct RequestCoordinator {
    registry: CapabilityRegistry,
    policy_store: Arc<dyn PolicyStore>,
    quality: QualityValidator,
    policy_validator: PolicyValidator,
    audit: Arc<AuditRecorder>,
    #[cfg(test)]
    validation_hook: Option<fn(&str)>,
}

impl RequestCoordinator {
    pub fn new(
        registry: CapabilityRegistry,
        policy_store: Arc<dyn PolicyStore>,
        quality: QualityValidator,
        audit: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            registry,
            policy_store,
            quality,
            policy_validator: PolicyValidator::new(),
            audit,
            #[cfg(test)]
            validation_hook: None,
        }
    }

    /// Assemble a coordinator from configuration
    pub fn builder(config: &RulegateConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &Arc<AuditRecorder> {
        &self.audit
    }

    /// Run one request through the pipeline. Never fails: every outcome is a
    /// [`PipelineResponse`].
    pub async fn handle(&self, request: InboundRequest) -> PipelineResponse {
        let started = Instant::now();
        let request_digest = request.digest();
        let mut guard = CancelGuard {
            audit: &self.audit,
            request: &request,
            request_digest: request_digest.clone(),
            started,
            armed: true,
        };

        let response = self.run(&request, request_digest, started).await;
        guard.armed = false;
        response
    }

    /// Flush pending audit records and stop the audit worker
    pub async fn shutdown(&self) {
        self.audit.shutdown().await;
    }

    async fn run(
        &self,
        request: &InboundRequest,
        request_digest: String,
        started: Instant,
    ) -> PipelineResponse {
        let mut trail = StageTrail::new(&request.request_id);

        let policy_set = match self
            .policy_store
            .get(&request.subject_id, request.project_id.as_deref())
            .await
        {
            Ok(Some(set)) => set,
            Ok(None) => PolicySet::empty(request.subject_id.clone(), request.project_id.clone()),
            Err(e) => {
                tracing::warn!("[{}] Policy load failed: {}", request.request_id, e);
                let outcome = Outcome::failure(ErrorKind::PolicyLoadFailure, e.to_string());
                return self.abort(request, request_digest, trail, outcome, started);
            }
        };
        trail.advance(PipelineStage::PolicyLoaded);

        trail.advance(PipelineStage::Routed);
        let output = match self
            .registry
            .route(&request.handler_id, &request.action, request.payload.clone())
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let outcome = Outcome::failure(e.error_kind(), e.to_string());
                return self.abort(request, request_digest, trail, outcome, started);
            }
        };
        trail.advance(PipelineStage::Executed);

        let result_digest = digest_json(&output.value);
        let text = result_text(&output.value);

        let verdicts = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.evaluate(&text, &policy_set)
        }));
        let verdicts = match verdicts {
            Ok(verdicts) => verdicts,
            Err(_) => {
                tracing::error!("[{}] Validation panicked", request.request_id);
                let mut outcome =
                    Outcome::failure(ErrorKind::Internal, "result validation failed unexpectedly");
                outcome.result_digest = Some(result_digest);
                return self.abort(request, request_digest, trail, outcome, started);
            }
        };

        let outcome = match verdicts {
            Verdicts::QualityBlocked { quality, reason } => {
                trail.advance(PipelineStage::QualityChecked);
                trail.advance(PipelineStage::Blocked);
                Outcome {
                    result_digest: Some(result_digest),
                    error_kind: Some(ErrorKind::QualityHardFail),
                    error_message: Some(reason),
                    quality_verdict: Some(quality),
                    ..Outcome::default()
                }
            }
            Verdicts::PolicyBlocked {
                quality,
                compliance,
                warnings,
            } => {
                trail.advance(PipelineStage::QualityChecked);
                trail.advance(PipelineStage::PolicyChecked);
                trail.advance(PipelineStage::Blocked);
                Outcome {
                    result_digest: Some(result_digest),
                    error_kind: Some(ErrorKind::PolicyViolation),
                    error_message: compliance.reason.clone(),
                    quality_verdict: Some(quality),
                    compliance_verdict: Some(compliance),
                    warnings,
                    ..Outcome::default()
                }
            }
            Verdicts::Passed {
                quality,
                compliance,
                warnings,
            } => {
                trail.advance(PipelineStage::QualityChecked);
                trail.advance(PipelineStage::PolicyChecked);
                trail.advance(PipelineStage::Audited);
                Outcome {
                    result: Some(output.value),
                    result_digest: Some(result_digest),
                    quality_verdict: Some(quality),
                    compliance_verdict: Some(compliance),
                    warnings,
                    ..Outcome::default()
                }
            }
        };

        self.finish(request, request_digest, trail, outcome, started)
    }

    /// The synchronous validation stages
    fn evaluate(&self, text: &str, policy_set: &PolicySet) -> Verdicts {
        #[cfg(test)]
        if let Some(hook) = self.validation_hook {
            hook(text);
        }

        let quality = self.quality.analyze(text);
        let mut warnings = Vec::new();

        match self.quality.gate(&quality) {
            QualityGate::HardFail { reason } => {
                return Verdicts::QualityBlocked { quality, reason };
            }
            QualityGate::SoftFail { reason } => {
                warnings.push(format!("QualitySoftFail: {}", reason));
            }
            QualityGate::Pass => {}
        }

        let compliance = self.policy_validator.validate(text, policy_set);
        if compliance.compliant {
            Verdicts::Passed {
                quality,
                compliance,
                warnings,
            }
        } else {
            Verdicts::PolicyBlocked {
                quality,
                compliance,
                warnings,
            }
        }
    }

    fn abort(
        &self,
        request: &InboundRequest,
        request_digest: String,
        mut trail: StageTrail<'_>,
        outcome: Outcome,
        started: Instant,
    ) -> PipelineResponse {
        trail.advance(PipelineStage::Audited);
        self.finish(request, request_digest, trail, outcome, started)
    }

    /// Record the audit entry and build the response
    fn finish(
        &self,
        request: &InboundRequest,
        request_digest: String,
        mut trail: StageTrail<'_>,
        outcome: Outcome,
        started: Instant,
    ) -> PipelineResponse {
        let success = outcome.error_kind.is_none();

        let mut record = audit_record(request, request_digest, started);
        record.result_digest = outcome.result_digest;
        record.quality_verdict = outcome.quality_verdict.clone();
        record.compliance_verdict = outcome.compliance_verdict.clone();
        record.success = success;
        record.error_kind = outcome.error_kind;
        record.warnings = outcome.warnings.clone();
        self.audit.record(record);

        if trail.current() == PipelineStage::Audited {
            trail.advance(PipelineStage::Responded);
        }

        match (&outcome.error_kind, &outcome.error_message) {
            (Some(kind), Some(message)) if kind.is_block() => {
                tracing::info!("[{}] Blocked ({}): {}", request.request_id, kind, message)
            }
            (Some(kind), message) => tracing::warn!(
                "[{}] Failed ({}): {}",
                request.request_id,
                kind,
                message.as_deref().unwrap_or("")
            ),
            _ => tracing::debug!("[{}] Responded", request.request_id),
        }

        PipelineResponse {
            request_id: request.request_id.clone(),
            success,
            result: outcome.result,
            error_kind: outcome.error_kind,
            error_message: outcome.error_message,
            quality_verdict: outcome.quality_verdict,
            compliance_verdict: outcome.compliance_verdict,
            warnings: outcome.warnings,
            stages: trail.stages,
        }
    }
}

/// Base record for a request; the caller fills in the verdicts
fn audit_record(request: &InboundRequest, request_digest: String, started: Instant) -> AuditRecord {
    AuditRecord {
        record_id: AuditRecord::new_id(),
        request_id: request.request_id.clone(),
        subject_id: request.subject_id.clone(),
        project_id: request.project_id.clone(),
        handler_id: request.handler_id.clone(),
        action: request.action.clone(),
        request_digest,
        result_digest: None,
        quality_verdict: None,
        compliance_verdict: None,
        success: true,
        error_kind: None,
        warnings: Vec::new(),
        timestamp: now(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Audits a request whose `handle` future is dropped before it responds
struct CancelGuard<'a> {
    audit: &'a AuditRecorder,
    request: &'a InboundRequest,
    request_digest: String,
    started: Instant,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            "[{}] Request dropped before completion",
            self.request.request_id
        );
        let mut record = audit_record(
            self.request,
            std::mem::take(&mut self.request_digest),
            self.started,
        );
        record.success = false;
        record.error_kind = Some(ErrorKind::Internal);
        record.warnings = vec!["request cancelled before completion".to_string()];
        self.audit.record(record);
    }
}

/// Builds a [`RequestCoordinator`] from [`RulegateConfig`]: registry timeouts,
/// a TTL cache around the policy store, quality thresholds and the configured
/// audit sink.
pub struct CoordinatorBuilder {
    config: RulegateConfig,
    registry: RegistryBuilder,
    policy_store: Option<Arc<dyn PolicyStore>>,
}

impl CoordinatorBuilder {
    pub fn new(config: &RulegateConfig) -> Self {
        Self {
            config: config.clone(),
            registry: RegistryBuilder::new(config.registry.clone()),
            policy_store: None,
        }
    }

    /// Backing store; an empty in-memory store is used when none is set
    pub fn with_policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(store);
        self
    }

    pub async fn register(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> std::result::Result<HandlerHealth, RegistrationError> {
        self.registry.register(id, handler).await
    }

    pub async fn register_with(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
        options: HandlerOptions,
    ) -> std::result::Result<HandlerHealth, RegistrationError> {
        self.registry.register_with(id, handler, options).await
    }

    /// Validate the configuration, open the audit sink and start the recorder.
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<RequestCoordinator> {
        self.config.validate()?;

        let store = self.policy_store.unwrap_or_else(|| {
            Arc::new(InMemoryPolicyStore::new(Arc::new(PolicyCompiler::new())))
        });
        let ttl = self.config.policy.cache_ttl();
        let store: Arc<dyn PolicyStore> = if ttl.is_zero() {
            store
        } else {
            Arc::new(CachingPolicyStore::new(store, ttl))
        };

        let audit = AuditRecorder::from_settings(&self.config.audit).await?;
        let registry = self.registry.build();

        tracing::info!(
            "Coordinator ready ({} handler(s), policy cache ttl {:?})",
            registry.len(),
            ttl
        );

        Ok(RequestCoordinator::new(
            registry,
            store,
            QualityValidator::new(self.config.quality.clone()),
            Arc::new(audit),
        ))
    }
}

/// Text seen by the validators: string payloads as-is, anything else as JSON
fn result_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
