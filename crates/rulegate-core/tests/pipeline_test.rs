//! E2E tests for the request pipeline
//!
//! Policy load -> route -> quality -> compliance -> audit, driven through
//! `RequestCoordinator::handle` with in-process handlers and sinks.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rulegate_core::audit::{AuditRecorder, InMemoryAuditSink, JsonlAuditSink, SqliteAuditSink};
use rulegate_core::config::{AuditSettings, QualitySettings, RegistrySettings};
use rulegate_core::error::PolicyStoreError;
use rulegate_core::policy::{
    InMemoryPolicyStore, PolicyCompiler, PolicyDocument, PolicyScope, PolicySet, PolicyStore,
};
use rulegate_core::registry::{HandlerOptions, RegistryBuilder};
use rulegate_core::{
    AuditSummary, CapabilityHandler, ErrorKind, HandlerError, InboundRequest, PipelineStage,
    QualityValidator, RequestCoordinator, TimeWindow,
};

const THOROUGH_ANSWER: &str = "\
## Config module
/// Loads the config file and returns a typed struct.
pub fn load(path: &Path) -> Result<Config, Error> {
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(Error::from)
}
Invalid files return an error instead of panicking.

#[test]
fn loads_default_config() { assert!(load(Path::new(\"rulegate.toml\")).is_ok()); }
";

/// Handler returning a fixed JSON value and counting invocations
struct Scripted {
    response: Value,
    delay: Option<Duration>,
    capabilities: Vec<String>,
    calls: AtomicUsize,
}

impl Scripted {
    fn returning(response: Value) -> Arc<Self> {
        Arc::new(Self {
            response,
            delay: None,
            capabilities: vec!["code".to_string()],
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            response: json!("too late"),
            delay: Some(delay),
            capabilities: Vec::new(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityHandler for Scripted {
    fn declared_actions(&self) -> Vec<String> {
        vec!["generate".to_string()]
    }

    fn declared_capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn invoke(&self, _action: &str, _payload: Value) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.response.clone())
    }
}

/// Handler whose initialization always fails
struct Unready {
    calls: AtomicUsize,
}

#[async_trait]
impl CapabilityHandler for Unready {
    fn declared_actions(&self) -> Vec<String> {
        vec!["generate".to_string()]
    }

    async fn initialize(&self) -> Result<(), HandlerError> {
        Err(HandlerError::new("upstream model unreachable"))
    }

    async fn invoke(&self, _action: &str, _payload: Value) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!("should never run"))
    }
}

struct BrokenStore;

#[async_trait]
impl PolicyStore for BrokenStore {
    async fn get(
        &self,
        _subject_id: &str,
        _project_id: Option<&str>,
    ) -> Result<Option<PolicySet>, PolicyStoreError> {
        Err(PolicyStoreError::Unavailable("database offline".to_string()))
    }
}

struct Harness {
    coordinator: Arc<RequestCoordinator>,
    sink: Arc<InMemoryAuditSink>,
    policies: Arc<InMemoryPolicyStore>,
}

type Entry = (&'static str, Arc<dyn CapabilityHandler>, Option<Duration>);

fn entry(
    id: &'static str,
    handler: Arc<dyn CapabilityHandler>,
    timeout: Option<Duration>,
) -> Entry {
    (id, handler, timeout)
}

async fn harness(handlers: Vec<Entry>) -> Harness {
    let mut builder = RegistryBuilder::new(RegistrySettings::default());
    for (id, handler, timeout) in handlers {
        let options = match timeout {
            Some(timeout) => HandlerOptions::default().with_timeout(timeout),
            None => HandlerOptions::default(),
        };
        builder.register_with(id, handler, options).await.unwrap();
    }

    let sink = Arc::new(InMemoryAuditSink::new());
    let recorder = Arc::new(AuditRecorder::spawn(sink.clone(), &AuditSettings::default()));
    let policies = Arc::new(InMemoryPolicyStore::new(Arc::new(PolicyCompiler::new())));

    let coordinator = RequestCoordinator::new(
        builder.build(),
        policies.clone(),
        QualityValidator::new(QualitySettings::default()),
        recorder,
    );

    Harness {
        coordinator: Arc::new(coordinator),
        sink,
        policies,
    }
}

#[tokio::test]
async fn e2e_successful_request() {
    let handler = Scripted::returning(json!(THOROUGH_ANSWER));
    let h = harness(vec![entry("codegen", handler.clone(), None)]).await;
    h.policies.put(
        "alice",
        PolicyScope::Global,
        PolicyDocument::new("No hardcoded secrets\nEvery function needs tests"),
    );

    let response = h
        .coordinator
        .handle(InboundRequest::new(
            "alice",
            "codegen",
            "generate",
            json!({"prompt": "config loader"}),
        ))
        .await;

    assert!(response.success, "{:?}", response);
    assert_eq!(response.result, Some(json!(THOROUGH_ANSWER)));
    assert!(response.error_kind.is_none());
    assert!(response.warnings.is_empty());
    assert!(response.compliance_verdict.as_ref().unwrap().compliant);
    assert_eq!(response.compliance_verdict.as_ref().unwrap().rules_evaluated, 2);
    assert_eq!(
        response.stages,
        vec![
            PipelineStage::Received,
            PipelineStage::PolicyLoaded,
            PipelineStage::Routed,
            PipelineStage::Executed,
            PipelineStage::QualityChecked,
            PipelineStage::PolicyChecked,
            PipelineStage::Audited,
            PipelineStage::Responded,
        ]
    );
    assert_eq!(handler.calls(), 1);

    h.coordinator.audit().flush().await;
    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].request_id, response.request_id);
    assert!(records[0].result_digest.is_some());
}

#[tokio::test]
async fn e2e_hardcoded_secret_is_blocked() {
    let handler = Scripted::returning(json!("config = { api_key: load_from_env() }"));
    let h = harness(vec![entry("codegen", handler, None)]).await;
    h.policies.put(
        "alice",
        PolicyScope::Global,
        PolicyDocument::new("no hardcoded secrets"),
    );

    let response = h
        .coordinator
        .handle(InboundRequest::new("alice", "codegen", "generate", json!({})))
        .await;

    assert!(!response.success);
    assert!(response.is_blocked());
    assert_eq!(response.error_kind, Some(ErrorKind::PolicyViolation));
    assert!(response.result.is_none());

    let verdict = response.compliance_verdict.unwrap();
    assert!(!verdict.compliant);
    assert!(verdict.reason.as_deref().unwrap().contains("secret"));
    assert_eq!(verdict.violated_rule.unwrap().raw_text, "no hardcoded secrets");
    assert!(response.error_message.unwrap().contains("no hardcoded secrets"));
    assert_eq!(response.stages.last(), Some(&PipelineStage::Blocked));

    h.coordinator.audit().flush().await;
    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_kind, Some(ErrorKind::PolicyViolation));
}

#[tokio::test]
async fn e2e_failed_handler_is_never_invoked() {
    let unready = Arc::new(Unready {
        calls: AtomicUsize::new(0),
    });
    let h = harness(vec![entry("qa", unready.clone(), None)]).await;

    let response = h
        .coordinator
        .handle(InboundRequest::new("alice", "qa", "generate", json!({})))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::HandlerUnavailable));
    assert!(response
        .error_message
        .unwrap()
        .contains("upstream model unreachable"));
    assert_eq!(unready.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        response.stages,
        vec![
            PipelineStage::Received,
            PipelineStage::PolicyLoaded,
            PipelineStage::Routed,
            PipelineStage::Audited,
            PipelineStage::Responded,
        ]
    );

    h.coordinator.audit().flush().await;
    assert_eq!(h.sink.len(), 1);
}

#[tokio::test]
async fn e2e_timeout_passes_nothing_to_validators() {
    let slow = Scripted::slow(Duration::from_secs(5));
    let h = harness(vec![entry("slow", slow.clone(), Some(Duration::from_millis(30)))]).await;

    let response = h
        .coordinator
        .handle(InboundRequest::new("alice", "slow", "generate", json!({})))
        .await;

    assert_eq!(response.error_kind, Some(ErrorKind::HandlerTimeout));
    assert!(response.result.is_none());
    assert!(response.quality_verdict.is_none());
    assert!(response.compliance_verdict.is_none());
    assert!(!response.stages.contains(&PipelineStage::QualityChecked));
    assert_eq!(slow.calls(), 1);

    h.coordinator.audit().flush().await;
    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].result_digest.is_none());
    assert!(records[0].quality_verdict.is_none());
}

#[tokio::test]
async fn e2e_empty_result_soft_fails() {
    let h = harness(vec![entry("codegen", Scripted::returning(json!("")), None)]).await;

    let response = h
        .coordinator
        .handle(InboundRequest::new("alice", "codegen", "generate", json!({})))
        .await;

    assert!(response.success);
    assert_eq!(response.result, Some(json!("")));
    let quality = response.quality_verdict.unwrap();
    assert!(quality.quality_score < QualitySettings::default().min_quality);
    assert!(quality.bias_score <= QualitySettings::default().max_bias);
    assert_eq!(response.warnings.len(), 1);
    assert!(response.warnings[0].starts_with("QualitySoftFail"));
}

#[tokio::test]
async fn e2e_loaded_language_hard_fails() {
    let h = harness(vec![entry(
        "codegen",
        Scripted::returning(json!(
            "Obviously this is stupid. Clearly an idiot wrote this garbage."
        )),
        None,
    )])
    .await;
    h.policies
        .put("alice", PolicyScope::Global, PolicyDocument::new("no hardcoded secrets"));

    let response = h
        .coordinator
        .handle(InboundRequest::new("alice", "codegen", "generate", json!({})))
        .await;

    assert_eq!(response.error_kind, Some(ErrorKind::QualityHardFail));
    assert!(response.error_message.unwrap().contains("bias score"));
    assert!(response.quality_verdict.is_some());
    assert!(response.compliance_verdict.is_none());
    assert!(!response.stages.contains(&PipelineStage::PolicyChecked));
    assert_eq!(response.stages.last(), Some(&PipelineStage::Blocked));
}

#[tokio::test]
async fn e2e_policy_store_failure_is_audited() {
    let handler = Scripted::returning(json!(THOROUGH_ANSWER));
    let mut builder = RegistryBuilder::new(RegistrySettings::default());
    builder.register("codegen", handler.clone()).await.unwrap();

    let sink = Arc::new(InMemoryAuditSink::new());
    let recorder = Arc::new(AuditRecorder::spawn(sink.clone(), &AuditSettings::default()));
    let coordinator = RequestCoordinator::new(
        builder.build(),
        Arc::new(BrokenStore),
        QualityValidator::default(),
        recorder.clone(),
    );

    let response = coordinator
        .handle(InboundRequest::new("alice", "codegen", "generate", json!({})))
        .await;

    assert_eq!(response.error_kind, Some(ErrorKind::PolicyLoadFailure));
    assert!(response.error_message.unwrap().contains("database offline"));
    assert_eq!(handler.calls(), 0);

    recorder.flush().await;
    assert_eq!(sink.len(), 1);
    assert!(!sink.records()[0].success);
}

#[tokio::test]
async fn e2e_audit_count_matches_request_count() {
    let h = harness(vec![
        entry("codegen", Scripted::returning(json!(THOROUGH_ANSWER)), None),
        entry("leaky", Scripted::returning(json!("password = \"hunter2\"")), None),
        entry("slow", Scripted::slow(Duration::from_secs(5)), Some(Duration::from_millis(20))),
    ])
    .await;
    h.policies
        .put("alice", PolicyScope::Global, PolicyDocument::new("Never hardcode passwords"));

    let targets = ["codegen", "leaky", "slow", "missing"];
    let mut tasks = Vec::new();
    for i in 0..40 {
        let coordinator = Arc::clone(&h.coordinator);
        let handler_id = targets[i % targets.len()];
        let action = if i % 5 == 0 { "unknown" } else { "generate" };
        tasks.push(tokio::spawn(async move {
            coordinator
                .handle(InboundRequest::new("alice", handler_id, action, json!({ "n": i })))
                .await
        }));
    }

    let mut responses = Vec::new();
    for task in tasks {
        responses.push(task.await.unwrap());
    }
    assert_eq!(responses.len(), 40);
    assert!(responses.iter().any(|r| r.success));
    assert!(responses.iter().any(|r| r.is_blocked()));

    h.coordinator.audit().flush().await;
    assert_eq!(h.sink.len(), 40);
    let stats = h.coordinator.audit().stats();
    assert_eq!(stats.recorded, 40);
    assert_eq!(stats.persisted, 40);

    let records = h
        .coordinator
        .audit()
        .query("alice", &TimeWindow::all())
        .await;
    let summary = AuditSummary::from_records(&records);
    assert_eq!(summary.total, 40);
    assert_eq!(summary.succeeded + summary.blocked + summary.failed, 40);
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn e2e_audit_sink_outage_never_reaches_caller() {
    let h = harness(vec![entry(
        "codegen",
        Scripted::returning(json!(THOROUGH_ANSWER)),
        None,
    )])
    .await;
    h.sink.set_failing(true);

    for _ in 0..3 {
        let response = h
            .coordinator
            .handle(InboundRequest::new("alice", "codegen", "generate", json!({})))
            .await;
        assert!(response.success);
    }

    h.coordinator.audit().flush().await;
    assert_eq!(h.coordinator.audit().stats().buffered, 3);

    h.sink.set_failing(false);
    h.coordinator.audit().flush().await;
    assert_eq!(h.sink.len(), 3);
}

#[tokio::test]
async fn e2e_project_rules_apply_only_to_project() {
    let h = harness(vec![entry(
        "codegen",
        Scripted::returning(json!(THOROUGH_ANSWER)),
        None,
    )])
    .await;
    h.policies.put(
        "alice",
        PolicyScope::Project("legacy".to_string()),
        PolicyDocument::new("Never use toml"),
    );

    let global = h
        .coordinator
        .handle(InboundRequest::new("alice", "codegen", "generate", json!({})))
        .await;
    assert!(global.success);

    let scoped = h
        .coordinator
        .handle(
            InboundRequest::new("alice", "codegen", "generate", json!({})).with_project("legacy"),
        )
        .await;
    assert_eq!(scoped.error_kind, Some(ErrorKind::PolicyViolation));
}

#[tokio::test]
async fn e2e_jsonl_audit_trail() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(
        JsonlAuditSink::open(dir.path().join("audit.jsonl"))
            .await
            .unwrap(),
    );

    let mut builder = RegistryBuilder::new(RegistrySettings::default());
    builder
        .register("codegen", Scripted::returning(json!(THOROUGH_ANSWER)))
        .await
        .unwrap();
    let recorder = Arc::new(AuditRecorder::spawn(sink.clone(), &AuditSettings::default()));
    let coordinator = RequestCoordinator::new(
        builder.build(),
        Arc::new(InMemoryPolicyStore::new(Arc::new(PolicyCompiler::new()))),
        QualityValidator::default(),
        recorder.clone(),
    );

    for i in 0..3 {
        coordinator
            .handle(
                InboundRequest::new("bob", "codegen", "generate", json!({ "n": i }))
                    .with_request_id(format!("req-{}", i)),
            )
            .await;
    }
    recorder.shutdown().await;

    let ids: Vec<String> = sink
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.request_id)
        .collect();
    assert_eq!(ids, vec!["req-0", "req-1", "req-2"]);
}

#[tokio::test]
async fn e2e_short_neutral_answers_are_not_blocked() {
    for answer in [
        "Just return the parsed value.",
        "Always validate input before you call the parser.",
        "Merge the fix into master after tests pass.",
    ] {
        let h = harness(vec![entry("codegen", Scripted::returning(json!(answer)), None)]).await;
        let response = h
            .coordinator
            .handle(InboundRequest::new("alice", "codegen", "generate", json!({})))
            .await;

        assert!(response.success, "{} -> {:?}", answer, response);
        assert_ne!(response.error_kind, Some(ErrorKind::QualityHardFail));
    }
}

#[tokio::test]
async fn e2e_retried_request_ids_each_get_an_audit_row() {
    let sink = Arc::new(SqliteAuditSink::open_in_memory().unwrap());
    let recorder = Arc::new(AuditRecorder::spawn(sink.clone(), &AuditSettings::default()));

    let mut builder = RegistryBuilder::new(RegistrySettings::default());
    builder
        .register("codegen", Scripted::returning(json!(THOROUGH_ANSWER)))
        .await
        .unwrap();
    let coordinator = RequestCoordinator::new(
        builder.build(),
        Arc::new(InMemoryPolicyStore::new(Arc::new(PolicyCompiler::new()))),
        QualityValidator::default(),
        recorder.clone(),
    );

    for _ in 0..3 {
        let request = InboundRequest::new("alice", "codegen", "generate", json!({}))
            .with_request_id("retry-1");
        coordinator.handle(request).await;
    }
    recorder.flush().await;

    assert_eq!(sink.count().unwrap(), 3);
    assert_eq!(recorder.query("alice", &TimeWindow::all()).await.len(), 3);
    let stats = recorder.stats();
    assert_eq!(stats.recorded, 3);
    assert_eq!(stats.persisted, 3);
}
