//! Capability Registry - startup registration and fault-isolated dispatch
//!
//! Handlers are registered once through a [`RegistryBuilder`], which runs each
//! handler's `initialize()` and fixes its [`HandlerHealth`]. The resulting
//! [`CapabilityRegistry`] is immutable and cheap to clone, so concurrent
//! `route()` calls share it without locking.
//!
//! Every invocation runs on its own task under a timeout. Handler errors,
//! panics and timeouts come back as a [`RouteError`] value; nothing a handler
//! does can unwind through `route()`.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::RegistrySettings;
use crate::error::{ErrorKind, RegistrationError};

/// Failure reported by handler code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// A pluggable execution unit
///
/// The declared actions and capability tags are read once at registration and
/// never again.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Actions this handler accepts; the first one is its primary action
    fn declared_actions(&self) -> Vec<String>;

    /// Capability tags used by capability-based routing
    fn declared_capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// One-time startup hook. An error marks the handler `FAILED`.
    async fn initialize(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn invoke(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Health fixed at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerHealth {
    Ready,
    Failed { reason: String },
}

impl HandlerHealth {
    pub fn is_ready(&self) -> bool {
        matches!(self, HandlerHealth::Ready)
    }
}

impl fmt::Display for HandlerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerHealth::Ready => f.write_str("READY"),
            HandlerHealth::Failed { reason } => write!(f, "FAILED[{}]", reason),
        }
    }
}

/// Per-handler registration options
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Overrides the registry's default per-call budget
    pub timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Public description of a registered handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub id: String,
    pub health: HandlerHealth,
    pub actions: Vec<String>,
    pub capabilities: Vec<String>,
    pub timeout_ms: u64,
}

/// Successful handler invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub handler_id: String,
    pub action: String,
    pub value: serde_json::Value,
    pub duration_ms: u64,
}

/// Structured routing failure
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteError {
    #[error("Handler {handler_id} is unavailable: {reason}")]
    Unavailable { handler_id: String, reason: String },

    #[error("Handler {handler_id} does not support action {action}")]
    UnsupportedAction { handler_id: String, action: String },

    #[error("Handler {handler_id} timed out after {timeout_ms}ms")]
    Timeout { handler_id: String, timeout_ms: u64 },

    #[error("Handler {handler_id} failed: {message}")]
    ExecutionError { handler_id: String, message: String },

    #[error("No handler declares capability {capability}")]
    NotFound { capability: String },
}

impl RouteError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            RouteError::Unavailable { .. } => ErrorKind::HandlerUnavailable,
            RouteError::UnsupportedAction { .. } => ErrorKind::UnsupportedAction,
            RouteError::Timeout { .. } => ErrorKind::HandlerTimeout,
            RouteError::ExecutionError { .. } => ErrorKind::HandlerExecutionError,
            RouteError::NotFound { .. } => ErrorKind::CapabilityNotFound,
        }
    }
}

struct RegisteredHandler {
    id: String,
    handler: Arc<dyn CapabilityHandler>,
    health: HandlerHealth,
    actions: Vec<String>,
    capabilities: Vec<String>,
    timeout: Duration,
}

impl RegisteredHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            id: self.id.clone(),
            health: self.health.clone(),
            actions: self.actions.clone(),
            capabilities: self.capabilities.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

/// Startup-only registration
pub struct RegistryBuilder {
    settings: RegistrySettings,
    handlers: Vec<RegisteredHandler>,
}

impl RegistryBuilder {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            settings,
            handlers: Vec::new(),
        }
    }

    /// Register with the default timeout
    pub async fn register(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<HandlerHealth, RegistrationError> {
        self.register_with(id, handler, HandlerOptions::default())
            .await
    }

    /// Validate the manifest, run `initialize()` and record the resulting health.
    ///
    /// A manifest problem rejects the registration. An initialization error,
    /// panic or timeout still registers the handler, as `FAILED`.
    pub async fn register_with(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
        options: HandlerOptions,
    ) -> Result<HandlerHealth, RegistrationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RegistrationError::BlankHandlerId);
        }
        if self.handlers.iter().any(|h| h.id == id) {
            return Err(RegistrationError::DuplicateHandler(id));
        }

        let actions = handler.declared_actions();
        validate_actions(&id, &actions)?;
        let capabilities = handler.declared_capabilities();

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.settings.default_timeout());

        // Bounded by the per-call budget so one stuck handler cannot stall startup
        let initialized =
            tokio::time::timeout(timeout, AssertUnwindSafe(handler.initialize()).catch_unwind())
                .await;
        let health = match initialized {
            Ok(Ok(Ok(()))) => HandlerHealth::Ready,
            Ok(Ok(Err(e))) => HandlerHealth::Failed { reason: e.0 },
            Ok(Err(panic)) => HandlerHealth::Failed {
                reason: format!("initialize panicked: {}", panic_message(panic.as_ref())),
            },
            Err(_) => HandlerHealth::Failed {
                reason: "initialize timed out".to_string(),
            },
        };

        match &health {
            HandlerHealth::Ready => tracing::info!(
                "Handler registered: {} (actions: {:?}, capabilities: {:?})",
                id,
                actions,
                capabilities
            ),
            HandlerHealth::Failed { reason } => {
                tracing::warn!("Handler registered as FAILED: {} ({})", id, reason)
            }
        }

        self.handlers.push(RegisteredHandler {
            id,
            handler,
            health: health.clone(),
            actions,
            capabilities,
            timeout,
        });

        Ok(health)
    }

    pub fn build(self) -> CapabilityRegistry {
        let index = self
            .handlers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.id.clone(), i))
            .collect();

        tracing::info!("Capability registry built with {} handlers", self.handlers.len());

        CapabilityRegistry {
            inner: Arc::new(RegistryInner {
                handlers: self.handlers,
                index,
            }),
        }
    }
}

struct RegistryInner {
    /// Registration order
    handlers: Vec<RegisteredHandler>,
    index: HashMap<String, usize>,
}

/// Immutable handler table shared by every request
#[derive(Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn builder(settings: RegistrySettings) -> RegistryBuilder {
        RegistryBuilder::new(settings)
    }

    pub fn len(&self) -> usize {
        self.inner.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.handlers.is_empty()
    }

    pub fn health(&self, handler_id: &str) -> Option<&HandlerHealth> {
        self.get(handler_id).map(|h| &h.health)
    }

    /// Handlers in registration order
    pub fn handlers(&self) -> Vec<HandlerInfo> {
        self.inner.handlers.iter().map(RegisteredHandler::info).collect()
    }

    /// First handler, in registration order, declaring `capability`
    pub fn resolve_capability(&self, capability: &str) -> Option<&str> {
        self.inner
            .handlers
            .iter()
            .find(|h| h.capabilities.iter().any(|c| c == capability))
            .map(|h| h.id.as_str())
    }

    fn get(&self, handler_id: &str) -> Option<&RegisteredHandler> {
        self.inner
            .index
            .get(handler_id)
            .map(|&i| &self.inner.handlers[i])
    }

    /// Invoke `action` on `handler_id`
    pub async fn route(
        &self,
        handler_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, RouteError> {
        let entry = match self.get(handler_id) {
            Some(entry) => entry,
            None => {
                return Err(RouteError::Unavailable {
                    handler_id: handler_id.to_string(),
                    reason: "not registered".to_string(),
                })
            }
        };

        if let HandlerHealth::Failed { reason } = &entry.health {
            return Err(RouteError::Unavailable {
                handler_id: handler_id.to_string(),
                reason: reason.clone(),
            });
        }

        if !entry.actions.iter().any(|a| a == action) {
            return Err(RouteError::UnsupportedAction {
                handler_id: handler_id.to_string(),
                action: action.to_string(),
            });
        }

        tracing::debug!("Routing {}::{}", handler_id, action);
        invoke(entry, action, payload).await
    }

    /// Route to the first handler declaring `capability`, using its primary action
    pub async fn route_by_capability(
        &self,
        capability: &str,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, RouteError> {
        let entry = self
            .inner
            .handlers
            .iter()
            .find(|h| h.capabilities.iter().any(|c| c == capability))
            .ok_or_else(|| RouteError::NotFound {
                capability: capability.to_string(),
            })?;

        // Manifests are validated non-empty at registration
        let action = entry.actions[0].clone();
        self.route(&entry.id, &action, payload).await
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("handlers", &self.handlers())
            .finish()
    }
}

async fn invoke(
    entry: &RegisteredHandler,
    action: &str,
    payload: serde_json::Value,
) -> Result<HandlerOutput, RouteError> {
    let handler = Arc::clone(&entry.handler);
    let owned_action = action.to_string();
    let started = Instant::now();

    let mut task = tokio::spawn(async move { handler.invoke(&owned_action, payload).await });

    match tokio::time::timeout(entry.timeout, &mut task).await {
        Ok(Ok(Ok(value))) => Ok(HandlerOutput {
            handler_id: entry.id.clone(),
            action: action.to_string(),
            value,
            duration_ms: started.elapsed().as_millis() as u64,
        }),
        Ok(Ok(Err(e))) => {
            tracing::warn!("Handler {} failed on {}: {}", entry.id, action, e);
            Err(RouteError::ExecutionError {
                handler_id: entry.id.clone(),
                message: e.0,
            })
        }
        Ok(Err(join_error)) => {
            let message = if join_error.is_panic() {
                format!("handler panicked: {}", panic_message(join_error.into_panic().as_ref()))
            } else {
                "handler task cancelled".to_string()
            };
            tracing::warn!("Handler {} aborted on {}: {}", entry.id, action, message);
            Err(RouteError::ExecutionError {
                handler_id: entry.id.clone(),
                message,
            })
        }
        Err(_) => {
            task.abort();
            tracing::warn!(
                "Handler {} timed out on {} after {:?}",
                entry.id,
                action,
                entry.timeout
            );
            Err(RouteError::Timeout {
                handler_id: entry.id.clone(),
                timeout_ms: entry.timeout.as_millis() as u64,
            })
        }
    }
}

fn validate_actions(handler_id: &str, actions: &[String]) -> Result<(), RegistrationError> {
    if actions.is_empty() {
        return Err(RegistrationError::NoDeclaredActions(handler_id.to_string()));
    }

    let mut seen = HashSet::new();
    for action in actions {
        if action.trim().is_empty() {
            return Err(RegistrationError::BlankAction {
                handler_id: handler_id.to_string(),
            });
        }
        if !seen.insert(action.as_str()) {
            return Err(RegistrationError::DuplicateAction {
                handler_id: handler_id.to_string(),
                action: action.clone(),
            });
        }
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        actions: Vec<String>,
        capabilities: Vec<String>,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(actions: &[&str], capabilities: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                actions: actions.iter().map(|s| s.to_string()).collect(),
                capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CapabilityHandler for Echo {
        fn declared_actions(&self) -> Vec<String> {
            self.actions.clone()
        }

        fn declared_capabilities(&self) -> Vec<String> {
            self.capabilities.clone()
        }

        async fn invoke(
            &self,
            action: &str,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match action {
                "fail" => Err(HandlerError::new("boom")),
                "panic" => panic!("handler exploded"),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }
                _ => Ok(json!({ "action": action, "payload": payload })),
            }
        }
    }

    struct BrokenInit;

    #[async_trait]
    impl CapabilityHandler for BrokenInit {
        fn declared_actions(&self) -> Vec<String> {
            vec!["run".to_string()]
        }

        fn declared_capabilities(&self) -> Vec<String> {
            vec!["code".to_string()]
        }

        async fn initialize(&self) -> Result<(), HandlerError> {
            Err(HandlerError::new("model weights missing"))
        }

        async fn invoke(
            &self,
            _action: &str,
            _payload: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(json!(null))
        }
    }

    struct PanickingInit;

    #[async_trait]
    impl CapabilityHandler for PanickingInit {
        fn declared_actions(&self) -> Vec<String> {
            vec!["run".to_string()]
        }

        async fn initialize(&self) -> Result<(), HandlerError> {
            panic!("init exploded")
        }

        async fn invoke(
            &self,
            _action: &str,
            _payload: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(json!(null))
        }
    }

    struct HangingInit;

    #[async_trait]
    impl CapabilityHandler for HangingInit {
        fn declared_actions(&self) -> Vec<String> {
            vec!["run".to_string()]
        }

        async fn initialize(&self) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn invoke(
            &self,
            _action: &str,
            _payload: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn test_route_success() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder
            .register("echo", Echo::new(&["say"], &[]))
            .await
            .unwrap();
        let registry = builder.build();

        let output = registry.route("echo", "say", json!(1)).await.unwrap();
        assert_eq!(output.handler_id, "echo");
        assert_eq!(output.value["payload"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_handler_and_action() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder
            .register("echo", Echo::new(&["say"], &[]))
            .await
            .unwrap();
        let registry = builder.build();

        let err = registry.route("ghost", "say", json!(null)).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::HandlerUnavailable);

        let err = registry.route("echo", "shout", json!(null)).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::UnsupportedAction);
    }

    #[tokio::test]
    async fn test_failed_initialization_is_unavailable() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        let health = builder.register("broken", Arc::new(BrokenInit)).await.unwrap();
        assert_eq!(
            health,
            HandlerHealth::Failed {
                reason: "model weights missing".to_string()
            }
        );

        let health = builder
            .register("panicky", Arc::new(PanickingInit))
            .await
            .unwrap();
        assert!(health.to_string().starts_with("FAILED[initialize panicked"));

        let registry = builder.build();
        let err = registry.route("broken", "run", json!(null)).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::HandlerUnavailable);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_hanging_initialization_times_out() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        let started = std::time::Instant::now();
        let health = builder
            .register_with(
                "stuck",
                Arc::new(HangingInit),
                HandlerOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(health.to_string(), "FAILED[initialize timed out]");

        let registry = builder.build();
        let err = registry.route("stuck", "run", json!(null)).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::HandlerUnavailable);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_contained() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder
            .register("echo", Echo::new(&["fail", "panic"], &[]))
            .await
            .unwrap();
        let registry = builder.build();

        let err = registry.route("echo", "fail", json!(null)).await.unwrap_err();
        assert_eq!(
            err,
            RouteError::ExecutionError {
                handler_id: "echo".to_string(),
                message: "boom".to_string()
            }
        );

        let err = registry.route("echo", "panic", json!(null)).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::HandlerExecutionError);
        assert!(err.to_string().contains("handler exploded"));

        // Health is untouched by runtime failures
        assert_eq!(registry.health("echo"), Some(&HandlerHealth::Ready));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder
            .register_with(
                "slow",
                Echo::new(&["sleep"], &[]),
                HandlerOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        let registry = builder.build();

        let err = registry.route("slow", "sleep", json!(null)).await.unwrap_err();
        assert_eq!(
            err,
            RouteError::Timeout {
                handler_id: "slow".to_string(),
                timeout_ms: 20
            }
        );
    }

    #[tokio::test]
    async fn test_manifest_validation() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder.register("a", Echo::new(&["x"], &[])).await.unwrap();

        assert_eq!(
            builder.register("a", Echo::new(&["x"], &[])).await.unwrap_err(),
            RegistrationError::DuplicateHandler("a".to_string())
        );
        assert_eq!(
            builder.register(" ", Echo::new(&["x"], &[])).await.unwrap_err(),
            RegistrationError::BlankHandlerId
        );
        assert!(matches!(
            builder.register("b", Echo::new(&[], &[])).await.unwrap_err(),
            RegistrationError::NoDeclaredActions(_)
        ));
        assert!(matches!(
            builder.register("c", Echo::new(&["x", ""], &[])).await.unwrap_err(),
            RegistrationError::BlankAction { .. }
        ));
        assert!(matches!(
            builder.register("d", Echo::new(&["x", "x"], &[])).await.unwrap_err(),
            RegistrationError::DuplicateAction { .. }
        ));
        assert_eq!(builder.build().len(), 1);
    }

    #[tokio::test]
    async fn test_route_by_capability_prefers_first_registered() {
        let first = Echo::new(&["generate", "review"], &["code"]);
        let second = Echo::new(&["write"], &["code", "docs"]);

        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder.register("h1", first.clone()).await.unwrap();
        builder.register("h2", second.clone()).await.unwrap();
        let registry = builder.build();

        for _ in 0..5 {
            let output = registry.route_by_capability("code", json!({})).await.unwrap();
            assert_eq!(output.handler_id, "h1");
            assert_eq!(output.action, "generate");
        }
        assert_eq!(first.calls.load(Ordering::SeqCst), 5);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);

        assert_eq!(registry.resolve_capability("docs"), Some("h2"));
        let err = registry
            .route_by_capability("video", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::CapabilityNotFound);
    }

    #[tokio::test]
    async fn test_route_by_capability_does_not_skip_failed_first_match() {
        let healthy = Echo::new(&["generate"], &["code"]);

        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder.register("broken", Arc::new(BrokenInit)).await.unwrap();
        builder.register("healthy", healthy.clone()).await.unwrap();
        let registry = builder.build();

        assert_eq!(registry.resolve_capability("code"), Some("broken"));
        let err = registry
            .route_by_capability("code", json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RouteError::Unavailable {
                handler_id: "broken".to_string(),
                reason: "model weights missing".to_string()
            }
        );
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handlers_listed_in_registration_order() {
        let mut builder = RegistryBuilder::new(RegistrySettings::default());
        builder.register("z", Echo::new(&["x"], &[])).await.unwrap();
        builder.register("a", Echo::new(&["y"], &["t"])).await.unwrap();
        let registry = builder.build();

        let ids: Vec<String> = registry.handlers().into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["z", "a"]);
        assert_eq!(registry.handlers()[0].timeout_ms, 30_000);
    }
}
