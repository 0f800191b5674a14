//! Rulegate Core - instruction-constrained capability orchestration
//!
//! Rulegate sits between a transport layer and a set of pluggable capability
//! handlers. For every inbound action it loads the caller's rules, dispatches
//! to a handler with fault isolation, scores and checks the result, and
//! leaves an audit record behind.
//!
//! # Architecture
//!
//! 1. **Policy** (`policy`): free-text rules compiled into typed, prioritized rules
//! 2. **Registry** (`registry`): startup-only handler registration and timed dispatch
//! 3. **Quality** (`quality`): deterministic quality / bias / confidence scoring
//! 4. **Compliance** (`policy::validator`): short-circuit rule evaluation over a result
//! 5. **Audit** (`audit`): non-blocking, append-only verdict trail
//! 6. **Coordinator** (`coordinator`): the per-request state machine tying them together
//!
//! # Quick Start
//!
//! ```
//! use rulegate_core::policy::{compiler, PolicySet, PolicyValidator, RuleCategory};
//!
//! let rules =
//!     compiler::compile("- No hardcoded secrets because leaks are costly\n- Avoid globals");
//! assert_eq!(rules.len(), 2);
//! assert_eq!(rules[0].category, RuleCategory::Security);
//!
//! let mut set = PolicySet::empty("alice", None);
//! set.rules = rules;
//!
//! let verdict = PolicyValidator::new().validate("let api_key = \"abc\";", &set);
//! assert!(!verdict.compliant);
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod policy;
pub mod quality;
pub mod registry;
pub mod types;

pub use audit::{AuditRecord, AuditRecorder, AuditSink, AuditStats, AuditSummary};
pub use config::RulegateConfig;
pub use coordinator::{
    CoordinatorBuilder, InboundRequest, PipelineResponse, PipelineStage, RequestCoordinator,
};
pub use error::{ErrorKind, Result, RulegateError};
pub use policy::{
    ComplianceVerdict, PolicyCompiler, PolicySet, PolicyStore, PolicyValidator, Rule,
    RuleCategory, RulePriority,
};
pub use quality::{QualityGate, QualityValidator, QualityVerdict};
pub use registry::{
    CapabilityHandler, CapabilityRegistry, HandlerError, HandlerHealth, RegistryBuilder,
    RouteError,
};
pub use types::{TimeWindow, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
