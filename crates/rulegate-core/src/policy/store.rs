//! Policy store boundary and reference implementations
//!
//! The pipeline only sees [`PolicyStore::get`]. Persistence and cache
//! invalidation belong to the store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::compiler::PolicyCompiler;
use super::{PolicyScope, PolicySet, Rule};
use crate::error::PolicyStoreError;
use crate::types::digest_bytes;

/// Lookup of the effective policy set for a subject and optional project
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// `Ok(None)` means the subject has no active rules
    async fn get(
        &self,
        subject_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<PolicySet>, PolicyStoreError>;
}

#[async_trait]
impl<T: PolicyStore + ?Sized> PolicyStore for Arc<T> {
    async fn get(
        &self,
        subject_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<PolicySet>, PolicyStoreError> {
        (**self).get(subject_id, project_id).await
    }
}

/// Raw rule text for one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub raw_text: String,
    pub version: u64,
    pub active: bool,
}

impl PolicyDocument {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            version: 1,
            active: true,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// In-process store compiling documents through a shared cached compiler
pub struct InMemoryPolicyStore {
    documents: RwLock<HashMap<(String, PolicyScope), PolicyDocument>>,
    compiler: Arc<PolicyCompiler>,
}

impl InMemoryPolicyStore {
    pub fn new(compiler: Arc<PolicyCompiler>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            compiler,
        }
    }

    /// Insert or replace the document for a scope
    pub fn put(&self, subject_id: impl Into<String>, scope: PolicyScope, document: PolicyDocument) {
        let subject_id = subject_id.into();
        tracing::info!(
            "Policy document stored for {} ({:?}, v{})",
            subject_id,
            scope,
            document.version
        );
        self.documents.write().insert((subject_id, scope), document);
    }

    pub fn remove(&self, subject_id: &str, scope: &PolicyScope) -> Option<PolicyDocument> {
        self.documents
            .write()
            .remove(&(subject_id.to_string(), scope.clone()))
    }

    fn active_document(&self, subject_id: &str, scope: PolicyScope) -> Option<PolicyDocument> {
        self.documents
            .read()
            .get(&(subject_id.to_string(), scope))
            .filter(|doc| doc.active)
            .cloned()
    }

    /// Project rules first, then global rules not already present
    fn merge(
        &self,
        subject_id: &str,
        project: Option<(String, PolicyDocument)>,
        global: Option<PolicyDocument>,
    ) -> PolicySet {
        let mut rules: Vec<Rule> = Vec::new();
        let mut seen = HashSet::new();
        let mut digests = Vec::new();

        let project_id = project.as_ref().map(|(id, _)| id.clone());
        let version = project
            .as_ref()
            .map(|(_, doc)| doc.version)
            .or_else(|| global.as_ref().map(|doc| doc.version))
            .unwrap_or(0);

        let sources = project.map(|(_, doc)| doc).into_iter().chain(global);
        for document in sources {
            let compiled = self.compiler.compile_cached(&document.raw_text);
            digests.push(compiled.source_digest.clone());
            for rule in &compiled.rules {
                if !seen.insert(rule.raw_text.to_lowercase()) {
                    continue;
                }
                let mut rule = rule.clone();
                rule.ordinal = rules.len();
                rules.push(rule);
            }
        }

        PolicySet {
            subject_id: subject_id.to_string(),
            project_id,
            version,
            active: true,
            rules,
            source_digest: digest_bytes(digests.join(":").as_bytes()),
        }
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(
        &self,
        subject_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<PolicySet>, PolicyStoreError> {
        let project = project_id.and_then(|id| {
            self.active_document(subject_id, PolicyScope::Project(id.to_string()))
                .map(|doc| (id.to_string(), doc))
        });
        let global = self.active_document(subject_id, PolicyScope::Global);

        if project.is_none() && global.is_none() {
            return Ok(None);
        }
        Ok(Some(self.merge(subject_id, project, global)))
    }
}

type CacheKey = (String, Option<String>);

/// TTL cache in front of another store. Errors are never cached.
pub struct CachingPolicyStore<S> {
    inner: S,
    ttl: Duration,
    entries: DashMap<CacheKey, (Instant, Option<PolicySet>)>,
}

impl<S: PolicyStore> CachingPolicyStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Drop every cached entry for a subject
    pub fn invalidate(&self, subject_id: &str) {
        self.entries.retain(|key, _| key.0 != subject_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: PolicyStore> PolicyStore for CachingPolicyStore<S> {
    async fn get(
        &self,
        subject_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<PolicySet>, PolicyStoreError> {
        let key = (subject_id.to_string(), project_id.map(str::to_string));

        if let Some(entry) = self.entries.get(&key) {
            let (cached_at, set) = entry.value();
            if cached_at.elapsed() < self.ttl {
                return Ok(set.clone());
            }
        }

        let fresh = self.inner.get(subject_id, project_id).await?;
        self.entries.insert(key, (Instant::now(), fresh.clone()));
        Ok(fresh)
    }
}
