//! Lock scopes and access modes.
//!
//! Two scopes exist: the per-project source tree (a readers/writer lock keyed
//! by project name) and the global worker classes (counting locks with a cap
//! per class). Both are acquired through the same keyed abstraction.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named pool of compute capacity with its own concurrency cap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    Fetcher,
    Builder,
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerClass::Fetcher => write!(f, "fetcher"),
            WorkerClass::Builder => write!(f, "builder"),
        }
    }
}

/// Resource a lock is keyed on.
///
/// The derived ordering (worker classes before source trees) is the canonical
/// acquisition order.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(tag = "scope", content = "key", rename_all = "snake_case")]
pub enum LockScope {
    Worker(WorkerClass),
    Source(String),
}

impl LockScope {
    pub fn source(project: impl Into<String>) -> Self {
        LockScope::Source(project.into())
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Worker(class) => write!(f, "worker-{class}"),
            LockScope::Source(project) => write!(f, "src-{project}"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Sole holder of the scope.
    Exclusive,
    /// One of up to `cap` concurrent holders.
    Counting,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct LockRequest {
    pub scope: LockScope,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn exclusive(scope: LockScope) -> Self {
        Self {
            scope,
            mode: LockMode::Exclusive,
        }
    }

    pub fn counting(scope: LockScope) -> Self {
        Self {
            scope,
            mode: LockMode::Counting,
        }
    }
}

impl fmt::Display for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            LockMode::Exclusive => "exclusive",
            LockMode::Counting => "counting",
        };
        write!(f, "{}:{}", self.scope, mode)
    }
}
