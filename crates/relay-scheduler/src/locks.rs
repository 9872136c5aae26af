//! Keyed exclusive/counting locks.
//!
//! Every scope is one semaphore sized to the scope's cap. A counting holder
//! takes one permit; an exclusive holder takes all of them, so the two modes
//! exclude each other by construction. Tokio semaphores are fair, so a queued
//! exclusive request is not starved by a stream of counting ones.
//!
//! There is no unlock call: a [`LockGuard`] releases its scope when dropped,
//! whether the owning action finished, failed or unwound.
//!
//! Semaphores only order holders inside one process. With a lock directory
//! configured, source-tree scopes are also backed by an advisory file lock
//! (shared for counting holders, exclusive otherwise), so a second process
//! working in the same data directory, such as a forced build, is excluded
//! as well.

use chrono::Utc;
use relay_core::events::{Event, LockPayload};
use relay_core::ids::BuildId;
use relay_core::lock::{LockMode, LockRequest, LockScope};
use relay_core::ports::EventSink;
use relay_core::settings::WorkerCaps;
use relay_core::{Error, Result};
use fs4::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Cap of a source-tree scope in counting mode.
pub const SOURCE_READERS: u32 = 1 << 28;

/// Identity of whoever holds a lock.
#[derive(Debug, Clone)]
pub struct LockHolder {
    pub name: String,
    pub build_id: Option<BuildId>,
}

impl LockHolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            build_id: None,
        }
    }

    pub fn with_build(mut self, build_id: BuildId) -> Self {
        self.build_id = Some(build_id);
        self
    }
}

/// Scoped lock handle; the scope is released on drop.
pub struct LockGuard {
    holder: LockHolder,
    request: LockRequest,
    sink: Option<Arc<dyn EventSink>>,
    _file: Option<File>,
    _permit: OwnedSemaphorePermit,
}

impl LockGuard {
    pub fn request(&self) -> &LockRequest {
        &self.request
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("holder", &self.holder.name)
            .field("request", &self.request)
            .finish()
    }
}

impl Drop for LockGuard {
    // Runs before the file and permit fields are dropped, so the release is
    // reported while the scope is still held.
    fn drop(&mut self) {
        debug!(
            holder = %self.holder.name,
            scope = %self.request.scope,
            mode = ?self.request.mode,
            "Lock released"
        );
        if let Some(sink) = &self.sink {
            sink.emit(Event::LockReleased(payload(&self.holder, &self.request)));
        }
    }
}

fn payload(holder: &LockHolder, request: &LockRequest) -> LockPayload {
    LockPayload {
        holder: holder.name.clone(),
        build_id: holder.build_id,
        scope: request.scope.clone(),
        mode: request.mode,
        at: Utc::now(),
    }
}

/// Open (creating it if needed) and lock `path`, blocking on a worker thread.
///
/// The lock lasts until the returned file is closed.
pub(crate) async fn lock_file(path: PathBuf, mode: LockMode) -> std::io::Result<File> {
    tokio::task::spawn_blocking(move || -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        match mode {
            LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
            LockMode::Counting => FileExt::lock_shared(&file)?,
        }
        Ok(file)
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Lock table shared by every build target of the process.
pub struct LockManager {
    caps: WorkerCaps,
    scopes: Mutex<HashMap<LockScope, Arc<Semaphore>>>,
    sink: Option<Arc<dyn EventSink>>,
    lock_dir: Option<PathBuf>,
}

impl LockManager {
    pub fn new(caps: WorkerCaps) -> Self {
        Self {
            caps,
            scopes: Mutex::new(HashMap::new()),
            sink: None,
            lock_dir: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Back source-tree scopes with lock files under `dir`.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn cap(&self, scope: &LockScope) -> u32 {
        match scope {
            LockScope::Worker(class) => self.caps.cap(*class),
            LockScope::Source(_) => SOURCE_READERS,
        }
    }

    fn semaphore(&self, scope: &LockScope) -> Result<Arc<Semaphore>> {
        let mut scopes = self
            .scopes
            .lock()
            .map_err(|_| Error::Lock("lock table poisoned".to_string()))?;
        let cap = self.cap(scope);
        Ok(scopes
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(cap as usize)))
            .clone())
    }

    /// Block until the scope admits this request.
    ///
    /// Only fails if the lock table itself is broken; contention is never an error.
    pub async fn acquire(&self, holder: &LockHolder, request: &LockRequest) -> Result<LockGuard> {
        let semaphore = self.semaphore(&request.scope)?;
        let permits = match request.mode {
            LockMode::Exclusive => self.cap(&request.scope),
            LockMode::Counting => 1,
        };

        debug!(
            holder = %holder.name,
            scope = %request.scope,
            mode = ?request.mode,
            "Waiting for lock"
        );
        let permit = semaphore
            .acquire_many_owned(permits)
            .await
            .map_err(|e| Error::Lock(e.to_string()))?;
        let file = match (&self.lock_dir, &request.scope) {
            (Some(dir), LockScope::Source(_)) => {
                let path = dir.join(format!("{}.lock", request.scope));
                let file = lock_file(path.clone(), request.mode).await.map_err(|e| {
                    Error::Lock(format!("Failed to lock {}: {}", path.display(), e))
                })?;
                Some(file)
            }
            _ => None,
        };
        debug!(
            holder = %holder.name,
            scope = %request.scope,
            mode = ?request.mode,
            "Lock acquired"
        );

        if let Some(sink) = &self.sink {
            sink.emit(Event::LockAcquired(payload(holder, request)));
        }

        Ok(LockGuard {
            holder: holder.clone(),
            request: request.clone(),
            sink: self.sink.clone(),
            _file: file,
            _permit: permit,
        })
    }

    /// Acquire a set of locks in canonical scope order.
    ///
    /// A scope requested in both modes is taken exclusively once.
    pub async fn acquire_all(
        &self,
        holder: &LockHolder,
        requests: &[LockRequest],
    ) -> Result<Vec<LockGuard>> {
        let mut ordered = requests.to_vec();
        ordered.sort();
        ordered.dedup_by(|later, kept| later.scope == kept.scope);

        let mut guards = Vec::with_capacity(ordered.len());
        for request in &ordered {
            guards.push(self.acquire(holder, request).await?);
        }
        Ok(guards)
    }

    /// Permits currently taken from a scope.
    pub fn in_use(&self, scope: &LockScope) -> u32 {
        let cap = self.cap(scope);
        self.scopes
            .lock()
            .ok()
            .and_then(|scopes| scopes.get(scope).map(|s| s.available_permits()))
            .map(|available| cap.saturating_sub(available as u32))
            .unwrap_or(0)
    }
}
