use super::PoolShared;
use crate::core::{HandleId, HandleState, Result, SheetError};
use crate::engine::{Engine, EngineWorker};
use log::warn;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bookkeeping the pool keeps for every handle.
#[derive(Debug, Clone)]
pub(crate) struct HandleMeta {
    pub(crate) id: HandleId,
    pub(crate) bound_path: Option<PathBuf>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) use_count: u64,
}

impl HandleMeta {
    pub(crate) fn new(id: HandleId) -> Self {
        let now = Instant::now();
        Self {
            id,
            bound_path: None,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    pub(crate) fn info(&self, state: HandleState) -> HandleInfo {
        HandleInfo {
            id: self.id,
            state,
            bound_path: self.bound_path.clone(),
            use_count: self.use_count,
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: self.last_used.elapsed().as_millis() as u64,
        }
    }
}

/// Point-in-time view of one pooled handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub state: HandleState,
    pub bound_path: Option<PathBuf>,
    pub use_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
}

/// How a checked-out handle goes back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Back to idle with the file still open, for warm reuse.
    Keep,
    /// Close the file without saving, then back to idle as a generic handle.
    Unbind,
    /// Destroy the handle.
    Evict,
}

/// A handle checked out of the pool, bound to one open file.
///
/// Ownership is exclusive: while it exists no other caller can acquire a
/// handle for the same path. Hand it back with `InstancePool::release`.
/// Dropping it instead destroys the engine without saving.
pub struct EngineHandle<E: Engine> {
    pub(crate) worker: Option<EngineWorker<E>>,
    pub(crate) meta: HandleMeta,
    pub(crate) path: PathBuf,
    pub(crate) pool: Arc<PoolShared<E>>,
}

impl<E: Engine> EngineHandle<E> {
    pub(crate) fn new(
        worker: EngineWorker<E>,
        meta: HandleMeta,
        path: PathBuf,
        pool: Arc<PoolShared<E>>,
    ) -> Self {
        Self {
            worker: Some(worker),
            meta,
            path,
            pool,
        }
    }

    pub fn id(&self) -> HandleId {
        self.meta.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of checkouts including this one.
    pub fn use_count(&self) -> u64 {
        self.meta.use_count
    }

    pub fn state(&self) -> HandleState {
        if self.is_faulted() {
            HandleState::Faulted
        } else {
            HandleState::InUse
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_faulted())
    }

    pub fn mark_faulted(&self) {
        if let Some(worker) = &self.worker {
            worker.mark_faulted();
        }
    }

    /// Fire the engine kill switch. The handle stays faulted.
    pub fn terminate_now(&self) -> bool {
        match &self.worker {
            Some(worker) => {
                worker.mark_faulted();
                worker.terminate_now()
            }
            None => false,
        }
    }

    /// Run one blocking engine call with a deadline.
    ///
    /// A missed deadline is reported as `OperationTimeout` for `operation` and
    /// leaves the handle faulted.
    pub async fn invoke<T, Func>(&self, operation: &str, limit: Duration, f: Func) -> Result<T>
    where
        T: Send + 'static,
        Func: FnOnce(&mut E) -> Result<T> + Send + 'static,
    {
        let worker = self.worker.as_ref().ok_or_else(|| SheetError::EngineFault {
            handle: self.meta.id,
            reason: "handle already released".into(),
        })?;

        match worker.invoke(limit, f).await {
            Ok(result) => result,
            Err(_) => Err(SheetError::OperationTimeout {
                operation: operation.to_string(),
                limit_ms: limit.as_millis() as u64,
            }),
        }
    }
}

impl<E: Engine> Drop for EngineHandle<E> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            warn!(
                "{} for '{}' dropped without release; destroying it",
                self.meta.id,
                self.path.display()
            );
            self.pool.forget(self.meta.id, &self.path);
            drop(worker);
        }
    }
}
