// ============================================================================
// Sessions
// ============================================================================
//
// A session is the exclusive holder of one engine handle for one file. It is
// the unit of batching: every operation of a batch runs against the same open
// file, and the file is saved at most once, on commit.
//
// ============================================================================

pub mod batch;
pub mod manager;
pub mod reaper;
pub mod state;

pub use batch::BatchCoordinator;
pub use manager::{SessionManager, SessionSlot};
pub use reaper::{SessionReaper, spawn_session_reaper};
pub use state::{SessionKind, SessionState};

use crate::core::{HandleId, Result, SessionId, SheetError};
use crate::engine::{Engine, EngineFactory};
use crate::pool::{EngineHandle, InstancePool, ReleaseMode};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    pub path: PathBuf,
    pub state: SessionState,
    pub dirty: bool,
    pub handle: Option<HandleId>,
    pub operations: u64,
    pub opened_at: DateTime<Utc>,
    pub idle_ms: u64,
}

/// One file held open on one engine handle.
///
/// # Thread Safety
/// A session is driven by one task at a time; the `SessionManager` keeps
/// registered sessions behind a FIFO async mutex.
pub struct Session<E: Engine> {
    id: SessionId,
    kind: SessionKind,
    path: PathBuf,
    state: SessionState,
    dirty: bool,
    handle: Option<EngineHandle<E>>,
    operations: u64,
    opened_at: DateTime<Utc>,
    last_used: Instant,
}

impl<E: Engine> Session<E> {
    /// Acquire a handle for `path` and open the session.
    pub async fn begin<F>(pool: &InstancePool<F>, path: &Path, kind: SessionKind) -> Result<Self>
    where
        F: EngineFactory<Engine = E>,
    {
        let id = SessionId::new();
        debug!("Session {} opening '{}' ({})", id, path.display(), kind);

        let handle = pool.acquire(path).await?;
        let mut session = Self {
            id,
            kind,
            path: handle.path().to_path_buf(),
            state: SessionState::Opening,
            dirty: false,
            handle: Some(handle),
            operations: 0,
            opened_at: Utc::now(),
            last_used: Instant::now(),
        };
        session.transition(SessionState::Open);

        info!(
            "Session {} open on {} for '{}'",
            session.id,
            session.handle_id().map(|h| h.to_string()).unwrap_or_default(),
            session.path.display()
        );
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn operations(&self) -> u64 {
        self.operations
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(|h| h.id())
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            path: self.path.clone(),
            state: self.state,
            dirty: self.dirty,
            handle: self.handle_id(),
            operations: self.operations,
            opened_at: self.opened_at,
            idle_ms: self.idle_for().as_millis() as u64,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(SheetError::InvalidSessionState {
                id: self.id,
                state: self.state.to_string(),
                expected: SessionState::Open.to_string(),
            })
        }
    }

    /// Run one engine call within `limit`.
    ///
    /// Mutating calls mark the session dirty before running, since a failed
    /// mutation may have been partially applied. A timeout or engine failure
    /// faults the session.
    pub async fn run<T, Func>(
        &mut self,
        operation: &str,
        mutates: bool,
        limit: Duration,
        f: Func,
    ) -> Result<T>
    where
        T: Send + 'static,
        Func: FnOnce(&mut E) -> Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        let handle = self.handle.as_ref().ok_or_else(|| SheetError::InvalidSessionState {
            id: self.id,
            state: "without handle".into(),
            expected: SessionState::Open.to_string(),
        })?;

        if mutates {
            self.dirty = true;
        }

        let result = handle.invoke(operation, limit, f).await;
        self.operations += 1;
        self.last_used = Instant::now();

        if let Err(err) = &result {
            if err.is_engine_fault() || handle.is_faulted() {
                warn!("Session {} faulted during '{}': {}", self.id, operation, err);
                handle.mark_faulted();
                self.transition(SessionState::Faulted);
            }
        }
        result
    }

    /// Fire the kill switch of the session's engine. The session is faulted.
    pub fn terminate_handle(&mut self) -> bool {
        let fired = self.handle.as_ref().is_some_and(|h| h.terminate_now());
        if !self.state.is_terminal() {
            self.state = SessionState::Faulted;
        }
        fired
    }

    /// Finish the session.
    ///
    /// With `save` the file is persisted if it has unsaved changes and the
    /// handle returns to the pool still bound to it. Without `save` a dirty
    /// file is closed unsaved so the discarded edits never reach a later
    /// session. A save that fails on its own leaves the session open for a
    /// retry or an abort; a save that times out faults the session.
    pub async fn commit<F>(
        &mut self,
        pool: &InstancePool<F>,
        save: bool,
        save_timeout: Duration,
    ) -> Result<()>
    where
        F: EngineFactory<Engine = E>,
    {
        self.ensure_open()?;
        self.transition(SessionState::Committing);

        if save && self.dirty {
            let Some(handle) = self.handle.as_ref() else {
                self.transition(SessionState::Faulted);
                return Err(SheetError::InvalidSessionState {
                    id: self.id,
                    state: "without handle".into(),
                    expected: SessionState::Open.to_string(),
                });
            };

            match handle
                .invoke("save", save_timeout, |engine: &mut E| engine.save())
                .await
            {
                Ok(()) => {
                    self.dirty = false;
                }
                Err(err) if err.is_engine_fault() || handle.is_faulted() => {
                    error!(
                        "Session {} failed to save '{}': {}; evicting its handle",
                        self.id,
                        self.path.display(),
                        err
                    );
                    self.transition(SessionState::Faulted);
                    self.give_back(pool, ReleaseMode::Evict).await;
                    self.transition(SessionState::Closed);
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "Session {} failed to save '{}': {}",
                        self.id,
                        self.path.display(),
                        err
                    );
                    self.transition(SessionState::Open);
                    return Err(err);
                }
            }
        }

        let mode = if self.dirty {
            ReleaseMode::Unbind
        } else {
            ReleaseMode::Keep
        };
        self.give_back(pool, mode).await;
        self.dirty = false;
        self.transition(SessionState::Closed);

        info!(
            "Session {} committed '{}' after {} operation(s) (saved: {})",
            self.id,
            self.path.display(),
            self.operations,
            save
        );
        Ok(())
    }

    /// Give up the session without saving.
    ///
    /// A clean handle goes back warm. A dirty or faulted one is evicted, since
    /// unsaved edits cannot be rolled back in the engine.
    pub async fn abort<F>(&mut self, pool: &InstancePool<F>)
    where
        F: EngineFactory<Engine = E>,
    {
        if self.state == SessionState::Closed {
            return;
        }

        let faulted = self.state == SessionState::Faulted
            || self.handle.as_ref().is_some_and(|h| h.is_faulted());
        let mode = if faulted || self.dirty {
            ReleaseMode::Evict
        } else {
            ReleaseMode::Keep
        };

        if self.dirty {
            warn!(
                "Session {} aborted with unsaved changes to '{}'; discarding its handle",
                self.id,
                self.path.display()
            );
        } else {
            debug!("Session {} aborted", self.id);
        }

        self.give_back(pool, mode).await;
        self.dirty = false;
        self.state = SessionState::Closed;
    }

    async fn give_back<F>(&mut self, pool: &InstancePool<F>, mode: ReleaseMode)
    where
        F: EngineFactory<Engine = E>,
    {
        if let Some(handle) = self.handle.take() {
            pool.release_with(handle, mode).await;
        }
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if self.dirty {
            error!(
                "Session {} dropped with unsaved changes to '{}'; the changes are lost",
                self.id,
                self.path.display()
            );
        } else {
            warn!("Session {} dropped without commit or abort", self.id);
        }
        // The handle's own drop returns its slot and destroys the engine.
        if let Some(handle) = self.handle.take() {
            handle.mark_faulted();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::workbook::{CellValue, Workbook, WorkbookEngine, WorkbookFactory};
    use crate::pool::PoolConfig;
    use std::sync::Arc;
    use tempfile::tempdir;

    const LIMIT: Duration = Duration::from_secs(5);

    async fn setup() -> (tempfile::TempDir, PathBuf, InstancePool<WorkbookFactory>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        Workbook::create_file(&path).unwrap();
        let pool = InstancePool::new(Arc::new(WorkbookFactory::new()), PoolConfig::new())
            .await
            .unwrap();
        (dir, path, pool)
    }

    fn set_a1(engine: &mut WorkbookEngine) -> Result<()> {
        engine
            .workbook_mut()?
            .sheet_mut("Sheet1")?
            .set("A1".parse()?, Some(CellValue::Number(7.0)));
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_with_save_persists_and_keeps_handle_warm() {
        let (_dir, path, pool) = setup().await;
        let mut session = Session::begin(&pool, &path, SessionKind::Batch).await.unwrap();
        assert_eq!(session.state(), SessionState::Open);

        session.run("set", true, LIMIT, set_a1).await.unwrap();
        assert!(session.is_dirty());

        session.commit(&pool, true, LIMIT).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_dirty());

        let reloaded = Workbook::read_file(&path).unwrap();
        assert_eq!(
            reloaded.sheet("Sheet1").unwrap().get(&"A1".parse().unwrap()),
            Some(&CellValue::Number(7.0))
        );
        assert_eq!(pool.stats().idle_handles, 1);
    }

    #[tokio::test]
    async fn test_commit_without_save_discards_edits() {
        let (_dir, path, pool) = setup().await;
        let mut session = Session::begin(&pool, &path, SessionKind::Batch).await.unwrap();
        session.run("set", true, LIMIT, set_a1).await.unwrap();
        session.commit(&pool, false, LIMIT).await.unwrap();

        let mut next = Session::begin(&pool, &path, SessionKind::SingleShot)
            .await
            .unwrap();
        let value = next
            .run("get", false, LIMIT, |engine: &mut WorkbookEngine| {
                Ok(engine
                    .workbook()?
                    .sheet("Sheet1")?
                    .get(&"A1".parse()?)
                    .cloned())
            })
            .await
            .unwrap();
        assert_eq!(value, None);
        next.commit(&pool, false, LIMIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_rejected_after_commit() {
        let (_dir, path, pool) = setup().await;
        let mut session = Session::begin(&pool, &path, SessionKind::Batch).await.unwrap();
        session.commit(&pool, true, LIMIT).await.unwrap();

        let result = session.run("set", true, LIMIT, set_a1).await;
        assert!(matches!(result, Err(SheetError::InvalidSessionState { .. })));
    }

    #[tokio::test]
    async fn test_domain_error_keeps_session_open() {
        let (_dir, path, pool) = setup().await;
        let mut session = Session::begin(&pool, &path, SessionKind::Batch).await.unwrap();
        let result = session
            .run("get", false, LIMIT, |engine: &mut WorkbookEngine| {
                engine.workbook()?.sheet("Missing").map(|_| ())
            })
            .await;

        match result {
            Err(SheetError::Domain(message)) => assert_eq!(message, "Sheet 'Missing' not found"),
            other => panic!("expected domain error, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Open);
        session.abort(&pool).await;
        assert_eq!(pool.stats().evicted, 0);
    }

    #[tokio::test]
    async fn test_dirty_abort_evicts_handle() {
        let (_dir, path, pool) = setup().await;
        let mut session = Session::begin(&pool, &path, SessionKind::Batch).await.unwrap();
        session.run("set", true, LIMIT, set_a1).await.unwrap();
        session.abort(&pool).await;

        assert_eq!(session.state(), SessionState::Closed);
        let stats = pool.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.live_handles, 0);
    }

    #[tokio::test]
    async fn test_dropped_session_returns_its_slot() {
        let (_dir, path, pool) = setup().await;
        {
            let mut session = Session::begin(&pool, &path, SessionKind::Batch).await.unwrap();
            session.run("set", true, LIMIT, set_a1).await.unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.in_use_handles, 0);
        assert_eq!(stats.live_handles, 0);
    }
}
