// ============================================================================
// Batch Coordinator
// ============================================================================
//
// Decides which session an operation runs in:
//
// - no batch id: a single-shot session is opened, the operation runs, and the
//   session is committed on success or aborted on failure;
// - a batch id: the operation runs in the registered session, which stays
//   open until `commit_batch` or `abort_batch`.
//
// Registered sessions are the only way a file stays open between calls.
//
// ============================================================================

use super::{Session, SessionInfo, SessionKind, SessionManager, SessionSlot, SessionState};
use crate::config::SessionPolicy;
use crate::core::{BatchId, Result, SessionId, SheetError};
use crate::engine::EngineFactory;
use crate::executor::{OperationContext, OperationExecutor};
use crate::pool::{InstancePool, normalize_path};
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;

pub struct BatchCoordinator<F: EngineFactory> {
    pool: Arc<InstancePool<F>>,
    sessions: SessionManager<F::Engine>,
    executor: OperationExecutor,
    policy: SessionPolicy,
}

impl<F: EngineFactory> BatchCoordinator<F> {
    pub fn new(pool: Arc<InstancePool<F>>, executor: OperationExecutor, policy: SessionPolicy) -> Self {
        Self {
            pool,
            sessions: SessionManager::new(),
            executor,
            policy,
        }
    }

    pub fn pool(&self) -> &Arc<InstancePool<F>> {
        &self.pool
    }

    pub fn executor(&self) -> &OperationExecutor {
        &self.executor
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn sessions(&self) -> &SessionManager<F::Engine> {
        &self.sessions
    }

    /// Open a batch on `path`. Operations passing the returned id share one
    /// open file until `commit_batch`.
    pub async fn begin_batch(&self, path: impl AsRef<Path>) -> Result<BatchId> {
        self.open(path.as_ref(), SessionKind::Batch).await
    }

    /// Open a session for an explicit open-file action.
    pub async fn open_session(&self, path: impl AsRef<Path>) -> Result<SessionId> {
        self.open(path.as_ref(), SessionKind::Interactive).await
    }

    async fn ensure_unclaimed(&self, path: &Path) -> Result<()> {
        match self.sessions.holder_of(path).await {
            Some(session) => Err(SheetError::FileInUse {
                path: path.to_path_buf(),
                session,
            }),
            None => Ok(()),
        }
    }

    async fn open(&self, path: &Path, kind: SessionKind) -> Result<SessionId> {
        let path = normalize_path(path)?;
        self.ensure_unclaimed(&path).await?;

        let session = Session::begin(&self.pool, &path, kind).await?;
        match self.sessions.register(session).await {
            Ok(slot) => Ok(slot.id()),
            Err((mut session, holder)) => {
                session.abort(&self.pool).await;
                Err(SheetError::FileInUse {
                    path,
                    session: holder,
                })
            }
        }
    }

    /// Run `op` in the batch `batch`, or in a single-shot session on `path`
    /// when `batch` is `None`.
    ///
    /// A single-shot session is committed with `save` after a successful
    /// operation and aborted after a failed one. `save` is ignored inside a
    /// batch, which is only committed by `commit_batch`.
    pub async fn with_batch<T, Op>(
        &self,
        batch: Option<BatchId>,
        path: impl AsRef<Path>,
        save: bool,
        ctx: &OperationContext,
        op: Op,
    ) -> Result<T>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Engine) -> Result<T> + Send + 'static,
    {
        let path = normalize_path(path.as_ref())?;
        match batch {
            Some(id) => {
                let slot = self.sessions.get(id).await?;
                if slot.path() != path {
                    return Err(SheetError::PathMismatch {
                        session: id,
                        bound: slot.path().to_path_buf(),
                        requested: path,
                    });
                }
                self.run_registered(&slot, ctx, op).await
            }
            None => self.run_single_shot(&path, save, ctx, op).await,
        }
    }

    /// Run `op` in a registered session (batch or interactive).
    pub async fn with_session<T, Op>(&self, id: SessionId, ctx: &OperationContext, op: Op) -> Result<T>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Engine) -> Result<T> + Send + 'static,
    {
        let slot = self.sessions.get(id).await?;
        self.run_registered(&slot, ctx, op).await
    }

    async fn run_single_shot<T, Op>(
        &self,
        path: &Path,
        save: bool,
        ctx: &OperationContext,
        op: Op,
    ) -> Result<T>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Engine) -> Result<T> + Send + 'static,
    {
        self.ensure_unclaimed(path).await?;

        let mut session = Session::begin(&self.pool, path, SessionKind::SingleShot).await?;
        match self.executor.execute(ctx, &mut session, op).await {
            Ok(value) => {
                let save_timeout = self.executor.policy().save_timeout;
                if let Err(err) = session.commit(&self.pool, save, save_timeout).await {
                    session.abort(&self.pool).await;
                    return Err(err);
                }
                Ok(value)
            }
            Err(err) => {
                session.abort(&self.pool).await;
                Err(err)
            }
        }
    }

    async fn run_registered<T, Op>(
        &self,
        slot: &Arc<SessionSlot<F::Engine>>,
        ctx: &OperationContext,
        op: Op,
    ) -> Result<T>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Engine) -> Result<T> + Send + 'static,
    {
        let mut session = slot.lock().await;
        if session.state().is_terminal() {
            // Committed or aborted while we were queued.
            return Err(SheetError::SessionNotFound(slot.id()));
        }

        let result = self.executor.execute(ctx, &mut *session, op).await;
        slot.touch(&session);

        if session.state() == SessionState::Faulted {
            error!(
                "Session {} on '{}' faulted; closing it",
                slot.id(),
                slot.path().display()
            );
            self.sessions.remove(slot.id()).await;
            session.abort(&self.pool).await;
        }
        result
    }

    /// Commit a batch: save if `save`, return the handle and forget the id.
    ///
    /// If only the save fails the batch stays open, so the caller can retry
    /// the commit or abort.
    pub async fn commit_batch(&self, id: BatchId, save: bool) -> Result<()> {
        let slot = self.sessions.get(id).await?;
        let mut session = slot.lock().await;
        if session.state().is_terminal() {
            return Err(SheetError::SessionNotFound(id));
        }

        let save_timeout = self.executor.policy().save_timeout;
        let result = session.commit(&self.pool, save, save_timeout).await;
        slot.touch(&session);

        if session.state().is_terminal() {
            self.sessions.remove(id).await;
        }
        result
    }

    /// Abort a batch, discarding unsaved changes.
    pub async fn abort_batch(&self, id: BatchId) -> Result<()> {
        let slot = self
            .sessions
            .remove(id)
            .await
            .ok_or(SheetError::SessionNotFound(id))?;
        let mut session = slot.lock().await;
        session.abort(&self.pool).await;
        slot.touch(&session);
        Ok(())
    }

    /// Close an interactive session.
    pub async fn close_session(&self, id: SessionId, save: bool) -> Result<()> {
        self.commit_batch(id, save).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .list()
            .await
            .iter()
            .map(|slot| slot.info())
            .collect();
        sessions.sort_by_key(|info| info.opened_at);
        sessions
    }

    /// Close registered sessions idle for longer than the policy allows.
    ///
    /// Sessions busy with an operation are skipped. Dirty sessions are saved
    /// first when `save_on_reap` is set, otherwise their changes are discarded.
    pub async fn reap_idle(&self) -> usize {
        let Some(idle_timeout) = self.policy.idle_timeout else {
            return 0;
        };

        let mut reaped = 0;
        for slot in self.sessions.idle_sessions(idle_timeout).await {
            let Some(mut session) = slot.try_lock() else {
                continue;
            };
            if session.state().is_terminal() {
                continue;
            }

            self.sessions.remove(slot.id()).await;
            warn!(
                "Reaping {} session {} on '{}' after {}s idle",
                session.kind(),
                slot.id(),
                slot.path().display(),
                slot.idle_for().as_secs()
            );

            if self.policy.save_on_reap && session.is_dirty() {
                let save_timeout = self.executor.policy().save_timeout;
                if let Err(err) = session.commit(&self.pool, true, save_timeout).await {
                    error!("Failed to save reaped session {}: {}", slot.id(), err);
                    session.abort(&self.pool).await;
                }
            } else {
                if session.is_dirty() {
                    error!(
                        "Reaped session {} had unsaved changes to '{}'; discarding them",
                        slot.id(),
                        slot.path().display()
                    );
                }
                session.abort(&self.pool).await;
            }
            slot.touch(&session);
            reaped += 1;
        }

        if reaped > 0 {
            info!("Reaped {} idle session(s)", reaped);
        }
        reaped
    }

    /// Abort every registered session. Used on shutdown.
    ///
    /// A session still busy with an operation at `deadline` is left to its
    /// operation; its handle stays checked out for `InstancePool::dispose_by`
    /// to terminate. Returns how many sessions were aborted.
    pub async fn abort_all(&self, deadline: tokio::time::Instant) -> usize {
        let slots = self.sessions.drain().await;
        let mut count = 0;
        for slot in slots {
            let Ok(mut session) = tokio::time::timeout_at(deadline, slot.lock()).await else {
                warn!(
                    "Session {} on '{}' still busy at shutdown; leaving its engine to be terminated",
                    slot.id(),
                    slot.path().display()
                );
                continue;
            };
            count += 1;
            if session.is_dirty() {
                error!(
                    "Session {} still open at shutdown with unsaved changes to '{}'",
                    slot.id(),
                    slot.path().display()
                );
            } else {
                debug!("Closing session {} at shutdown", slot.id());
            }
            session.abort(&self.pool).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::workbook::{CellValue, Workbook, WorkbookEngine, WorkbookFactory};
    use crate::executor::TimeoutPolicy;
    use crate::pool::PoolConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn coordinator(policy: SessionPolicy) -> BatchCoordinator<WorkbookFactory> {
        let pool = InstancePool::new(Arc::new(WorkbookFactory::new()), PoolConfig::new())
            .await
            .unwrap();
        BatchCoordinator::new(
            Arc::new(pool),
            OperationExecutor::new(TimeoutPolicy::default()),
            policy,
        )
    }

    fn set(cell: &'static str, value: f64) -> impl FnOnce(&mut WorkbookEngine) -> Result<()> + Send + 'static {
        move |engine: &mut WorkbookEngine| {
            engine
                .workbook_mut()?
                .sheet_mut("Sheet1")?
                .set(cell.parse()?, Some(CellValue::Number(value)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_shares_one_checkout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batch.json");
        Workbook::create_file(&path).unwrap();
        let coordinator = coordinator(SessionPolicy::default()).await;

        let batch = coordinator.begin_batch(&path).await.unwrap();
        for cell in ["A1", "A2", "A3"] {
            coordinator
                .with_batch(Some(batch), &path, true, &OperationContext::write("range.set"), set(cell, 1.0))
                .await
                .unwrap();
        }
        coordinator.commit_batch(batch, true).await.unwrap();

        assert_eq!(coordinator.pool().stats().acquires, 1);
        let saved = Workbook::read_file(&path).unwrap();
        assert_eq!(saved.sheet("Sheet1").unwrap().cells.len(), 3);
        assert!(coordinator.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_path_mismatch() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        Workbook::create_file(&a).unwrap();
        Workbook::create_file(&b).unwrap();
        let coordinator = coordinator(SessionPolicy::default()).await;

        let batch = coordinator.begin_batch(&a).await.unwrap();
        let result = coordinator
            .with_batch(Some(batch), &b, true, &OperationContext::write("range.set"), set("A1", 1.0))
            .await;
        assert!(matches!(result, Err(SheetError::PathMismatch { .. })));
        coordinator.abort_batch(batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_shot_on_batched_file_fails_fast() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("held.json");
        Workbook::create_file(&path).unwrap();
        let coordinator = coordinator(SessionPolicy::default()).await;

        let batch = coordinator.begin_batch(&path).await.unwrap();
        let result = coordinator
            .with_batch(None, &path, true, &OperationContext::write("range.set"), set("A1", 1.0))
            .await;
        match result {
            Err(SheetError::FileInUse { session, .. }) => assert_eq!(session, batch),
            other => panic!("expected FileInUse, got {:?}", other.err()),
        }
        assert!(matches!(
            coordinator.begin_batch(&path).await,
            Err(SheetError::FileInUse { .. })
        ));
        coordinator.commit_batch(batch, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_batch_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.json");
        let coordinator = coordinator(SessionPolicy::default()).await;
        let unknown = SessionId::new();

        assert!(matches!(
            coordinator.commit_batch(unknown, true).await,
            Err(SheetError::SessionNotFound(_))
        ));
        let result = coordinator
            .with_batch(Some(unknown), &path, true, &OperationContext::read("range.get"), |_e: &mut WorkbookEngine| Ok(()))
            .await;
        assert!(matches!(result, Err(SheetError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_reaper_discards_idle_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idle.json");
        Workbook::create_file(&path).unwrap();
        let coordinator = coordinator(SessionPolicy::new().idle_timeout(Duration::ZERO)).await;

        let batch = coordinator.begin_batch(&path).await.unwrap();
        coordinator
            .with_batch(Some(batch), &path, true, &OperationContext::write("range.set"), set("B2", 5.0))
            .await
            .unwrap();

        assert_eq!(coordinator.reap_idle().await, 1);
        assert!(matches!(
            coordinator.commit_batch(batch, true).await,
            Err(SheetError::SessionNotFound(_))
        ));
        let saved = Workbook::read_file(&path).unwrap();
        assert!(saved.sheet("Sheet1").unwrap().cells.is_empty());
        assert_eq!(coordinator.pool().stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_reaper_saves_when_configured() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idle-save.json");
        Workbook::create_file(&path).unwrap();
        let coordinator = coordinator(
            SessionPolicy::new()
                .idle_timeout(Duration::ZERO)
                .save_on_reap(true),
        )
        .await;

        let batch = coordinator.begin_batch(&path).await.unwrap();
        coordinator
            .with_batch(Some(batch), &path, true, &OperationContext::write("range.set"), set("B2", 5.0))
            .await
            .unwrap();

        assert_eq!(coordinator.reap_idle().await, 1);
        let saved = Workbook::read_file(&path).unwrap();
        assert_eq!(saved.sheet("Sheet1").unwrap().cells.len(), 1);
    }
}
