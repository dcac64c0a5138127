// ============================================================================
// Sheetpool Library
// ============================================================================

pub mod commands;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod pool;
pub mod session;

// Re-export main types for convenience
pub use config::{OrchestratorConfig, SessionPolicy};
pub use core::{BatchId, ErrorKind, HandleId, Result, SessionId, SheetError};
pub use dispatch::{ActionRegistry, REQUIRED_ACTIONS};
pub use engine::{Engine, EngineFactory, WorkbookEngine, WorkbookFactory};
pub use executor::{
    OperationCategory, OperationContext, OperationExecutor, OperationFailure, OperationResult,
    TimeoutPolicy,
};
pub use pool::{DisposeReport, HandleInfo, InstancePool, PoolConfig, PoolStats};
pub use session::{BatchCoordinator, SessionInfo, SessionKind, SessionState};

use log::info;
use serde_json::Value;
use session::{SessionReaper, spawn_session_reaper};
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// High-level API
// ============================================================================

/// Entry point owning the engine pool, the session registry and the reaper.
///
/// There is no global instance: build one with `initialize`, share it behind
/// an `Arc`, and call `shutdown` when done.
///
/// # Examples
///
/// ```
/// use sheetpool::{Orchestrator, OrchestratorConfig, OperationContext, WorkbookFactory};
/// use sheetpool::commands::range;
/// use sheetpool::engine::workbook::Workbook;
///
/// # tokio_test::block_on(async {
/// # let dir = tempfile::tempdir().unwrap();
/// # let report = dir.path().join("report.json");
/// Workbook::create_file(&report)?;
/// let orchestrator =
///     Orchestrator::initialize(WorkbookFactory::new(), OrchestratorConfig::default()).await?;
///
/// let batch = orchestrator.begin_batch(&report).await?;
/// for (i, cell) in ["A1", "A2", "A3"].into_iter().enumerate() {
///     orchestrator
///         .with_batch(Some(batch), &report, true, &OperationContext::write("range.set"),
///             move |engine| range::set_cell(engine, "Sheet1", cell, Some((i as f64).into())))
///         .await?;
/// }
/// orchestrator.commit_batch(batch, true).await?;
/// orchestrator.shutdown().await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # }).unwrap();
/// ```
pub struct Orchestrator<F: EngineFactory> {
    coordinator: Arc<BatchCoordinator<F>>,
    reaper: parking_lot::Mutex<Option<SessionReaper>>,
}

impl<F: EngineFactory> Orchestrator<F> {
    /// Build the pool, pre-spawn `min_handles` engines and start the reaper.
    pub async fn initialize(factory: F, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        Self::with_policies(
            Arc::new(factory),
            config.pool_config(),
            config.timeout_policy(),
            config.session_policy(),
        )
        .await
    }

    pub async fn with_policies(
        factory: Arc<F>,
        pool: PoolConfig,
        timeouts: TimeoutPolicy,
        sessions: SessionPolicy,
    ) -> Result<Self> {
        timeouts.validate().map_err(SheetError::Config)?;

        let pool = Arc::new(InstancePool::new(factory, pool).await?);
        let wants_reaper = sessions.idle_timeout.is_some() || pool.config().idle_timeout.is_some();
        let interval = sessions.reap_interval;
        let coordinator = Arc::new(BatchCoordinator::new(
            pool,
            OperationExecutor::new(timeouts),
            sessions,
        ));

        let reaper = wants_reaper.then(|| spawn_session_reaper(Arc::clone(&coordinator), interval));

        info!(
            "Orchestrator ready (max {} engine handles)",
            coordinator.pool().config().max_size
        );
        Ok(Self {
            coordinator,
            reaper: parking_lot::Mutex::new(reaper),
        })
    }

    pub fn coordinator(&self) -> &Arc<BatchCoordinator<F>> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<InstancePool<F>> {
        self.coordinator.pool()
    }

    pub async fn begin_batch(&self, path: impl AsRef<Path>) -> Result<BatchId> {
        self.coordinator.begin_batch(path).await
    }

    pub async fn commit_batch(&self, batch: BatchId, save: bool) -> Result<()> {
        self.coordinator.commit_batch(batch, save).await
    }

    pub async fn abort_batch(&self, batch: BatchId) -> Result<()> {
        self.coordinator.abort_batch(batch).await
    }

    pub async fn open_session(&self, path: impl AsRef<Path>) -> Result<SessionId> {
        self.coordinator.open_session(path).await
    }

    pub async fn close_session(&self, session: SessionId, save: bool) -> Result<()> {
        self.coordinator.close_session(session, save).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.coordinator.list_sessions().await
    }

    /// Run `op` in `batch`, or in a single-shot session on `path` saved
    /// according to `save` when `batch` is `None`.
    pub async fn with_batch<T, Op>(
        &self,
        batch: Option<BatchId>,
        path: impl AsRef<Path>,
        save: bool,
        ctx: &OperationContext,
        op: Op,
    ) -> std::result::Result<T, OperationFailure>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Engine) -> Result<T> + Send + 'static,
    {
        self.coordinator
            .with_batch(batch, path, save, ctx, op)
            .await
            .map_err(|err| self.coordinator.executor().classify(ctx, err, batch.is_some()))
    }

    pub async fn with_session<T, Op>(
        &self,
        session: SessionId,
        ctx: &OperationContext,
        op: Op,
    ) -> std::result::Result<T, OperationFailure>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Engine) -> Result<T> + Send + 'static,
    {
        self.coordinator
            .with_session(session, ctx, op)
            .await
            .map_err(|err| self.coordinator.executor().classify(ctx, err, true))
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.pool().stats()
    }

    pub fn handles(&self) -> Vec<HandleInfo> {
        self.pool().handles()
    }

    /// Stop the reaper, abort open sessions and dispose the pool, all within
    /// the pool's `shutdown_grace`. Engines still busy after it are terminated.
    pub async fn shutdown(&self) -> Result<DisposeReport> {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop().await?;
        }

        // Sessions and pool share one grace period.
        let deadline = tokio::time::Instant::now() + self.pool().config().shutdown_grace;
        let aborted = self.coordinator.abort_all(deadline).await;
        if aborted > 0 {
            info!("Aborted {} open session(s) at shutdown", aborted);
        }
        Ok(self.pool().dispose_by(deadline).await)
    }
}

impl<F: EngineFactory<Engine = WorkbookEngine>> Orchestrator<F> {
    /// Run a registered workbook action and report it as an `OperationResult`.
    pub async fn dispatch(
        &self,
        registry: &ActionRegistry,
        batch: Option<BatchId>,
        path: impl AsRef<Path>,
        save: bool,
        action: &str,
        args: &Value,
    ) -> OperationResult<Value> {
        let prepared = match registry.prepare(action, args) {
            Ok(prepared) => prepared,
            Err(err) => {
                let ctx = OperationContext::metadata(action);
                return OperationResult::failed(
                    self.coordinator.executor().classify(&ctx, err, batch.is_some()),
                );
            }
        };

        let outcome = self
            .with_batch(batch, path, save, &prepared.context, prepared.run)
            .await;
        OperationResult::from_outcome(prepared.context.operation, outcome)
    }
}
