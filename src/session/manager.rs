// ============================================================================
// Session Manager
// ============================================================================

use super::{Session, SessionInfo, SessionKind};
use crate::core::{Result, SessionId, SheetError};
use crate::engine::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// A registered session and the bookkeeping readable without locking it.
pub struct SessionSlot<E: Engine> {
    id: SessionId,
    kind: SessionKind,
    path: PathBuf,
    session: Mutex<Session<E>>,
    snapshot: parking_lot::Mutex<(SessionInfo, Instant)>,
}

impl<E: Engine> SessionSlot<E> {
    fn new(session: Session<E>) -> Self {
        Self {
            id: session.id(),
            kind: session.kind(),
            path: session.path().to_path_buf(),
            snapshot: parking_lot::Mutex::new((session.info(), Instant::now())),
            session: Mutex::new(session),
        }
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

    /// Wait for exclusive use of the session. Waiters are served in FIFO order.
    pub async fn lock(&self) -> MutexGuard<'_, Session<E>> {
        self.session.lock().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Session<E>>> {
        self.session.try_lock().ok()
    }

    /// Record the session's current state as last seen.
    pub fn touch(&self, session: &Session<E>) {
        *self.snapshot.lock() = (session.info(), Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        self.snapshot.lock().1.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        let guard = self.snapshot.lock();
        let mut info = guard.0.clone();
        info.idle_ms = guard.1.elapsed().as_millis() as u64;
        info
    }
}

struct Registry<E: Engine> {
    by_id: HashMap<SessionId, Arc<SessionSlot<E>>>,
    by_path: HashMap<PathBuf, SessionId>,
}

/// Registry of sessions that outlive a single call (batches and interactive
/// sessions), indexed by id and by file path.
pub struct SessionManager<E: Engine> {
    registry: RwLock<Registry<E>>,
}

impl<E: Engine> Default for SessionManager<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> SessionManager<E> {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry {
                by_id: HashMap::new(),
                by_path: HashMap::new(),
            }),
        }
    }

    /// Register an open session. Fails with the session handed back if its
    /// path is already registered.
    pub async fn register(
        &self,
        session: Session<E>,
    ) -> std::result::Result<Arc<SessionSlot<E>>, (Session<E>, SessionId)> {
        let mut registry = self.registry.write().await;
        if let Some(holder) = registry.by_path.get(session.path()) {
            let holder = *holder;
            return Err((session, holder));
        }

        let slot = Arc::new(SessionSlot::new(session));
        registry.by_path.insert(slot.path.clone(), slot.id);
        registry.by_id.insert(slot.id, Arc::clone(&slot));
        Ok(slot)
    }

    pub async fn get(&self, id: SessionId) -> Result<Arc<SessionSlot<E>>> {
        self.registry
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or(SheetError::SessionNotFound(id))
    }

    pub async fn remove(&self, id: SessionId) -> Option<Arc<SessionSlot<E>>> {
        let mut registry = self.registry.write().await;
        let slot = registry.by_id.remove(&id)?;
        registry.by_path.remove(&slot.path);
        Some(slot)
    }

    /// Id of the session registered for `path`, if any.
    pub async fn holder_of(&self, path: &Path) -> Option<SessionId> {
        self.registry.read().await.by_path.get(path).copied()
    }

    pub async fn list(&self) -> Vec<Arc<SessionSlot<E>>> {
        self.registry.read().await.by_id.values().cloned().collect()
    }

    /// Sessions untouched for at least `idle`.
    pub async fn idle_sessions(&self, idle: Duration) -> Vec<Arc<SessionSlot<E>>> {
        self.registry
            .read()
            .await
            .by_id
            .values()
            .filter(|slot| slot.idle_for() >= idle)
            .cloned()
            .collect()
    }

    /// Remove every session from the registry.
    pub async fn drain(&self) -> Vec<Arc<SessionSlot<E>>> {
        let mut registry = self.registry.write().await;
        registry.by_path.clear();
        registry.by_id.drain().map(|(_, slot)| slot).collect()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
