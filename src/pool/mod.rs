pub mod config;
pub mod handle;

pub use config::PoolConfig;
pub use handle::{EngineHandle, HandleInfo, ReleaseMode};

use crate::core::{HandleId, HandleState, Result, SheetError};
use crate::engine::{Engine, EngineFactory, EngineWorker, Terminator};
use handle::HandleMeta;
use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Engine instance pool
///
/// Owns a bounded set of engine handles and hands out exclusive checkouts
/// keyed by file path. Idle handles stay bound to their last file so a
/// follow-up call against the same path skips the close/reopen cycle.
pub struct InstancePool<F: EngineFactory> {
    config: PoolConfig,
    factory: Arc<F>,
    shared: Arc<PoolShared<F::Engine>>,
    next_id: AtomicU64,
}

/// State shared between the pool and its outstanding handles.
pub(crate) struct PoolShared<E: Engine> {
    state: Mutex<PoolState<E>>,
    released: Notify,
    metrics: PoolMetrics,
}

struct IdleHandle<E: Engine> {
    worker: EngineWorker<E>,
    meta: HandleMeta,
}

struct PoolState<E: Engine> {
    /// Idle handles with a file open, least recently used first out.
    idle_bound: LruCache<PathBuf, IdleHandle<E>>,
    /// Idle handles with no file open.
    idle_generic: VecDeque<IdleHandle<E>>,
    /// Paths with a checkout in progress or outstanding.
    busy_paths: HashSet<PathBuf>,
    /// Checked-out handles by id.
    in_use: HashMap<HandleId, HandleMeta>,
    /// Reservations, including ones still spawning or opening.
    checked_out: usize,
    /// Every handle alive or being spawned.
    live: usize,
    terminators: HashMap<HandleId, Terminator>,
    closed: bool,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    acquires: AtomicU64,
    releases: AtomicU64,
    spawned: AtomicU64,
    warm_hits: AtomicU64,
    evicted: AtomicU64,
    retired: AtomicU64,
    acquire_timeouts: AtomicU64,
}

enum Reservation<E: Engine> {
    /// Idle handle already bound to the requested path.
    Warm(IdleHandle<E>),
    /// Idle handle to be (re)bound to the requested path.
    Rebind(IdleHandle<E>),
    /// A free slot; spawn a new engine with this id.
    Spawn(HandleId),
}

impl<E: Engine> Reservation<E> {
    fn id(&self) -> HandleId {
        match self {
            Reservation::Warm(idle) | Reservation::Rebind(idle) => idle.meta.id,
            Reservation::Spawn(id) => *id,
        }
    }
}

impl<E: Engine> PoolState<E> {
    fn new() -> Self {
        Self {
            idle_bound: LruCache::unbounded(),
            idle_generic: VecDeque::new(),
            busy_paths: HashSet::new(),
            in_use: HashMap::new(),
            checked_out: 0,
            live: 0,
            terminators: HashMap::new(),
            closed: false,
        }
    }

    fn idle_count(&self) -> usize {
        self.idle_bound.len() + self.idle_generic.len()
    }

    /// Claim a handle or a spawn slot for `path`, or `None` if the caller must wait.
    fn reserve(
        &mut self,
        path: &Path,
        max_size: usize,
        next_id: impl FnOnce() -> HandleId,
    ) -> Option<Reservation<E>> {
        if self.busy_paths.contains(path) || self.checked_out >= max_size {
            return None;
        }

        let reservation = if let Some(idle) = self.idle_bound.pop(path) {
            Reservation::Warm(idle)
        } else if let Some(idle) = self.idle_generic.pop_front() {
            Reservation::Rebind(idle)
        } else if self.live < max_size {
            self.live += 1;
            Reservation::Spawn(next_id())
        } else if let Some((_, idle)) = self.idle_bound.pop_lru() {
            Reservation::Rebind(idle)
        } else {
            return None;
        };

        self.busy_paths.insert(path.to_path_buf());
        self.checked_out += 1;
        Some(reservation)
    }

    /// Drop a checkout whose handle has been (or is being) destroyed.
    fn forget(&mut self, id: HandleId, path: &Path) {
        self.busy_paths.remove(path);
        self.in_use.remove(&id);
        self.terminators.remove(&id);
        self.checked_out = self.checked_out.saturating_sub(1);
        self.live = self.live.saturating_sub(1);
    }

    /// End a checkout whose handle survives as idle.
    fn check_in(&mut self, id: HandleId, path: &Path) {
        self.busy_paths.remove(path);
        self.in_use.remove(&id);
        self.checked_out = self.checked_out.saturating_sub(1);
    }
}

impl<E: Engine> PoolShared<E> {
    pub(crate) fn forget(&self, id: HandleId, path: &Path) {
        self.state.lock().forget(id, path);
        self.released.notify_waiters();
    }
}

/// Returns a reservation to the pool if the acquiring future fails or is dropped.
struct ReservationGuard<E: Engine> {
    shared: Arc<PoolShared<E>>,
    path: PathBuf,
    id: HandleId,
    armed: bool,
}

impl<E: Engine> ReservationGuard<E> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<E: Engine> Drop for ReservationGuard<E> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget(self.id, &self.path);
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub live_handles: usize,
    pub idle_handles: usize,
    pub in_use_handles: usize,
    pub max_size: usize,
    pub acquires: u64,
    pub releases: u64,
    pub spawned: u64,
    pub warm_hits: u64,
    pub evicted: u64,
    pub retired: u64,
    pub acquire_timeouts: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} in use, {} idle, max {} ({} acquires, {} warm, {} spawned, {} evicted)",
            self.in_use_handles,
            self.live_handles,
            self.idle_handles,
            self.max_size,
            self.acquires,
            self.warm_hits,
            self.spawned,
            self.evicted
        )
    }
}

/// Outcome of `InstancePool::dispose`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DisposeReport {
    /// Handles whose worker exited within the grace period.
    pub graceful: usize,
    /// Handles whose kill switch had to be fired.
    pub forced: usize,
    /// Checkouts still outstanding when the grace period ran out.
    pub abandoned: usize,
}

/// Resolve `path` to an absolute path so one file has one pool key.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|err| SheetError::OpenFailure {
        path: path.to_path_buf(),
        reason: format!("invalid path: {}", err),
    })
}

async fn invoke_or_fault<E, T, Func>(
    worker: &EngineWorker<E>,
    limit: Duration,
    what: &str,
    f: Func,
) -> Result<T>
where
    E: Engine,
    T: Send + 'static,
    Func: FnOnce(&mut E) -> Result<T> + Send + 'static,
{
    match worker.invoke(limit, f).await {
        Ok(result) => result,
        Err(_) => Err(SheetError::EngineFault {
            handle: worker.id(),
            reason: format!("{} did not finish within {}ms", what, limit.as_millis()),
        }),
    }
}

impl<F: EngineFactory> InstancePool<F> {
    /// Create a pool and pre-spawn `min_handles` generic handles.
    pub async fn new(factory: Arc<F>, config: PoolConfig) -> Result<Self> {
        config.validate().map_err(SheetError::Config)?;

        let pool = Self {
            config,
            factory,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::new()),
                released: Notify::new(),
                metrics: PoolMetrics::default(),
            }),
            next_id: AtomicU64::new(1),
        };

        pool.ensure_min_handles().await?;
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    fn allocate_id(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Spawn generic handles until `min_handles` are alive.
    async fn ensure_min_handles(&self) -> Result<()> {
        loop {
            let id = {
                let mut state = self.shared.state.lock();
                if state.closed || state.live >= self.config.min_handles {
                    return Ok(());
                }
                state.live += 1;
                self.allocate_id()
            };

            match EngineWorker::spawn(Arc::clone(&self.factory), id, self.config.spawn_timeout).await
            {
                Ok(worker) => {
                    self.shared.metrics.spawned.fetch_add(1, Ordering::SeqCst);
                    let mut state = self.shared.state.lock();
                    if let Some(terminator) = worker.terminator() {
                        state.terminators.insert(id, terminator);
                    }
                    state.idle_generic.push_back(IdleHandle {
                        worker,
                        meta: HandleMeta::new(id),
                    });
                }
                Err(err) => {
                    self.shared.state.lock().live -= 1;
                    return Err(err);
                }
            }
        }
    }

    /// Check out a handle with `path` open.
    ///
    /// Prefers an idle handle already bound to `path`, then an idle generic
    /// handle, then a newly spawned one while below `max_size`, then the least
    /// recently used idle handle bound to another file. Otherwise waits up to
    /// `acquire_timeout` for a release. A path that is already checked out
    /// makes the caller wait, whatever the pool size.
    pub async fn acquire(&self, path: impl AsRef<Path>) -> Result<EngineHandle<F::Engine>> {
        let path = normalize_path(path.as_ref())?;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;

        let reservation = loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(SheetError::ShutDown);
                }
                if let Some(reservation) =
                    state.reserve(&path, self.config.max_size, || self.allocate_id())
                {
                    break reservation;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.shared
                    .metrics
                    .acquire_timeouts
                    .fetch_add(1, Ordering::SeqCst);
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    "No engine handle for '{}' after {}ms",
                    path.display(),
                    waited_ms
                );
                return Err(SheetError::PoolExhausted { path, waited_ms });
            }
        };

        let id = reservation.id();
        let mut guard = ReservationGuard {
            shared: Arc::clone(&self.shared),
            path: path.clone(),
            id,
            armed: true,
        };

        let (worker, mut meta, warm) = match reservation {
            Reservation::Warm(idle) => (idle.worker, idle.meta, true),
            Reservation::Rebind(IdleHandle { worker, mut meta }) => {
                if let Some(previous) = meta.bound_path.take() {
                    debug!(
                        "{} closing '{}' to open '{}'",
                        id,
                        previous.display(),
                        path.display()
                    );
                    if let Err(err) =
                        invoke_or_fault(&worker, self.config.open_timeout, "close", |engine: &mut F::Engine| {
                            engine.close()
                        })
                        .await
                    {
                        self.discard(worker);
                        return Err(err);
                    }
                }
                (worker, meta, false)
            }
            Reservation::Spawn(id) => {
                let worker =
                    EngineWorker::spawn(Arc::clone(&self.factory), id, self.config.spawn_timeout)
                        .await?;
                self.shared.metrics.spawned.fetch_add(1, Ordering::SeqCst);
                if let Some(terminator) = worker.terminator() {
                    self.shared.state.lock().terminators.insert(id, terminator);
                }
                info!("{} spawned for '{}'", id, path.display());
                (worker, HandleMeta::new(id), false)
            }
        };

        if warm {
            self.shared.metrics.warm_hits.fetch_add(1, Ordering::SeqCst);
        } else {
            let open_path = path.clone();
            let opened = invoke_or_fault(
                &worker,
                self.config.open_timeout,
                "open",
                move |engine: &mut F::Engine| engine.open(&open_path),
            )
            .await;

            if let Err(err) = opened {
                if worker.is_faulted() || err.is_engine_fault() {
                    self.discard(worker);
                } else {
                    // The engine is fine, only the file is not.
                    guard.disarm();
                    {
                        let mut state = self.shared.state.lock();
                        state.check_in(id, &path);
                        state.idle_generic.push_back(IdleHandle { worker, meta });
                    }
                    self.shared.released.notify_waiters();
                }
                return Err(err);
            }
            meta.bound_path = Some(path.clone());
        }

        meta.use_count += 1;
        meta.last_used = Instant::now();
        self.shared.state.lock().in_use.insert(id, meta.clone());
        self.shared.metrics.acquires.fetch_add(1, Ordering::SeqCst);
        guard.disarm();

        debug!(
            "{} checked out for '{}' (use #{}, warm={})",
            id,
            path.display(),
            meta.use_count,
            warm
        );
        Ok(EngineHandle::new(worker, meta, path, Arc::clone(&self.shared)))
    }

    /// Return a handle: `faulted == false` keeps it idle and bound to its
    /// file, `faulted == true` destroys it.
    pub async fn release(&self, handle: EngineHandle<F::Engine>, faulted: bool) {
        let mode = if faulted {
            ReleaseMode::Evict
        } else {
            ReleaseMode::Keep
        };
        self.release_with(handle, mode).await;
    }

    pub async fn release_with(&self, mut handle: EngineHandle<F::Engine>, mode: ReleaseMode) {
        let Some(worker) = handle.worker.take() else {
            return;
        };
        let mut meta = handle.meta.clone();
        let path = std::mem::take(&mut handle.path);
        drop(handle);

        let closed = self.shared.state.lock().closed;
        let exhausted = self
            .config
            .max_uses
            .is_some_and(|max| meta.use_count >= max);

        let mode = if worker.is_faulted() {
            ReleaseMode::Evict
        } else {
            mode
        };

        match mode {
            ReleaseMode::Keep if !closed && !exhausted => {
                meta.last_used = Instant::now();
                let mut state = self.shared.state.lock();
                state.check_in(meta.id, &path);
                if let Some(stale) = state.idle_bound.put(path, IdleHandle { worker, meta }) {
                    // Cannot happen while the path was busy; keep the newer handle.
                    state.live = state.live.saturating_sub(1);
                    state.terminators.remove(&stale.meta.id);
                    drop(state);
                    self.retire(stale.worker);
                }
            }
            ReleaseMode::Unbind if !closed && !exhausted => {
                let closed_ok = invoke_or_fault(
                    &worker,
                    self.config.open_timeout,
                    "close",
                    |engine: &mut F::Engine| engine.close(),
                )
                .await;

                match closed_ok {
                    Ok(()) => {
                        meta.bound_path = None;
                        meta.last_used = Instant::now();
                        let mut state = self.shared.state.lock();
                        state.check_in(meta.id, &path);
                        state.idle_generic.push_back(IdleHandle { worker, meta });
                    }
                    Err(err) => {
                        warn!("{} failed to close '{}': {}", meta.id, path.display(), err);
                        self.shared.state.lock().forget(meta.id, &path);
                        self.discard(worker);
                    }
                }
            }
            ReleaseMode::Evict => {
                info!("{} evicted (was bound to '{}')", meta.id, path.display());
                self.shared.state.lock().forget(meta.id, &path);
                self.discard(worker);
            }
            _ => {
                debug!(
                    "{} retired after {} uses (pool closed: {})",
                    meta.id, meta.use_count, closed
                );
                self.shared.state.lock().forget(meta.id, &path);
                self.retire(worker);
            }
        }

        self.shared.metrics.releases.fetch_add(1, Ordering::SeqCst);
        self.shared.released.notify_waiters();
    }

    /// Destroy a faulted or untrusted worker in the background.
    fn discard(&self, worker: EngineWorker<F::Engine>) {
        self.shared.metrics.evicted.fetch_add(1, Ordering::SeqCst);
        if self.config.terminate_faulted && worker.is_faulted() {
            worker.terminate_now();
        }
        let grace = self.config.shutdown_grace;
        tokio::spawn(async move {
            worker.shutdown(grace).await;
        });
    }

    /// Shut down a healthy worker in the background.
    fn retire(&self, worker: EngineWorker<F::Engine>) {
        self.shared.metrics.retired.fetch_add(1, Ordering::SeqCst);
        let grace = self.config.shutdown_grace;
        tokio::spawn(async move {
            worker.shutdown(grace).await;
        });
    }

    /// Shut down idle handles unused for longer than `idle_timeout`, keeping
    /// at least `min_handles` alive. Returns how many were shut down.
    pub fn evict_idle(&self) -> usize {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return 0;
        };

        let expired = {
            let mut state = self.shared.state.lock();
            let mut budget = state.live.saturating_sub(self.config.min_handles);
            let mut expired = Vec::new();

            let stale_paths: Vec<PathBuf> = state
                .idle_bound
                .iter()
                .rev()
                .filter(|(_, idle)| idle.meta.last_used.elapsed() >= idle_timeout)
                .map(|(path, _)| path.clone())
                .collect();
            for path in stale_paths {
                if budget == 0 {
                    break;
                }
                if let Some(idle) = state.idle_bound.pop(&path) {
                    expired.push(idle);
                    budget -= 1;
                }
            }

            let mut kept = VecDeque::with_capacity(state.idle_generic.len());
            while let Some(idle) = state.idle_generic.pop_front() {
                if budget > 0 && idle.meta.last_used.elapsed() >= idle_timeout {
                    expired.push(idle);
                    budget -= 1;
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle_generic = kept;

            state.live -= expired.len();
            for idle in &expired {
                state.terminators.remove(&idle.meta.id);
            }
            expired
        };

        let count = expired.len();
        for idle in expired {
            debug!("{} idle for too long; shutting down", idle.meta.id);
            self.retire(idle.worker);
        }
        if count > 0 {
            info!("Shut down {} idle engine handle(s)", count);
        }
        count
    }

    /// Drain the pool: refuse new checkouts, wait up to `shutdown_grace` for
    /// outstanding ones, then shut every handle down. Stragglers get their
    /// kill switch fired.
    pub async fn dispose(&self) -> DisposeReport {
        self.dispose_by(tokio::time::Instant::now() + self.config.shutdown_grace)
            .await
    }

    /// `dispose` with the wait for outstanding checkouts ending at `deadline`
    /// instead of `shutdown_grace` from now.
    pub async fn dispose_by(&self, deadline: tokio::time::Instant) -> DisposeReport {
        self.shared.state.lock().closed = true;
        self.shared.released.notify_waiters();

        let grace = self.config.shutdown_grace;
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.state.lock().checked_out == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let (idle, stragglers, abandoned) = {
            let mut state = self.shared.state.lock();
            let mut idle: Vec<IdleHandle<F::Engine>> = Vec::new();
            while let Some((_, handle)) = state.idle_bound.pop_lru() {
                idle.push(handle);
            }
            idle.extend(state.idle_generic.drain(..));
            state.live = state.live.saturating_sub(idle.len());

            let stragglers: Vec<Terminator> = state
                .in_use
                .keys()
                .filter_map(|id| state.terminators.get(id).cloned())
                .collect();
            for handle in &idle {
                state.terminators.remove(&handle.meta.id);
            }
            (idle, stragglers, state.checked_out)
        };

        let mut report = DisposeReport {
            abandoned,
            ..DisposeReport::default()
        };

        if abandoned > 0 {
            warn!(
                "{} engine handle(s) still checked out after {}ms; terminating",
                abandoned,
                grace.as_millis()
            );
            for terminator in stragglers {
                terminator();
                report.forced += 1;
            }
        }

        let outcomes =
            futures::future::join_all(idle.into_iter().map(|h| h.worker.shutdown(grace))).await;
        for graceful in outcomes {
            if graceful {
                report.graceful += 1;
            } else {
                report.forced += 1;
            }
        }

        info!(
            "Engine pool disposed: {} graceful, {} forced, {} abandoned",
            report.graceful, report.forced, report.abandoned
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let metrics = &self.shared.metrics;
        PoolStats {
            live_handles: state.live,
            idle_handles: state.idle_count(),
            in_use_handles: state.checked_out,
            max_size: self.config.max_size,
            acquires: metrics.acquires.load(Ordering::SeqCst),
            releases: metrics.releases.load(Ordering::SeqCst),
            spawned: metrics.spawned.load(Ordering::SeqCst),
            warm_hits: metrics.warm_hits.load(Ordering::SeqCst),
            evicted: metrics.evicted.load(Ordering::SeqCst),
            retired: metrics.retired.load(Ordering::SeqCst),
            acquire_timeouts: metrics.acquire_timeouts.load(Ordering::SeqCst),
        }
    }

    /// Snapshot of every handle, idle ones first.
    pub fn handles(&self) -> Vec<HandleInfo> {
        let state = self.shared.state.lock();
        let mut handles: Vec<HandleInfo> = state
            .idle_bound
            .iter()
            .map(|(_, idle)| idle.meta.info(HandleState::Idle))
            .chain(
                state
                    .idle_generic
                    .iter()
                    .map(|idle| idle.meta.info(HandleState::Idle)),
            )
            .collect();
        handles.extend(
            state
                .in_use
                .values()
                .map(|meta| meta.info(HandleState::InUse)),
        );
        handles
    }
}
