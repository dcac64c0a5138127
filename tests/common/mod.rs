//! Shared fixtures for integration tests
//!
//! `MockFactory` spawns in-memory engines whose "files" live in a shared map,
//! and counts every spawn, open, save and close so tests can assert on how
//! the orchestration layer drives the engine.
#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use sheetpool::engine::Terminator;
use sheetpool::{
    Engine, EngineFactory, HandleId, Orchestrator, PoolConfig, Result, SessionPolicy, SheetError,
    TimeoutPolicy,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct MockStats {
    pub spawned: AtomicUsize,
    pub opens: AtomicUsize,
    pub saves: AtomicUsize,
    pub closes: AtomicUsize,
    pub terminated: AtomicUsize,

    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Set if two calls ever ran against the same file at once.
    pub overlap: AtomicBool,
    busy_files: Mutex<HashSet<PathBuf>>,

    disk: Mutex<HashMap<PathBuf, BTreeMap<String, f64>>>,

    released: Mutex<bool>,
    release: Condvar,
}

impl MockStats {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Create an empty file on the shared disk.
    pub fn create_file(&self, path: &Path) {
        self.disk
            .lock()
            .insert(std::path::absolute(path).unwrap(), BTreeMap::new());
    }

    /// Saved value of `cell` in `path`.
    pub fn saved(&self, path: &Path, cell: &str) -> Option<f64> {
        self.disk
            .lock()
            .get(&std::path::absolute(path).unwrap())
            .and_then(|cells| cells.get(cell).copied())
    }

    pub fn saved_cells(&self, path: &Path) -> usize {
        self.disk
            .lock()
            .get(&std::path::absolute(path).unwrap())
            .map(|cells| cells.len())
            .unwrap_or(0)
    }

    /// Unblock every engine stuck in `hang`.
    pub fn release_hung(&self) {
        *self.released.lock() = true;
        self.release.notify_all();
    }
}

pub struct MockFactory {
    pub stats: Arc<MockStats>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
        }
    }
}

impl EngineFactory for MockFactory {
    type Engine = MockEngine;

    fn spawn(&self, id: HandleId) -> Result<MockEngine> {
        self.stats.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(MockEngine {
            id,
            stats: Arc::clone(&self.stats),
            path: None,
            cells: BTreeMap::new(),
        })
    }
}

pub struct MockEngine {
    id: HandleId,
    stats: Arc<MockStats>,
    path: Option<PathBuf>,
    cells: BTreeMap<String, f64>,
}

impl MockEngine {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn set(&mut self, cell: &str, value: f64) -> Result<()> {
        if self.path.is_none() {
            return Err(SheetError::domain("No file is open"));
        }
        self.cells.insert(cell.to_string(), value);
        Ok(())
    }

    pub fn get(&self, cell: &str) -> Option<f64> {
        self.cells.get(cell).copied()
    }

    /// Simulate a slow call, recording concurrency.
    pub fn work(&mut self, duration: Duration) -> Result<()> {
        let path = self.path.clone().unwrap_or_default();
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.stats.busy_files.lock().insert(path.clone()) {
            self.stats.overlap.store(true, Ordering::SeqCst);
        }

        std::thread::sleep(duration);

        self.stats.busy_files.lock().remove(&path);
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Block until the kill switch fires or `release_hung` is called.
    pub fn hang(&mut self) -> Result<()> {
        let mut released = self.stats.released.lock();
        while !*released {
            self.stats.release.wait(&mut released);
        }
        Err(SheetError::domain("engine was terminated"))
    }
}

impl Engine for MockEngine {
    fn open(&mut self, path: &Path) -> Result<()> {
        let cells = self
            .stats
            .disk
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| SheetError::OpenFailure {
                path: path.to_path_buf(),
                reason: "file not found".into(),
            })?;
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        self.path = Some(path.to_path_buf());
        self.cells = cells;
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| SheetError::domain("No file is open"))?;
        self.stats.disk.lock().insert(path, self.cells.clone());
        self.stats.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.path = None;
        self.cells.clear();
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn terminator(&self) -> Option<Terminator> {
        let stats = Arc::clone(&self.stats);
        Some(Arc::new(move || {
            stats.terminated.fetch_add(1, Ordering::SeqCst);
            stats.release_hung();
        }))
    }
}

/// Orchestrator over a fresh mock factory, without background reaping.
pub async fn orchestrator(
    pool: PoolConfig,
    timeouts: TimeoutPolicy,
) -> (Orchestrator<MockFactory>, Arc<MockStats>) {
    let factory = Arc::new(MockFactory::new());
    let stats = Arc::clone(&factory.stats);
    let orchestrator = Orchestrator::with_policies(
        factory,
        pool.no_idle_timeout(),
        timeouts,
        SessionPolicy::new().no_idle_timeout(),
    )
    .await
    .unwrap();
    (orchestrator, stats)
}

pub fn file(dir: &tempfile::TempDir, stats: &MockStats, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    stats.create_file(&path);
    path
}
