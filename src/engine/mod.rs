// ============================================================================
// Engine Capability Layer
// ============================================================================
//
// An engine is one instance of the external automation application. It can
// hold exactly one open file and executes one blocking call at a time, so
// every engine lives on its own worker thread (see `worker`). The rest of the
// crate only talks to engines through the typed `Engine` trait.
//
// ============================================================================

pub mod worker;
pub mod workbook;

pub use worker::EngineWorker;
pub use workbook::{WorkbookEngine, WorkbookFactory};

use crate::core::{HandleId, Result};
use std::path::Path;
use std::sync::Arc;

/// Out-of-band kill switch for an engine whose worker thread may be blocked.
///
/// For process-backed engines this terminates the underlying process. It is
/// invoked from threads other than the worker, so it must not touch the engine.
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

/// Typed capability surface of one automation-engine instance.
///
/// All methods are blocking and run on the engine's dedicated worker thread.
pub trait Engine: Send + 'static {
    /// Open `path`, making it the engine's single active file.
    ///
    /// Missing, locked, or corrupt files must fail with `SheetError::OpenFailure`.
    fn open(&mut self, path: &Path) -> Result<()>;

    /// Persist the active file in place.
    fn save(&mut self) -> Result<()>;

    /// Close the active file without saving. Closing with no file open is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Shut the engine down. Called once, on the worker thread, when the handle is destroyed.
    fn terminate(&mut self) {}

    /// Kill switch usable while a call is stuck on the worker thread.
    fn terminator(&self) -> Option<Terminator> {
        None
    }
}

/// Spawns engine instances for the pool.
///
/// `spawn` is expensive (it starts a new automation-engine process) and runs
/// on the new handle's worker thread, never on the async runtime.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: Engine;

    fn spawn(&self, id: HandleId) -> Result<Self::Engine>;
}
