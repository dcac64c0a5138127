use super::{Engine, EngineFactory, Terminator};
use crate::core::{HandleId, Result, SheetError};
use log::{debug, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::error::Elapsed;
use tokio::time::timeout;

type Job<E> = Box<dyn FnOnce(&mut E) + Send>;

/// Sends on drop so the owner learns the thread is gone even if it unwinds.
struct ExitSignal(Option<oneshot::Sender<()>>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// Dedicated OS thread owning one engine instance.
///
/// Calls are queued and executed strictly one at a time. A caller waits for
/// the reply with a deadline; if the deadline passes the call is abandoned on
/// the thread and the worker is flagged faulted, since the engine is now in an
/// unknown state and possibly still blocked.
pub struct EngineWorker<E: Engine> {
    id: HandleId,
    jobs: mpsc::UnboundedSender<Job<E>>,
    faulted: Arc<AtomicBool>,
    terminator: Option<Terminator>,
    exited: oneshot::Receiver<()>,
}

impl<E: Engine> EngineWorker<E> {
    /// Start a worker thread and spawn the engine on it.
    pub async fn spawn<F>(factory: Arc<F>, id: HandleId, spawn_timeout: Duration) -> Result<Self>
    where
        F: EngineFactory<Engine = E>,
    {
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job<E>>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Option<Terminator>>>();
        let (exit_tx, exit_rx) = oneshot::channel::<()>();

        thread::Builder::new()
            .name(id.to_string())
            .spawn(move || {
                let _exit = ExitSignal(Some(exit_tx));
                let mut engine = match factory.spawn(id) {
                    Ok(engine) => engine,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                if ready_tx.send(Ok(engine.terminator())).is_err() {
                    // Spawner stopped waiting.
                    engine.terminate();
                    return;
                }

                while let Some(job) = jobs_rx.blocking_recv() {
                    job(&mut engine);
                }

                engine.terminate();
                debug!("{} worker exited", id);
            })
            .map_err(|err| SheetError::EngineFault {
                handle: id,
                reason: format!("failed to start worker thread: {}", err),
            })?;

        let terminator = match timeout(spawn_timeout, ready_rx).await {
            Ok(Ok(Ok(terminator))) => terminator,
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(_)) => {
                return Err(SheetError::EngineFault {
                    handle: id,
                    reason: "worker exited during engine startup".into(),
                });
            }
            Err(_) => {
                return Err(SheetError::EngineFault {
                    handle: id,
                    reason: format!(
                        "engine did not start within {}ms",
                        spawn_timeout.as_millis()
                    ),
                });
            }
        };

        Ok(Self {
            id,
            jobs: jobs_tx,
            faulted: Arc::new(AtomicBool::new(false)),
            terminator,
            exited: exit_rx,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    pub fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::SeqCst);
    }

    /// Fire the engine's kill switch, if it has one. Returns whether one was fired.
    pub fn terminate_now(&self) -> bool {
        match &self.terminator {
            Some(terminator) => {
                terminator();
                true
            }
            None => false,
        }
    }

    pub fn terminator(&self) -> Option<Terminator> {
        self.terminator.clone()
    }

    /// Run `f` on the worker thread, waiting at most `limit` for the reply.
    ///
    /// The outer `Err` means the deadline elapsed; the call keeps running on
    /// the worker thread and the worker is flagged faulted. A panic inside `f`
    /// is reported as `EngineFault` and also flags the worker.
    pub async fn invoke<T, Func>(
        &self,
        limit: Duration,
        f: Func,
    ) -> std::result::Result<Result<T>, Elapsed>
    where
        T: Send + 'static,
        Func: FnOnce(&mut E) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();
        let faulted = Arc::clone(&self.faulted);
        let id = self.id;

        let job: Job<E> = Box::new(move |engine: &mut E| {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| f(engine))) {
                Ok(result) => result,
                Err(payload) => {
                    faulted.store(true, Ordering::SeqCst);
                    Err(SheetError::EngineFault {
                        handle: id,
                        reason: format!("engine call panicked: {}", panic_message(payload.as_ref())),
                    })
                }
            };
            let _ = reply_tx.send(outcome);
        });

        if self.jobs.send(job).is_err() {
            self.mark_faulted();
            return Ok(Err(SheetError::EngineFault {
                handle: id,
                reason: "engine worker has exited".into(),
            }));
        }

        match timeout(limit, reply_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                self.mark_faulted();
                Ok(Err(SheetError::EngineFault {
                    handle: id,
                    reason: "engine worker dropped the call".into(),
                }))
            }
            Err(elapsed) => {
                self.mark_faulted();
                Err(elapsed)
            }
        }
    }

    /// Stop accepting calls and wait up to `grace` for the thread to finish.
    ///
    /// If the thread is still busy after `grace` the kill switch is fired and
    /// the thread is left detached. Returns `true` on a graceful exit.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let EngineWorker {
            id,
            jobs,
            terminator,
            exited,
            ..
        } = self;
        drop(jobs);

        match timeout(grace, exited).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    "{} did not exit within {}ms; terminating",
                    id,
                    grace.as_millis()
                );
                if let Some(terminator) = terminator {
                    terminator();
                }
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
