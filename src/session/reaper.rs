use super::BatchCoordinator;
use crate::core::{Result, SheetError};
use crate::engine::EngineFactory;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Background worker closing leaked sessions and idle engine handles.
pub struct SessionReaper {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SessionReaper {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| SheetError::IoError(format!("session reaper join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for SessionReaper {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the reaper; every `interval` it reaps idle sessions and then idle
/// pool handles.
pub fn spawn_session_reaper<F: EngineFactory>(
    coordinator: Arc<BatchCoordinator<F>>,
    interval: Duration,
) -> SessionReaper {
    let interval = interval.max(Duration::from_millis(10));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let sessions = coordinator.reap_idle().await;
                    let handles = coordinator.pool().evict_idle();
                    if sessions > 0 || handles > 0 {
                        debug!("Reaper pass closed {} session(s), {} handle(s)", sessions, handles);
                    }
                }
            }
        }
    });

    SessionReaper {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
