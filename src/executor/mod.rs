// ============================================================================
// Operation Executor
// ============================================================================
//
// Runs one engine call against a session under a deadline taken from the
// operation's category, and turns failures into annotated `OperationFailure`s.
// The executor never looks at what the call does.
//
// ============================================================================

pub mod context;
pub mod outcome;

pub use context::{CategoryTimeout, OperationCategory, OperationContext, TimeoutPolicy};
pub use outcome::{OperationFailure, OperationResult};

use crate::core::{Result, SheetError};
use crate::engine::Engine;
use crate::session::Session;
use log::error;
use std::time::Instant;
use tracing::Instrument;

#[derive(Debug, Clone, Default)]
pub struct OperationExecutor {
    policy: TimeoutPolicy,
}

impl OperationExecutor {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Run `f` on the session's engine within the context's timeout.
    ///
    /// At the deadline the call is abandoned on its thread, the session is
    /// faulted and `OperationTimeout` is returned.
    pub async fn execute<E, T, Func>(
        &self,
        ctx: &OperationContext,
        session: &mut Session<E>,
        f: Func,
    ) -> Result<T>
    where
        E: Engine,
        T: Send + 'static,
        Func: FnOnce(&mut E) -> Result<T> + Send + 'static,
    {
        let limit = ctx.effective_timeout(&self.policy);
        let span = tracing::info_span!(
            "operation",
            operation = %ctx.operation,
            session = %session.id(),
            category = %ctx.category,
        );

        async move {
            let started = Instant::now();
            let result = session.run(&ctx.operation, ctx.mutates, limit, f).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => tracing::debug!(elapsed_ms, "operation finished"),
                Err(SheetError::OperationTimeout { limit_ms, .. }) => {
                    tracing::warn!(elapsed_ms, limit_ms, "operation timed out");
                    if self.policy.terminate_on_timeout && session.terminate_handle() {
                        error!(
                            "Terminated engine of session {} after '{}' timed out",
                            session.id(),
                            ctx.operation
                        );
                    }
                }
                Err(err) => tracing::debug!(elapsed_ms, error = %err, "operation failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Annotate a failure with retryability and guidance.
    ///
    /// `in_batch` is true when the failure happened inside a caller-held
    /// session, which a fault destroys.
    pub fn classify(&self, ctx: &OperationContext, err: SheetError, in_batch: bool) -> OperationFailure {
        let (retryable, guidance) = match &err {
            SheetError::OperationTimeout { .. } => {
                let max = self.policy.limits(ctx.category).max;
                if ctx.effective_timeout(&self.policy) < max {
                    (
                        true,
                        Some(format!(
                            "Retry with a longer timeout (up to {}s for {} operations)",
                            max.as_secs(),
                            ctx.category
                        )),
                    )
                } else {
                    (
                        false,
                        Some(
                            "The operation hit the maximum timeout; check the file for dialogs, \
                             very large ranges or slow external data before retrying"
                                .to_string(),
                        ),
                    )
                }
            }
            SheetError::PoolExhausted { .. } => (
                true,
                Some("All engine handles are busy; retry shortly".to_string()),
            ),
            SheetError::EngineFault { .. } if in_batch => (
                false,
                Some("The session was closed by an engine failure; begin a new batch".to_string()),
            ),
            SheetError::EngineFault { .. } => (
                true,
                Some("The failed engine was replaced; the call can be retried".to_string()),
            ),
            SheetError::FileInUse { session, .. } => (
                true,
                Some(format!(
                    "Commit or abort session {} first, or pass its id",
                    session
                )),
            ),
            SheetError::OpenFailure { .. } => (
                false,
                Some("Check that the file exists, is not locked and is a valid workbook".to_string()),
            ),
            SheetError::SessionNotFound(_) => (
                false,
                Some("The session was committed, aborted or reaped; begin a new one".to_string()),
            ),
            _ => (false, None),
        };

        OperationFailure {
            operation: ctx.operation.clone(),
            retryable,
            guidance,
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HandleId;
    use std::path::PathBuf;
    use std::time::Duration;

    fn timeout_error() -> SheetError {
        SheetError::OperationTimeout {
            operation: "range.get".into(),
            limit_ms: 10,
        }
    }

    #[test]
    fn test_timeout_below_max_is_retryable() {
        let executor = OperationExecutor::default();
        let ctx = OperationContext::read("range.get").with_timeout(Duration::from_millis(10));
        let failure = executor.classify(&ctx, timeout_error(), false);
        assert!(failure.retryable);
        assert!(failure.guidance.is_some());
    }

    #[test]
    fn test_timeout_at_max_is_not_retryable() {
        let executor = OperationExecutor::default();
        let ctx = OperationContext::read("range.get").with_timeout(Duration::from_secs(10_000));
        let failure = executor.classify(&ctx, timeout_error(), false);
        assert!(!failure.retryable);
    }

    #[test]
    fn test_domain_failure_passes_through() {
        let executor = OperationExecutor::default();
        let ctx = OperationContext::write("range.set");
        let failure = executor.classify(&ctx, SheetError::domain("Invalid cell address 'ZZZZ1'"), true);
        assert!(!failure.retryable);
        assert_eq!(failure.to_string(), "Invalid cell address 'ZZZZ1'");
        assert_eq!(failure.operation, "range.set");
    }

    #[test]
    fn test_engine_fault_retry_depends_on_batch() {
        let executor = OperationExecutor::default();
        let ctx = OperationContext::write("range.set");
        let fault = SheetError::EngineFault {
            handle: HandleId(3),
            reason: "crashed".into(),
        };
        assert!(executor.classify(&ctx, fault.clone(), false).retryable);
        assert!(!executor.classify(&ctx, fault, true).retryable);
    }

    #[test]
    fn test_pool_exhausted_is_retryable() {
        let executor = OperationExecutor::default();
        let ctx = OperationContext::read("range.get");
        let failure = executor.classify(
            &ctx,
            SheetError::PoolExhausted {
                path: PathBuf::from("/tmp/a.json"),
                waited_ms: 30_000,
            },
            false,
        );
        assert!(failure.retryable);
    }
}
