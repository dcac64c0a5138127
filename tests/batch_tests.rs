/// Batch and session integration tests
///
/// Batches keep one file open across calls and save once on commit;
/// single-shot calls pay an acquire and a save each.
mod common;

use common::{MockEngine, file, orchestrator};
use sheetpool::{ErrorKind, OperationContext, PoolConfig, SessionKind, SessionState, TimeoutPolicy};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::tempdir;

fn set(cell: &'static str, value: f64) -> impl FnOnce(&mut MockEngine) -> sheetpool::Result<()> + Send + 'static {
    move |engine: &mut MockEngine| engine.set(cell, value)
}

#[tokio::test]
async fn test_five_writes_in_one_batch() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "book.xlsx");

    let batch = orchestrator.begin_batch(&path).await.unwrap();
    for (i, cell) in ["A1", "A2", "A3", "A4", "A5"].into_iter().enumerate() {
        orchestrator
            .with_batch(Some(batch), &path, false, &OperationContext::write("setCell"), set(cell, i as f64 + 1.0))
            .await
            .unwrap();
    }

    assert_eq!(orchestrator.stats().acquires, 1);
    assert_eq!(stats.saves(), 0);

    orchestrator.commit_batch(batch, true).await.unwrap();
    assert_eq!(stats.saves(), 1);
    assert_eq!(stats.opens(), 1);

    for (i, cell) in ["A1", "A2", "A3", "A4", "A5"].into_iter().enumerate() {
        assert_eq!(stats.saved(&path, cell), Some(i as f64 + 1.0));
    }
    assert!(orchestrator.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_single_shot_calls_acquire_and_save_each_time() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "book.xlsx");

    for (i, cell) in ["B1", "B2", "B3", "B4", "B5"].into_iter().enumerate() {
        orchestrator
            .with_batch(None, &path, true, &OperationContext::write("setCell"), set(cell, i as f64))
            .await
            .unwrap();
    }

    let pool = orchestrator.stats();
    assert_eq!(pool.acquires, 5);
    assert_eq!(pool.warm_hits, 4);
    assert_eq!(stats.saves(), 5);
    assert_eq!(stats.saved_cells(&path), 5);
}

#[tokio::test]
async fn test_single_shot_save_is_durable_before_return() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "durable.xlsx");

    orchestrator
        .with_batch(None, &path, true, &OperationContext::write("setCell"), set("C3", 42.0))
        .await
        .unwrap();
    assert_eq!(stats.saved(&path, "C3"), Some(42.0));

    // Without save the change never reaches the file, and the handle is
    // unbound so the next caller reopens from disk.
    orchestrator
        .with_batch(None, &path, false, &OperationContext::write("setCell"), set("C3", 7.0))
        .await
        .unwrap();
    assert_eq!(stats.saved(&path, "C3"), Some(42.0));

    let reread = orchestrator
        .with_batch(None, &path, false, &OperationContext::read("getCell"), |e: &mut MockEngine| Ok(e.get("C3")))
        .await
        .unwrap();
    assert_eq!(reread, Some(42.0));
}

#[tokio::test]
async fn test_abort_batch_discards_changes() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "scratch.xlsx");

    let batch = orchestrator.begin_batch(&path).await.unwrap();
    orchestrator
        .with_batch(Some(batch), &path, true, &OperationContext::write("setCell"), set("A1", 1.0))
        .await
        .unwrap();
    orchestrator.abort_batch(batch).await.unwrap();

    assert_eq!(stats.saves(), 0);
    assert_eq!(stats.saved(&path, "A1"), None);
    // The dirty handle is not handed to anyone else.
    assert_eq!(orchestrator.stats().evicted, 1);

    let failure = orchestrator
        .with_batch(Some(batch), &path, false, &OperationContext::read("getCell"), |e: &mut MockEngine| Ok(e.get("A1")))
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Usage);
    assert!(!failure.retryable);
}

#[tokio::test]
async fn test_batch_rejects_other_file() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "one.xlsx");
    let other = file(&dir, &stats, "two.xlsx");

    let batch = orchestrator.begin_batch(&path).await.unwrap();
    let failure = orchestrator
        .with_batch(Some(batch), &other, false, &OperationContext::write("setCell"), set("A1", 1.0))
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Usage);
    assert!(failure.to_string().contains("is bound to"));

    orchestrator.commit_batch(batch, false).await.unwrap();
}

#[tokio::test]
async fn test_file_held_by_batch_fails_fast() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "held.xlsx");

    let batch = orchestrator.begin_batch(&path).await.unwrap();

    let failure = orchestrator
        .with_batch(None, &path, false, &OperationContext::read("getCell"), |e: &mut MockEngine| Ok(e.get("A1")))
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Usage);
    assert!(failure.retryable);
    assert!(orchestrator.begin_batch(&path).await.is_err());

    orchestrator.commit_batch(batch, false).await.unwrap();
    orchestrator
        .with_batch(None, &path, false, &OperationContext::read("getCell"), |e: &mut MockEngine| Ok(e.get("A1")))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_in_one_batch_are_serialized() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let orchestrator = Arc::new(orchestrator);
    let path = file(&dir, &stats, "busy.xlsx");
    let batch = orchestrator.begin_batch(&path).await.unwrap();

    let mut handles = vec![];
    for _ in 0..4 {
        let orchestrator = Arc::clone(&orchestrator);
        let path = path.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .with_batch(Some(batch), &path, false, &OperationContext::read("work"), |e: &mut MockEngine| {
                    e.work(Duration::from_millis(20))
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(!stats.overlap.load(Ordering::SeqCst));
    assert_eq!(orchestrator.stats().acquires, 1);
    orchestrator.commit_batch(batch, false).await.unwrap();
}

#[tokio::test]
async fn test_fault_closes_batch() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "fragile.xlsx");

    let batch = orchestrator.begin_batch(&path).await.unwrap();
    orchestrator
        .with_batch(Some(batch), &path, false, &OperationContext::write("setCell"), set("A1", 1.0))
        .await
        .unwrap();

    let failure = orchestrator
        .with_batch(Some(batch), &path, false, &OperationContext::write("crash"), |_e: &mut MockEngine| -> sheetpool::Result<()> {
            panic!("engine crashed")
        })
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::EngineFault);
    assert!(!failure.retryable);

    assert!(orchestrator.list_sessions().await.is_empty());
    assert!(orchestrator.commit_batch(batch, true).await.is_err());
    assert_eq!(stats.saves(), 0);

    // The file can be opened again on a fresh engine.
    let again = orchestrator.begin_batch(&path).await.unwrap();
    orchestrator.abort_batch(again).await.unwrap();
}

#[tokio::test]
async fn test_domain_error_keeps_batch_open() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let path = file(&dir, &stats, "strict.xlsx");

    let batch = orchestrator.begin_batch(&path).await.unwrap();
    let failure = orchestrator
        .with_batch(Some(batch), &path, false, &OperationContext::write("reject"), |_e: &mut MockEngine| -> sheetpool::Result<()> {
            Err(sheetpool::SheetError::domain("Sheet 'Nope' not found"))
        })
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Domain);
    assert_eq!(failure.to_string(), "Sheet 'Nope' not found");

    orchestrator
        .with_batch(Some(batch), &path, false, &OperationContext::write("setCell"), set("A1", 3.0))
        .await
        .unwrap();
    orchestrator.commit_batch(batch, true).await.unwrap();
    assert_eq!(stats.saved(&path, "A1"), Some(3.0));
}

#[tokio::test]
async fn test_interactive_session_lifecycle() {
    let dir = tempdir().unwrap();
    let (orchestrator, stats) = orchestrator(PoolConfig::new(), TimeoutPolicy::new()).await;
    let first = file(&dir, &stats, "first.xlsx");
    let second = file(&dir, &stats, "second.xlsx");

    let session = orchestrator.open_session(&first).await.unwrap();
    let _batch = orchestrator.begin_batch(&second).await.unwrap();

    orchestrator
        .with_session(session, &OperationContext::write("setCell"), set("D4", 9.0))
        .await
        .unwrap();

    let sessions = orchestrator.list_sessions().await;
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, session);
    assert_eq!(sessions[0].kind, SessionKind::Interactive);
    assert_eq!(sessions[0].state, SessionState::Open);
    assert!(sessions[0].dirty);
    assert_eq!(sessions[0].operations, 1);
    assert_eq!(sessions[1].kind, SessionKind::Batch);
    assert!(!sessions[1].dirty);

    orchestrator.close_session(session, true).await.unwrap();
    assert_eq!(stats.saved(&first, "D4"), Some(9.0));
    assert!(orchestrator.close_session(session, true).await.is_err());

    // Shutdown closes what is left.
    orchestrator.shutdown().await.unwrap();
    assert!(orchestrator.list_sessions().await.is_empty());
}
