// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciling executions and their deploy items over the SQLite backend.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::{
    NAMESPACE, ScriptedWorker, drive, item, reconcilers, request_abort, request_deletion,
    seed_execution, sqlite_backend, start_job,
};
use steward_controller::process::ProcessRegistry;
use steward_controller::reconciler::ReconcileResult;
use steward_core::lock::{DEFAULT_NOT_LOCKED_REQUEUE, lock_name};
use steward_core::{
    ControlPlane, ItemKind, LockRecord, Phase, TimeoutConfig, WorkItemStore, WorkState,
};

#[tokio::test]
async fn test_execution_runs_items_in_dependency_order() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(
        backend.as_ref(),
        "exec",
        vec![item("A", &[]), item("B", &["A"]), item("C", &["A", "B"])],
        "job-1",
    )
    .await;

    let parent = drive(backend.as_ref(), &r, "exec", 20)
        .await
        .expect("parent should still exist");

    assert_eq!(parent.status.phase, Phase::Succeeded);
    assert_eq!(parent.status.job_id_finished, "job-1");
    assert_eq!(worker.first_polls(false), vec!["A", "B", "C"]);

    for stored in backend.list_items(NAMESPACE, "exec").await.unwrap() {
        assert_eq!(stored.item.phase, Phase::Succeeded, "{}", stored.item.name);
        assert_eq!(stored.item.job_id_finished, "job-1");
        assert!(stored.item.init_time.is_some());
        assert!(stored.item.finished_time.is_some());
    }
}

#[tokio::test]
async fn test_deletion_tears_items_down_in_reverse_order() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(
        backend.as_ref(),
        "exec",
        vec![item("A", &[]), item("B", &["A"]), item("C", &["A", "B"])],
        "job-1",
    )
    .await;
    drive(backend.as_ref(), &r, "exec", 20).await.unwrap();

    request_deletion(backend.as_ref(), "exec", "job-2").await;
    let parent = drive(backend.as_ref(), &r, "exec", 20).await;

    assert!(parent.is_none(), "parent should be deleted");
    assert!(backend.list_items(NAMESPACE, "exec").await.unwrap().is_empty());
    assert_eq!(worker.first_polls(true), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_cyclic_graph_fails_parent_without_running_items() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(
        backend.as_ref(),
        "exec",
        vec![item("A", &["B"]), item("B", &["A"])],
        "job-1",
    )
    .await;

    let result = r.parents.reconcile(NAMESPACE, "exec").await.unwrap();
    assert_eq!(result, ReconcileResult::Done);

    let parent = backend.get_parent(NAMESPACE, "exec").await.unwrap().unwrap();
    assert_eq!(parent.status.phase, Phase::Failed);
    let error = parent.status.last_error.unwrap();
    assert_eq!(error.reason, "InvalidGraph");
    assert!(error.message.contains("dependency cycle"), "{}", error.message);

    for stored in backend.list_items(NAMESPACE, "exec").await.unwrap() {
        assert!(stored.item.job_id.is_empty());
    }
    assert!(worker.first_polls(false).is_empty());
}

#[tokio::test]
async fn test_undefined_dependency_fails_parent() {
    let backend = sqlite_backend().await;
    let r = reconcilers(
        backend.clone(),
        Arc::new(ScriptedWorker::new()),
        TimeoutConfig::default(),
    );

    seed_execution(backend.as_ref(), "exec", vec![item("A", &["Z"])], "job-1").await;

    let parent = drive(backend.as_ref(), &r, "exec", 3).await.unwrap();
    assert_eq!(parent.status.phase, Phase::Failed);
    let message = parent.status.last_error.unwrap().message;
    assert_eq!(message, "item 'A' depends on undefined item 'Z'");
}

#[tokio::test]
async fn test_failed_item_blocks_dependents() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    worker.answer("A", WorkState::Failed);
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(
        backend.as_ref(),
        "exec",
        vec![item("A", &[]), item("B", &["A"]), item("C", &["B"])],
        "job-1",
    )
    .await;

    let parent = drive(backend.as_ref(), &r, "exec", 20).await.unwrap();
    assert_eq!(parent.status.phase, Phase::Failed);

    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Failed);
    for name in ["B", "C"] {
        let stored = backend.get_item(NAMESPACE, "exec", name).await.unwrap().unwrap();
        assert!(stored.item.job_id.is_empty(), "{} should never start", name);
    }
    assert_eq!(worker.first_polls(false), vec!["A"]);
}

#[tokio::test]
async fn test_worker_error_is_recorded_on_item() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    worker.fail("A");
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(backend.as_ref(), "exec", vec![item("A", &[])], "job-1").await;
    let parent = drive(backend.as_ref(), &r, "exec", 10).await.unwrap();
    assert_eq!(parent.status.phase, Phase::Failed);

    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Failed);
    let error = a.item.last_error.unwrap();
    assert_eq!(error.operation, "Reconcile");
    assert_eq!(error.reason, "WorkerError");
    assert_eq!(error.message, "worker for A crashed");
}

#[tokio::test]
async fn test_item_stuck_progressing_is_failed() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    worker.answer("A", WorkState::Running);
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(backend.as_ref(), "exec", vec![item("A", &[])], "job-1").await;
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();
    r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();

    let mut a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Progressing);
    a.item.init_time = Some(Utc::now() - ChronoDuration::hours(1));
    backend.update_item(&a, a.version).await.unwrap();

    let result = r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();
    assert_eq!(result, ReconcileResult::Done);

    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Failed);
    let error = a.item.last_error.unwrap();
    assert_eq!(error.reason, "ProgressingTimeout");
    assert_eq!(error.operation, "WaitingForCompletion");
}

#[tokio::test]
async fn test_item_never_picked_up_is_failed() {
    let backend = sqlite_backend().await;
    let r = reconcilers(
        backend.clone(),
        Arc::new(ScriptedWorker::new()),
        TimeoutConfig::default(),
    );

    seed_execution(backend.as_ref(), "exec", vec![item("A", &[])], "job-1").await;
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();

    let mut a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Init);
    a.item.trigger_time = Some(Utc::now() - ChronoDuration::hours(1));
    backend.update_item(&a, a.version).await.unwrap();

    r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();

    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Failed);
    assert_eq!(a.item.last_error.unwrap().reason, "PickupTimeout");
}

#[tokio::test]
async fn test_item_held_by_live_process_is_requeued() {
    let backend = sqlite_backend().await;
    let r = reconcilers(
        backend.clone(),
        Arc::new(ScriptedWorker::new()),
        TimeoutConfig::default(),
    );

    seed_execution(backend.as_ref(), "exec", vec![item("A", &[])], "job-1").await;
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();

    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    let target = a.target(ItemKind::DeployItem);
    backend.register("p2").await.unwrap();
    backend
        .create_lock(&LockRecord::new(
            lock_name("di", &a.uid),
            &target,
            "p2",
            Utc::now(),
        ))
        .await
        .unwrap();

    let result = r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();
    assert_eq!(
        result,
        ReconcileResult::RequeueAfter(DEFAULT_NOT_LOCKED_REQUEUE)
    );
    let unchanged = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(unchanged.version, a.version);
    assert_eq!(unchanged.item.phase, Phase::Init);

    // p2 goes away; its lock is taken over and released again.
    backend.deregister("p2").await.unwrap();
    r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();

    let moved = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(moved.item.phase, Phase::Progressing);
    let lock = backend
        .get_lock(NAMESPACE, &lock_name("di", &a.uid))
        .await
        .unwrap()
        .unwrap();
    assert!(!lock.is_held());
}

#[tokio::test]
async fn test_new_job_leaves_item_held_by_live_process_alone() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    worker.answer("A", WorkState::Running);
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(backend.as_ref(), "exec", vec![item("A", &[])], "job-1").await;
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();
    r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();

    // p2 is still working on A under job-1.
    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Progressing);
    backend.register("p2").await.unwrap();
    let mut record = backend
        .get_lock(NAMESPACE, &lock_name("di", &a.uid))
        .await
        .unwrap()
        .unwrap();
    record.owner = "p2".to_string();
    backend.write_lock(&record).await.unwrap();

    start_job(backend.as_ref(), "exec", "job-2").await;
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();

    let untouched = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(untouched.version, a.version);
    assert_eq!(untouched.item.job_id, "job-1");
    assert_eq!(untouched.item.phase, Phase::Progressing);
    let parent = backend.get_parent(NAMESPACE, "exec").await.unwrap().unwrap();
    assert!(!parent.status.is_finished());

    // Once p2 is gone the item restarts under the new job.
    backend.deregister("p2").await.unwrap();
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();

    let restarted = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(restarted.item.job_id, "job-2");
    assert_eq!(restarted.item.phase, Phase::Init);
    let lock = backend
        .get_lock(NAMESPACE, &lock_name("di", &a.uid))
        .await
        .unwrap()
        .unwrap();
    assert!(!lock.is_held());
}

#[tokio::test]
async fn test_abort_not_honoured_fails_item_and_parent() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    worker.answer("A", WorkState::Running);
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(
        backend.as_ref(),
        "exec",
        vec![item("A", &[]), item("B", &["A"])],
        "job-1",
    )
    .await;
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();
    r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();

    let requested_at = Utc::now() - ChronoDuration::minutes(10);
    request_abort(backend.as_ref(), "exec", requested_at).await;
    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();

    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.abort_requested_at, Some(requested_at));
    assert_eq!(a.item.phase, Phase::Progressing);

    r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap();
    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(a.item.phase, Phase::Failed);
    let error = a.item.last_error.unwrap();
    assert_eq!(error.reason, "AbortingTimeout");
    assert_eq!(error.operation, "WaitingForAbort");

    r.parents.reconcile(NAMESPACE, "exec").await.unwrap();
    let parent = backend.get_parent(NAMESPACE, "exec").await.unwrap().unwrap();
    assert_eq!(parent.status.phase, Phase::Failed);

    let b = backend.get_item(NAMESPACE, "exec", "B").await.unwrap().unwrap();
    assert!(b.item.job_id.is_empty());
    assert_eq!(b.item.phase, Phase::Init);
}

#[tokio::test]
async fn test_abort_before_pickup_stops_the_job() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(backend.as_ref(), "exec", vec![item("A", &[])], "job-1").await;
    request_abort(backend.as_ref(), "exec", Utc::now()).await;

    let result = r.parents.reconcile(NAMESPACE, "exec").await.unwrap();
    assert_eq!(result, ReconcileResult::Done);

    let parent = backend.get_parent(NAMESPACE, "exec").await.unwrap().unwrap();
    assert_eq!(parent.status.phase, Phase::Failed);
    assert_eq!(parent.status.last_error.unwrap().reason, "Aborted");

    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert!(a.item.job_id.is_empty());
    assert!(worker.first_polls(false).is_empty());
}

#[tokio::test]
async fn test_finished_job_is_not_reconciled_again() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(
        backend.as_ref(),
        "exec",
        vec![item("A", &[]), item("B", &["A"])],
        "job-1",
    )
    .await;
    let parent = drive(backend.as_ref(), &r, "exec", 20).await.unwrap();
    let a = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();

    for _ in 0..2 {
        assert_eq!(
            r.items.reconcile(NAMESPACE, "exec", "A").await.unwrap(),
            ReconcileResult::Done
        );
        assert_eq!(
            r.parents.reconcile(NAMESPACE, "exec").await.unwrap(),
            ReconcileResult::Done
        );
    }

    let again = backend.get_item(NAMESPACE, "exec", "A").await.unwrap().unwrap();
    assert_eq!(again.version, a.version);
    assert_eq!(again.item.phase, Phase::Succeeded);
    let parent_again = backend.get_parent(NAMESPACE, "exec").await.unwrap().unwrap();
    assert_eq!(parent_again.version, parent.version);
}

#[tokio::test]
async fn test_new_job_restarts_every_item() {
    let backend = sqlite_backend().await;
    let worker = Arc::new(ScriptedWorker::new());
    let r = reconcilers(backend.clone(), worker.clone(), TimeoutConfig::default());

    seed_execution(
        backend.as_ref(),
        "exec",
        vec![item("A", &[]), item("B", &["A"])],
        "job-1",
    )
    .await;
    drive(backend.as_ref(), &r, "exec", 20).await.unwrap();

    start_job(backend.as_ref(), "exec", "job-2").await;
    let parent = drive(backend.as_ref(), &r, "exec", 20).await.unwrap();

    assert_eq!(parent.status.phase, Phase::Succeeded);
    assert_eq!(parent.status.job_id_finished, "job-2");
    for stored in backend.list_items(NAMESPACE, "exec").await.unwrap() {
        assert_eq!(stored.item.job_id_finished, "job-2");
        assert_eq!(stored.item.phase, Phase::Succeeded);
    }
}
