#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Durable workflow resume, retry and approval tests.

use async_trait::async_trait;
use conductor_checkpoint::{
    CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore, StepCheckpoint, StepStatus,
    WorkflowStatus,
};
use conductor_core::{
    ApprovalChannel, ApprovalRequest, ApprovalStatus, ConductorError, ConductorResult,
    Notification, NotificationKind, Notifier, Payload, RiskLevel,
};
use conductor_workflow::{force_resume, DurableWorkflow, StepOptions};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn payload(key: &str, value: serde_json::Value) -> Payload {
    let mut p = Payload::new();
    p.insert(key.to_string(), value);
    p
}

fn counting_step(
    counter: &Arc<AtomicU32>,
    key: &'static str,
) -> impl FnMut(Payload) -> std::future::Ready<ConductorResult<Payload>> {
    let counter = Arc::clone(counter);
    move |_input| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(payload(key, json!(true))))
    }
}

#[tokio::test]
async fn completed_steps_are_not_rerun() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let calls = Arc::new(AtomicU32::new(0));

    let mut wf = DurableWorkflow::open(store.clone(), "wf-idem", "demo").await.unwrap();
    let first = wf
        .step("fetch", Payload::new(), counting_step(&calls, "fetched"))
        .await
        .unwrap();
    drop(wf);

    let mut wf = DurableWorkflow::open(store, "wf-idem", "demo").await.unwrap();
    let again = wf
        .step("fetch", Payload::new(), counting_step(&calls, "fetched"))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, again);
    assert_eq!(wf.checkpoint().steps_completed, 1);
}

#[tokio::test]
async fn retries_follow_backoff_schedule() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let mut wf = DurableWorkflow::open(store.clone(), "wf-backoff", "demo").await.unwrap();
    let opts = StepOptions::default()
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(40), Duration::from_secs(5));

    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let started = Instant::now();
    let out = wf
        .step_with("flaky", Payload::new(), opts, move |_| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ConductorError::Handler(format!("transient #{n}")))
                } else {
                    Ok(payload("ok", json!(n)))
                }
            }
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(out["ok"], json!(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 40ms before attempt 2, 80ms before attempt 3.
    assert!(elapsed >= Duration::from_millis(120), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");

    let step = store.get_step("wf-backoff", "flaky").await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.retry_count, 2);
}

#[tokio::test]
async fn io_errors_are_retried() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let mut wf = DurableWorkflow::open(store.clone(), "wf-io", "demo").await.unwrap();
    let opts = StepOptions::default()
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5));

    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let out = wf
        .step_with("net", Payload::new(), opts, move |_| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ConductorError::Io(std::io::Error::from(
                        std::io::ErrorKind::ConnectionReset,
                    )))
                } else {
                    Ok(payload("rows", json!(7)))
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(out["rows"], json!(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let step = store.get_step("wf-io", "net").await.unwrap().unwrap();
    assert_eq!(step.retry_count, 1);
}

#[tokio::test]
async fn restart_keeps_spent_attempts() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let wf = DurableWorkflow::open(store.clone(), "wf-loop", "demo").await.unwrap();
    drop(wf);

    // A previous process already burned two of three attempts.
    let mut seeded = StepCheckpoint::new("wf-loop", "sync", 1, Payload::new(), 3);
    seeded.mark_running();
    seeded.mark_retrying("upstream 502");
    seeded.mark_running();
    seeded.mark_retrying("upstream 502");
    store.save_step(&seeded).await.unwrap();

    let opts = StepOptions::default()
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5));
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let mut wf = DurableWorkflow::open(store.clone(), "wf-loop", "demo").await.unwrap();
    let err = wf
        .step_with("sync", Payload::new(), opts, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ConductorError::Handler("upstream 502".into())) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, ConductorError::StepFailed { attempts: 3, .. }));
    let step = store.get_step("wf-loop", "sync").await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.retry_count <= step.max_retries);
}

#[tokio::test]
async fn interrupted_last_attempt_fails_without_rerun() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    drop(DurableWorkflow::open(store.clone(), "wf-crash", "demo").await.unwrap());

    // Two failed attempts, then the process died during the third.
    let mut seeded = StepCheckpoint::new("wf-crash", "sync", 1, Payload::new(), 3);
    seeded.mark_retrying("timeout");
    seeded.mark_retrying("timeout");
    seeded.mark_running();
    store.save_step(&seeded).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let mut wf = DurableWorkflow::open(store.clone(), "wf-crash", "demo").await.unwrap();
    let err = wf
        .step_with(
            "sync",
            Payload::new(),
            StepOptions::default().with_max_retries(3),
            counting_step(&calls, "synced"),
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(err, ConductorError::StepFailed { attempts: 3, .. }));
    assert_eq!(wf.status(), WorkflowStatus::Failed);
}

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> ConductorResult<()> {
        self.seen.lock().unwrap().push(notification);
        Ok(())
    }
}

#[tokio::test]
async fn exhausted_retries_fail_workflow_and_notify() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut wf = DurableWorkflow::open(store.clone(), "wf-fail", "demo")
        .await
        .unwrap()
        .with_notifier(notifier.clone())
        .with_defaults(
            StepOptions::default().with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
        );

    let err = wf
        .step("send", Payload::new(), |_| async {
            Err(ConductorError::Handler("smtp 503".into()))
        })
        .await
        .unwrap_err();

    match err {
        ConductorError::StepFailed {
            workflow_id,
            step,
            attempts,
            last_error,
        } => {
            assert_eq!(workflow_id, "wf-fail");
            assert_eq!(step, "send");
            assert_eq!(attempts, 3);
            assert!(last_error.contains("smtp 503"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let stored = store.get_workflow("wf-fail").await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);

    let rejected = wf
        .step("after", Payload::new(), |_| async { Ok(Payload::new()) })
        .await
        .unwrap_err();
    assert!(matches!(rejected, ConductorError::StateConflict(_)));

    for _ in 0..50 {
        if !notifier.seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let seen = notifier.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, NotificationKind::WorkflowFailed);
    assert_eq!(seen[0].attempts, 3);
}

struct DeferredApprovals;

#[async_trait]
impl ApprovalChannel for DeferredApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> ConductorResult<ApprovalStatus> {
        if request.risk >= RiskLevel::High {
            Ok(ApprovalStatus::Pending {
                approval_id: "apr-1".into(),
            })
        } else {
            Ok(ApprovalStatus::Approved)
        }
    }
}

#[tokio::test]
async fn approval_parks_workflow_until_resumed() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let mut wf = DurableWorkflow::open(store.clone(), "wf-apr", "outreach").await.unwrap();

    let low = ApprovalRequest::new("draft_email", Payload::new(), RiskLevel::Low);
    assert_eq!(
        wf.request_approval(&DeferredApprovals, low).await.unwrap(),
        ApprovalStatus::Approved
    );
    assert_eq!(wf.status(), WorkflowStatus::InProgress);

    let high = ApprovalRequest::new("send_email", Payload::new(), RiskLevel::High);
    wf.request_approval(&DeferredApprovals, high).await.unwrap();
    assert_eq!(wf.status(), WorkflowStatus::AwaitingApproval);
    assert_eq!(wf.context()["approval_id"], json!("apr-1"));
    drop(wf);

    // The approval callback arrives in another process.
    force_resume(&*store, "wf-apr").await.unwrap();

    let mut wf = DurableWorkflow::open(store, "wf-apr", "outreach").await.unwrap();
    assert_eq!(wf.status(), WorkflowStatus::InProgress);
    wf.step("send", Payload::new(), |_| async { Ok(Payload::new()) })
        .await
        .unwrap();
    wf.complete(Payload::new()).await.unwrap();
}

#[tokio::test]
async fn lead_workflow_survives_crash_with_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wf.db");

    let fetches = Arc::new(AtomicU32::new(0));
    let enrich_attempts = Arc::new(AtomicU32::new(0));
    let finalizes = Arc::new(AtomicU32::new(0));

    // First run: fetch completes, then the process dies inside enrich.
    {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
        let mut wf = DurableWorkflow::open(store, "wf-1", "lead_enrichment").await.unwrap();
        wf.set_steps_total(3).await.unwrap();
        let lead = wf
            .step("fetch", payload("lead_id", json!("L-42")), counting_step(&fetches, "lead"))
            .await
            .unwrap();
        assert_eq!(lead["lead"], json!(true));

        let crashing = Arc::clone(&enrich_attempts);
        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            wf.step("enrich", Payload::new(), move |_| {
                crashing.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Payload::new())
                }
            }),
        )
        .await;
        // The outer deadline plays the role of the crash: the step future is
        // dropped while the step checkpoint still says Running.
        assert!(outcome.is_err());
        assert_eq!(enrich_attempts.load(Ordering::SeqCst), 1);
    }

    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
    let pending = conductor_workflow::recoverable(&*store).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].current_step.as_deref(), Some("fetch"));

    let mut wf = DurableWorkflow::open(store.clone(), "wf-1", "lead_enrichment").await.unwrap();
    assert!(wf.is_resumed());
    wf.step("fetch", payload("lead_id", json!("L-42")), counting_step(&fetches, "lead"))
        .await
        .unwrap();
    wf.step("enrich", Payload::new(), counting_step(&enrich_attempts, "enriched"))
        .await
        .unwrap();
    wf.step("finalize", Payload::new(), counting_step(&finalizes, "final"))
        .await
        .unwrap();
    wf.complete(payload("status", json!("done"))).await.unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    // Once before the crash, once after: at-least-once for the interrupted step.
    assert_eq!(enrich_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);
    assert!((wf.progress() - 1.0).abs() < f64::EPSILON);

    let steps = store.list_steps("wf-1").await.unwrap();
    let order: Vec<(&str, u64)> = steps
        .iter()
        .map(|s| (s.step_name.as_str(), s.sequence))
        .collect();
    assert_eq!(order, vec![("fetch", 1), ("enrich", 2), ("finalize", 3)]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    // The interrupted attempt counts against the enrich budget.
    assert_eq!(steps[1].retry_count, 1);

    let stored = store.get_workflow("wf-1").await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(stored.context["result"]["status"], json!("done"));
}

#[tokio::test]
async fn process_killed_after_fetch_runs_rest_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wf.db");

    let fetches = Arc::new(AtomicU32::new(0));
    let enriches = Arc::new(AtomicU32::new(0));
    let finalizes = Arc::new(AtomicU32::new(0));

    // First process: fetch completes, then the process is killed.
    {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
        let mut wf = DurableWorkflow::open(store, "wf-1", "lead_enrichment").await.unwrap();
        wf.step("fetch", payload("lead_id", json!("L-7")), counting_step(&fetches, "lead"))
            .await
            .unwrap();
    }

    // Second process runs the whole workflow from the top.
    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
    let mut wf = DurableWorkflow::open(store.clone(), "wf-1", "lead_enrichment").await.unwrap();
    let lead = wf
        .step("fetch", payload("lead_id", json!("L-7")), counting_step(&fetches, "lead"))
        .await
        .unwrap();
    wf.step("enrich", lead, counting_step(&enriches, "enriched"))
        .await
        .unwrap();
    wf.step("finalize", Payload::new(), counting_step(&finalizes, "final"))
        .await
        .unwrap();
    wf.complete(Payload::new()).await.unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(enriches.load(Ordering::SeqCst), 1);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);

    let steps = store.list_steps("wf-1").await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.retry_count == 0));
    let stored = store.get_workflow("wf-1").await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(stored.steps_completed, 3);
}
