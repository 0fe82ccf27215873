// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use map_reduce_core::{
    AssignedWork, BufferLocation, Coordinator, CoordinatorSettings, FailureKind, JobError,
    JobStatus, ReportAck, SegmentLocation, TaskAssignment, TaskFailure, TaskOutcome, TaskOutput,
    TaskReport, TaskResponse, TaskStatus,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_millis(100);

fn coordinator(num_maps: usize, num_partitions: usize, max_attempts: u32) -> Coordinator {
    Coordinator::new(
        num_maps,
        num_partitions,
        CoordinatorSettings {
            task_timeout: Some(TIMEOUT),
            max_attempts,
        },
    )
    .unwrap()
}

fn assigned(response: TaskResponse) -> TaskAssignment {
    match response {
        TaskResponse::Assigned(assignment) => assignment,
        other => panic!("Expected an assignment, got {:?}", other),
    }
}

fn map_output(assignment: &TaskAssignment, num_partitions: usize) -> TaskOutcome {
    TaskOutcome::Success(TaskOutput::Map(
        (0..num_partitions)
            .map(|partition| BufferLocation {
                map_task: assignment.task_id,
                attempt: assignment.attempt,
                partition,
                records: 1,
            })
            .collect(),
    ))
}

fn reduce_output(assignment: &TaskAssignment) -> TaskOutcome {
    let AssignedWork::Reduce { partition, .. } = assignment.work else {
        panic!("Expected a reduce assignment");
    };
    TaskOutcome::Success(TaskOutput::Reduce(SegmentLocation {
        partition,
        attempt: assignment.attempt,
        path: PathBuf::from(format!("part-{}.attempt-{}", partition, assignment.attempt)),
        records: 1,
    }))
}

fn report(assignment: &TaskAssignment, worker_id: usize, outcome: TaskOutcome) -> TaskReport {
    TaskReport {
        task_id: assignment.task_id,
        worker_id,
        attempt: assignment.attempt,
        outcome,
    }
}

fn failure() -> TaskOutcome {
    TaskOutcome::Failure(TaskFailure::new(FailureKind::TaskExecution, "boom"))
}

// ============================================================
// Job validation
// ============================================================

#[test]
fn test_safety_rejects_job_without_tasks() {
    let settings = CoordinatorSettings {
        task_timeout: None,
        max_attempts: 1,
    };
    assert!(matches!(
        Coordinator::new(0, 1, settings),
        Err(JobError::InvalidJob(_))
    ));
    assert!(matches!(
        Coordinator::new(1, 0, settings),
        Err(JobError::InvalidJob(_))
    ));
}

#[test]
fn test_liveness_first_assignment_starts_job() {
    let coordinator = coordinator(1, 1, 3);
    assert_eq!(coordinator.status(), JobStatus::Pending);

    assigned(coordinator.request_task(0));
    assert_eq!(coordinator.status(), JobStatus::Running);
}

// ============================================================
// Map -> reduce barrier
// ============================================================

#[test]
fn test_safety_no_reduce_before_all_maps_complete() {
    let coordinator = coordinator(2, 2, 3);

    let m0 = assigned(coordinator.request_task(0));
    let m1 = assigned(coordinator.request_task(1));
    assert!(matches!(m0.work, AssignedWork::Map { split: 0, .. }));
    assert!(matches!(m1.work, AssignedWork::Map { split: 1, .. }));

    // Every map is in progress; reduces stay behind the barrier
    assert_eq!(coordinator.request_task(2), TaskResponse::Wait);

    assert_eq!(
        coordinator.report_task_result(report(&m0, 0, map_output(&m0, 2))),
        ReportAck::Accepted
    );
    assert_eq!(coordinator.request_task(2), TaskResponse::Wait);

    assert_eq!(
        coordinator.report_task_result(report(&m1, 1, map_output(&m1, 2))),
        ReportAck::Accepted
    );
    let r = assigned(coordinator.request_task(2));
    match r.work {
        AssignedWork::Reduce { partition, inputs } => {
            assert_eq!(partition, 0);
            assert_eq!(inputs.len(), 2, "Reduce reads one buffer per map task");
            assert!(inputs.iter().all(|l| l.partition == 0));
        }
        other => panic!("Expected a reduce task, got {:?}", other),
    }
}

#[test]
fn test_liveness_job_succeeds_after_every_reduce_and_commit() {
    let coordinator = coordinator(1, 2, 3);
    let mut status_rx = coordinator.subscribe();

    let m = assigned(coordinator.request_task(0));
    coordinator.report_task_result(report(&m, 0, map_output(&m, 2)));

    let r0 = assigned(coordinator.request_task(0));
    let r1 = assigned(coordinator.request_task(1));
    coordinator.report_task_result(report(&r1, 1, reduce_output(&r1)));
    assert_eq!(coordinator.status(), JobStatus::Running);
    assert!(!coordinator.is_committing());
    assert!(coordinator.committed_segments().is_err());

    status_rx.borrow_and_update();
    coordinator.report_task_result(report(&r0, 0, reduce_output(&r0)));
    // Every reduce is done, but nothing is published until the commit
    assert_eq!(coordinator.status(), JobStatus::Running);
    assert!(coordinator.is_committing());
    assert!(status_rx.has_changed().unwrap(), "Watchers are woken");
    assert!(!coordinator.cancel(), "A committing job cannot be cancelled");
    assert!(matches!(coordinator.request_task(2), TaskResponse::Wait));

    let segments = coordinator.committed_segments().unwrap();
    assert_eq!(
        segments.iter().map(|s| s.partition).collect::<Vec<_>>(),
        vec![0, 1]
    );

    assert!(coordinator.finish_commit(Ok(())));
    assert!(!coordinator.finish_commit(Ok(())), "Commit ends only once");
    assert_eq!(coordinator.status(), JobStatus::Succeeded);
    assert_eq!(*status_rx.borrow_and_update(), JobStatus::Succeeded);
    assert!(matches!(
        coordinator.request_task(0),
        TaskResponse::Done(JobStatus::Succeeded)
    ));
}

#[test]
fn test_safety_failed_commit_fails_job() {
    let coordinator = coordinator(1, 1, 3);
    let m = assigned(coordinator.request_task(0));
    coordinator.report_task_result(report(&m, 0, map_output(&m, 1)));
    let r = assigned(coordinator.request_task(0));
    coordinator.report_task_result(report(&r, 0, reduce_output(&r)));

    assert!(coordinator.finish_commit(Err(JobError::Storage("rename failed".into()))));
    assert_eq!(coordinator.status(), JobStatus::Failed);
    assert!(matches!(coordinator.failure(), Some(JobError::Storage(_))));
    assert!(coordinator.committed_segments().is_err());
    assert!(matches!(
        coordinator.request_task(0),
        TaskResponse::Done(JobStatus::Failed)
    ));
}

#[test]
fn test_safety_commit_outcome_ignored_while_tasks_remain() {
    let coordinator = coordinator(1, 1, 3);
    assigned(coordinator.request_task(0));

    assert!(!coordinator.finish_commit(Ok(())));
    assert_eq!(coordinator.status(), JobStatus::Running);
}

#[test]
fn test_safety_map_output_missing_partition_is_a_failure() {
    let coordinator = coordinator(1, 2, 3);
    let m = assigned(coordinator.request_task(0));

    let ack = coordinator.report_task_result(report(&m, 0, map_output(&m, 1)));
    assert_eq!(ack, ReportAck::Accepted);
    assert_eq!(coordinator.progress().maps_completed, 0);

    let task = coordinator.task(m.task_id).unwrap();
    assert_eq!(task.status(), TaskStatus::Idle);
    assert_eq!(task.last_failure().unwrap().kind, FailureKind::Storage);
}

// ============================================================
// Attempt fencing
// ============================================================

#[test]
fn test_safety_stale_report_after_timeout_is_ignored() {
    let coordinator = coordinator(1, 1, 3);
    let first = assigned(coordinator.request_task(0));

    let expired = coordinator.check_timeouts(Instant::now() + TIMEOUT * 2);
    assert_eq!(expired, vec![first.task_id]);

    let second = assigned(coordinator.request_task(1));
    assert_eq!(second.task_id, first.task_id);
    assert_eq!(second.attempt, first.attempt + 1);

    // The original worker finishes late
    assert_eq!(
        coordinator.report_task_result(report(&first, 0, map_output(&first, 1))),
        ReportAck::Stale
    );
    assert_eq!(coordinator.progress().maps_completed, 0);

    assert_eq!(
        coordinator.report_task_result(report(&second, 1, map_output(&second, 1))),
        ReportAck::Accepted
    );
    assert_eq!(coordinator.progress().maps_completed, 1);
}

#[test]
fn test_safety_report_from_wrong_worker_is_stale() {
    let coordinator = coordinator(1, 1, 3);
    let m = assigned(coordinator.request_task(7));

    assert_eq!(
        coordinator.report_task_result(report(&m, 8, map_output(&m, 1))),
        ReportAck::Stale
    );
    assert_eq!(
        coordinator.task(m.task_id).unwrap().status(),
        TaskStatus::InProgress
    );
}

#[tokio::test(start_paused = true)]
async fn test_liveness_attempt_expires_once_clock_passes_timeout() {
    let coordinator = coordinator(1, 1, 3);
    let first = assigned(coordinator.request_task(0));

    tokio::time::advance(TIMEOUT - Duration::from_millis(1)).await;
    assert!(coordinator.check_timeouts(Instant::now()).is_empty());

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(coordinator.check_timeouts(Instant::now()), vec![first.task_id]);

    let second = assigned(coordinator.request_task(1));
    assert_eq!(second.attempt, first.attempt + 1);
    assert_eq!(coordinator.progress().failed_attempts, 1);
}

#[test]
fn test_safety_timeout_scan_ignores_fresh_attempts() {
    let coordinator = coordinator(2, 1, 3);
    assigned(coordinator.request_task(0));

    assert!(coordinator.check_timeouts(Instant::now()).is_empty());
    assert_eq!(coordinator.progress().in_progress, 1);
}

// ============================================================
// Retries
// ============================================================

#[test]
fn test_liveness_failed_attempt_is_requeued() {
    let coordinator = coordinator(1, 1, 3);
    let first = assigned(coordinator.request_task(0));

    assert_eq!(
        coordinator.report_task_result(report(&first, 0, failure())),
        ReportAck::Accepted
    );
    let retry = assigned(coordinator.request_task(1));
    assert_eq!(retry.task_id, first.task_id);
    assert_eq!(retry.attempt, 2);
    assert_eq!(coordinator.progress().failed_attempts, 1);
}

#[test]
fn test_safety_retry_ceiling_fails_job() {
    let coordinator = coordinator(2, 1, 2);

    let a = assigned(coordinator.request_task(0));
    coordinator.report_task_result(report(&a, 0, failure()));
    let b = assigned(coordinator.request_task(0));
    assert_eq!(b.task_id, a.task_id);
    coordinator.report_task_result(report(&b, 0, failure()));

    assert_eq!(coordinator.status(), JobStatus::Failed);
    match coordinator.failure() {
        Some(JobError::RetryCeilingExceeded(tasks)) => {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].task_id, a.task_id);
            assert_eq!(tasks[0].attempts, 2);
            assert_eq!(tasks[0].last_failure, FailureKind::TaskExecution);
            assert_eq!(tasks[0].message, "boom");
        }
        other => panic!("Expected RetryCeilingExceeded, got {:?}", other),
    }
    assert!(matches!(
        coordinator.request_task(0),
        TaskResponse::Done(JobStatus::Failed)
    ));
}

#[test]
fn test_safety_timeouts_count_towards_retry_ceiling() {
    let coordinator = coordinator(1, 1, 1);
    assigned(coordinator.request_task(0));

    coordinator.check_timeouts(Instant::now() + TIMEOUT * 2);
    assert_eq!(coordinator.status(), JobStatus::Failed);
    match coordinator.failure() {
        Some(JobError::RetryCeilingExceeded(tasks)) => {
            assert_eq!(tasks[0].last_failure, FailureKind::WorkerTimeout);
        }
        other => panic!("Expected RetryCeilingExceeded, got {:?}", other),
    }
}

// ============================================================
// Cancellation
// ============================================================

#[test]
fn test_safety_cancel_discards_late_reports() {
    let coordinator = coordinator(1, 1, 3);
    let m = assigned(coordinator.request_task(0));

    assert!(coordinator.cancel());
    assert!(!coordinator.cancel(), "Second cancel is a no-op");
    assert_eq!(coordinator.status(), JobStatus::Cancelled);
    assert!(matches!(coordinator.failure(), Some(JobError::Cancelled)));

    assert_eq!(
        coordinator.report_task_result(report(&m, 0, map_output(&m, 1))),
        ReportAck::Terminal
    );
    assert_eq!(
        coordinator.task(m.task_id).unwrap().status(),
        TaskStatus::Cancelled
    );
    assert!(matches!(
        coordinator.request_task(0),
        TaskResponse::Done(JobStatus::Cancelled)
    ));
}
