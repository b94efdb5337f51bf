//! Work queue semantics against the in-memory backend, driven with a
//! paused tokio clock.

use std::time::Duration;

use serde_json::json;
use shipwright::error::Error;
use shipwright::model::{BuildPayload, FailOutcome, JobState, QueueName};
use shipwright::queue::{EnqueueOptions, MemoryQueue, QueueOptions, WorkQueue};
use shipwright::worker::submit_build;

fn build_queue() -> MemoryQueue {
    MemoryQueue::with_defaults(QueueName::Build)
}

fn payload(project_id: &str) -> BuildPayload {
    BuildPayload {
        project_id: project_id.to_string(),
        conversation_id: "c1".to_string(),
        message_id: "m1".to_string(),
        model: None,
    }
}

#[tokio::test(start_paused = true)]
async fn retries_follow_backoff_until_attempts_run_out() {
    let queue = build_queue();
    let id = queue.enqueue(json!({"n": 1}), EnqueueOptions::default()).await.unwrap();

    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    let outcome = queue.fail(&job, "model down", true).await.unwrap();
    assert_eq!(
        outcome,
        FailOutcome::Retrying {
            delay: Duration::from_secs(2),
            attempt: 1
        }
    );

    // Not claimable before the backoff elapses.
    assert!(queue.dequeue("w1").await.unwrap().is_none());
    assert_eq!(queue.stats().await.unwrap().delayed, 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    let outcome = queue.fail(&job, "model down", true).await.unwrap();
    assert_eq!(
        outcome,
        FailOutcome::Retrying {
            delay: Duration::from_secs(4),
            attempt: 2
        }
    );

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(queue.dequeue("w1").await.unwrap().is_none());
    tokio::time::advance(Duration::from_secs(1)).await;
    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(
        queue.fail(&job, "model down", true).await.unwrap(),
        FailOutcome::Dead { attempts: 3 }
    );

    tokio::time::advance(Duration::from_secs(600)).await;
    assert!(queue.dequeue("w1").await.unwrap().is_none());
    let job = queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, job.max_attempts);
    assert_eq!(job.last_error.as_deref(), Some("model down"));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_is_terminal_immediately() {
    let queue = build_queue();
    let id = queue.enqueue(json!({}), EnqueueOptions::default()).await.unwrap();
    let job = queue.dequeue("w1").await.unwrap().unwrap();

    assert_eq!(
        queue.fail(&job, "no changes produced", false).await.unwrap(),
        FailOutcome::Dead { attempts: 1 }
    );
    assert_eq!(queue.get(id).await.unwrap().state, JobState::Failed);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.failed, stats.delayed, stats.waiting), (1, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn crashed_worker_job_is_reclaimed_exactly_once() {
    let queue = build_queue();
    let id = queue.enqueue(json!({}), EnqueueOptions::default()).await.unwrap();

    let abandoned = queue.dequeue("w1").await.unwrap().unwrap();
    assert!(queue.dequeue("w2").await.unwrap().is_none());

    tokio::time::advance(Duration::from_secs(61)).await;
    let reclaimed = queue.dequeue("w2").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.stalls, 1);
    assert!(queue.dequeue("w3").await.unwrap().is_none());

    // The original worker's late outcome is refused.
    let err = queue.complete(&abandoned, json!({})).await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost(job) if job == id));

    queue.complete(&reclaimed, json!({"ok": true})).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.completed, stats.active), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn repeated_stall_fails_terminally() {
    let queue = build_queue();
    let id = queue.enqueue(json!({}), EnqueueOptions::default()).await.unwrap();

    queue.dequeue("w1").await.unwrap().unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    queue.dequeue("w2").await.unwrap().unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    assert!(queue.dequeue("w3").await.unwrap().is_none());
    let job = queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.stalls, 2);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_the_lease() {
    let queue = build_queue();
    queue.enqueue(json!({}), EnqueueOptions::default()).await.unwrap();
    let job = queue.dequeue("w1").await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;
    queue.heartbeat(&job).await.unwrap();
    tokio::time::advance(Duration::from_secs(40)).await;

    assert!(queue.dequeue("w2").await.unwrap().is_none());
    queue.complete(&job, json!({})).await.unwrap();
}

#[tokio::test]
async fn second_build_for_a_project_is_rejected() {
    let queue = build_queue();
    let first = submit_build(&queue, &payload("p1")).await.unwrap();

    let err = submit_build(&queue, &payload("p1")).await.unwrap_err();
    match err {
        Error::AdmissionRejected { key, existing } => {
            assert_eq!(key, "build:p1");
            assert_eq!(existing, first);
        }
        other => panic!("expected AdmissionRejected, got {other:?}"),
    }

    // Other projects are unaffected.
    submit_build(&queue, &payload("p2")).await.unwrap();

    // Once the first build finishes the project accepts a new one.
    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(job.id, first);
    queue.complete(&job, json!({})).await.unwrap();
    submit_build(&queue, &payload("p1")).await.unwrap();
}

#[tokio::test]
async fn higher_priority_is_claimed_first() {
    let queue = build_queue();
    let low = queue.enqueue(json!({"n": 1}), EnqueueOptions::default()).await.unwrap();
    let high = queue
        .enqueue(json!({"n": 2}), EnqueueOptions::default().priority(10))
        .await
        .unwrap();

    assert_eq!(queue.dequeue("w1").await.unwrap().unwrap().id, high);
    assert_eq!(queue.dequeue("w1").await.unwrap().unwrap().id, low);
}

#[tokio::test(start_paused = true)]
async fn delayed_enqueue_waits() {
    let queue = build_queue();
    queue
        .enqueue(json!({}), EnqueueOptions::default().delay(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(queue.dequeue("w1").await.unwrap().is_none());
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(queue.dequeue("w1").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn repeating_job_schedules_successor() {
    let queue = build_queue();
    let first = queue
        .enqueue(
            json!({"sweep": true}),
            EnqueueOptions::default().repeat_every(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    let job = queue.dequeue("w1").await.unwrap().unwrap();
    queue.complete(&job, json!({})).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().waiting, 1);
    assert!(queue.dequeue("w1").await.unwrap().is_none());

    tokio::time::advance(Duration::from_secs(10)).await;
    let next = queue.dequeue("w1").await.unwrap().unwrap();
    assert_ne!(next.id, first);
    assert_eq!(next.payload, json!({"sweep": true}));
}

#[tokio::test]
async fn retention_keeps_newest_finished_jobs() {
    let options = QueueOptions {
        remove_on_complete: 2,
        ..QueueOptions::build()
    };
    let queue = MemoryQueue::new(QueueName::Build, options);

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(queue.enqueue(json!({"n": n}), EnqueueOptions::default()).await.unwrap());
        let job = queue.dequeue("w1").await.unwrap().unwrap();
        queue.complete(&job, json!({})).await.unwrap();
    }

    let completed = queue.list(JobState::Completed).await.unwrap();
    assert_eq!(completed.len(), 2);
    assert!(matches!(queue.get(ids[0]).await, Err(Error::NotFound(_))));
    assert!(queue.get(ids[2]).await.is_ok());
}

#[tokio::test]
async fn closed_queue_is_unavailable() {
    let queue = build_queue();
    queue.close();
    let err = queue.enqueue(json!({}), EnqueueOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::QueueUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn stats_count_every_state() {
    let queue = build_queue();
    for _ in 0..3 {
        queue.enqueue(json!({}), EnqueueOptions::default()).await.unwrap();
    }
    let a = queue.dequeue("w1").await.unwrap().unwrap();
    let b = queue.dequeue("w1").await.unwrap().unwrap();
    queue.complete(&a, json!({})).await.unwrap();
    queue.fail(&b, "boom", true).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn checkpoint_is_handed_to_the_next_attempt() {
    let queue = build_queue();
    let id = queue.enqueue(json!({"n": 1}), EnqueueOptions::default()).await.unwrap();

    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert!(job.result.is_none());
    queue.checkpoint(&job, json!({"committed": 1})).await.unwrap();
    queue.fail(&job, "deploy queue down", true).await.unwrap();

    // The finished attempt's lease can no longer write.
    assert!(matches!(
        queue.checkpoint(&job, json!({"committed": 2})).await,
        Err(Error::LeaseLost(_))
    ));

    tokio::time::advance(Duration::from_secs(2)).await;
    let retry = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(retry.id, id);
    assert_eq!(retry.result, Some(json!({"committed": 1})));
}
