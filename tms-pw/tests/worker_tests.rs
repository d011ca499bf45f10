//! Payroll worker tick behavior against a real database

mod helpers;

use std::sync::Arc;

use chrono::Duration;
use helpers::{
    controller_with_probe, count, create_test_db, db_worker, healthy_controller, running_count,
    seed_tickets, wait_for_slots_released, worker_with_source, FailingSource, MidBatch,
    MidBatchSource, PanickingSource, PausingSource, RecordingSource, StallingSource,
};
use tms_common::time::{now, to_db_string};
use tms_pw::jobs;
use tms_pw::models::{Checkpoint, IncidentSeverity, JobRequest, JobStatus};
use tms_pw::probe::FixedProbe;
use tms_pw::worker::AUTO_PAUSE_PREFIX;
use tms_pw::{DbTicketSource, TickOutcome};
use tokio_util::sync::CancellationToken;

async fn line_items(pool: &sqlx::SqlitePool, job_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM payroll_line_items WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn event_types(pool: &sqlx::SqlitePool, job_id: &str) -> Vec<String> {
    jobs::list_events(pool, job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn test_tick_completes_job() {
    let (_dir, pool) = create_test_db().await;
    seed_tickets(&pool, "org-a", 250).await;
    seed_tickets(&pool, "org-b", 5).await;

    let worker = db_worker(&pool);
    let job_id = worker
        .controller()
        .enqueue_job(&JobRequest::new("org-a"))
        .await
        .unwrap();

    let outcome = worker.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed {
            job_id: job_id.clone(),
            processed: 250
        }
    );

    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent, 100.0);
    assert!(job.completed_at.is_some());
    assert_eq!(job.checkpoint.unwrap().processed_count, 250);

    // Only the job's organization is paid
    assert_eq!(line_items(&pool, &job_id).await, 250);
    let total: f64 = sqlx::query_scalar("SELECT SUM(amount) FROM payroll_line_items WHERE job_id = ?")
        .bind(&job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(total, 250.0 * 25.0);

    assert_eq!(event_types(&pool, &job_id).await, vec!["queued", "running", "completed"]);
    assert_eq!(running_count(&pool).await, 0);

    assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(running_count(&pool).await, 0);
}

#[tokio::test]
async fn test_resume_starts_after_checkpoint() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 200).await;
    let checkpoint_id = ids[149];

    let controller = healthy_controller(&pool);
    let job_id = controller.enqueue_job(&JobRequest::new("org-a")).await.unwrap();
    // As left behind by an earlier, interrupted run
    sqlx::query("UPDATE payroll_jobs SET checkpoint_data = ?, progress_percent = 75 WHERE id = ?")
        .bind(format!(
            r#"{{"last_processed_ticket_id":{},"processed_count":150}}"#,
            checkpoint_id
        ))
        .bind(&job_id)
        .execute(&pool)
        .await
        .unwrap();

    let source = Arc::new(RecordingSource::new(&pool));
    let worker = worker_with_source(controller, source.clone());

    let outcome = worker.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed {
            job_id: job_id.clone(),
            processed: 200
        }
    );

    let after_ids = source.after_ids();
    assert_eq!(after_ids[0], checkpoint_id);
    assert!(after_ids.iter().all(|&id| id >= checkpoint_id));

    assert_eq!(line_items(&pool, &job_id).await, 50);
    let first_paid: i64 = sqlx::query_scalar("SELECT MIN(ticket_id) FROM payroll_line_items WHERE job_id = ?")
        .bind(&job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(first_paid > checkpoint_id);

    let events = jobs::list_events(&pool, &job_id).await.unwrap();
    let running = events.iter().find(|e| e.event_type == "running").unwrap();
    assert!(running
        .message
        .as_deref()
        .unwrap()
        .starts_with(&format!("Resumed after ticket {}", checkpoint_id)));
}

#[tokio::test]
async fn test_failure_requeues_with_backoff_and_keeps_checkpoint() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 200).await;

    let controller = healthy_controller(&pool);
    let job_id = controller.enqueue_job(&JobRequest::new("org-a")).await.unwrap();

    let failing = worker_with_source(controller.clone(), Arc::new(FailingSource::new(&pool, ids[154])));
    let earliest = to_db_string(now() + Duration::seconds(55));

    let outcome = failing.tick().await.unwrap();
    let (retried, retry_count, not_before) = match outcome {
        TickOutcome::Retrying {
            job_id,
            retry_count,
            not_before,
        } => (job_id, retry_count, not_before),
        other => panic!("expected Retrying, got {:?}", other),
    };
    assert_eq!(retried, job_id);
    assert_eq!(retry_count, 1);
    assert!(not_before > earliest, "{} <= {}", not_before, earliest);

    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert!(job.failure_reason.unwrap().contains("pay rate lookup failed"));
    assert_eq!(
        job.checkpoint,
        Some(Checkpoint {
            last_processed_ticket_id: ids[149],
            processed_count: 150,
        })
    );
    assert_eq!(running_count(&pool).await, 0);

    // Backoff not elapsed yet
    assert_eq!(failing.tick().await.unwrap(), TickOutcome::Idle);

    sqlx::query("UPDATE payroll_jobs SET not_before = '2000-01-01T00:00:00.000000Z' WHERE id = ?")
        .bind(&job_id)
        .execute(&pool)
        .await
        .unwrap();

    let worker = worker_with_source(controller, Arc::new(DbTicketSource::new(pool.clone())));
    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed {
            job_id: job_id.clone(),
            processed: 200
        }
    );

    // Tickets redone after the checkpoint are not paid twice
    assert_eq!(line_items(&pool, &job_id).await, 200);

    let events = event_types(&pool, &job_id).await;
    assert_eq!(
        events,
        vec!["queued", "running", "retry_scheduled", "running", "completed"]
    );
}

#[tokio::test]
async fn test_exhausted_retries_fail_job_and_free_slot() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 20).await;

    let controller = healthy_controller(&pool);
    let job_id = controller
        .enqueue_job(&JobRequest {
            max_retries: Some(0),
            ..JobRequest::new("org-a")
        })
        .await
        .unwrap();

    let worker = worker_with_source(controller.clone(), Arc::new(FailingSource::new(&pool, ids[0])));
    let outcome = worker.tick().await.unwrap();

    let (failed, reason) = match outcome {
        TickOutcome::Failed { job_id, reason } => (job_id, reason),
        other => panic!("expected Failed, got {:?}", other),
    };
    assert_eq!(failed, job_id);
    assert!(reason.contains("pay rate lookup failed"));

    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(job.failure_reason.is_some());
    assert_eq!(running_count(&pool).await, 0);

    // A failed job no longer blocks the organization
    assert!(controller.can_queue_job("org-a").await.unwrap().allowed);
    assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn test_pause_stops_job_at_checkpoint() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 250).await;

    let controller = healthy_controller(&pool);
    let job_id = controller.enqueue_job(&JobRequest::new("org-a")).await.unwrap();

    let source = Arc::new(PausingSource::new(&pool, controller.clone(), ids[119]));
    let worker = worker_with_source(controller.clone(), source);

    // The pause lands mid-batch; the worker finishes the batch then stops
    let outcome = worker.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Paused {
            job_id: job_id.clone(),
            checkpoint: Checkpoint {
                last_processed_ticket_id: ids[199],
                processed_count: 200,
            },
        }
    );

    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(job.progress_percent, 80.0);
    assert_eq!(running_count(&pool).await, 0);
    // The worker pauses its own job; pause_queue leaves running jobs alone
    assert_eq!(event_types(&pool, &job_id).await, vec!["queued", "running", "paused"]);

    // A manual pause is not lifted by the worker
    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Held {
            reason: "Scheduled maintenance".to_string()
        }
    );

    controller.resume_queue().await.unwrap();
    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed {
            job_id: job_id.clone(),
            processed: 250
        }
    );
    assert_eq!(line_items(&pool, &job_id).await, 250);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let (_dir, pool) = create_test_db().await;
    seed_tickets(&pool, "org-low", 3).await;
    seed_tickets(&pool, "org-high", 3).await;

    let worker = db_worker(&pool);
    let low = worker
        .controller()
        .enqueue_job(&JobRequest {
            priority: 1,
            ..JobRequest::new("org-low")
        })
        .await
        .unwrap();
    let high = worker
        .controller()
        .enqueue_job(&JobRequest {
            priority: 5,
            ..JobRequest::new("org-high")
        })
        .await
        .unwrap();

    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed {
            job_id: high,
            processed: 3
        }
    );
    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed {
            job_id: low,
            processed: 3
        }
    );
}

#[tokio::test]
async fn test_no_slot_when_at_capacity() {
    let (_dir, pool) = create_test_db().await;
    seed_tickets(&pool, "org-a", 3).await;

    let worker = db_worker(&pool);
    let job_id = worker
        .controller()
        .enqueue_job(&JobRequest::new("org-a"))
        .await
        .unwrap();
    worker.controller().set_max_concurrent(1).await.unwrap();
    assert!(worker.controller().acquire_slot().await.unwrap().acquired);

    let outcome = worker.tick().await.unwrap();
    let reason = match outcome {
        TickOutcome::NoSlot { reason } => reason,
        other => panic!("expected NoSlot, got {:?}", other),
    };
    assert!(reason.starts_with("At capacity: 1/1"));

    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(running_count(&pool).await, 1);
}

#[tokio::test]
async fn test_health_gate_pauses_then_lifts_automatically() {
    let (_dir, pool) = create_test_db().await;
    seed_tickets(&pool, "org-a", 10).await;

    let strained = worker_with_source(
        controller_with_probe(&pool, FixedProbe::new(95.0, 10.0)),
        Arc::new(DbTicketSource::new(pool.clone())),
    );
    let job_id = strained
        .controller()
        .enqueue_job(&JobRequest::new("org-a"))
        .await
        .unwrap();

    let outcome = strained.tick().await.unwrap();
    let reason = match outcome {
        TickOutcome::Held { reason } => reason,
        other => panic!("expected Held, got {:?}", other),
    };
    assert!(reason.starts_with("Memory usage"));

    let lock = strained.controller().global_lock().await.unwrap();
    assert!(lock.is_paused);
    assert!(lock.pause_reason.unwrap().starts_with(AUTO_PAUSE_PREFIX));
    assert_eq!(
        jobs::get_job(&pool, &job_id).await.unwrap().unwrap().status,
        JobStatus::Paused
    );
    assert_eq!(running_count(&pool).await, 0);

    let recovered = db_worker(&pool);
    assert_eq!(
        recovered.tick().await.unwrap(),
        TickOutcome::Completed {
            job_id,
            processed: 10
        }
    );
    assert!(!recovered.controller().is_paused().await.unwrap());
}

#[tokio::test]
async fn test_open_incident_holds_worker_until_resolved() {
    let (_dir, pool) = create_test_db().await;
    seed_tickets(&pool, "org-a", 10).await;

    let worker = db_worker(&pool);
    let job_id = worker
        .controller()
        .enqueue_job(&JobRequest::new("org-a"))
        .await
        .unwrap();
    let incident = worker
        .controller()
        .open_incident("database_outage", IncidentSeverity::Critical, "Replica lag")
        .await
        .unwrap();

    let outcome = worker.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Held { .. }));
    // The incident's own pause reason is kept
    let lock = worker.controller().global_lock().await.unwrap();
    assert!(lock.pause_reason.unwrap().starts_with("Incident "));
    assert_eq!(line_items(&pool, &job_id).await, 0);

    assert!(worker.controller().resolve_incident(&incident.id).await.unwrap());
    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed {
            job_id,
            processed: 10
        }
    );
}

#[tokio::test]
async fn test_shutdown_requeues_without_consuming_retry() {
    let (_dir, pool) = create_test_db().await;
    seed_tickets(&pool, "org-a", 10).await;

    let token = CancellationToken::new();
    let worker = db_worker(&pool).with_shutdown(token.clone());
    let job_id = worker
        .controller()
        .enqueue_job(&JobRequest::new("org-a"))
        .await
        .unwrap();

    token.cancel();
    let outcome = worker.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Interrupted {
            job_id: job_id.clone(),
            checkpoint: Checkpoint::default(),
        }
    );

    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 0);
    assert_eq!(running_count(&pool).await, 0);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM payroll_job_events WHERE event_type = 'requeued'").await,
        1
    );

    // run() returns promptly once cancelled
    worker.run().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_mid_batch_do_not_hand_job_to_second_worker() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 250).await;

    let controller = healthy_controller(&pool);
    let job_id = controller.enqueue_job(&JobRequest::new("org-a")).await.unwrap();

    let source = Arc::new(MidBatchSource::new(
        &pool,
        controller.clone(),
        ids[49],
        MidBatch::PauseResumeThenTick,
    ));
    let worker = worker_with_source(controller, source.clone());

    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed {
            job_id: job_id.clone(),
            processed: 250
        }
    );
    // The job never left `running`, so the second worker found nothing to do
    assert_eq!(source.second_tick(), Some(TickOutcome::Idle));

    assert_eq!(event_types(&pool, &job_id).await, vec!["queued", "running", "completed"]);
    assert_eq!(line_items(&pool, &job_id).await, 250);
    assert_eq!(running_count(&pool).await, 0);
}

#[tokio::test]
async fn test_worker_whose_claim_was_recovered_stops_writing() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 250).await;

    let controller = healthy_controller(&pool);
    let job_id = controller.enqueue_job(&JobRequest::new("org-a")).await.unwrap();

    let source = Arc::new(MidBatchSource::new(
        &pool,
        controller.clone(),
        ids[49],
        MidBatch::RecoverThenTick,
    ));
    let worker = worker_with_source(controller, source.clone());

    // Recovery hands the job to a second worker, which finishes it from ticket 40
    let outcome = worker.tick().await.unwrap();
    assert_eq!(
        source.second_tick(),
        Some(TickOutcome::Completed {
            job_id: job_id.clone(),
            processed: 250
        })
    );
    // The first worker's next checkpoint is rejected and it stops there
    assert_eq!(outcome, TickOutcome::ClaimLost { job_id: job_id.clone() });

    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.checkpoint.unwrap().processed_count, 250);
    assert_eq!(
        event_types(&pool, &job_id).await,
        vec!["queued", "running", "orphan_recovered", "running", "completed"]
    );
    assert_eq!(line_items(&pool, &job_id).await, 250);
    assert_eq!(running_count(&pool).await, 0);
}

#[tokio::test]
async fn test_dropped_tick_hands_job_and_slot_back() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 50).await;

    let controller = healthy_controller(&pool);
    let job_id = controller.enqueue_job(&JobRequest::new("org-a")).await.unwrap();
    let stalled = worker_with_source(controller, Arc::new(StallingSource::new(&pool, ids[24])));

    let timed_out = tokio::time::timeout(std::time::Duration::from_millis(200), stalled.tick()).await;
    assert!(timed_out.is_err());

    assert_eq!(wait_for_slots_released(&pool).await, 0);
    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.checkpoint.unwrap().processed_count, 20);
    assert_eq!(event_types(&pool, &job_id).await, vec!["queued", "running", "requeued"]);

    assert_eq!(
        db_worker(&pool).tick().await.unwrap(),
        TickOutcome::Completed {
            job_id: job_id.clone(),
            processed: 50
        }
    );
    assert_eq!(line_items(&pool, &job_id).await, 50);
}

#[tokio::test]
async fn test_panicking_tick_hands_job_and_slot_back() {
    let (_dir, pool) = create_test_db().await;
    let ids = seed_tickets(&pool, "org-a", 30).await;

    let controller = healthy_controller(&pool);
    let job_id = controller.enqueue_job(&JobRequest::new("org-a")).await.unwrap();
    let worker = worker_with_source(controller, Arc::new(PanickingSource::new(&pool, ids[14])));

    let joined = tokio::spawn(async move { worker.tick().await }).await;
    assert!(joined.unwrap_err().is_panic());

    assert_eq!(wait_for_slots_released(&pool).await, 0);
    let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 0);

    assert_eq!(
        db_worker(&pool).tick().await.unwrap(),
        TickOutcome::Completed {
            job_id,
            processed: 30
        }
    );
}
