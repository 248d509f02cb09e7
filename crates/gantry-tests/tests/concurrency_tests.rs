//! Optimistic-concurrency behavior with parallel writers.

use gantry_core::graph::Priority;
use gantry_core::job::{StepOutcome, StepState};
use gantry_tests::{ready_batches, GraphFixture, TestHarness};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn test_parallel_priority_writers_all_land() {
    let harness = Arc::new(TestHarness::new().await);
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let job = harness
        .create_job(graph_id, "contended", &[], Priority::Normal)
        .await;

    let mut handles = Vec::new();
    for priority in [
        Priority::Lowest,
        Priority::BelowNormal,
        Priority::AboveNormal,
        Priority::High,
    ] {
        let harness = harness.clone();
        let job_id = job.id;
        handles.push(tokio::spawn(async move {
            harness.service.update_priority(job_id, priority).await
        }));
    }
    for handle in handles {
        handle.await.expect("task joins").expect("update lands");
    }

    // Every writer found a version to advance from; none were dropped.
    let job = harness.service.get_job(job.id).await.unwrap();
    assert_eq!(job.version, 5);
    assert_ne!(job.priority, Priority::Normal);
}

#[tokio::test]
async fn test_parallel_step_reports_serialize() {
    let harness = Arc::new(TestHarness::new().await);
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let job = harness
        .create_job(graph_id, "two agents", &["-Target=Full Build"], Priority::Normal)
        .await;
    let job = harness.run_batch(job.id, ready_batches(&job)[0]).await;

    // Two agents pick up the client and editor batches.
    let ready = ready_batches(&job);
    assert_eq!(ready.len(), 2);
    let job = harness.lease_batch(job.id, ready[0]).await;
    let job = harness.lease_batch(job.id, ready[1]).await;
    let before = job.version;

    let reports: Vec<_> = ready
        .iter()
        .map(|&batch_id| (batch_id, job.batch(batch_id).unwrap().steps[0].id))
        .collect();
    let mut handles = Vec::new();
    for (batch_id, step_id) in reports {
        let harness = harness.clone();
        let job_id = job.id;
        handles.push(tokio::spawn(async move {
            harness
                .finish_step(job_id, batch_id, step_id, StepOutcome::Success)
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("task joins");
    }

    let job = harness.service.get_job(job.id).await.unwrap();
    assert_eq!(job.version, before + 2);
    for batch_id in ready {
        let step = &job.batch(batch_id).unwrap().steps[0];
        assert_eq!(step.state, StepState::Completed);
        assert_eq!(step.outcome, StepOutcome::Success);
    }
}
