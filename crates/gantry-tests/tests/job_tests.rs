//! End-to-end job lifecycle tests against the full service stack.

use gantry_core::graph::{NodeRef, Priority};
use gantry_core::ids::JobId;
use gantry_core::job::{BatchError, BatchState, StepOutcome, StepState};
use gantry_core::Error;
use gantry_engine::{BatchUpdate, LabelPhase, LabelState, StepUpdate};
use gantry_tests::{ready_batches, GraphFixture, TestHarness};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_job_runs_to_completion() {
    let harness = TestHarness::new().await;
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let job = harness
        .create_job(graph_id, "nightly client", &["-Target=Publish Client"], Priority::Normal)
        .await;

    // Only the targeted chain is scheduled; the editor group stays out.
    assert!(job.batches.iter().all(|batch| batch.group_idx < 2));

    // Setup first.
    let ready = ready_batches(&job);
    assert_eq!(ready.len(), 1);
    let job = harness.run_batch(job.id, ready[0]).await;

    // The client chain becomes ready once setup lands.
    let ready = ready_batches(&job);
    assert_eq!(ready.len(), 1);
    let job = harness.run_batch(job.id, ready[0]).await;

    assert!(job.batches.iter().all(|batch| batch.state == BatchState::Complete));
    assert_eq!(job.schedule_priority, 0);
    assert!(harness.service.get_dispatch_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_labels_track_progress() {
    let harness = TestHarness::new().await;
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let job = harness
        .create_job(graph_id, "labeled", &["-Target=Publish Client"], Priority::Normal)
        .await;

    let states = harness.service.label_states(job.id).await.unwrap();
    assert_eq!(
        states,
        vec![
            LabelState {
                name: "Client".to_string(),
                category: "Game".to_string(),
                phase: LabelPhase::Running,
                outcome: StepOutcome::Success,
            },
            LabelState {
                name: "Editor".to_string(),
                category: "Game".to_string(),
                phase: LabelPhase::Unspecified,
                outcome: StepOutcome::Unspecified,
            },
        ]
    );

    let job = harness.run_batch(job.id, ready_batches(&job)[0]).await;
    let job = harness.run_batch(job.id, ready_batches(&job)[0]).await;

    let states = harness.service.label_states(job.id).await.unwrap();
    assert_eq!(states[0].phase, LabelPhase::Complete);
    assert_eq!(states[0].outcome, StepOutcome::Success);
    assert_eq!(states[1].phase, LabelPhase::Unspecified);
}

#[tokio::test]
async fn test_lost_batch_work_is_requeued() {
    let harness = TestHarness::new().await;
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let job = harness
        .create_job(graph_id, "lossy", &["-Target=Publish Client"], Priority::Normal)
        .await;
    let job = harness.run_batch(job.id, ready_batches(&job)[0]).await;

    // The agent compiles, then drops off the network.
    let chain_id = ready_batches(&job)[0];
    let job = harness.lease_batch(job.id, chain_id).await;
    let compile_id = job.batch(chain_id).unwrap().steps[0].id;
    harness
        .finish_step(job.id, chain_id, compile_id, StepOutcome::Success)
        .await;
    let job = harness
        .service
        .update_batch(
            job.id,
            chain_id,
            BatchUpdate {
                state: None,
                error: Some(BatchError::LostConnection),
            },
        )
        .await
        .unwrap();

    // The lost batch keeps only what actually ran; the unstarted work comes
    // back in a fresh batch with the compile re-added for the new workspace.
    // Nothing failed, so no retry budget is spent.
    let lost = job.batch(chain_id).unwrap();
    assert_eq!(lost.state, BatchState::Complete);
    assert_eq!(lost.error, BatchError::LostConnection);
    assert_eq!(lost.steps.len(), 1);
    assert!(job.retried_nodes.is_empty());

    let fresh = job.batches.last().unwrap();
    assert_eq!(fresh.group_idx, 1);
    assert_eq!(fresh.state, BatchState::Ready);
    let nodes: Vec<usize> = fresh.steps.iter().map(|step| step.node_idx).collect();
    assert_eq!(nodes, vec![0, 1, 2]);

    let job = harness.run_batch(job.id, fresh.id).await;
    assert_eq!(job.schedule_priority, 0);
}

#[tokio::test]
async fn test_user_retry_budget_is_single_use() {
    let harness = TestHarness::new().await;
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let job = harness
        .create_job(graph_id, "flaky", &["-Target=Compile Client"], Priority::Normal)
        .await;
    let job = harness.run_batch(job.id, ready_batches(&job)[0]).await;

    // First attempt fails.
    let first_id = ready_batches(&job)[0];
    let job = harness.lease_batch(job.id, first_id).await;
    let first_step = job.batch(first_id).unwrap().steps[0].id;
    harness
        .finish_step(job.id, first_id, first_step, StepOutcome::Failure)
        .await;
    harness.finish_batch(job.id, first_id).await;

    // A user retry spends the node's budget and requeues it.
    let job = harness
        .service
        .update_step(
            job.id,
            first_id,
            first_step,
            StepUpdate {
                retry_requested_by: Some("dev".to_string()),
                ..StepUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(job.retried_nodes, vec![NodeRef::new(1, 0)]);

    // Second attempt fails too.
    let second_id = ready_batches(&job)[0];
    let job = harness.lease_batch(job.id, second_id).await;
    let second_step = job.batch(second_id).unwrap().steps[0].id;
    harness
        .finish_step(job.id, second_id, second_step, StepOutcome::Failure)
        .await;
    harness.finish_batch(job.id, second_id).await;

    let err = harness
        .service
        .update_step(
            job.id,
            second_id,
            second_step,
            StepUpdate {
                retry_requested_by: Some("dev".to_string()),
                ..StepUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetryLimitExceeded { node } if node == "Compile Client"));

    // Handing the budget back allows one more attempt.
    harness
        .service
        .remove_retried_node(job.id, NodeRef::new(1, 0))
        .await
        .unwrap();
    let job = harness
        .service
        .update_step(
            job.id,
            second_id,
            second_step,
            StepUpdate {
                retry_requested_by: Some("dev".to_string()),
                ..StepUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(job.retried_nodes, vec![NodeRef::new(1, 0)]);
    let third = job.batches.last().unwrap();
    assert_eq!(third.group_idx, 1);
    assert_eq!(third.state, BatchState::Ready);
}

#[tokio::test]
async fn test_abort_cancels_running_work() {
    let harness = TestHarness::new().await;
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let job = harness
        .create_job(graph_id, "doomed", &["-Target=Publish Client"], Priority::Normal)
        .await;
    let job = harness.run_batch(job.id, ready_batches(&job)[0]).await;

    let chain_id = ready_batches(&job)[0];
    let job = harness.lease_batch(job.id, chain_id).await;
    let compile_id = job.batch(chain_id).unwrap().steps[0].id;
    harness
        .service
        .update_step(
            job.id,
            chain_id,
            compile_id,
            StepUpdate {
                state: Some(StepState::Running),
                ..StepUpdate::default()
            },
        )
        .await
        .unwrap();

    let job = harness.service.abort_job(job.id, "ops").await.unwrap();

    assert_eq!(job.aborted_by_user.as_deref(), Some("ops"));
    assert_eq!(job.schedule_priority, 0);
    let chain = job.batch(chain_id).unwrap();
    assert_eq!(chain.state, BatchState::Complete);
    assert_eq!(chain.error, BatchError::Cancelled);
    assert_eq!(chain.steps[0].state, StepState::Aborted);
    assert_eq!(chain.steps[0].outcome, StepOutcome::Failure);
    assert_eq!(chain.steps[1].state, StepState::Skipped);
    assert_eq!(chain.steps[2].state, StepState::Skipped);
    assert!(harness.service.get_dispatch_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_step_priority_override_reorders_dispatch() {
    let harness = TestHarness::new().await;
    let graph_id = harness.store_graph(GraphFixture::game_build()).await;
    let first = harness
        .create_job(graph_id, "first in", &["-Target=Publish Client"], Priority::Normal)
        .await;
    let second = harness
        .create_job(graph_id, "boosted", &["-Target=Publish Client"], Priority::Normal)
        .await;

    // Equal priorities dispatch oldest first.
    let queue = harness.service.get_dispatch_queue().await.unwrap();
    let ids: Vec<JobId> = queue.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);

    let setup_id = second.batches[0].id;
    let step_id = second.batches[0].steps[0].id;
    harness
        .service
        .update_step(
            second.id,
            setup_id,
            step_id,
            StepUpdate {
                priority: Some(Priority::High),
                ..StepUpdate::default()
            },
        )
        .await
        .unwrap();

    let queue = harness.service.get_dispatch_queue().await.unwrap();
    let ids: Vec<JobId> = queue.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
}
