//! Lease binding and batch failure handling.
//!
//! A batch is a single dispatch slot: exactly one agent lease executes its
//! steps. Binding happens once; a rebind attempt from a different session is
//! refused so that two dispatchers racing on the same batch cannot both win.
//! Failure paths complete the batch with an error value and terminalize its
//! steps; deciding whether the lost work is re-queued is the recompute's job.

use chrono::{DateTime, Utc};
use gantry_core::ids::{AgentId, BatchId, LeaseId, PoolId, SessionId};
use gantry_core::job::{Batch, BatchError, BatchState, Job, StepOutcome, StepState};
use gantry_core::{Error, Result};

/// Bind an agent lease to a ready batch and mark it running.
///
/// Rebinding with the session already on the batch is accepted and refreshes
/// the lease id; any other session is refused.
pub fn assign_lease(
    job: &mut Job,
    batch_id: BatchId,
    pool_id: PoolId,
    agent_id: AgentId,
    session_id: SessionId,
    lease_id: LeaseId,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(batch) = job.batch_mut(batch_id) else {
        return Err(Error::BatchNotFound(batch_id.to_string()));
    };
    match batch.session_id {
        Some(existing) if existing != session_id => Err(Error::LeaseSessionConflict {
            batch_id: batch_id.to_string(),
            session_id: existing.to_string(),
        }),
        Some(_) => {
            batch.lease_id = Some(lease_id);
            Ok(())
        }
        None => {
            if batch.state != BatchState::Ready {
                return Err(Error::BatchNotReady(batch_id.to_string()));
            }
            batch.pool_id = Some(pool_id);
            batch.agent_id = Some(agent_id);
            batch.session_id = Some(session_id);
            batch.lease_id = Some(lease_id);
            batch.state = BatchState::Running;
            batch.started_at = Some(now);
            Ok(())
        }
    }
}

/// Release a batch that was leased but never started executing, returning it
/// to the dispatch queue. Cancelling an already finished batch is a no-op.
pub fn cancel_lease(job: &mut Job, batch_id: BatchId) -> Result<()> {
    let Some(batch) = job.batch_mut(batch_id) else {
        return Err(Error::BatchNotFound(batch_id.to_string()));
    };
    if batch.state.is_terminal() {
        return Ok(());
    }
    if batch.state == BatchState::Running {
        batch.state = BatchState::Ready;
    }
    batch.pool_id = None;
    batch.agent_id = None;
    batch.session_id = None;
    batch.lease_id = None;
    batch.started_at = None;
    Ok(())
}

/// Complete a batch with an error: running steps are aborted, unstarted ones
/// skipped, both with a failure outcome.
pub fn terminate_batch(batch: &mut Batch, error: BatchError, now: DateTime<Utc>) {
    for step in &mut batch.steps {
        match step.state {
            StepState::Running => {
                step.state = StepState::Aborted;
                step.outcome = StepOutcome::Failure;
                step.finished_at = Some(now);
            }
            StepState::Waiting | StepState::Ready => {
                step.state = StepState::Skipped;
                step.outcome = StepOutcome::Failure;
                step.finished_at = Some(now);
            }
            StepState::Completed | StepState::Aborted | StepState::Skipped => {}
        }
    }
    batch.state = BatchState::Complete;
    batch.error = error;
    if batch.finished_at.is_none() {
        batch.finished_at = Some(now);
    }
}

/// Terminate one batch by id.
pub fn fail_batch(
    job: &mut Job,
    batch_id: BatchId,
    error: BatchError,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(batch) = job.batch_mut(batch_id) else {
        return Err(Error::BatchNotFound(batch_id.to_string()));
    };
    terminate_batch(batch, error, now);
    Ok(())
}

/// Terminate every batch that has not already finished.
pub fn skip_all_batches(job: &mut Job, error: BatchError, now: DateTime<Utc>) {
    for batch in &mut job.batches {
        if !batch.state.is_terminal() {
            terminate_batch(batch, error, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::graph::Priority;
    use gantry_core::ids::{GraphId, StepId};
    use gantry_core::job::Step;

    fn make_job_with_batch(state: BatchState) -> (Job, BatchId) {
        let mut job = Job::new("lease", GraphId::from_bytes([0; 32]), Vec::new(), Priority::Normal);
        let batch_id = BatchId::new(job.allocate_sub_resource_id());
        let mut batch = Batch::new(batch_id, 0);
        batch.state = state;
        let step_id = StepId::new(job.allocate_sub_resource_id());
        let mut step = Step::new(step_id, 0);
        step.state = StepState::Ready;
        batch.steps.push(step);
        job.batches.push(batch);
        (job, batch_id)
    }

    #[test]
    fn test_assign_lease_binds_and_starts_the_batch() {
        let (mut job, batch_id) = make_job_with_batch(BatchState::Ready);
        let session = SessionId::new();
        assign_lease(
            &mut job,
            batch_id,
            PoolId::new(),
            AgentId::new(),
            session,
            LeaseId::new(),
            Utc::now(),
        )
        .unwrap();

        let batch = job.batch(batch_id).unwrap();
        assert_eq!(batch.state, BatchState::Running);
        assert_eq!(batch.session_id, Some(session));
        assert!(batch.started_at.is_some());
    }

    #[test]
    fn test_assign_lease_requires_a_ready_batch() {
        let (mut job, batch_id) = make_job_with_batch(BatchState::Waiting);
        let err = assign_lease(
            &mut job,
            batch_id,
            PoolId::new(),
            AgentId::new(),
            SessionId::new(),
            LeaseId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BatchNotReady(_)));
    }

    #[test]
    fn test_assign_lease_refuses_a_different_session() {
        let (mut job, batch_id) = make_job_with_batch(BatchState::Ready);
        let first = SessionId::new();
        assign_lease(
            &mut job,
            batch_id,
            PoolId::new(),
            AgentId::new(),
            first,
            LeaseId::new(),
            Utc::now(),
        )
        .unwrap();

        let err = assign_lease(
            &mut job,
            batch_id,
            PoolId::new(),
            AgentId::new(),
            SessionId::new(),
            LeaseId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::LeaseSessionConflict { .. }));
    }

    #[test]
    fn test_assign_lease_same_session_refreshes_the_lease() {
        let (mut job, batch_id) = make_job_with_batch(BatchState::Ready);
        let session = SessionId::new();
        assign_lease(
            &mut job,
            batch_id,
            PoolId::new(),
            AgentId::new(),
            session,
            LeaseId::new(),
            Utc::now(),
        )
        .unwrap();

        let replacement = LeaseId::new();
        assign_lease(
            &mut job,
            batch_id,
            PoolId::new(),
            AgentId::new(),
            session,
            replacement,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.batch(batch_id).unwrap().lease_id, Some(replacement));
    }

    #[test]
    fn test_cancel_lease_returns_the_batch_to_ready() {
        let (mut job, batch_id) = make_job_with_batch(BatchState::Ready);
        assign_lease(
            &mut job,
            batch_id,
            PoolId::new(),
            AgentId::new(),
            SessionId::new(),
            LeaseId::new(),
            Utc::now(),
        )
        .unwrap();

        cancel_lease(&mut job, batch_id).unwrap();
        let batch = job.batch(batch_id).unwrap();
        assert_eq!(batch.state, BatchState::Ready);
        assert_eq!(batch.session_id, None);
        assert_eq!(batch.lease_id, None);
        assert_eq!(batch.started_at, None);
    }

    #[test]
    fn test_cancel_lease_on_a_finished_batch_changes_nothing() {
        let (mut job, batch_id) = make_job_with_batch(BatchState::Complete);
        cancel_lease(&mut job, batch_id).unwrap();
        assert_eq!(job.batch(batch_id).unwrap().state, BatchState::Complete);
    }

    #[test]
    fn test_terminate_batch_aborts_running_and_skips_pending_steps() {
        let mut batch = Batch::new(BatchId::new(1), 0);
        let mut running = Step::new(StepId::new(2), 0);
        running.state = StepState::Running;
        let mut done = Step::new(StepId::new(3), 1);
        done.state = StepState::Completed;
        done.outcome = StepOutcome::Success;
        let waiting = Step::new(StepId::new(4), 2);
        batch.steps = vec![running, done, waiting];
        batch.state = BatchState::Running;

        terminate_batch(&mut batch, BatchError::Incomplete, Utc::now());

        assert_eq!(batch.state, BatchState::Complete);
        assert_eq!(batch.error, BatchError::Incomplete);
        assert_eq!(batch.steps[0].state, StepState::Aborted);
        assert_eq!(batch.steps[0].outcome, StepOutcome::Failure);
        assert_eq!(batch.steps[1].state, StepState::Completed);
        assert_eq!(batch.steps[1].outcome, StepOutcome::Success);
        assert_eq!(batch.steps[2].state, StepState::Skipped);
        assert_eq!(batch.steps[2].outcome, StepOutcome::Failure);
        assert!(batch.finished_at.is_some());
    }

    #[test]
    fn test_skip_all_batches_leaves_finished_batches_alone() {
        let (mut job, first) = make_job_with_batch(BatchState::Ready);
        let second = BatchId::new(job.allocate_sub_resource_id());
        let mut done = Batch::new(second, 1);
        done.state = BatchState::Complete;
        job.batches.push(done);

        skip_all_batches(&mut job, BatchError::NoAgentsInPool, Utc::now());

        assert_eq!(job.batch(first).unwrap().error, BatchError::NoAgentsInPool);
        assert_eq!(job.batch(second).unwrap().error, BatchError::None);
    }
}
