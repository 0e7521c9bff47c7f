//! Waiting for recognition jobs to finish.
//!
//! This is an explicit poll loop with a fixed interval and a hard deadline.
//! The deadline also bounds each individual poll, so a stalled status request
//! can't hold up the batch. There are no retries: a failed or timed-out job is
//! final for this run.

use std::time::Duration;

use tokio::time::{Instant, sleep, timeout_at};

use crate::{
    errors::StageError,
    prelude::*,
    services::{JobState, OcrService, RecognitionJob},
};

/// How long and how often to poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Give up on the job after this long.
    pub timeout: Duration,
    /// Time between polls.
    pub poll_interval: Duration,
}

/// How a job ended, from our point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    TimedOut(Duration),
}

impl JobOutcome {
    /// Convert a non-success outcome into the matching error.
    pub fn into_result(self) -> Result<(), StageError> {
        match self {
            JobOutcome::Completed => Ok(()),
            JobOutcome::Failed(reason) => Err(StageError::JobFailed(reason)),
            JobOutcome::TimedOut(timeout) => Err(StageError::JobTimeout(timeout)),
        }
    }
}

/// Poll `job` until it completes, fails, or `policy.timeout` passes.
///
/// A poll that fails outright (network error, unknown operation) counts as a
/// failed job. A poll still running at the deadline counts as a timeout.
#[instrument(level = "debug", skip_all, fields(operation = %job.name))]
pub async fn wait_for_job(
    service: &dyn OcrService,
    job: &RecognitionJob,
    policy: WaitPolicy,
) -> JobOutcome {
    let deadline = deadline_after(policy.timeout);
    let mut poll_count = 0usize;
    loop {
        poll_count += 1;
        match timeout_at(deadline, service.poll(job)).await {
            Ok(Ok(JobState::Completed)) => {
                debug!(poll_count, "Job completed");
                return JobOutcome::Completed;
            }
            Ok(Ok(JobState::Failed(reason))) => return JobOutcome::Failed(reason),
            Ok(Ok(JobState::Pending)) => trace!(poll_count, "Job still pending"),
            Ok(Err(err)) => return JobOutcome::Failed(format!("{err:#}")),
            Err(_elapsed) => {
                warn!(poll_count, "Status request still running at deadline");
                return JobOutcome::TimedOut(policy.timeout);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return JobOutcome::TimedOut(policy.timeout);
        }
        // Don't sleep past the deadline; poll one last time right at it.
        sleep(policy.poll_interval.min(deadline - now)).await;
    }
}

/// `timeout` from now, or roughly thirty years out if that would overflow.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}
