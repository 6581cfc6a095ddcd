//! Invitation job consumer.
//!
//! [`InviteWorker::handle_invite`] renders and sends one invitation and folds
//! the outcome into the batch counters. [`WorkerRuntime`] drives it from the
//! queue with bounded concurrency and a shared rate ceiling.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::models::invite::SEND_INVITE_JOB;
use crate::services::batch_store::{BatchStore, BatchStoreError, CounterUpdate};
use crate::services::mailer::{Mailer, MailerError, OutgoingEmail};
use crate::services::queue::{ClaimedJob, FailOutcome, JobQueue, QueueError};
use crate::services::template;

/// Renders, sends and reports a single invitation job.
pub struct InviteWorker {
    batches: Arc<dyn BatchStore>,
    mailer: Arc<dyn Mailer>,
    platform_url: String,
}

impl InviteWorker {
    pub fn new(batches: Arc<dyn BatchStore>, mailer: Arc<dyn Mailer>, platform_url: &str) -> Self {
        Self {
            batches,
            mailer,
            platform_url: platform_url.to_string(),
        }
    }

    /// Send the invitation. A returned error tells the queue to retry (or to
    /// give up, once the final attempt has been recorded as a batch failure).
    pub async fn handle_invite(&self, job: &ClaimedJob) -> Result<String, WorkerError> {
        let invite = &job.data;
        let rendered = template::render_invite(invite, &self.platform_url);
        let email = OutgoingEmail {
            to: invite.to.clone(),
            subject: rendered.subject,
            html: rendered.html,
        };

        let start = Instant::now();
        let result = self.mailer.send(&email).await;
        metrics::histogram!("invite_send_seconds").record(start.elapsed().as_secs_f64());

        match result {
            Ok(message_id) => {
                metrics::counter!("invites_sent_total").increment(1);
                if let Some(batch_id) = invite.batch_id {
                    // The email is out; a counter hiccup must not trigger a resend.
                    match self.batches.record_success(batch_id).await {
                        Ok(update) => log_counter_update(job, "completed", update),
                        Err(e) => tracing::error!(
                            job_id = %job.id,
                            batch_id = %batch_id,
                            error = %e,
                            "Failed to record successful send"
                        ),
                    }
                }
                tracing::info!(
                    job_id = %job.id,
                    to = %invite.to,
                    message_id = %message_id,
                    "Invitation sent"
                );
                Ok(message_id)
            }
            Err(e) => {
                if job.is_final_attempt() {
                    metrics::counter!("invites_failed_total").increment(1);
                    if let Some(batch_id) = invite.batch_id {
                        let update = self.batches.record_failure(batch_id, &invite.to).await?;
                        log_counter_update(job, "failed", update);
                    }
                    tracing::warn!(
                        job_id = %job.id,
                        to = %invite.to,
                        attempt = job.attempts_made + 1,
                        error = %e,
                        "Invitation failed after final attempt"
                    );
                } else {
                    tracing::info!(
                        job_id = %job.id,
                        to = %invite.to,
                        attempt = job.attempts_made + 1,
                        error = %e,
                        "Invitation send failed, will retry"
                    );
                }
                Err(WorkerError::Send(e))
            }
        }
    }
}

fn log_counter_update(job: &ClaimedJob, counter: &str, update: CounterUpdate) {
    match update {
        CounterUpdate::Recorded(value) => {
            tracing::debug!(job_id = %job.id, counter, value, "Batch counter updated")
        }
        CounterUpdate::Expired => tracing::warn!(
            job_id = %job.id,
            counter,
            "Batch record expired before the job finished"
        ),
        CounterUpdate::Saturated => tracing::warn!(
            job_id = %job.id,
            counter,
            "Batch already fully accounted for, ignoring redelivered job"
        ),
    }
}

/// Claim one job and run it to a queue outcome.
/// Returns Ok(true) if a job was processed, Ok(false) if no job was available.
pub async fn process_next_job(
    queue: &dyn JobQueue,
    worker: &InviteWorker,
    limiter: &DefaultDirectRateLimiter,
) -> Result<bool, QueueError> {
    let job = match queue.claim().await? {
        Some(j) => j,
        None => return Ok(false),
    };

    if job.name != SEND_INVITE_JOB {
        tracing::warn!(job_id = %job.id, name = %job.name, "Unknown job name");
        queue.fail(&job, "unknown job name").await?;
        return Ok(true);
    }

    limiter.until_ready().await;

    tracing::debug!(
        job_id = %job.id,
        question_id = %job.data.question_id,
        attempt = job.attempts_made + 1,
        "Processing invitation job"
    );

    let settled = match worker.handle_invite(&job).await {
        Ok(_) => queue.complete(&job).await,
        Err(e) => queue.fail(&job, &e.to_string()).await.map(|outcome| match outcome {
            FailOutcome::Retrying { delay } => {
                metrics::counter!("invites_retried_total").increment(1);
                tracing::debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "Job scheduled for retry");
            }
            FailOutcome::Exhausted => {
                tracing::debug!(job_id = %job.id, "Job moved to failed set");
            }
        }),
    };

    match settled {
        Ok(()) => Ok(true),
        // Another consumer owns the job now and will settle it.
        Err(QueueError::LeaseLost(id)) => {
            tracing::warn!(job_id = %id, "Job lease expired while it was running");
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Shared limiter allowing `per_second` job starts per second.
pub fn rate_limiter(per_second: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rate))
}

/// Pool of consumer tasks pulling from one queue.
pub struct WorkerRuntime {
    queue: Arc<dyn JobQueue>,
    worker: Arc<InviteWorker>,
    limiter: Arc<DefaultDirectRateLimiter>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        worker: InviteWorker,
        concurrency: usize,
        rate_per_second: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            worker: Arc::new(worker),
            limiter: Arc::new(rate_limiter(rate_per_second)),
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Run until `shutdown` flips to true. In-flight jobs finish first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut consumers = JoinSet::new();
        for consumer in 0..self.concurrency {
            consumers.spawn(consume(
                consumer,
                Arc::clone(&self.queue),
                Arc::clone(&self.worker),
                Arc::clone(&self.limiter),
                self.poll_interval,
                shutdown.clone(),
            ));
        }

        tracing::info!(concurrency = self.concurrency, "Invitation consumers started");

        while let Some(result) = consumers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Consumer task panicked");
            }
        }

        tracing::info!("Invitation consumers stopped");
    }
}

async fn consume(
    consumer: usize,
    queue: Arc<dyn JobQueue>,
    worker: Arc<InviteWorker>,
    limiter: Arc<DefaultDirectRateLimiter>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let idle = match process_next_job(queue.as_ref(), &worker, &limiter).await {
            Ok(true) => false,
            Ok(false) => {
                tracing::trace!(consumer, "No jobs available, sleeping");
                true
            }
            Err(e) => {
                tracing::error!(consumer, error = %e, "Error processing job, will retry");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Send failed: {0}")]
    Send(#[from] MailerError),

    #[error("Batch store error: {0}")]
    Batch(#[from] BatchStoreError),
}
