//! Dispatch coordinator: turns a question's pending access grants into one
//! batch of queued invitation jobs.

use async_trait::async_trait;
use garde::Validate;
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::invite::{InvitationJob, JobOptions, Question, Recipient, SEND_INVITE_JOB};
use crate::services::batch_store::{BatchStore, BatchStoreError};
use crate::services::queue::{JobQueue, QueueError};

/// Read/write access to the question and recipient tables.
#[async_trait]
pub trait InviteDirectory: Send + Sync {
    async fn find_question(&self, question_id: Uuid) -> Result<Option<Question>, sqlx::Error>;

    /// Whether `user_id` owns the question or belongs to its organization.
    /// None when the question does not exist.
    async fn can_manage(&self, question_id: Uuid, user_id: Uuid) -> Result<Option<bool>, sqlx::Error>;

    /// Access-granted company users whose email matches no registered user.
    async fn pending_recipients(&self, question_id: Uuid) -> Result<Vec<Recipient>, sqlx::Error>;

    /// Set the recipient's invitation status to sent and stamp `invited_at`.
    async fn mark_invited(&self, company_user_id: Uuid) -> Result<(), sqlx::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub queued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
}

pub struct InviteDispatcher {
    directory: Arc<dyn InviteDirectory>,
    queue: Arc<dyn JobQueue>,
    batches: Arc<dyn BatchStore>,
    platform_url: String,
    options: JobOptions,
}

impl InviteDispatcher {
    pub fn new(
        directory: Arc<dyn InviteDirectory>,
        queue: Arc<dyn JobQueue>,
        batches: Arc<dyn BatchStore>,
        platform_url: &str,
    ) -> Self {
        Self {
            directory,
            queue,
            batches,
            platform_url: platform_url.trim_end_matches('/').to_string(),
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Queue one invitation per pending recipient of `question_id`.
    ///
    /// The caller is trusted to have authorized the request. Recipients are
    /// marked as sent as soon as their job is queued. A failure part way
    /// through leaves the already-queued jobs in place.
    pub async fn dispatch_invites(&self, question_id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        let question = self
            .directory
            .find_question(question_id)
            .await?
            .ok_or(DispatchError::QuestionNotFound(question_id))?;

        let recipients: Vec<Recipient> = self
            .directory
            .pending_recipients(question_id)
            .await?
            .into_iter()
            .filter(|r| match r.validate() {
                Ok(()) => true,
                Err(report) => {
                    tracing::warn!(
                        question_id = %question_id,
                        company_user_id = %r.company_user_id,
                        error = %report,
                        "Skipping recipient with invalid email"
                    );
                    false
                }
            })
            .collect();

        if recipients.is_empty() {
            tracing::info!(question_id = %question_id, "No pending invitations to send");
            return Ok(DispatchOutcome {
                queued: 0,
                batch_id: None,
            });
        }

        // Every link must build before the batch record exists.
        let links = recipients
            .iter()
            .map(|r| invite_link(&self.platform_url, &r.email))
            .collect::<Result<Vec<_>, _>>()?;

        let batch = self
            .batches
            .create(question_id, recipients.len() as u64)
            .await?;

        for (recipient, invite_link) in recipients.iter().zip(links) {
            let job = InvitationJob {
                to: recipient.email.clone(),
                recipient_name: recipient.name.clone(),
                question_title: question.title.clone(),
                question_id,
                invite_link,
                custom_subject: question.invite_subject.clone(),
                custom_body: question.invite_body.clone(),
                batch_id: Some(batch.batch_id),
            };

            let job_id = self.queue.enqueue(SEND_INVITE_JOB, &job, &self.options).await?;
            self.directory.mark_invited(recipient.company_user_id).await?;
            metrics::counter!("invites_enqueued_total").increment(1);

            tracing::debug!(
                job_id = %job_id,
                batch_id = %batch.batch_id,
                to = %recipient.email,
                "Queued invitation"
            );
        }

        tracing::info!(
            question_id = %question_id,
            batch_id = %batch.batch_id,
            queued = recipients.len(),
            "Invitation batch queued"
        );

        Ok(DispatchOutcome {
            queued: recipients.len(),
            batch_id: Some(batch.batch_id),
        })
    }
}

/// Signup deep link carrying the recipient's email as a query parameter.
pub fn invite_link(platform_url: &str, email: &str) -> Result<String, DispatchError> {
    let base = format!("{}/signup", platform_url.trim_end_matches('/'));
    Url::parse_with_params(&base, &[("email", email)])
        .map(String::from)
        .map_err(|e| DispatchError::InvalidPlatformUrl(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Question not found: {0}")]
    QuestionNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Batch store error: {0}")]
    Batch(#[from] BatchStoreError),

    #[error("Invalid platform URL: {0}")]
    InvalidPlatformUrl(String),
}
