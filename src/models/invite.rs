use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Queue job name for a single invitation email.
pub const SEND_INVITE_JOB: &str = "send-invite";

/// One recipient's email-send task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationJob {
    pub to: String,
    pub recipient_name: String,
    pub question_title: String,
    pub question_id: Uuid,
    pub invite_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// `delay * 2^(attempt - 1)` after the n-th failed attempt.
    Exponential { delay_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the next run, given how many attempts have failed so far
    /// (at least 1).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(31);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exp))
            }
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
        }
    }
}

/// Maximum number of finished job records kept by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub completed: usize,
    pub failed: usize,
}

/// Retry and retention policy attached to each enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay_ms: 5000 },
            retention: Retention {
                completed: 100,
                failed: 200,
            },
        }
    }
}

/// Access-granted company user who has not registered on the platform yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, sqlx::FromRow)]
pub struct Recipient {
    #[garde(skip)]
    pub company_user_id: Uuid,
    #[garde(email)]
    pub email: String,
    #[garde(skip)]
    pub name: String,
}

/// The slice of a question the invitation pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Question {
    pub id: Uuid,
    pub title: String,
    pub owner_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub invite_subject: Option<String>,
    pub invite_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Invitation state stored on a company user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    /// Dispatch was attempted; says nothing about delivery.
    Sent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = JobOptions::default();
        assert_eq!(opts.attempts, 3);
        assert_eq!(opts.backoff, Backoff::Exponential { delay_ms: 5000 });
        assert_eq!(opts.retention.completed, 100);
        assert_eq!(opts.retention.failed, 200);
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential { delay_ms: 5000 };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(20));
    }

    #[test]
    fn test_job_payload_is_camel_case() {
        let job = InvitationJob {
            to: "ana@example.org".to_string(),
            recipient_name: "Ana".to_string(),
            question_title: "Water Policy".to_string(),
            question_id: Uuid::nil(),
            invite_link: "https://vayam.app/signup?email=ana%40example.org".to_string(),
            custom_subject: None,
            custom_body: None,
            batch_id: None,
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["recipientName"], "Ana");
        assert_eq!(json["inviteLink"], job.invite_link);
        assert!(json.get("batchId").is_none());

        let back: InvitationJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_invitation_status_strings() {
        assert_eq!(InvitationStatus::Sent.to_string(), "sent");
        assert_eq!("pending".parse::<InvitationStatus>().unwrap(), InvitationStatus::Pending);
    }

    #[test]
    fn test_recipient_email_validation() {
        let mut recipient = Recipient {
            company_user_id: Uuid::new_v4(),
            email: "ana@example.org".to_string(),
            name: "Ana".to_string(),
        };
        assert!(recipient.validate().is_ok());

        recipient.email = "not-an-email".to_string();
        assert!(recipient.validate().is_err());
    }
}
