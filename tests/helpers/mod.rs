//! Test doubles shared by the pipeline and API tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use vayam::models::invite::{Question, Recipient};
use vayam::services::dispatch::InviteDirectory;
use vayam::services::mailer::{Mailer, MailerError, OutgoingEmail};

/// Mailer that fails a configurable number of times per address.
#[derive(Default)]
pub struct ScriptedMailer {
    failures: Mutex<HashMap<String, usize>>,
    attempts: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl ScriptedMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` sends to `address`.
    pub fn fail_times(self, address: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(address.to_string(), times);
        self
    }

    /// Fail every send to `address`.
    pub fn always_fail(self, address: &str) -> Self {
        self.fail_times(address, usize::MAX)
    }

    pub fn attempts_for(&self, address: &str) -> usize {
        self.attempts.lock().unwrap().iter().filter(|a| *a == address).count()
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailerError> {
        self.attempts.lock().unwrap().push(email.to.clone());

        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&email.to) {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(1);
                return Err(MailerError::Rejected {
                    status: 503,
                    detail: "provider unavailable".to_string(),
                });
            }
        }
        drop(failures);

        self.sent.lock().unwrap().push(email.clone());
        Ok(format!("msg-{}", Uuid::new_v4()))
    }
}

/// In-memory question and recipient tables.
pub struct MemoryDirectory {
    question: Option<Question>,
    recipients: Vec<Recipient>,
    members: Vec<Uuid>,
    invited: Mutex<Vec<Uuid>>,
}

impl MemoryDirectory {
    pub fn new(question: Option<Question>, recipients: Vec<Recipient>) -> Self {
        Self {
            question,
            recipients,
            members: Vec::new(),
            invited: Mutex::new(Vec::new()),
        }
    }

    /// Add an organization member allowed to send the question's invites.
    pub fn with_member(mut self, user_id: Uuid) -> Self {
        self.members.push(user_id);
        self
    }

    pub fn invited(&self) -> Vec<Uuid> {
        self.invited.lock().unwrap().clone()
    }
}

#[async_trait]
impl InviteDirectory for MemoryDirectory {
    async fn find_question(&self, question_id: Uuid) -> Result<Option<Question>, sqlx::Error> {
        Ok(self.question.clone().filter(|q| q.id == question_id))
    }

    async fn can_manage(&self, question_id: Uuid, user_id: Uuid) -> Result<Option<bool>, sqlx::Error> {
        Ok(self
            .question
            .as_ref()
            .filter(|q| q.id == question_id)
            .map(|q| q.owner_id == user_id || self.members.contains(&user_id)))
    }

    async fn pending_recipients(&self, _question_id: Uuid) -> Result<Vec<Recipient>, sqlx::Error> {
        Ok(self.recipients.clone())
    }

    async fn mark_invited(&self, company_user_id: Uuid) -> Result<(), sqlx::Error> {
        self.invited.lock().unwrap().push(company_user_id);
        Ok(())
    }
}

pub fn question(title: &str) -> Question {
    Question {
        id: Uuid::new_v4(),
        title: title.to_string(),
        owner_id: Uuid::new_v4(),
        organization_id: None,
        invite_subject: None,
        invite_body: None,
        created_at: Utc::now(),
    }
}

pub fn recipient(email: &str, name: &str) -> Recipient {
    Recipient {
        company_user_id: Uuid::new_v4(),
        email: email.to_string(),
        name: name.to_string(),
    }
}
