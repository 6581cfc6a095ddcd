use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::invite::{InvitationStatus, Question, Recipient};
use crate::services::dispatch::InviteDirectory;

/// Get a question by ID
pub async fn get_question(pool: &PgPool, question_id: Uuid) -> Result<Option<Question>, sqlx::Error> {
    sqlx::query_as::<_, Question>(
        r#"
        SELECT id, title, owner_id, organization_id, invite_subject, invite_body, created_at
        FROM questions
        WHERE id = $1
        "#,
    )
    .bind(question_id)
    .fetch_optional(pool)
    .await
}

/// Whether `user_id` owns the question or belongs to its organization.
/// Returns None when the question does not exist.
pub async fn can_manage_question(
    pool: &PgPool,
    question_id: Uuid,
    user_id: Uuid,
) -> Result<Option<bool>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT q.owner_id = $2
               OR EXISTS (
                   SELECT 1 FROM organization_members m
                   WHERE m.organization_id = q.organization_id AND m.user_id = $2
               )
               OR EXISTS (
                   SELECT 1 FROM organizations o
                   WHERE o.id = q.organization_id AND o.owner_id = $2
               ) AS allowed
        FROM questions q
        WHERE q.id = $1
        "#,
    )
    .bind(question_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get::<bool, _>("allowed")).transpose()
}

/// Company users granted access to the question who have not registered yet
pub async fn get_pending_recipients(
    pool: &PgPool,
    question_id: Uuid,
) -> Result<Vec<Recipient>, sqlx::Error> {
    sqlx::query_as::<_, Recipient>(
        r#"
        SELECT cu.id AS company_user_id, cu.email, cu.name
        FROM question_access qa
        JOIN company_users cu ON cu.id = qa.company_user_id
        WHERE qa.question_id = $1
          AND NOT EXISTS (
              SELECT 1 FROM users u WHERE LOWER(u.email) = LOWER(cu.email)
          )
        ORDER BY cu.created_at ASC
        "#,
    )
    .bind(question_id)
    .fetch_all(pool)
    .await
}

/// Update a company user's invitation status, stamping invited_at when sent
pub async fn update_invitation_status(
    pool: &PgPool,
    company_user_id: Uuid,
    status: InvitationStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE company_users
        SET invitation_status = $1,
            invited_at = CASE WHEN $1 = 'sent' THEN NOW() ELSE invited_at END
        WHERE id = $2
        "#,
    )
    .bind(status.to_string())
    .bind(company_user_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Postgres-backed [`InviteDirectory`].
#[derive(Clone)]
pub struct PgInviteDirectory {
    pool: PgPool,
}

impl PgInviteDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InviteDirectory for PgInviteDirectory {
    async fn find_question(&self, question_id: Uuid) -> Result<Option<Question>, sqlx::Error> {
        get_question(&self.pool, question_id).await
    }

    async fn can_manage(&self, question_id: Uuid, user_id: Uuid) -> Result<Option<bool>, sqlx::Error> {
        can_manage_question(&self.pool, question_id, user_id).await
    }

    async fn pending_recipients(&self, question_id: Uuid) -> Result<Vec<Recipient>, sqlx::Error> {
        get_pending_recipients(&self.pool, question_id).await
    }

    async fn mark_invited(&self, company_user_id: Uuid) -> Result<(), sqlx::Error> {
        update_invitation_status(&self.pool, company_user_id, InvitationStatus::Sent).await
    }
}
