use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::queries::PgInviteDirectory;
use crate::error::ApiError;
use crate::services::{
    auth::JwtVerifier,
    batch_store::BatchStore,
    dispatch::{InviteDirectory, InviteDispatcher},
    queue::JobQueue,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<dyn JobQueue>,
    pub batches: Arc<dyn BatchStore>,
    pub directory: Arc<dyn InviteDirectory>,
    pub dispatcher: Arc<InviteDispatcher>,
    pub auth: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: Arc<dyn JobQueue>,
        batches: Arc<dyn BatchStore>,
        auth: JwtVerifier,
        platform_url: &str,
    ) -> Self {
        let directory: Arc<dyn InviteDirectory> = Arc::new(PgInviteDirectory::new(db.clone()));
        Self::with_directory(db, directory, queue, batches, auth, platform_url)
    }

    pub fn with_directory(
        db: PgPool,
        directory: Arc<dyn InviteDirectory>,
        queue: Arc<dyn JobQueue>,
        batches: Arc<dyn BatchStore>,
        auth: JwtVerifier,
        platform_url: &str,
    ) -> Self {
        let dispatcher = InviteDispatcher::new(
            Arc::clone(&directory),
            Arc::clone(&queue),
            Arc::clone(&batches),
            platform_url,
        );
        Self {
            db,
            queue,
            batches,
            directory,
            dispatcher: Arc::new(dispatcher),
            auth: Arc::new(auth),
        }
    }
}

/// Authenticated caller, extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let user_id = state.auth.verify_header(header)?;
        Ok(AuthUser { user_id })
    }
}
