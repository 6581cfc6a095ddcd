pub mod auth;
pub mod batch_store;
pub mod dispatch;
pub mod mailer;
pub mod queue;
pub mod redis_conn;
pub mod template;
pub mod worker;
