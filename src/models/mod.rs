pub mod batch;
pub mod invite;
