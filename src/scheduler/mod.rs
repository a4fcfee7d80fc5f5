//! Controller-side scheduling collaborator.
//!
//! Deciding *when* a task fires is left to the caller; this module owns
//! running a fired job on its agents, recording the result, and the
//! `initialize` / `wait_and_exit` lifecycle the shutdown sequence drives.

pub mod dispatcher;
pub mod job;

use async_trait::async_trait;

pub use dispatcher::JobScheduler;
pub use job::Job;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("task log store error: {0}")]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start accepting fired jobs.
    fn initialize(&self);

    /// Stop accepting jobs and block until every running dispatch has finished.
    async fn wait_and_exit(&self);
}
