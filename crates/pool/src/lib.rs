pub mod job;
pub mod worker_pool;

pub use job::{Job, JobOutcome, JobStatus, JobTicket, JobTrace};
pub use worker_pool::{ExecutionPool, PoolConfig, PoolError, PoolStats, SubmitError};
