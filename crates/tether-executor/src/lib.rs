//! Command routing and slot-scheduled jobs.
//!
//! Provides:
//! - A command router that answers correlated requests
//! - A slot scheduler bounding concurrent jobs
//! - `RUN` / `KILL` / `LIST_RUNNING` handlers and process-backed jobs

pub mod command;
pub mod jobs;
pub mod router;
pub mod scheduler;

pub use command::{CommandBuildError, CommandBuilder, CommandParts, ProcessRunner};
pub use jobs::{
    CapacityHello, JobRunner, KillHandler, ListRunningHandler, NotifyOnComplete, RunHandler,
    register_job_commands,
};
pub use router::{CommandContext, CommandHandler, CommandRouter};
pub use scheduler::{
    JobContext, JobError, JobFailure, JobHandle, JobListener, JobOutcome, RunningJobInfo,
    SchedulerConfig, SlotScheduler,
};
