//! Job commands on top of the router and scheduler.
//!
//! `RUN` answers once the job holds a slot; its outcome follows later as a
//! `job_finished` notification posted by [`NotifyOnComplete`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};
use tether_core::{Envelope, Handshake, HandlerError, Outbox, commands};
use tracing::{info, warn};

use crate::{
    router::{CommandContext, CommandHandler, CommandRouter},
    scheduler::{JobContext, JobError, JobListener, JobOutcome, SlotScheduler},
};

/// Builds the future for a job from its `RUN` parameters.
pub trait JobRunner: Send + Sync {
    fn run(&self, params: Value, ctx: JobContext) -> BoxFuture<'static, Result<Value, JobError>>;
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    job_id: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct KillRequest {
    job_id: String,
}

/// `RUN {job_id, params}` -> `{job_id, slot}`.
pub struct RunHandler {
    scheduler: SlotScheduler,
    runner: Arc<dyn JobRunner>,
}

impl RunHandler {
    #[must_use]
    pub fn new(scheduler: SlotScheduler, runner: Arc<dyn JobRunner>) -> Self {
        Self { scheduler, runner }
    }
}

#[async_trait]
impl CommandHandler for RunHandler {
    async fn handle(&self, data: Value, _ctx: CommandContext) -> Result<Value, HandlerError> {
        let RunRequest { job_id, params } = serde_json::from_value(data)
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        let runner = Arc::clone(&self.runner);
        let handle = self
            .scheduler
            .start(job_id, move |ctx| runner.run(params, ctx))
            .await?;

        Ok(json!({ "job_id": handle.job_id(), "slot": handle.slot() }))
    }
}

/// `KILL {job_id}` -> `{job_id, cancelled}`.
pub struct KillHandler {
    scheduler: SlotScheduler,
}

impl KillHandler {
    #[must_use]
    pub const fn new(scheduler: SlotScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl CommandHandler for KillHandler {
    async fn handle(&self, data: Value, _ctx: CommandContext) -> Result<Value, HandlerError> {
        let KillRequest { job_id } = serde_json::from_value(data)
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        let cancelled = self.scheduler.cancel(&job_id);
        Ok(json!({ "job_id": job_id, "cancelled": cancelled }))
    }
}

/// `LIST_RUNNING` -> `{jobs}`.
pub struct ListRunningHandler {
    scheduler: SlotScheduler,
}

impl ListRunningHandler {
    #[must_use]
    pub const fn new(scheduler: SlotScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl CommandHandler for ListRunningHandler {
    async fn handle(&self, _data: Value, _ctx: CommandContext) -> Result<Value, HandlerError> {
        Ok(json!({ "jobs": self.scheduler.list() }))
    }
}

/// Register `RUN`, `KILL` and `LIST_RUNNING` on `router`.
pub fn register_job_commands(
    router: &mut CommandRouter,
    scheduler: &SlotScheduler,
    runner: Arc<dyn JobRunner>,
) {
    router.register(commands::RUN, RunHandler::new(scheduler.clone(), runner));
    router.register(commands::KILL, KillHandler::new(scheduler.clone()));
    router.register(
        commands::LIST_RUNNING,
        ListRunningHandler::new(scheduler.clone()),
    );
}

/// Posts `job_finished {job_id, outcome}` for every completed job.
pub struct NotifyOnComplete {
    outbox: Arc<dyn Outbox>,
}

impl NotifyOnComplete {
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl JobListener for NotifyOnComplete {
    async fn on_job_complete(&self, job_id: &str, outcome: &JobOutcome) {
        let envelope = Envelope::new(
            commands::JOB_FINISHED,
            json!({ "job_id": job_id, "outcome": outcome }),
        );
        if self.outbox.post(envelope).await.is_err() {
            warn!(job_id, "Session closed; job outcome not reported");
        }
    }
}

/// Announces the agent and its free capacity on every connect.
pub struct CapacityHello {
    agent: String,
    version: String,
    scheduler: SlotScheduler,
}

impl CapacityHello {
    #[must_use]
    pub fn new(agent: impl Into<String>, scheduler: SlotScheduler) -> Self {
        Self {
            agent: agent.into(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            scheduler,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

#[async_trait]
impl Handshake for CapacityHello {
    async fn hello(&self) -> Option<Envelope> {
        let running = self.scheduler.list();
        info!(
            agent = %self.agent,
            free = self.scheduler.free_slots(),
            running = running.len(),
            "Announcing capacity"
        );
        Some(Envelope::new(
            commands::HELLO,
            json!({
                "agent": self.agent,
                "version": self.version,
                "slots": self.scheduler.capacity(),
                "free": self.scheduler.free_slots(),
                "running": running,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::{Notify, mpsc};

    use super::*;
    use crate::{router::tests::RecordingOutbox, scheduler::SchedulerConfig};

    /// Runs until cancelled or released; returns its params.
    struct GatedRunner {
        gate: Arc<Notify>,
    }

    impl JobRunner for GatedRunner {
        fn run(
            &self,
            params: Value,
            ctx: JobContext,
        ) -> BoxFuture<'static, Result<Value, JobError>> {
            let gate = Arc::clone(&self.gate);
            async move {
                tokio::select! {
                    () = gate.notified() => Ok(params),
                    () = ctx.cancel.cancelled() => Err(JobError::Cancelled),
                }
            }
            .boxed()
        }
    }

    struct Fixture {
        router: CommandRouter,
        scheduler: SlotScheduler,
        gate: Arc<Notify>,
        sent: mpsc::UnboundedReceiver<Envelope>,
    }

    fn fixture(slots: usize) -> Fixture {
        let (outbox, sent) = RecordingOutbox::new();
        let scheduler = SlotScheduler::new(SchedulerConfig::with_slot_count(slots));
        scheduler.set_listener(Arc::new(NotifyOnComplete::new(outbox.clone())));
        let gate = Arc::new(Notify::new());

        let mut router = CommandRouter::new(outbox);
        register_job_commands(
            &mut router,
            &scheduler,
            Arc::new(GatedRunner {
                gate: Arc::clone(&gate),
            }),
        );
        Fixture {
            router,
            scheduler,
            gate,
            sent,
        }
    }

    async fn call(router: &CommandRouter, command: &str, id: &str, data: Value) {
        router
            .dispatch(Envelope::new(command, data).with_correlation(id.into()))
            .unwrap()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_replies_with_slot_then_reports_outcome() {
        let mut f = fixture(1);

        call(
            &f.router,
            commands::RUN,
            "r1",
            json!({ "job_id": "j1", "params": { "x": 1 } }),
        )
        .await;
        let reply = f.sent.recv().await.unwrap();
        assert_eq!(reply.command, commands::REPLY);
        assert_eq!(reply.data, json!({ "job_id": "j1", "slot": "0" }));

        f.gate.notify_one();
        let finished = tokio::time::timeout(Duration::from_secs(1), f.sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.command, commands::JOB_FINISHED);
        assert_eq!(finished.correlation_id, None);
        assert_eq!(
            finished.data,
            json!({
                "job_id": "j1",
                "outcome": { "status": "succeeded", "detail": { "x": 1 } }
            })
        );
        assert_eq!(f.scheduler.free_slots(), 1);
    }

    #[tokio::test]
    async fn duplicate_run_is_an_error_reply() {
        let mut f = fixture(2);

        call(&f.router, commands::RUN, "r1", json!({ "job_id": "j1" })).await;
        assert_eq!(f.sent.recv().await.unwrap().command, commands::REPLY);

        call(&f.router, commands::RUN, "r2", json!({ "job_id": "j1" })).await;
        let reply = f.sent.recv().await.unwrap();
        assert!(reply.is_error());
        assert_eq!(reply.error_message(), "Job already registered: j1");
    }

    #[tokio::test]
    async fn malformed_run_is_rejected() {
        let mut f = fixture(1);
        call(&f.router, commands::RUN, "r1", json!({ "params": {} })).await;
        let reply = f.sent.recv().await.unwrap();
        assert!(reply.is_error());
        assert!(reply.error_message().starts_with("Invalid payload"));
        assert_eq!(f.scheduler.free_slots(), 1);
    }

    #[tokio::test]
    async fn kill_cancels_and_lists_update() {
        let mut f = fixture(2);
        call(&f.router, commands::RUN, "r1", json!({ "job_id": "a" })).await;
        call(&f.router, commands::RUN, "r2", json!({ "job_id": "b" })).await;
        f.sent.recv().await.unwrap();
        f.sent.recv().await.unwrap();

        call(&f.router, commands::LIST_RUNNING, "l1", Value::Null).await;
        assert_eq!(
            f.sent.recv().await.unwrap().data,
            json!({ "jobs": ["a", "b"] })
        );

        call(&f.router, commands::KILL, "k1", json!({ "job_id": "a" })).await;
        assert_eq!(
            f.sent.recv().await.unwrap().data,
            json!({ "job_id": "a", "cancelled": true })
        );

        let finished = f.sent.recv().await.unwrap();
        assert_eq!(finished.command, commands::JOB_FINISHED);
        assert_eq!(
            finished.data,
            json!({ "job_id": "a", "outcome": { "status": "cancelled" } })
        );

        call(&f.router, commands::LIST_RUNNING, "l2", Value::Null).await;
        assert_eq!(f.sent.recv().await.unwrap().data, json!({ "jobs": ["b"] }));
    }

    #[tokio::test]
    async fn kill_unknown_job_reports_false() {
        let mut f = fixture(1);
        call(&f.router, commands::KILL, "k1", json!({ "job_id": "ghost" })).await;
        assert_eq!(
            f.sent.recv().await.unwrap().data,
            json!({ "job_id": "ghost", "cancelled": false })
        );
    }

    #[tokio::test]
    async fn hello_reports_capacity() {
        let mut f = fixture(3);
        call(&f.router, commands::RUN, "r1", json!({ "job_id": "j1" })).await;
        f.sent.recv().await.unwrap();

        let hello = CapacityHello::new("worker-1", f.scheduler.clone())
            .with_version("1.2.3")
            .hello()
            .await
            .unwrap();
        assert_eq!(hello.command, commands::HELLO);
        assert_eq!(
            hello.data,
            json!({
                "agent": "worker-1",
                "version": "1.2.3",
                "slots": 3,
                "free": 2,
                "running": ["j1"],
            })
        );
    }
}
