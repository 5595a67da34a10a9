//! Demo worker: keeps a session to the hub and runs jobs it is handed.
//!
//! Run with: TETHER_URL=ws://127.0.0.1:9000/ws cargo run -p tether-worker-demo
//!
//! `TETHER_SLOTS` sets how many jobs may run at once (default 2).

use std::{sync::Arc, thread, time::Duration};

use anyhow::Context;
use serde_json::json;
use tether_core::{BlockingFeed, Envelope, SessionConfig};
use tether_executor::{
    CapacityHello, CommandRouter, NotifyOnComplete, ProcessRunner, SchedulerConfig,
    SlotScheduler, register_job_commands,
};
use tether_session::ReconnectingSession;
use tether_transport::WsConnector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STATS_INTERVAL: Duration = Duration::from_secs(15);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = SessionConfig::from_env().context("Invalid TETHER_* configuration")?;
    let slots = match std::env::var("TETHER_SLOTS") {
        Ok(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("TETHER_SLOTS is not a number: {raw}"))?,
        Err(_) => 2,
    };

    let scheduler = SlotScheduler::new(SchedulerConfig::with_slot_count(slots));
    let agent = format!("worker-{}", std::process::id());
    let session = ReconnectingSession::start(
        config,
        Arc::new(WsConnector::new()),
        Arc::new(CapacityHello::new(agent, scheduler.clone())),
    );
    scheduler.set_listener(Arc::new(NotifyOnComplete::new(Arc::new(session.clone()))));

    let mut router = CommandRouter::new(Arc::new(session.clone()));
    register_job_commands(&mut router, &scheduler, Arc::new(ProcessRunner::new()));
    let incoming = session
        .take_incoming()
        .context("Inbound stream already taken")?;
    let router_task = tokio::spawn(async move { router.run(incoming).await });

    let stats_scheduler = scheduler.clone();
    let mut stats = BlockingFeed::spawn("worker-stats", 4, move |feed| {
        while !feed.is_closed() {
            thread::sleep(STATS_INTERVAL);
            let snapshot = (stats_scheduler.free_slots(), stats_scheduler.list());
            if !feed.push(snapshot) {
                break;
            }
        }
    })?;

    tracing::info!(slots = scheduler.capacity(), "Worker started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            snapshot = stats.next() => {
                let Some((free, running)) = snapshot else { break };
                tracing::info!(free, running = running.len(), state = ?session.state(), "Stats");
                let envelope = Envelope::new("stats", json!({ "free": free, "running": running }));
                // Waits for a connection; must not hold up ctrl-c.
                let session = session.clone();
                tokio::spawn(async move {
                    if session.send(envelope).await.is_err() {
                        tracing::debug!("Stats dropped: session closed");
                    }
                });
            }
        }
    }

    tracing::info!("Shutting down");
    scheduler.shutdown();
    let clean = session.shutdown(SHUTDOWN_TIMEOUT).await;
    router_task.abort();
    if !clean {
        tracing::warn!("Session did not close within {SHUTDOWN_TIMEOUT:?}");
    }
    Ok(())
}
