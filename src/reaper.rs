//! Background reaper (C4): evicts sessions whose inactivity window exceeded
//! their TTL.
//!
//! One cooperative task, started at boot and cancelled at shutdown. Ticks
//! every `cleanup_interval`; the first tick is skipped so a session created
//! moments before boot isn't evicted before it has had a chance to run.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::SandboxEngine;
use crate::session::SessionTable;

/// Start the reaper task. The returned handle resolves once `cancel` fires
/// and the in-flight sweep (if any) finishes.
pub fn spawn(
    sessions: Arc<SessionTable>,
    engine: Arc<dyn SandboxEngine>,
    interval: Duration,
    stop_grace: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick is immediate; skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("reaper sweep");
                    sweep(&sessions, engine.as_ref(), stop_grace).await;
                }
                _ = cancel.cancelled() => {
                    info!("reaper cancelled, exiting");
                    return;
                }
            }
        }
    })
}

async fn sweep(sessions: &SessionTable, engine: &dyn SandboxEngine, stop_grace: Duration) {
    let expired = sessions.take_expired(chrono::Utc::now()).await;
    for record in expired {
        info!(session = %record.session_id, container = %record.container_id, "reaping expired session");
        if let Err(e) = engine.stop(&record.container_id, stop_grace).await {
            warn!(container = %record.container_id, error = %e, "reaper: stop failed, continuing cleanup");
        }
        if let Err(e) = engine.remove(&record.container_id).await {
            warn!(container = %record.container_id, error = %e, "reaper: remove failed");
        }
    }
}

/// Stop every remaining tracked container. Run once at shutdown, after the
/// reaper task has been cancelled and joined, before the engine client is
/// torn down.
pub async fn final_sweep(sessions: &SessionTable, engine: &dyn SandboxEngine, stop_grace: Duration) {
    let remaining = sessions.drain().await;
    if remaining.is_empty() {
        return;
    }
    info!(count = remaining.len(), "shutdown sweep: stopping remaining containers");
    for record in remaining {
        if let Err(e) = engine.stop(&record.container_id, stop_grace).await {
            warn!(container = %record.container_id, error = %e, "shutdown sweep: stop failed");
        }
        if let Err(e) = engine.remove(&record.container_id).await {
            warn!(container = %record.container_id, error = %e, "shutdown sweep: remove failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRecord;
    use crate::testing::FakeEngine;
    use chrono::{DateTime, Utc};

    fn record(container_id: &str, ttl_seconds: u64) -> SessionRecord {
        SessionRecord {
            container_id: container_id.to_string(),
            session_id: format!("session-{container_id}"),
            profile_name: "python".to_string(),
            profile: crate::testing::test_profile("python"),
            persistent: true,
            ttl_seconds,
            started_at: DateTime::<Utc>::default(),
            last_activity: DateTime::<Utc>::default(),
            ttyd_enabled: false,
            ttyd_host_port: None,
            ttyd_url: None,
            network_override: false,
        }
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_records() {
        let sessions = Arc::new(SessionTable::new());
        sessions.insert(record("expired", 0)).await;
        sessions.insert(record("fresh", 3600)).await;

        let engine = Arc::new(FakeEngine::new());
        engine.track_running("expired").await;
        engine.track_running("fresh").await;

        sweep(
            &sessions,
            engine.as_ref(),
            Duration::from_secs(5),
        )
        .await;

        assert!(sessions.lookup("expired").await.is_none());
        assert!(sessions.lookup("fresh").await.is_some());
        assert!(engine.was_stopped("expired").await);
        assert!(!engine.was_stopped("fresh").await);
    }

    #[tokio::test]
    async fn final_sweep_stops_everything_remaining() {
        let sessions = Arc::new(SessionTable::new());
        sessions.insert(record("a", 3600)).await;
        sessions.insert(record("b", 3600)).await;

        let engine = Arc::new(FakeEngine::new());
        engine.track_running("a").await;
        engine.track_running("b").await;

        final_sweep(&sessions, engine.as_ref(), Duration::from_secs(5)).await;

        assert!(sessions.snapshot().await.is_empty());
        assert!(engine.was_stopped("a").await);
        assert!(engine.was_stopped("b").await);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_promptly() {
        let sessions = Arc::new(SessionTable::new());
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new());
        let cancel = CancellationToken::new();

        let handle = spawn(
            sessions,
            engine,
            Duration::from_secs(3600),
            Duration::from_secs(5),
            cancel.clone(),
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper task should exit promptly on cancellation")
            .unwrap();
    }
}
