//! Sync scheduler - periodic and on-demand sync cycles
//!
//! The [`SyncScheduler`] drives a [`SyncEngine`]: it starts a cycle every
//! poll interval, on a "sync now" request, and routes local change events
//! into the per-item pipeline as they arrive.
//!
//! ## Flow
//!
//! ```text
//! SyncTrigger ──→ mpsc::Receiver ──→ SyncScheduler ──→ SyncEngine
//!                                        │
//!                                  interval(poll)
//! ```
//!
//! A tick that finds a cycle already running, or the engine paused, is
//! skipped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cloudsync_core::domain::EngineState;

use crate::engine::{LocalEvent, SyncEngine};

/// Pending requests a trigger may queue before senders wait
const TRIGGER_CAPACITY: usize = 64;

#[derive(Debug)]
enum Request {
    SyncNow,
    Local(LocalEvent),
}

/// Handle for asking the scheduler to do work
///
/// Cloneable; the scheduler stops once every trigger is dropped.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    tx: mpsc::Sender<Request>,
}

impl SyncTrigger {
    /// Requests an immediate cycle, bypassing the poll interval
    ///
    /// Returns false if the scheduler has stopped.
    pub async fn request_sync(&self) -> bool {
        self.tx.send(Request::SyncNow).await.is_ok()
    }

    /// Hands a local change to the scheduler
    pub async fn notify_change(&self, event: LocalEvent) -> bool {
        self.tx.send(Request::Local(event)).await.is_ok()
    }
}

/// Runs sync cycles for one engine
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    rx: mpsc::Receiver<Request>,
    poll_interval: Duration,
}

impl SyncScheduler {
    /// Creates a scheduler and the trigger that feeds it
    pub fn new(engine: Arc<SyncEngine>, poll_interval: Duration) -> (Self, SyncTrigger) {
        let (tx, rx) = mpsc::channel(TRIGGER_CAPACITY);
        info!(
            poll_secs = poll_interval.as_secs_f64(),
            "Creating sync scheduler"
        );
        let scheduler = Self {
            engine,
            rx,
            poll_interval,
        };
        (scheduler, SyncTrigger { tx })
    }

    /// Scheduler using the engine's configured poll interval
    pub fn from_config(engine: Arc<SyncEngine>) -> (Self, SyncTrigger) {
        let poll = Duration::from_secs(engine.config().sync.poll_interval.max(1));
        Self::new(engine, poll)
    }

    /// Main loop
    ///
    /// Runs until `shutdown` fires or every [`SyncTrigger`] is dropped. The
    /// first tick fires immediately, so a freshly started scheduler syncs
    /// right away.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!("Sync scheduler starting");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                request = self.rx.recv() => match request {
                    Some(Request::SyncNow) => {
                        info!("User-initiated sync requested");
                        self.run_cycle().await;
                    }
                    Some(Request::Local(event)) => self.route(event).await,
                    None => {
                        info!("All triggers dropped, scheduler shutting down");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    self.engine.bandwidth().refresh();
                    self.run_cycle().await;
                    self.cleanup_cache().await;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn run_cycle(&self) {
        match self.engine.state() {
            EngineState::Syncing | EngineState::Paused => {
                debug!(state = %self.engine.state(), "Skipping scheduled cycle");
                return;
            }
            EngineState::Idle | EngineState::Error(_) => {}
        }
        match self.engine.start_sync().await {
            Ok(result) => debug!(
                downloaded = result.downloaded,
                uploaded = result.uploaded,
                "Scheduled cycle finished"
            ),
            Err(e) => warn!(error = %e, "Scheduled cycle failed"),
        }
    }

    async fn route(&self, event: LocalEvent) {
        let path = event.path().clone();
        match self.engine.handle_local_event(event).await {
            Ok(outcome) => debug!(path = %path, ?outcome, "Local change handled"),
            Err(e) => warn!(path = %path, error = %e, "Local change failed"),
        }
    }

    async fn cleanup_cache(&self) {
        if !self.engine.config().offline.auto_cleanup {
            return;
        }
        match self.engine.cleanup_offline_cache().await {
            Ok(evicted) if !evicted.is_empty() => {
                info!(count = evicted.len(), "Evicted offline cache entries")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Offline cache cleanup failed"),
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use cloudsync_cache::{DatabasePool, SqliteStateRepository};
    use cloudsync_core::config::ConfigBuilder;
    use cloudsync_core::domain::SyncPath;
    use cloudsync_core::ports::NoEncryption;
    use cloudsync_core::testing::{InMemoryCloud, InMemoryFileSystem, RecordingNotifier};

    use super::*;

    struct Fixture {
        engine: Arc<SyncEngine>,
        cloud: Arc<InMemoryCloud>,
        fs: Arc<InMemoryFileSystem>,
    }

    async fn fixture() -> Fixture {
        let pool = DatabasePool::in_memory().await.unwrap();
        let cloud = Arc::new(InMemoryCloud::new());
        let fs = Arc::new(InMemoryFileSystem::new());
        let config = ConfigBuilder::new()
            .sync_selected_folders(vec!["/".to_string()])
            .build();
        let engine = SyncEngine::new(
            config,
            cloud.clone(),
            fs.clone(),
            Arc::new(NoEncryption),
            Arc::new(RecordingNotifier::new()),
            Arc::new(SqliteStateRepository::new(pool.pool().clone())),
        )
        .unwrap();
        engine.initialize().await.unwrap();
        Fixture {
            engine: Arc::new(engine),
            cloud,
            fs,
        }
    }

    #[tokio::test]
    async fn test_request_sync_runs_a_cycle() {
        let f = fixture().await;
        f.fs.put("/notes.txt", b"hello");

        let (mut scheduler, trigger) = SyncScheduler::new(f.engine.clone(), Duration::from_secs(3600));
        assert!(trigger.request_sync().await);
        drop(trigger);

        tokio::time::timeout(Duration::from_secs(5), scheduler.run(CancellationToken::new()))
            .await
            .expect("scheduler should stop once triggers are dropped");

        assert_eq!(f.cloud.content("/notes.txt").as_deref(), Some(&b"hello"[..]));
        assert_eq!(f.engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_local_events_are_routed_to_the_engine() {
        let f = fixture().await;
        f.fs.put("/a.txt", b"one");

        let (mut scheduler, trigger) = SyncScheduler::new(f.engine.clone(), Duration::from_secs(3600));
        let path: SyncPath = "/a.txt".parse().unwrap();
        assert!(trigger.notify_change(LocalEvent::Created(path)).await);
        drop(trigger);

        tokio::time::timeout(Duration::from_secs(5), scheduler.run(CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(f.cloud.content("/a.txt").as_deref(), Some(&b"one"[..]));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let f = fixture().await;
        let (mut scheduler, _trigger) =
            SyncScheduler::new(f.engine.clone(), Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), scheduler.run(shutdown))
            .await
            .expect("scheduler should exit on shutdown");
    }

    #[tokio::test]
    async fn test_paused_engine_skips_ticks() {
        let f = fixture().await;
        f.fs.put("/later.txt", b"x");
        f.engine.start_sync().await.unwrap();
        f.fs.put("/later2.txt", b"y");

        // Idle -> Paused is not a valid transition; pause from a running state
        f.engine.events().publish_state(EngineState::Syncing);
        f.engine.pause_sync(false).unwrap();

        let (scheduler, _trigger) = SyncScheduler::new(f.engine.clone(), Duration::from_millis(10));
        scheduler.run_cycle().await;

        assert!(f.cloud.content("/later2.txt").is_none());
        assert_eq!(f.engine.state(), EngineState::Paused);
    }
}
