//! Multi-subscriber event streams
//!
//! Every stream is a `tokio::sync::broadcast` channel: publishing never
//! blocks and a slow subscriber observes `RecvError::Lagged` instead of
//! stalling the engine. The engine state is additionally mirrored in a
//! `watch` channel so late subscribers can read the current value and no
//! subscriber misses the latest state.

use tokio::sync::{broadcast, watch};
use tracing::trace;

use cloudsync_core::domain::{
    BandwidthUsage, CacheUpdate, ConflictEvent, EngineState, ItemChange, NetworkStatusChange,
    SelectionChange, SyncProgress, TransferStatusChange,
};

/// Buffered events per stream before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// Fan-out hub for every stream the sync core publishes
#[derive(Debug)]
pub struct EventHub {
    current_state: watch::Sender<EngineState>,
    state_changes: broadcast::Sender<EngineState>,
    item_changes: broadcast::Sender<ItemChange>,
    progress_updates: broadcast::Sender<SyncProgress>,
    conflicts: broadcast::Sender<ConflictEvent>,
    selection_changes: broadcast::Sender<SelectionChange>,
    cache_updates: broadcast::Sender<CacheUpdate>,
    bandwidth_usage: broadcast::Sender<BandwidthUsage>,
    network_status: broadcast::Sender<NetworkStatusChange>,
    transfer_status: broadcast::Sender<TransferStatusChange>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (current_state, _) = watch::channel(EngineState::Idle);
        Self {
            current_state,
            state_changes: broadcast::channel(CHANNEL_CAPACITY).0,
            item_changes: broadcast::channel(CHANNEL_CAPACITY).0,
            progress_updates: broadcast::channel(CHANNEL_CAPACITY).0,
            conflicts: broadcast::channel(CHANNEL_CAPACITY).0,
            selection_changes: broadcast::channel(CHANNEL_CAPACITY).0,
            cache_updates: broadcast::channel(CHANNEL_CAPACITY).0,
            bandwidth_usage: broadcast::channel(CHANNEL_CAPACITY).0,
            network_status: broadcast::channel(CHANNEL_CAPACITY).0,
            transfer_status: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Watches the current engine state
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.current_state.subscribe()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<EngineState> {
        self.state_changes.subscribe()
    }

    pub fn item_changes(&self) -> broadcast::Receiver<ItemChange> {
        self.item_changes.subscribe()
    }

    pub fn progress_updates(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress_updates.subscribe()
    }

    pub fn conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.conflicts.subscribe()
    }

    pub fn selection_changes(&self) -> broadcast::Receiver<SelectionChange> {
        self.selection_changes.subscribe()
    }

    pub fn cache_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.cache_updates.subscribe()
    }

    pub fn bandwidth_usage(&self) -> broadcast::Receiver<BandwidthUsage> {
        self.bandwidth_usage.subscribe()
    }

    pub fn network_status(&self) -> broadcast::Receiver<NetworkStatusChange> {
        self.network_status.subscribe()
    }

    pub fn transfer_status(&self) -> broadcast::Receiver<TransferStatusChange> {
        self.transfer_status.subscribe()
    }

    // ========================================================================
    // Publishing
    // ========================================================================
    //
    // `send` only fails when nobody is subscribed, which is not an error.

    pub fn current_state(&self) -> EngineState {
        self.current_state.borrow().clone()
    }

    pub fn publish_state(&self, state: EngineState) {
        trace!(state = %state, "Publishing engine state");
        self.current_state.send_replace(state.clone());
        let _ = self.state_changes.send(state);
    }

    /// Moves the engine to `target` if the current state allows it
    ///
    /// The check and the update happen under the watch lock, so two callers
    /// racing from the same state cannot both succeed. Returns the previous
    /// state, `None` when already at `target`, or the blocking state.
    pub fn transition_state(
        &self,
        target: EngineState,
    ) -> Result<Option<EngineState>, EngineState> {
        let mut outcome = Ok(None);
        let changed = self.current_state.send_if_modified(|state| {
            if *state == target {
                return false;
            }
            if !state.can_transition_to(&target) {
                outcome = Err(state.clone());
                return false;
            }
            outcome = Ok(Some(std::mem::replace(state, target.clone())));
            true
        });
        if changed {
            trace!(state = %target, "Publishing engine state");
            let _ = self.state_changes.send(target);
        }
        outcome
    }

    pub fn publish_item(&self, change: ItemChange) {
        let _ = self.item_changes.send(change);
    }

    pub fn publish_progress(&self, progress: SyncProgress) {
        let _ = self.progress_updates.send(progress);
    }

    pub fn publish_conflict(&self, event: ConflictEvent) {
        let _ = self.conflicts.send(event);
    }

    pub fn publish_selection(&self, change: SelectionChange) {
        let _ = self.selection_changes.send(change);
    }

    pub fn publish_cache(&self, update: CacheUpdate) {
        let _ = self.cache_updates.send(update);
    }

    pub fn publish_bandwidth(&self, usage: BandwidthUsage) {
        let _ = self.bandwidth_usage.send(usage);
    }

    pub fn publish_network(&self, change: NetworkStatusChange) {
        let _ = self.network_status.send(change);
    }

    pub fn publish_transfer(&self, change: TransferStatusChange) {
        let _ = self.transfer_status.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_core::domain::{ChangeType, ItemState};

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let hub = EventHub::new();
        hub.publish_progress(SyncProgress::default());
        hub.publish_state(EngineState::Syncing);
        assert_eq!(hub.current_state(), EngineState::Syncing);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let hub = EventHub::new();
        let mut a = hub.item_changes();
        let mut b = hub.item_changes();

        hub.publish_item(ItemChange::new(
            "/a.txt".parse().unwrap(),
            ChangeType::Added,
            ItemState::NotSynced,
        ));

        assert_eq!(a.recv().await.unwrap().path.as_str(), "/a.txt");
        assert_eq!(b.recv().await.unwrap().change_type, ChangeType::Added);
    }

    #[test]
    fn test_transition_state_checks_the_table() {
        let hub = EventHub::new();
        assert_eq!(hub.transition_state(EngineState::Paused), Err(EngineState::Idle));
        assert_eq!(
            hub.transition_state(EngineState::Syncing),
            Ok(Some(EngineState::Idle))
        );
        assert_eq!(hub.transition_state(EngineState::Syncing), Ok(None));
        assert_eq!(hub.current_state(), EngineState::Syncing);
    }

    #[test]
    fn test_racing_transitions_only_one_wins() {
        let hub = EventHub::new();
        hub.publish_state(EngineState::Syncing);
        let mut rx = hub.state_changes();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| hub.transition_state(EngineState::Paused)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join())
                .filter(|r| matches!(r, Ok(Ok(Some(_)))))
                .count()
        });

        assert_eq!(winners, 1);
        assert_eq!(rx.try_recv().unwrap(), EngineState::Paused);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_keeps_latest_state() {
        let hub = EventHub::new();
        hub.publish_state(EngineState::Syncing);
        hub.publish_state(EngineState::Paused);

        let rx = hub.watch_state();
        assert_eq!(*rx.borrow(), EngineState::Paused);
    }
}
