//! Bandwidth scheduling
//!
//! The [`BandwidthScheduler`] admits transfers and splits each direction's
//! effective limit among the active transfers by priority weight:
//!
//! ```text
//! allocated = limit * weight / sum(weights of active transfers in that direction)
//! ```
//!
//! Allocations are recomputed whenever a transfer joins or leaves, or when
//! any input of the effective limit changes:
//!
//! - configured limit (`None` = unlimited)
//! - network quality factor, when auto throttling is enabled
//! - power saving, which halves the limit
//! - metered links, which pause transfers when configured to
//! - sync time windows; outside every window the allocation is 0
//! - the engine-wide pause override
//!
//! An allocation of 0 means "wait", never "fail". Transfers pace themselves
//! through [`BandwidthScheduler::consume`], which draws from a token bucket
//! per direction and one per transfer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cloudsync_core::config::BandwidthConfig;
use cloudsync_core::domain::{
    in_sync_window, BandwidthAllocation, BandwidthUsage, NetworkQuality, NetworkStatusChange,
    NetworkType, SyncError, SyncTimeWindow, TransferId, TransferPriority, TransferStatus,
    TransferStatusChange, TransferType,
};

use crate::events::EventHub;

/// How often a waiting transfer re-checks the sync windows
const WINDOW_RECHECK: Duration = Duration::from_secs(15);

type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

// ============================================================================
// TokenBucket
// ============================================================================

/// Byte-rate token bucket with a one second burst
///
/// Tokens may go negative: a large chunk is admitted at once and the debt
/// is paid off by waiting.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    /// Bytes per second; `None` = unlimited
    rate: Option<u64>,
}

impl TokenBucket {
    fn new(rate: Option<u64>) -> Self {
        Self {
            tokens: rate.unwrap_or(0) as f64,
            last_refill: Instant::now(),
            rate,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
        }
        self.last_refill = now;
    }

    fn set_rate(&mut self, rate: Option<u64>) {
        self.refill();
        if self.rate != rate {
            self.tokens = match (self.rate, rate) {
                // Leaving unlimited starts with a full burst
                (None, Some(r)) => r as f64,
                (_, Some(r)) => self.tokens.min(r as f64),
                (_, None) => 0.0,
            };
            self.rate = rate;
        }
    }

    /// False while the rate is pinned at zero
    fn is_open(&self) -> bool {
        self.rate != Some(0)
    }

    /// Takes `bytes` tokens and returns how long to wait before sending them
    ///
    /// `None` if the rate is zero.
    fn reserve(&mut self, bytes: u64) -> Option<Duration> {
        self.refill();
        match self.rate {
            None => Some(Duration::ZERO),
            Some(0) => None,
            Some(rate) => {
                self.tokens -= bytes as f64;
                if self.tokens >= 0.0 {
                    Some(Duration::ZERO)
                } else {
                    Some(Duration::from_secs_f64(-self.tokens / rate as f64))
                }
            }
        }
    }
}

/// Measured throughput over roughly one second windows
#[derive(Debug)]
struct RateMeter {
    window_start: Instant,
    window_bytes: u64,
    last_rate: u64,
}

impl RateMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            last_rate: 0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.last_rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }
}

// ============================================================================
// Scheduler state
// ============================================================================

#[derive(Debug)]
struct TransferSlot {
    transfer_type: TransferType,
    priority: TransferPriority,
    allocated: u64,
    bytes_transferred: u64,
    status: TransferStatus,
    bucket: TokenBucket,
}

/// Result of charging bytes to a transfer
#[derive(Debug, PartialEq, Eq)]
enum Reservation {
    /// The transfer was released
    Gone,
    /// A limit dropped to zero; wait for a new allocation
    Closed,
    Wait(Duration),
}

#[derive(Debug)]
struct SchedulerState {
    upload_limit: Option<u64>,
    download_limit: Option<u64>,
    auto_throttling: bool,
    pause_on_metered: bool,
    power_saving: bool,
    windows: Vec<SyncTimeWindow>,
    network_available: bool,
    network_type: NetworkType,
    quality: NetworkQuality,
    paused: bool,
    transfers: HashMap<TransferId, TransferSlot>,
    upload_bucket: TokenBucket,
    download_bucket: TokenBucket,
    upload_meter: RateMeter,
    download_meter: RateMeter,
}

impl SchedulerState {
    fn configured_limit(&self, direction: TransferType) -> Option<u64> {
        match direction {
            TransferType::Upload => self.upload_limit,
            TransferType::Download => self.download_limit,
        }
    }

    /// Effective direction limit; `None` = unlimited, `Some(0)` = wait
    fn effective_limit(&self, direction: TransferType, in_window: bool) -> Option<u64> {
        if self.paused
            || !self.network_available
            || !in_window
            || self.quality == NetworkQuality::Unavailable
            || (self.pause_on_metered && self.network_type.is_metered())
        {
            return Some(0);
        }

        let configured = self.configured_limit(direction)?;
        let mut limit = configured as f64;
        if self.auto_throttling {
            limit *= self.quality.throttling_factor();
        }
        if self.power_saving {
            limit /= 2.0;
        }
        let limit = limit.round() as u64;
        Some(if configured > 0 { limit.max(1) } else { 0 })
    }

    /// Recomputes every allocation, returning the transfers whose status changed
    fn reallocate(&mut self, in_window: bool) -> Vec<TransferStatusChange> {
        let upload_limit = self.effective_limit(TransferType::Upload, in_window);
        let download_limit = self.effective_limit(TransferType::Download, in_window);
        self.upload_bucket.set_rate(upload_limit);
        self.download_bucket.set_rate(download_limit);

        let mut weights: HashMap<TransferType, u64> = HashMap::new();
        for slot in self.transfers.values() {
            *weights.entry(slot.transfer_type).or_default() += slot.priority.weight();
        }

        let paused = self.paused;
        let mut changes = Vec::new();
        for (id, slot) in self.transfers.iter_mut() {
            let limit = match slot.transfer_type {
                TransferType::Upload => upload_limit,
                TransferType::Download => download_limit,
            };
            let total_weight = weights.get(&slot.transfer_type).copied().unwrap_or(1).max(1);
            slot.allocated = match limit {
                None => BandwidthAllocation::UNLIMITED,
                Some(limit) => {
                    (limit as u128 * slot.priority.weight() as u128 / total_weight as u128) as u64
                }
            };
            slot.bucket.set_rate(if slot.allocated == BandwidthAllocation::UNLIMITED {
                None
            } else {
                Some(slot.allocated)
            });

            let status = if paused {
                TransferStatus::Paused
            } else if slot.allocated == 0 {
                TransferStatus::Pending
            } else {
                TransferStatus::Active
            };
            if status != slot.status {
                slot.status = status;
                changes.push(TransferStatusChange {
                    transfer_id: *id,
                    transfer_type: slot.transfer_type,
                    status,
                    bytes_transferred: slot.bytes_transferred,
                });
            }
        }
        changes
    }

    fn usage(&self) -> BandwidthUsage {
        let count = |t: TransferType| {
            self.transfers
                .values()
                .filter(|s| s.transfer_type == t)
                .count()
        };
        BandwidthUsage {
            upload_bytes_per_second: self.upload_meter.last_rate,
            download_bytes_per_second: self.download_meter.last_rate,
            active_uploads: count(TransferType::Upload),
            active_downloads: count(TransferType::Download),
        }
    }

    /// Charges `bytes` to the transfer and its direction
    ///
    /// Neither bucket is charged unless both are open.
    fn reserve_transfer(&mut self, id: TransferId, bytes: u64) -> Reservation {
        let Some(slot) = self.transfers.get(&id) else {
            return Reservation::Gone;
        };
        let direction = slot.transfer_type;
        let slot_open = slot.bucket.is_open();
        let direction_bucket = match direction {
            TransferType::Upload => &mut self.upload_bucket,
            TransferType::Download => &mut self.download_bucket,
        };
        if !(slot_open && direction_bucket.is_open()) {
            return Reservation::Closed;
        }

        let direction_wait = direction_bucket.reserve(bytes).unwrap_or_default();
        let slot_wait = match self.transfers.get_mut(&id) {
            Some(slot) => {
                slot.bytes_transferred += bytes;
                slot.bucket.reserve(bytes).unwrap_or_default()
            }
            None => Duration::ZERO,
        };
        match direction {
            TransferType::Upload => self.upload_meter.record(bytes),
            TransferType::Download => self.download_meter.record(bytes),
        }
        Reservation::Wait(direction_wait.max(slot_wait))
    }

    fn allocation(&self, id: TransferId) -> Option<BandwidthAllocation> {
        self.transfers.get(&id).map(|slot| BandwidthAllocation {
            transfer_id: id,
            transfer_type: slot.transfer_type,
            priority: slot.priority,
            allocated_bytes_per_second: slot.allocated,
        })
    }
}

// ============================================================================
// BandwidthScheduler
// ============================================================================

/// Admits transfers and shares bandwidth among them by priority
pub struct BandwidthScheduler {
    state: Mutex<SchedulerState>,
    changed: Notify,
    events: Arc<EventHub>,
    clock: Clock,
}

impl std::fmt::Debug for BandwidthScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthScheduler")
            .field("state", &self.state)
            .finish()
    }
}

impl BandwidthScheduler {
    pub fn new(config: &BandwidthConfig, events: Arc<EventHub>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                upload_limit: config.upload_limit,
                download_limit: config.download_limit,
                auto_throttling: config.enable_auto_throttling,
                pause_on_metered: config.pause_on_metered_connection,
                power_saving: config.power_saving,
                windows: config.sync_windows.clone(),
                network_available: true,
                network_type: NetworkType::Unknown,
                quality: NetworkQuality::Excellent,
                paused: false,
                transfers: HashMap::new(),
                upload_bucket: TokenBucket::new(config.upload_limit),
                download_bucket: TokenBucket::new(config.download_limit),
                upload_meter: RateMeter::new(),
                download_meter: RateMeter::new(),
            }),
            changed: Notify::new(),
            events,
            clock: Box::new(|| Local::now().naive_local()),
        }
    }

    /// Overrides the wall clock used for sync windows
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to the state, then reallocates and publishes the effects
    fn update<R>(&self, f: impl FnOnce(&mut SchedulerState) -> R) -> R {
        let now = (self.clock)();
        let (result, changes, usage) = {
            let mut state = self.lock();
            let result = f(&mut state);
            let in_window = in_sync_window(&state.windows, now);
            let changes = state.reallocate(in_window);
            (result, changes, state.usage())
        };
        for change in changes {
            self.events.publish_transfer(change);
        }
        self.events.publish_bandwidth(usage);
        self.changed.notify_waiters();
        result
    }

    // ========================================================================
    // Configuration and conditions
    // ========================================================================

    pub fn set_upload_limit(&self, limit: Option<u64>) {
        info!(limit = ?limit, "Upload limit changed");
        self.update(|s| s.upload_limit = limit);
    }

    pub fn set_download_limit(&self, limit: Option<u64>) {
        info!(limit = ?limit, "Download limit changed");
        self.update(|s| s.download_limit = limit);
    }

    pub fn set_power_saving(&self, enabled: bool) {
        self.update(|s| s.power_saving = enabled);
    }

    pub fn set_auto_throttling(&self, enabled: bool) {
        self.update(|s| s.auto_throttling = enabled);
    }

    pub fn set_sync_windows(&self, windows: Vec<SyncTimeWindow>) {
        self.update(|s| s.windows = windows);
    }

    /// Records new network conditions and publishes a status change
    pub fn set_network_conditions(
        &self,
        available: bool,
        network_type: NetworkType,
        quality: NetworkQuality,
    ) {
        debug!(available, ?network_type, ?quality, "Network conditions changed");
        self.update(|s| {
            s.network_available = available;
            s.network_type = network_type;
            s.quality = quality;
        });
        self.events.publish_network(NetworkStatusChange {
            available,
            network_type,
            quality,
        });
    }

    pub fn is_network_available(&self) -> bool {
        self.lock().network_available
    }

    pub fn is_current_time_in_sync_window(&self) -> bool {
        in_sync_window(&self.lock().windows, (self.clock)())
    }

    /// Effective limit for a direction; `None` = unlimited, `Some(0)` = wait
    pub fn effective_limit(&self, direction: TransferType) -> Option<u64> {
        let now = (self.clock)();
        let state = self.lock();
        state.effective_limit(direction, in_sync_window(&state.windows, now))
    }

    /// Re-evaluates time-dependent inputs such as sync windows
    pub fn refresh(&self) {
        self.update(|_| ());
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Admits a transfer and returns its share
    ///
    /// A zero share means the transfer must wait (see
    /// [`BandwidthScheduler::wait_for_allocation`]).
    pub fn allocate_bandwidth(
        &self,
        transfer_id: TransferId,
        transfer_type: TransferType,
        priority: TransferPriority,
    ) -> BandwidthAllocation {
        self.update(|s| {
            s.transfers.insert(
                transfer_id,
                TransferSlot {
                    transfer_type,
                    priority,
                    allocated: 0,
                    bytes_transferred: 0,
                    // Forces the first reallocation to publish a status
                    status: TransferStatus::Completed,
                    bucket: TokenBucket::new(None),
                },
            );
        });
        let allocation = self.allocation(transfer_id).unwrap_or(BandwidthAllocation {
            transfer_id,
            transfer_type,
            priority,
            allocated_bytes_per_second: 0,
        });
        debug!(
            transfer_id = %transfer_id,
            direction = %transfer_type,
            priority = %priority,
            allocated = allocation.allocated_bytes_per_second,
            "Transfer admitted"
        );
        allocation
    }

    /// Current allocation of an admitted transfer
    pub fn allocation(&self, transfer_id: TransferId) -> Option<BandwidthAllocation> {
        self.lock().allocation(transfer_id)
    }

    /// Releases a completed transfer
    pub fn release_bandwidth(&self, transfer_id: TransferId) {
        self.finish_transfer(transfer_id, TransferStatus::Completed);
    }

    /// Releases a transfer with its terminal status and reallocates the rest
    pub fn finish_transfer(&self, transfer_id: TransferId, status: TransferStatus) {
        let removed = self.update(|s| s.transfers.remove(&transfer_id));
        if let Some(slot) = removed {
            debug!(transfer_id = %transfer_id, status = ?status, "Transfer released");
            self.events.publish_transfer(TransferStatusChange {
                transfer_id,
                transfer_type: slot.transfer_type,
                status,
                bytes_transferred: slot.bytes_transferred,
            });
        }
    }

    /// Waits until the transfer has a non-zero share
    ///
    /// Returns [`SyncError::Cancelled`] if `cancel` fires or the transfer was
    /// released while waiting.
    pub async fn wait_for_allocation(
        &self,
        transfer_id: TransferId,
        cancel: &CancellationToken,
    ) -> Result<BandwidthAllocation, SyncError> {
        loop {
            let changed = self.changed.notified();
            match self.allocation(transfer_id) {
                None => return Err(SyncError::Cancelled),
                Some(allocation) if !allocation.must_wait() => return Ok(allocation),
                Some(_) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = changed => {}
                _ = tokio::time::sleep(WINDOW_RECHECK) => self.refresh(),
            }
        }
    }

    /// Paces `bytes` of a transfer through the direction and transfer buckets
    pub async fn consume(
        &self,
        transfer_id: TransferId,
        bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        loop {
            self.wait_for_allocation(transfer_id, cancel).await?;

            let wait = match self.lock().reserve_transfer(transfer_id, bytes) {
                Reservation::Gone => return Err(SyncError::Cancelled),
                Reservation::Closed => None,
                Reservation::Wait(wait) => Some(wait),
            };

            if let Some(wait) = wait {
                if !wait.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Engine-wide overrides
    // ========================================================================

    pub fn pause_all_transfers(&self) {
        info!("Pausing all transfers");
        self.update(|s| s.paused = true);
    }

    pub fn resume_all_transfers(&self) {
        info!("Resuming all transfers");
        self.update(|s| s.paused = false);
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub fn usage(&self) -> BandwidthUsage {
        self.lock().usage()
    }

    pub fn active_transfers(&self, direction: TransferType) -> usize {
        self.lock()
            .transfers
            .values()
            .filter(|s| s.transfer_type == direction)
            .count()
    }
}
