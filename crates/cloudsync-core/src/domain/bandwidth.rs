//! Bandwidth domain types
//!
//! Transfer priorities, network conditions, sync time windows and the
//! allocation record the scheduler hands to each admitted transfer.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::TransferId;

// ============================================================================
// Transfer classification
// ============================================================================

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Upload,
    Download,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferType::Upload => write!(f, "upload"),
            TransferType::Download => write!(f, "download"),
        }
    }
}

/// Priority of a transfer; the weight sets its share of the direction's limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl TransferPriority {
    pub fn weight(&self) -> u64 {
        match self {
            TransferPriority::High => 3,
            TransferPriority::Normal => 2,
            TransferPriority::Low => 1,
        }
    }
}

impl fmt::Display for TransferPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPriority::High => write!(f, "high"),
            TransferPriority::Normal => write!(f, "normal"),
            TransferPriority::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

// ============================================================================
// Network conditions
// ============================================================================

/// Measured link quality
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    #[default]
    Excellent,
    Good,
    Fair,
    Poor,
    Unavailable,
}

impl NetworkQuality {
    /// Multiplier applied to the configured limit
    pub fn throttling_factor(&self) -> f64 {
        match self {
            NetworkQuality::Excellent => 1.0,
            NetworkQuality::Good => 0.8,
            NetworkQuality::Fair => 0.6,
            NetworkQuality::Poor => 0.3,
            NetworkQuality::Unavailable => 0.0,
        }
    }
}

/// Kind of link the host is on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Wifi,
    Ethernet,
    Cellular,
    Other,
    #[default]
    Unknown,
}

impl NetworkType {
    pub fn is_metered(&self) -> bool {
        matches!(self, NetworkType::Cellular)
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// A transfer's granted byte-rate share
///
/// `allocated_bytes_per_second == u64::MAX` means unlimited; `0` means the
/// transfer must wait (outside a sync window, paused, or metered link).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthAllocation {
    pub transfer_id: TransferId,
    pub transfer_type: TransferType,
    pub priority: TransferPriority,
    pub allocated_bytes_per_second: u64,
}

impl BandwidthAllocation {
    pub const UNLIMITED: u64 = u64::MAX;

    pub fn is_unlimited(&self) -> bool {
        self.allocated_bytes_per_second == Self::UNLIMITED
    }

    pub fn must_wait(&self) -> bool {
        self.allocated_bytes_per_second == 0
    }
}

// ============================================================================
// Sync time windows
// ============================================================================

/// Day of the week used in sync window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Mon,
        DayOfWeek::Tue,
        DayOfWeek::Wed,
        DayOfWeek::Thu,
        DayOfWeek::Fri,
        DayOfWeek::Sat,
        DayOfWeek::Sun,
    ];
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => DayOfWeek::Mon,
            Weekday::Tue => DayOfWeek::Tue,
            Weekday::Wed => DayOfWeek::Wed,
            Weekday::Thu => DayOfWeek::Thu,
            Weekday::Fri => DayOfWeek::Fri,
            Weekday::Sat => DayOfWeek::Sat,
            Weekday::Sun => DayOfWeek::Sun,
        }
    }
}

/// Wall-clock time written as "HH:MM"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, DomainError> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or_else(|| DomainError::ValidationFailed(format!("Invalid time {hour}:{minute}")))
    }

    fn minutes(&self) -> u32 {
        self.0.hour() * 60 + self.0.minute()
    }
}

impl FromStr for TimeOfDay {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .map(Self)
            .map_err(|_| DomainError::ValidationFailed(format!("Expected HH:MM, got '{s}'")))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

/// A period during which transfers may run
///
/// A window whose `end` is earlier than its `start` wraps past midnight.
/// An empty `days` list means every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTimeWindow {
    pub name: String,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    #[serde(default)]
    pub days: Vec<DayOfWeek>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl SyncTimeWindow {
    /// Returns true if `at` falls inside this window
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        if !self.enabled {
            return false;
        }

        let day = DayOfWeek::from(at.weekday());
        if !self.days.is_empty() && !self.days.contains(&day) {
            return false;
        }

        let now = at.hour() * 60 + at.minute();
        let start = self.start.minutes();
        let end = self.end.minutes();

        if start <= end {
            now >= start && now < end
        } else {
            now >= start || now < end
        }
    }
}

/// Returns true if `at` falls in any enabled window, or if no windows are configured
pub fn in_sync_window(windows: &[SyncTimeWindow], at: NaiveDateTime) -> bool {
    if windows.is_empty() {
        return true;
    }
    windows.iter().any(|w| w.contains(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        // 2024-05-06 is a Monday
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn window(start: &str, end: &str, days: Vec<DayOfWeek>) -> SyncTimeWindow {
        SyncTimeWindow {
            name: "test".into(),
            start: start.parse().unwrap(),
            end: end.parse().unwrap(),
            days,
            enabled: true,
        }
    }

    #[test]
    fn test_priority_weights() {
        assert_eq!(TransferPriority::High.weight(), 3);
        assert_eq!(TransferPriority::Normal.weight(), 2);
        assert_eq!(TransferPriority::Low.weight(), 1);
    }

    #[test]
    fn test_quality_factors() {
        assert_eq!(NetworkQuality::Excellent.throttling_factor(), 1.0);
        assert_eq!(NetworkQuality::Poor.throttling_factor(), 0.3);
        assert_eq!(NetworkQuality::Unavailable.throttling_factor(), 0.0);
        assert!(NetworkType::Cellular.is_metered());
        assert!(!NetworkType::Wifi.is_metered());
    }

    #[test]
    fn test_window_same_day() {
        let w = window("09:00", "17:00", vec![]);
        assert!(w.contains(at(6, 9, 0)));
        assert!(w.contains(at(6, 16, 59)));
        assert!(!w.contains(at(6, 17, 0)));
        assert!(!w.contains(at(6, 8, 59)));
    }

    #[test]
    fn test_window_wraps_midnight() {
        let w = window("22:00", "06:00", vec![]);
        assert!(w.contains(at(6, 23, 30)));
        assert!(w.contains(at(7, 5, 0)));
        assert!(!w.contains(at(7, 12, 0)));
    }

    #[test]
    fn test_window_day_filter() {
        let w = window("00:00", "23:59", vec![DayOfWeek::Sat, DayOfWeek::Sun]);
        assert!(!w.contains(at(6, 12, 0)));
        assert!(w.contains(at(11, 12, 0)));
    }

    #[test]
    fn test_empty_window_list_means_always() {
        assert!(in_sync_window(&[], at(6, 3, 0)));
        let mut disabled = window("09:00", "10:00", vec![]);
        disabled.enabled = false;
        assert!(!in_sync_window(&[disabled], at(6, 9, 30)));
    }

    #[test]
    fn test_time_of_day_parse() {
        assert!("25:00".parse::<TimeOfDay>().is_err());
        assert_eq!("07:05".parse::<TimeOfDay>().unwrap().to_string(), "07:05");
    }
}
