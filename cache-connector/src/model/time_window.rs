use crate::error::ModelError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Unix timestamp of the NEM nemesis block (2015-03-29T00:06:25Z).
pub const NEM_EPOCH_UNIX: i64 = 1_427_587_585;

/// A deadline may never be further than this from the transaction timestamp.
pub const MAX_DEADLINE_HOURS: i64 = 23;

/// Supported deadline presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirationType {
    OneHour = 1,
    #[default]
    TwoHour = 2,
    SixHour = 6,
    TwelveHour = 12,
}

impl ExpirationType {
    pub fn hours(self) -> i64 {
        self as i64
    }
}

/// Transaction timestamp and deadline, both in seconds since the NEM epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub time_stamp: u32,
    pub deadline: u32,
}

impl TimeWindow {
    /// Creates a window starting now and ending after the default two hours.
    pub fn with_deadline() -> Self {
        Self::with_expiration(Utc::now(), ExpirationType::default())
    }

    pub fn with_expiration(now: DateTime<Utc>, expiration: ExpirationType) -> Self {
        let time_stamp = to_nem_seconds(now);
        let deadline = to_nem_seconds(now + Duration::hours(expiration.hours()));
        Self {
            time_stamp,
            deadline,
        }
    }

    /// Creates a window with an arbitrary deadline, rejecting anything past 23 hours.
    pub fn with_deadline_after(now: DateTime<Utc>, after: Duration) -> Result<Self, ModelError> {
        if after > Duration::hours(MAX_DEADLINE_HOURS) {
            return Err(ModelError::DeadlineTooFar {
                max_hours: MAX_DEADLINE_HOURS,
            });
        }
        Ok(Self {
            time_stamp: to_nem_seconds(now),
            deadline: to_nem_seconds(now + after),
        })
    }

    pub fn time_stamp_utc(&self) -> Option<DateTime<Utc>> {
        from_nem_seconds(self.time_stamp)
    }

    pub fn deadline_utc(&self) -> Option<DateTime<Utc>> {
        from_nem_seconds(self.deadline)
    }
}

pub fn to_nem_seconds(at: DateTime<Utc>) -> u32 {
    (at.timestamp() - NEM_EPOCH_UNIX).clamp(0, u32::MAX as i64) as u32
}

pub fn from_nem_seconds(seconds: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(NEM_EPOCH_UNIX + seconds as i64, 0)
}
