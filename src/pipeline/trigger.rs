//! When the backlog is worth indexing.

use chrono::{DateTime, Duration, Utc};

use crate::constants::{DEFAULT_INDEX_INTERVAL_SECS, DEFAULT_MAX_INDEX_INTERVAL_SECS, DEFAULT_NUM_DOC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerThresholds {
    /// Queued documents needed before a quiet proxy triggers indexing.
    pub num_doc: usize,
    /// Quiet period after the last capture.
    pub interval: Duration,
    /// Longest a queued document may wait regardless of traffic.
    pub max_interval: Duration,
}

impl Default for TriggerThresholds {
    fn default() -> Self {
        Self {
            num_doc: DEFAULT_NUM_DOC,
            interval: Duration::seconds(DEFAULT_INDEX_INTERVAL_SECS),
            max_interval: Duration::seconds(DEFAULT_MAX_INDEX_INTERVAL_SECS),
        }
    }
}

/// Branch taken by [`decide_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTrigger {
    /// Nothing queued.
    Empty,
    /// Quiet period elapsed and enough documents are queued.
    Threshold,
    /// The clock moved back past the last capture with enough queued.
    ClockRewind,
    /// The oldest queued document has waited `max_interval`.
    MaxInterval,
    /// The oldest queued document is dated after `now`.
    OldestInFuture,
    Wait,
}

impl IndexTrigger {
    #[must_use]
    pub fn should_index(self) -> bool {
        !matches!(self, Self::Empty | Self::Wait)
    }
}

/// True when no capture happened within `interval` of `now`.
#[must_use]
pub fn proxy_idle(now: DateTime<Utc>, last_issued: Option<DateTime<Utc>>, interval: Duration) -> bool {
    last_issued.is_none_or(|last| now - last >= interval)
}

#[must_use]
pub fn decide_index(
    now: DateTime<Utc>,
    last_issued: Option<DateTime<Utc>>,
    queued: usize,
    oldest_queued: Option<DateTime<Utc>>,
    thresholds: &TriggerThresholds,
) -> IndexTrigger {
    if queued == 0 {
        return IndexTrigger::Empty;
    }
    let enough = queued >= thresholds.num_doc;
    if enough && proxy_idle(now, last_issued, thresholds.interval) {
        return IndexTrigger::Threshold;
    }
    if enough
        && last_issued.is_some_and(|last| {
            now.checked_add_signed(thresholds.interval)
                .is_some_and(|limit| limit < last)
        })
    {
        return IndexTrigger::ClockRewind;
    }
    if let Some(oldest) = oldest_queued {
        let elapsed = now - oldest;
        if elapsed >= thresholds.max_interval {
            return IndexTrigger::MaxInterval;
        }
        if elapsed < Duration::zero() {
            return IndexTrigger::OldestInFuture;
        }
    }
    IndexTrigger::Wait
}
