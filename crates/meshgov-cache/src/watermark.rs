//! Watermark: how far a cache has consumed the store's change stream.
//!
//! The watermark pairs the largest modify timestamp ever merged with the
//! wall-clock time of the last successful pull. Both only move forward
//! until an explicit [`Watermark::reset`].

use chrono::{DateTime, TimeDelta, Utc};

/// Progress marker of one resource cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    last_mtime: DateTime<Utc>,
    last_fetch_time: DateTime<Utc>,
}

impl Watermark {
    /// A watermark at the beginning of time.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            last_mtime: DateTime::UNIX_EPOCH,
            last_fetch_time: DateTime::UNIX_EPOCH,
        }
    }

    /// Largest modify timestamp merged so far.
    #[inline]
    #[must_use]
    pub fn last_mtime(&self) -> DateTime<Utc> {
        self.last_mtime
    }

    /// Wall-clock time of the last successful pull.
    #[inline]
    #[must_use]
    pub fn last_fetch_time(&self) -> DateTime<Utc> {
        self.last_fetch_time
    }

    /// Whether nothing has been merged yet.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.last_mtime == DateTime::UNIX_EPOCH
    }

    /// Lower bound for the next store pull.
    ///
    /// `skew` is negative: the bound reaches back past `last_mtime` so that
    /// records committed with a lagging timestamp are fetched again. The
    /// result never precedes the Unix epoch.
    #[must_use]
    pub fn since(&self, skew: TimeDelta) -> DateTime<Utc> {
        if self.is_zero() {
            return DateTime::UNIX_EPOCH;
        }
        self.last_mtime
            .checked_add_signed(skew)
            .unwrap_or(DateTime::UNIX_EPOCH)
            .max(DateTime::UNIX_EPOCH)
    }

    /// Move forward after a fully merged batch.
    ///
    /// `batch_max` is the largest modify timestamp in the batch (`None` for
    /// an empty batch). Neither field ever moves backwards.
    pub fn advance(&mut self, batch_max: Option<DateTime<Utc>>, fetched_at: DateTime<Utc>) {
        if let Some(mtime) = batch_max {
            if mtime > self.last_mtime {
                self.last_mtime = mtime;
            }
        }
        if fetched_at > self.last_fetch_time {
            self.last_fetch_time = fetched_at;
        }
    }

    /// Return to zero; the next pull becomes a first load.
    pub fn reset(&mut self) {
        *self = Self::zero();
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}
