//! Per-feed refresh policy.
//!
//! A [`Schedule`] combines the operator refresh interval with the hints the
//! feed itself declares (`ttl`, `skipHours`, `skipDays`). It is a plain value
//! owned by one poller; all methods take the current time explicitly.

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc, Weekday};
use std::time::Duration;

use super::document::FeedDocument;

const HOUR_SECS: i64 = 3600;

/// Why a fetch is not allowed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// The refresh interval has not elapsed since the last attempt.
    Interval { remaining: Duration },
    /// The current UTC hour or weekday is listed in the feed's blackout window.
    Blackout { until: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    refresh: Duration,
    ttl: Option<Duration>,
    skip_hours: Vec<u32>,
    skip_days: Vec<Weekday>,
}

impl Schedule {
    pub fn new(refresh: Duration) -> Self {
        Self {
            refresh,
            ttl: None,
            skip_hours: Vec::new(),
            skip_days: Vec::new(),
        }
    }

    /// Effective interval: the feed's TTL may lengthen it, never shorten it.
    pub fn interval(&self) -> Duration {
        match self.ttl {
            Some(ttl) => self.refresh.max(ttl),
            None => self.refresh,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Replaces the feed-declared hints with those of a freshly parsed document.
    ///
    /// Only RSS-family documents carry hints, and only the first channel's
    /// are honoured. Atom documents clear any hints left from an earlier
    /// RSS incarnation of the same URL.
    pub fn update_from(&mut self, doc: &FeedDocument) {
        let channel = doc
            .channels
            .first()
            .filter(|_| doc.format.is_rss_family());

        match channel {
            Some(channel) => {
                self.ttl = channel
                    .ttl_minutes
                    .filter(|m| *m > 0)
                    .map(|m| Duration::from_secs(u64::from(m) * 60));
                self.skip_hours = channel.skip_hours.clone();
                self.skip_days = channel.skip_days.clone();
            }
            None => {
                self.ttl = None;
                self.skip_hours.clear();
                self.skip_days.clear();
            }
        }
    }

    /// Returns the reason a fetch at `now` must wait, or `None` when it may proceed.
    ///
    /// `last` is the last fetch attempt; `None` means never fetched.
    pub fn deferral(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Deferral> {
        if let Some(last) = last {
            // A timestamp in the future (clock change) counts as just fetched
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            let interval = self.interval();
            if elapsed < interval {
                return Some(Deferral::Interval {
                    remaining: interval - elapsed,
                });
            }
        }

        if self.in_blackout(now) {
            return Some(Deferral::Blackout {
                until: next_hour(now),
            });
        }

        None
    }

    /// How long to sleep before the fetch gate should be evaluated again.
    pub fn delay(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match self.deferral(last, now) {
            None => Duration::ZERO,
            Some(Deferral::Interval { remaining }) => remaining,
            Some(Deferral::Blackout { until }) => (until - now).to_std().unwrap_or(Duration::ZERO),
        }
    }

    fn in_blackout(&self, now: DateTime<Utc>) -> bool {
        self.skip_hours.contains(&now.hour()) || self.skip_days.contains(&now.weekday())
    }
}

fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = (now.timestamp().div_euclid(HOUR_SECS) + 1) * HOUR_SECS;
    DateTime::from_timestamp(next, 0).unwrap_or(now + TimeDelta::hours(1))
}
