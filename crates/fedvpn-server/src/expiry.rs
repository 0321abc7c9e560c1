//! Session-expiry arithmetic.
//!
//! The portal reports when the authorization started and when the produced
//! configuration stops working. The derived instants drive the host's renew
//! button, countdown, and notifications; all values are absolute wall-clock
//! times so hosts never have to watch for system-time jumps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Show the renew button no earlier than this after authorization.
const RENEW_DELAY_MINS: i64 = 30;
/// Countdown (and earliest renew) window before the session ends.
const COUNTDOWN_HOURS: i64 = 24;
/// Notification offsets before the session ends, in minutes.
const NOTIFICATION_OFFSETS_MINS: [i64; 4] = [240, 120, 60, 30];

/// A session's validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiry {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Expiry {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    /// When the renew button appears: half an hour into the session, but
    /// never before the countdown window opens for short sessions.
    pub fn renew_button_time(&self) -> DateTime<Utc> {
        let after_start = self.start_time + Duration::minutes(RENEW_DELAY_MINS);
        let before_end = self.end_time - Duration::hours(COUNTDOWN_HOURS);
        after_start.max(before_end)
    }

    /// When the host starts rendering a countdown.
    pub fn countdown_time(&self) -> DateTime<Utc> {
        self.end_time - Duration::hours(COUNTDOWN_HOURS)
    }

    /// Instants the host should notify the user at, ascending.
    pub fn notification_times(&self) -> Vec<DateTime<Utc>> {
        let mut times: Vec<DateTime<Utc>> = NOTIFICATION_OFFSETS_MINS
            .iter()
            .map(|mins| self.end_time - Duration::minutes(*mins))
            .collect();
        times.sort();
        times
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }
}
