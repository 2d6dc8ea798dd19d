//! Sliding-window rate limiter.
//!
//! Enforces per-second and per-minute admission caps by keeping an ordered
//! window of admission timestamps. One limiter belongs to exactly one engine
//! instance; two engines targeting the same upstream API do not share a
//! budget and must be configured conservatively.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

const SECOND_WINDOW: Duration = Duration::from_secs(1);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Small slack added to computed waits so a re-check lands after the oldest
/// offending admission has actually left its window.
const WAIT_BUFFER: Duration = Duration::from_millis(10);

/// Sliding-window admission control over trailing 1 s and 60 s windows.
///
/// [`acquire`](RateLimiter::acquire) suspends the caller until one more
/// admission would not violate either cap. There is no fairness ordering
/// among simultaneously waiting callers.
#[derive(Debug)]
pub struct RateLimiter {
    per_second: usize,
    per_minute: usize,
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter with the given per-second and per-minute caps.
    pub fn new(per_second: usize, per_minute: usize) -> Self {
        Self {
            per_second,
            per_minute,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// Suspend until an admission is available, then record it.
    ///
    /// Capacity can free earlier or later than predicted under contention,
    /// so this loops: compute the minimal wait until the oldest offending
    /// timestamp expires, sleep, re-check.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admissions = self.admissions.lock().await;
                let now = Instant::now();
                Self::prune(&mut admissions, now);

                match self.next_free_in(&admissions, now) {
                    None => {
                        admissions.push_back(now);
                        return;
                    }
                    Some(wait) => wait + WAIT_BUFFER,
                }
            };

            tracing::trace!("rate limiter saturated, waiting {:?}", wait);
            sleep(wait).await;
        }
    }

    /// Admissions recorded within the trailing 60 second window.
    pub async fn requests_per_minute(&self) -> usize {
        let mut admissions = self.admissions.lock().await;
        Self::prune(&mut admissions, Instant::now());
        admissions.len()
    }

    /// Drop timestamps older than the minute window.
    fn prune(admissions: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = admissions.front() {
            if now.duration_since(*oldest) >= MINUTE_WINDOW {
                admissions.pop_front();
            } else {
                break;
            }
        }
    }

    /// `None` if an admission fits right now, otherwise the minimal wait
    /// until the oldest offending admission leaves its window.
    fn next_free_in(&self, admissions: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        let mut wait: Option<Duration> = None;

        let in_second = admissions
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) < SECOND_WINDOW)
            .count();
        if in_second >= self.per_second {
            // Oldest admission still inside the 1s window blocks us.
            let oldest = admissions[admissions.len() - in_second];
            wait = Some(SECOND_WINDOW - now.duration_since(oldest));
        }

        if admissions.len() >= self.per_minute {
            let oldest = admissions[admissions.len() - self.per_minute];
            let minute_wait = MINUTE_WINDOW - now.duration_since(oldest);
            wait = Some(wait.map_or(minute_wait, |w| w.max(minute_wait)));
        }

        wait
    }
}
