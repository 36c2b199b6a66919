use std::time::Duration;
use std::time::Instant;

/// a crash further than this from the previous one starts a new count
pub const CRASH_RESET_WINDOW: Duration = Duration::from_secs(3600);

/// the serve loop gives up once the count goes above this
pub const MAX_RECENT_CRASHES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    Restart,
    GiveUp { recent_crashes: u32 },
}

/// Rolling crash counter of one serve loop.
#[derive(Debug, Clone)]
pub struct CrashTracker {
    last_crash: Instant,
    recent_crashes: u32,
}

impl CrashTracker {
    /// `started_at` counts as the previous crash for the first real one
    pub fn new(started_at: Instant) -> Self {
        Self {
            last_crash: started_at,
            recent_crashes: 0,
        }
    }

    pub fn record_crash(&mut self, now: Instant) -> CrashVerdict {
        let since_last = now.saturating_duration_since(self.last_crash);
        self.last_crash = now;

        self.recent_crashes = if since_last > CRASH_RESET_WINDOW {
            1
        } else {
            self.recent_crashes + 1
        };

        if self.recent_crashes > MAX_RECENT_CRASHES {
            CrashVerdict::GiveUp {
                recent_crashes: self.recent_crashes,
            }
        } else {
            CrashVerdict::Restart
        }
    }

    pub fn recent_crashes(&self) -> u32 {
        self.recent_crashes
    }
}
