//! Owner-absence detection for guest sessions.
//!
//! ```text
//! OwnerPresent ──owner gone──▶ OwnerAbsentGrace ──grace expired──▶ SessionEnded
//!      ▲                              │
//!      └──────owner returned──────────┘
//! ```
//!
//! Driven by [`OwnerLivenessMonitor::observe`] and [`OwnerLivenessMonitor::tick`]
//! with caller-supplied timestamps; no background timers.

/// Default grace window before a guest session ends.
pub const OWNER_GRACE_MS: u64 = 60_000;
/// Default delay between the end notice and the redirect.
pub const REDIRECT_DELAY_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    OwnerPresent,
    OwnerAbsentGrace,
    /// Terminal.
    SessionEnded,
}

/// Transitions surfaced to the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Owner disappeared; the session ends at `deadline` unless they return.
    GraceStarted { deadline: u64 },
    OwnerReturned,
    /// Show the non-dismissable end notice.
    SessionEnded,
    /// Navigate away from the board.
    Redirect,
}

/// A one-shot deadline that can be cancelled before it fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraceTimer {
    deadline: Option<u64>,
}

impl GraceTimer {
    pub fn arm(&mut self, deadline: u64) {
        self.deadline = Some(deadline);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Fires at most once: disarms itself when `now` reaches the deadline.
    pub fn fire(&mut self, now_ms: u64) -> bool {
        match self.deadline {
            Some(deadline) if now_ms >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

pub struct OwnerLivenessMonitor {
    state: LivenessState,
    grace_ms: u64,
    redirect_delay_ms: u64,
    grace: GraceTimer,
    redirect: GraceTimer,
}

impl OwnerLivenessMonitor {
    pub fn new() -> Self {
        Self::with_timing(OWNER_GRACE_MS, REDIRECT_DELAY_MS)
    }

    pub fn with_timing(grace_ms: u64, redirect_delay_ms: u64) -> Self {
        Self {
            state: LivenessState::OwnerPresent,
            grace_ms,
            redirect_delay_ms,
            grace: GraceTimer::default(),
            redirect: GraceTimer::default(),
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == LivenessState::SessionEnded
    }

    /// Feed the current owner presence.
    pub fn observe(&mut self, owner_present: bool, now_ms: u64) -> Option<LivenessEvent> {
        match (self.state, owner_present) {
            (LivenessState::OwnerPresent, false) => {
                let deadline = now_ms + self.grace_ms;
                self.grace.arm(deadline);
                self.state = LivenessState::OwnerAbsentGrace;
                log::info!("Owner absent, session ends at {} unless they return", deadline);
                Some(LivenessEvent::GraceStarted { deadline })
            }
            (LivenessState::OwnerAbsentGrace, true) => {
                self.grace.cancel();
                self.state = LivenessState::OwnerPresent;
                log::info!("Owner returned");
                Some(LivenessEvent::OwnerReturned)
            }
            _ => None,
        }
    }

    /// Advance timers to `now`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<LivenessEvent> {
        let mut events = Vec::new();
        if self.state == LivenessState::OwnerAbsentGrace && self.grace.fire(now_ms) {
            self.state = LivenessState::SessionEnded;
            self.redirect.arm(now_ms + self.redirect_delay_ms);
            log::info!("Owner did not return, session ended");
            events.push(LivenessEvent::SessionEnded);
        }
        if self.redirect.fire(now_ms) {
            events.push(LivenessEvent::Redirect);
        }
        events
    }

    /// Drop every pending timer (session teardown).
    pub fn cancel(&mut self) {
        self.grace.cancel();
        self.redirect.cancel();
    }
}

impl Default for OwnerLivenessMonitor {
    fn default() -> Self {
        Self::new()
    }
}
