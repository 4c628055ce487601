//! Consecutive-error back-off gate for unreliable collaborators.
//!
//! Each subsystem that talks to the remote message service owns one policy.
//! Transient failures increment the counter; once the threshold is reached
//! the subsystem is unhealthy for a cooldown window and should stop issuing
//! calls. Any success resets the counter.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Default number of consecutive errors before the policy trips.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;

#[derive(Debug, Default)]
struct PolicyState {
    error_count: u32,
    tripped_at: Option<Instant>,
}

/// Consecutive-error counter with a cooldown window.
#[derive(Debug)]
pub struct StopPolicy {
    name: String,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<PolicyState>,
}

impl StopPolicy {
    /// Creates a policy named for its owning subsystem.
    ///
    /// A `threshold` of zero disables tripping; the policy is then always
    /// healthy.
    #[must_use]
    pub fn new(name: &str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.to_string(),
            threshold,
            cooldown,
            state: Mutex::new(PolicyState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the owning subsystem may issue calls right now.
    ///
    /// A tripped policy heals itself once the cooldown window has elapsed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let mut state = self.lock();
        match state.tripped_at {
            None => true,
            Some(at) if at.elapsed() >= self.cooldown => {
                info!(policy = %self.name, "cooldown elapsed, resuming");
                *state = PolicyState::default();
                true
            },
            Some(_) => false,
        }
    }

    /// Records one more consecutive error.
    pub fn record_error(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut state = self.lock();
        state.error_count += 1;
        if state.error_count >= self.threshold && state.tripped_at.is_none() {
            warn!(
                policy = %self.name,
                errors = state.error_count,
                cooldown_secs = self.cooldown.as_secs(),
                "error threshold reached, backing off"
            );
            state.tripped_at = Some(Instant::now());
        }
    }

    /// Resets the counter after a successful call.
    pub fn reset(&self) {
        *self.lock() = PolicyState::default();
    }

    /// Current consecutive-error count.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.lock().error_count
    }
}
