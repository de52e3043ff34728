//! Unlock attempt tracking and the self-destruct decision.
use core::fmt;

/// Consecutive failures that trigger self-destruct.
pub const MAX_FAILED_ATTEMPTS: u8 = 5;

/// Authentication lifecycle of the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Provisioned but not authenticated. The resting state.
    Locked,
    /// An unlock attempt is in flight; its counter increment is already
    /// durable.
    Authenticating,
    /// Authenticated; the master key is unwrapped.
    Idle,
    /// Terminal. Contents are gone; only recovery provisioning helps.
    Destroyed,
}

/// What a recorded failure means for the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts remain; the vault stays locked.
    Remaining(u8),
    /// The failure budget is exhausted; the caller must wipe.
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardError {
    /// The vault destroyed itself; no further attempts are accepted.
    Destroyed,
    /// An attempt is already in flight.
    AttemptInFlight,
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Destroyed => write!(f, "vault has self-destructed"),
            GuardError::AttemptInFlight => write!(f, "unlock attempt already in flight"),
        }
    }
}

impl core::error::Error for GuardError {}

/// Tracks consecutive failed unlock attempts across power cycles.
///
/// The counter value returned by [`AttemptGuard::begin_attempt`] must be
/// made durable before the PIN comparison result is acted on; a power cut
/// mid-attempt then counts the attempt as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptGuard {
    state: GuardState,
    failed_attempts: u8,
}

impl AttemptGuard {
    pub const fn new() -> Self {
        Self {
            state: GuardState::Locked,
            failed_attempts: 0,
        }
    }

    /// Rebuild the guard from persisted header fields.
    pub const fn from_header(failed_attempts: u8, destroyed: bool) -> Self {
        let state = if destroyed || failed_attempts >= MAX_FAILED_ATTEMPTS {
            GuardState::Destroyed
        } else {
            GuardState::Locked
        };
        Self {
            state,
            failed_attempts,
        }
    }

    pub const fn state(&self) -> GuardState {
        self.state
    }

    pub const fn failed_attempts(&self) -> u8 {
        self.failed_attempts
    }

    pub const fn remaining_attempts(&self) -> u8 {
        MAX_FAILED_ATTEMPTS.saturating_sub(self.failed_attempts)
    }

    pub const fn is_destroyed(&self) -> bool {
        matches!(self.state, GuardState::Destroyed)
    }

    pub const fn is_unlocked(&self) -> bool {
        matches!(self.state, GuardState::Idle)
    }

    /// Start an unlock attempt. Returns the counter value the caller must
    /// persist before evaluating the PIN.
    pub fn begin_attempt(&mut self) -> Result<u8, GuardError> {
        match self.state {
            GuardState::Destroyed => Err(GuardError::Destroyed),
            GuardState::Authenticating => Err(GuardError::AttemptInFlight),
            GuardState::Locked | GuardState::Idle => {
                self.state = GuardState::Authenticating;
                Ok(self.failed_attempts.saturating_add(1))
            }
        }
    }

    /// The in-flight attempt authenticated. Resets the failure budget.
    pub fn record_success(&mut self) {
        self.failed_attempts = 0;
        self.state = GuardState::Idle;
    }

    /// The in-flight attempt failed. The fifth consecutive failure is
    /// terminal.
    pub fn record_failure(&mut self) -> FailureOutcome {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts >= MAX_FAILED_ATTEMPTS {
            self.state = GuardState::Destroyed;
            FailureOutcome::Destroy
        } else {
            self.state = GuardState::Locked;
            FailureOutcome::Remaining(self.remaining_attempts())
        }
    }

    /// Drop back to the locked resting state without touching the counter.
    pub fn lock(&mut self) {
        if !self.is_destroyed() {
            self.state = GuardState::Locked;
        }
    }
}

impl Default for AttemptGuard {
    fn default() -> Self {
        Self::new()
    }
}
