//! Device half of the host sync link.
//!
//! A sync session is volatile: staged records and the transport key live
//! only in RAM and are wiped on abort, timeout, or disconnect. Nothing
//! touches the record store until an explicit commit verifies.
pub mod protocol;

use alloc::string::String;
use alloc::vec::Vec;
use shared::batch::BatchHasher;
use shared::record::CredentialRecord;
use zeroize::{Zeroize, Zeroizing};

pub use shared::cdc::FRAME_MAX_SIZE;

/// A session that makes no progress for this long is aborted.
pub const SYNC_STEP_TIMEOUT_MS: u64 = 10_000;
/// Upper bound on records staged in one batch.
pub const MAX_STAGED_RECORDS: usize = 64;

/// Protocol phase of an active sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Handshake done, waiting for the batch declaration.
    Negotiating,
    /// Record frames are flowing.
    Transferring,
    /// Commit accepted; the batch is being applied.
    Committing,
}

/// Volatile state of one negotiated session.
#[derive(Debug)]
pub(crate) struct SyncSession {
    pub(crate) state: SyncState,
    pub(crate) session_id: u32,
    pub(crate) transport_key: Zeroizing<[u8; 32]>,
    pub(crate) transcript: [u8; 32],
    pub(crate) expected_records: u32,
    pub(crate) staged: Vec<CredentialRecord>,
    pub(crate) hasher: BatchHasher,
    pub(crate) last_activity_ms: u64,
}

impl SyncSession {
    fn wipe_sensitive(&mut self) {
        self.transport_key.zeroize();
        // Staged records zeroize their secrets on drop.
        self.staged.clear();
    }
}

/// Sync endpoint state carried across requests.
#[derive(Debug)]
pub struct DeviceSyncContext {
    pub(crate) session: Option<SyncSession>,
    next_session_id: u32,
    pub(crate) device_name: String,
    pub(crate) firmware_version: String,
}

impl DeviceSyncContext {
    pub fn new(device_name: String, firmware_version: String) -> Self {
        Self {
            session: None,
            next_session_id: 1,
            device_name,
            firmware_version,
        }
    }

    pub fn session_active(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn allocate_session_id(&mut self) -> u32 {
        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        if self.next_session_id == 0 {
            self.next_session_id = 1;
        }
        id
    }

    /// Drop the active session and wipe its key and staged plaintext.
    /// The vault itself is untouched.
    pub fn abort(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.wipe_sensitive();
        }
    }

    /// Disconnect handling; sensitive sync state goes first.
    pub fn wipe_sensitive(&mut self) {
        self.abort();
    }

    /// Abort a session that has stalled past the per-step timeout.
    /// Returns whether an abort happened.
    pub fn poll_timeout(&mut self, now_ms: u64) -> bool {
        let stalled = self
            .session
            .as_ref()
            .is_some_and(|session| now_ms.saturating_sub(session.last_activity_ms) >= SYNC_STEP_TIMEOUT_MS);
        if stalled {
            self.abort();
        }
        stalled
    }
}

impl Default for DeviceSyncContext {
    fn default() -> Self {
        Self::new(
            String::from("KeyFob Vault"),
            String::from(env!("CARGO_PKG_VERSION")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_session(last_activity_ms: u64) -> SyncSession {
        SyncSession {
            state: SyncState::Negotiating,
            session_id: 1,
            transport_key: Zeroizing::new([0xAAu8; 32]),
            transcript: [0u8; 32],
            expected_records: 0,
            staged: Vec::new(),
            hasher: BatchHasher::new(),
            last_activity_ms,
        }
    }

    #[test]
    fn abort_wipes_session_state() {
        let mut ctx = DeviceSyncContext::default();
        ctx.session = Some(dummy_session(0));
        assert!(ctx.session_active());

        ctx.abort();

        assert!(!ctx.session_active());
        // A second abort must be harmless.
        ctx.abort();
    }

    #[test]
    fn stalled_session_times_out() {
        let mut ctx = DeviceSyncContext::default();
        ctx.session = Some(dummy_session(1_000));

        assert!(!ctx.poll_timeout(1_000 + SYNC_STEP_TIMEOUT_MS - 1));
        assert!(ctx.session_active());

        assert!(ctx.poll_timeout(1_000 + SYNC_STEP_TIMEOUT_MS));
        assert!(!ctx.session_active());
        assert!(!ctx.poll_timeout(1_000 + SYNC_STEP_TIMEOUT_MS));
    }

    #[test]
    fn session_ids_skip_zero_on_wrap() {
        let mut ctx = DeviceSyncContext::default();
        ctx.next_session_id = u32::MAX;
        assert_eq!(ctx.allocate_session_id(), u32::MAX);
        assert_eq!(ctx.allocate_session_id(), 1);
    }
}
