//! Volatile working set for an unlocked vault.
//!
//! Holds the unwrapped master key and decrypted record metadata for the
//! lifetime of one authenticated session. Closing the session, timing
//! out, or a USB disconnect zeroizes everything before any other
//! teardown runs.
use alloc::string::String;
use alloc::vec::Vec;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::record::{self, RecordError};
use crate::store::RecordStore;
use shared::record::CredentialRecord;

/// Idle sessions are closed after five minutes.
pub const SESSION_TIMEOUT_MS: u64 = 5 * 60 * 1_000;

/// Decrypted per-record metadata cached while the session is open.
/// The secret itself is never cached; reveals decrypt on demand.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
pub struct RecordMeta {
    #[zeroize(skip)]
    pub id: Uuid,
    pub service_name: String,
    pub username: String,
    pub icon: String,
    pub last_accessed: u64,
    pub version: u32,
}

/// The in-RAM state of an authenticated session.
#[derive(Debug)]
pub struct VolatileSession {
    master_key: Zeroizing<[u8; 32]>,
    metadata: Vec<RecordMeta>,
    last_activity_ms: u64,
    closed: bool,
}

impl VolatileSession {
    /// Open a session: decrypt the metadata of every stored record.
    ///
    /// Records whose envelope fails authentication are skipped here; a
    /// targeted `get` on such an id still reports the corruption.
    pub fn open(master_key: Zeroizing<[u8; 32]>, store: &RecordStore, now_ms: u64) -> Self {
        let mut metadata = Vec::with_capacity(store.len());
        for (id, stored) in store.iter() {
            match record::open(&master_key, id, &stored.envelope) {
                Ok(record) => metadata.push(RecordMeta {
                    id: *id,
                    service_name: record.service_name.clone(),
                    username: record.username.clone(),
                    icon: record.icon.clone(),
                    last_accessed: stored.last_accessed,
                    version: stored.version,
                }),
                Err(RecordError::Authentication) | Err(RecordError::Codec(_)) => {}
            }
        }
        metadata.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

        Self {
            master_key,
            metadata,
            last_activity_ms: now_ms,
            closed: false,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub(crate) fn master_key(&self) -> &Zeroizing<[u8; 32]> {
        &self.master_key
    }

    /// Listing for the device UI: most recently used first.
    pub fn list(&self) -> &[RecordMeta] {
        &self.metadata
    }

    /// Record activity so the idle timeout starts over.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) >= SESSION_TIMEOUT_MS
    }

    /// Refresh one record's cached metadata after an access or update.
    pub fn note_access(&mut self, id: &Uuid, at_ms: u64) {
        if let Some(meta) = self.metadata.iter_mut().find(|meta| meta.id == *id) {
            meta.last_accessed = at_ms;
        }
        self.metadata
            .sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
    }

    /// Replace the cached metadata after a mutation batch.
    pub(crate) fn refresh(&mut self, store: &RecordStore) {
        let key = self.master_key.clone();
        for meta in &mut self.metadata {
            meta.zeroize();
        }
        self.metadata.clear();

        for (id, stored) in store.iter() {
            if let Ok(record) = record::open(&key, id, &stored.envelope) {
                self.metadata.push(RecordMeta {
                    id: *id,
                    service_name: record.service_name.clone(),
                    username: record.username.clone(),
                    icon: record.icon.clone(),
                    last_accessed: stored.last_accessed,
                    version: stored.version,
                });
            }
        }
        self.metadata
            .sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
    }

    /// Decrypt one full record. The caller gets an owned copy whose
    /// secret zeroizes on drop.
    pub fn open_record(
        &self,
        store: &RecordStore,
        id: &Uuid,
    ) -> Option<Result<CredentialRecord, RecordError>> {
        let stored = store.get(id)?;
        Some(record::open(&self.master_key, id, &stored.envelope))
    }

    /// Zeroize the key and every cached field. Idempotent.
    pub fn close(&mut self) {
        self.master_key.zeroize();
        for meta in &mut self.metadata {
            meta.zeroize();
        }
        self.metadata.clear();
        self.closed = true;
    }

    #[cfg(test)]
    pub(crate) fn test_metadata_is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn test_key_is_zero(&self) -> bool {
        self.master_key.iter().all(|byte| *byte == 0)
    }
}

impl Drop for VolatileSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::seal;
    use crate::store::StoreOp;
    use futures::executor::block_on;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;
    use sequential_storage::{
        cache::NoCache,
        mock_flash::{MockFlashBase, WriteCountCheck},
    };
    use shared::record::SecretString;

    type Flash = MockFlashBase<6, 4, 1024>;

    fn store_with_records(key: &[u8; 32], count: u128) -> RecordStore {
        block_on(async {
            let mut flash = Flash::new(WriteCountCheck::Twice, None, false);
            let mut rng = ChaCha20Rng::from_seed([8u8; 32]);
            let mut store = RecordStore::new();
            let ops: Vec<StoreOp> = (1..=count)
                .map(|index| {
                    let id = Uuid::from_u128(index);
                    let record = CredentialRecord {
                        id,
                        service_name: alloc::format!("service-{index}"),
                        username: "user".into(),
                        secret: SecretString::from("pw"),
                        icon: "key".into(),
                        last_accessed: index as u64,
                        version: 1,
                    };
                    StoreOp::Put {
                        id,
                        version: 1,
                        last_accessed: index as u64,
                        envelope: seal(key, &mut rng, &record).expect("sealed"),
                    }
                })
                .collect();
            store
                .append(&mut flash, 0..8192, &mut NoCache::new(), ops)
                .await
                .unwrap();
            store
        })
    }

    #[test]
    fn listing_orders_by_recency() {
        let key = [0x77u8; 32];
        let store = store_with_records(&key, 3);
        let session = VolatileSession::open(Zeroizing::new(key), &store, 0);

        let names: Vec<&str> = session
            .list()
            .iter()
            .map(|meta| meta.service_name.as_str())
            .collect();
        assert_eq!(names, ["service-3", "service-2", "service-1"]);
    }

    #[test]
    fn close_zeroizes_key_and_metadata() {
        let key = [0x77u8; 32];
        let store = store_with_records(&key, 2);
        let mut session = VolatileSession::open(Zeroizing::new(key), &store, 0);
        assert!(!session.test_metadata_is_empty());

        session.close();

        assert!(session.test_metadata_is_empty());
        assert!(session.test_key_is_zero());
        assert!(!session.is_open());
        // A second close must be harmless.
        session.close();
    }

    #[test]
    fn session_times_out_after_idle_window() {
        let key = [0x77u8; 32];
        let store = store_with_records(&key, 1);
        let mut session = VolatileSession::open(Zeroizing::new(key), &store, 1_000);

        assert!(!session.expired(1_000 + SESSION_TIMEOUT_MS - 1));
        assert!(session.expired(1_000 + SESSION_TIMEOUT_MS));

        session.touch(1_000 + SESSION_TIMEOUT_MS);
        assert!(!session.expired(1_000 + SESSION_TIMEOUT_MS + 1));
    }

    #[test]
    fn note_access_reorders_listing() {
        let key = [0x77u8; 32];
        let store = store_with_records(&key, 3);
        let mut session = VolatileSession::open(Zeroizing::new(key), &store, 0);

        session.note_access(&Uuid::from_u128(1), 999);

        assert_eq!(session.list()[0].service_name, "service-1");
    }
}
