//! Vault orchestration: ties the persisted header, the attempt guard,
//! the record store, and the volatile session together.
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::ops::Range;
use embedded_storage_async::nor_flash::NorFlash;
use rand_core::{CryptoRng, RngCore};
use sequential_storage::cache::CacheImpl;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::guard::{AttemptGuard, FailureOutcome, GuardError};
use crate::header::{HeaderError, HeaderStore, VaultHeader};
use crate::hid::KeystrokeSink;
use crate::keys::{KeyError, KeyMaterial};
use crate::record::RecordError;
use crate::recovery::{self, RecoveryError, RecoveryPhrase, RestoreOutcome};
use crate::session::{RecordMeta, VolatileSession};
use crate::store::{RecordStore, StoreError, StoreOp};
use crate::{record, store};
use shared::record::CredentialRecord;

/// Where the vault lives on flash: one header range and two record
/// banks that alternate at consolidation time.
#[derive(Debug, Clone)]
pub struct FlashLayout {
    pub header: Range<u32>,
    pub banks: [Range<u32>; 2],
}

impl FlashLayout {
    fn bank(&self, index: u8) -> Range<u32> {
        self.banks[usize::from(index & 1)].clone()
    }

    fn other_bank(&self, index: u8) -> Range<u32> {
        self.banks[usize::from((index ^ 1) & 1)].clone()
    }
}

/// Errors surfaced by vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError<SE>
where
    SE: core::fmt::Debug,
{
    #[error("authentication failed ({remaining} attempts remaining)")]
    AuthenticationFailed { remaining: u8 },
    #[error("vault is locked")]
    VaultLocked,
    #[error("vault self-destruct triggered")]
    SelfDestructTriggered,
    #[error("vault is not provisioned")]
    NotProvisioned,
    #[error("vault is already provisioned")]
    AlreadyProvisioned,
    #[error("record failed authentication")]
    RecordCorrupt,
    #[error("record not found")]
    RecordNotFound,
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),
    #[error("header error: {0}")]
    Header(HeaderError<SE>),
    #[error("store error: {0}")]
    Store(StoreError<SE>),
    #[error("keystroke emission failed: {0}")]
    Emit(String),
}

impl<SE> From<HeaderError<SE>> for VaultError<SE>
where
    SE: core::fmt::Debug,
{
    fn from(value: HeaderError<SE>) -> Self {
        Self::Header(value)
    }
}

impl<SE> From<StoreError<SE>> for VaultError<SE>
where
    SE: core::fmt::Debug,
{
    fn from(value: StoreError<SE>) -> Self {
        Self::Store(value)
    }
}

impl<SE> From<GuardError> for VaultError<SE>
where
    SE: core::fmt::Debug,
{
    fn from(value: GuardError) -> Self {
        match value {
            GuardError::Destroyed => Self::SelfDestructTriggered,
            GuardError::AttemptInFlight => Self::VaultLocked,
        }
    }
}

/// The device-resident vault.
#[derive(Debug)]
pub struct Vault {
    layout: FlashLayout,
    header: Option<VaultHeader>,
    header_store: HeaderStore,
    records: RecordStore,
    guard: AttemptGuard,
    keys: KeyMaterial,
    session: Option<VolatileSession>,
}

impl Vault {
    pub fn new(layout: FlashLayout) -> Self {
        Self {
            layout,
            header: None,
            header_store: HeaderStore::new(),
            records: RecordStore::new(),
            guard: AttemptGuard::new(),
            keys: KeyMaterial::default(),
            session: None,
        }
    }

    /// Bring the vault up from flash after power-on.
    pub async fn load<S, CI, SE>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        let header = self
            .header_store
            .load(flash, self.layout.header.clone(), cache)
            .await?;

        if let Some(header) = header {
            self.guard = AttemptGuard::from_header(header.failed_attempts, header.destroyed);
            if header.destroyed {
                // Finish a wipe that a power cut may have interrupted.
                store::RecordStore::erase_bank(flash, self.layout.bank(0)).await?;
                store::RecordStore::erase_bank(flash, self.layout.bank(1)).await?;
                self.records.clear_index();
            } else {
                if let Some(set) = header.keys.as_ref() {
                    self.keys.configure_from_set(set)?;
                }
                self.records
                    .load(flash, self.layout.bank(header.active_bank), cache)
                    .await?;
            }
            self.header = Some(header);
        }

        Ok(())
    }

    pub fn is_provisioned(&self) -> bool {
        self.header
            .as_ref()
            .is_some_and(|header| header.keys.is_some() && !header.destroyed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.guard.is_destroyed()
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.as_ref().is_some_and(VolatileSession::is_open)
    }

    pub fn generation(&self) -> u64 {
        self.header.as_ref().map_or(0, |header| header.generation)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn remaining_attempts(&self) -> u8 {
        self.guard.remaining_attempts()
    }

    pub fn identity_public(&self) -> Option<[u8; 32]> {
        self.keys.identity_public()
    }

    pub(crate) fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub(crate) fn records(&self) -> &RecordStore {
        &self.records
    }

    fn header_mut<SE>(&mut self) -> Result<&mut VaultHeader, VaultError<SE>>
    where
        SE: core::fmt::Debug,
    {
        self.header.as_mut().ok_or(VaultError::NotProvisioned)
    }

    async fn persist_header<S, CI, SE>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        let range = self.layout.header.clone();
        let header = self.header.as_mut().ok_or(VaultError::NotProvisioned)?;
        self.header_store
            .persist(flash, range, cache, header)
            .await?;
        Ok(())
    }

    /// First-time setup: mint a recovery phrase, derive the master key
    /// from it, and wrap everything under the chosen PIN. Returns the
    /// phrase for its one and only display.
    pub async fn provision<S, CI, SE, R>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        rng: &mut R,
        pin: &[u8],
        now_ms: u64,
    ) -> Result<RecoveryPhrase, VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
        R: RngCore + CryptoRng,
    {
        if self.is_provisioned() {
            return Err(VaultError::AlreadyProvisioned);
        }

        let (phrase, master_key) = recovery::generate_phrase(rng)?;
        self.begin_fresh_vault(flash, cache, rng, pin, master_key, now_ms)
            .await?;
        Ok(phrase)
    }

    async fn begin_fresh_vault<S, CI, SE, R>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        rng: &mut R,
        pin: &[u8],
        master_key: Zeroizing<[u8; 32]>,
        now_ms: u64,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
        R: RngCore + CryptoRng,
    {
        self.keys = KeyMaterial::default();
        self.keys.provision(pin, master_key, rng)?;
        let set = self.keys.wrapped_set().ok_or(KeyError::MasterKeyUnavailable)?;

        store::RecordStore::erase_bank(flash, self.layout.bank(0)).await?;
        store::RecordStore::erase_bank(flash, self.layout.bank(1)).await?;
        self.records = RecordStore::new();

        self.header = Some(VaultHeader::fresh(set));
        self.persist_header(flash, cache).await?;

        self.guard = AttemptGuard::new();
        self.guard.begin_attempt()?;
        self.guard.record_success();

        let key = self.keys.master_key()?.clone();
        self.session = Some(VolatileSession::open(key, &self.records, now_ms));
        Ok(())
    }

    /// Submit a PIN. The incremented attempt counter is persisted before
    /// the PIN is evaluated, so a power cut mid-attempt counts against
    /// the budget.
    pub async fn unlock<S, CI, SE>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        pin: &[u8],
        now_ms: u64,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        if self.guard.is_destroyed() {
            return Err(VaultError::SelfDestructTriggered);
        }
        if !self.is_provisioned() {
            return Err(VaultError::NotProvisioned);
        }
        if self.is_unlocked() {
            return Ok(());
        }

        let pending = self.guard.begin_attempt()?;
        self.header_mut()?.failed_attempts = pending;
        if let Err(err) = self.persist_header(flash, cache).await {
            // The PIN was never evaluated; release the guard so the next
            // submission is not refused as in-flight.
            self.guard.lock();
            let current = self.guard.failed_attempts();
            self.header_mut()?.failed_attempts = current;
            return Err(err);
        }

        match self.keys.unlock(pin) {
            Ok(()) => {
                self.guard.record_success();
                self.header_mut()?.failed_attempts = 0;
                self.persist_header(flash, cache).await?;

                let key = self.keys.master_key()?.clone();
                self.session = Some(VolatileSession::open(key, &self.records, now_ms));
                Ok(())
            }
            Err(KeyError::CryptoFailure) => {
                self.keys.wipe();
                match self.guard.record_failure() {
                    FailureOutcome::Remaining(remaining) => {
                        Err(VaultError::AuthenticationFailed { remaining })
                    }
                    FailureOutcome::Destroy => {
                        self.destroy(flash, cache).await?;
                        Err(VaultError::SelfDestructTriggered)
                    }
                }
            }
            Err(other) => {
                // Not a PIN failure; give the attempt back.
                self.guard.lock();
                let current = self.guard.failed_attempts();
                self.header_mut()?.failed_attempts = current;
                self.persist_header(flash, cache).await?;
                Err(VaultError::Key(other))
            }
        }
    }

    /// Irreversible wipe after the failure budget is exhausted.
    ///
    /// The destroyed header lands first so the decision is durable, then
    /// both record banks are erased. `load` finishes the erase if power
    /// is cut in between.
    async fn destroy<S, CI, SE>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        self.session = None;
        self.keys.wipe();
        self.keys = KeyMaterial::default();

        self.header = Some(VaultHeader::destroyed());
        self.persist_header(flash, cache).await?;

        store::RecordStore::erase_bank(flash, self.layout.bank(0)).await?;
        store::RecordStore::erase_bank(flash, self.layout.bank(1)).await?;
        self.records.clear_index();
        Ok(())
    }

    /// Close the session and drop every unwrapped key. The session is
    /// zeroized before anything else happens.
    pub fn lock(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        self.session = None;
        self.keys.wipe();
        self.guard.lock();
    }

    /// USB detach. Session teardown has priority over all other
    /// disconnect handling.
    pub fn on_disconnect(&mut self) {
        self.lock();
    }

    /// Periodic housekeeping; locks the vault when the session idles
    /// out. Returns whether a lock happened.
    pub fn maintain(&mut self, now_ms: u64) -> bool {
        let expired = self
            .session
            .as_ref()
            .is_some_and(|session| session.is_open() && session.expired(now_ms));
        if expired {
            self.lock();
        }
        expired
    }

    fn session_ref<SE>(&self) -> Result<&VolatileSession, VaultError<SE>>
    where
        SE: core::fmt::Debug,
    {
        self.session
            .as_ref()
            .filter(|session| session.is_open())
            .ok_or(VaultError::VaultLocked)
    }

    /// Listing for the device UI, most recently used first.
    pub fn list<SE>(&self) -> Result<&[RecordMeta], VaultError<SE>>
    where
        SE: core::fmt::Debug,
    {
        Ok(self.session_ref()?.list())
    }

    /// Create or update one credential locally. The stored version is
    /// bumped automatically.
    pub async fn put_credential<S, CI, SE, R>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        rng: &mut R,
        mut credential: CredentialRecord,
        now_ms: u64,
    ) -> Result<Uuid, VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
        R: RngCore + CryptoRng,
    {
        self.session_ref()?;
        let key = self.keys.master_key()?.clone();

        credential.version = self
            .records
            .version_of(&credential.id)
            .map_or(1, |version| version.saturating_add(1));
        credential.last_accessed = now_ms;

        let envelope = record::seal(&key, rng, &credential)
            .map_err(|err| map_record_error::<SE>(err))?;
        let op = StoreOp::Put {
            id: credential.id,
            version: credential.version,
            last_accessed: now_ms,
            envelope,
        };
        // Same write order as the sync commit: generation first, so an
        // error reported to the caller means the record was not applied.
        self.bump_generation(flash, cache).await?;
        let bank = self.layout.bank(self.active_bank());
        self.records.append(flash, bank, cache, alloc::vec![op]).await?;

        if let Some(session) = self.session.as_mut() {
            session.refresh(&self.records);
            session.touch(now_ms);
        }
        Ok(credential.id)
    }

    /// Decrypt one secret for use. Also journals the access time.
    pub async fn get_secret<S, CI, SE>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        id: &Uuid,
        now_ms: u64,
    ) -> Result<Zeroizing<String>, VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        let session = self.session_ref()?;
        let secret = match session.open_record(&self.records, id) {
            None => return Err(VaultError::RecordNotFound),
            Some(Err(err)) => return Err(map_record_error::<SE>(err)),
            Some(Ok(credential)) => Zeroizing::new(credential.secret.to_string()),
        };

        let bank = self.layout.bank(self.active_bank());
        self.records
            .append(
                flash,
                bank,
                cache,
                alloc::vec![StoreOp::Touch { id: *id, at: now_ms }],
            )
            .await?;
        if let Some(session) = self.session.as_mut() {
            session.note_access(id, now_ms);
            session.touch(now_ms);
        }
        Ok(secret)
    }

    /// Type one secret at the host and journal the access. The decrypted
    /// buffer is zeroized regardless of the sink outcome.
    pub async fn emit_secret<S, CI, SE, K>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        sink: &mut K,
        id: &Uuid,
        now_ms: u64,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
        K: KeystrokeSink,
    {
        let secret = self.get_secret(flash, cache, id, now_ms).await?;
        sink.send_text(&secret)
            .map_err(|err| VaultError::Emit(format!("{err:?}")))
    }

    /// Remove one credential and physically scrub the freed storage by
    /// consolidating the live records into the inactive bank.
    pub async fn delete_credential<S, CI, SE>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        id: &Uuid,
        now_ms: u64,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        self.session_ref()?;
        if self.records.get(id).is_none() {
            return Err(VaultError::RecordNotFound);
        }

        let active = self.active_bank();
        let bank = self.layout.bank(active);
        self.records
            .append(flash, bank, cache, alloc::vec![StoreOp::Delete { id: *id }])
            .await?;

        let target = self.layout.other_bank(active);
        self.records.consolidate_into(flash, target, cache).await?;
        self.header_mut()?.active_bank = active ^ 1;
        self.header_mut()?.generation = self.generation().saturating_add(1);
        self.persist_header(flash, cache).await?;
        store::RecordStore::erase_bank(flash, self.layout.bank(active)).await?;

        if let Some(session) = self.session.as_mut() {
            session.refresh(&self.records);
            session.touch(now_ms);
        }
        Ok(())
    }

    /// Commit an accepted sync batch as one atomic journal page.
    pub async fn commit_sync_batch<S, CI, SE, R>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        rng: &mut R,
        records: Vec<CredentialRecord>,
        now_ms: u64,
    ) -> Result<u64, VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
        R: RngCore + CryptoRng,
    {
        self.session_ref()?;
        let key = self.keys.master_key()?.clone();

        let mut ops = Vec::with_capacity(records.len());
        for mut credential in records {
            credential.last_accessed = now_ms;
            let envelope = record::seal(&key, rng, &credential)
                .map_err(|err| map_record_error::<SE>(err))?;
            ops.push(StoreOp::Put {
                id: credential.id,
                version: credential.version,
                last_accessed: now_ms,
                envelope,
            });
        }

        // The generation header lands before the batch page: a failure
        // between the two writes leaves the record set untouched, so a
        // commit error always means no records were applied.
        self.bump_generation(flash, cache).await?;
        let bank = self.layout.bank(self.active_bank());
        self.records.append(flash, bank, cache, ops).await?;

        if let Some(session) = self.session.as_mut() {
            session.refresh(&self.records);
            session.touch(now_ms);
        }
        Ok(self.generation())
    }

    /// Re-provision from a recovery phrase. The key hierarchy comes
    /// back; stored records do not.
    pub async fn restore<S, CI, SE, R>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        rng: &mut R,
        phrase: &str,
        pin: &[u8],
        now_ms: u64,
    ) -> Result<RestoreOutcome, VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
        R: RngCore + CryptoRng,
    {
        if self.is_provisioned() && !self.is_destroyed() {
            return Err(VaultError::AlreadyProvisioned);
        }

        let master_key = recovery::derive_from_phrase(phrase)?;
        self.begin_fresh_vault(flash, cache, rng, pin, master_key, now_ms)
            .await?;
        Ok(RestoreOutcome::VaultContentsUnavailable)
    }

    /// Restore from a phrase plus an independently backed-up record set.
    pub async fn restore_with_backup<S, CI, SE, R>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
        rng: &mut R,
        phrase: &str,
        pin: &[u8],
        backup: Vec<CredentialRecord>,
        now_ms: u64,
    ) -> Result<RestoreOutcome, VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
        R: RngCore + CryptoRng,
    {
        self.restore(flash, cache, rng, phrase, pin, now_ms).await?;
        if !backup.is_empty() {
            self.commit_sync_batch(flash, cache, rng, backup, now_ms)
                .await?;
        }
        Ok(RestoreOutcome::KeyRestored)
    }

    fn active_bank(&self) -> u8 {
        self.header.as_ref().map_or(0, |header| header.active_bank)
    }

    async fn bump_generation<S, CI, SE>(
        &mut self,
        flash: &mut S,
        cache: &mut CI,
    ) -> Result<(), VaultError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        let next = self.generation().saturating_add(1);
        self.header_mut()?.generation = next;
        self.persist_header(flash, cache).await
    }

    #[cfg(test)]
    pub(crate) fn test_session(&self) -> Option<&VolatileSession> {
        self.session.as_ref()
    }
}

fn map_record_error<SE>(err: RecordError) -> VaultError<SE>
where
    SE: core::fmt::Debug,
{
    match err {
        RecordError::Authentication | RecordError::Codec(_) => VaultError::RecordCorrupt,
    }
}
