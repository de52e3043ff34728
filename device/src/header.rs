//! Persisted vault header: wrapped keys, the failed-attempt counter, and
//! the generation number.
//!
//! Headers are appended to a dedicated flash range as whole revisions;
//! the highest revision wins at load. Appending a complete new revision
//! is what makes the attempt counter durable before an unlock decision.
use alloc::{vec, vec::Vec};
use core::ops::Range;
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::{Error as SequentialStorageError, cache::CacheImpl, erase_all, queue};
use serde::{Deserialize, Serialize};

use crate::keys::WrappedKeySet;

/// Header layout version marker.
pub const HEADER_VERSION: u16 = 1;

/// Errors raised while persisting header revisions.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError<SE>
where
    SE: core::fmt::Debug,
{
    #[error("storage error: {0:?}")]
    Storage(SequentialStorageError<SE>),
    #[error("serialization error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u16),
    #[error("header revision counter exhausted")]
    RevisionExhausted,
}

impl<SE> From<SequentialStorageError<SE>> for HeaderError<SE>
where
    SE: core::fmt::Debug,
{
    fn from(value: SequentialStorageError<SE>) -> Self {
        Self::Storage(value)
    }
}

/// One durable snapshot of the vault's authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHeader {
    pub version: u16,
    pub revision: u64,
    pub keys: Option<WrappedKeySet>,
    pub failed_attempts: u8,
    pub destroyed: bool,
    /// Which of the two record banks currently holds the live journal.
    pub active_bank: u8,
    /// Bumped once per committed mutation batch.
    pub generation: u64,
}

impl VaultHeader {
    /// Header written at provisioning time, before any failures.
    pub fn fresh(keys: WrappedKeySet) -> Self {
        Self {
            version: HEADER_VERSION,
            revision: 0,
            keys: Some(keys),
            failed_attempts: 0,
            destroyed: false,
            active_bank: 0,
            generation: 0,
        }
    }

    /// Header written after self-destruct: no key material survives.
    pub fn destroyed() -> Self {
        Self {
            version: HEADER_VERSION,
            revision: 0,
            keys: None,
            failed_attempts: 0,
            destroyed: true,
            active_bank: 0,
            generation: 0,
        }
    }
}

/// Latest-revision-wins header persistence over a `sequential-storage`
/// queue range.
#[derive(Debug, Default)]
pub struct HeaderStore {
    next_revision: u64,
}

impl HeaderStore {
    pub const fn new() -> Self {
        Self { next_revision: 0 }
    }

    /// Load the most recent header revision, if one exists.
    pub async fn load<S, CI, SE>(
        &mut self,
        flash: &mut S,
        flash_range: Range<u32>,
        cache: &mut CI,
    ) -> Result<Option<VaultHeader>, HeaderError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        let mut buffer = vec![0u8; S::ERASE_SIZE];
        let mut latest: Option<VaultHeader> = None;

        let mut iter = queue::iter(flash, flash_range.clone(), cache).await?;
        while let Some(entry) = iter.next(&mut buffer).await? {
            let slice = entry.into_buf();
            let header: VaultHeader = postcard::from_bytes(slice)?;
            if header.version != HEADER_VERSION {
                return Err(HeaderError::UnsupportedVersion(header.version));
            }
            if latest
                .as_ref()
                .is_none_or(|current| header.revision >= current.revision)
            {
                latest = Some(header);
            }
        }

        if let Some(header) = latest.as_ref() {
            self.next_revision = header
                .revision
                .checked_add(1)
                .ok_or(HeaderError::RevisionExhausted)?;
        }

        Ok(latest)
    }

    /// Append `header` as the next revision. Old revisions may be
    /// reclaimed by the queue once the range wraps.
    pub async fn persist<S, CI, SE>(
        &mut self,
        flash: &mut S,
        flash_range: Range<u32>,
        cache: &mut CI,
        header: &mut VaultHeader,
    ) -> Result<(), HeaderError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        header.revision = self.next_revision;
        self.next_revision = self
            .next_revision
            .checked_add(1)
            .ok_or(HeaderError::RevisionExhausted)?;

        let encoded = postcard::to_allocvec(header)?;
        queue::push(flash, flash_range, cache, &encoded, true).await?;
        Ok(())
    }

    /// Erase every stored revision.
    pub async fn wipe<S, CI, SE>(
        &mut self,
        flash: &mut S,
        flash_range: Range<u32>,
        _cache: &mut CI,
    ) -> Result<(), HeaderError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        erase_all(flash, flash_range).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyMaterial, WrappedKeySet};
    use futures::executor::block_on;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;
    use sequential_storage::{
        cache::NoCache,
        mock_flash::{MockFlashBase, WriteCountCheck},
    };
    use zeroize::Zeroizing;

    type Flash = MockFlashBase<6, 4, 1024>;

    fn init_flash() -> Flash {
        Flash::new(WriteCountCheck::Twice, None, false)
    }

    fn sample_keys() -> WrappedKeySet {
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let mut material = KeyMaterial::default();
        material
            .provision(b"1234", Zeroizing::new([5u8; 32]), &mut rng)
            .expect("provisioned");
        material.wrapped_set().expect("wrapped set")
    }

    #[test]
    fn latest_revision_wins_after_reload() {
        block_on(async {
            let mut flash = init_flash();
            let range = Flash::FULL_FLASH_RANGE;
            let mut store = HeaderStore::new();

            assert!(
                store
                    .load(&mut flash, range.clone(), &mut NoCache::new())
                    .await
                    .unwrap()
                    .is_none()
            );

            let mut header = VaultHeader::fresh(sample_keys());
            store
                .persist(&mut flash, range.clone(), &mut NoCache::new(), &mut header)
                .await
                .unwrap();

            header.failed_attempts = 2;
            store
                .persist(&mut flash, range.clone(), &mut NoCache::new(), &mut header)
                .await
                .unwrap();

            let mut reloaded_store = HeaderStore::new();
            let reloaded = reloaded_store
                .load(&mut flash, range.clone(), &mut NoCache::new())
                .await
                .unwrap()
                .expect("header present");

            assert_eq!(reloaded.failed_attempts, 2);
            assert_eq!(reloaded.revision, 1);

            // The next persisted revision continues past what was on flash.
            let mut third = reloaded.clone();
            reloaded_store
                .persist(&mut flash, range, &mut NoCache::new(), &mut third)
                .await
                .unwrap();
            assert_eq!(third.revision, 2);
        });
    }

    #[test]
    fn wipe_removes_all_revisions() {
        block_on(async {
            let mut flash = init_flash();
            let range = Flash::FULL_FLASH_RANGE;
            let mut store = HeaderStore::new();

            let mut header = VaultHeader::fresh(sample_keys());
            store
                .persist(&mut flash, range.clone(), &mut NoCache::new(), &mut header)
                .await
                .unwrap();

            store
                .wipe(&mut flash, range.clone(), &mut NoCache::new())
                .await
                .unwrap();

            let mut reloaded_store = HeaderStore::new();
            assert!(
                reloaded_store
                    .load(&mut flash, range, &mut NoCache::new())
                    .await
                    .unwrap()
                    .is_none()
            );
        });
    }
}
