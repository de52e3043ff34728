//! Journaled record store over NOR flash.
//!
//! Mutations are appended as op pages through `sequential-storage`; a
//! whole batch rides in one page, so the queue append is the atomic
//! commit unit. Deletes are followed by a consolidation into the inactive
//! bank, which physically erases the freed ciphertext instead of leaving
//! it unlinked.
use alloc::collections::BTreeMap;
use alloc::{vec, vec::Vec};
use core::ops::Range;
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::{Error as SequentialStorageError, cache::CacheImpl, erase_all, queue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::RecordEnvelope;

/// Store page layout version marker.
pub const STORE_PAGE_VERSION: u16 = 1;

/// Errors raised while reading or writing the record journal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError<SE>
where
    SE: core::fmt::Debug,
{
    #[error("storage error: {0:?}")]
    Storage(SequentialStorageError<SE>),
    #[error("serialization error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("unsupported store page version {0}")]
    UnsupportedVersion(u16),
    #[error("page counter exhausted")]
    CounterExhausted,
}

impl<SE> From<SequentialStorageError<SE>> for StoreError<SE>
where
    SE: core::fmt::Debug,
{
    fn from(value: SequentialStorageError<SE>) -> Self {
        Self::Storage(value)
    }
}

/// One journaled mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    Put {
        id: Uuid,
        version: u32,
        last_accessed: u64,
        envelope: RecordEnvelope,
    },
    Delete {
        id: Uuid,
    },
    Touch {
        id: Uuid,
        at: u64,
    },
}

/// Plaintext metadata plus sealed payload tracked per record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: u32,
    pub last_accessed: u64,
    pub envelope: RecordEnvelope,
}

/// Page of ops written in a single queue append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StorePage {
    version: u16,
    counter: u64,
    ops: Vec<StoreOp>,
}

/// In-memory index over the journal, rebuilt at load.
#[derive(Debug, Default)]
pub struct RecordStore {
    index: BTreeMap<Uuid, StoredRecord>,
    next_counter: u64,
}

impl RecordStore {
    pub const fn new() -> Self {
        Self {
            index: BTreeMap::new(),
            next_counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&StoredRecord> {
        self.index.get(id)
    }

    pub fn version_of(&self, id: &Uuid) -> Option<u32> {
        self.index.get(id).map(|record| record.version)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &StoredRecord)> {
        self.index.iter()
    }

    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::Put {
                id,
                version,
                last_accessed,
                envelope,
            } => {
                self.index.insert(
                    id,
                    StoredRecord {
                        version,
                        last_accessed,
                        envelope,
                    },
                );
            }
            StoreOp::Delete { id } => {
                self.index.remove(&id);
            }
            StoreOp::Touch { id, at } => {
                if let Some(record) = self.index.get_mut(&id) {
                    record.last_accessed = at;
                }
            }
        }
    }

    /// Rebuild the index by replaying the active bank's journal.
    pub async fn load<S, CI, SE>(
        &mut self,
        flash: &mut S,
        bank: Range<u32>,
        cache: &mut CI,
    ) -> Result<(), StoreError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        self.index.clear();
        let mut buffer = vec![0u8; S::ERASE_SIZE];
        let mut last_counter = None;

        let mut iter = queue::iter(flash, bank.clone(), cache).await?;
        while let Some(entry) = iter.next(&mut buffer).await? {
            let slice = entry.into_buf();
            let page: StorePage = postcard::from_bytes(slice)?;
            if page.version != STORE_PAGE_VERSION {
                return Err(StoreError::UnsupportedVersion(page.version));
            }

            last_counter =
                Some(last_counter.map_or(page.counter, |prev: u64| prev.max(page.counter)));
            for op in page.ops {
                self.apply(op);
            }
        }

        if let Some(counter) = last_counter {
            self.next_counter = self.next_counter.max(
                counter
                    .checked_add(1)
                    .ok_or(StoreError::CounterExhausted)?,
            );
        }

        Ok(())
    }

    /// Append a batch of ops as one page and apply it to the index.
    ///
    /// The page lands in a single queue push, so the whole batch is
    /// either durable or absent after a power cut.
    pub async fn append<S, CI, SE>(
        &mut self,
        flash: &mut S,
        bank: Range<u32>,
        cache: &mut CI,
        ops: Vec<StoreOp>,
    ) -> Result<(), StoreError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        if ops.is_empty() {
            return Ok(());
        }

        let counter = self.next_counter;
        self.next_counter = self
            .next_counter
            .checked_add(1)
            .ok_or(StoreError::CounterExhausted)?;

        let page = StorePage {
            version: STORE_PAGE_VERSION,
            counter,
            ops: ops.clone(),
        };
        let encoded = postcard::to_allocvec(&page)?;
        queue::push(flash, bank, cache, &encoded, false).await?;

        for op in ops {
            self.apply(op);
        }
        Ok(())
    }

    /// Rewrite the live records into `target_bank` as one consolidated
    /// page, then erase `old_bank`.
    ///
    /// Callers flip the header's active bank between the write and the
    /// erase so a power cut never strands the index without a journal.
    pub async fn consolidate_into<S, CI, SE>(
        &mut self,
        flash: &mut S,
        target_bank: Range<u32>,
        cache: &mut CI,
    ) -> Result<(), StoreError<SE>>
    where
        S: NorFlash<Error = SE>,
        CI: CacheImpl,
        SE: core::fmt::Debug,
    {
        erase_all(flash, target_bank.clone()).await?;

        let ops: Vec<StoreOp> = self
            .index
            .iter()
            .map(|(id, record)| StoreOp::Put {
                id: *id,
                version: record.version,
                last_accessed: record.last_accessed,
                envelope: record.envelope.clone(),
            })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }

        let counter = self.next_counter;
        self.next_counter = self
            .next_counter
            .checked_add(1)
            .ok_or(StoreError::CounterExhausted)?;

        let page = StorePage {
            version: STORE_PAGE_VERSION,
            counter,
            ops,
        };
        let encoded = postcard::to_allocvec(&page)?;
        queue::push(flash, target_bank, cache, &encoded, false).await?;
        Ok(())
    }

    /// Erase a bank outright. Used for the freed bank after consolidation
    /// and for the full wipe.
    pub async fn erase_bank<S, SE>(
        flash: &mut S,
        bank: Range<u32>,
    ) -> Result<(), StoreError<SE>>
    where
        S: NorFlash<Error = SE>,
        SE: core::fmt::Debug,
    {
        erase_all(flash, bank).await?;
        Ok(())
    }

    /// Drop the index without touching flash.
    pub fn clear_index(&mut self) {
        self.index.clear();
    }
}
