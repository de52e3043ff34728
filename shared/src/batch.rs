use uuid::Uuid;

use crate::checksum::accumulate_checksum;

/// Initial seed used by the rolling batch checksum.
const BATCH_SEED: u32 = 0x5AA5_A55A;

/// Computes the checksum a host presents at commit and the device verifies
/// against the records it actually staged.
///
/// Folding in both the record id and the version means a batch where a
/// record was silently replaced, reordered relative to acceptance, or
/// dropped after its ack will not confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHasher {
    state: u32,
}

impl BatchHasher {
    /// Create a hasher with the default seed.
    pub const fn new() -> Self {
        Self { state: BATCH_SEED }
    }

    /// Reset the internal accumulator back to the initial seed.
    pub fn reset(&mut self) {
        self.state = BATCH_SEED;
    }

    /// Feed one accepted record into the checksum and return the updated value.
    pub fn update(&mut self, record_id: &Uuid, record_version: u32) -> u32 {
        self.state = accumulate_checksum(self.state, record_id.as_bytes());
        self.state = accumulate_checksum(self.state, &record_version.to_le_bytes());
        self.state
    }

    /// Final checksum value for the processed batch.
    pub const fn finish(&self) -> u32 {
        self.state
    }

    /// Compute the checksum for an entire batch in one step.
    pub fn digest<'a, I>(records: I) -> u32
    where
        I: IntoIterator<Item = (&'a Uuid, u32)>,
    {
        let mut hasher = Self::new();
        for (id, version) in records {
            hasher.update(id, version);
        }
        hasher.finish()
    }
}

impl Default for BatchHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn incremental_matches_digest() {
        let ids: Vec<Uuid> = (1u128..=3).map(Uuid::from_u128).collect();

        let mut hasher = BatchHasher::new();
        for (index, id) in ids.iter().enumerate() {
            hasher.update(id, index as u32 + 1);
        }

        let digest = BatchHasher::digest(
            ids.iter()
                .enumerate()
                .map(|(index, id)| (id, index as u32 + 1)),
        );
        assert_eq!(hasher.finish(), digest);
    }

    #[test]
    fn version_bump_changes_checksum() {
        let id = Uuid::from_u128(7);
        let original = BatchHasher::digest([(&id, 1)]);
        let bumped = BatchHasher::digest([(&id, 2)]);
        assert_ne!(original, bumped);
    }

    #[test]
    fn order_is_significant() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let forward = BatchHasher::digest([(&a, 1), (&b, 1)]);
        let reversed = BatchHasher::digest([(&b, 1), (&a, 1)]);
        assert_ne!(forward, reversed);
    }
}
