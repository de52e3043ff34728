//! At-rest AEAD envelope for individual credential records.
//!
//! Every record is sealed under the master key with its id bound through
//! the AAD, so a ciphertext cannot be replayed under another record's
//! identity and any corruption surfaces as an authentication failure.
use alloc::vec::Vec;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use shared::envelope::EnvelopeCipher;
use shared::record::CredentialRecord;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Additional authenticated data domain for records at rest.
const RECORD_AAD_DOMAIN: &[u8; 13] = b"keyfob.rec.v1";

#[derive(Debug, PartialEq, Eq)]
pub enum RecordError {
    /// Encoding or decoding of the plaintext record failed.
    Codec(postcard::Error),
    /// The AEAD tag did not verify; the ciphertext is corrupt or keyed
    /// differently.
    Authentication,
}

impl From<postcard::Error> for RecordError {
    fn from(value: postcard::Error) -> Self {
        RecordError::Codec(value)
    }
}

impl core::fmt::Display for RecordError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RecordError::Codec(err) => write!(f, "record codec error: {err}"),
            RecordError::Authentication => write!(f, "record failed authentication"),
        }
    }
}

impl core::error::Error for RecordError {}

/// Ciphertext form of one credential record as stored on flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

fn record_aad(id: &Uuid) -> [u8; 29] {
    let mut aad = [0u8; 29];
    aad[..13].copy_from_slice(RECORD_AAD_DOMAIN);
    aad[13..].copy_from_slice(id.as_bytes());
    aad
}

/// Seal a record under the master key with a fresh random nonce.
pub fn seal<R: RngCore + CryptoRng>(
    key: &[u8; 32],
    rng: &mut R,
    record: &CredentialRecord,
) -> Result<RecordEnvelope, RecordError> {
    let plaintext = Zeroizing::new(postcard::to_allocvec(record)?);
    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut nonce);

    let cipher = EnvelopeCipher::new(*key);
    let ciphertext = cipher
        .encrypt(&nonce, &record_aad(&record.id), plaintext.as_slice())
        .map_err(|_| RecordError::Authentication)?;
    Ok(RecordEnvelope { nonce, ciphertext })
}

/// Open a sealed record, authenticating it against the id it is stored
/// under.
pub fn open(
    key: &[u8; 32],
    id: &Uuid,
    envelope: &RecordEnvelope,
) -> Result<CredentialRecord, RecordError> {
    let cipher = EnvelopeCipher::new(*key);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(&envelope.nonce, &record_aad(id), &envelope.ciphertext)
            .map_err(|_| RecordError::Authentication)?,
    );
    Ok(postcard::from_bytes(plaintext.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;
    use shared::record::SecretString;

    fn sample_record(id: Uuid) -> CredentialRecord {
        CredentialRecord {
            id,
            service_name: "mail.example.org".to_string(),
            username: "alice".to_string(),
            secret: SecretString::from("hunter2"),
            icon: "envelope".to_string(),
            last_accessed: 1_700_000_000_000,
            version: 3,
        }
    }

    #[test]
    fn sealed_record_round_trips() {
        let key = [0x11u8; 32];
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let record = sample_record(Uuid::from_u128(7));

        let envelope = seal(&key, &mut rng, &record).expect("sealed");
        let opened = open(&key, &record.id, &envelope).expect("opened");
        assert_eq!(opened, record);
    }

    #[test]
    fn single_bit_flip_fails_authentication() {
        let key = [0x11u8; 32];
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let record = sample_record(Uuid::from_u128(7));

        let mut envelope = seal(&key, &mut rng, &record).expect("sealed");
        envelope.ciphertext[0] ^= 0x01;

        let err = open(&key, &record.id, &envelope).expect_err("must not open");
        assert_eq!(err, RecordError::Authentication);
    }

    #[test]
    fn envelope_is_bound_to_record_id() {
        let key = [0x11u8; 32];
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let record = sample_record(Uuid::from_u128(7));

        let envelope = seal(&key, &mut rng, &record).expect("sealed");
        let err = open(&key, &Uuid::from_u128(8), &envelope).expect_err("must not open");
        assert_eq!(err, RecordError::Authentication);
    }

    #[test]
    fn foreign_key_fails_authentication() {
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let record = sample_record(Uuid::from_u128(7));

        let envelope = seal(&[0x11u8; 32], &mut rng, &record).expect("sealed");
        let err = open(&[0x22u8; 32], &record.id, &envelope).expect_err("must not open");
        assert_eq!(err, RecordError::Authentication);
    }
}
