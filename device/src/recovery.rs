//! Recovery phrase generation and master-key re-derivation.
//!
//! A phrase encodes 32 bytes of entropy as 24 wordlist words with an
//! embedded checksum. The master key is derived from the normalized
//! sentence, so a valid phrase alone is sufficient to re-provision the
//! key on replacement hardware. Stored records do not travel with it.
use alloc::string::{String, ToString};
use bip39::Mnemonic;
use core::ops::Deref;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::keys::{self, KeyError};

/// Words per recovery phrase.
pub const PHRASE_WORDS: usize = 24;
/// Entropy bytes backing a phrase.
pub const PHRASE_ENTROPY_BYTES: usize = 32;

/// What a completed restore was able to bring back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Key and records are both available again.
    KeyRestored,
    /// The key is back but the device held no surviving records; any
    /// content must come from an independent backup.
    VaultContentsUnavailable,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryError {
    /// The phrase failed wordlist, length, or checksum validation.
    PhraseInvalid(String),
    /// Key derivation from the accepted phrase failed.
    Derivation(KeyError),
}

impl From<KeyError> for RecoveryError {
    fn from(value: KeyError) -> Self {
        RecoveryError::Derivation(value)
    }
}

impl core::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RecoveryError::PhraseInvalid(reason) => write!(f, "invalid recovery phrase: {reason}"),
            RecoveryError::Derivation(err) => write!(f, "{err}"),
        }
    }
}

impl core::error::Error for RecoveryError {}

/// A generated or accepted phrase sentence. Zeroizes on drop; shown to
/// the operator exactly once at generation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPhrase(Zeroizing<String>);

impl RecoveryPhrase {
    pub fn word_count(&self) -> usize {
        self.0.split_whitespace().count()
    }
}

impl Deref for RecoveryPhrase {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Generate a fresh phrase and the master key it derives.
pub fn generate_phrase<R: RngCore + CryptoRng>(
    rng: &mut R,
) -> Result<(RecoveryPhrase, Zeroizing<[u8; 32]>), RecoveryError> {
    let mut entropy = Zeroizing::new([0u8; PHRASE_ENTROPY_BYTES]);
    rng.fill_bytes(entropy.as_mut());

    let mnemonic = Mnemonic::from_entropy(entropy.as_ref())
        .map_err(|err| RecoveryError::PhraseInvalid(err.to_string()))?;
    let sentence = Zeroizing::new(mnemonic.to_string());
    let master_key = keys::derive_master_key(&sentence)?;

    Ok((RecoveryPhrase(sentence), master_key))
}

/// Validate a candidate phrase: wordlist membership, word count, and
/// the embedded checksum.
pub fn validate_phrase(words: &str) -> Result<(), RecoveryError> {
    let mnemonic = Mnemonic::parse_normalized(words)
        .map_err(|err| RecoveryError::PhraseInvalid(err.to_string()))?;
    if mnemonic.word_count() != PHRASE_WORDS {
        return Err(RecoveryError::PhraseInvalid(alloc::format!(
            "expected {PHRASE_WORDS} words, got {}",
            mnemonic.word_count()
        )));
    }
    Ok(())
}

/// Re-derive the master key from an accepted phrase. Normalizes the
/// sentence first so spacing and case cannot change the derivation.
pub fn derive_from_phrase(words: &str) -> Result<Zeroizing<[u8; 32]>, RecoveryError> {
    let mnemonic = Mnemonic::parse_normalized(words)
        .map_err(|err| RecoveryError::PhraseInvalid(err.to_string()))?;
    if mnemonic.word_count() != PHRASE_WORDS {
        return Err(RecoveryError::PhraseInvalid(alloc::format!(
            "expected {PHRASE_WORDS} words, got {}",
            mnemonic.word_count()
        )));
    }
    let sentence = Zeroizing::new(mnemonic.to_string());
    Ok(keys::derive_master_key(&sentence)?)
}
