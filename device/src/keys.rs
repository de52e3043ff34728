//! Key derivation and the wrapped-key PIN verifier.
//!
//! No PIN material is ever persisted. The scrypt-derived KEK wraps the
//! master key and the device identity key; a PIN is correct exactly when
//! unwrapping authenticates.
use alloc::vec::Vec;
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use ed25519_dalek::SigningKey;
use rand_core::{CryptoRng, RngCore};
use scrypt::{
    Params as ScryptParams,
    errors::{InvalidOutputLen, InvalidParams},
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

pub(crate) const KEY_LEN: usize = 32;

/// Fixed salt for the phrase-to-master-key derivation. The phrase itself
/// carries the entropy; the salt only separates this domain from PIN use.
const RECOVERY_SALT: &[u8; 16] = b"keyfob.master.v1";

#[derive(Debug, PartialEq, Eq)]
pub enum KeyError {
    InvalidParameters,
    InvalidOutput,
    KekUnavailable,
    MasterKeyUnavailable,
    MasterKeyLength,
    IdentityKeyUnavailable,
    IdentityKeyLength,
    CryptoFailure,
}

impl From<InvalidParams> for KeyError {
    fn from(_: InvalidParams) -> Self {
        KeyError::InvalidParameters
    }
}

impl From<InvalidOutputLen> for KeyError {
    fn from(_: InvalidOutputLen) -> Self {
        KeyError::InvalidOutput
    }
}

impl From<chacha20poly1305::aead::Error> for KeyError {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        KeyError::CryptoFailure
    }
}

impl core::fmt::Display for KeyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let label = match self {
            KeyError::InvalidParameters => "invalid scrypt parameters",
            KeyError::InvalidOutput => "invalid scrypt output length",
            KeyError::KekUnavailable => "missing KEK",
            KeyError::MasterKeyUnavailable => "master key unavailable",
            KeyError::MasterKeyLength => "unexpected master key length",
            KeyError::IdentityKeyUnavailable => "identity key unavailable",
            KeyError::IdentityKeyLength => "unexpected identity key length",
            KeyError::CryptoFailure => "encryption failure",
        };
        write!(f, "{label}")
    }
}

impl core::error::Error for KeyError {}

/// Persisted form of the scrypt cost parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScryptParamsRecord {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl ScryptParamsRecord {
    fn to_params(&self) -> Result<ScryptParams, KeyError> {
        ScryptParams::new(self.log_n, self.r, self.p, KEY_LEN).map_err(Into::into)
    }
}

impl From<ScryptParams> for ScryptParamsRecord {
    fn from(params: ScryptParams) -> Self {
        Self {
            log_n: params.log_n(),
            r: params.r(),
            p: params.p(),
        }
    }
}

/// Everything the header stores about the key hierarchy. Holds only
/// public values and AEAD ciphertexts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrappedKeySet {
    pub pin_salt: [u8; 16],
    pub scrypt: ScryptParamsRecord,
    pub master_nonce: [u8; 12],
    pub identity_nonce: [u8; 12],
    pub wrapped_master_key: Vec<u8>,
    pub wrapped_identity_key: Vec<u8>,
    pub identity_public: [u8; 32],
}

#[derive(Debug, Zeroize, ZeroizeOnDrop)]
struct PinKekMaterial {
    kek: Option<Zeroizing<[u8; 32]>>,
    pin_salt: [u8; 16],
    master_nonce: [u8; 12],
    #[zeroize(skip)]
    scrypt_params: ScryptParams,
}

impl Default for PinKekMaterial {
    fn default() -> Self {
        Self {
            kek: None,
            pin_salt: [0u8; 16],
            master_nonce: [0u8; 12],
            scrypt_params: ScryptParams::recommended(),
        }
    }
}

impl PinKekMaterial {
    fn randomize<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        rng.fill_bytes(&mut self.pin_salt);
        rng.fill_bytes(&mut self.master_nonce);
    }

    fn apply_set(&mut self, set: &WrappedKeySet) -> Result<(), KeyError> {
        self.pin_salt = set.pin_salt;
        self.master_nonce = set.master_nonce;
        self.kek = None;
        self.scrypt_params = set.scrypt.to_params()?;
        Ok(())
    }

    fn derive_kek(&mut self, pin: &[u8]) -> Result<(), KeyError> {
        let mut derived = Zeroizing::new([0u8; 32]);
        let pin_guard = Zeroizing::new(pin.to_vec());
        scrypt::scrypt(
            pin_guard.as_ref(),
            &self.pin_salt,
            &self.scrypt_params,
            derived.as_mut(),
        )
        .map_err(KeyError::from)?;
        self.kek = Some(derived);
        Ok(())
    }

    fn cipher_from_kek(&self) -> Result<ChaCha20Poly1305, KeyError> {
        let kek = self.kek.as_ref().ok_or(KeyError::KekUnavailable)?;
        ChaCha20Poly1305::new_from_slice(kek.as_ref()).map_err(|_| KeyError::CryptoFailure)
    }
}

#[derive(Debug, Zeroize, ZeroizeOnDrop)]
struct RuntimeKeys {
    master_key: Option<Zeroizing<[u8; 32]>>,
    identity_key: Option<Zeroizing<[u8; 32]>>,
    identity_public: Option<[u8; 32]>,
    identity_nonce: [u8; 12],
    wrapped_master_key: Zeroizing<Vec<u8>>,
    wrapped_identity_key: Zeroizing<Vec<u8>>,
}

impl Default for RuntimeKeys {
    fn default() -> Self {
        Self {
            master_key: None,
            identity_key: None,
            identity_public: None,
            identity_nonce: [0u8; 12],
            wrapped_master_key: Zeroizing::new(Vec::new()),
            wrapped_identity_key: Zeroizing::new(Vec::new()),
        }
    }
}

impl RuntimeKeys {
    fn set_wrapped_keys(&mut self, set: &WrappedKeySet) {
        self.identity_nonce = set.identity_nonce;
        self.wrapped_master_key = Zeroizing::new(set.wrapped_master_key.clone());
        self.wrapped_identity_key = Zeroizing::new(set.wrapped_identity_key.clone());
        self.identity_public = Some(set.identity_public);
        self.master_key = None;
        self.identity_key = None;
    }

    fn ensure_wrapped_keys(&self) -> Result<(), KeyError> {
        if self.wrapped_master_key.is_empty() {
            return Err(KeyError::MasterKeyUnavailable);
        }
        if self.wrapped_identity_key.is_empty() {
            return Err(KeyError::IdentityKeyUnavailable);
        }
        Ok(())
    }

    fn ensure_master_key(&self) -> Result<&Zeroizing<[u8; 32]>, KeyError> {
        self.master_key.as_ref().ok_or(KeyError::MasterKeyUnavailable)
    }

    fn ensure_identity_key(&self) -> Result<&Zeroizing<[u8; 32]>, KeyError> {
        self.identity_key
            .as_ref()
            .ok_or(KeyError::IdentityKeyUnavailable)
    }

    fn copy_master_key(bytes: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::MasterKeyLength);
        }
        let mut buffer = Zeroizing::new([0u8; 32]);
        buffer.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(buffer)
    }

    fn copy_identity_key(bytes: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::IdentityKeyLength);
        }
        let mut buffer = Zeroizing::new([0u8; 32]);
        buffer.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(buffer)
    }

    fn wipe(&mut self) {
        if let Some(master_key) = self.master_key.take() {
            drop(master_key);
        }
        if let Some(identity_key) = self.identity_key.take() {
            drop(identity_key);
        }
    }
}

/// Runtime key material for one provisioned vault.
#[derive(Debug, Default, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pin_kek: PinKekMaterial,
    runtime: RuntimeKeys,
}

impl KeyMaterial {
    /// Restore the wrapped keys loaded from the persisted header.
    pub fn configure_from_set(&mut self, set: &WrappedKeySet) -> Result<(), KeyError> {
        self.pin_kek.apply_set(set)?;
        if set.wrapped_master_key.is_empty() {
            return Err(KeyError::MasterKeyUnavailable);
        }
        if set.wrapped_identity_key.is_empty() {
            return Err(KeyError::IdentityKeyUnavailable);
        }
        self.runtime.set_wrapped_keys(set);
        Ok(())
    }

    /// Persistable snapshot of the current wrapped keys, if provisioned.
    pub fn wrapped_set(&self) -> Option<WrappedKeySet> {
        if self.runtime.wrapped_master_key.is_empty() || self.runtime.wrapped_identity_key.is_empty()
        {
            return None;
        }
        let identity_public = self.runtime.identity_public?;

        Some(WrappedKeySet {
            pin_salt: self.pin_kek.pin_salt,
            scrypt: self.pin_kek.scrypt_params.into(),
            master_nonce: self.pin_kek.master_nonce,
            identity_nonce: self.runtime.identity_nonce,
            wrapped_master_key: (*self.runtime.wrapped_master_key).clone(),
            wrapped_identity_key: (*self.runtime.wrapped_identity_key).clone(),
            identity_public,
        })
    }

    /// Wrap the supplied master key and a fresh identity keypair under a
    /// KEK derived from `pin`. Leaves the vault unlocked.
    pub fn provision<R: RngCore + CryptoRng>(
        &mut self,
        pin: &[u8],
        master_key: Zeroizing<[u8; 32]>,
        rng: &mut R,
    ) -> Result<(), KeyError> {
        self.pin_kek.randomize(rng);
        rng.fill_bytes(&mut self.runtime.identity_nonce);
        self.pin_kek.scrypt_params = ScryptParams::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)?;

        let mut identity_seed = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(identity_seed.as_mut());
        let signing_key = SigningKey::from_bytes(&identity_seed);
        let identity_public = signing_key.verifying_key().to_bytes();
        let identity_key = Zeroizing::new(signing_key.to_bytes());

        self.pin_kek.derive_kek(pin)?;
        let cipher = self.pin_kek.cipher_from_kek()?;
        let wrapped_master_key = cipher
            .encrypt(&Nonce::from(self.pin_kek.master_nonce), master_key.as_ref())
            .map_err(KeyError::from)?;
        let wrapped_identity_key = cipher
            .encrypt(
                &Nonce::from(self.runtime.identity_nonce),
                identity_key.as_ref(),
            )
            .map_err(KeyError::from)?;

        self.runtime.master_key = Some(master_key);
        self.runtime.identity_key = Some(identity_key);
        self.runtime.identity_public = Some(identity_public);
        self.runtime.wrapped_master_key = Zeroizing::new(wrapped_master_key);
        self.runtime.wrapped_identity_key = Zeroizing::new(wrapped_identity_key);
        Ok(())
    }

    /// Attempt to unwrap the key hierarchy with the given PIN.
    ///
    /// `CryptoFailure` here means the AEAD tag did not verify, which is the
    /// one and only signal that the PIN was wrong.
    pub fn unlock(&mut self, pin: &[u8]) -> Result<(), KeyError> {
        self.runtime.ensure_wrapped_keys()?;

        self.pin_kek.derive_kek(pin)?;
        let cipher = self.pin_kek.cipher_from_kek()?;
        let master_plaintext = cipher.decrypt(
            &Nonce::from(self.pin_kek.master_nonce),
            self.runtime.wrapped_master_key.as_slice(),
        )?;
        let master_key = RuntimeKeys::copy_master_key(&master_plaintext)?;

        let identity_plaintext = cipher.decrypt(
            &Nonce::from(self.runtime.identity_nonce),
            self.runtime.wrapped_identity_key.as_slice(),
        )?;
        let identity_key = RuntimeKeys::copy_identity_key(&identity_plaintext)?;

        self.runtime.master_key = Some(master_key);
        self.runtime.identity_key = Some(identity_key);
        Ok(())
    }

    pub fn master_key(&self) -> Result<&Zeroizing<[u8; 32]>, KeyError> {
        self.runtime.ensure_master_key()
    }

    /// Reconstruct the ed25519 signing key from the unwrapped identity bytes.
    pub fn signing_key(&self) -> Result<SigningKey, KeyError> {
        let bytes = self.runtime.ensure_identity_key()?;
        Ok(SigningKey::from_bytes(bytes))
    }

    pub fn identity_public(&self) -> Option<[u8; 32]> {
        self.runtime.identity_public
    }

    pub fn is_unlocked(&self) -> bool {
        self.runtime.master_key.is_some()
    }

    /// Drop every unwrapped key. Wrapped ciphertexts stay so a later
    /// unlock can succeed.
    pub fn wipe(&mut self) {
        if let Some(kek) = self.pin_kek.kek.take() {
            drop(kek);
        }
        self.runtime.wipe();
    }
}

/// Derive the vault master key from a normalized recovery phrase sentence.
pub fn derive_master_key(sentence: &str) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let params = ScryptParams::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)?;
    let mut derived = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(sentence.as_bytes(), RECOVERY_SALT, &params, derived.as_mut())
        .map_err(KeyError::from)?;
    Ok(derived)
}
