use aead::{Aead, KeyInit, Payload};
use alloc::vec::Vec;
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce domain for credential records travelling over the sync link.
pub const TRANSPORT_NONCE_DOMAIN: [u8; 4] = *b"SYNC";

/// Build a nonce from a domain tag and a monotonically increasing counter.
pub fn build_nonce(domain: [u8; 4], counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&domain);
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Nonce for one transport record frame.
///
/// The retry attempt lives in the upper half of the counter so a re-sent
/// frame never reuses the nonce of the rejected one.
pub fn transport_nonce(sequence: u32, attempt: u32) -> [u8; 12] {
    let counter = (u64::from(attempt) << 32) | u64::from(sequence);
    build_nonce(TRANSPORT_NONCE_DOMAIN, counter)
}

/// Additional authenticated data binding a record frame to the handshake
/// transcript and its position in the batch.
pub fn transport_aad(transcript: &[u8; 32], sequence: u32) -> [u8; 36] {
    let mut aad = [0u8; 36];
    aad[..32].copy_from_slice(transcript);
    aad[32..].copy_from_slice(&sequence.to_le_bytes());
    aad
}

/// AEAD envelope used for records both at rest and on the sync link.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeCipher {
    key: [u8; 32],
}

impl EnvelopeCipher {
    pub const fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypt the provided plaintext under the given nonce and AAD.
    pub fn encrypt(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, aead::Error> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).expect("32-byte ChaCha20-Poly1305 key");
        cipher.encrypt(
            nonce.into(),
            Payload {
                msg: plaintext,
                aad,
            },
        )
    }

    /// Decrypt the provided ciphertext, authenticating it against the AAD.
    pub fn decrypt(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, aead::Error> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).expect("32-byte ChaCha20-Poly1305 key");
        cipher.decrypt(
            nonce.into(),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_aad() {
        let cipher = EnvelopeCipher::new([9u8; 32]);
        let nonce = transport_nonce(1, 0);
        let aad = transport_aad(&[3u8; 32], 1);

        let ciphertext = cipher.encrypt(&nonce, &aad, b"payload").expect("sealed");
        let plaintext = cipher.decrypt(&nonce, &aad, &ciphertext).expect("opened");
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let cipher = EnvelopeCipher::new([9u8; 32]);
        let nonce = transport_nonce(1, 0);
        let aad = transport_aad(&[3u8; 32], 1);

        let mut ciphertext = cipher.encrypt(&nonce, &aad, b"payload").expect("sealed");
        ciphertext[0] ^= 0x01;
        assert!(cipher.decrypt(&nonce, &aad, &ciphertext).is_err());
    }

    #[test]
    fn foreign_aad_fails_authentication() {
        let cipher = EnvelopeCipher::new([9u8; 32]);
        let nonce = transport_nonce(2, 0);
        let aad = transport_aad(&[3u8; 32], 2);
        let other_aad = transport_aad(&[3u8; 32], 3);

        let ciphertext = cipher.encrypt(&nonce, &aad, b"payload").expect("sealed");
        assert!(cipher.decrypt(&nonce, &other_aad, &ciphertext).is_err());
    }

    #[test]
    fn retry_nonce_differs_from_first_attempt() {
        assert_ne!(transport_nonce(5, 0), transport_nonce(5, 1));
        assert_eq!(&transport_nonce(5, 0)[..4], &TRANSPORT_NONCE_DOMAIN);
    }
}
