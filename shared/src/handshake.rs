use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Domain separator mixed into the handshake transcript.
pub const TRANSCRIPT_DOMAIN: &[u8] = b"keyfob.handshake.v1";

/// HKDF info label for the per-session transport key.
pub const TRANSPORT_KEY_INFO: &[u8] = b"keyfob.transport.v1";

/// Digest over both ephemeral public keys, in handshake order.
///
/// The device signs this digest with its long-term identity key; the host
/// verifies the signature against the key it has pinned. Both sides also
/// bind every record frame to the digest through the envelope AAD.
pub fn transcript_digest(host_ephemeral: &[u8; 32], device_ephemeral: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    hasher.update(host_ephemeral);
    hasher.update(device_ephemeral);
    hasher.finalize().into()
}

/// Expand the raw X25519 shared secret into the session transport key,
/// salted with the transcript so a replayed ephemeral cannot yield the
/// same key under a different handshake.
pub fn derive_transport_key(shared_secret: &[u8; 32], transcript: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(Some(transcript), shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(TRANSPORT_KEY_INFO, key.as_mut())
        .expect("32-byte HKDF-SHA256 output");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_is_order_sensitive() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(transcript_digest(&a, &b), transcript_digest(&b, &a));
    }

    #[test]
    fn transport_key_depends_on_transcript() {
        let secret = [7u8; 32];
        let one = derive_transport_key(&secret, &[0u8; 32]);
        let two = derive_transport_key(&secret, &[1u8; 32]);
        assert_ne!(*one, *two);
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let secret = [7u8; 32];
        let transcript = transcript_digest(&[1u8; 32], &[2u8; 32]);
        assert_eq!(
            *derive_transport_key(&secret, &transcript),
            *derive_transport_key(&secret, &transcript)
        );
    }
}
