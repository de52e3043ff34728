//! Request handling for the sync protocol state machine.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use ed25519_dalek::Signer;
use embedded_storage_async::nor_flash::NorFlash;
use rand_core::{CryptoRng, RngCore};
use sequential_storage::cache::CacheImpl;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::sync::{DeviceSyncContext, MAX_STAGED_RECORDS, SyncSession, SyncState, FRAME_MAX_SIZE};
use crate::vault::{Vault, VaultError};
use shared::batch::BatchHasher;
use shared::cdc::transport::{
    FrameTransportError, command_for_response, decode_frame, decode_frame_header, encode_frame,
};
use shared::cdc::FRAME_HEADER_SIZE;
use shared::envelope::{transport_aad, EnvelopeCipher};
use shared::handshake::{derive_transport_key, transcript_digest};
use shared::record::CredentialRecord;
use shared::schema::{
    AckResponse, CodecError, CommitResponse, DeviceErrorCode, DeviceResponse, HelloResponse,
    HostRequest, NackResponse, PROTOCOL_VERSION, RecordAckResponse, StatusResponse,
    decode_host_request, encode_device_response,
};
use zeroize::Zeroizing;

/// Errors at the framing layer, before a request can even be answered
/// with a protocol-level Nack.
#[derive(Debug, thiserror::Error)]
pub enum SyncFrameError {
    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),
    #[error("framing error: {0}")]
    Transport(FrameTransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<FrameTransportError> for SyncFrameError {
    fn from(value: FrameTransportError) -> Self {
        Self::Transport(value)
    }
}

fn nack(code: DeviceErrorCode, message: String) -> DeviceResponse {
    DeviceResponse::Nack(NackResponse {
        protocol_version: PROTOCOL_VERSION,
        code,
        message,
    })
}

/// Decode one framed host request, service it, and produce the framed
/// response.
pub async fn process_host_frame<S, CI, SE, R>(
    ctx: &mut DeviceSyncContext,
    vault: &mut Vault,
    flash: &mut S,
    cache: &mut CI,
    rng: &mut R,
    frame: &[u8],
    now_ms: u64,
) -> Result<Vec<u8>, SyncFrameError>
where
    S: NorFlash<Error = SE>,
    CI: CacheImpl,
    SE: core::fmt::Debug,
    R: RngCore + CryptoRng,
{
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(SyncFrameError::Truncated(frame.len()));
    }
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    header_bytes.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
    let header = decode_frame_header(PROTOCOL_VERSION, FRAME_MAX_SIZE, header_bytes)?;
    let payload = &frame[FRAME_HEADER_SIZE..];
    decode_frame(&header, payload)?;

    let request = decode_host_request(payload)?;
    let response = process_host_request(ctx, vault, flash, cache, rng, request, now_ms).await;

    let encoded = encode_device_response(&response)?;
    let response_header = encode_frame(
        PROTOCOL_VERSION,
        command_for_response(&response),
        &encoded,
        FRAME_MAX_SIZE,
    )?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + encoded.len());
    out.extend_from_slice(&response_header);
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Service one decoded host request against the vault.
///
/// Every outcome is a response; protocol violations inside an active
/// session abort it, and an abort never touches committed vault state.
pub async fn process_host_request<S, CI, SE, R>(
    ctx: &mut DeviceSyncContext,
    vault: &mut Vault,
    flash: &mut S,
    cache: &mut CI,
    rng: &mut R,
    request: HostRequest,
    now_ms: u64,
) -> DeviceResponse
where
    S: NorFlash<Error = SE>,
    CI: CacheImpl,
    SE: core::fmt::Debug,
    R: RngCore + CryptoRng,
{
    match request {
        HostRequest::Hello(hello) => {
            if hello.protocol_version != PROTOCOL_VERSION {
                return nack(
                    DeviceErrorCode::UnsupportedProtocol,
                    format!(
                        "device speaks protocol {PROTOCOL_VERSION}, host requested {}",
                        hello.protocol_version
                    ),
                );
            }
            if ctx.session_active() {
                return nack(
                    DeviceErrorCode::SessionBusy,
                    String::from("another sync session is in progress"),
                );
            }
            if vault.is_destroyed() {
                return nack(
                    DeviceErrorCode::SelfDestruct,
                    String::from("vault contents have been destroyed"),
                );
            }
            if !vault.is_unlocked() {
                return nack(
                    DeviceErrorCode::VaultLocked,
                    String::from("unlock the vault on the device first"),
                );
            }
            let (signing_key, identity_public) =
                match (vault.keys().signing_key(), vault.identity_public()) {
                    (Ok(key), Some(public)) => (key, public),
                    _ => {
                        return nack(
                            DeviceErrorCode::InternalFailure,
                            String::from("device identity key unavailable"),
                        );
                    }
                };

            let device_ephemeral = EphemeralSecret::random_from_rng(&mut *rng);
            let device_public = PublicKey::from(&device_ephemeral);
            let transcript = transcript_digest(&hello.host_ephemeral, device_public.as_bytes());
            let shared_secret =
                device_ephemeral.diffie_hellman(&PublicKey::from(hello.host_ephemeral));
            let transport_key = derive_transport_key(shared_secret.as_bytes(), &transcript);
            let signature = signing_key.sign(&transcript);

            let session_id = ctx.allocate_session_id();
            ctx.session = Some(SyncSession {
                state: SyncState::Negotiating,
                session_id,
                transport_key,
                transcript,
                expected_records: 0,
                staged: Vec::new(),
                hasher: BatchHasher::new(),
                last_activity_ms: now_ms,
            });

            DeviceResponse::Hello(HelloResponse {
                protocol_version: PROTOCOL_VERSION,
                session_id,
                device_name: ctx.device_name.clone(),
                firmware_version: ctx.firmware_version.clone(),
                device_ephemeral: device_public.to_bytes(),
                identity_public,
                transcript_signature: signature.to_bytes().to_vec(),
            })
        }

        HostRequest::Status(status) => {
            if status.protocol_version != PROTOCOL_VERSION {
                return nack(
                    DeviceErrorCode::UnsupportedProtocol,
                    format!(
                        "device speaks protocol {PROTOCOL_VERSION}, host requested {}",
                        status.protocol_version
                    ),
                );
            }
            DeviceResponse::Status(StatusResponse {
                protocol_version: PROTOCOL_VERSION,
                session_active: ctx.session_active(),
                locked: !vault.is_unlocked(),
                record_count: vault.record_count() as u32,
                vault_generation: vault.generation(),
            })
        }

        HostRequest::Begin(begin) => {
            let state_ok = match ctx.session.as_ref() {
                Some(session) if session.session_id == begin.session_id => {
                    session.state == SyncState::Negotiating
                }
                _ => {
                    return nack(
                        DeviceErrorCode::InvalidState,
                        String::from("no matching session"),
                    );
                }
            };
            if !state_ok {
                ctx.abort();
                return nack(
                    DeviceErrorCode::InvalidState,
                    String::from("batch already declared"),
                );
            }
            if begin.record_count as usize > MAX_STAGED_RECORDS {
                ctx.abort();
                return nack(
                    DeviceErrorCode::ResourceExhausted,
                    format!("batch of {} exceeds limit {MAX_STAGED_RECORDS}", begin.record_count),
                );
            }

            if let Some(session) = ctx.session.as_mut() {
                session.expected_records = begin.record_count;
                session.staged = Vec::with_capacity(begin.record_count as usize);
                session.hasher.reset();
                session.state = SyncState::Transferring;
                session.last_activity_ms = now_ms;
            }
            DeviceResponse::Ack(AckResponse {
                protocol_version: PROTOCOL_VERSION,
                session_id: begin.session_id,
            })
        }

        HostRequest::PushRecord(frame) => {
            let (state_ok, expected_sequence, at_capacity) = match ctx.session.as_ref() {
                Some(session) if session.session_id == frame.session_id => (
                    session.state == SyncState::Transferring,
                    session.staged.len() as u32 + 1,
                    session.staged.len() >= session.expected_records as usize
                        || session.staged.len() >= MAX_STAGED_RECORDS,
                ),
                _ => {
                    return nack(
                        DeviceErrorCode::InvalidState,
                        String::from("no matching session"),
                    );
                }
            };
            if !state_ok {
                ctx.abort();
                return nack(
                    DeviceErrorCode::InvalidState,
                    String::from("record frame outside transfer phase"),
                );
            }
            if at_capacity {
                ctx.abort();
                return nack(
                    DeviceErrorCode::ResourceExhausted,
                    String::from("staging area is full"),
                );
            }
            if frame.sequence != expected_sequence {
                return nack(
                    DeviceErrorCode::RecordRejected,
                    format!(
                        "expected sequence {expected_sequence}, got {}",
                        frame.sequence
                    ),
                );
            }
            if let Some(stored) = vault.records().version_of(&frame.record_id) {
                if frame.record_version <= stored {
                    ctx.abort();
                    return nack(
                        DeviceErrorCode::StaleRecordVersion,
                        format!(
                            "record version {} is not newer than stored {stored}",
                            frame.record_version
                        ),
                    );
                }
            }

            let Some(session) = ctx.session.as_mut() else {
                return nack(
                    DeviceErrorCode::InvalidState,
                    String::from("no matching session"),
                );
            };
            let cipher = EnvelopeCipher::new(*session.transport_key);
            let aad = transport_aad(&session.transcript, frame.sequence);
            let plaintext = match cipher.decrypt(&frame.nonce, &aad, &frame.ciphertext) {
                Ok(plaintext) => Zeroizing::new(plaintext),
                Err(_) => {
                    return nack(
                        DeviceErrorCode::RecordRejected,
                        String::from("record frame failed authentication"),
                    );
                }
            };
            let record: CredentialRecord = match postcard::from_bytes(&plaintext) {
                Ok(record) => record,
                Err(err) => {
                    return nack(
                        DeviceErrorCode::RecordRejected,
                        format!("record decode failed: {err}"),
                    );
                }
            };
            if record.id != frame.record_id
                || record.version != frame.record_version
                || record.service_name.len() as u32 != frame.service_name_len
            {
                return nack(
                    DeviceErrorCode::RecordRejected,
                    String::from("frame metadata does not match decrypted record"),
                );
            }

            session.hasher.update(&record.id, record.version);
            session.staged.push(record);
            session.last_activity_ms = now_ms;
            DeviceResponse::RecordAck(RecordAckResponse {
                session_id: frame.session_id,
                sequence: frame.sequence,
            })
        }

        HostRequest::Commit(commit) => {
            let (state_ok, staged_count, checksum) = match ctx.session.as_ref() {
                Some(session) if session.session_id == commit.session_id => (
                    session.state == SyncState::Transferring,
                    session.staged.len() as u32,
                    session.hasher.finish(),
                ),
                _ => {
                    return nack(
                        DeviceErrorCode::InvalidState,
                        String::from("no matching session"),
                    );
                }
            };
            if !state_ok {
                ctx.abort();
                return nack(
                    DeviceErrorCode::InvalidState,
                    String::from("commit outside transfer phase"),
                );
            }
            if commit.record_count != staged_count {
                ctx.abort();
                return nack(
                    DeviceErrorCode::ChecksumMismatch,
                    format!(
                        "host committed {} records, device staged {staged_count}",
                        commit.record_count
                    ),
                );
            }
            if commit.batch_checksum != checksum {
                ctx.abort();
                return nack(
                    DeviceErrorCode::ChecksumMismatch,
                    String::from("batch checksum did not confirm"),
                );
            }

            let Some(mut session) = ctx.session.take() else {
                return nack(
                    DeviceErrorCode::InvalidState,
                    String::from("no matching session"),
                );
            };
            session.state = SyncState::Committing;
            let staged = core::mem::take(&mut session.staged);
            match vault
                .commit_sync_batch(flash, cache, rng, staged, now_ms)
                .await
            {
                Ok(generation) => DeviceResponse::Commit(CommitResponse {
                    session_id: commit.session_id,
                    committed: true,
                    record_count: staged_count,
                    vault_generation: generation,
                }),
                Err(VaultError::VaultLocked) => nack(
                    DeviceErrorCode::VaultLocked,
                    String::from("vault locked before the batch could commit"),
                ),
                Err(_) => nack(
                    DeviceErrorCode::InternalFailure,
                    String::from("commit failed; no records were applied"),
                ),
            }
        }

        HostRequest::Cancel(cancel) => {
            let matches = ctx
                .session
                .as_ref()
                .is_some_and(|session| session.session_id == cancel.session_id);
            if matches {
                ctx.abort();
                DeviceResponse::Ack(AckResponse {
                    protocol_version: PROTOCOL_VERSION,
                    session_id: cancel.session_id,
                })
            } else {
                nack(
                    DeviceErrorCode::InvalidState,
                    String::from("no session to cancel"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::FlashLayout;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use futures::executor::block_on;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;
    use sequential_storage::{
        cache::NoCache,
        mock_flash::{MockFlashBase, WriteCountCheck},
    };
    use shared::envelope::transport_nonce;
    use shared::record::SecretString;
    use shared::schema::{
        BeginRequest, CancelRequest, CommitRequest, HelloRequest, RecordFrame, StatusRequest,
    };
    use uuid::Uuid;

    type Flash = MockFlashBase<6, 4, 1024>;

    const PIN: &[u8] = b"1234";

    struct Harness {
        flash: Flash,
        cache: NoCache,
        vault: Vault,
        ctx: DeviceSyncContext,
        rng: ChaCha20Rng,
    }

    async fn harness() -> Harness {
        let mut flash = Flash::new(WriteCountCheck::Twice, None, false);
        let mut cache = NoCache::new();
        let mut rng = ChaCha20Rng::from_seed([21u8; 32]);
        let mut vault = Vault::new(FlashLayout {
            header: 0..8192,
            banks: [8192..16384, 16384..24576],
        });
        vault.load(&mut flash, &mut cache).await.expect("load");
        vault
            .provision(&mut flash, &mut cache, &mut rng, PIN, 0)
            .await
            .expect("provision");
        Harness {
            flash,
            cache,
            vault,
            ctx: DeviceSyncContext::default(),
            rng,
        }
    }

    async fn request(harness: &mut Harness, request: HostRequest, now_ms: u64) -> DeviceResponse {
        process_host_request(
            &mut harness.ctx,
            &mut harness.vault,
            &mut harness.flash,
            &mut harness.cache,
            &mut harness.rng,
            request,
            now_ms,
        )
        .await
    }

    struct HostSide {
        session_id: u32,
        transcript: [u8; 32],
        transport_key: Zeroizing<[u8; 32]>,
    }

    async fn handshake(harness: &mut Harness) -> HostSide {
        let mut host_rng = ChaCha20Rng::from_seed([99u8; 32]);
        let host_secret = EphemeralSecret::random_from_rng(&mut host_rng);
        let host_public = PublicKey::from(&host_secret);

        let response = request(
            harness,
            HostRequest::Hello(HelloRequest {
                protocol_version: PROTOCOL_VERSION,
                client_name: "keyfob-cli".into(),
                client_version: "0.4.0".into(),
                host_ephemeral: host_public.to_bytes(),
            }),
            0,
        )
        .await;
        let DeviceResponse::Hello(hello) = response else {
            panic!("expected hello response, got {response:?}");
        };

        let transcript = transcript_digest(host_public.as_bytes(), &hello.device_ephemeral);
        let verifying = VerifyingKey::from_bytes(&hello.identity_public).expect("identity key");
        let signature = Signature::from_slice(&hello.transcript_signature).expect("signature");
        verifying
            .verify(&transcript, &signature)
            .expect("transcript signature");

        let shared_secret =
            host_secret.diffie_hellman(&PublicKey::from(hello.device_ephemeral));
        let transport_key = derive_transport_key(shared_secret.as_bytes(), &transcript);
        HostSide {
            session_id: hello.session_id,
            transcript,
            transport_key,
        }
    }

    fn credential(index: u128, version: u32, secret: &str) -> CredentialRecord {
        CredentialRecord {
            id: Uuid::from_u128(index),
            service_name: alloc::format!("service-{index}"),
            username: "user".into(),
            secret: SecretString::from(secret),
            icon: "key".into(),
            last_accessed: 0,
            version,
        }
    }

    fn record_frame(
        host: &HostSide,
        sequence: u32,
        attempt: u32,
        record: &CredentialRecord,
    ) -> RecordFrame {
        let nonce = transport_nonce(sequence, attempt);
        let aad = transport_aad(&host.transcript, sequence);
        let plaintext = postcard::to_allocvec(record).expect("encoded record");
        let ciphertext = EnvelopeCipher::new(*host.transport_key)
            .encrypt(&nonce, &aad, &plaintext)
            .expect("sealed");
        RecordFrame {
            session_id: host.session_id,
            sequence,
            record_id: record.id,
            record_version: record.version,
            service_name_len: record.service_name.len() as u32,
            nonce,
            ciphertext,
        }
    }

    async fn begin(harness: &mut Harness, host: &HostSide, record_count: u32) {
        let response = request(
            harness,
            HostRequest::Begin(BeginRequest {
                protocol_version: PROTOCOL_VERSION,
                session_id: host.session_id,
                record_count,
            }),
            0,
        )
        .await;
        assert!(matches!(response, DeviceResponse::Ack(_)), "{response:?}");
    }

    #[test]
    fn full_batch_round_trip_commits_atomically() {
        block_on(async {
            let mut harness = harness().await;
            let host = handshake(&mut harness).await;
            begin(&mut harness, &host, 2).await;

            let records = [credential(1, 1, "alpha"), credential(2, 1, "beta")];
            let mut hasher = BatchHasher::new();
            for (index, record) in records.iter().enumerate() {
                let sequence = index as u32 + 1;
                let frame = record_frame(&host, sequence, 0, record);
                let response =
                    request(&mut harness, HostRequest::PushRecord(frame), 0).await;
                assert!(
                    matches!(
                        response,
                        DeviceResponse::RecordAck(RecordAckResponse { sequence: s, .. }) if s == sequence
                    ),
                    "{response:?}"
                );
                hasher.update(&record.id, record.version);
            }

            let response = request(
                &mut harness,
                HostRequest::Commit(CommitRequest {
                    session_id: host.session_id,
                    record_count: 2,
                    batch_checksum: hasher.finish(),
                }),
                0,
            )
            .await;
            let DeviceResponse::Commit(commit) = response else {
                panic!("expected commit response: {response:?}");
            };
            assert!(commit.committed);
            assert_eq!(commit.record_count, 2);
            assert_eq!(harness.vault.record_count(), 2);
            assert!(!harness.ctx.session_active());

            let secret = harness
                .vault
                .get_secret(&mut harness.flash, &mut harness.cache, &Uuid::from_u128(2), 10)
                .await
                .expect("synced record");
            assert_eq!(&**secret, "beta");
        });
    }

    #[test]
    fn locked_vault_refuses_handshake() {
        block_on(async {
            let mut harness = harness().await;
            harness.vault.lock();

            let response = request(
                &mut harness,
                HostRequest::Hello(HelloRequest {
                    protocol_version: PROTOCOL_VERSION,
                    client_name: "keyfob-cli".into(),
                    client_version: "0.4.0".into(),
                    host_ephemeral: [1u8; 32],
                }),
                0,
            )
            .await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::VaultLocked,
                    ..
                })
            ));
        });
    }

    #[test]
    fn protocol_version_skew_is_refused() {
        block_on(async {
            let mut harness = harness().await;
            let response = request(
                &mut harness,
                HostRequest::Hello(HelloRequest {
                    protocol_version: PROTOCOL_VERSION + 1,
                    client_name: "keyfob-cli".into(),
                    client_version: "0.4.0".into(),
                    host_ephemeral: [1u8; 32],
                }),
                0,
            )
            .await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::UnsupportedProtocol,
                    ..
                })
            ));
        });
    }

    #[test]
    fn concurrent_handshake_reports_busy() {
        block_on(async {
            let mut harness = harness().await;
            let _host = handshake(&mut harness).await;

            let response = request(
                &mut harness,
                HostRequest::Hello(HelloRequest {
                    protocol_version: PROTOCOL_VERSION,
                    client_name: "keyfob-cli".into(),
                    client_version: "0.4.0".into(),
                    host_ephemeral: [1u8; 32],
                }),
                0,
            )
            .await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::SessionBusy,
                    ..
                })
            ));
        });
    }

    #[test]
    fn tampered_frame_is_rejected_then_retry_succeeds() {
        block_on(async {
            let mut harness = harness().await;
            let host = handshake(&mut harness).await;
            begin(&mut harness, &host, 1).await;

            let record = credential(1, 1, "alpha");
            let mut frame = record_frame(&host, 1, 0, &record);
            frame.ciphertext[0] ^= 0x01;
            let response = request(&mut harness, HostRequest::PushRecord(frame), 0).await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::RecordRejected,
                    ..
                })
            ));
            // The session survives a per-record rejection.
            assert!(harness.ctx.session_active());

            // Retry with a fresh attempt counter, same sequence.
            let retry = record_frame(&host, 1, 1, &record);
            let response = request(&mut harness, HostRequest::PushRecord(retry), 0).await;
            assert!(matches!(response, DeviceResponse::RecordAck(_)));
        });
    }

    #[test]
    fn checksum_mismatch_aborts_without_applying() {
        block_on(async {
            let mut harness = harness().await;
            let host = handshake(&mut harness).await;
            begin(&mut harness, &host, 1).await;

            let record = credential(1, 1, "alpha");
            let frame = record_frame(&host, 1, 0, &record);
            request(&mut harness, HostRequest::PushRecord(frame), 0).await;

            let response = request(
                &mut harness,
                HostRequest::Commit(CommitRequest {
                    session_id: host.session_id,
                    record_count: 1,
                    batch_checksum: 0xDEAD_BEEF,
                }),
                0,
            )
            .await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::ChecksumMismatch,
                    ..
                })
            ));
            assert!(!harness.ctx.session_active());
            assert_eq!(harness.vault.record_count(), 0);
        });
    }

    #[test]
    fn stale_record_version_aborts_session() {
        block_on(async {
            let mut harness = harness().await;
            harness
                .vault
                .put_credential(
                    &mut harness.flash,
                    &mut harness.cache,
                    &mut harness.rng,
                    credential(1, 0, "old"),
                    0,
                )
                .await
                .expect("put");

            let host = handshake(&mut harness).await;
            begin(&mut harness, &host, 1).await;

            // Stored version is 1; pushing version 1 again is stale.
            let record = credential(1, 1, "new");
            let frame = record_frame(&host, 1, 0, &record);
            let response = request(&mut harness, HostRequest::PushRecord(frame), 0).await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::StaleRecordVersion,
                    ..
                })
            ));
            assert!(!harness.ctx.session_active());
        });
    }

    #[test]
    fn cancel_discards_staged_records() {
        block_on(async {
            let mut harness = harness().await;
            let host = handshake(&mut harness).await;
            begin(&mut harness, &host, 1).await;
            let frame = record_frame(&host, 1, 0, &credential(1, 1, "alpha"));
            request(&mut harness, HostRequest::PushRecord(frame), 0).await;

            let response = request(
                &mut harness,
                HostRequest::Cancel(CancelRequest {
                    session_id: host.session_id,
                }),
                0,
            )
            .await;
            assert!(matches!(response, DeviceResponse::Ack(_)));
            assert!(!harness.ctx.session_active());
            assert_eq!(harness.vault.record_count(), 0);

            // Cancelling again is an InvalidState, not a crash.
            let response = request(
                &mut harness,
                HostRequest::Cancel(CancelRequest {
                    session_id: host.session_id,
                }),
                0,
            )
            .await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::InvalidState,
                    ..
                })
            ));
        });
    }

    #[test]
    fn oversized_batch_declaration_is_refused() {
        block_on(async {
            let mut harness = harness().await;
            let host = handshake(&mut harness).await;

            let response = request(
                &mut harness,
                HostRequest::Begin(BeginRequest {
                    protocol_version: PROTOCOL_VERSION,
                    session_id: host.session_id,
                    record_count: MAX_STAGED_RECORDS as u32 + 1,
                }),
                0,
            )
            .await;
            assert!(matches!(
                response,
                DeviceResponse::Nack(NackResponse {
                    code: DeviceErrorCode::ResourceExhausted,
                    ..
                })
            ));
            assert!(!harness.ctx.session_active());
        });
    }

    #[test]
    fn status_works_with_and_without_session() {
        block_on(async {
            let mut harness = harness().await;
            let response = request(
                &mut harness,
                HostRequest::Status(StatusRequest {
                    protocol_version: PROTOCOL_VERSION,
                }),
                0,
            )
            .await;
            let DeviceResponse::Status(status) = response else {
                panic!("expected status: {response:?}");
            };
            assert!(!status.session_active);
            assert!(!status.locked);
            assert_eq!(status.record_count, 0);

            let _host = handshake(&mut harness).await;
            let response = request(
                &mut harness,
                HostRequest::Status(StatusRequest {
                    protocol_version: PROTOCOL_VERSION,
                }),
                0,
            )
            .await;
            let DeviceResponse::Status(status) = response else {
                panic!("expected status: {response:?}");
            };
            assert!(status.session_active);
        });
    }

    #[test]
    fn framed_request_round_trips_and_bad_crc_is_fatal() {
        block_on(async {
            let mut harness = harness().await;
            let payload = shared::schema::encode_host_request(&HostRequest::Status(
                StatusRequest {
                    protocol_version: PROTOCOL_VERSION,
                },
            ))
            .expect("encoded");
            let header = encode_frame(
                PROTOCOL_VERSION,
                shared::cdc::CdcCommand::Status,
                &payload,
                FRAME_MAX_SIZE,
            )
            .expect("header");
            let mut frame = Vec::new();
            frame.extend_from_slice(&header);
            frame.extend_from_slice(&payload);

            let response_frame = process_host_frame(
                &mut harness.ctx,
                &mut harness.vault,
                &mut harness.flash,
                &mut harness.cache,
                &mut harness.rng,
                &frame,
                0,
            )
            .await
            .expect("response frame");
            let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
            header_bytes.copy_from_slice(&response_frame[..FRAME_HEADER_SIZE]);
            let response_header =
                decode_frame_header(PROTOCOL_VERSION, FRAME_MAX_SIZE, header_bytes)
                    .expect("response header");
            assert_eq!(response_header.command, shared::cdc::CdcCommand::Status);
            decode_frame(&response_header, &response_frame[FRAME_HEADER_SIZE..])
                .expect("payload verifies");

            // Corrupt the payload; the frame must be rejected before any
            // request handling.
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
            let err = process_host_frame(
                &mut harness.ctx,
                &mut harness.vault,
                &mut harness.flash,
                &mut harness.cache,
                &mut harness.rng,
                &frame,
                0,
            )
            .await
            .expect_err("corrupt frame");
            assert!(matches!(
                err,
                SyncFrameError::Transport(FrameTransportError::ChecksumMismatch { .. })
            ));
        });
    }
}
