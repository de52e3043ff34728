//! Host half of the authenticated sync: handshake, encrypted record
//! transfer, and the atomic batch commit.
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};
use tracing::{debug, warn};
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::staging::StagingList;
use crate::transport::DeviceTransport;
use shared::batch::BatchHasher;
use shared::envelope::{EnvelopeCipher, transport_aad, transport_nonce};
use shared::error::SharedError;
use shared::handshake::{derive_transport_key, transcript_digest};
use shared::schema::{
    BeginRequest, CancelRequest, CommitRequest, DeviceErrorCode, DeviceResponse, HelloRequest,
    HostRequest, NackResponse, PROTOCOL_VERSION, RecordFrame,
};

/// Rejected record frames are re-sent up to this many times before the
/// sync gives up.
pub const PUSH_RETRY_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: u32,
    pub generation: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("device identity does not match the pinned key; refusing to sync")]
    DeviceUntrusted,
    #[error("device transcript signature did not verify")]
    BadSignature,
    #[error("device is busy with another sync session")]
    DeviceBusy,
    #[error("device vault is locked; unlock it on the device first")]
    DeviceLocked,
    #[error("device vault has self-destructed; restore it from its recovery phrase")]
    DeviceDestroyed,
    #[error("device already holds a newer revision of record {id}")]
    StaleRecord { id: Uuid },
    #[error("record at sequence {sequence} rejected after {attempts} attempts: {message}")]
    RecordRejected {
        sequence: u32,
        attempts: u32,
        message: String,
    },
    #[error("device refused the batch: {0}")]
    Refused(String),
    #[error("unexpected response during {phase}: {detail}")]
    Protocol {
        phase: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Transport(#[from] SharedError),
}

fn map_nack(nack: NackResponse, phase: &'static str) -> SyncError {
    match nack.code {
        DeviceErrorCode::SessionBusy => SyncError::DeviceBusy,
        DeviceErrorCode::VaultLocked => SyncError::DeviceLocked,
        DeviceErrorCode::SelfDestruct => SyncError::DeviceDestroyed,
        code => SyncError::Refused(format!("{code:?} during {phase}: {}", nack.message)),
    }
}

fn unexpected(phase: &'static str, response: &DeviceResponse) -> SyncError {
    SyncError::Protocol {
        phase,
        detail: format!("{response:?}"),
    }
}

fn cancel_best_effort<T: DeviceTransport>(transport: &mut T, session_id: u32) {
    let request = HostRequest::Cancel(CancelRequest { session_id });
    if let Err(err) = transport.exchange(&request) {
        warn!("failed to cancel sync session: {err}");
    }
}

/// Push the staged batch to the device.
///
/// On success the staging list is cleared and the device's identity key
/// is returned so the caller can pin it. Every error path leaves the
/// staging list intact and the device vault unchanged.
pub fn run_sync<T, R>(
    transport: &mut T,
    staging: &mut StagingList,
    pinned_identity: Option<[u8; 32]>,
    rng: &mut R,
) -> Result<(SyncReport, [u8; 32]), SyncError>
where
    T: DeviceTransport,
    R: RngCore + CryptoRng,
{
    let host_secret = EphemeralSecret::random_from_rng(&mut *rng);
    let host_public = PublicKey::from(&host_secret);

    let hello = match transport.exchange(&HostRequest::Hello(HelloRequest {
        protocol_version: PROTOCOL_VERSION,
        client_name: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
        client_version: env!("CARGO_PKG_VERSION").into(),
        host_ephemeral: host_public.to_bytes(),
    }))? {
        DeviceResponse::Hello(hello) => hello,
        DeviceResponse::Nack(nack) => return Err(map_nack(nack, "handshake")),
        other => return Err(unexpected("handshake", &other)),
    };
    let session_id = hello.session_id;

    if let Some(pinned) = pinned_identity {
        if pinned != hello.identity_public {
            cancel_best_effort(transport, session_id);
            return Err(SyncError::DeviceUntrusted);
        }
    }

    let transcript = transcript_digest(host_public.as_bytes(), &hello.device_ephemeral);
    let verified = VerifyingKey::from_bytes(&hello.identity_public)
        .ok()
        .zip(Signature::from_slice(&hello.transcript_signature).ok())
        .is_some_and(|(key, signature)| key.verify(&transcript, &signature).is_ok());
    if !verified {
        cancel_best_effort(transport, session_id);
        return Err(SyncError::BadSignature);
    }

    let shared_secret = host_secret.diffie_hellman(&PublicKey::from(hello.device_ephemeral));
    let transport_key = derive_transport_key(shared_secret.as_bytes(), &transcript);
    let cipher = EnvelopeCipher::new(*transport_key);

    debug!(
        session = session_id,
        device = %hello.device_name,
        records = staging.len(),
        "session negotiated"
    );

    match transport.exchange(&HostRequest::Begin(BeginRequest {
        protocol_version: PROTOCOL_VERSION,
        session_id,
        record_count: staging.len() as u32,
    }))? {
        DeviceResponse::Ack(_) => {}
        DeviceResponse::Nack(nack) => return Err(map_nack(nack, "begin")),
        other => {
            cancel_best_effort(transport, session_id);
            return Err(unexpected("begin", &other));
        }
    }

    let mut hasher = BatchHasher::new();
    for (index, record) in staging.records.iter().enumerate() {
        let sequence = index as u32 + 1;
        let aad = transport_aad(&transcript, sequence);
        let plaintext = Zeroizing::new(postcard::to_allocvec(record).map_err(|err| {
            SyncError::Protocol {
                phase: "encode",
                detail: err.to_string(),
            }
        })?);

        let mut attempt = 0u32;
        loop {
            let nonce = transport_nonce(sequence, attempt);
            let ciphertext = cipher
                .encrypt(&nonce, &aad, &plaintext)
                .map_err(|_| SyncError::Protocol {
                    phase: "encrypt",
                    detail: "envelope encryption failed".into(),
                })?;
            let frame = RecordFrame {
                session_id,
                sequence,
                record_id: record.id,
                record_version: record.version,
                service_name_len: record.service_name.len() as u32,
                nonce,
                ciphertext,
            };

            match transport.exchange(&HostRequest::PushRecord(frame)) {
                Ok(DeviceResponse::RecordAck(ack)) if ack.sequence == sequence => break,
                Ok(DeviceResponse::Nack(nack))
                    if nack.code == DeviceErrorCode::RecordRejected =>
                {
                    attempt += 1;
                    if attempt >= PUSH_RETRY_LIMIT {
                        cancel_best_effort(transport, session_id);
                        return Err(SyncError::RecordRejected {
                            sequence,
                            attempts: attempt,
                            message: nack.message,
                        });
                    }
                    warn!(
                        sequence,
                        attempt, "record frame rejected, re-sending with a fresh nonce"
                    );
                }
                Ok(DeviceResponse::Nack(nack))
                    if nack.code == DeviceErrorCode::StaleRecordVersion =>
                {
                    // The device aborted the session; nothing to cancel.
                    return Err(SyncError::StaleRecord { id: record.id });
                }
                Ok(DeviceResponse::Nack(nack)) => {
                    cancel_best_effort(transport, session_id);
                    return Err(map_nack(nack, "transfer"));
                }
                Ok(other) => {
                    cancel_best_effort(transport, session_id);
                    return Err(unexpected("transfer", &other));
                }
                Err(err) => {
                    cancel_best_effort(transport, session_id);
                    return Err(err.into());
                }
            }
        }
        hasher.update(&record.id, record.version);
    }

    match transport.exchange(&HostRequest::Commit(CommitRequest {
        session_id,
        record_count: staging.len() as u32,
        batch_checksum: hasher.finish(),
    }))? {
        DeviceResponse::Commit(commit) if commit.committed => {
            let report = SyncReport {
                pushed: commit.record_count,
                generation: commit.vault_generation,
            };
            staging.mark_committed();
            Ok((report, hello.identity_public))
        }
        DeviceResponse::Commit(commit) => Err(SyncError::Refused(format!(
            "device declined the commit at generation {}",
            commit.vault_generation
        ))),
        DeviceResponse::Nack(nack) => Err(map_nack(nack, "commit")),
        other => Err(unexpected("commit", &other)),
    }
}
