use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version spoken by both halves of the sync link.
pub const PROTOCOL_VERSION: u16 = 1;

/// Errors produced while encoding or decoding protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError(postcard::Error);

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl core::error::Error for CodecError {}

impl From<postcard::Error> for CodecError {
    fn from(value: postcard::Error) -> Self {
        CodecError(value)
    }
}

/// Error codes carried by negative acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceErrorCode {
    /// No authenticated session; the vault key is not available.
    VaultLocked,
    /// Another sync session is already in progress.
    SessionBusy,
    /// An individual record failed validation and was not staged.
    RecordRejected,
    /// The pushed record is older than the version already stored.
    StaleRecordVersion,
    /// The command is not valid in the current session state.
    InvalidState,
    /// The batch checksum presented at commit did not match.
    ChecksumMismatch,
    /// The staging area cannot hold any more records.
    ResourceExhausted,
    /// The vault destroyed itself after exhausting unlock attempts.
    SelfDestruct,
    /// The host requested a protocol version the device does not speak.
    UnsupportedProtocol,
    /// The device hit an internal fault while servicing the request.
    InternalFailure,
}

/// Opens a session: carries the host's ephemeral X25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub protocol_version: u16,
    pub client_name: String,
    pub client_version: String,
    pub host_ephemeral: [u8; 32],
}

/// Answers a hello: the device's half of the handshake plus a signature
/// over the transcript by its long-term identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub protocol_version: u16,
    pub session_id: u32,
    pub device_name: String,
    pub firmware_version: String,
    pub device_ephemeral: [u8; 32],
    pub identity_public: [u8; 32],
    pub transcript_signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    pub protocol_version: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub protocol_version: u16,
    pub session_active: bool,
    pub locked: bool,
    pub record_count: u32,
    pub vault_generation: u64,
}

/// Declares the size of the batch before any record frames flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginRequest {
    pub protocol_version: u16,
    pub session_id: u32,
    pub record_count: u32,
}

/// One transport-encrypted credential record.
///
/// `service_name_len` duplicates a field of the encrypted plaintext so the
/// device can cross-check the decrypted record against the frame metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFrame {
    pub session_id: u32,
    pub sequence: u32,
    pub record_id: Uuid,
    pub record_version: u32,
    pub service_name_len: u32,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub session_id: u32,
    pub record_count: u32,
    pub batch_checksum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub session_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub protocol_version: u16,
    pub session_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAckResponse {
    pub session_id: u32,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub session_id: u32,
    pub committed: bool,
    pub record_count: u32,
    pub vault_generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackResponse {
    pub protocol_version: u16,
    pub code: DeviceErrorCode,
    pub message: String,
}

/// Requests a host can issue over the framed link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRequest {
    Hello(HelloRequest),
    Status(StatusRequest),
    Begin(BeginRequest),
    PushRecord(RecordFrame),
    Commit(CommitRequest),
    Cancel(CancelRequest),
}

/// Responses the device can return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceResponse {
    Hello(HelloResponse),
    Status(StatusResponse),
    Ack(AckResponse),
    RecordAck(RecordAckResponse),
    Commit(CommitResponse),
    Nack(NackResponse),
}

pub fn encode_host_request(request: &HostRequest) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(request)?)
}

pub fn decode_host_request(bytes: &[u8]) -> Result<HostRequest, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}

pub fn encode_device_response(response: &DeviceResponse) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(response)?)
}

pub fn decode_device_response(bytes: &[u8]) -> Result<DeviceResponse, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}
