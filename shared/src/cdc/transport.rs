use crate::cdc::{CdcCommand, FRAME_HEADER_SIZE, FrameHeader, FrameHeaderError, compute_crc32};
use crate::schema::{DeviceResponse, HostRequest};
use core::{cmp, fmt};

/// Errors produced by the shared framing helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTransportError {
    /// Payload length exceeds the configured limit.
    PayloadTooLarge { actual: usize, limit: usize },
    /// Header advertised a different version than expected.
    UnsupportedVersion { expected: u16, found: u16 },
    /// Header and payload lengths do not match.
    LengthMismatch { declared: usize, actual: usize },
    /// CRC32 verification failed.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Header decoding failed before payload validation.
    Header(FrameHeaderError),
}

impl fmt::Display for FrameTransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameTransportError::PayloadTooLarge { actual, limit } => {
                write!(f, "frame payload {actual} exceeds limit {limit}")
            }
            FrameTransportError::UnsupportedVersion { expected, found } => {
                write!(f, "expected protocol version {expected}, got {found}")
            }
            FrameTransportError::LengthMismatch { declared, actual } => {
                write!(
                    f,
                    "header declared length {declared} but payload was {actual}"
                )
            }
            FrameTransportError::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "checksum mismatch (expected 0x{expected:08X}, calculated 0x{actual:08X})"
                )
            }
            FrameTransportError::Header(err) => write!(f, "{err}"),
        }
    }
}

impl From<FrameHeaderError> for FrameTransportError {
    fn from(value: FrameHeaderError) -> Self {
        FrameTransportError::Header(value)
    }
}

/// Encode the frame header for the provided payload.
pub fn encode_frame(
    version: u16,
    command: CdcCommand,
    payload: &[u8],
    max_payload: usize,
) -> Result<[u8; FRAME_HEADER_SIZE], FrameTransportError> {
    let limit = cmp::min(max_payload, u32::MAX as usize);
    if payload.len() > limit {
        return Err(FrameTransportError::PayloadTooLarge {
            actual: payload.len(),
            limit,
        });
    }

    let checksum = compute_crc32(payload);
    let header = FrameHeader::new(version, command, payload.len() as u32, checksum);
    Ok(header.to_bytes())
}

/// Decode and validate the frame header using the expected version and payload limit.
pub fn decode_frame_header(
    expected_version: u16,
    max_payload: usize,
    header_bytes: [u8; FRAME_HEADER_SIZE],
) -> Result<FrameHeader, FrameTransportError> {
    let header = FrameHeader::from_bytes(header_bytes)?;

    if header.version != expected_version {
        return Err(FrameTransportError::UnsupportedVersion {
            expected: expected_version,
            found: header.version,
        });
    }

    if header.length as usize > max_payload {
        return Err(FrameTransportError::PayloadTooLarge {
            actual: header.length as usize,
            limit: max_payload,
        });
    }

    Ok(header)
}

/// Validate the payload against the header metadata.
pub fn decode_frame(header: &FrameHeader, payload: &[u8]) -> Result<(), FrameTransportError> {
    let declared = header.length as usize;
    if declared != payload.len() {
        return Err(FrameTransportError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    let expected = header.checksum;
    let actual = compute_crc32(payload);
    if expected != actual {
        return Err(FrameTransportError::ChecksumMismatch { expected, actual });
    }

    Ok(())
}

/// Resolve the command associated with a host request.
pub fn command_for_request(request: &HostRequest) -> CdcCommand {
    match request {
        HostRequest::Hello(_) => CdcCommand::Hello,
        HostRequest::Status(_) => CdcCommand::Status,
        HostRequest::Begin(_) => CdcCommand::Begin,
        HostRequest::PushRecord(_) => CdcCommand::PushRecord,
        HostRequest::Commit(_) => CdcCommand::Commit,
        HostRequest::Cancel(_) => CdcCommand::Cancel,
    }
}

/// Resolve the command associated with a device response.
pub fn command_for_response(response: &DeviceResponse) -> CdcCommand {
    match response {
        DeviceResponse::Hello(_) => CdcCommand::Hello,
        DeviceResponse::Status(_) => CdcCommand::Status,
        DeviceResponse::Ack(_) => CdcCommand::Ack,
        DeviceResponse::RecordAck(_) => CdcCommand::RecordAck,
        DeviceResponse::Commit(_) => CdcCommand::CommitDone,
        DeviceResponse::Nack(_) => CdcCommand::Nack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PROTOCOL_VERSION, RecordAckResponse, StatusRequest};
    use alloc::vec;

    #[test]
    fn encode_rejects_large_payload() {
        let payload = vec![0u8; 8];
        let err = encode_frame(1, CdcCommand::Hello, &payload, 4).expect_err("expected error");
        assert!(matches!(
            err,
            FrameTransportError::PayloadTooLarge {
                actual: 8,
                limit: 4
            }
        ));
    }

    #[test]
    fn decode_detects_checksum_mismatch() {
        let header = FrameHeader::new(1, CdcCommand::Status, 2, 0x12345678);
        let payload = vec![1u8, 2];
        let err = decode_frame(&header, &payload).expect_err("expected checksum error");
        assert!(matches!(err, FrameTransportError::ChecksumMismatch { .. }));
    }

    #[test]
    fn decode_rejects_version_skew() {
        let bytes = encode_frame(2, CdcCommand::Status, &[], 64).expect("encoded");
        let err = decode_frame_header(1, 64, bytes).expect_err("expected version error");
        assert!(matches!(
            err,
            FrameTransportError::UnsupportedVersion {
                expected: 1,
                found: 2
            }
        ));
    }

    #[test]
    fn command_tables_match_variants() {
        let status = HostRequest::Status(StatusRequest {
            protocol_version: PROTOCOL_VERSION,
        });
        assert_eq!(command_for_request(&status), CdcCommand::Status);

        let ack = DeviceResponse::RecordAck(RecordAckResponse {
            session_id: 1,
            sequence: 4,
        });
        assert_eq!(command_for_response(&ack), CdcCommand::RecordAck);
    }
}
