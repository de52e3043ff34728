//! Framed request/response exchange with a vault device over USB CDC.
use std::io::{Read, Write};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::debug;

use shared::cdc::transport::{
    command_for_request, command_for_response, decode_frame, decode_frame_header, encode_frame,
};
use shared::cdc::{FRAME_HEADER_SIZE, FRAME_MAX_SIZE};
use shared::error::SharedError;
use shared::schema::{
    DeviceResponse, HostRequest, PROTOCOL_VERSION, decode_device_response, encode_host_request,
};

pub const SERIAL_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_SECS: u64 = 2;
pub const KEYFOB_USB_VID: u16 = 0x303A;
pub const KEYFOB_USB_PID: u16 = 0x4242;
const KEYFOB_IDENTITY_KEYWORDS: &[&str] = &["keyfob"];

/// One request/response round trip with the device.
pub trait DeviceTransport {
    fn exchange(&mut self, request: &HostRequest) -> Result<DeviceResponse, SharedError>;
}

/// Wraps any bidirectional byte stream in the shared framing.
pub struct FramedTransport<T> {
    inner: T,
}

impl<T> FramedTransport<T>
where
    T: Read + Write,
{
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T> DeviceTransport for FramedTransport<T>
where
    T: Read + Write,
{
    fn exchange(&mut self, request: &HostRequest) -> Result<DeviceResponse, SharedError> {
        send_host_request(&mut self.inner, request)?;
        read_device_response(&mut self.inner)
    }
}

/// The production transport: a framed USB CDC serial port.
pub type SerialTransport = FramedTransport<Box<dyn SerialPort>>;

pub fn send_host_request<W>(writer: &mut W, request: &HostRequest) -> Result<(), SharedError>
where
    W: Write + ?Sized,
{
    let payload = encode_host_request(request)?;
    let header = encode_frame(
        PROTOCOL_VERSION,
        command_for_request(request),
        &payload,
        FRAME_MAX_SIZE,
    )
    .map_err(|err| SharedError::Transport(err.to_string()))?;

    writer.write_all(&header)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_device_response<R>(reader: &mut R) -> Result<DeviceResponse, SharedError>
where
    R: Read + ?Sized,
{
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = decode_frame_header(PROTOCOL_VERSION, FRAME_MAX_SIZE, header_bytes)
        .map_err(|err| SharedError::Transport(err.to_string()))?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload)?;
    decode_frame(&header, &payload).map_err(|err| SharedError::Transport(err.to_string()))?;

    let response = decode_device_response(&payload)?;
    let expected = command_for_response(&response);
    if header.command != expected {
        return Err(SharedError::Transport(format!(
            "unexpected command {:?} for response (expected {:?})",
            header.command, expected
        )));
    }
    Ok(response)
}

pub fn open_serial_port(path: &str) -> Result<Box<dyn SerialPort>, SharedError> {
    debug!(port = path, "opening serial port");
    let mut port = serialport::new(path, SERIAL_BAUD_RATE)
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .open()
        .map_err(|err| {
            SharedError::Transport(format!("failed to open serial port {path}: {err}"))
        })?;

    port.set_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .map_err(|err| {
            SharedError::Transport(format!("failed to configure timeout on {path}: {err}"))
        })?;

    Ok(port)
}

pub fn detect_first_serial_port(allow_any_port: bool) -> Result<String, SharedError> {
    let ports = serialport::available_ports().map_err(|err| {
        SharedError::Transport(format!("failed to enumerate serial ports: {err}"))
    })?;

    select_serial_port(&ports, allow_any_port)
        .map(|info| info.port_name.clone())
        .ok_or_else(|| missing_device_error(allow_any_port))
}

pub fn list_candidate_ports() -> Result<Vec<serialport::SerialPortInfo>, SharedError> {
    let ports = serialport::available_ports().map_err(|err| {
        SharedError::Transport(format!("failed to enumerate serial ports: {err}"))
    })?;
    Ok(ports
        .into_iter()
        .filter(matches_keyfob_vid_pid)
        .collect())
}

fn select_serial_port(
    ports: &[serialport::SerialPortInfo],
    allow_any_port: bool,
) -> Option<&serialport::SerialPortInfo> {
    if allow_any_port {
        return ports
            .iter()
            .find(|info| matches!(info.port_type, SerialPortType::UsbPort(_)));
    }

    let candidates: Vec<&serialport::SerialPortInfo> = ports
        .iter()
        .filter(|info| matches_keyfob_vid_pid(info))
        .collect();

    if let Some(preferred) = candidates
        .iter()
        .copied()
        .find(|info| matches_keyfob_identity(info))
    {
        return Some(preferred);
    }

    candidates.into_iter().next()
}

fn matches_keyfob_vid_pid(info: &serialport::SerialPortInfo) -> bool {
    matches!(&info.port_type, SerialPortType::UsbPort(usb) if usb.vid == KEYFOB_USB_VID && usb.pid == KEYFOB_USB_PID)
}

fn matches_keyfob_identity(info: &serialport::SerialPortInfo) -> bool {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            field_matches_keyword(usb.product.as_deref())
                || field_matches_keyword(usb.serial_number.as_deref())
                || field_matches_keyword(usb.manufacturer.as_deref())
        }
        _ => false,
    }
}

fn field_matches_keyword(field: Option<&str>) -> bool {
    field.is_some_and(|value| {
        let lower = value.to_ascii_lowercase();
        KEYFOB_IDENTITY_KEYWORDS
            .iter()
            .any(|keyword| lower.contains(keyword))
    })
}

fn missing_device_error(allow_any_port: bool) -> SharedError {
    let mut message = format!(
        "vault device not found (expected VID 0x{KEYFOB_USB_VID:04X}, PID 0x{KEYFOB_USB_PID:04X})."
    );

    if !allow_any_port {
        message.push_str(" Pass --any-port to connect to the first available USB serial device.");
    }

    SharedError::Transport(message)
}
