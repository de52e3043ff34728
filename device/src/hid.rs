//! Keystroke emission boundary.
//!
//! Secrets leave the device as typed keystrokes, never over the sync
//! link. The hardware HID backend lives behind this trait so the vault
//! logic can run under test with a capturing sink.
use alloc::string::String;
use alloc::vec::Vec;

/// Something that can type characters at the host.
pub trait KeystrokeSink {
    type Error: core::fmt::Debug;

    /// Type the given text. Implementations must not buffer the text
    /// beyond the call.
    fn send_text(&mut self, text: &str) -> Result<(), Self::Error>;
}

/// Test sink that records what would have been typed.
#[derive(Debug, Default)]
pub struct CapturingSink {
    typed: Vec<String>,
    fail: bool,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            typed: Vec::new(),
            fail: true,
        }
    }

    pub fn typed(&self) -> &[String] {
        &self.typed
    }
}

impl KeystrokeSink for CapturingSink {
    type Error = &'static str;

    fn send_text(&mut self, text: &str) -> Result<(), Self::Error> {
        if self.fail {
            return Err("sink unavailable");
        }
        self.typed.push(String::from(text));
        Ok(())
    }
}
