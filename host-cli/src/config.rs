//! Host-side configuration: preferred serial port and the pinned device
//! identity key.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

const CONFIG_DIR_ENV: &str = "KEYFOB_CONFIG_DIR";
const CONFIG_FILE: &str = "config.json";
pub const STAGING_FILE: &str = "staging.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Serial port to use when none is given on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Hex-encoded ed25519 public key pinned on first sync. A device
    /// presenting a different identity is refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_identity: Option<String>,
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config from {}", path.display()));
            }
        };
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config to {}", path.display()))
    }

    pub fn pinned_identity_bytes(&self) -> Result<Option<[u8; 32]>> {
        match self.pinned_identity.as_deref() {
            None => Ok(None),
            Some(hex) => {
                let bytes = decode_hex(hex).context("pinned identity is not valid hex")?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("pinned identity must be 32 bytes"))?;
                Ok(Some(key))
            }
        }
    }

    pub fn pin_identity(&mut self, key: &[u8; 32]) {
        self.pinned_identity = Some(encode_hex(key));
    }
}

/// Directory holding the config and staging files. Overridable for tests
/// and portable setups.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home).join(".config").join("keyfob"),
        None => PathBuf::from("."),
    }
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

pub fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

pub fn decode_hex(value: &str) -> Result<Vec<u8>> {
    if value.len() % 2 != 0 {
        bail!("hex string has odd length");
    }
    (0..value.len())
        .step_by(2)
        .map(|index| {
            u8::from_str_radix(&value[index..index + 2], 16)
                .with_context(|| format!("invalid hex at offset {index}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_loads_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = HostConfig::load(&config_path(dir.path())).expect("load");
        assert!(config.port.is_none());
        assert!(config.pinned_identity.is_none());
    }

    #[test]
    fn pinned_identity_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = config_path(dir.path());

        let mut config = HostConfig::default();
        config.pin_identity(&[0xAB; 32]);
        config.save(&path).expect("save");

        let reloaded = HostConfig::load(&path).expect("load");
        assert_eq!(
            reloaded.pinned_identity_bytes().expect("decode"),
            Some([0xAB; 32])
        );
    }

    #[test]
    fn malformed_pinned_identity_is_reported() {
        let config = HostConfig {
            port: None,
            pinned_identity: Some("zz".into()),
        };
        assert!(config.pinned_identity_bytes().is_err());

        let short = HostConfig {
            port: None,
            pinned_identity: Some("abcd".into()),
        };
        assert!(short.pinned_identity_bytes().is_err());
    }

    #[test]
    fn hex_helpers_round_trip() {
        let bytes = [0x00, 0x7F, 0xFF];
        assert_eq!(encode_hex(&bytes), "007fff");
        assert_eq!(decode_hex("007fff").expect("decode"), bytes);
    }
}
