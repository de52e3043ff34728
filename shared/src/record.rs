use alloc::{borrow::ToOwned, string::String};
use core::ops::{Deref, DerefMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Wrapper around sensitive strings that zeroize their memory on drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretString(pub Zeroizing<String>);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}

impl Deref for SecretString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SecretString {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// One credential as both halves of the link understand it.
///
/// `secret` is write-mostly: the host serializes it into a transport
/// envelope during sync and the device re-encrypts it at rest. `version`
/// increases on every update and lets the device reject replays of stale
/// sync writes. `last_accessed` is maintained by the device only; hosts
/// send zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub service_name: String,
    pub username: String,
    pub secret: SecretString,
    pub icon: String,
    pub last_accessed: u64,
    pub version: u32,
}
