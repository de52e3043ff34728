#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod batch;
pub mod cdc;
pub mod checksum;
pub mod envelope;
#[cfg(feature = "std")]
pub mod error;
pub mod handshake;
pub mod record;
pub mod schema;
