//! Device-resident half of the credential vault: key handling, flash-backed
//! storage, the unlock attempt guard, and the sync protocol state machine.
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod guard;
pub mod header;
pub mod hid;
pub mod keys;
pub mod record;
pub mod recovery;
pub mod session;
pub mod store;
pub mod sync;
pub mod vault;
