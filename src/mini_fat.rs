//! Codec for one MiniFAT sector's worth of entries.
//!
//! <https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/c5d235f7-b73c-4ec5-bf8d-5c08306cd023>
//!
//! The MiniFAT has the identical on-disk shape as the FAT (one `u32` entry per
//! mini-sector, packed into regular-sized sectors), so the codec is the same
//! function reused with a new name at the call site — grounded on
//! `oonxt-rust-ole/src/mini_fat.rs`, which keeps the MiniFAT as its own module for
//! the same reason: the spec treats it as a conceptually distinct table even
//! though its wire format is shared with the FAT.

pub use crate::fat::{decode_sector, encode_sector};
