//! Codec for one FAT sector's worth of entries.
//!
//! <https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/30e1013a-a0ff-4404-9ccf-d75d835ff404>
//!
//! Grounded on `oonxt-rust-ole/src/fat.rs`; kept as plain encode/decode helpers
//! (rather than the teacher's owned `Fat` record) since the `Allocator` keeps the
//! whole table as one dense `Vec<SectorId>` and only needs per-sector slices when
//! loading from, or flushing to, the device.

use crate::common::SectorId;

/// Decodes a raw sector's bytes into `sector_len / 4` `SectorId` entries.
pub fn decode_sector(bytes: &[u8]) -> Vec<SectorId> {
    bytes
        .chunks_exact(4)
        .map(|chunk| SectorId(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect()
}

/// Encodes `entries` into a `sector_size`-byte buffer, padding any unused trailing
/// slots with `FREESECT`.
pub fn encode_sector(entries: &[SectorId], sector_size: usize) -> Vec<u8> {
    let capacity = sector_size / 4;
    let mut buf = Vec::with_capacity(sector_size);
    for i in 0..capacity {
        let id = entries.get(i).copied().unwrap_or(SectorId::FREE);
        buf.extend_from_slice(&id.0.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let entries = vec![SectorId(1), SectorId::END, SectorId::FREE];
        let bytes = encode_sector(&entries, 16);
        assert_eq!(bytes.len(), 16);
        let decoded = decode_sector(&bytes);
        assert_eq!(decoded[0], SectorId(1));
        assert_eq!(decoded[1], SectorId::END);
        assert_eq!(decoded[2], SectorId::FREE);
        assert_eq!(decoded[3], SectorId::FREE);
    }
}
