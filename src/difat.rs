//! Codec for one DIFAT overflow sector: `entries_per_sector - 1` FAT-sector
//! locations plus a trailing "next DIFAT sector" pointer.
//!
//! <https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/0afa4e43-b18f-432a-9917-4f276eca7a73>
//!
//! Grounded on `oonxt-rust-ole/src/difat.rs`'s `Difat { entries, next }` shape;
//! rewritten as plain encode/decode functions for the same reason as `fat.rs` — the
//! `Allocator` keeps the logical table dense in memory and only touches the wire
//! shape at load/flush time.

use crate::common::SectorId;

/// Decodes one DIFAT sector into its entries and its trailing chain pointer.
pub fn decode_sector(bytes: &[u8]) -> (Vec<SectorId>, SectorId) {
    let all = crate::fat::decode_sector(bytes);
    let (entries, next) = all.split_at(all.len() - 1);
    (entries.to_vec(), next[0])
}

/// Encodes `entries` (at most `sector_size / 4 - 1` of them) followed by `next`,
/// padding unused entry slots with `FREESECT`.
pub fn encode_sector(entries: &[SectorId], next: SectorId, sector_size: usize) -> Vec<u8> {
    let capacity = sector_size / 4 - 1;
    let mut buf = Vec::with_capacity(sector_size);
    for i in 0..capacity {
        let id = entries.get(i).copied().unwrap_or(SectorId::FREE);
        buf.extend_from_slice(&id.0.to_le_bytes());
    }
    buf.extend_from_slice(&next.0.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_trailing_pointer() {
        let entries = vec![SectorId(3), SectorId(4)];
        let bytes = encode_sector(&entries, SectorId::END, 16);
        let (decoded_entries, next) = decode_sector(&bytes);
        assert_eq!(decoded_entries, vec![SectorId(3), SectorId(4), SectorId::FREE]);
        assert_eq!(next, SectorId::END);
    }
}
