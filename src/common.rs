//! Primitive semantic types shared by every layer: sector identifiers, directory
//! identifiers, and the sector-size/version vocabulary of the format.
//!
//! Grounded on `oonxt-rust-ole/src/common.rs` (`SectorType` and its sentinel
//! constants), kept as a thin newtype over `u32` rather than a `binrw` enum: the
//! allocator needs ordinary integer arithmetic over sector ids far more often than
//! it needs to pattern-match a sentinel.

use binrw::{BinRead, BinWrite};

/// `REGSECT` 0x00000000 – 0xFFFFFFF9: a regular, in-range sector number.
pub const MAX_REG_SECT: u32 = 0xFFFF_FFFA;
/// Reserved for future use; never produced by this crate, tolerated on read.
pub const NOT_APPLICABLE: u32 = 0xFFFF_FFFB;
/// Marks a sector as holding DIFAT content in the FAT table.
pub const DIF_SECT: u32 = 0xFFFF_FFFC;
/// Marks a sector as holding FAT content in the FAT table.
pub const FAT_SECT: u32 = 0xFFFF_FFFD;
/// Terminates a sector chain.
pub const END_OF_CHAIN: u32 = 0xFFFF_FFFE;
/// An unallocated sector in the FAT, MiniFAT, or DIFAT.
pub const FREE_SECT: u32 = 0xFFFF_FFFF;

/// A sector identifier: either a regular sector index, or one of the reserved
/// sentinel values defined by the format (see the constants above).
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[brw(little)]
pub struct SectorId(pub u32);

impl SectorId {
    pub const FREE: SectorId = SectorId(FREE_SECT);
    pub const END: SectorId = SectorId(END_OF_CHAIN);
    pub const FAT: SectorId = SectorId(FAT_SECT);
    pub const DIF: SectorId = SectorId(DIF_SECT);

    #[inline]
    pub fn is_free(self) -> bool {
        self.0 == FREE_SECT
    }

    #[inline]
    pub fn is_end(self) -> bool {
        self.0 == END_OF_CHAIN
    }

    #[inline]
    pub fn is_fat_sect(self) -> bool {
        self.0 == FAT_SECT
    }

    #[inline]
    pub fn is_dif_sect(self) -> bool {
        self.0 == DIF_SECT
    }

    /// True for an ordinary, addressable sector index (not a sentinel).
    /// `MAXREGSECT` itself (0xFFFFFFFA) is the boundary value, not a valid index —
    /// regular sectors run `0x00000000..=0xFFFFFFF9`.
    #[inline]
    pub fn is_regular(self) -> bool {
        self.0 < MAX_REG_SECT
    }

    #[inline]
    pub fn index(self) -> Option<u32> {
        self.is_regular().then_some(self.0)
    }
}

impl From<u32> for SectorId {
    fn from(value: u32) -> Self {
        SectorId(value)
    }
}

impl From<SectorId> for u32 {
    fn from(value: SectorId) -> Self {
        value.0
    }
}

impl std::fmt::Display for SectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            MAX_REG_SECT => write!(f, "MAXREGSECT"),
            NOT_APPLICABLE => write!(f, "NOTAPPLICABLE"),
            DIF_SECT => write!(f, "DIFSECT"),
            FAT_SECT => write!(f, "FATSECT"),
            END_OF_CHAIN => write!(f, "ENDOFCHAIN"),
            FREE_SECT => write!(f, "FREESECT"),
            regular => write!(f, "{regular}"),
        }
    }
}

/// A directory identifier: a dense index into the directory entry sequence, or
/// `NOSTREAM` meaning "no such child".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(pub u32);

impl DirId {
    pub const NOSTREAM: DirId = DirId(0xFFFF_FFFF);
    pub const ROOT: DirId = DirId(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NOSTREAM
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for DirId {
    fn from(value: u32) -> Self {
        DirId(value)
    }
}

impl From<DirId> for u32 {
    fn from(value: DirId) -> Self {
        value.0
    }
}

/// Which allocation pool a chain lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Normal,
    Mini,
}

/// The CFB major version, which fixes the regular sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorVersion {
    V3,
    V4,
}

impl MajorVersion {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            3 => Some(MajorVersion::V3),
            4 => Some(MajorVersion::V4),
            _ => None,
        }
    }

    pub fn number(self) -> u16 {
        match self {
            MajorVersion::V3 => 3,
            MajorVersion::V4 => 4,
        }
    }

    pub fn sector_shift(self) -> u16 {
        match self {
            MajorVersion::V3 => 9,
            MajorVersion::V4 => 12,
        }
    }

    pub fn sector_size(self) -> u32 {
        1u32 << self.sector_shift()
    }
}

pub const MINI_SECTOR_SHIFT: u16 = 6;
pub const MINI_SECTOR_SIZE: u32 = 1 << MINI_SECTOR_SHIFT;
pub const DEFAULT_MINI_CUTOFF: u32 = 4096;
pub const DIR_ENTRY_LEN: usize = 128;
pub const HEADER_LEN: usize = 512;
pub const INLINE_DIFAT_LEN: usize = 109;

/// Case-insensitive, length-first ordering key for directory entry names, per the
/// red-black tree ordering rule: compare first by UTF-16 code-unit length, then by
/// the simple upper-case mapping of the UTF-16 code units.
pub fn name_order_key(name: &str) -> (usize, Vec<u16>) {
    let units: Vec<u16> = name.encode_utf16().collect();
    let upper: Vec<u16> = char::decode_utf16(units.iter().copied())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .flat_map(|c| c.to_uppercase())
        .flat_map(|c| {
            let mut buf = [0u16; 2];
            c.encode_utf16(&mut buf).to_vec()
        })
        .collect();
    (units.len(), upper)
}

/// Compares two names using the storage ordering rule (length, then upper-cased
/// UTF-16 code units).
pub fn name_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    name_order_key(a).cmp(&name_order_key(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_id_sentinels() {
        assert!(SectorId::FREE.is_free());
        assert!(SectorId::END.is_end());
        assert!(SectorId::FAT.is_fat_sect());
        assert!(SectorId::DIF.is_dif_sect());
        assert!(!SectorId(0).is_free());
        assert!(SectorId(0).is_regular());
        assert!(SectorId(MAX_REG_SECT - 1).is_regular());
        assert!(!SectorId(MAX_REG_SECT).is_regular());
        assert!(!SectorId(MAX_REG_SECT + 1).is_regular());
    }

    #[test]
    fn name_ordering_is_length_then_case_insensitive() {
        assert_eq!(name_cmp("aa", "bbb"), std::cmp::Ordering::Less);
        assert_eq!(name_cmp("abc", "ABC"), std::cmp::Ordering::Equal);
        assert_eq!(name_cmp("aa", "ab"), std::cmp::Ordering::Less);
    }
}
