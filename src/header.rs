//! Codec for the fixed 512-byte file header.
//!
//! Grounded on `oonxt-rust-ole/src/header.rs`'s `binrw`-derived `Header` struct
//! (kept the exact field order and the `binrw` derive, dropped its use of
//! `#[brw(magic(...))]` per field since a magic mismatch there is a hard parse
//! error and most of these fields are recoverable-diagnostic territory per spec
//! §4.1, not fatal-abort territory).

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};

use crate::common::{
    MajorVersion, SectorId, DEFAULT_MINI_CUTOFF, HEADER_LEN, INLINE_DIFAT_LEN, MINI_SECTOR_SHIFT,
};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::error::{CfbError, CfbResult};

/// `D0 CF 11 E0 A1 B1 1A E1`, per spec §6.
pub const MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// The wire-format header, minus its leading 8-byte magic (checked separately so
/// a bad magic can short-circuit before `binrw` is invoked at all).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct HeaderRaw {
    clsid: [u8; 16],
    minor_version: u16,
    major_version: u16,
    byte_order: u16,
    sector_shift: u16,
    mini_sector_shift: u16,
    reserved: [u8; 6],
    num_directory_sectors: u32,
    num_fat_sectors: u32,
    first_directory_sector: u32,
    transaction_signature: u32,
    mini_stream_cutoff: u32,
    first_minifat_sector: u32,
    num_minifat_sectors: u32,
    first_difat_sector: u32,
    num_difat_sectors: u32,
    #[br(count = INLINE_DIFAT_LEN)]
    difat: Vec<u32>,
}

/// The friendly, validated header, as used by the rest of the crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: MajorVersion,
    pub minor_version: u16,
    /// The on-disk sector-size exponent, trusted as-is even when it disagrees
    /// with what `version` would normally imply (see spec §9's resolved open
    /// question on `mini_cutoff`, which applies the same "trust the header"
    /// policy to sector sizing).
    pub sector_shift: u16,
    pub num_directory_sectors: u32,
    pub num_fat_sectors: u32,
    pub first_directory_sector: SectorId,
    /// Effective mini-stream cutoff. Honored as-is even when it differs from the
    /// standard 4096, per the resolved open question in spec §9.
    pub mini_stream_cutoff: u32,
    pub first_minifat_sector: SectorId,
    pub num_minifat_sectors: u32,
    pub first_difat_sector: SectorId,
    pub num_difat_sectors: u32,
    pub inline_difat: [SectorId; INLINE_DIFAT_LEN],
}

impl Header {
    pub fn sector_size(&self) -> u32 {
        1u32 << self.sector_shift
    }

    /// Builds the header for a freshly created, empty container. The caller fills
    /// in the directory/FAT/DIFAT locations once those sectors have been
    /// allocated.
    pub fn new_empty(options: CreateOptions) -> Header {
        Header {
            version: options.version,
            minor_version: 0x003E,
            sector_shift: options.version.sector_shift(),
            num_directory_sectors: 0,
            num_fat_sectors: 0,
            first_directory_sector: SectorId::END,
            mini_stream_cutoff: options.mini_cutoff,
            first_minifat_sector: SectorId::END,
            num_minifat_sectors: 0,
            first_difat_sector: SectorId::END,
            num_difat_sectors: 0,
            inline_difat: [SectorId::FREE; INLINE_DIFAT_LEN],
        }
    }
}

/// Chooses the CFB version and mini-stream cutoff for a freshly created
/// container, mirroring the handful of knobs the header format actually exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub version: MajorVersion,
    pub mini_cutoff: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            version: MajorVersion::V3,
            mini_cutoff: DEFAULT_MINI_CUTOFF,
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: MajorVersion) -> Self {
        self.version = version;
        self
    }

    pub fn mini_cutoff(mut self, cutoff: u32) -> Self {
        self.mini_cutoff = cutoff;
        self
    }
}

/// Parses a 512-byte header, validating in the order spec §4.1 prescribes.
/// Magic, BOM, and an unrecognized major version are fatal; everything else is a
/// diagnostic and decoding continues with the on-disk value.
pub fn decode(bytes: &[u8], sink: &dyn DiagnosticSink) -> CfbResult<Header> {
    if bytes.len() < HEADER_LEN {
        return Err(CfbError::Header);
    }
    if bytes[..8] != MAGIC {
        return Err(CfbError::InvalidMagic);
    }

    let raw = HeaderRaw::read_le(&mut Cursor::new(&bytes[8..HEADER_LEN]))?;

    if raw.byte_order != 0xFFFE {
        return Err(CfbError::InvalidBom);
    }

    let version = MajorVersion::from_number(raw.major_version).ok_or(CfbError::Header)?;

    if raw.sector_shift != version.sector_shift() {
        sink.report(Diagnostic::new(
            DiagnosticKind::SectorSizeWarning,
            format!(
                "sector shift {} does not match version {}'s expected {}",
                raw.sector_shift,
                version.number(),
                version.sector_shift()
            ),
        ))?;
    }

    if raw.mini_sector_shift != MINI_SECTOR_SHIFT {
        sink.report(Diagnostic::new(
            DiagnosticKind::SectorSizeWarning,
            format!(
                "mini sector shift {} differs from the fixed value {MINI_SECTOR_SHIFT}",
                raw.mini_sector_shift
            ),
        ))?;
    }

    if raw.mini_stream_cutoff != DEFAULT_MINI_CUTOFF {
        sink.report(Diagnostic::new(
            DiagnosticKind::HeaderWarning,
            format!(
                "mini stream cutoff {} differs from the standard {DEFAULT_MINI_CUTOFF}; honoring it as the effective cutoff",
                raw.mini_stream_cutoff
            ),
        ))?;
    }

    if raw.reserved != [0u8; 6] {
        sink.report(Diagnostic::new(
            DiagnosticKind::HeaderWarning,
            "reserved header bytes are not zero".to_string(),
        ))?;
    }

    if raw.minor_version != 0x003E {
        sink.report(Diagnostic::new(
            DiagnosticKind::VersionWarning,
            format!("unexpected minor version {:#06x}", raw.minor_version),
        ))?;
    }

    let mut inline_difat = [SectorId::FREE; INLINE_DIFAT_LEN];
    for (slot, &value) in inline_difat.iter_mut().zip(raw.difat.iter()) {
        *slot = SectorId(value);
    }

    Ok(Header {
        version,
        minor_version: raw.minor_version,
        sector_shift: raw.sector_shift,
        num_directory_sectors: raw.num_directory_sectors,
        num_fat_sectors: raw.num_fat_sectors,
        first_directory_sector: SectorId(raw.first_directory_sector),
        mini_stream_cutoff: raw.mini_stream_cutoff,
        first_minifat_sector: SectorId(raw.first_minifat_sector),
        num_minifat_sectors: raw.num_minifat_sectors,
        first_difat_sector: SectorId(raw.first_difat_sector),
        num_difat_sectors: raw.num_difat_sectors,
        inline_difat,
    })
}

/// Serializes a header back into its canonical 512-byte wire form. Fields this
/// crate never mutates on its own (CLSID, transaction signature, mini-sector
/// shift, reserved bytes) are always written at their canonical value.
pub fn encode(header: &Header) -> CfbResult<Vec<u8>> {
    let raw = HeaderRaw {
        clsid: [0u8; 16],
        minor_version: header.minor_version,
        major_version: header.version.number(),
        byte_order: 0xFFFE,
        sector_shift: header.sector_shift,
        mini_sector_shift: MINI_SECTOR_SHIFT,
        reserved: [0u8; 6],
        num_directory_sectors: header.num_directory_sectors,
        num_fat_sectors: header.num_fat_sectors,
        first_directory_sector: header.first_directory_sector.0,
        transaction_signature: 0,
        mini_stream_cutoff: header.mini_stream_cutoff,
        first_minifat_sector: header.first_minifat_sector.0,
        num_minifat_sectors: header.num_minifat_sectors,
        first_difat_sector: header.first_difat_sector.0,
        num_difat_sectors: header.num_difat_sectors,
        difat: header.inline_difat.iter().map(|id| id.0).collect(),
    };

    let mut body = Cursor::new(Vec::with_capacity(HEADER_LEN - 8));
    raw.write_le(&mut body)?;

    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&body.into_inner());
    out.resize(HEADER_LEN, 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{CollectingSink, LogSink};

    fn sample() -> Header {
        Header::new_empty(CreateOptions::default())
    }

    #[test]
    fn round_trips_through_bytes() {
        let header = sample();
        let bytes = encode(&header).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = decode(&bytes, &LogSink).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = 0;
        let err = decode(&bytes, &LogSink).unwrap_err();
        assert!(matches!(err, CfbError::InvalidMagic));
    }

    #[test]
    fn rejects_bad_bom() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[28] = 0;
        bytes[29] = 0;
        let err = decode(&bytes, &LogSink).unwrap_err();
        assert!(matches!(err, CfbError::InvalidBom));
    }

    #[test]
    fn nonstandard_cutoff_is_a_diagnostic_not_fatal() {
        let mut header = sample();
        header.mini_stream_cutoff = 8192;
        let bytes = encode(&header).unwrap();
        let sink = CollectingSink::new();
        let decoded = decode(&bytes, &sink).unwrap();
        assert_eq!(decoded.mini_stream_cutoff, 8192);
        let diagnostics = sink.take();
        assert!(diagnostics.iter().any(|d| d.kind == DiagnosticKind::HeaderWarning));
    }

    #[test]
    fn version4_uses_larger_sector_shift() {
        let header = Header::new_empty(CreateOptions::default().version(MajorVersion::V4));
        assert_eq!(header.sector_size(), 4096);
    }
}
