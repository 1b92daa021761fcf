//! Translates sector identifiers to byte offsets, reads and writes raw sectors,
//! and grows the backing device.
//!
//! Offset arithmetic grounded on `oonxt-rust-ole/src/ole.rs` (`Ole::sector_bytes`)
//! and `AppAppWorks-ole_kit/src/cfb.rs` (`Cfb::sector_bytes`, `SectorNumber::byte_offset`),
//! both of which compute `header_len + (sector_index + 1) * sector_size`.

use crate::common::{SectorId, HEADER_LEN};
use crate::device::Device;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::error::CfbResult;

/// Reads and writes fixed-size sectors against a `Device`, and tracks how many
/// sectors currently exist.
#[derive(Debug, Clone, Copy)]
pub struct SectorStore {
    sector_size: u32,
}

impl SectorStore {
    pub fn new(sector_size: u32) -> Self {
        SectorStore { sector_size }
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn entries_per_sector(&self) -> usize {
        self.sector_size as usize / 4
    }

    /// `sector_offset(id) = 512 + id * sector_size`, per spec §4.2. Only valid for
    /// a regular (non-sentinel) id.
    pub fn offset(&self, id: SectorId) -> u64 {
        let index = id.index().expect("offset() requires a regular sector id");
        HEADER_LEN as u64 + index as u64 * self.sector_size as u64
    }

    /// Number of whole sectors currently stored on the device.
    pub fn sector_count(&self, device: &mut dyn Device) -> CfbResult<u32> {
        let len = device.len()?;
        if len < HEADER_LEN as u64 {
            return Ok(0);
        }
        Ok(((len - HEADER_LEN as u64) / self.sector_size as u64) as u32)
    }

    /// Reads one sector's worth of bytes. A read that runs past the device's end
    /// is zero-filled and reported as `TruncatedWarning`, per spec §4.2 and §7.
    pub fn read_sector(
        &self,
        device: &mut dyn Device,
        id: SectorId,
        sink: &dyn DiagnosticSink,
    ) -> CfbResult<Vec<u8>> {
        let mut buf = vec![0u8; self.sector_size as usize];
        let offset = self.offset(id);
        let n = device.read_at(offset, &mut buf)?;
        if n < buf.len() {
            sink.report(Diagnostic::new(
                DiagnosticKind::TruncatedWarning,
                format!("sector {id} truncated: read {n} of {} bytes", buf.len()),
            ))?;
        }
        Ok(buf)
    }

    /// Writes exactly one sector's worth of bytes, padding or truncating `data` to
    /// the configured sector size.
    pub fn write_sector(&self, device: &mut dyn Device, id: SectorId, data: &[u8]) -> CfbResult<()> {
        let mut buf = vec![0u8; self.sector_size as usize];
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        device.write_at(self.offset(id), &buf)?;
        Ok(())
    }

    /// Appends one freshly zero-filled sector to the device and returns its id.
    pub fn append_sector(&self, device: &mut dyn Device) -> CfbResult<SectorId> {
        let count = self.sector_count(device)?;
        let new_len = HEADER_LEN as u64 + (count as u64 + 1) * self.sector_size as u64;
        device.set_len(new_len)?;
        Ok(SectorId(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::diagnostics::LogSink;

    #[test]
    fn append_and_read_sector_round_trips() {
        let store = SectorStore::new(512);
        let mut dev = MemDevice::new();
        let id = store.append_sector(&mut dev).unwrap();
        assert_eq!(id, SectorId(0));
        store.write_sector(&mut dev, id, &[7u8; 512]).unwrap();
        let bytes = store.read_sector(&mut dev, id, &LogSink).unwrap();
        assert_eq!(bytes, vec![7u8; 512]);
    }

    #[test]
    fn read_past_end_is_zero_filled() {
        let store = SectorStore::new(512);
        let mut dev = MemDevice::new();
        dev.set_len(600).unwrap();
        let bytes = store.read_sector(&mut dev, SectorId(0), &LogSink).unwrap();
        assert_eq!(bytes.len(), 512);
        assert!(bytes.iter().skip(88).all(|&b| b == 0));
    }
}
