//! Presents a sector chain as a seekable byte stream, routes reads and writes
//! through the Allocator, and migrates a chain between the normal and mini pools
//! when its size crosses the cutoff.
//!
//! Grounded on `oonxt-rust-ole/src/ole.rs`'s `get_stream_data`/`get_mini_stream_data`
//! (which gather a chain's sectors and slice out the logical byte range), extended
//! from read-only gathering to a full seekable read/write/extend/truncate surface
//! per spec §4.4, since the teacher never mutates a container.

use crate::alloc::{pool_for_size, Allocator};
use crate::common::{Pool, SectorId, MINI_SECTOR_SIZE};
use crate::device::Device;
use crate::error::CfbResult;
use crate::sector::SectorStore;

/// A seekable view over one directory entry's sector chain.
///
/// Holds no owned bytes: every read/write goes straight through the `Allocator`
/// and `Device` it borrows, so several `ChainStream`s can be opened against the
/// same container without duplicating state (though not concurrently mutated,
/// per spec §5).
pub struct ChainStream<'a> {
    alloc: &'a mut Allocator,
    device: &'a mut dyn Device,
    sectors: &'a SectorStore,
    start: SectorId,
    pool: Pool,
    size: u64,
    cutoff: u32,
    pos: u64,
}

impl<'a> ChainStream<'a> {
    /// Opens a stream view over `start`/`size`/`pool` as currently recorded on the
    /// owning directory entry.
    pub fn open(
        alloc: &'a mut Allocator,
        device: &'a mut dyn Device,
        sectors: &'a SectorStore,
        start: SectorId,
        size: u64,
        pool: Pool,
        cutoff: u32,
    ) -> Self {
        ChainStream {
            alloc,
            device,
            sectors,
            start,
            pool,
            size,
            cutoff,
            pos: 0,
        }
    }

    pub fn start(&self) -> SectorId {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    fn unit_size(&self) -> u64 {
        match self.pool {
            Pool::Normal => self.sectors.sector_size() as u64,
            Pool::Mini => MINI_SECTOR_SIZE as u64,
        }
    }

    /// Seeks to an absolute byte offset from the start of the stream. Seeking past
    /// `size` is allowed; the next write will extend the chain to cover the gap.
    pub fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    /// Reads up to `buf.len()` bytes starting at the current position, returning
    /// the number of bytes actually read. A read that runs past `size` returns
    /// fewer bytes than requested, per spec §7 — it is not an error.
    pub fn read(&mut self, buf: &mut [u8]) -> CfbResult<usize> {
        if self.pos >= self.size || !self.start.is_regular() {
            return Ok(0);
        }
        let available = (self.size - self.pos).min(buf.len() as u64) as usize;
        if available == 0 {
            return Ok(0);
        }

        let unit = self.unit_size();
        let chain = self.alloc.chain(self.start, self.pool)?;
        let mut read_total = 0;
        let mut remaining = available;
        let mut pos = self.pos;

        while remaining > 0 {
            let unit_index = (pos / unit) as usize;
            let unit_offset = (pos % unit) as usize;
            let Some(&sector_id) = chain.get(unit_index) else {
                break;
            };
            let raw = self.read_unit(sector_id)?;
            let take = (unit as usize - unit_offset).min(remaining);
            buf[read_total..read_total + take].copy_from_slice(&raw[unit_offset..unit_offset + take]);
            read_total += take;
            remaining -= take;
            pos += take as u64;
        }

        self.pos += read_total as u64;
        Ok(read_total)
    }

    /// Reads the entire stream from offset 0, ignoring the current cursor.
    pub fn read_all(&mut self) -> CfbResult<Vec<u8>> {
        let saved = self.pos;
        self.pos = 0;
        let mut buf = vec![0u8; self.size as usize];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        self.pos = saved;
        Ok(buf)
    }

    /// Writes `data` at the current position, extending the chain (and migrating
    /// pools if the write pushes `size` across the cutoff) as needed. Advances the
    /// cursor by `data.len()`.
    pub fn write(&mut self, data: &[u8]) -> CfbResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = self.pos + data.len() as u64;
        let new_size = end.max(self.size);
        let crosses_cutoff = pool_for_size(self.size, self.cutoff) != pool_for_size(new_size, self.cutoff);

        if crosses_cutoff {
            self.migrate(pool_for_size(new_size, self.cutoff))?;
        }

        self.ensure_capacity(end)?;

        let unit = self.unit_size();
        let chain = self.alloc.chain(self.start, self.pool)?;
        let mut written = 0;
        let mut pos = self.pos;

        while written < data.len() {
            let unit_index = (pos / unit) as usize;
            let unit_offset = (pos % unit) as usize;
            let sector_id = chain[unit_index];
            let mut raw = self.read_unit(sector_id)?;
            let take = (unit as usize - unit_offset).min(data.len() - written);
            raw[unit_offset..unit_offset + take].copy_from_slice(&data[written..written + take]);
            self.write_unit(sector_id, &raw)?;
            written += take;
            pos += take as u64;
        }

        self.pos += data.len() as u64;
        self.size = new_size;
        Ok(())
    }

    /// Sets the logical size of the stream, allocating or freeing whole units (and
    /// migrating pools if the new size crosses the cutoff) as needed.
    pub fn set_length(&mut self, new_size: u64) -> CfbResult<()> {
        let target_pool = pool_for_size(new_size, self.cutoff);
        if target_pool != pool_for_size(self.size, self.cutoff) {
            self.migrate(target_pool)?;
        }

        let unit = self.unit_size();
        let needed_units = units_for(new_size, unit);

        if new_size == 0 {
            self.alloc.free(self.start, self.pool)?;
            self.start = SectorId::END;
        } else if self.start.is_regular() {
            let current_units = self.alloc.chain(self.start, self.pool)?.len() as u32;
            if needed_units > current_units {
                self.alloc
                    .extend(self.start, needed_units - current_units, self.pool, self.device)?;
            } else if needed_units < current_units {
                self.start = self.alloc.truncate(self.start, needed_units, self.pool)?;
            }
        } else {
            self.start = self.alloc.allocate(needed_units, self.pool, self.device)?;
        }

        self.size = new_size;
        if self.pos > new_size {
            self.pos = new_size;
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, end: u64) -> CfbResult<()> {
        let unit = self.unit_size();
        let needed_units = units_for(end, unit);

        if !self.start.is_regular() {
            self.start = self.alloc.allocate(needed_units.max(1), self.pool, self.device)?;
            return Ok(());
        }

        let current_units = self.alloc.chain(self.start, self.pool)?.len() as u32;
        if needed_units > current_units {
            self.alloc
                .extend(self.start, needed_units - current_units, self.pool, self.device)?;
        }
        Ok(())
    }

    /// Migrates the stream's existing content into `target_pool`, freeing the old
    /// chain. Happens eagerly, the moment a write or resize crosses the cutoff —
    /// never deferred to flush, per spec §4.4.
    fn migrate(&mut self, target_pool: Pool) -> CfbResult<()> {
        if target_pool == self.pool {
            return Ok(());
        }

        let content = if self.start.is_regular() {
            let saved_pos = self.pos;
            self.pos = 0;
            let bytes = self.read_all_current_pool()?;
            self.pos = saved_pos;
            bytes
        } else {
            Vec::new()
        };

        let old_start = self.start;
        let old_pool = self.pool;

        self.pool = target_pool;
        self.start = SectorId::END;
        if !content.is_empty() {
            let unit = self.unit_size();
            let units = units_for(content.len() as u64, unit);
            self.start = self.alloc.allocate(units, self.pool, self.device)?;
            let chain = self.alloc.chain(self.start, self.pool)?;
            for (i, sector_id) in chain.iter().enumerate() {
                let lo = i * unit as usize;
                let hi = (lo + unit as usize).min(content.len());
                let mut raw = vec![0u8; unit as usize];
                raw[..hi - lo].copy_from_slice(&content[lo..hi]);
                self.write_unit(*sector_id, &raw)?;
            }
        }

        self.alloc.free(old_start, old_pool)?;
        Ok(())
    }

    fn read_all_current_pool(&mut self) -> CfbResult<Vec<u8>> {
        let unit = self.unit_size();
        let chain = self.alloc.chain(self.start, self.pool)?;
        let mut out = Vec::with_capacity(self.size as usize);
        for &sector_id in &chain {
            out.extend_from_slice(&self.read_unit(sector_id)?);
        }
        out.truncate(self.size as usize);
        Ok(out)
    }

    fn read_unit(&mut self, id: SectorId) -> CfbResult<Vec<u8>> {
        use crate::diagnostics::LogSink;
        match self.pool {
            Pool::Normal => self.sectors.read_sector(self.device, id, &LogSink),
            Pool::Mini => self.read_mini_unit(id),
        }
    }

    fn write_unit(&mut self, id: SectorId, data: &[u8]) -> CfbResult<()> {
        match self.pool {
            Pool::Normal => self.sectors.write_sector(self.device, id, data),
            Pool::Mini => self.write_mini_unit(id, data),
        }
    }

    /// Mini sectors are 64-byte slices inside the root's mini-stream, which is
    /// itself a normal-pool chain. Locating one requires walking the mini-stream
    /// chain to the containing normal sector, then slicing into it.
    fn read_mini_unit(&mut self, id: SectorId) -> CfbResult<Vec<u8>> {
        use crate::diagnostics::LogSink;
        let sector_size = self.sectors.sector_size();
        let units_per_sector = (sector_size / MINI_SECTOR_SIZE) as usize;
        let index = id.index().expect("regular mini sector id") as usize;
        let mini_chain = self.alloc.chain(self.alloc.mini_stream_start(), Pool::Normal)?;
        let normal_sector = mini_chain[index / units_per_sector];
        let raw = self.sectors.read_sector(self.device, normal_sector, &LogSink)?;
        let offset = (index % units_per_sector) * MINI_SECTOR_SIZE as usize;
        Ok(raw[offset..offset + MINI_SECTOR_SIZE as usize].to_vec())
    }

    fn write_mini_unit(&mut self, id: SectorId, data: &[u8]) -> CfbResult<()> {
        use crate::diagnostics::LogSink;
        let sector_size = self.sectors.sector_size();
        let units_per_sector = (sector_size / MINI_SECTOR_SIZE) as usize;
        let index = id.index().expect("regular mini sector id") as usize;
        let mini_chain = self.alloc.chain(self.alloc.mini_stream_start(), Pool::Normal)?;
        let normal_sector = mini_chain[index / units_per_sector];
        let mut raw = self.sectors.read_sector(self.device, normal_sector, &LogSink)?;
        let offset = (index % units_per_sector) * MINI_SECTOR_SIZE as usize;
        raw[offset..offset + MINI_SECTOR_SIZE as usize].copy_from_slice(data);
        self.sectors.write_sector(self.device, normal_sector, &raw)
    }
}

fn units_for(size: u64, unit: u64) -> u32 {
    ((size + unit - 1) / unit) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn setup() -> (Allocator, MemDevice, SectorStore) {
        let sectors = SectorStore::new(512);
        let mut dev = MemDevice::new();
        let alloc = Allocator::new_empty(sectors, &mut dev).unwrap();
        (alloc, dev, sectors)
    }

    #[test]
    fn write_then_read_back_small_stream() {
        let (mut alloc, mut dev, sectors) = setup();
        let mut stream = ChainStream::open(&mut alloc, &mut dev, &sectors, SectorId::END, 0, Pool::Mini, 4096);
        stream.write(b"hello").unwrap();
        assert_eq!(stream.size(), 5);
        stream.seek(0);
        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_crossing_cutoff_migrates_to_normal_pool() {
        let (mut alloc, mut dev, sectors) = setup();
        let mut stream = ChainStream::open(&mut alloc, &mut dev, &sectors, SectorId::END, 0, Pool::Mini, 4096);
        let data = vec![0xABu8; 5000];
        stream.write(&data).unwrap();
        assert_eq!(stream.pool(), Pool::Normal);
        assert_eq!(stream.size(), 5000);
        stream.seek(0);
        let mut buf = vec![0u8; 5000];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 5000);
        assert_eq!(buf, data);
    }

    #[test]
    fn read_past_size_returns_short() {
        let (mut alloc, mut dev, sectors) = setup();
        let mut stream = ChainStream::open(&mut alloc, &mut dev, &sectors, SectorId::END, 0, Pool::Mini, 4096);
        stream.write(b"hi").unwrap();
        stream.seek(0);
        let mut buf = [0u8; 10];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn set_length_zero_frees_chain() {
        let (mut alloc, mut dev, sectors) = setup();
        let mut stream = ChainStream::open(&mut alloc, &mut dev, &sectors, SectorId::END, 0, Pool::Mini, 4096);
        stream.write(b"hello").unwrap();
        stream.set_length(0).unwrap();
        assert_eq!(stream.size(), 0);
        assert_eq!(stream.start(), SectorId::END);
    }
}
