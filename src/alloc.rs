//! Owns the FAT, DIFAT, and MiniFAT, and allocates/frees sector chains in both
//! pools.
//!
//! Grounded on `oonxt-rust-ole/src/ole.rs`'s `parse_difat`/`parse_fat`/`parse_mini_fat`
//! (which walk the DIFAT chain, then the FAT-named sectors, then the MiniFAT chain
//! via the FAT) for the *load* direction; the *allocate/grow* direction has no
//! teacher counterpart (the teacher is read-only) and is grounded instead on the
//! invariants spelled out in spec §4.3: a FAT-holding sector's own table slot is
//! set to `FATSECT`, a DIFAT overflow sector's own slot is set to `DIFSECT`, and the
//! DIFAT's 109 inline header slots overflow into chained DIFAT sectors via each
//! sector's trailing pointer.

use crate::common::{Pool, SectorId, INLINE_DIFAT_LEN, MINI_SECTOR_SIZE};
use crate::device::Device;
use crate::difat;
use crate::error::{CfbError, CfbResult};
use crate::fat;
use crate::mini_fat;
use crate::sector::SectorStore;

/// In-memory FAT/DIFAT/MiniFAT state, with the chain-walking and allocation logic
/// of spec §4.3.
#[derive(Debug, Clone)]
pub struct Allocator {
    sectors: SectorStore,
    /// Dense FAT: `fat[i]` is the entry for regular sector `i`.
    fat: Vec<SectorId>,
    /// Sectors (in table order) that currently hold FAT content.
    fat_sectors: Vec<SectorId>,
    /// DIFAT overflow sectors, in chain order (does not include the 109 inline
    /// header slots).
    difat_sectors: Vec<SectorId>,
    /// Dense MiniFAT: `mini_fat[i]` is the entry for mini-sector `i`.
    mini_fat: Vec<SectorId>,
    /// First sector of the MiniFAT's own chain (`ENDOFCHAIN` until first created).
    minifat_start: SectorId,
    /// First sector of the mini-stream (owned by the root entry).
    mini_stream_start: SectorId,
    /// Size of the mini-stream in mini-sectors.
    mini_stream_sectors: u32,
}

impl Allocator {
    /// Builds the allocator for a freshly created, empty container: one FAT
    /// sector (itself marked `FATSECT`), no MiniFAT, no mini-stream.
    pub fn new_empty(sectors: SectorStore, device: &mut dyn Device) -> CfbResult<Self> {
        let mut alloc = Allocator {
            sectors,
            fat: Vec::new(),
            fat_sectors: Vec::new(),
            difat_sectors: Vec::new(),
            mini_fat: Vec::new(),
            minifat_start: SectorId::END,
            mini_stream_start: SectorId::END,
            mini_stream_sectors: 0,
        };
        alloc.grow_normal_capacity(device)?;
        Ok(alloc)
    }

    /// Loads allocator state from an existing container: walks the DIFAT to find
    /// every FAT sector, decodes the FAT, then (if present) walks the FAT to find
    /// the MiniFAT chain and decodes the MiniFAT.
    pub fn load(
        sectors: SectorStore,
        device: &mut dyn Device,
        inline_difat: &[SectorId; INLINE_DIFAT_LEN],
        first_difat_sector: SectorId,
        num_difat_sectors: u32,
        num_fat_sectors: u32,
        first_minifat_sector: SectorId,
        mini_stream_start: SectorId,
        mini_stream_size: u64,
    ) -> CfbResult<Self> {
        let mut fat_sectors = Vec::new();
        for &id in inline_difat.iter() {
            if id.is_regular() {
                fat_sectors.push(id);
            }
        }

        let mut difat_sectors = Vec::new();
        if first_difat_sector.is_regular() {
            let mut current = first_difat_sector;
            let mut seen = std::collections::HashSet::new();
            while current.is_regular() {
                if !seen.insert(current) {
                    return Err(CfbError::MasterLoop);
                }
                difat_sectors.push(current);
                let bytes = device_read_sector(&sectors, device, current)?;
                let (entries, next) = difat::decode_sector(&bytes);
                for id in entries {
                    if id.is_regular() {
                        fat_sectors.push(id);
                    }
                }
                current = next;
            }
        }

        // The actual walked counts win over the header's counts per spec §4.3;
        // a mismatch is the caller's diagnostic to raise, not ours to enforce.
        let _ = (num_difat_sectors, num_fat_sectors);

        let mut fat = Vec::new();
        for &id in &fat_sectors {
            let bytes = device_read_sector(&sectors, device, id)?;
            fat.extend(fat::decode_sector(&bytes));
        }

        let mut mini_fat = Vec::new();
        let minifat_start = first_minifat_sector;
        if minifat_start.is_regular() {
            let chain = walk_chain(&fat, minifat_start, CfbError::NormalLoop)?;
            for id in chain {
                let bytes = device_read_sector(&sectors, device, id)?;
                mini_fat.extend(mini_fat::decode_sector(&bytes));
            }
        }

        let mini_stream_sectors = (mini_stream_size / MINI_SECTOR_SIZE as u64) as u32;

        Ok(Allocator {
            sectors,
            fat,
            fat_sectors,
            difat_sectors,
            mini_fat,
            minifat_start,
            mini_stream_start,
            mini_stream_sectors,
        })
    }

    pub fn sector_size(&self) -> u32 {
        self.sectors.sector_size()
    }

    pub fn fat_sectors(&self) -> &[SectorId] {
        &self.fat_sectors
    }

    pub fn difat_sectors(&self) -> &[SectorId] {
        &self.difat_sectors
    }

    pub fn minifat_start(&self) -> SectorId {
        self.minifat_start
    }

    pub fn mini_stream_start(&self) -> SectorId {
        self.mini_stream_start
    }

    pub fn set_mini_stream_start(&mut self, start: SectorId) {
        self.mini_stream_start = start;
    }

    /// Records the mini-stream's length in mini-sectors, derived from the root
    /// entry's `size` once the directory has been loaded (unknown at `load()`
    /// time, since the directory chain itself requires the FAT to already be
    /// decoded).
    pub fn set_mini_stream_len(&mut self, size_bytes: u64) {
        self.mini_stream_sectors = (size_bytes / MINI_SECTOR_SIZE as u64) as u32;
    }

    pub fn mini_stream_size(&self) -> u64 {
        self.mini_stream_sectors as u64 * MINI_SECTOR_SIZE as u64
    }

    /// Walks a chain in the requested pool, detecting loops and out-of-range
    /// entries per spec §4.3.
    pub fn chain(&self, start: SectorId, pool: Pool) -> CfbResult<Vec<SectorId>> {
        match pool {
            Pool::Normal => walk_chain(&self.fat, start, CfbError::NormalLoop),
            Pool::Mini => walk_mini_chain(&self.mini_fat, start),
        }
    }

    /// Allocates a fresh chain of `n_sectors` sectors in `pool` and returns its
    /// start. `n_sectors = 0` returns `ENDOFCHAIN` without touching any table.
    pub fn allocate(&mut self, n_sectors: u32, pool: Pool, device: &mut dyn Device) -> CfbResult<SectorId> {
        if n_sectors == 0 {
            return Ok(SectorId::END);
        }
        self.extend(SectorId::END, n_sectors, pool, device)
    }

    /// Appends `extra_sectors` to the chain starting at `start` (or creates a new
    /// chain if `start == ENDOFCHAIN`) and returns the new start (unchanged unless
    /// the chain was freshly created).
    pub fn extend(
        &mut self,
        start: SectorId,
        extra_sectors: u32,
        pool: Pool,
        device: &mut dyn Device,
    ) -> CfbResult<SectorId> {
        if extra_sectors == 0 {
            return Ok(start);
        }

        let mut tail = if start.is_regular() {
            *self
                .chain(start, pool)?
                .last()
                .expect("non-empty chain has a tail")
        } else {
            SectorId::END
        };

        let mut new_start = start;
        for _ in 0..extra_sectors {
            let fresh = match pool {
                Pool::Normal => self.allocate_normal_sector(device)?,
                Pool::Mini => self.allocate_mini_sector(device)?,
            };
            if tail.is_regular() {
                self.set_entry(pool, tail, fresh);
            } else {
                new_start = fresh;
            }
            self.set_entry(pool, fresh, SectorId::END);
            tail = fresh;
        }

        Ok(new_start)
    }

    /// Releases every sector in the chain starting at `start`, marking each
    /// `FREESECT`.
    pub fn free(&mut self, start: SectorId, pool: Pool) -> CfbResult<()> {
        if !start.is_regular() {
            return Ok(());
        }
        let chain = self.chain(start, pool)?;
        for id in chain {
            self.set_entry(pool, id, SectorId::FREE);
        }
        Ok(())
    }

    /// Shortens the chain at `start` to `keep_sectors` sectors, freeing the rest.
    /// `keep_sectors = 0` frees the whole chain and returns `ENDOFCHAIN`.
    pub fn truncate(&mut self, start: SectorId, keep_sectors: u32, pool: Pool) -> CfbResult<SectorId> {
        if keep_sectors == 0 {
            self.free(start, pool)?;
            return Ok(SectorId::END);
        }
        let chain = self.chain(start, pool)?;
        if (chain.len() as u32) <= keep_sectors {
            return Ok(start);
        }
        let keep_idx = keep_sectors as usize - 1;
        let new_tail = chain[keep_idx];
        for &id in &chain[keep_idx + 1..] {
            self.set_entry(pool, id, SectorId::FREE);
        }
        self.set_entry(pool, new_tail, SectorId::END);
        Ok(start)
    }

    /// Writes back every FAT, DIFAT, and MiniFAT sector that currently exists.
    /// Called during the container's flush sequence.
    pub fn flush(&self, device: &mut dyn Device) -> CfbResult<()> {
        let per_sector = self.sectors.entries_per_sector();
        for (slot, &sector_id) in self.fat_sectors.iter().enumerate() {
            let lo = slot * per_sector;
            let hi = (lo + per_sector).min(self.fat.len());
            let entries = if lo < hi { &self.fat[lo..hi] } else { &[][..] };
            let bytes = fat::encode_sector(entries, self.sector_size() as usize);
            self.sectors.write_sector(device, sector_id, &bytes)?;
        }

        let minifat_per_sector = per_sector;
        if self.minifat_start.is_regular() {
            let chain = walk_chain(&self.fat, self.minifat_start, CfbError::NormalLoop)?;
            for (slot, &sector_id) in chain.iter().enumerate() {
                let lo = slot * minifat_per_sector;
                let hi = (lo + minifat_per_sector).min(self.mini_fat.len());
                let entries = if lo < hi { &self.mini_fat[lo..hi] } else { &[][..] };
                let bytes = mini_fat::encode_sector(entries, self.sector_size() as usize);
                self.sectors.write_sector(device, sector_id, &bytes)?;
            }
        }

        let difat_capacity = per_sector - 1;
        for (slot, &sector_id) in self.difat_sectors.iter().enumerate() {
            let lo = INLINE_DIFAT_LEN + slot * difat_capacity;
            let hi = (lo + difat_capacity).min(self.fat_sectors.len());
            let entries: Vec<SectorId> = if lo < hi { self.fat_sectors[lo..hi].to_vec() } else { Vec::new() };
            let next = self
                .difat_sectors
                .get(slot + 1)
                .copied()
                .unwrap_or(SectorId::END);
            let bytes = difat::encode_sector(&entries, next, self.sector_size() as usize);
            self.sectors.write_sector(device, sector_id, &bytes)?;
        }

        Ok(())
    }

    /// The first 109 DIFAT entries, for writing into the header.
    pub fn inline_difat(&self) -> [SectorId; INLINE_DIFAT_LEN] {
        let mut out = [SectorId::FREE; INLINE_DIFAT_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            if let Some(&id) = self.fat_sectors.get(i) {
                *slot = id;
            }
        }
        out
    }

    fn table(&self, pool: Pool) -> &Vec<SectorId> {
        match pool {
            Pool::Normal => &self.fat,
            Pool::Mini => &self.mini_fat,
        }
    }

    fn set_entry(&mut self, pool: Pool, id: SectorId, value: SectorId) {
        let index = id.index().expect("regular sector id") as usize;
        let table = match pool {
            Pool::Normal => &mut self.fat,
            Pool::Mini => &mut self.mini_fat,
        };
        if index >= table.len() {
            table.resize(index + 1, SectorId::FREE);
        }
        table[index] = value;
    }

    /// Finds a free normal sector, growing the FAT (and DIFAT, if necessary)
    /// first if none exists.
    fn allocate_normal_sector(&mut self, device: &mut dyn Device) -> CfbResult<SectorId> {
        if let Some(id) = self.find_free(Pool::Normal) {
            return Ok(id);
        }
        self.grow_normal_capacity(device)
    }

    /// Appends one fresh sector, one fresh FAT block's worth of capacity, or both,
    /// and returns a newly free sector id ready for the caller to claim.
    fn grow_normal_capacity(&mut self, device: &mut dyn Device) -> CfbResult<SectorId> {
        let new_id = self.sectors.append_sector(device)?;
        let index = new_id.index().expect("append_sector returns a regular id") as usize;
        if index >= self.fat.len() {
            self.fat.resize(index + 1, SectorId::FREE);
        }

        let per_sector = self.sectors.entries_per_sector();
        let fat_capacity = self.fat_sectors.len() * per_sector;
        if index >= fat_capacity {
            self.fat[index] = SectorId::FAT;
            self.register_fat_sector(new_id, device)?;
            return self.allocate_normal_sector(device);
        }

        Ok(new_id)
    }

    fn register_fat_sector(&mut self, id: SectorId, device: &mut dyn Device) -> CfbResult<()> {
        self.fat_sectors.push(id);
        let slot = self.fat_sectors.len() - 1;
        if slot < INLINE_DIFAT_LEN {
            return Ok(());
        }
        let per_sector = self.sectors.entries_per_sector();
        let difat_capacity = per_sector - 1;
        let overflow_slot = slot - INLINE_DIFAT_LEN;
        let difat_sector_index = overflow_slot / difat_capacity;
        if difat_sector_index >= self.difat_sectors.len() {
            let difat_id = self.allocate_normal_sector(device)?;
            self.set_entry(Pool::Normal, difat_id, SectorId::DIF);
            self.difat_sectors.push(difat_id);
        }
        Ok(())
    }

    fn find_free(&self, pool: Pool) -> Option<SectorId> {
        let table = self.table(pool);
        table
            .iter()
            .position(|e| e.is_free())
            .map(|i| SectorId(i as u32))
    }

    /// Finds a free mini sector, growing the mini-stream (and MiniFAT) first if
    /// none exists.
    fn allocate_mini_sector(&mut self, device: &mut dyn Device) -> CfbResult<SectorId> {
        if let Some(id) = self.find_free(Pool::Mini) {
            return Ok(id);
        }
        self.grow_mini_capacity(device)?;
        self.find_free(Pool::Mini)
            .ok_or(CfbError::NoMiniFat)
    }

    /// Extends the mini-stream by one normal-pool sector (which yields
    /// `sector_size / 64` fresh mini sectors) and, if needed, extends the MiniFAT's
    /// own chain to hold their entries.
    fn grow_mini_capacity(&mut self, device: &mut dyn Device) -> CfbResult<()> {
        let mini_sectors_per_normal = self.sector_size() / MINI_SECTOR_SIZE;

        let fresh_normal = self.allocate_normal_sector(device)?;
        if self.mini_stream_start.is_regular() {
            let tail = *walk_chain(&self.fat, self.mini_stream_start, CfbError::NormalLoop)?
                .last()
                .expect("non-empty chain has a tail");
            self.set_entry(Pool::Normal, tail, fresh_normal);
        } else {
            self.mini_stream_start = fresh_normal;
        }
        self.set_entry(Pool::Normal, fresh_normal, SectorId::END);

        let new_len = self.mini_fat.len() as u32 + mini_sectors_per_normal;
        self.mini_fat.resize(new_len as usize, SectorId::FREE);
        self.mini_stream_sectors += mini_sectors_per_normal;

        let per_sector = self.sectors.entries_per_sector() as u32;
        let needed_sectors = (new_len + per_sector - 1) / per_sector;
        let have_sectors = if self.minifat_start.is_regular() {
            walk_chain(&self.fat, self.minifat_start, CfbError::NormalLoop)?.len() as u32
        } else {
            0
        };
        if needed_sectors > have_sectors {
            self.minifat_start =
                self.extend(self.minifat_start, needed_sectors - have_sectors, Pool::Normal, device)?;
        }

        Ok(())
    }
}

fn device_read_sector(sectors: &SectorStore, device: &mut dyn Device, id: SectorId) -> CfbResult<Vec<u8>> {
    use crate::diagnostics::LogSink;
    sectors.read_sector(device, id, &LogSink)
}

/// Walks a FAT-shaped chain starting at `start`, returning every sector visited
/// (not including the `ENDOFCHAIN` sentinel), detecting loops and out-of-range
/// entries. `range_err` names which table's out-of-range error to raise, since the
/// FAT and MiniFAT use different fatal variants for the same condition.
fn walk_chain_with(
    table: &[SectorId],
    start: SectorId,
    loop_err: CfbError,
    range_err: impl Fn() -> CfbError,
) -> CfbResult<Vec<SectorId>> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current = start;
    while current.is_regular() {
        if !seen.insert(current) {
            return Err(loop_err);
        }
        out.push(current);
        let index = current.index().unwrap() as usize;
        current = *table.get(index).ok_or_else(&range_err)?;
    }
    Ok(out)
}

/// Walks a chain in the normal FAT (or the MiniFAT's own on-disk chain, which is
/// itself normal-pool), raising `NormalLoop`/`LargeNormalFat` on violation.
fn walk_chain(table: &[SectorId], start: SectorId, loop_err: CfbError) -> CfbResult<Vec<SectorId>> {
    walk_chain_with(table, start, loop_err, || CfbError::LargeNormalFat)
}

/// Walks a mini-pool chain, raising `NormalLoop`/`LargeMiniFat` on violation.
fn walk_mini_chain(table: &[SectorId], start: SectorId) -> CfbResult<Vec<SectorId>> {
    walk_chain_with(table, start, CfbError::NormalLoop, || CfbError::LargeMiniFat)
}

/// `mini_cutoff` tells `ChainStream` which pool a given size belongs in; kept here
/// since it is a property of the allocator's configuration, not of any one stream.
pub fn pool_for_size(size: u64, mini_cutoff: u32) -> Pool {
    if size < mini_cutoff as u64 {
        Pool::Mini
    } else {
        Pool::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn allocate_and_chain_normal_pool() {
        let sectors = SectorStore::new(512);
        let mut dev = MemDevice::new();
        let mut alloc = Allocator::new_empty(sectors, &mut dev).unwrap();
        let start = alloc.allocate(3, Pool::Normal, &mut dev).unwrap();
        let chain = alloc.chain(start, Pool::Normal).unwrap();
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn free_marks_every_sector_free() {
        let sectors = SectorStore::new(512);
        let mut dev = MemDevice::new();
        let mut alloc = Allocator::new_empty(sectors, &mut dev).unwrap();
        let start = alloc.allocate(2, Pool::Normal, &mut dev).unwrap();
        alloc.free(start, Pool::Normal).unwrap();
        let index = start.index().unwrap() as usize;
        assert!(alloc.fat[index].is_free());
    }

    #[test]
    fn truncate_to_zero_frees_and_returns_end() {
        let sectors = SectorStore::new(512);
        let mut dev = MemDevice::new();
        let mut alloc = Allocator::new_empty(sectors, &mut dev).unwrap();
        let start = alloc.allocate(2, Pool::Normal, &mut dev).unwrap();
        let new_start = alloc.truncate(start, 0, Pool::Normal).unwrap();
        assert_eq!(new_start, SectorId::END);
    }

    #[test]
    fn mini_pool_allocation_grows_mini_stream() {
        let sectors = SectorStore::new(512);
        let mut dev = MemDevice::new();
        let mut alloc = Allocator::new_empty(sectors, &mut dev).unwrap();
        let start = alloc.allocate(4, Pool::Mini, &mut dev).unwrap();
        assert!(alloc.mini_stream_start.is_regular());
        let chain = alloc.chain(start, Pool::Mini).unwrap();
        assert_eq!(chain.len(), 4);
    }

    #[test]
    fn loop_detection_raises_fatal() {
        let sectors = SectorStore::new(512);
        let mut dev = MemDevice::new();
        let mut alloc = Allocator::new_empty(sectors, &mut dev).unwrap();
        alloc.fat[0] = SectorId(0);
        let err = alloc.chain(SectorId(0), Pool::Normal).unwrap_err();
        assert!(matches!(err, CfbError::NormalLoop));
    }

    #[test]
    fn pool_for_size_respects_cutoff() {
        assert_eq!(pool_for_size(0, 4096), Pool::Mini);
        assert_eq!(pool_for_size(4095, 4096), Pool::Mini);
        assert_eq!(pool_for_size(4096, 4096), Pool::Normal);
    }
}
