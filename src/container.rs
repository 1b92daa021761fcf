//! The `Reader`/`Writer`/`Editor` façade: opens or creates a container, loads
//! its Sector Store, Allocator, and directory tree, and exposes navigation,
//! stream I/O, and mutation against them.
//!
//! Grounded on `oonxt-rust-ole/src/ole.rs`'s `Ole` facade (`from_path`, `parse`,
//! `read`) for the load sequence and the idea of a single entry-point struct
//! owning the device plus parsed metadata, and on `61e88a7b_ermakus-rust-cfb`'s
//! `CompoundFile::open`/`create` and `Storage`/`Stream` handle shape for the
//! create/write/editor lifecycle the teacher never implements (it is read-only).

use crate::alloc::{pool_for_size, Allocator};
use crate::chain::ChainStream;
use crate::common::{DirId, Pool, SectorId, DIR_ENTRY_LEN};
use crate::device::Device;
use crate::diagnostics::{CollectingSink, Diagnostic, DiagnosticSink, LogSink};
use crate::directory::{self, DirEntry, DirectoryTree};
use crate::error::{CfbError, CfbResult};
use crate::header::{self, CreateOptions, Header};
use crate::sector::SectorStore;
use chrono::{DateTime, Utc};

/// Whether a container was opened read-only or for mutation. `close()` only
/// writes back metadata for a `Mutable` container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    ReadOnly,
    Mutable,
}

/// Selects which storage a `create_storage`/`create_stream` call targets: its
/// `DirId` directly, or a `/`-separated path resolved against the current tree.
pub enum Parent<'p> {
    Id(DirId),
    Path(&'p str),
}

impl From<DirId> for Parent<'static> {
    fn from(id: DirId) -> Self {
        Parent::Id(id)
    }
}

impl<'p> From<&'p str> for Parent<'p> {
    fn from(path: &'p str) -> Self {
        Parent::Path(path)
    }
}

/// An open compound file: the backing device, its parsed header, allocator,
/// and directory tree, plus the diagnostic sink installed for this session.
pub struct Container<D: Device, S: DiagnosticSink = LogSink> {
    device: D,
    sectors: SectorStore,
    header: Header,
    alloc: Allocator,
    dir: DirectoryTree,
    sink: S,
    mode: Mode,
}

impl<D: Device> Container<D, LogSink> {
    /// Opens an existing container read-only, with the default logging sink.
    pub fn open_reader(device: D) -> CfbResult<Self> {
        Self::open(device, LogSink, Mode::ReadOnly)
    }

    /// Opens an existing container for mutation, with the default logging sink.
    pub fn open_editor(device: D) -> CfbResult<Self> {
        Self::open(device, LogSink, Mode::Mutable)
    }

    /// Creates a fresh container (version 3, 4096-byte mini cutoff), with the
    /// default logging sink.
    pub fn create_writer(device: D) -> CfbResult<Self> {
        Self::create(device, LogSink, CreateOptions::default())
    }

    /// Creates a fresh container with an explicit version/mini-cutoff choice.
    pub fn create_writer_with_options(device: D, options: CreateOptions) -> CfbResult<Self> {
        Self::create(device, LogSink, options)
    }
}

impl<D: Device, S: DiagnosticSink> Container<D, S> {
    /// Opens an existing container read-only, reporting load-time diagnostics
    /// to `sink`.
    pub fn open_reader_with_sink(device: D, sink: S) -> CfbResult<Self> {
        Self::open(device, sink, Mode::ReadOnly)
    }

    /// Opens an existing container for mutation, reporting load-time
    /// diagnostics to `sink`.
    pub fn open_editor_with_sink(device: D, sink: S) -> CfbResult<Self> {
        Self::open(device, sink, Mode::Mutable)
    }

    /// Creates a fresh container, reporting diagnostics to `sink`.
    pub fn create_writer_with_sink(device: D, options: CreateOptions, sink: S) -> CfbResult<Self> {
        Self::create(device, sink, options)
    }

    /// Installs a new diagnostic sink, replacing whatever policy this
    /// container was constructed with.
    pub fn with_sink<S2: DiagnosticSink>(self, sink: S2) -> Container<D, S2> {
        Container {
            device: self.device,
            sectors: self.sectors,
            header: self.header,
            alloc: self.alloc,
            dir: self.dir,
            sink,
            mode: self.mode,
        }
    }

    /// Open sequence per spec §4.6: read the header, initialize the Sector
    /// Store, walk the DIFAT and FAT, load the directory chain, locate the
    /// MiniFAT, then validate and adopt the root entry's mini-stream location.
    fn open(mut device: D, sink: S, mode: Mode) -> CfbResult<Self> {
        let mut header_bytes = vec![0u8; crate::common::HEADER_LEN];
        let n = device.read_at(0, &mut header_bytes)?;
        if n < header_bytes.len() {
            return Err(CfbError::Header);
        }
        let header = header::decode(&header_bytes, &sink)?;
        let sectors = SectorStore::new(header.sector_size());

        let mut alloc = Allocator::load(
            sectors,
            &mut device,
            &header.inline_difat,
            header.first_difat_sector,
            header.num_difat_sectors,
            header.num_fat_sectors,
            header.first_minifat_sector,
            SectorId::END,
            0,
        )?;

        let dir_chain = alloc.chain(header.first_directory_sector, Pool::Normal)?;
        let mut raw_entries = Vec::new();
        for &sector_id in &dir_chain {
            let bytes = sectors.read_sector(&mut device, sector_id, &sink)?;
            raw_entries.extend(directory::decode_sector(&bytes, &sink)?);
        }
        let dir = DirectoryTree::load(raw_entries, &sink)?;

        let root = dir.entry(DirId::ROOT);
        if !root.is_root() {
            return Err(CfbError::DirEntry(
                "root entry is not typed as root storage".into(),
            ));
        }
        alloc.set_mini_stream_start(root.start_sector);
        alloc.set_mini_stream_len(root.size);

        Ok(Container {
            device,
            sectors,
            header,
            alloc,
            dir,
            sink,
            mode,
        })
    }

    /// Create sequence per spec §4.6: allocate one directory sector holding
    /// just the root entry, one FAT sector, and populate DIFAT[0]. No MiniFAT
    /// until the first mini stream is created.
    fn create(mut device: D, sink: S, options: CreateOptions) -> CfbResult<Self> {
        device.set_len(0)?;
        device.set_len(crate::common::HEADER_LEN as u64)?;

        let sectors = SectorStore::new(options.version.sector_size());
        let mut alloc = Allocator::new_empty(sectors, &mut device)?;
        let dir_start = alloc.allocate(1, Pool::Normal, &mut device)?;

        let mut header = Header::new_empty(options);
        header.first_directory_sector = dir_start;
        header.num_fat_sectors = alloc.fat_sectors().len() as u32;
        header.num_difat_sectors = alloc.difat_sectors().len() as u32;
        header.inline_difat = alloc.inline_difat();

        let dir = DirectoryTree::new_empty();

        let mut container = Container {
            device,
            sectors,
            header,
            alloc,
            dir,
            sink,
            mode: Mode::Mutable,
        };
        container.save()?;
        Ok(container)
    }

    /// The root storage entry.
    pub fn root(&self) -> Entry<'_, D, S> {
        Entry {
            container: self,
            id: self.dir.root(),
        }
    }

    /// Looks up a `/`-separated path from the root.
    pub fn lookup_path(&self, path: &str) -> CfbResult<Entry<'_, D, S>> {
        let id = self.dir.lookup_path(path)?;
        Ok(Entry {
            container: self,
            id,
        })
    }

    fn resolve_parent(&self, parent: Parent<'_>) -> CfbResult<DirId> {
        match parent {
            Parent::Id(id) => Ok(id),
            Parent::Path(path) => self.dir.lookup_path(path),
        }
    }

    /// Creates a new storage under `parent`.
    pub fn create_storage<'p>(
        &mut self,
        parent: impl Into<Parent<'p>>,
        name: impl Into<String>,
    ) -> CfbResult<Entry<'_, D, S>> {
        let parent = self.resolve_parent(parent.into())?;
        let id = self.dir.insert_storage(parent, name.into())?;
        Ok(Entry {
            container: self,
            id,
        })
    }

    /// Creates a new stream under `parent` and writes `bytes` into it.
    pub fn create_stream<'p>(
        &mut self,
        parent: impl Into<Parent<'p>>,
        name: impl Into<String>,
        bytes: &[u8],
    ) -> CfbResult<Entry<'_, D, S>> {
        let parent = self.resolve_parent(parent.into())?;
        let id = self
            .dir
            .insert_stream(parent, name.into(), SectorId::END, 0)?;
        {
            let mut stream = self.open_stream_by_id(id);
            stream.write(bytes)?;
        }
        Ok(Entry {
            container: self,
            id,
        })
    }

    /// Opens a stream for reading and writing, by path.
    pub fn open_path(&mut self, path: &str) -> CfbResult<Stream<'_, D, S>> {
        let id = self.dir.lookup_path(path)?;
        self.open_entry(id)
    }

    /// Opens a stream for reading and writing, by `DirId`.
    pub fn open_entry(&mut self, id: DirId) -> CfbResult<Stream<'_, D, S>> {
        if !self.dir.entry(id).is_stream() {
            return Err(CfbError::NotStream);
        }
        Ok(self.open_stream_by_id(id))
    }

    fn open_stream_by_id(&mut self, id: DirId) -> Stream<'_, D, S> {
        Stream {
            container: self,
            id,
            pos: 0,
        }
    }

    /// Renames an entry. Fails without mutating the tree on a name collision.
    pub fn rename(&mut self, id: DirId, new_name: impl Into<String>) -> CfbResult<()> {
        self.dir.rename(id, new_name.into())
    }

    /// Deletes an entry, recursing into a storage's children first and
    /// releasing every stream's sector chain along the way. The root entry
    /// cannot be deleted.
    pub fn delete(&mut self, id: DirId) -> CfbResult<()> {
        if self.dir.entry(id).is_storage() {
            for child in self.dir.children(id) {
                self.delete(child)?;
            }
        } else {
            let entry = self.dir.entry(id);
            if entry.start_sector.is_regular() {
                let pool = pool_for_size(entry.size, self.header.mini_stream_cutoff);
                let start = entry.start_sector;
                self.alloc.free(start, pool)?;
            }
        }
        self.dir.delete(id)?;
        Ok(())
    }

    /// Flush sequence per spec §4.6: write back every open stream's metadata
    /// (already reflected in the directory tree by `Stream::write`/
    /// `set_length`), rewrite the MiniFAT/FAT/DIFAT, rewrite the directory
    /// sectors, then rewrite the header last.
    pub fn save(&mut self) -> CfbResult<()> {
        self.dir.set_stream_location(
            DirId::ROOT,
            self.alloc.mini_stream_start(),
            self.alloc.mini_stream_size(),
        );
        self.ensure_directory_capacity()?;
        self.write_directory_chain()?;
        self.alloc.flush(&mut self.device)?;

        self.header.num_fat_sectors = self.alloc.fat_sectors().len() as u32;
        self.header.num_difat_sectors = self.alloc.difat_sectors().len() as u32;
        self.header.first_difat_sector = self
            .alloc
            .difat_sectors()
            .first()
            .copied()
            .unwrap_or(SectorId::END);
        self.header.inline_difat = self.alloc.inline_difat();
        self.header.first_minifat_sector = self.alloc.minifat_start();
        self.header.num_minifat_sectors = if self.alloc.minifat_start().is_regular() {
            self.alloc.chain(self.alloc.minifat_start(), Pool::Normal)?.len() as u32
        } else {
            0
        };

        let header_bytes = header::encode(&self.header)?;
        self.device.write_at(0, &header_bytes)?;
        self.device.flush()?;
        Ok(())
    }

    /// Closes the container, saving first if it was opened for mutation.
    pub fn close(mut self) -> CfbResult<()> {
        if self.mode == Mode::Mutable {
            self.save()?;
        }
        Ok(())
    }

    fn ensure_directory_capacity(&mut self) -> CfbResult<()> {
        let per_sector = self.sectors.sector_size() as usize / DIR_ENTRY_LEN;
        let needed_sectors = ((self.dir.len() + per_sector - 1) / per_sector).max(1) as u32;
        let current_chain = self
            .alloc
            .chain(self.header.first_directory_sector, Pool::Normal)?;
        let current_sectors = current_chain.len() as u32;
        if needed_sectors > current_sectors {
            self.header.first_directory_sector = self.alloc.extend(
                self.header.first_directory_sector,
                needed_sectors - current_sectors,
                Pool::Normal,
                &mut self.device,
            )?;
        }
        // Per spec §6's header layout, v3 containers always report 0 here; only
        // v4 stores the real directory-sector count.
        self.header.num_directory_sectors = match self.header.version {
            crate::common::MajorVersion::V3 => 0,
            crate::common::MajorVersion::V4 => needed_sectors.max(current_sectors),
        };
        Ok(())
    }

    fn write_directory_chain(&mut self) -> CfbResult<()> {
        let per_sector = self.sectors.sector_size() as usize / DIR_ENTRY_LEN;
        let chain = self
            .alloc
            .chain(self.header.first_directory_sector, Pool::Normal)?;
        let entries = self.dir.entries();
        for (slot, &sector_id) in chain.iter().enumerate() {
            let lo = slot * per_sector;
            let hi = (lo + per_sector).min(entries.len());
            let slice = if lo < hi { &entries[lo..hi] } else { &[][..] };
            let bytes = directory::encode_sector(slice, per_sector)?;
            self.sectors.write_sector(&mut self.device, sector_id, &bytes)?;
        }
        Ok(())
    }
}

impl<D: Device> Container<D, CollectingSink> {
    /// The diagnostics collected so far. Only available when constructed with
    /// a `CollectingSink`.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.sink.snapshot()
    }
}

/// A handle to one directory entry, borrowing its owning container.
pub struct Entry<'a, D: Device, S: DiagnosticSink> {
    container: &'a Container<D, S>,
    id: DirId,
}

impl<'a, D: Device, S: DiagnosticSink> Entry<'a, D, S> {
    fn raw(&self) -> &DirEntry {
        self.container.dir.entry(self.id)
    }

    pub fn id(&self) -> DirId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.raw().name
    }

    pub fn is_storage(&self) -> bool {
        self.raw().is_storage()
    }

    pub fn is_stream(&self) -> bool {
        self.raw().is_stream()
    }

    pub fn is_root(&self) -> bool {
        self.raw().is_root()
    }

    pub fn size(&self) -> u64 {
        self.raw().size
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.raw().created
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.raw().modified
    }

    /// In-order traversal of this entry's children (empty for a stream).
    pub fn children(&self) -> Vec<Entry<'a, D, S>> {
        self.container
            .dir
            .children(self.id)
            .into_iter()
            .map(|id| Entry {
                container: self.container,
                id,
            })
            .collect()
    }

    /// Looks up a direct child by name.
    pub fn lookup(&self, name: &str) -> CfbResult<Entry<'a, D, S>> {
        self.container
            .dir
            .lookup(self.id, name)
            .map(|id| Entry {
                container: self.container,
                id,
            })
            .ok_or(CfbError::NotFound)
    }
}

/// A seekable handle to one stream's bytes, borrowing its owning container
/// mutably. Holds no owned bytes; every read/write opens a transient
/// `ChainStream` against the container's allocator and device, then writes
/// the updated start sector/size back into the directory tree.
pub struct Stream<'a, D: Device, S: DiagnosticSink> {
    container: &'a mut Container<D, S>,
    id: DirId,
    pos: u64,
}

impl<'a, D: Device, S: DiagnosticSink> Stream<'a, D, S> {
    pub fn id(&self) -> DirId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.container.dir.entry(self.id).size
    }

    pub fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn open_chain(&mut self) -> ChainStream<'_> {
        let entry = self.container.dir.entry(self.id);
        let start = entry.start_sector;
        let size = entry.size;
        let cutoff = self.container.header.mini_stream_cutoff;
        let pool = pool_for_size(size, cutoff);
        let mut chain = ChainStream::open(
            &mut self.container.alloc,
            &mut self.container.device,
            &self.container.sectors,
            start,
            size,
            pool,
            cutoff,
        );
        chain.seek(self.pos);
        chain
    }

    fn sync_location(&mut self, new_start: SectorId, new_size: u64) {
        self.container.dir.set_stream_location(self.id, new_start, new_size);
        if self.id == DirId::ROOT {
            self.container.alloc.set_mini_stream_start(new_start);
            self.container.alloc.set_mini_stream_len(new_size);
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> CfbResult<usize> {
        let n = {
            let mut chain = self.open_chain();
            chain.read(buf)?
        };
        self.pos += n as u64;
        Ok(n)
    }

    /// Reads the entire stream from offset 0, leaving the cursor unchanged.
    pub fn read_all(&mut self) -> CfbResult<Vec<u8>> {
        let mut chain = self.open_chain();
        chain.seek(0);
        chain.read_all()
    }

    pub fn write(&mut self, data: &[u8]) -> CfbResult<()> {
        let (new_start, new_size) = {
            let mut chain = self.open_chain();
            chain.write(data)?;
            (chain.start(), chain.size())
        };
        self.pos += data.len() as u64;
        self.sync_location(new_start, new_size);
        Ok(())
    }

    pub fn set_length(&mut self, new_size: u64) -> CfbResult<()> {
        let new_start = {
            let mut chain = self.open_chain();
            chain.set_length(new_size)?;
            chain.start()
        };
        if self.pos > new_size {
            self.pos = new_size;
        }
        self.sync_location(new_start, new_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::HEADER_LEN;
    use crate::device::MemDevice;
    use crate::diagnostics::DiagnosticKind;

    #[test]
    fn create_write_close_reopen_round_trips_through_mini_pool() {
        let mut container = Container::create_writer(MemDevice::new()).unwrap();
        container.create_storage(DirId::ROOT, "S").unwrap();
        container.create_stream("/S", "a", b"hello").unwrap();
        container.save().unwrap();
        let bytes = container.device.clone().into_inner();

        let mut reopened = Container::open_editor(MemDevice::from_vec(bytes)).unwrap();
        let mut stream = reopened.open_path("/S/a").unwrap();
        assert_eq!(stream.size(), 5);
        assert_eq!(stream.read_all().unwrap(), b"hello");
        let entry = reopened.lookup_path("/S/a").unwrap();
        assert!(entry.is_stream());
        drop(entry);
    }

    #[test]
    fn write_crossing_cutoff_lands_in_normal_pool_with_two_sectors() {
        let options = CreateOptions::default().version(crate::common::MajorVersion::V4);
        let mut container =
            Container::create_writer_with_options(MemDevice::new(), options).unwrap();
        container.create_stream(DirId::ROOT, "big", &vec![0u8; 5000]).unwrap();
        container.save().unwrap();

        let entry = container.lookup_path("/big").unwrap();
        assert_eq!(entry.size(), 5000);
        assert!(entry.size() >= 4096 && entry.size() < 8192);
        let start = container.dir.entry(entry.id()).start_sector;
        let chain = container.alloc.chain(start, Pool::Normal).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn delete_then_recreate_reuses_directory_slot() {
        let mut container = Container::create_writer(MemDevice::new()).unwrap();
        container.create_storage(DirId::ROOT, "S").unwrap();
        let a = container.create_stream("/S", "a", b"hello").unwrap().id();
        container.delete(a).unwrap();
        let b = container.create_stream("/S", "b", b"xyz").unwrap().id();
        assert_eq!(a, b);
    }

    #[test]
    fn rename_changes_in_order_traversal_and_keeps_tree_valid() {
        let mut container = Container::create_writer(MemDevice::new()).unwrap();
        container.create_storage(DirId::ROOT, "S").unwrap();
        container.create_stream("/S", "aa", b"").unwrap();
        container.create_stream("/S", "bb", b"").unwrap();
        let aa = container.lookup_path("/S/aa").unwrap().id();
        container.rename(aa, "zz").unwrap();

        let storage = container.lookup_path("/S").unwrap();
        let names: Vec<String> = storage
            .children()
            .into_iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["bb".to_string(), "zz".to_string()]);
    }

    #[test]
    fn corrupted_self_loop_opens_but_fails_to_read() {
        let mut container = Container::create_writer(MemDevice::new()).unwrap();
        container.create_stream(DirId::ROOT, "big", &vec![0xABu8; 4096]).unwrap();
        container.save().unwrap();

        let fat_sector = container.alloc.fat_sectors()[0];
        let offset = container.sectors.offset(fat_sector) + 7 * 4;
        container
            .device
            .write_at(offset, &7u32.to_le_bytes())
            .unwrap();

        let bytes = container.device.clone().into_inner();
        let mut reopened = Container::open_editor(MemDevice::from_vec(bytes)).unwrap();
        let mut stream = reopened.open_path("/big").unwrap();
        let err = stream.read_all().unwrap_err();
        assert!(matches!(err, CfbError::NormalLoop));
    }

    #[test]
    fn out_of_range_start_sector_is_reported_and_reads_as_empty() {
        let mut container = Container::create_writer(MemDevice::new()).unwrap();
        container.create_stream(DirId::ROOT, "a", b"hello").unwrap();
        container.save().unwrap();

        let dir_sector = container.header.first_directory_sector;
        let offset = container.sectors.offset(dir_sector) + DIR_ENTRY_LEN as u64 + 116;
        container
            .device
            .write_at(offset, &0xFFFF_FFFAu32.to_le_bytes())
            .unwrap();

        let corrupted = container.device.clone();
        let sink = CollectingSink::new();
        let mut reopened = Container::open_editor_with_sink(corrupted, sink).unwrap();
        assert!(reopened
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::DirSectorWarning));

        let mut stream = reopened.open_path("/a").unwrap();
        let data = stream.read_all().unwrap();
        assert_eq!(data.len(), 0);
    }

    #[test]
    fn header_round_trips_across_close_and_reopen() {
        let container = Container::create_writer(MemDevice::new()).unwrap();
        let bytes = container.device.clone().into_inner();
        assert!(bytes.len() >= HEADER_LEN);
        let reopened = Container::open_reader(MemDevice::from_vec(bytes)).unwrap();
        assert_eq!(reopened.header.version, container.header.version);
        assert_eq!(reopened.root().name(), "Root Entry");
    }

    #[test]
    fn dropping_without_save_loses_uncommitted_mutation() {
        let mut container = Container::create_writer(MemDevice::new()).unwrap();
        container.save().unwrap();
        let before = container.device.clone().into_inner();

        {
            let mut scratch = Container::open_editor(MemDevice::from_vec(before.clone())).unwrap();
            scratch.create_stream(DirId::ROOT, "ephemeral", b"x").unwrap();
            // dropped without calling save() or close()
        }

        let reopened = Container::open_reader(MemDevice::from_vec(before)).unwrap();
        assert!(reopened.lookup_path("/ephemeral").is_err());
    }
}
