//! The persisted red–black tree of directory entries: codec for the 128-byte
//! on-disk record, and the in-memory tree (insert/delete/rename/lookup) that
//! operates on `DirId`-indexed entries rather than owned node references.
//!
//! Grounded on `oonxt-rust-ole/src/directory.rs`'s `Entry`/`ObjectType`/`Color`
//! layout (kept the same 128-byte field order); the tree mechanics have no
//! teacher counterpart (the teacher only ever reads a directory, never mutates
//! one) and are grounded instead on the CLRS red–black tree algorithms named in
//! spec §4.5, adapted to store no parent pointers on disk by tracking an
//! in-memory `parent`/`owner` side table instead of owned references, per the
//! re-architecting guidance in spec §9.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};
use chrono::{DateTime, Utc};

use crate::common::{name_order_key, DirId, SectorId, DIR_ENTRY_LEN};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::error::{CfbError, CfbResult};

/// Microsoft epoch (1601-01-01 UTC) expressed as 100-ns ticks before the Unix
/// epoch.
const FILETIME_UNIX_DIFF_100NS: i64 = 116_444_736_000_000_000;

fn filetime_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let signed = ticks as i64 - FILETIME_UNIX_DIFF_100NS;
    let secs = signed.div_euclid(10_000_000);
    let nanos = (signed.rem_euclid(10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn datetime_to_filetime(dt: Option<DateTime<Utc>>) -> u64 {
    let Some(dt) = dt else { return 0 };
    let nanos_total = dt.timestamp() * 1_000_000_000 + dt.timestamp_subsec_nanos() as i64;
    let hundred_ns = nanos_total / 100;
    (hundred_ns + FILETIME_UNIX_DIFF_100NS).max(0) as u64
}

/// Object kind byte, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Empty,
    Storage,
    Stream,
    RootStorage,
}

/// Red–black color bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

/// The raw 128-byte wire record. Object type and color are decoded/encoded by
/// hand rather than with `binrw`'s `#[brw(magic(...))]` enums, so an
/// out-of-range byte is a recoverable diagnostic instead of a hard parse error.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct DirEntryRaw {
    name_raw: [u8; 64],
    name_length: u16,
    object_type: u8,
    color: u8,
    left: u32,
    right: u32,
    child: u32,
    clsid: [u8; 16],
    state_bits: u32,
    creation_time: u64,
    modified_time: u64,
    start_sector: u32,
    size: u64,
}

/// A directory entry in friendly form. `left`/`right` are sibling pointers
/// within whatever storage's child tree contains this entry; `child` is the
/// root of *this* entry's own child tree (storages only).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub object_type: ObjectType,
    pub color: Color,
    pub left: DirId,
    pub right: DirId,
    pub child: DirId,
    pub clsid: [u8; 16],
    pub state_bits: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub start_sector: SectorId,
    pub size: u64,
}

impl DirEntry {
    pub fn empty() -> Self {
        DirEntry {
            name: String::new(),
            object_type: ObjectType::Empty,
            color: Color::Black,
            left: DirId::NOSTREAM,
            right: DirId::NOSTREAM,
            child: DirId::NOSTREAM,
            clsid: [0u8; 16],
            state_bits: 0,
            created: None,
            modified: None,
            start_sector: SectorId::END,
            size: 0,
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.object_type, ObjectType::Storage | ObjectType::RootStorage)
    }

    pub fn is_stream(&self) -> bool {
        self.object_type == ObjectType::Stream
    }

    pub fn is_root(&self) -> bool {
        self.object_type == ObjectType::RootStorage
    }
}

fn encode_name(name: &str) -> CfbResult<([u8; 64], u16)> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > 31 {
        return Err(CfbError::DirEntry(format!(
            "name '{name}' exceeds 31 UTF-16 code units"
        )));
    }
    let mut buf = [0u8; 64];
    for (i, unit) in units.iter().enumerate() {
        let bytes = unit.to_le_bytes();
        buf[i * 2] = bytes[0];
        buf[i * 2 + 1] = bytes[1];
    }
    let name_length = ((units.len() + 1) * 2) as u16;
    Ok((buf, name_length))
}

fn decode_name(raw: &[u8; 64], name_length: u16, sink: &dyn DiagnosticSink) -> CfbResult<String> {
    if name_length == 0 {
        return Ok(String::new());
    }
    if name_length % 2 != 0 || name_length as usize > 64 {
        sink.report(Diagnostic::new(
            DiagnosticKind::DirNameWarning,
            format!("invalid name length {name_length}, truncating to fit"),
        ))?;
    }
    let byte_len = (name_length as usize).min(64);
    let code_units: Vec<u16> = raw[..byte_len - byte_len % 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let trimmed: &[u16] = match code_units.last() {
        Some(0) => &code_units[..code_units.len() - 1],
        _ => &code_units[..],
    };
    match String::from_utf16(trimmed) {
        Ok(name) => Ok(name),
        Err(_) => {
            sink.report(Diagnostic::new(
                DiagnosticKind::DirNameWarning,
                "name is not valid UTF-16, using lossy decode".to_string(),
            ))?;
            Ok(String::from_utf16_lossy(trimmed))
        }
    }
}

/// Decodes one 128-byte directory record.
pub fn decode_entry(bytes: &[u8], sink: &dyn DiagnosticSink) -> CfbResult<DirEntry> {
    let raw = DirEntryRaw::read_le(&mut Cursor::new(bytes))?;
    let name = decode_name(&raw.name_raw, raw.name_length, sink)?;

    let object_type = match raw.object_type {
        0 => ObjectType::Empty,
        1 => ObjectType::Storage,
        2 => ObjectType::Stream,
        5 => ObjectType::RootStorage,
        other => {
            sink.report(Diagnostic::new(
                DiagnosticKind::DirTypeWarning,
                format!("unrecognized object type byte {other}, treating as empty"),
            ))?;
            ObjectType::Empty
        }
    };

    let color = match raw.color {
        0 => Color::Red,
        1 => Color::Black,
        other => {
            sink.report(Diagnostic::new(
                DiagnosticKind::DirIndexWarning,
                format!("unrecognized color byte {other}, defaulting to black"),
            ))?;
            Color::Black
        }
    };

    let start_sector = SectorId(raw.start_sector);
    if object_type == ObjectType::Stream && !start_sector.is_regular() && !start_sector.is_end() {
        sink.report(Diagnostic::new(
            DiagnosticKind::DirSectorWarning,
            format!("stream '{name}' has an out-of-range start sector {start_sector}"),
        ))?;
    }

    let created = filetime_to_datetime(raw.creation_time);
    let modified = filetime_to_datetime(raw.modified_time);
    if (raw.creation_time != 0 && created.is_none()) || (raw.modified_time != 0 && modified.is_none()) {
        sink.report(Diagnostic::new(
            DiagnosticKind::DirTimeWarning,
            format!("entry '{name}' has an unrepresentable timestamp"),
        ))?;
    }

    Ok(DirEntry {
        name,
        object_type,
        color,
        left: DirId(raw.left),
        right: DirId(raw.right),
        child: DirId(raw.child),
        clsid: raw.clsid,
        state_bits: raw.state_bits,
        created,
        modified,
        start_sector,
        size: raw.size,
    })
}

/// Encodes one directory entry back into its 128-byte wire record.
pub fn encode_entry(entry: &DirEntry) -> CfbResult<Vec<u8>> {
    let (name_raw, name_length) = encode_name(&entry.name)?;
    let raw = DirEntryRaw {
        name_raw,
        name_length,
        object_type: match entry.object_type {
            ObjectType::Empty => 0,
            ObjectType::Storage => 1,
            ObjectType::Stream => 2,
            ObjectType::RootStorage => 5,
        },
        color: match entry.color {
            Color::Red => 0,
            Color::Black => 1,
        },
        left: entry.left.0,
        right: entry.right.0,
        child: entry.child.0,
        clsid: entry.clsid,
        state_bits: entry.state_bits,
        creation_time: datetime_to_filetime(entry.created),
        modified_time: datetime_to_filetime(entry.modified),
        start_sector: entry.start_sector.0,
        size: entry.size,
    };
    let mut buf = Vec::with_capacity(DIR_ENTRY_LEN);
    raw.write_le(&mut Cursor::new(&mut buf))?;
    Ok(buf)
}

/// Decodes every 128-byte record in a directory sector's bytes.
pub fn decode_sector(bytes: &[u8], sink: &dyn DiagnosticSink) -> CfbResult<Vec<DirEntry>> {
    bytes.chunks_exact(DIR_ENTRY_LEN).map(|chunk| decode_entry(chunk, sink)).collect()
}

/// Encodes up to `entries_per_sector` entries, padding any remainder with empty
/// records.
pub fn encode_sector(entries: &[DirEntry], entries_per_sector: usize) -> CfbResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(entries_per_sector * DIR_ENTRY_LEN);
    let blank = DirEntry::empty();
    for i in 0..entries_per_sector {
        buf.extend_from_slice(&encode_entry(entries.get(i).unwrap_or(&blank))?);
    }
    Ok(buf)
}

/// The in-memory directory: a dense array of entries addressed by `DirId`, plus
/// two side tables with no on-disk representation — `parent` (the BST parent
/// within whichever storage's tree contains this entry, used for rotations) and
/// `owner` (which storage's tree this entry belongs to, used so delete/rename
/// don't require the caller to pass the parent storage).
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    entries: Vec<DirEntry>,
    parent: Vec<DirId>,
    owner: Vec<DirId>,
    free: Vec<DirId>,
}

impl DirectoryTree {
    /// A freshly created container's directory: just the root storage entry.
    pub fn new_empty() -> Self {
        let root = DirEntry {
            name: "Root Entry".to_string(),
            object_type: ObjectType::RootStorage,
            color: Color::Black,
            left: DirId::NOSTREAM,
            right: DirId::NOSTREAM,
            child: DirId::NOSTREAM,
            clsid: [0u8; 16],
            state_bits: 0,
            created: None,
            modified: None,
            start_sector: SectorId::END,
            size: 0,
        };
        DirectoryTree {
            entries: vec![root],
            parent: vec![DirId::NOSTREAM],
            owner: vec![DirId::NOSTREAM],
            free: Vec::new(),
        }
    }

    /// Builds a directory tree from entries read off disk: validates that each
    /// storage's child tree is a valid BST (fatal `DirEntry` for that subtree if
    /// not) and repaints red–black coloring where the shape is valid but the
    /// on-disk colors are not, per the resolved open question in spec §9.
    pub fn load(entries: Vec<DirEntry>, sink: &dyn DiagnosticSink) -> CfbResult<Self> {
        if !matches!(entries.first(), Some(e) if e.object_type == ObjectType::RootStorage) {
            return Err(CfbError::DirEntry("missing root storage entry at index 0".into()));
        }
        let len = entries.len();
        let mut tree = DirectoryTree {
            entries,
            parent: vec![DirId::NOSTREAM; len],
            owner: vec![DirId::NOSTREAM; len],
            free: Vec::new(),
        };

        for i in 0..len {
            let storage = DirId(i as u32);
            if tree.entries[i].object_type == ObjectType::Empty {
                tree.free.push(storage);
                continue;
            }
            if !tree.entries[i].is_storage() {
                continue;
            }
            let root = tree.entries[i].child;
            if root.is_none() {
                continue;
            }
            let mut visited = HashSet::new();
            if !tree.validate_bst(root, None, None, &mut visited) {
                return Err(CfbError::DirEntry(format!(
                    "storage {i}'s child tree is not a valid ordered binary search tree"
                )));
            }
            tree.link_subtree(storage, root);
            if !tree.is_valid_rb(root) {
                tree.repaint(storage)?;
                sink.report(Diagnostic::new(
                    DiagnosticKind::DirIndexWarning,
                    format!("repainted red-black coloring for storage {i}'s child tree"),
                ))?;
            }
        }

        Ok(tree)
    }

    pub fn root(&self) -> DirId {
        DirId::ROOT
    }

    pub fn entry(&self, id: DirId) -> &DirEntry {
        &self.entries[id.index()]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn owner_of(&self, id: DirId) -> DirId {
        self.owner[id.index()]
    }

    /// Every currently allocated entry, including empty (freed) slots, in `DirId`
    /// order — the shape the directory chain's sectors are serialized from.
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Updates a stream (or the root entry's mini-stream) location after a write
    /// or truncate, without touching its position in the tree.
    pub fn set_stream_location(&mut self, id: DirId, start: SectorId, size: u64) {
        let entry = &mut self.entries[id.index()];
        entry.start_sector = start;
        entry.size = size;
    }

    pub fn lookup(&self, storage: DirId, name: &str) -> Option<DirId> {
        let mut x = self.entries[storage.index()].child;
        let key = name_order_key(name);
        while !x.is_none() {
            let xe = &self.entries[x.index()];
            match key.cmp(&name_order_key(&xe.name)) {
                Ordering::Less => x = xe.left,
                Ordering::Greater => x = xe.right,
                Ordering::Equal => return Some(x),
            }
        }
        None
    }

    pub fn lookup_path(&self, path: &str) -> CfbResult<DirId> {
        let mut current = DirId::ROOT;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.lookup(current, segment).ok_or(CfbError::NotFound)?;
        }
        Ok(current)
    }

    /// In-order traversal of `storage`'s children.
    pub fn children(&self, storage: DirId) -> Vec<DirId> {
        let mut out = Vec::new();
        self.in_order(self.entries[storage.index()].child, &mut out);
        out
    }

    fn in_order(&self, x: DirId, out: &mut Vec<DirId>) {
        if x.is_none() {
            return;
        }
        self.in_order(self.entries[x.index()].left, out);
        out.push(x);
        self.in_order(self.entries[x.index()].right, out);
    }

    pub fn insert_storage(&mut self, parent: DirId, name: String) -> CfbResult<DirId> {
        self.insert_entry(
            parent,
            DirEntry {
                object_type: ObjectType::Storage,
                ..blank_entry(name)
            },
        )
    }

    pub fn insert_stream(&mut self, parent: DirId, name: String, start: SectorId, size: u64) -> CfbResult<DirId> {
        self.insert_entry(
            parent,
            DirEntry {
                object_type: ObjectType::Stream,
                start_sector: start,
                size,
                ..blank_entry(name)
            },
        )
    }

    fn insert_entry(&mut self, storage: DirId, entry: DirEntry) -> CfbResult<DirId> {
        if !self.entries[storage.index()].is_storage() {
            return Err(CfbError::NotStorage);
        }
        let id = self.alloc_slot(entry);
        self.owner[id.index()] = storage;
        match self.link_new_node(storage, id) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.free_slot(id);
                Err(e)
            }
        }
    }

    /// Removes `id` from its owning storage's tree, per CLRS red–black delete,
    /// and frees its slot for LIFO reuse by a later insert.
    pub fn delete(&mut self, id: DirId) -> CfbResult<DirEntry> {
        if id == DirId::ROOT {
            return Err(CfbError::RootImmutable);
        }
        let storage = self.owner[id.index()];
        let removed = self.entries[id.index()].clone();
        self.unlink(storage, id)?;
        self.free_slot(id);
        Ok(removed)
    }

    /// Deletes and re-inserts `id` under its new name (the ordering key
    /// changes); `id` itself and its `child` subtree (if it is a storage) are
    /// preserved. Fails without mutating the tree if `new_name` collides.
    pub fn rename(&mut self, id: DirId, new_name: String) -> CfbResult<()> {
        if id == DirId::ROOT {
            return Err(CfbError::RootImmutable);
        }
        let storage = self.owner[id.index()];
        if let Some(existing) = self.lookup(storage, &new_name) {
            if existing != id {
                return Err(CfbError::NameCollision);
            }
            return Ok(());
        }
        self.unlink(storage, id)?;
        self.entries[id.index()].name = new_name;
        self.entries[id.index()].color = Color::Red;
        self.entries[id.index()].left = DirId::NOSTREAM;
        self.entries[id.index()].right = DirId::NOSTREAM;
        self.link_new_node(storage, id)
    }

    // ---- slot management ----

    fn alloc_slot(&mut self, entry: DirEntry) -> DirId {
        if let Some(id) = self.free.pop() {
            self.entries[id.index()] = entry;
            id
        } else {
            let id = DirId(self.entries.len() as u32);
            self.entries.push(entry);
            self.parent.push(DirId::NOSTREAM);
            self.owner.push(DirId::NOSTREAM);
            id
        }
    }

    fn free_slot(&mut self, id: DirId) {
        self.entries[id.index()] = DirEntry::empty();
        self.parent[id.index()] = DirId::NOSTREAM;
        self.owner[id.index()] = DirId::NOSTREAM;
        self.free.push(id);
    }

    // ---- tree primitives ----

    fn color_of(&self, id: DirId) -> Color {
        if id.is_none() {
            Color::Black
        } else {
            self.entries[id.index()].color
        }
    }

    fn set_color(&mut self, id: DirId, color: Color) {
        if !id.is_none() {
            self.entries[id.index()].color = color;
        }
    }

    fn left(&self, id: DirId) -> DirId {
        if id.is_none() {
            DirId::NOSTREAM
        } else {
            self.entries[id.index()].left
        }
    }

    fn right(&self, id: DirId) -> DirId {
        if id.is_none() {
            DirId::NOSTREAM
        } else {
            self.entries[id.index()].right
        }
    }

    fn parent_of(&self, id: DirId) -> DirId {
        if id.is_none() {
            DirId::NOSTREAM
        } else {
            self.parent[id.index()]
        }
    }

    fn link_left(&mut self, parent: DirId, child: DirId) {
        self.entries[parent.index()].left = child;
        if !child.is_none() {
            self.parent[child.index()] = parent;
        }
    }

    fn link_right(&mut self, parent: DirId, child: DirId) {
        self.entries[parent.index()].right = child;
        if !child.is_none() {
            self.parent[child.index()] = parent;
        }
    }

    fn set_subtree_root(&mut self, storage: DirId, new_root: DirId) {
        self.entries[storage.index()].child = new_root;
        if !new_root.is_none() {
            self.parent[new_root.index()] = DirId::NOSTREAM;
        }
    }

    fn transplant(&mut self, storage: DirId, u: DirId, v: DirId) {
        let p = self.parent_of(u);
        if p.is_none() {
            self.set_subtree_root(storage, v);
        } else if self.left(p) == u {
            self.link_left(p, v);
        } else {
            self.link_right(p, v);
        }
    }

    fn minimum(&self, mut x: DirId) -> DirId {
        while !self.left(x).is_none() {
            x = self.left(x);
        }
        x
    }

    fn rotate_left(&mut self, storage: DirId, x: DirId) {
        let y = self.right(x);
        self.link_right(x, self.left(y));
        let p = self.parent_of(x);
        if p.is_none() {
            self.set_subtree_root(storage, y);
        } else if self.left(p) == x {
            self.link_left(p, y);
        } else {
            self.link_right(p, y);
        }
        self.link_left(y, x);
    }

    fn rotate_right(&mut self, storage: DirId, x: DirId) {
        let y = self.left(x);
        self.link_left(x, self.right(y));
        let p = self.parent_of(x);
        if p.is_none() {
            self.set_subtree_root(storage, y);
        } else if self.right(p) == x {
            self.link_right(p, y);
        } else {
            self.link_left(p, y);
        }
        self.link_right(y, x);
    }

    // ---- insertion ----

    /// BST-links `z` (already present in `self.entries`, colored red, with
    /// `left`/`right` set to `NOSTREAM`) into `storage`'s tree and restores the
    /// red–black invariants.
    fn link_new_node(&mut self, storage: DirId, z: DirId) -> CfbResult<()> {
        let root = self.entries[storage.index()].child;
        if root.is_none() {
            self.set_subtree_root(storage, z);
            self.set_color(z, Color::Black);
            return Ok(());
        }

        let z_key = name_order_key(&self.entries[z.index()].name);
        let mut y = DirId::NOSTREAM;
        let mut x = root;
        while !x.is_none() {
            y = x;
            match z_key.cmp(&name_order_key(&self.entries[x.index()].name)) {
                Ordering::Less => x = self.left(x),
                Ordering::Greater => x = self.right(x),
                Ordering::Equal => return Err(CfbError::NameCollision),
            }
        }

        if z_key < name_order_key(&self.entries[y.index()].name) {
            self.link_left(y, z);
        } else {
            self.link_right(y, z);
        }

        self.insert_fixup(storage, z);
        Ok(())
    }

    fn insert_fixup(&mut self, storage: DirId, mut z: DirId) {
        while self.color_of(self.parent_of(z)) == Color::Red {
            let p = self.parent_of(z);
            let g = self.parent_of(p);
            if p == self.left(g) {
                let u = self.right(g);
                if self.color_of(u) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(u, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(storage, z);
                    }
                    let p2 = self.parent_of(z);
                    let g2 = self.parent_of(p2);
                    self.set_color(p2, Color::Black);
                    self.set_color(g2, Color::Red);
                    self.rotate_right(storage, g2);
                }
            } else {
                let u = self.left(g);
                if self.color_of(u) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(u, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(storage, z);
                    }
                    let p2 = self.parent_of(z);
                    let g2 = self.parent_of(p2);
                    self.set_color(p2, Color::Black);
                    self.set_color(g2, Color::Red);
                    self.rotate_left(storage, g2);
                }
            }
        }
        let root = self.entries[storage.index()].child;
        self.set_color(root, Color::Black);
    }

    // ---- deletion ----

    fn unlink(&mut self, storage: DirId, z: DirId) -> CfbResult<()> {
        let mut y = z;
        let mut y_original_color = self.color_of(y);
        let x;
        let x_parent;

        if self.left(z).is_none() {
            x = self.right(z);
            x_parent = self.parent_of(z);
            self.transplant(storage, z, x);
        } else if self.right(z).is_none() {
            x = self.left(z);
            x_parent = self.parent_of(z);
            self.transplant(storage, z, x);
        } else {
            y = self.minimum(self.right(z));
            y_original_color = self.color_of(y);
            let x_of_y = self.right(y);
            if self.parent_of(y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent_of(y);
                self.transplant(storage, y, self.right(y));
                self.link_right(y, self.right(z));
            }
            x = x_of_y;
            self.transplant(storage, z, y);
            self.link_left(y, self.left(z));
            self.set_color(y, self.color_of(z));
        }

        if y_original_color == Color::Black {
            self.delete_fixup(storage, x, x_parent);
        }
        Ok(())
    }

    fn delete_fixup(&mut self, storage: DirId, mut x: DirId, mut x_parent: DirId) {
        while x != self.entries[storage.index()].child && self.color_of(x) == Color::Black {
            if x == self.left(x_parent) {
                let mut w = self.right(x_parent);
                if self.color_of(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_left(storage, x_parent);
                    w = self.right(x_parent);
                }
                if self.color_of(self.left(w)) == Color::Black && self.color_of(self.right(w)) == Color::Black {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent_of(x);
                } else {
                    if self.color_of(self.right(w)) == Color::Black {
                        self.set_color(self.left(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(storage, w);
                        w = self.right(x_parent);
                    }
                    self.set_color(w, self.color_of(x_parent));
                    self.set_color(x_parent, Color::Black);
                    self.set_color(self.right(w), Color::Black);
                    self.rotate_left(storage, x_parent);
                    x = self.entries[storage.index()].child;
                    break;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.color_of(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_right(storage, x_parent);
                    w = self.left(x_parent);
                }
                if self.color_of(self.right(w)) == Color::Black && self.color_of(self.left(w)) == Color::Black {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent_of(x);
                } else {
                    if self.color_of(self.left(w)) == Color::Black {
                        self.set_color(self.right(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(storage, w);
                        w = self.left(x_parent);
                    }
                    self.set_color(w, self.color_of(x_parent));
                    self.set_color(x_parent, Color::Black);
                    self.set_color(self.left(w), Color::Black);
                    self.rotate_right(storage, x_parent);
                    x = self.entries[storage.index()].child;
                    break;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    // ---- load-time validation and repaint ----

    fn validate_bst(
        &self,
        x: DirId,
        lo: Option<&(usize, Vec<u16>)>,
        hi: Option<&(usize, Vec<u16>)>,
        visited: &mut HashSet<DirId>,
    ) -> bool {
        if x.is_none() {
            return true;
        }
        if !visited.insert(x) {
            return false;
        }
        let key = name_order_key(&self.entries[x.index()].name);
        if let Some(lo) = lo {
            if key <= *lo {
                return false;
            }
        }
        if let Some(hi) = hi {
            if key >= *hi {
                return false;
            }
        }
        self.validate_bst(self.left(x), lo, Some(&key), visited)
            && self.validate_bst(self.right(x), Some(&key), hi, visited)
    }

    fn link_subtree(&mut self, storage: DirId, root: DirId) {
        self.parent[root.index()] = DirId::NOSTREAM;
        self.owner[root.index()] = storage;
        self.link_children(storage, root);
    }

    fn link_children(&mut self, storage: DirId, x: DirId) {
        let l = self.entries[x.index()].left;
        let r = self.entries[x.index()].right;
        if !l.is_none() {
            self.parent[l.index()] = x;
            self.owner[l.index()] = storage;
            self.link_children(storage, l);
        }
        if !r.is_none() {
            self.parent[r.index()] = x;
            self.owner[r.index()] = storage;
            self.link_children(storage, r);
        }
    }

    fn is_valid_rb(&self, root: DirId) -> bool {
        self.color_of(root) == Color::Black && self.black_height(root).is_some()
    }

    fn black_height(&self, x: DirId) -> Option<u32> {
        if x.is_none() {
            return Some(1);
        }
        if self.color_of(x) == Color::Red
            && (self.color_of(self.left(x)) == Color::Red || self.color_of(self.right(x)) == Color::Red)
        {
            return None;
        }
        let bl = self.black_height(self.left(x))?;
        let br = self.black_height(self.right(x))?;
        if bl != br {
            return None;
        }
        Some(bl + if self.color_of(x) == Color::Black { 1 } else { 0 })
    }

    /// Recomputes a valid red–black coloring for `storage`'s child tree, keeping
    /// its shape exactly as-is. Fails if the shape itself admits no valid
    /// coloring (true red–black trees of bounded height cannot take every BST
    /// shape).
    fn repaint(&mut self, storage: DirId) -> CfbResult<()> {
        let root = self.entries[storage.index()].child;
        if root.is_none() {
            return Ok(());
        }
        let (black_option, _) = self.coloring_options(root);
        let target = black_option.ok_or_else(|| {
            CfbError::DirEntry(format!(
                "storage {}'s child tree has no valid red-black coloring",
                storage.0
            ))
        })?;
        self.assign_coloring(root, target, true)
    }

    /// Returns `(contribution if colored black, contribution if colored red)`
    /// for the subtree rooted at `x`, where "contribution" is the number of
    /// black nodes `x`'s parent would count along the path through `x`. A red
    /// coloring is only offered when the comparison value is unambiguous (its
    /// two children's black-only contributions agree).
    fn coloring_options(&self, x: DirId) -> (Option<u32>, Option<u32>) {
        if x.is_none() {
            return (Some(1), None);
        }
        let (lb, lr) = self.coloring_options(self.left(x));
        let (rb, rr) = self.coloring_options(self.right(x));

        let l_candidates: Vec<u32> = [lb, lr].into_iter().flatten().collect();
        let r_candidates: Vec<u32> = [rb, rr].into_iter().flatten().collect();
        let black = l_candidates
            .iter()
            .find(|lc| r_candidates.contains(lc))
            .map(|&lc| lc + 1);

        let red = match (lb, rb) {
            (Some(l), Some(r)) if l == r => Some(l),
            _ => None,
        };

        (black, red)
    }

    fn assign_coloring(&mut self, x: DirId, target: u32, force_black: bool) -> CfbResult<()> {
        if x.is_none() {
            return Ok(());
        }
        let (black, red) = self.coloring_options(x);
        if !force_black && red == Some(target) {
            self.set_color(x, Color::Red);
            self.assign_coloring(self.left(x), target, true)?;
            self.assign_coloring(self.right(x), target, true)
        } else if black == Some(target) {
            self.set_color(x, Color::Black);
            self.assign_coloring(self.left(x), target - 1, false)?;
            self.assign_coloring(self.right(x), target - 1, false)
        } else {
            Err(CfbError::DirEntry(format!(
                "directory entry {} has an inconsistent subtree for coloring",
                x.0
            )))
        }
    }
}

fn blank_entry(name: String) -> DirEntry {
    DirEntry {
        name,
        object_type: ObjectType::Empty,
        color: Color::Red,
        left: DirId::NOSTREAM,
        right: DirId::NOSTREAM,
        child: DirId::NOSTREAM,
        clsid: [0u8; 16],
        state_bits: 0,
        created: None,
        modified: None,
        start_sector: SectorId::END,
        size: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::LogSink;

    #[test]
    fn insert_and_lookup_roundtrip() {
        let mut tree = DirectoryTree::new_empty();
        let root = tree.root();
        let s = tree.insert_storage(root, "S".to_string()).unwrap();
        let a = tree.insert_stream(s, "a".to_string(), SectorId::END, 5).unwrap();
        assert_eq!(tree.lookup(s, "a"), Some(a));
        assert_eq!(tree.entry(a).size, 5);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut tree = DirectoryTree::new_empty();
        let root = tree.root();
        tree.insert_stream(root, "x".to_string(), SectorId::END, 0).unwrap();
        let err = tree.insert_stream(root, "x".to_string(), SectorId::END, 0).unwrap_err();
        assert!(matches!(err, CfbError::NameCollision));
    }

    #[test]
    fn delete_frees_slot_for_lifo_reuse() {
        let mut tree = DirectoryTree::new_empty();
        let root = tree.root();
        let a = tree.insert_stream(root, "a".to_string(), SectorId::END, 3).unwrap();
        tree.delete(a).unwrap();
        let b = tree.insert_stream(root, "b".to_string(), SectorId::END, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rename_reorders_in_order_traversal() {
        let mut tree = DirectoryTree::new_empty();
        let root = tree.root();
        tree.insert_stream(root, "aa".to_string(), SectorId::END, 0).unwrap();
        tree.insert_stream(root, "bb".to_string(), SectorId::END, 0).unwrap();
        let aa = tree.lookup(root, "aa").unwrap();
        tree.rename(aa, "zz".to_string()).unwrap();
        let names: Vec<String> = tree.children(root).into_iter().map(|id| tree.entry(id).name.clone()).collect();
        assert_eq!(names, vec!["bb".to_string(), "zz".to_string()]);
    }

    #[test]
    fn rename_to_colliding_name_fails_without_mutating() {
        let mut tree = DirectoryTree::new_empty();
        let root = tree.root();
        tree.insert_stream(root, "aa".to_string(), SectorId::END, 0).unwrap();
        tree.insert_stream(root, "bb".to_string(), SectorId::END, 0).unwrap();
        let aa = tree.lookup(root, "aa").unwrap();
        let err = tree.rename(aa, "bb".to_string()).unwrap_err();
        assert!(matches!(err, CfbError::NameCollision));
        assert_eq!(tree.entry(aa).name, "aa");
    }

    #[test]
    fn deleting_only_child_clears_storage_child_pointer() {
        let mut tree = DirectoryTree::new_empty();
        let root = tree.root();
        let a = tree.insert_stream(root, "a".to_string(), SectorId::END, 0).unwrap();
        tree.delete(a).unwrap();
        assert_eq!(tree.entry(root).child, DirId::NOSTREAM);
    }

    #[test]
    fn many_inserts_preserve_red_black_properties() {
        let mut tree = DirectoryTree::new_empty();
        let root = tree.root();
        for i in 0..100 {
            tree.insert_stream(root, format!("n{i:03}"), SectorId::END, 0).unwrap();
        }
        assert!(tree.is_valid_rb(tree.entry(root).child));
    }

    #[test]
    fn encode_decode_entry_round_trips() {
        let entry = DirEntry {
            name: "hello".to_string(),
            object_type: ObjectType::Stream,
            color: Color::Red,
            left: DirId::NOSTREAM,
            right: DirId::NOSTREAM,
            child: DirId::NOSTREAM,
            clsid: [7u8; 16],
            state_bits: 0,
            created: None,
            modified: None,
            start_sector: SectorId(4),
            size: 5,
        };
        let bytes = encode_entry(&entry).unwrap();
        assert_eq!(bytes.len(), DIR_ENTRY_LEN);
        let decoded = decode_entry(&bytes, &LogSink).unwrap();
        assert_eq!(decoded.name, "hello");
        assert_eq!(decoded.start_sector, SectorId(4));
        assert_eq!(decoded.size, 5);
    }

    #[test]
    fn out_of_range_start_sector_is_a_diagnostic() {
        let mut entry = DirEntry {
            object_type: ObjectType::Stream,
            start_sector: SectorId(0xFFFF_FFFA),
            ..blank_entry("bad".to_string())
        };
        entry.color = Color::Black;
        let bytes = encode_entry(&entry).unwrap();
        let sink = crate::diagnostics::CollectingSink::new();
        let decoded = decode_entry(&bytes, &sink).unwrap();
        assert!(!decoded.start_sector.is_regular());
        assert!(sink
            .take()
            .iter()
            .any(|d| d.kind == DiagnosticKind::DirSectorWarning));
    }
}
