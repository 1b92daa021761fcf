//! The random-access byte device abstraction the rest of the engine is built on.
//!
//! Grounded on the generic `CompoundFile<F>` backing-store pattern in
//! `61e88a7b_ermakus-rust-cfb` (which is itself generic over `Read + Write + Seek`),
//! narrowed to an explicit positional-I/O trait per spec §2.1 so the Sector Store
//! never needs to track a cursor position of its own.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// A random-access byte store: read at an offset, write at an offset, query and
/// change the length, flush. A `File` and an in-memory buffer both conform.
///
/// All methods take `&mut self`: per spec §5 the container owns its device
/// exclusively and never performs concurrent I/O against it, so there is no need
/// for interior mutability or positioned-I/O traits that would allow shared access.
pub trait Device {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the number of
    /// bytes actually read. Reading past the end of the device is not an error —
    /// it returns fewer bytes (possibly zero); callers are responsible for the
    /// `Truncated` diagnostic policy described in spec §7.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `buf` at `offset`, growing the device if the write extends past the
    /// current end.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Current length of the device, in bytes.
    fn len(&mut self) -> io::Result<u64>;

    /// True if the device is currently empty.
    fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates or extends the device to exactly `len` bytes. Extension
    /// zero-fills.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Flushes any buffered writes to stable storage.
    fn flush(&mut self) -> io::Result<()>;
}

/// A `Device` backed by an OS file handle.
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    pub fn new(file: File) -> Self {
        FileDevice { file }
    }

    pub fn into_inner(self) -> File {
        self.file
    }
}

impl Device for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn len(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

/// A `Device` backed by an in-memory buffer. Useful for tests and for callers who
/// want to build a container entirely in memory before writing it out.
#[derive(Debug, Default, Clone)]
pub struct MemDevice {
    buf: Vec<u8>,
}

impl MemDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        MemDevice { buf }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Device for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.buf.len() {
            return Ok(0);
        }
        let available = &self.buf[offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let offset = offset as usize;
        let end = offset + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.buf.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_grows_on_write() {
        let mut dev = MemDevice::new();
        dev.write_at(10, b"hi").unwrap();
        assert_eq!(dev.len().unwrap(), 12);
        let mut buf = [0u8; 2];
        dev.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn mem_device_read_past_end_returns_short() {
        let mut dev = MemDevice::from_vec(vec![1, 2, 3]);
        let mut buf = [0u8; 8];
        let n = dev.read_at(1, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[2, 3]);
    }

    #[test]
    fn file_device_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut dev = FileDevice::new(tmp.reopen().unwrap());
        dev.set_len(16).unwrap();
        dev.write_at(4, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        dev.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
