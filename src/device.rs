//! Block device abstraction: positional page I/O against a file or a
//! memory buffer.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// The device a page manager talks to. All offsets are absolute byte
/// offsets; the page manager guarantees they are page aligned.
pub trait Device: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn truncate(&mut self, len: u64) -> Result<()>;
    fn len(&self) -> u64;
    fn sync(&mut self) -> Result<()>;
    fn is_in_memory(&self) -> bool {
        false
    }

    /// Extends the device by one page and returns the address of the new
    /// page. The page contents are zero until first written.
    fn alloc_page(&mut self, page_size: u64) -> Result<u64>;
}

pub type SharedDevice = Arc<Mutex<Box<dyn Device>>>;

pub fn shared(device: Box<dyn Device>) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

/// Positional file I/O. The logical length is tracked explicitly so that
/// `alloc_page` can hand out addresses without eagerly zero-filling.
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, mut offset: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !dst.is_empty() {
        let read = file.read_at(dst, offset)?;
        if read == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at hit EOF"));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        offset += read as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, mut offset: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !src.is_empty() {
        let written = file.write_at(src, offset)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "write_at wrote zero bytes",
            ));
        }
        src = &src[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, offset)?;
        if read == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "seek_read hit EOF"));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        offset += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        let written = file.seek_write(src, offset)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "seek_write wrote zero bytes",
            ));
        }
        src = &src[written..];
        offset += written as u64;
    }
    Ok(())
}

impl Device for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.len {
            return Err(Error::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        // The file on disk can be shorter than the logical length when
        // pages were allocated but never flushed; the tail reads as zeroes.
        let on_disk = self.file.metadata()?.len();
        if offset >= on_disk {
            buf.fill(0);
            return Ok(());
        }
        if end <= on_disk {
            read_exact_at(&self.file, offset, buf)?;
        } else {
            let split = (on_disk - offset) as usize;
            read_exact_at(&self.file, offset, &mut buf[..split])?;
            buf[split..].fill(0);
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at(&self.file, offset, data)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn alloc_page(&mut self, page_size: u64) -> Result<u64> {
        let address = self.len;
        self.len += page_size;
        Ok(address)
    }
}

/// Vec-backed device for in-memory environments and tests.
#[derive(Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for MemoryDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.data.len() as u64 {
            return Err(Error::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        buf.copy_from_slice(&self.data[offset as usize..end as usize]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = (offset + data.len() as u64) as usize;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.data.truncate(len as usize);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        true
    }

    fn alloc_page(&mut self, page_size: u64) -> Result<u64> {
        let address = self.data.len() as u64;
        self.data.resize(self.data.len() + page_size as usize, 0);
        Ok(address)
    }
}
