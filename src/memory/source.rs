//! Byte sources that back a [`MemoryMap`](super::MemoryMap).
//!
//! A source is a flat, offset-addressed run of bytes. Some sources can hand out
//! host slices directly (owned buffers, memory-mapped files); others can only
//! copy (a live process, where any page may vanish between two reads).

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use super::MemoryMap;
use crate::error::{Error, Result};

/// A readable, offset-addressed byte store.
pub trait ByteSource: fmt::Debug + Send + Sync {
    /// Returns the number of addressable bytes.
    fn len(&self) -> u64;

    /// Returns true if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `len` bytes at `offset` without copying, if the source allows it.
    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]>;

    /// Copies bytes at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, which is short when the source ends
    /// or a page is unreadable. Zero means nothing is readable at `offset`.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Copies from a contiguous in-host slice.
fn copy_from_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    let Some(rest) = data.get(start..) else {
        return 0;
    };
    let count = rest.len().min(buf.len());
    buf[..count].copy_from_slice(&rest[..count]);
    count
}

fn slice_of(data: &[u8], offset: u64, len: usize) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    data.get(start..start.checked_add(len)?)
}

// =============================================================================
// Owned Buffer
// =============================================================================

/// Bytes held in memory.
pub struct BufferSource {
    data: Vec<u8>,
}

impl BufferSource {
    /// Wraps an owned buffer.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl fmt::Debug for BufferSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSource")
            .field("len", &self.data.len())
            .finish()
    }
}

impl ByteSource for BufferSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        slice_of(&self.data, offset, len)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(copy_from_slice(&self.data, offset, buf))
    }
}

// =============================================================================
// Memory-Mapped File
// =============================================================================

/// A read-only memory-mapped file.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    mmap: Mmap,
}

impl FileSource {
    /// Opens and maps `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        // SAFETY: the map is read-only; callers accept that a concurrent writer
        // to the file may change the bytes observed.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        tracing::debug!("mapped {} ({} bytes)", path.display(), mmap.len());
        Ok(Self { path, mmap })
    }

    /// Returns the path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        slice_of(&self.mmap, offset, len)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(copy_from_slice(&self.mmap, offset, buf))
    }
}

// =============================================================================
// Live Process
// =============================================================================

/// Page size used to split process reads.
pub const PROCESS_PAGE_SIZE: u64 = 0x1000;

/// A platform primitive that reads another process's address space.
pub trait ProcessMemory: fmt::Debug + Send + Sync {
    /// Reads at `address`, returning the number of bytes read.
    fn read_at(&self, address: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Reads a process through `/proc/<pid>/mem`.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct ProcMem {
    file: File,
}

#[cfg(target_os = "linux")]
impl ProcMem {
    /// Opens the memory file of `pid`.
    pub fn open(pid: u32) -> Result<Self> {
        let file = File::open(format!("/proc/{pid}/mem"))
            .map_err(|source| Error::ProcessAccess { pid, source })?;
        Ok(Self { file })
    }
}

#[cfg(target_os = "linux")]
impl ProcessMemory for ProcMem {
    fn read_at(&self, address: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, address)
    }
}

/// The address space of a running process.
///
/// Reads are split at page boundaries and stop at the first page that cannot
/// be read, so a request straddling an unmapped page returns a short count.
#[derive(Debug)]
pub struct ProcessSource<P: ProcessMemory> {
    pid: u32,
    memory: P,
}

impl<P: ProcessMemory> ProcessSource<P> {
    /// Wraps a memory reader for `pid`.
    pub fn new(pid: u32, memory: P) -> Self {
        Self { pid, memory }
    }

    /// Returns the process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl<P: ProcessMemory> ByteSource for ProcessSource<P> {
    fn len(&self) -> u64 {
        u64::MAX
    }

    fn slice(&self, _offset: u64, _len: usize) -> Option<&[u8]> {
        None
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let Some(address) = offset.checked_add(done as u64) else {
                break;
            };
            let page_left = PROCESS_PAGE_SIZE - (address % PROCESS_PAGE_SIZE);
            let chunk = (buf.len() - done).min(page_left as usize);

            match self.memory.read_at(address, &mut buf[done..done + chunk]) {
                Ok(0) => break,
                Ok(count) => done += count,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && done == 0 => {
                    return Err(Error::ProcessAccess {
                        pid: self.pid,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::trace!("pid {} unreadable at {:#x}: {}", self.pid, address, e);
                    break;
                }
            }
        }
        Ok(done)
    }
}

// =============================================================================
// Window Onto Another Map
// =============================================================================

/// Exposes another [`MemoryMap`] as a source, addressed by its context addresses.
///
/// Used to re-address a range of one map under different context addresses,
/// for example a segment's VM range over its file bytes.
#[derive(Debug, Clone)]
pub struct WindowSource {
    map: Arc<MemoryMap>,
}

impl WindowSource {
    /// Creates a window onto `map`.
    pub fn new(map: Arc<MemoryMap>) -> Self {
        Self { map }
    }
}

impl ByteSource for WindowSource {
    fn len(&self) -> u64 {
        u64::MAX
    }

    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        self.map.direct(offset, len)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self.map.copy_bytes(0, offset, buf, false) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == crate::error::ErrorKind::Overflow => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TwoPages;

    impl ProcessMemory for TwoPages {
        fn read_at(&self, address: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            if address >= 2 * PROCESS_PAGE_SIZE {
                return Err(std::io::Error::from_raw_os_error(5));
            }
            buf.fill(0xAB);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_buffer_source() {
        let source = BufferSource::new(vec![1, 2, 3, 4]);
        assert_eq!(source.len(), 4);
        assert_eq!(source.slice(1, 2), Some(&[2u8, 3][..]));
        assert_eq!(source.slice(3, 2), None);

        let mut buf = [0u8; 8];
        assert_eq!(source.read_into(2, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert_eq!(source.read_into(9, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_process_source_stops_at_unreadable_page() {
        let source = ProcessSource::new(1, TwoPages);
        let mut buf = vec![0u8; 0x20];
        let start = 2 * PROCESS_PAGE_SIZE - 0x10;
        assert_eq!(source.read_into(start, &mut buf).unwrap(), 0x10);
        assert!(buf[..0x10].iter().all(|&b| b == 0xAB));
        assert_eq!(source.read_into(2 * PROCESS_PAGE_SIZE, &mut buf).unwrap(), 0);
        assert!(source.slice(0, 1).is_none());
    }

    #[test]
    fn test_file_source() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\xcf\xfa\xed\xfe rest").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.len(), 9);
        assert_eq!(source.slice(0, 4), Some(&b"\xcf\xfa\xed\xfe"[..]));
        assert_eq!(source.path(), file.path());

        let err = FileSource::open("/nonexistent/machtree/file").unwrap_err();
        assert!(matches!(err, Error::FileOpen { .. }));
    }
}
