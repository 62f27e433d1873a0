//! Byte sources backing dump segments.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{HeapdigError, Result};

/// Random-access byte storage behind one or more segments
///
/// Implementations must be shareable across graph workers, so reads take
/// `&self` and any cursor state lives behind interior synchronization.
pub trait ByteSource: Send + Sync + fmt::Debug
{
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Total number of readable bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool
    {
        self.len() == 0
    }
}

/// Seek-based reads from a file on disk
///
/// Nothing is loaded up front; each read seeks to the requested offset. The
/// file handle is shared behind a mutex so the source can serve concurrent
/// graph workers.
pub struct FileSource
{
    path: PathBuf,
    len: u64,
    file: Mutex<File>,
}

impl FileSource
{
    pub fn open(path: &Path) -> Result<Self>
    {
        let file = File::open(path)?;
        Self::from_file(path, file)
    }

    pub fn from_file(path: &Path, file: File) -> Result<Self>
    {
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            len,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }
}

impl fmt::Debug for FileSource
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl ByteSource for FileSource
{
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>
    {
        let mut file = self
            .file
            .lock()
            .map_err(|_| HeapdigError::Io(io::Error::other(format!("{} handle poisoned", self.path.display()))))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn len(&self) -> u64
    {
        self.len
    }
}

/// Bytes already held in memory
///
/// Used for the executable's loadable data (the metadata file is read whole to
/// decode DWARF anyway) and for building segment maps in tests.
#[derive(Clone)]
pub struct MemorySource
{
    data: Arc<[u8]>,
}

impl MemorySource
{
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self
    {
        Self { data: data.into() }
    }
}

impl fmt::Debug for MemorySource
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("MemorySource").field("len", &self.data.len()).finish()
    }
}

impl ByteSource for MemorySource
{
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>
    {
        let start = usize::try_from(offset).ok();
        let range = start.and_then(|start| start.checked_add(buf.len()).map(|end| start..end));
        match range.and_then(|range| self.data.get(range)) {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(HeapdigError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at offset {offset} past end of {} byte buffer", buf.len(), self.data.len()),
            ))),
        }
    }

    fn len(&self) -> u64
    {
        self.data.len() as u64
    }
}
