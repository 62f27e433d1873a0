//! # Dump access
//!
//! The captured address space, presented as a sorted list of disjoint
//! [`Segment`]s.
//!
//! ## Layering
//!
//! A core file rarely contains every byte the process could address. Text
//! and read-only data mappings are usually left out because they can be
//! recovered from the executable. The [`SegmentMap`] therefore stacks three
//! layers:
//!
//! 1. Loadable data from the executable (the metadata file)
//! 2. Loadable data from the core, which wins wherever both exist
//! 3. Zero fill for ranges that are mapped but have no bytes anywhere
//!
//! Zero-filled ranges are reported as [`DiagnosticKind::MissingData`](crate::diagnostics::DiagnosticKind).
//!
//! ## Laziness
//!
//! Segments never hold their bytes. Each read goes to the backing
//! [`ByteSource`], which for a core file is a seek into the file.

mod elf;
mod source;

use std::fmt;
use std::sync::Arc;

use gimli::{Endianity, RunTimeEndian};

pub use self::elf::{open_core, CoreDump, ExecutableLayer, LoadRange};
pub use self::source::{ByteSource, FileSource, MemorySource};
use crate::error::{HeapdigError, Result};
use crate::types::{Address, Architecture};

/// Access rights of a mapping at capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions
{
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions
{
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        execute: false,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        execute: false,
    };
    pub const READ_EXECUTE: Self = Self {
        read: true,
        write: false,
        execute: true,
    };

    /// Decode ELF `p_flags`
    pub fn from_elf_flags(flags: u32) -> Self
    {
        Self {
            read: flags & object::elf::PF_R != 0,
            write: flags & object::elf::PF_W != 0,
            execute: flags & object::elf::PF_X != 0,
        }
    }
}

impl fmt::Display for Permissions
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(f, "{}{}{}", flag(self.read, 'r'), flag(self.write, 'w'), flag(self.execute, 'x'))
    }
}

/// Which layer a segment's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentOrigin
{
    Core,
    Executable,
    ZeroFill,
}

#[derive(Debug, Clone)]
enum Backing
{
    Source
    {
        source: Arc<dyn ByteSource>,
        offset: u64,
    },
    Zero,
}

/// A contiguous, mapped range of the dumped address space
#[derive(Debug, Clone)]
pub struct Segment
{
    start: Address,
    len: u64,
    permissions: Permissions,
    origin: SegmentOrigin,
    backing: Backing,
}

impl Segment
{
    /// A segment whose bytes live in `source` starting at `offset`
    pub fn new(
        start: Address,
        len: u64,
        permissions: Permissions,
        origin: SegmentOrigin,
        source: Arc<dyn ByteSource>,
        offset: u64,
    ) -> Self
    {
        Self {
            start,
            len,
            permissions,
            origin,
            backing: Backing::Source { source, offset },
        }
    }

    /// A segment that reads as zeroes
    pub fn zeroed(start: Address, len: u64, permissions: Permissions, origin: SegmentOrigin) -> Self
    {
        Self {
            start,
            len,
            permissions,
            origin,
            backing: Backing::Zero,
        }
    }

    /// A core segment over an in-memory buffer
    ///
    /// ```rust
    /// use heapdig_core::dump::{Permissions, Segment};
    /// use heapdig_core::types::Address;
    ///
    /// let segment = Segment::from_bytes(Address::new(0x1000), vec![0u8; 64], Permissions::READ_WRITE);
    /// assert!(segment.contains(Address::new(0x103f)));
    /// assert!(!segment.contains(Address::new(0x1040)));
    /// ```
    pub fn from_bytes(start: Address, bytes: impl Into<Arc<[u8]>>, permissions: Permissions) -> Self
    {
        let source = MemorySource::new(bytes);
        let len = source.len();
        Self::new(start, len, permissions, SegmentOrigin::Core, Arc::new(source), 0)
    }

    pub fn start(&self) -> Address
    {
        self.start
    }

    /// One past the last mapped byte
    pub fn end(&self) -> Address
    {
        self.start.saturating_add(self.len)
    }

    pub fn len(&self) -> u64
    {
        self.len
    }

    pub fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    pub fn permissions(&self) -> Permissions
    {
        self.permissions
    }

    pub fn origin(&self) -> SegmentOrigin
    {
        self.origin
    }

    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.start && address < self.end()
    }

    /// True if `[address, address + length)` lies entirely inside this segment
    pub fn covers(&self, address: Address, length: u64) -> bool
    {
        match (address.offset_from(self.start), address.checked_add(length)) {
            (Some(offset), Some(_)) => offset <= self.len && length <= self.len - offset,
            _ => false,
        }
    }

    fn read_into(&self, address: Address, buf: &mut [u8]) -> Result<()>
    {
        let length = buf.len() as u64;
        let Some(offset) = address.offset_from(self.start).filter(|_| self.covers(address, length)) else {
            return Err(HeapdigError::OutOfBounds { address, length });
        };
        match &self.backing {
            Backing::Source { source, offset: base } => source.read_at(base + offset, buf),
            Backing::Zero => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    /// Restrict this segment to `[start, start + len)`, keeping its backing aligned
    pub(crate) fn slice(&self, start: Address, len: u64) -> Self
    {
        let delta = start.offset_from(self.start).unwrap_or(0);
        let backing = match &self.backing {
            Backing::Source { source, offset } => Backing::Source {
                source: Arc::clone(source),
                offset: offset + delta,
            },
            Backing::Zero => Backing::Zero,
        };
        Self {
            start,
            len,
            permissions: self.permissions,
            origin: self.origin,
            backing,
        }
    }
}

/// The dumped address space as disjoint, address-ordered segments
///
/// All multi-byte reads use the dumped process's byte order.
#[derive(Debug, Clone)]
pub struct SegmentMap
{
    architecture: Architecture,
    endian: RunTimeEndian,
    segments: Vec<Segment>,
}

impl SegmentMap
{
    /// Build a map from arbitrary segments
    ///
    /// Segments are sorted by start address. Overlapping segments make the
    /// container inconsistent and are rejected with `MalformedContainer`;
    /// empty segments are dropped.
    pub fn new(architecture: Architecture, endian: RunTimeEndian, mut segments: Vec<Segment>) -> Result<Self>
    {
        segments.retain(|segment| !segment.is_empty());
        segments.sort_by_key(Segment::start);
        for pair in segments.windows(2) {
            if pair[1].start() < pair[0].end() {
                return Err(HeapdigError::MalformedContainer(format!(
                    "segments [{}, {}) and [{}, {}) overlap",
                    pair[0].start(),
                    pair[0].end(),
                    pair[1].start(),
                    pair[1].end()
                )));
            }
        }

        Ok(Self {
            architecture,
            endian,
            segments,
        })
    }

    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    pub fn endian(&self) -> RunTimeEndian
    {
        self.endian
    }

    pub fn pointer_size(&self) -> u64
    {
        u64::from(self.architecture.pointer_size_bytes())
    }

    pub fn segments(&self) -> &[Segment]
    {
        &self.segments
    }

    /// The segment containing `address`, or `None` if it is unmapped
    pub fn segment_containing(&self, address: Address) -> Option<&Segment>
    {
        let index = self.segments.partition_point(|segment| segment.end() <= address);
        self.segments.get(index).filter(|segment| segment.contains(address))
    }

    pub fn is_mapped(&self, address: Address) -> bool
    {
        self.segment_containing(address).is_some()
    }

    pub fn is_writable(&self, address: Address) -> bool
    {
        self.segment_containing(address)
            .is_some_and(|segment| segment.permissions().write)
    }

    /// The segment that fully covers `[address, address + length)`
    pub fn covering(&self, address: Address, length: u64) -> Result<&Segment>
    {
        self.segment_containing(address)
            .filter(|segment| segment.covers(address, length))
            .ok_or(HeapdigError::OutOfBounds { address, length })
    }

    /// Read `length` bytes starting at `address`
    ///
    /// Fails with `OutOfBounds` unless one segment covers the whole range.
    pub fn read(&self, address: Address, length: u64) -> Result<Vec<u8>>
    {
        let segment = self.covering(address, length)?;
        let size = usize::try_from(length).map_err(|_| HeapdigError::OutOfBounds { address, length })?;
        let mut buf = vec![0u8; size];
        segment.read_into(address, &mut buf)?;
        Ok(buf)
    }

    pub fn read_into(&self, address: Address, buf: &mut [u8]) -> Result<()>
    {
        self.covering(address, buf.len() as u64)?.read_into(address, buf)
    }

    /// Read one pointer-sized word
    pub fn read_ptr(&self, address: Address) -> Result<Address>
    {
        self.read_uint(address, self.pointer_size()).map(Address::from)
    }

    /// Read an unsigned integer of `size` bytes (1, 2, 4 or 8)
    pub fn read_uint(&self, address: Address, size: u64) -> Result<u64>
    {
        let mut buf = [0u8; 8];
        let width = usize::try_from(size).ok().filter(|width| matches!(width, 1 | 2 | 4 | 8));
        let Some(width) = width else {
            return Err(HeapdigError::InvalidArgument(format!("unsupported integer width {size}")));
        };
        self.read_into(address, &mut buf[..width])?;
        Ok(self.decode_uint(&buf[..width]))
    }

    /// Decode an unsigned integer from already-read bytes
    ///
    /// Widths other than 1, 2, 4 and 8 decode as zero.
    pub fn decode_uint(&self, bytes: &[u8]) -> u64
    {
        match bytes.len() {
            1 => u64::from(bytes[0]),
            2 => u64::from(self.endian.read_u16(bytes)),
            4 => u64::from(self.endian.read_u32(bytes)),
            8 => self.endian.read_u64(bytes),
            _ => 0,
        }
    }

    /// Encode `value` as a pointer-sized word in the dump's byte order
    pub fn encode_ptr(&self, value: u64) -> Vec<u8>
    {
        let mut bytes = if self.endian.is_little_endian() {
            value.to_le_bytes().to_vec()
        } else {
            value.to_be_bytes().to_vec()
        };
        let width = usize::from(self.architecture.pointer_size_bytes());
        if self.endian.is_little_endian() {
            bytes.truncate(width);
        } else {
            bytes.drain(..8 - width);
        }
        bytes
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn map() -> SegmentMap
    {
        let mut heap = vec![0u8; 0x100];
        heap[0x10..0x18].copy_from_slice(&0xdead_beef_u64.to_le_bytes());
        SegmentMap::new(
            Architecture::X86_64,
            RunTimeEndian::Little,
            vec![
                Segment::from_bytes(Address::new(0x3000), heap, Permissions::READ_WRITE),
                Segment::zeroed(Address::new(0x1000), 0x1000, Permissions::READ_ONLY, SegmentOrigin::ZeroFill),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_segments_sorted()
    {
        let map = map();
        let starts: Vec<_> = map.segments().iter().map(Segment::start).collect();
        assert_eq!(starts, vec![Address::new(0x1000), Address::new(0x3000)]);
    }

    #[test]
    fn test_segment_containing()
    {
        let map = map();
        assert_eq!(map.segment_containing(Address::new(0x1fff)).map(Segment::start), Some(Address::new(0x1000)));
        assert!(map.segment_containing(Address::new(0x2000)).is_none());
        assert!(map.segment_containing(Address::new(0x30ff)).is_some());
        assert!(map.segment_containing(Address::new(0x3100)).is_none());
        assert!(map.segment_containing(Address::ZERO).is_none());
    }

    #[test]
    fn test_read_ptr_and_zero_fill()
    {
        let map = map();
        assert_eq!(map.read_ptr(Address::new(0x3010)).unwrap(), Address::new(0xdead_beef));
        assert_eq!(map.read(Address::new(0x1800), 4).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_read_across_segment_end_is_out_of_bounds()
    {
        let map = map();
        let err = map.read(Address::new(0x30f8), 16).unwrap_err();
        assert!(matches!(err, HeapdigError::OutOfBounds { length: 16, .. }));
        assert!(map.read(Address::new(0x2000), 1).is_err());
    }

    #[test]
    fn test_overlap_rejected()
    {
        let result = SegmentMap::new(
            Architecture::X86_64,
            RunTimeEndian::Little,
            vec![
                Segment::zeroed(Address::new(0x1000), 0x100, Permissions::READ_ONLY, SegmentOrigin::Core),
                Segment::zeroed(Address::new(0x10f0), 0x100, Permissions::READ_ONLY, SegmentOrigin::Core),
            ],
        );
        assert!(matches!(result, Err(HeapdigError::MalformedContainer(_))));
    }

    #[test]
    fn test_writable_lookup()
    {
        let map = map();
        assert!(map.is_writable(Address::new(0x3000)));
        assert!(!map.is_writable(Address::new(0x1000)));
    }

    #[test]
    fn test_encode_ptr_round_trips()
    {
        let map = map();
        let bytes = map.encode_ptr(0xc000_0010_00);
        assert_eq!(bytes.len(), 8);
        assert_eq!(map.decode_uint(&bytes), 0xc000_0010_00);
    }
}
