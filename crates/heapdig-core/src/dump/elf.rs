//! ELF core container parsing.
//!
//! The core is opened through `object`'s `ReadCache`, so only the file header,
//! the program header table and the note segments are read eagerly. Segment
//! contents stay on disk and are fetched with seeks on demand.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use gimli::{Endianity, RunTimeEndian};
use object::elf::{FileHeader64, ET_CORE, NT_PRPSINFO, NT_PRSTATUS, PT_LOAD, PT_NOTE};
use object::read::elf::{FileHeader, ProgramHeader};
use object::read::ReadCache;
use object::{Endian, Endianness, FileKind, ReadRef};
use tracing::{debug, info, warn};

use super::{ByteSource, FileSource, MemorySource, Permissions, Segment, SegmentMap, SegmentOrigin};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::error::{map_container_error, HeapdigError, Result};
use crate::types::{Address, Architecture, ExecutionContext, ProcessId, ProcessInfo, Registers, ThreadId};

/// Offset of `pr_pid` in `struct elf_prstatus` on 64-bit Linux.
const PRSTATUS_PID_OFFSET: usize = 32;
/// Offset of `pr_reg` in `struct elf_prstatus` on 64-bit Linux.
const PRSTATUS_REGS_OFFSET: usize = 112;

const PRPSINFO_PID_OFFSET: usize = 24;
const PRPSINFO_FNAME: std::ops::Range<usize> = 40..56;
const PRPSINFO_PSARGS: std::ops::Range<usize> = 56..136;

/// One loadable range from an ELF program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRange
{
    pub address: Address,
    pub file_offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub permissions: Permissions,
}

impl LoadRange
{
    pub fn end(&self) -> Address
    {
        self.address.saturating_add(self.mem_size)
    }
}

/// Loadable data of the executable, used as the base layer under the core
#[derive(Debug, Clone)]
pub struct ExecutableLayer
{
    data: Arc<[u8]>,
    ranges: Vec<LoadRange>,
}

impl ExecutableLayer
{
    pub fn new(data: Arc<[u8]>, ranges: Vec<LoadRange>) -> Self
    {
        Self { data, ranges }
    }

    pub fn ranges(&self) -> &[LoadRange]
    {
        &self.ranges
    }

    fn segments(&self) -> Vec<Segment>
    {
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Arc::clone(&self.data)));
        let data_len = self.data.len() as u64;
        let mut segments = Vec::new();
        for range in &self.ranges {
            let available = range
                .file_size
                .min(data_len.saturating_sub(range.file_offset))
                .min(range.mem_size);
            segments.push(Segment::new(
                range.address,
                available,
                range.permissions,
                SegmentOrigin::Executable,
                Arc::clone(&source),
                range.file_offset,
            ));
            // .bss and friends: mapped, but legitimately zero in the file image.
            segments.push(Segment::zeroed(
                range.address.saturating_add(available),
                range.mem_size - available,
                range.permissions,
                SegmentOrigin::Executable,
            ));
        }
        segments.retain(|segment| !segment.is_empty());
        segments
    }
}

/// A parsed core file
#[derive(Debug)]
pub struct CoreDump
{
    pub segments: SegmentMap,
    pub process: ProcessInfo,
    pub contexts: Vec<ExecutionContext>,
    pub diagnostics: Vec<Diagnostic>,
}

struct ParsedContainer
{
    architecture: Architecture,
    endian: RunTimeEndian,
    loads: Vec<LoadRange>,
    threads: Vec<(ThreadId, Registers)>,
    process: Option<ProcessInfo>,
}

/// Open an ELF core file and layer it over the executable's loadable data
///
/// ## Errors
///
/// Returns `MalformedContainer` if the file is not a 64-bit x86-64 or AArch64
/// ELF core, if its program headers or notes cannot be read, or if two
/// loadable segments overlap.
pub fn open_core(path: &Path, executable: Option<&ExecutableLayer>) -> Result<CoreDump>
{
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let cache = ReadCache::new(file);
    let parsed = parse_container(&cache)?;
    let source: Arc<dyn ByteSource> = Arc::new(FileSource::from_file(path, cache.into_inner())?);

    let mut diagnostics = Vec::new();
    let segments = layer_segments(&source, file_len, &parsed.loads, executable, &mut diagnostics)?;
    let segments = SegmentMap::new(parsed.architecture, parsed.endian, segments)?;

    let contexts: Vec<ExecutionContext> = parsed
        .threads
        .into_iter()
        .map(|(thread, registers)| {
            let stack = segments.segment_containing(registers.sp).map(Segment::start);
            ExecutionContext {
                thread,
                registers,
                stack,
            }
        })
        .collect();

    let process = parsed.process.unwrap_or_else(|| ProcessInfo {
        pid: contexts
            .first()
            .map(|ctx| ProcessId(u32::try_from(ctx.thread.raw()).unwrap_or(0)))
            .unwrap_or_default(),
        ..ProcessInfo::default()
    });

    info!(
        path = %path.display(),
        architecture = %parsed.architecture,
        segments = segments.segments().len(),
        threads = contexts.len(),
        "opened core file"
    );

    Ok(CoreDump {
        segments,
        process,
        contexts,
        diagnostics,
    })
}

fn parse_container<'data, R: ReadRef<'data>>(data: R) -> Result<ParsedContainer>
{
    match FileKind::parse(data).map_err(|err| map_container_error("reading file identification", err))? {
        FileKind::Elf64 => {}
        FileKind::Elf32 => {
            return Err(HeapdigError::MalformedContainer(
                "32-bit ELF cores are not supported".to_string(),
            ))
        }
        other => {
            return Err(HeapdigError::MalformedContainer(format!(
                "expected an ELF core file, found {other:?}"
            )))
        }
    }

    let header =
        FileHeader64::<Endianness>::parse(data).map_err(|err| map_container_error("parsing ELF header", err))?;
    let endian = header
        .endian()
        .map_err(|err| map_container_error("reading ELF byte order", err))?;
    if header.e_type(endian) != ET_CORE {
        return Err(HeapdigError::MalformedContainer(format!(
            "ELF type {} is not ET_CORE",
            header.e_type(endian)
        )));
    }
    let machine = header.e_machine(endian);
    let architecture = Architecture::from_elf_machine(machine)
        .ok_or_else(|| HeapdigError::MalformedContainer(format!("unsupported ELF machine {machine}")))?;
    let byte_order = if endian.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let program_headers = header
        .program_headers(endian, data)
        .map_err(|err| map_container_error("reading program headers", err))?;

    let mut loads = Vec::new();
    let mut threads = Vec::new();
    let mut process = None;
    for phdr in program_headers {
        match phdr.p_type(endian) {
            PT_LOAD => {
                let range = LoadRange {
                    address: Address::from(phdr.p_vaddr(endian)),
                    file_offset: phdr.p_offset(endian),
                    file_size: phdr.p_filesz(endian),
                    mem_size: phdr.p_memsz(endian),
                    permissions: Permissions::from_elf_flags(phdr.p_flags(endian)),
                };
                if range.mem_size > 0 {
                    loads.push(range);
                }
            }
            PT_NOTE => {
                let Some(mut notes) = phdr
                    .notes(endian, data)
                    .map_err(|err| map_container_error("reading PT_NOTE segment", err))?
                else {
                    continue;
                };
                while let Some(note) = notes.next().map_err(|err| map_container_error("reading note", err))? {
                    if note.name() != b"CORE" {
                        continue;
                    }
                    match note.n_type(endian) {
                        NT_PRSTATUS => threads.push(decode_prstatus(architecture, byte_order, note.desc())?),
                        NT_PRPSINFO => process = Some(decode_prpsinfo(byte_order, note.desc())),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    debug!(loads = loads.len(), threads = threads.len(), "parsed core program headers");

    Ok(ParsedContainer {
        architecture,
        endian: byte_order,
        loads,
        threads,
        process,
    })
}

fn decode_prstatus(architecture: Architecture, order: RunTimeEndian, desc: &[u8]) -> Result<(ThreadId, Registers)>
{
    let end = PRSTATUS_REGS_OFFSET + Registers::prstatus_len(architecture) * 8;
    if desc.len() < end {
        return Err(HeapdigError::MalformedContainer(format!(
            "NT_PRSTATUS note is {} bytes, expected at least {end}",
            desc.len()
        )));
    }

    let tid = order.read_u32(&desc[PRSTATUS_PID_OFFSET..PRSTATUS_PID_OFFSET + 4]);
    let block: Vec<u64> = desc[PRSTATUS_REGS_OFFSET..end]
        .chunks_exact(8)
        .map(|word| order.read_u64(word))
        .collect();
    Ok((ThreadId::from(u64::from(tid)), Registers::from_prstatus(architecture, &block)))
}

fn decode_prpsinfo(order: RunTimeEndian, desc: &[u8]) -> ProcessInfo
{
    let pid = desc
        .get(PRPSINFO_PID_OFFSET..PRPSINFO_PID_OFFSET + 4)
        .map_or(0, |bytes| order.read_u32(bytes));
    ProcessInfo {
        pid: ProcessId(pid),
        command: c_string(desc.get(PRPSINFO_FNAME).unwrap_or_default()),
        args: c_string(desc.get(PRPSINFO_PSARGS).unwrap_or_default()),
    }
}

fn c_string(bytes: &[u8]) -> String
{
    let end = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

/// Stack core data over the executable image and zero-fill what is left
fn layer_segments(
    source: &Arc<dyn ByteSource>,
    file_len: u64,
    loads: &[LoadRange],
    executable: Option<&ExecutableLayer>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Vec<Segment>>
{
    let mut sorted = loads.to_vec();
    sorted.sort_by_key(|load| load.address);
    for pair in sorted.windows(2) {
        if pair[1].address < pair[0].end() {
            return Err(HeapdigError::MalformedContainer(format!(
                "core segments at {} and {} overlap",
                pair[0].address, pair[1].address
            )));
        }
    }

    let mut segments = Vec::new();
    let mut holes = Vec::new();
    for load in &sorted {
        let available = load
            .file_size
            .min(load.mem_size)
            .min(file_len.saturating_sub(load.file_offset));
        if available < load.file_size.min(load.mem_size) {
            warn!(address = %load.address, "core segment truncated in file");
        }
        if available > 0 {
            segments.push(Segment::new(
                load.address,
                available,
                load.permissions,
                SegmentOrigin::Core,
                Arc::clone(source),
                load.file_offset,
            ));
        }
        if available < load.mem_size {
            holes.push((load.address.saturating_add(available), load.end(), load.permissions));
        }
    }

    let core_covered = ranges_of(&segments);
    if let Some(layer) = executable {
        for base in layer.segments() {
            for (start, end) in uncovered(base.start().value(), base.end().value(), &core_covered) {
                segments.push(base.slice(Address::new(start), end - start));
            }
        }
    }

    let covered = ranges_of(&segments);
    for (hole_start, hole_end, permissions) in holes {
        for (start, end) in uncovered(hole_start.value(), hole_end.value(), &covered) {
            let address = Address::new(start);
            warn!(%address, len = end - start, "no bytes in core or executable; zero-filling");
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::MissingData,
                Some(address),
                format!("{} bytes mapped but absent from the dump; read as zero", end - start),
            ));
            segments.push(Segment::zeroed(address, end - start, permissions, SegmentOrigin::ZeroFill));
        }
    }

    Ok(segments)
}

fn ranges_of(segments: &[Segment]) -> Vec<(u64, u64)>
{
    let mut ranges: Vec<(u64, u64)> = segments
        .iter()
        .map(|segment| (segment.start().value(), segment.end().value()))
        .collect();
    ranges.sort_unstable();
    ranges
}

/// Parts of `[start, end)` not covered by any of the sorted, disjoint `covered` ranges
fn uncovered(start: u64, end: u64, covered: &[(u64, u64)]) -> Vec<(u64, u64)>
{
    let mut gaps = Vec::new();
    let mut cursor = start;
    for &(lo, hi) in covered {
        if hi <= cursor {
            continue;
        }
        if lo >= end {
            break;
        }
        if lo > cursor {
            gaps.push((cursor, lo));
        }
        cursor = hi;
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        gaps.push((cursor, end));
    }
    gaps
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_uncovered_gaps()
    {
        let covered = [(0x1000, 0x2000), (0x3000, 0x4000)];
        assert_eq!(uncovered(0x0, 0x5000, &covered), vec![(0x0, 0x1000), (0x2000, 0x3000), (0x4000, 0x5000)]);
        assert_eq!(uncovered(0x1800, 0x3800, &covered), vec![(0x2000, 0x3000)]);
        assert!(uncovered(0x1000, 0x2000, &covered).is_empty());
        assert_eq!(uncovered(0x5000, 0x6000, &covered), vec![(0x5000, 0x6000)]);
    }

    #[test]
    fn test_layering_prefers_core_and_zero_fills_holes()
    {
        let core_bytes: Arc<dyn ByteSource> = Arc::new(MemorySource::new(vec![0xaau8; 0x100]));
        let loads = [
            // Fully dumped data.
            LoadRange {
                address: Address::new(0x5000),
                file_offset: 0,
                file_size: 0x100,
                mem_size: 0x100,
                permissions: Permissions::READ_WRITE,
            },
            // Text mapping left out of the core; the executable supplies it.
            LoadRange {
                address: Address::new(0x1000),
                file_offset: 0x100,
                file_size: 0,
                mem_size: 0x1000,
                permissions: Permissions::READ_EXECUTE,
            },
            // Anonymous mapping with no bytes anywhere.
            LoadRange {
                address: Address::new(0x9000),
                file_offset: 0x100,
                file_size: 0,
                mem_size: 0x200,
                permissions: Permissions::READ_WRITE,
            },
        ];
        let exe = ExecutableLayer::new(
            Arc::from(vec![0x11u8; 0x800]),
            vec![LoadRange {
                address: Address::new(0x1000),
                file_offset: 0,
                file_size: 0x800,
                mem_size: 0x800,
                permissions: Permissions::READ_EXECUTE,
            }],
        );

        let mut diagnostics = Vec::new();
        let segments = layer_segments(&core_bytes, 0x100, &loads, Some(&exe), &mut diagnostics).unwrap();
        let map = SegmentMap::new(Architecture::X86_64, RunTimeEndian::Little, segments).unwrap();

        assert_eq!(map.read(Address::new(0x5010), 2).unwrap(), vec![0xaa, 0xaa]);
        assert_eq!(map.read(Address::new(0x1010), 2).unwrap(), vec![0x11, 0x11]);
        // Tail of the text mapping past the executable's bytes is zero-filled.
        assert_eq!(map.read(Address::new(0x1900), 1).unwrap(), vec![0]);
        assert_eq!(
            map.segment_containing(Address::new(0x9000)).map(Segment::origin),
            Some(SegmentOrigin::ZeroFill)
        );
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics.iter().all(|diag| diag.kind == DiagnosticKind::MissingData));
    }

    #[test]
    fn test_overlapping_loads_rejected()
    {
        let core_bytes: Arc<dyn ByteSource> = Arc::new(MemorySource::new(vec![0u8; 0x10]));
        let load = LoadRange {
            address: Address::new(0x1000),
            file_offset: 0,
            file_size: 0,
            mem_size: 0x100,
            permissions: Permissions::READ_WRITE,
        };
        let overlapping = LoadRange {
            address: Address::new(0x1080),
            ..load
        };
        let mut diagnostics = Vec::new();
        let result = layer_segments(&core_bytes, 0x10, &[load, overlapping], None, &mut diagnostics);
        assert!(matches!(result, Err(HeapdigError::MalformedContainer(_))));
    }

    #[test]
    fn test_prpsinfo_strings()
    {
        let mut desc = vec![0u8; 136];
        desc[PRPSINFO_PID_OFFSET..PRPSINFO_PID_OFFSET + 4].copy_from_slice(&4242u32.to_le_bytes());
        desc[40..46].copy_from_slice(b"server");
        desc[56..72].copy_from_slice(b"./server -port 8");
        let info = decode_prpsinfo(RunTimeEndian::Little, &desc);
        assert_eq!(info.pid, ProcessId(4242));
        assert_eq!(info.command, "server");
        assert_eq!(info.args, "./server -port 8");
    }
}
