//! Metadata file loading: DWARF sections, loadable data and line tables.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addr2line::Context;
use gimli::{Dwarf, EndianArcSlice, RunTimeEndian, SectionId};
use object::{Object, ObjectSection, ObjectSegment, SegmentFlags};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

use super::catalog::SymbolCatalog;
use super::extractor::CatalogExtractor;
use super::{OwnedDwarf, OwnedReader};
use crate::dump::{ExecutableLayer, LoadRange, Permissions};
use crate::error::{map_dwarf_error, HeapdigError, Result};
use crate::types::{Address, Architecture, SourceLocation};

const DWARF_SECTIONS: &[(SectionId, &[&str])] = &[
    (SectionId::DebugAbbrev, &[".debug_abbrev", ".zdebug_abbrev"]),
    (SectionId::DebugAddr, &[".debug_addr"]),
    (SectionId::DebugInfo, &[".debug_info", ".zdebug_info"]),
    (SectionId::DebugLine, &[".debug_line", ".zdebug_line"]),
    (SectionId::DebugLineStr, &[".debug_line_str"]),
    (SectionId::DebugRanges, &[".debug_ranges", ".zdebug_ranges"]),
    (SectionId::DebugRngLists, &[".debug_rnglists", ".zdebug_rnglists"]),
    (SectionId::DebugStr, &[".debug_str", ".zdebug_str"]),
    (SectionId::DebugStrOffsets, &[".debug_str_offsets"]),
    (SectionId::DebugLoc, &[".debug_loc", ".zdebug_loc"]),
    (SectionId::DebugLocLists, &[".debug_loclists", ".zdebug_loclists"]),
];

fn load_section_bytes(file: &object::File<'_>, names: &[&str]) -> Result<Option<Arc<[u8]>>>
{
    for name in names {
        if let Some(section) = file.section_by_name(name) {
            let data = section
                .uncompressed_data()
                .map_err(|err| HeapdigError::MalformedMetadata(format!("failed to read {name}: {err}")))?;
            return Ok(Some(match data {
                Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes),
                Cow::Owned(vec) => vec.into(),
            }));
        }
    }

    Ok(None)
}

/// Maps a program counter to a source position
pub trait SourceLocator
{
    fn locate(&self, pc: Address) -> Option<SourceLocation>;
}

/// Line-table lookups backed by `addr2line`
pub struct LineTable
{
    context: Context<OwnedReader>,
}

impl SourceLocator for LineTable
{
    fn locate(&self, pc: Address) -> Option<SourceLocation>
    {
        let location = self.context.find_location(pc.value()).ok()??;
        Some(SourceLocation {
            file: location.file?.to_string(),
            line: location.line,
            column: location.column,
        })
    }
}

/// Locator used when line tables are absent or unreadable
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSourceLocations;

impl SourceLocator for NoSourceLocations
{
    fn locate(&self, _pc: Address) -> Option<SourceLocation>
    {
        None
    }
}

/// The executable that produced a dump, with its debug metadata
///
/// Section bytes are copied out of the file once at open time. DWARF parsing
/// is deferred until the catalog or a line table is first requested.
pub struct MetadataImage
{
    path: PathBuf,
    architecture: Architecture,
    endian: RunTimeEndian,
    data: Arc<[u8]>,
    loads: Vec<LoadRange>,
    debug_sections: HashMap<SectionId, Arc<[u8]>>,
    dwarf_cache: OnceCell<OwnedDwarf>,
}

impl MetadataImage
{
    /// Read and index the metadata file at `path`
    ///
    /// ## Errors
    ///
    /// `MalformedMetadata` if the file is not a 64-bit x86-64 or AArch64
    /// object file or has no `.debug_info` section.
    pub fn open(path: &Path) -> Result<Self>
    {
        let bytes = fs::read(path)?;
        Self::from_bytes(path, bytes)
    }

    /// Index an already loaded metadata file; `path` is only used in messages
    pub fn from_bytes(path: &Path, bytes: impl Into<Arc<[u8]>>) -> Result<Self>
    {
        let data: Arc<[u8]> = bytes.into();
        let file = object::File::parse(&*data)
            .map_err(|err| HeapdigError::MalformedMetadata(format!("failed to parse {}: {err}", path.display())))?;

        if !file.is_64() {
            return Err(HeapdigError::MalformedMetadata(format!(
                "{} is not a 64-bit object file",
                path.display()
            )));
        }
        let architecture = match file.architecture() {
            object::Architecture::Aarch64 => Architecture::Arm64,
            object::Architecture::X86_64 => Architecture::X86_64,
            other => {
                return Err(HeapdigError::MalformedMetadata(format!(
                    "{}: unsupported architecture {other:?}",
                    path.display()
                )))
            }
        };
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let mut debug_sections = HashMap::new();
        for (id, aliases) in DWARF_SECTIONS {
            if let Some(bytes) = load_section_bytes(&file, aliases)? {
                debug_sections.insert(*id, bytes);
            }
        }
        if !debug_sections.contains_key(&SectionId::DebugInfo) {
            return Err(HeapdigError::MalformedMetadata(format!(
                "{} has no .debug_info section",
                path.display()
            )));
        }

        let mut loads = Vec::new();
        for segment in file.segments() {
            let (file_offset, file_size) = segment.file_range();
            let permissions = match segment.flags() {
                SegmentFlags::Elf { p_flags } => Permissions::from_elf_flags(p_flags),
                _ => Permissions::READ_ONLY,
            };
            if segment.size() == 0 {
                continue;
            }
            loads.push(LoadRange {
                address: Address::new(segment.address()),
                file_offset,
                file_size,
                mem_size: segment.size(),
                permissions,
            });
        }

        info!(
            path = %path.display(),
            %architecture,
            sections = debug_sections.len(),
            loads = loads.len(),
            "opened metadata file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            architecture,
            endian,
            data,
            loads,
            debug_sections,
            dwarf_cache: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    pub fn endian(&self) -> RunTimeEndian
    {
        self.endian
    }

    /// Loadable data of the executable, to be layered under the core
    pub fn executable_layer(&self) -> ExecutableLayer
    {
        ExecutableLayer::new(Arc::clone(&self.data), self.loads.clone())
    }

    /// Decode the type, global and frame catalogs
    pub fn catalog(&self) -> Result<SymbolCatalog>
    {
        let dwarf = self.dwarf()?;
        let pointer_size = u64::from(self.architecture.pointer_size_bytes());
        let catalog = CatalogExtractor::new(dwarf)?.extract(pointer_size)?.finish();
        debug!(
            types = catalog.types().len(),
            globals = catalog.globals().len(),
            functions = catalog.functions().len(),
            diagnostics = catalog.diagnostics().len(),
            "built symbol catalog"
        );
        Ok(catalog)
    }

    /// Line-table locator
    ///
    /// The returned value is not `Sync`; it is meant for the single-threaded
    /// root enumeration phase.
    pub fn line_table(&self) -> Result<LineTable>
    {
        let dwarf = self.load_dwarf()?;
        let context = Context::from_dwarf(dwarf).map_err(|err| map_dwarf_error("building line table", err))?;
        Ok(LineTable { context })
    }

    fn dwarf(&self) -> Result<&OwnedDwarf>
    {
        self.dwarf_cache.get_or_try_init(|| self.load_dwarf())
    }

    fn load_dwarf(&self) -> Result<OwnedDwarf>
    {
        Dwarf::load(|section| Ok::<_, gimli::Error>(self.section_reader(section)))
            .map_err(|err| map_dwarf_error("loading DWARF sections", err))
    }

    fn section_reader(&self, id: SectionId) -> OwnedReader
    {
        let data = self
            .debug_sections
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Arc::<[u8]>::from(Vec::new()));
        EndianArcSlice::new(data, self.endian)
    }
}

impl std::fmt::Debug for MetadataImage
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("MetadataImage")
            .field("path", &self.path)
            .field("architecture", &self.architecture)
            .field("loads", &self.loads.len())
            .finish_non_exhaustive()
    }
}
