//! Builders for synthetic core files and Go debug info
#![allow(dead_code)]

use std::io::Write;

use gimli::write::{
    self, Address as DwarfAddress, AttributeValue, EndianVec, Expression, LineProgram, Sections, Unit, UnitEntryId,
    UnitId,
};
use gimli::{DwAt, DwTag, Encoding, Format, LittleEndian};
use object::elf;
use object::endian::{LittleEndian as LE, U16, U32, U64};
use object::pod::bytes_of;
use object::write::Object;
use object::{BinaryFormat, Endianness, SectionKind};
use tempfile::NamedTempFile;

pub const TEXT: u64 = 0x40_1000;
pub const RODATA: u64 = 0x4a_0000;
pub const DATA: u64 = 0x50_0000;
pub const STACK: u64 = 0x7ff0_0000;
pub const HEAP: u64 = 0xc000_0000;

pub const DW_AT_GO_KIND: DwAt = DwAt(0x2900);
pub const DW_AT_GO_RUNTIME_TYPE: DwAt = DwAt(0x2904);
pub const GO_KIND_STRUCT: u64 = 25;
pub const GO_KIND_STRING: u64 = 24;

/// `pr_reg` slots of x86-64 `elf_prstatus`
const X86_64_REGS: usize = 27;
const PRSTATUS_SIZE: usize = 336;
const PRPSINFO_SIZE: usize = 136;

struct CoreLoad
{
    address: u64,
    bytes: Vec<u8>,
    mem_size: u64,
    flags: u32,
}

/// Assembles a little-endian x86-64 ELF core in memory
#[derive(Default)]
pub struct CoreBuilder
{
    loads: Vec<CoreLoad>,
    threads: Vec<(u32, [u64; X86_64_REGS])>,
    process: Option<(u32, String, String)>,
}

impl CoreBuilder
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// A fully dumped writable mapping
    pub fn memory(mut self, address: u64, bytes: Vec<u8>) -> Self
    {
        let mem_size = bytes.len() as u64;
        self.loads.push(CoreLoad {
            address,
            bytes,
            mem_size,
            flags: elf::PF_R | elf::PF_W,
        });
        self
    }

    /// A mapping the kernel left out of the dump
    pub fn absent(mut self, address: u64, mem_size: u64) -> Self
    {
        self.loads.push(CoreLoad {
            address,
            bytes: Vec::new(),
            mem_size,
            flags: elf::PF_R | elf::PF_W,
        });
        self
    }

    pub fn thread(mut self, tid: u32, pc: u64, sp: u64, fp: u64) -> Self
    {
        let mut regs = [0u64; X86_64_REGS];
        regs[4] = fp;
        regs[16] = pc;
        regs[19] = sp;
        self.threads.push((tid, regs));
        self
    }

    pub fn process(mut self, pid: u32, command: &str, args: &str) -> Self
    {
        self.process = Some((pid, command.to_string(), args.to_string()));
        self
    }

    pub fn build(&self) -> Vec<u8>
    {
        let notes = self.notes();
        let phnum = 1 + self.loads.len();
        let notes_offset = 64 + 56 * phnum;
        let mut data_offset = align(notes_offset + notes.len(), 0x10);

        let header = elf::FileHeader64::<LE> {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_SYSV,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: U16::new(LE, elf::ET_CORE),
            e_machine: U16::new(LE, elf::EM_X86_64),
            e_version: U32::new(LE, u32::from(elf::EV_CURRENT)),
            e_entry: U64::new(LE, 0),
            e_phoff: U64::new(LE, 64),
            e_shoff: U64::new(LE, 0),
            e_flags: U32::new(LE, 0),
            e_ehsize: U16::new(LE, 64),
            e_phentsize: U16::new(LE, 56),
            e_phnum: U16::new(LE, u16::try_from(phnum).unwrap()),
            e_shentsize: U16::new(LE, 64),
            e_shnum: U16::new(LE, 0),
            e_shstrndx: U16::new(LE, 0),
        };
        let mut out = bytes_of(&header).to_vec();

        let note = program_header(elf::PT_NOTE, 0, notes_offset as u64, 0, notes.len() as u64, 0, 4);
        out.extend_from_slice(bytes_of(&note));
        let mut placed = Vec::new();
        for load in &self.loads {
            let offset = data_offset as u64;
            let phdr = program_header(
                elf::PT_LOAD,
                load.flags,
                offset,
                load.address,
                load.bytes.len() as u64,
                load.mem_size,
                0x1000,
            );
            out.extend_from_slice(bytes_of(&phdr));
            placed.push(data_offset);
            data_offset = align(data_offset + load.bytes.len(), 0x10);
        }

        out.extend_from_slice(&notes);
        for (load, offset) in self.loads.iter().zip(placed) {
            out.resize(offset, 0);
            out.extend_from_slice(&load.bytes);
        }
        out
    }

    /// Write the core to a temporary file
    pub fn write(&self) -> NamedTempFile
    {
        write_temp(&self.build())
    }

    fn notes(&self) -> Vec<u8>
    {
        let mut notes = Vec::new();
        for (tid, regs) in &self.threads {
            let mut desc = vec![0u8; PRSTATUS_SIZE];
            desc[32..36].copy_from_slice(&tid.to_le_bytes());
            for (index, value) in regs.iter().enumerate() {
                let at = 112 + index * 8;
                desc[at..at + 8].copy_from_slice(&value.to_le_bytes());
            }
            push_note(&mut notes, elf::NT_PRSTATUS, &desc);
        }
        if let Some((pid, command, args)) = &self.process {
            let mut desc = vec![0u8; PRPSINFO_SIZE];
            desc[24..28].copy_from_slice(&pid.to_le_bytes());
            desc[40..40 + command.len()].copy_from_slice(command.as_bytes());
            desc[56..56 + args.len()].copy_from_slice(args.as_bytes());
            push_note(&mut notes, elf::NT_PRPSINFO, &desc);
        }
        notes
    }
}

fn program_header(
    p_type: u32,
    flags: u32,
    offset: u64,
    address: u64,
    file_size: u64,
    mem_size: u64,
    p_align: u64,
) -> elf::ProgramHeader64<LE>
{
    elf::ProgramHeader64 {
        p_type: U32::new(LE, p_type),
        p_flags: U32::new(LE, flags),
        p_offset: U64::new(LE, offset),
        p_vaddr: U64::new(LE, address),
        p_paddr: U64::new(LE, 0),
        p_filesz: U64::new(LE, file_size),
        p_memsz: U64::new(LE, mem_size),
        p_align: U64::new(LE, p_align),
    }
}

fn push_note(notes: &mut Vec<u8>, n_type: u32, desc: &[u8])
{
    notes.extend_from_slice(&5u32.to_le_bytes());
    notes.extend_from_slice(&u32::try_from(desc.len()).unwrap().to_le_bytes());
    notes.extend_from_slice(&n_type.to_le_bytes());
    notes.extend_from_slice(b"CORE\0\0\0\0");
    notes.extend_from_slice(desc);
    notes.resize(align(notes.len(), 4), 0);
}

fn align(value: usize, to: usize) -> usize
{
    value.div_ceil(to) * to
}

pub fn write_temp(bytes: &[u8]) -> NamedTempFile
{
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Debug info for one or more compilation units
pub struct DebugInfo
{
    dwarf: write::Dwarf,
}

impl Default for DebugInfo
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl DebugInfo
{
    pub fn new() -> Self
    {
        Self {
            dwarf: write::Dwarf::new(),
        }
    }

    /// Start a compilation unit with the given `DW_AT_producer`
    pub fn unit(&mut self, producer: &str) -> UnitId
    {
        let encoding = Encoding {
            format: Format::Dwarf32,
            version: 4,
            address_size: 8,
        };
        let id = self.dwarf.units.add(Unit::new(encoding, LineProgram::none()));
        let unit = self.dwarf.units.get_mut(id);
        let root = unit.root();
        unit.get_mut(root)
            .set(gimli::DW_AT_producer, AttributeValue::String(producer.as_bytes().to_vec()));
        id
    }

    pub fn root(&mut self, unit: UnitId) -> UnitEntryId
    {
        self.dwarf.units.get_mut(unit).root()
    }

    /// Add a DIE under `parent`
    pub fn entry(
        &mut self,
        unit: UnitId,
        parent: UnitEntryId,
        tag: DwTag,
        attributes: Vec<(DwAt, AttributeValue)>,
    ) -> UnitEntryId
    {
        let unit = self.dwarf.units.get_mut(unit);
        let id = unit.add(parent, tag);
        let entry = unit.get_mut(id);
        for (name, value) in attributes {
            entry.set(name, value);
        }
        id
    }

    /// Set an attribute after the fact, for forward references
    pub fn set(&mut self, unit: UnitId, entry: UnitEntryId, name: DwAt, value: AttributeValue)
    {
        self.dwarf.units.get_mut(unit).get_mut(entry).set(name, value);
    }

    /// An ELF relocatable carrying only the debug sections
    pub fn into_object(mut self, architecture: object::Architecture) -> Vec<u8>
    {
        let mut sections = Sections::new(EndianVec::new(LittleEndian));
        self.dwarf.write(&mut sections).unwrap();

        let mut object = Object::new(BinaryFormat::Elf, architecture, Endianness::Little);
        sections
            .for_each(|id, data| {
                if !data.slice().is_empty() {
                    let section = object.add_section(Vec::new(), id.name().as_bytes().to_vec(), SectionKind::Debug);
                    object.append_section_data(section, data.slice(), 1);
                }
                Ok::<(), write::Error>(())
            })
            .unwrap();
        object.write().unwrap()
    }
}

pub fn name(value: &str) -> (DwAt, AttributeValue)
{
    (gimli::DW_AT_name, AttributeValue::String(value.as_bytes().to_vec()))
}

pub fn byte_size(value: u64) -> (DwAt, AttributeValue)
{
    (gimli::DW_AT_byte_size, AttributeValue::Udata(value))
}

pub fn type_ref(target: UnitEntryId) -> (DwAt, AttributeValue)
{
    (gimli::DW_AT_type, AttributeValue::UnitRef(target))
}

pub fn member_offset(value: u64) -> (DwAt, AttributeValue)
{
    (gimli::DW_AT_data_member_location, AttributeValue::Udata(value))
}

pub fn go_kind(kind: u64) -> (DwAt, AttributeValue)
{
    (DW_AT_GO_KIND, AttributeValue::Udata(kind))
}

pub fn runtime_type(address: u64) -> (DwAt, AttributeValue)
{
    (DW_AT_GO_RUNTIME_TYPE, AttributeValue::Udata(address))
}

pub fn encoding(value: gimli::DwAte) -> (DwAt, AttributeValue)
{
    (gimli::DW_AT_encoding, AttributeValue::Encoding(value))
}

/// `DW_OP_addr address`
pub fn static_location(address: u64) -> (DwAt, AttributeValue)
{
    let mut expression = Expression::new();
    expression.op_addr(DwarfAddress::Constant(address));
    (gimli::DW_AT_location, AttributeValue::Exprloc(expression))
}

/// `DW_OP_call_frame_cfa; DW_OP_consts offset; DW_OP_plus`
pub fn frame_location(offset: i64) -> (DwAt, AttributeValue)
{
    let mut expression = Expression::new();
    expression.op(gimli::DW_OP_call_frame_cfa);
    expression.op_consts(offset);
    expression.op(gimli::DW_OP_plus);
    (gimli::DW_AT_location, AttributeValue::Exprloc(expression))
}

pub fn code_range(low: u64, len: u64) -> Vec<(DwAt, AttributeValue)>
{
    vec![
        (gimli::DW_AT_low_pc, AttributeValue::Address(DwarfAddress::Constant(low))),
        (gimli::DW_AT_high_pc, AttributeValue::Udata(len)),
    ]
}

/// Ids of the DIEs in [`go_program`]
pub struct GoProgram
{
    pub unit: UnitId,
    pub node: UnitEntryId,
    pub node_ptr: UnitEntryId,
    pub string: UnitEntryId,
}

/// A Go unit with a linked list node, a string global and one function
///
/// ```text
/// type node struct { next *node; value int }   // runtime type at RODATA
/// var head *node                                 // at DATA
/// var name string                                // at DATA + 0x10
/// func work() { var p *node }                    // p at CFA-24
/// ```
pub fn go_program(debug: &mut DebugInfo) -> GoProgram
{
    let unit = debug.unit("Go cmd/compile go1.22.4; regabi");
    let root = debug.root(unit);

    let int = debug.entry(
        unit,
        root,
        gimli::DW_TAG_base_type,
        vec![name("int"), byte_size(8), encoding(gimli::DW_ATE_signed)],
    );
    let uint8 = debug.entry(
        unit,
        root,
        gimli::DW_TAG_base_type,
        vec![name("uint8"), byte_size(1), encoding(gimli::DW_ATE_unsigned)],
    );
    let node = debug.entry(
        unit,
        root,
        gimli::DW_TAG_structure_type,
        vec![name("main.node"), byte_size(16), go_kind(GO_KIND_STRUCT), runtime_type(RODATA)],
    );
    let node_ptr = debug.entry(
        unit,
        root,
        gimli::DW_TAG_pointer_type,
        vec![name("*main.node"), byte_size(8), type_ref(node)],
    );
    debug.entry(
        unit,
        node,
        gimli::DW_TAG_member,
        vec![name("next"), member_offset(0), type_ref(node_ptr)],
    );
    debug.entry(unit, node, gimli::DW_TAG_member, vec![name("value"), member_offset(8), type_ref(int)]);

    let bytes_ptr = debug.entry(
        unit,
        root,
        gimli::DW_TAG_pointer_type,
        vec![name("*uint8"), byte_size(8), type_ref(uint8)],
    );
    let string = debug.entry(
        unit,
        root,
        gimli::DW_TAG_structure_type,
        vec![name("string"), byte_size(16), go_kind(GO_KIND_STRING)],
    );
    debug.entry(unit, string, gimli::DW_TAG_member, vec![name("str"), member_offset(0), type_ref(bytes_ptr)]);
    debug.entry(unit, string, gimli::DW_TAG_member, vec![name("len"), member_offset(8), type_ref(int)]);

    debug.entry(
        unit,
        root,
        gimli::DW_TAG_variable,
        vec![name("main.head"), type_ref(node_ptr), static_location(DATA)],
    );
    debug.entry(
        unit,
        root,
        gimli::DW_TAG_variable,
        vec![name("main.name"), type_ref(string), static_location(DATA + 0x10)],
    );

    let mut work = vec![name("main.work")];
    work.extend(code_range(TEXT + 0x100, 0x100));
    let work = debug.entry(unit, root, gimli::DW_TAG_subprogram, work);
    debug.entry(
        unit,
        work,
        gimli::DW_TAG_variable,
        vec![name("p"), type_ref(node_ptr), frame_location(-24)],
    );

    GoProgram {
        unit,
        node,
        node_ptr,
        string,
    }
}
