//! Mach-O on-disk structures.
//!
//! These are read with zerocopy in host order and then passed through
//! [`DataModel::fix`](crate::data_model::DataModel::fix), which swaps every
//! field when the image's byte order differs from the host's.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use crate::data_model::impl_swap_bytes;
use crate::util::lossy_cstr;

// =============================================================================
// Fat Headers
// =============================================================================

/// Fat binary header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FatHeader {
    /// FAT_MAGIC or FAT_MAGIC_64
    pub magic: u32,
    /// Number of arch entries that follow
    pub nfat_arch: u32,
}

impl FatHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 8;
}

/// 32-bit fat arch entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FatArch32 {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File offset of the slice
    pub offset: u32,
    /// Size of the slice
    pub size: u32,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch32 {
    /// Size of the entry in bytes.
    pub const SIZE: usize = 20;
}

/// 64-bit fat arch entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FatArch64 {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File offset of the slice
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
    /// Reserved
    pub reserved: u32,
}

impl FatArch64 {
    /// Size of the entry in bytes.
    pub const SIZE: usize = 32;
}

impl_swap_bytes!(FatHeader { magic, nfat_arch });
impl_swap_bytes!(FatArch32 { cputype, cpusubtype, offset, size, align });
impl_swap_bytes!(FatArch64 { cputype, cpusubtype, offset, size, align, reserved });

// =============================================================================
// Mach Headers
// =============================================================================

/// 32-bit Mach-O header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader32 {
    /// Magic number
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of the load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
}

impl MachHeader32 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;
}

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of the load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Returns the architecture name.
    pub fn arch_name(&self) -> &'static str {
        arch_name(self.cputype, self.cpusubtype)
    }

    /// Returns true for arm64e images.
    #[inline]
    pub fn is_arm64e(&self) -> bool {
        self.cputype == CPU_TYPE_ARM64 && self.cpusubtype & CPU_SUBTYPE_MASK == CPU_SUBTYPE_ARM64E
    }
}

impl From<MachHeader32> for MachHeader64 {
    fn from(h: MachHeader32) -> Self {
        Self {
            magic: h.magic,
            cputype: h.cputype,
            cpusubtype: h.cpusubtype,
            filetype: h.filetype,
            ncmds: h.ncmds,
            sizeofcmds: h.sizeofcmds,
            flags: h.flags,
            reserved: 0,
        }
    }
}

impl_swap_bytes!(MachHeader32 { magic, cputype, cpusubtype, filetype, ncmds, sizeofcmds, flags });
impl_swap_bytes!(MachHeader64 {
    magic, cputype, cpusubtype, filetype, ncmds, sizeofcmds, flags, reserved
});

// =============================================================================
// Load Command Header
// =============================================================================

/// The header shared by every load command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommandHeader {
    /// Command type
    pub cmd: u32,
    /// Total size, including the header
    pub cmdsize: u32,
}

impl LoadCommandHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 8;
}

impl_swap_bytes!(LoadCommandHeader { cmd, cmdsize });

// =============================================================================
// Segments and Sections
// =============================================================================

/// 32-bit segment command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand32 {
    /// LC_SEGMENT
    pub cmd: u32,
    /// Size including sections
    pub cmdsize: u32,
    /// Segment name
    pub segname: [u8; 16],
    /// VM address
    pub vmaddr: u32,
    /// VM size
    pub vmsize: u32,
    /// File offset
    pub fileoff: u32,
    /// Bytes mapped from the file
    pub filesize: u32,
    /// Maximum protection
    pub maxprot: u32,
    /// Initial protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand32 {
    /// Size without sections.
    pub const SIZE: usize = 56;
}

/// 64-bit segment command. 32-bit segments are widened into this form.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size including sections
    pub cmdsize: u32,
    /// Segment name
    pub segname: [u8; 16],
    /// VM address
    pub vmaddr: u64,
    /// VM size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Bytes mapped from the file
    pub filesize: u64,
    /// Maximum protection
    pub maxprot: u32,
    /// Initial protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size without sections.
    pub const SIZE: usize = 72;

    /// Returns the segment name.
    pub fn name(&self) -> String {
        lossy_cstr(&self.segname)
    }
}

impl From<SegmentCommand32> for SegmentCommand64 {
    fn from(s: SegmentCommand32) -> Self {
        Self {
            cmd: s.cmd,
            cmdsize: s.cmdsize,
            segname: s.segname,
            vmaddr: s.vmaddr.into(),
            vmsize: s.vmsize.into(),
            fileoff: s.fileoff.into(),
            filesize: s.filesize.into(),
            maxprot: s.maxprot,
            initprot: s.initprot,
            nsects: s.nsects,
            flags: s.flags,
        }
    }
}

/// 32-bit section.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section32 {
    /// Section name
    pub sectname: [u8; 16],
    /// Segment name
    pub segname: [u8; 16],
    /// VM address
    pub addr: u32,
    /// Size
    pub size: u32,
    /// File offset
    pub offset: u32,
    /// Alignment as a power of two
    pub align: u32,
    /// File offset of relocations
    pub reloff: u32,
    /// Number of relocations
    pub nreloc: u32,
    /// Type and attributes
    pub flags: u32,
    /// Type-dependent
    pub reserved1: u32,
    /// Type-dependent
    pub reserved2: u32,
}

impl Section32 {
    /// Size of the entry.
    pub const SIZE: usize = 68;
}

/// 64-bit section. 32-bit sections are widened into this form.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name
    pub sectname: [u8; 16],
    /// Segment name
    pub segname: [u8; 16],
    /// VM address
    pub addr: u64,
    /// Size
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment as a power of two
    pub align: u32,
    /// File offset of relocations
    pub reloff: u32,
    /// Number of relocations
    pub nreloc: u32,
    /// Type and attributes
    pub flags: u32,
    /// Type-dependent
    pub reserved1: u32,
    /// Type-dependent
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Section64 {
    /// Size of the entry.
    pub const SIZE: usize = 80;

    /// Returns the section name.
    pub fn name(&self) -> String {
        lossy_cstr(&self.sectname)
    }

    /// Returns the segment name recorded in the section.
    pub fn segment_name(&self) -> String {
        lossy_cstr(&self.segname)
    }
}

impl From<Section32> for Section64 {
    fn from(s: Section32) -> Self {
        Self {
            sectname: s.sectname,
            segname: s.segname,
            addr: s.addr.into(),
            size: s.size.into(),
            offset: s.offset,
            align: s.align,
            reloff: s.reloff,
            nreloc: s.nreloc,
            flags: s.flags,
            reserved1: s.reserved1,
            reserved2: s.reserved2,
            reserved3: 0,
        }
    }
}

impl_swap_bytes!(SegmentCommand32 {
    cmd, cmdsize, vmaddr, vmsize, fileoff, filesize, maxprot, initprot, nsects, flags
});
impl_swap_bytes!(SegmentCommand64 {
    cmd, cmdsize, vmaddr, vmsize, fileoff, filesize, maxprot, initprot, nsects, flags
});
impl_swap_bytes!(Section32 {
    addr, size, offset, align, reloff, nreloc, flags, reserved1, reserved2
});
impl_swap_bytes!(Section64 {
    addr, size, offset, align, reloff, nreloc, flags, reserved1, reserved2, reserved3
});

// =============================================================================
// Symbol Table Commands
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// Symbol table offset
    pub symoff: u32,
    /// Number of symbols
    pub nsyms: u32,
    /// String table offset
    pub stroff: u32,
    /// String table size
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

/// Dynamic symbol table command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// Index of the first local symbol
    pub ilocalsym: u32,
    /// Number of local symbols
    pub nlocalsym: u32,
    /// Index of the first external definition
    pub iextdefsym: u32,
    /// Number of external definitions
    pub nextdefsym: u32,
    /// Index of the first undefined symbol
    pub iundefsym: u32,
    /// Number of undefined symbols
    pub nundefsym: u32,
    /// Table of contents offset
    pub tocoff: u32,
    /// Table of contents entries
    pub ntoc: u32,
    /// Module table offset
    pub modtaboff: u32,
    /// Module table entries
    pub nmodtab: u32,
    /// Referenced symbol table offset
    pub extrefsymoff: u32,
    /// Referenced symbol table entries
    pub nextrefsyms: u32,
    /// Indirect symbol table offset
    pub indirectsymoff: u32,
    /// Indirect symbol table entries
    pub nindirectsyms: u32,
    /// External relocation offset
    pub extreloff: u32,
    /// External relocation entries
    pub nextrel: u32,
    /// Local relocation offset
    pub locreloff: u32,
    /// Local relocation entries
    pub nlocrel: u32,
}

impl DysymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 80;
}

impl_swap_bytes!(SymtabCommand { cmd, cmdsize, symoff, nsyms, stroff, strsize });
impl_swap_bytes!(DysymtabCommand {
    cmd, cmdsize, ilocalsym, nlocalsym, iextdefsym, nextdefsym, iundefsym, nundefsym,
    tocoff, ntoc, modtaboff, nmodtab, extrefsymoff, nextrefsyms, indirectsymoff,
    nindirectsyms, extreloff, nextrel, locreloff, nlocrel
});

/// 32-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist32 {
    /// String table index
    pub n_strx: u32,
    /// Type
    pub n_type: u8,
    /// Section number
    pub n_sect: u8,
    /// Description
    pub n_desc: u16,
    /// Value
    pub n_value: u32,
}

impl Nlist32 {
    /// Size of an entry.
    pub const SIZE: usize = 12;
}

/// 64-bit symbol table entry. 32-bit entries are widened into this form.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// String table index
    pub n_strx: u32,
    /// Type
    pub n_type: u8,
    /// Section number
    pub n_sect: u8,
    /// Description
    pub n_desc: u16,
    /// Value
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of an entry.
    pub const SIZE: usize = 16;
}

impl From<Nlist32> for Nlist64 {
    fn from(n: Nlist32) -> Self {
        Self {
            n_strx: n.n_strx,
            n_type: n.n_type,
            n_sect: n.n_sect,
            n_desc: n.n_desc,
            n_value: n.n_value.into(),
        }
    }
}

impl_swap_bytes!(Nlist32 { n_strx, n_desc, n_value });
impl_swap_bytes!(Nlist64 { n_strx, n_desc, n_value });

// =============================================================================
// Link-Edit Commands
// =============================================================================

/// Compressed dyld info command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// Rebase opcodes offset
    pub rebase_off: u32,
    /// Rebase opcodes size
    pub rebase_size: u32,
    /// Bind opcodes offset
    pub bind_off: u32,
    /// Bind opcodes size
    pub bind_size: u32,
    /// Weak bind opcodes offset
    pub weak_bind_off: u32,
    /// Weak bind opcodes size
    pub weak_bind_size: u32,
    /// Lazy bind opcodes offset
    pub lazy_bind_off: u32,
    /// Lazy bind opcodes size
    pub lazy_bind_size: u32,
    /// Export trie offset
    pub export_off: u32,
    /// Export trie size
    pub export_size: u32,
}

impl DyldInfoCommand {
    /// Size of this command.
    pub const SIZE: usize = 48;
}

/// A command pointing at a blob in __LINKEDIT.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// Command type
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// Blob offset
    pub dataoff: u32,
    /// Blob size
    pub datasize: u32,
}

impl LinkeditDataCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

impl_swap_bytes!(DyldInfoCommand {
    cmd, cmdsize, rebase_off, rebase_size, bind_off, bind_size, weak_bind_off,
    weak_bind_size, lazy_bind_off, lazy_bind_size, export_off, export_size
});
impl_swap_bytes!(LinkeditDataCommand { cmd, cmdsize, dataoff, datasize });

// =============================================================================
// Other Commands
// =============================================================================

/// Dylib load command. The path follows at `name_offset`.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylibCommand {
    /// Command type
    pub cmd: u32,
    /// Size including the path
    pub cmdsize: u32,
    /// Offset of the path from the start of the command
    pub name_offset: u32,
    /// Build timestamp
    pub timestamp: u32,
    /// Current version
    pub current_version: u32,
    /// Compatibility version
    pub compatibility_version: u32,
}

impl DylibCommand {
    /// Size without the path.
    pub const SIZE: usize = 24;
}

/// A command whose only payload is a string (rpath, dylinker, sub-*).
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct StringCommand {
    /// Command type
    pub cmd: u32,
    /// Size including the string
    pub cmdsize: u32,
    /// Offset of the string from the start of the command
    pub offset: u32,
}

impl StringCommand {
    /// Size without the string.
    pub const SIZE: usize = 12;
}

/// UUID command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct UuidCommand {
    /// LC_UUID
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// UUID bytes
    pub uuid: [u8; 16],
}

impl UuidCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

/// Main entry point command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EntryPointCommand {
    /// LC_MAIN
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// __TEXT offset of main
    pub entryoff: u64,
    /// Initial stack size, 0 for default
    pub stacksize: u64,
}

impl EntryPointCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

/// Source version command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SourceVersionCommand {
    /// LC_SOURCE_VERSION
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// A.B.C.D.E packed as 24.10.10.10.10 bits
    pub version: u64,
}

impl SourceVersionCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

/// Build version command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    /// Size including tool entries
    pub cmdsize: u32,
    /// Platform
    pub platform: u32,
    /// Minimum OS version, X.Y.Z as 16.8.8 bits
    pub minos: u32,
    /// SDK version, X.Y.Z as 16.8.8 bits
    pub sdk: u32,
    /// Number of tool entries
    pub ntools: u32,
}

impl BuildVersionCommand {
    /// Size without tool entries.
    pub const SIZE: usize = 24;
}

impl_swap_bytes!(DylibCommand {
    cmd, cmdsize, name_offset, timestamp, current_version, compatibility_version
});
impl_swap_bytes!(StringCommand { cmd, cmdsize, offset });
impl_swap_bytes!(UuidCommand { cmd, cmdsize });
impl_swap_bytes!(EntryPointCommand { cmd, cmdsize, entryoff, stacksize });
impl_swap_bytes!(SourceVersionCommand { cmd, cmdsize, version });
impl_swap_bytes!(BuildVersionCommand { cmd, cmdsize, platform, minos, sdk, ntools });

/// Formats a packed X.Y.Z version (16.8.8 bits).
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version >> 16,
        (version >> 8) & 0xFF,
        version & 0xFF
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::DataModel;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<MachHeader32>(), MachHeader32::SIZE);
        assert_eq!(std::mem::size_of::<MachHeader64>(), MachHeader64::SIZE);
        assert_eq!(std::mem::size_of::<SegmentCommand32>(), SegmentCommand32::SIZE);
        assert_eq!(std::mem::size_of::<SegmentCommand64>(), SegmentCommand64::SIZE);
        assert_eq!(std::mem::size_of::<Section32>(), Section32::SIZE);
        assert_eq!(std::mem::size_of::<Section64>(), Section64::SIZE);
        assert_eq!(std::mem::size_of::<Nlist32>(), Nlist32::SIZE);
        assert_eq!(std::mem::size_of::<Nlist64>(), Nlist64::SIZE);
        assert_eq!(std::mem::size_of::<FatArch32>(), FatArch32::SIZE);
        assert_eq!(std::mem::size_of::<FatArch64>(), FatArch64::SIZE);
        assert_eq!(std::mem::size_of::<DysymtabCommand>(), DysymtabCommand::SIZE);
        assert_eq!(std::mem::size_of::<DyldInfoCommand>(), DyldInfoCommand::SIZE);
        assert_eq!(std::mem::size_of::<EntryPointCommand>(), EntryPointCommand::SIZE);
    }

    #[test]
    fn test_big_endian_header() {
        let mut bytes = Vec::new();
        for value in [MH_MAGIC, CPU_TYPE_POWERPC, 0, MH_EXECUTE, 3, 0x100, 0x85] {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        let header: MachHeader32 = DataModel::PPC.read_struct(&bytes).unwrap();
        assert_eq!(header.magic, MH_MAGIC);
        assert_eq!(header.cputype, CPU_TYPE_POWERPC);
        assert_eq!(header.sizeofcmds, 0x100);

        let wide = MachHeader64::from(header);
        assert_eq!(wide.arch_name(), "ppc");
    }

    #[test]
    fn test_names() {
        let mut segment = SegmentCommand64::default();
        segment.segname[..6].copy_from_slice(b"__TEXT");
        assert_eq!(segment.name(), "__TEXT");
        assert_eq!(format_version(0x000A_0F03), "10.15.3");
        assert_eq!(load_command_name(LC_DYLD_INFO_ONLY), "LC_DYLD_INFO_ONLY");
    }
}
