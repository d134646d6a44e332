//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 32-bit Mach-O magic in native order
pub const MH_MAGIC: u32 = 0xFEEDFACE;
/// 32-bit Mach-O magic in swapped order
pub const MH_CIGAM: u32 = 0xCEFAEDFE;
/// 64-bit Mach-O magic in native order
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;
/// 64-bit Mach-O magic in swapped order
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// Fat header magic (always stored big-endian)
pub const FAT_MAGIC: u32 = 0xCAFEBABE;
/// Fat header magic with 64-bit arch entries
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;

// =============================================================================
// File Types
// =============================================================================

/// Relocatable object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Core dump
pub const MH_CORE: u32 = 0x4;
/// Dynamic library
pub const MH_DYLIB: u32 = 0x6;
/// Dynamic linker
pub const MH_DYLINKER: u32 = 0x7;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;
/// Debug symbols companion file
pub const MH_DSYM: u32 = 0xA;
/// Kernel extension
pub const MH_KEXT_BUNDLE: u32 = 0xB;
/// Kernel file set
pub const MH_FILESET: u32 = 0xC;

/// Returns a short name for a file type.
pub fn filetype_name(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "object",
        MH_EXECUTE => "execute",
        MH_CORE => "core",
        MH_DYLIB => "dylib",
        MH_DYLINKER => "dylinker",
        MH_BUNDLE => "bundle",
        MH_DSYM => "dsym",
        MH_KEXT_BUNDLE => "kext",
        MH_FILESET => "fileset",
        _ => "unknown",
    }
}

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit ABI flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// 64-bit hardware, 32-bit pointers
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;

/// x86
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
/// ARM
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// ARM64 with 32-bit pointers
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;
/// PowerPC
pub const CPU_TYPE_POWERPC: u32 = 18;
/// PowerPC 64
pub const CPU_TYPE_POWERPC64: u32 = CPU_TYPE_POWERPC | CPU_ARCH_ABI64;

/// Mask of the subtype bits that select a variant
pub const CPU_SUBTYPE_MASK: u32 = 0x00FF_FFFF;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

/// Returns the architecture name for a CPU type and subtype.
pub fn arch_name(cputype: u32, cpusubtype: u32) -> &'static str {
    match cputype {
        CPU_TYPE_ARM64 if cpusubtype & CPU_SUBTYPE_MASK == CPU_SUBTYPE_ARM64E => "arm64e",
        CPU_TYPE_ARM64 => "arm64",
        CPU_TYPE_ARM64_32 => "arm64_32",
        CPU_TYPE_X86_64 => "x86_64",
        CPU_TYPE_ARM => "arm",
        CPU_TYPE_X86 => "i386",
        CPU_TYPE_POWERPC => "ppc",
        CPU_TYPE_POWERPC64 => "ppc64",
        _ => "unknown",
    }
}

// =============================================================================
// Load Commands
// =============================================================================

/// Set on commands the dynamic linker must understand
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// 32-bit segment
pub const LC_SEGMENT: u32 = 0x1;
/// Symbol table
pub const LC_SYMTAB: u32 = 0x2;
/// Thread state
pub const LC_THREAD: u32 = 0x4;
/// Unix thread state
pub const LC_UNIXTHREAD: u32 = 0x5;
/// Dynamic symbol table
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dylib
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dylib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// Dynamic linker identification
pub const LC_ID_DYLINKER: u32 = 0xF;
/// Sub framework
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
/// Sub umbrella
pub const LC_SUB_UMBRELLA: u32 = 0x13;
/// Sub client
pub const LC_SUB_CLIENT: u32 = 0x14;
/// Sub library
pub const LC_SUB_LIBRARY: u32 = 0x15;
/// Load a weak dylib
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Runpath addition
pub const LC_RPATH: u32 = 0x1C | LC_REQ_DYLD;
/// Code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Segment split info
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
/// Load and re-export a dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Lazily load a dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load an upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Function starts
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Dyld environment string
pub const LC_DYLD_ENVIRONMENT: u32 = 0x27;
/// Main entry point
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Data in code
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Source version
pub const LC_SOURCE_VERSION: u32 = 0x2A;
/// Code signing DRs from linked dylibs
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2B;
/// Linker optimization hints
pub const LC_LINKER_OPTIMIZATION_HINT: u32 = 0x2E;
/// Build version
pub const LC_BUILD_VERSION: u32 = 0x32;
/// Export trie
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Chained fixups
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

/// Returns the symbolic name of a load command.
pub fn load_command_name(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_THREAD => "LC_THREAD",
        LC_UNIXTHREAD => "LC_UNIXTHREAD",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_ID_DYLINKER => "LC_ID_DYLINKER",
        LC_SUB_FRAMEWORK => "LC_SUB_FRAMEWORK",
        LC_SUB_UMBRELLA => "LC_SUB_UMBRELLA",
        LC_SUB_CLIENT => "LC_SUB_CLIENT",
        LC_SUB_LIBRARY => "LC_SUB_LIBRARY",
        LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_UUID => "LC_UUID",
        LC_RPATH => "LC_RPATH",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_LAZY_LOAD_DYLIB => "LC_LAZY_LOAD_DYLIB",
        LC_DYLD_INFO => "LC_DYLD_INFO",
        LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
        LC_LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
        LC_MAIN => "LC_MAIN",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
        LC_DYLIB_CODE_SIGN_DRS => "LC_DYLIB_CODE_SIGN_DRS",
        LC_LINKER_OPTIMIZATION_HINT => "LC_LINKER_OPTIMIZATION_HINT",
        LC_BUILD_VERSION => "LC_BUILD_VERSION",
        LC_DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
        LC_DYLD_CHAINED_FIXUPS => "LC_DYLD_CHAINED_FIXUPS",
        _ => "LC_UNKNOWN",
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Section type mask
pub const SECTION_TYPE: u32 = 0x0000_00FF;
/// Zero fill on demand
pub const S_ZEROFILL: u32 = 0x1;
/// Zero fill on demand, may exceed 4GB
pub const S_GB_ZEROFILL: u32 = 0xC;
/// Thread-local zero fill
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

/// Returns true if sections of this type have no file contents.
#[inline]
pub fn is_zerofill(flags: u32) -> bool {
    matches!(
        flags & SECTION_TYPE,
        S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
    )
}

// =============================================================================
// Symbols
// =============================================================================

/// Any of these bits set marks a debugging (stab) entry
pub const N_STAB: u8 = 0xE0;
/// Private external
pub const N_PEXT: u8 = 0x10;
/// Type mask
pub const N_TYPE: u8 = 0x0E;
/// External
pub const N_EXT: u8 = 0x01;

/// Undefined
pub const N_UNDF: u8 = 0x0;
/// Absolute
pub const N_ABS: u8 = 0x2;
/// Indirect
pub const N_INDR: u8 = 0xA;
/// Prebound undefined
pub const N_PBUD: u8 = 0xC;
/// Defined in section `n_sect`
pub const N_SECT: u8 = 0xE;

/// Symbol not in any section
pub const NO_SECT: u8 = 0;

/// Weak reference (`n_desc`)
pub const N_WEAK_REF: u16 = 0x0040;
/// Weak definition (`n_desc`)
pub const N_WEAK_DEF: u16 = 0x0080;

/// Returns the two-level library ordinal stored in `n_desc`.
#[inline]
pub const fn library_ordinal(n_desc: u16) -> u8 {
    (n_desc >> 8) as u8
}

/// Returns the log2 alignment of a common symbol stored in `n_desc`.
#[inline]
pub const fn common_alignment(n_desc: u16) -> u8 {
    ((n_desc >> 8) & 0x0F) as u8
}

/// Global symbol
pub const N_GSYM: u8 = 0x20;
/// Procedure name (file)
pub const N_FNAME: u8 = 0x22;
/// Procedure
pub const N_FUN: u8 = 0x24;
/// Static symbol
pub const N_STSYM: u8 = 0x26;
/// Local common symbol
pub const N_LCSYM: u8 = 0x28;
/// Begin nsect symbol
pub const N_BNSYM: u8 = 0x2E;
/// AST file path
pub const N_AST: u8 = 0x32;
/// Options
pub const N_OPT: u8 = 0x3C;
/// Register symbol
pub const N_RSYM: u8 = 0x40;
/// Source line
pub const N_SLINE: u8 = 0x44;
/// End nsect symbol
pub const N_ENSYM: u8 = 0x4E;
/// Structure element
pub const N_SSYM: u8 = 0x60;
/// Main source file name
pub const N_SO: u8 = 0x64;
/// Object file name
pub const N_OSO: u8 = 0x66;
/// Local symbol
pub const N_LSYM: u8 = 0x80;
/// Include file begin
pub const N_BINCL: u8 = 0x82;
/// Included source file name
pub const N_SOL: u8 = 0x84;
/// Compiler parameters
pub const N_PARAMS: u8 = 0x86;
/// Compiler version
pub const N_VERSION: u8 = 0x88;
/// Compiler optimization level
pub const N_OLEVEL: u8 = 0x8A;
/// Parameter
pub const N_PSYM: u8 = 0xA0;
/// Include file end
pub const N_EINCL: u8 = 0xA2;
/// Alternate entry point
pub const N_ENTRY: u8 = 0xA4;
/// Left bracket
pub const N_LBRAC: u8 = 0xC0;
/// Deleted include file
pub const N_EXCL: u8 = 0xC2;
/// Right bracket
pub const N_RBRAC: u8 = 0xE0;
/// Begin common
pub const N_BCOMM: u8 = 0xE2;
/// End common
pub const N_ECOMM: u8 = 0xE4;
/// End common (local name)
pub const N_ECOML: u8 = 0xE8;
/// Second stab entry with length information
pub const N_LENG: u8 = 0xFE;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// No undefined references
        const NOUNDEFS = 0x1;
        /// Output of an incremental link
        const INCRLINK = 0x2;
        /// Input for the dynamic linker
        const DYLDLINK = 0x4;
        /// Undefined references bound at load
        const BINDATLOAD = 0x8;
        /// Dynamic undefined references are prebound
        const PREBOUND = 0x10;
        /// Read-only and read-write segments are split
        const SPLIT_SEGS = 0x20;
        /// Two-level namespace bindings
        const TWOLEVEL = 0x80;
        /// Flat namespace forced
        const FORCE_FLAT = 0x100;
        /// Sections may be split at symbols for dead stripping
        const SUBSECTIONS_VIA_SYMBOLS = 0x2000;
        /// Contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// Uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// Stack is executable
        const ALLOW_STACK_EXECUTION = 0x20000;
        /// No re-exported dylibs
        const NO_REEXPORTED_DYLIBS = 0x100000;
        /// Position independent executable
        const PIE = 0x200000;
        /// Contains thread-local variable descriptors
        const HAS_TLV_DESCRIPTORS = 0x800000;
        /// Heap is non-executable
        const NO_HEAP_EXECUTION = 0x1000000;
        /// Safe for application extensions
        const APP_EXTENSION_SAFE = 0x2000000;
        /// nlist symbols are a subset of the dyld info symbols
        const NLIST_OUTOFSYNC_WITH_DYLDINFO = 0x4000000;
        /// Built for simulator platforms too
        const SIM_SUPPORT = 0x8000000;
        /// Part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}
