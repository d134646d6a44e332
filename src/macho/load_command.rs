//! Load commands.
//!
//! Every command is first captured as a [`RawLoadCommand`] (its bytes copied
//! out of the header area) and then handed to the load-command [`Registry`],
//! which picks the most specific decoder. Unknown commands fall through to the
//! generic candidate.

use super::constants::*;
use super::structs::*;
use crate::data_model::DataModel;
use crate::error::{Error, Result};
use crate::node::{Candidate, Registry};
use crate::util::lossy_cstr;

/// A load command before decoding.
#[derive(Debug, Clone)]
pub struct RawLoadCommand {
    /// Position in the header's command list
    pub index: u32,
    /// Context address of the command
    pub address: u64,
    /// Command type
    pub cmd: u32,
    /// Declared size
    pub cmdsize: u32,
    /// The whole command, header included
    pub bytes: Vec<u8>,
    /// Data model of the enclosing image
    pub model: DataModel,
}

impl RawLoadCommand {
    fn read<T: zerocopy::FromBytes + crate::data_model::SwapBytes>(&self) -> Result<T> {
        self.model.read_struct(&self.bytes)
    }

    /// Reads the C string stored at `offset` from the start of the command.
    fn string_at(&self, offset: u32) -> Result<String> {
        let tail = self
            .bytes
            .get(offset as usize..)
            .filter(|tail| !tail.is_empty())
            .ok_or_else(|| {
                Error::parse(
                    self.address,
                    format!("string offset {offset:#x} outside {} command", load_command_name(self.cmd)),
                )
            })?;
        Ok(lossy_cstr(tail))
    }
}

/// A decoded load command.
#[derive(Debug, Clone)]
pub enum LoadCommandKind {
    /// LC_SEGMENT or LC_SEGMENT_64, widened, with its sections
    Segment {
        /// The segment command
        command: SegmentCommand64,
        /// The section headers that follow it
        sections: Vec<Section64>,
    },
    /// LC_SYMTAB
    Symtab(SymtabCommand),
    /// LC_DYSYMTAB
    Dysymtab(DysymtabCommand),
    /// LC_DYLD_INFO and LC_DYLD_INFO_ONLY
    DyldInfo(DyldInfoCommand),
    /// Commands that point at a __LINKEDIT blob
    LinkeditData(LinkeditDataCommand),
    /// Dylib load and id commands
    Dylib {
        /// The fixed part
        command: DylibCommand,
        /// Install name
        name: String,
    },
    /// rpath, dylinker and umbrella commands
    Path(String),
    /// LC_UUID
    Uuid([u8; 16]),
    /// LC_MAIN
    Main(EntryPointCommand),
    /// LC_SOURCE_VERSION
    SourceVersion(u64),
    /// LC_BUILD_VERSION
    BuildVersion(BuildVersionCommand),
    /// Anything else
    Generic,
}

/// A load command node payload.
#[derive(Debug, Clone)]
pub struct LoadCommand {
    /// Position in the header's command list
    pub index: u32,
    /// Command type
    pub cmd: u32,
    /// Declared size
    pub cmdsize: u32,
    /// Decoded contents
    pub kind: LoadCommandKind,
}

impl LoadCommand {
    /// Decodes a raw command with `registry`.
    pub fn decode(raw: &RawLoadCommand, registry: &Registry<RawLoadCommand, LoadCommandKind>) -> Result<Self> {
        Ok(Self {
            index: raw.index,
            cmd: raw.cmd,
            cmdsize: raw.cmdsize,
            kind: registry.instantiate(raw)?,
        })
    }

    /// Returns the command name.
    pub fn name(&self) -> &'static str {
        load_command_name(self.cmd)
    }
}

// =============================================================================
// Registry
// =============================================================================

fn matching(raw: &RawLoadCommand, cmds: &[u32]) -> u32 {
    if cmds.contains(&raw.cmd) {
        10
    } else {
        0
    }
}

fn build_segment(raw: &RawLoadCommand) -> Result<LoadCommandKind> {
    let (command, header_size, section_size) = if raw.cmd == LC_SEGMENT_64 {
        (raw.read::<SegmentCommand64>()?, SegmentCommand64::SIZE, Section64::SIZE)
    } else {
        (
            raw.read::<SegmentCommand32>()?.into(),
            SegmentCommand32::SIZE,
            Section32::SIZE,
        )
    };

    let needed = (command.nsects as usize)
        .checked_mul(section_size)
        .and_then(|n| n.checked_add(header_size))
        .ok_or(Error::AddressOverflow {
            address: raw.address,
            offset: command.nsects.into(),
        })?;
    if needed > raw.bytes.len() {
        return Err(Error::parse(
            raw.address,
            format!("{} sections do not fit in {} bytes", command.nsects, raw.cmdsize),
        ));
    }

    let sections = raw.bytes[header_size..needed]
        .chunks_exact(section_size)
        .map(|chunk| {
            if raw.cmd == LC_SEGMENT_64 {
                raw.model.read_struct::<Section64>(chunk)
            } else {
                raw.model.read_struct::<Section32>(chunk).map(Section64::from)
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(LoadCommandKind::Segment { command, sections })
}

fn build_dylib(raw: &RawLoadCommand) -> Result<LoadCommandKind> {
    let command: DylibCommand = raw.read()?;
    let name = raw.string_at(command.name_offset)?;
    Ok(LoadCommandKind::Dylib { command, name })
}

fn build_path(raw: &RawLoadCommand) -> Result<LoadCommandKind> {
    let command: StringCommand = raw.read()?;
    raw.string_at(command.offset).map(LoadCommandKind::Path)
}

const DYLIB_COMMANDS: &[u32] = &[
    LC_LOAD_DYLIB,
    LC_ID_DYLIB,
    LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
    LC_LAZY_LOAD_DYLIB,
    LC_LOAD_UPWARD_DYLIB,
];

const PATH_COMMANDS: &[u32] = &[
    LC_LOAD_DYLINKER,
    LC_ID_DYLINKER,
    LC_DYLD_ENVIRONMENT,
    LC_RPATH,
    LC_SUB_FRAMEWORK,
    LC_SUB_UMBRELLA,
    LC_SUB_CLIENT,
    LC_SUB_LIBRARY,
];

const LINKEDIT_DATA_COMMANDS: &[u32] = &[
    LC_CODE_SIGNATURE,
    LC_SEGMENT_SPLIT_INFO,
    LC_FUNCTION_STARTS,
    LC_DATA_IN_CODE,
    LC_DYLIB_CODE_SIGN_DRS,
    LC_LINKER_OPTIMIZATION_HINT,
    LC_DYLD_EXPORTS_TRIE,
    LC_DYLD_CHAINED_FIXUPS,
];

/// Returns the built-in load-command registry.
pub fn default_registry() -> Registry<RawLoadCommand, LoadCommandKind> {
    let mut registry = Registry::new("load command");
    registry
        .register(Candidate::new("generic", |_| 1, |_| Ok(LoadCommandKind::Generic)))
        .register(Candidate::new(
            "segment",
            |raw| matching(raw, &[LC_SEGMENT, LC_SEGMENT_64]),
            build_segment,
        ))
        .register(Candidate::new(
            "symtab",
            |raw| matching(raw, &[LC_SYMTAB]),
            |raw| raw.read().map(LoadCommandKind::Symtab),
        ))
        .register(Candidate::new(
            "dysymtab",
            |raw| matching(raw, &[LC_DYSYMTAB]),
            |raw| raw.read().map(LoadCommandKind::Dysymtab),
        ))
        .register(Candidate::new(
            "dyld info",
            |raw| matching(raw, &[LC_DYLD_INFO, LC_DYLD_INFO_ONLY]),
            |raw| raw.read().map(LoadCommandKind::DyldInfo),
        ))
        .register(Candidate::new(
            "linkedit data",
            |raw| matching(raw, LINKEDIT_DATA_COMMANDS),
            |raw| raw.read().map(LoadCommandKind::LinkeditData),
        ))
        .register(Candidate::new(
            "dylib",
            |raw| matching(raw, DYLIB_COMMANDS),
            build_dylib,
        ))
        .register(Candidate::new(
            "path",
            |raw| matching(raw, PATH_COMMANDS),
            build_path,
        ))
        .register(Candidate::new(
            "uuid",
            |raw| matching(raw, &[LC_UUID]),
            |raw| raw.read::<UuidCommand>().map(|c| LoadCommandKind::Uuid(c.uuid)),
        ))
        .register(Candidate::new(
            "main",
            |raw| matching(raw, &[LC_MAIN]),
            |raw| raw.read().map(LoadCommandKind::Main),
        ))
        .register(Candidate::new(
            "source version",
            |raw| matching(raw, &[LC_SOURCE_VERSION]),
            |raw| {
                raw.read::<SourceVersionCommand>()
                    .map(|c| LoadCommandKind::SourceVersion(c.version))
            },
        ))
        .register(Candidate::new(
            "build version",
            |raw| matching(raw, &[LC_BUILD_VERSION]),
            |raw| raw.read().map(LoadCommandKind::BuildVersion),
        ));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn raw(cmd: u32, bytes: Vec<u8>) -> RawLoadCommand {
        RawLoadCommand {
            index: 0,
            address: 0x20,
            cmd,
            cmdsize: bytes.len() as u32,
            bytes,
            model: DataModel::LP64,
        }
    }

    #[test]
    fn test_segment_with_sections() {
        let mut command = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            vmaddr: 0x1000,
            vmsize: 0x1000,
            nsects: 1,
            ..Default::default()
        };
        command.segname[..6].copy_from_slice(b"__TEXT");
        let mut section = Section64 {
            addr: 0x1100,
            size: 0x20,
            ..Default::default()
        };
        section.sectname[..6].copy_from_slice(b"__text");

        let mut bytes = command.as_bytes().to_vec();
        bytes.extend_from_slice(section.as_bytes());

        let decoded = LoadCommand::decode(&raw(LC_SEGMENT_64, bytes), &default_registry()).unwrap();
        match decoded.kind {
            LoadCommandKind::Segment { command, sections } => {
                assert_eq!(command.name(), "__TEXT");
                assert_eq!(sections.len(), 1);
                assert_eq!(sections[0].name(), "__text");
                assert_eq!(sections[0].addr, 0x1100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncated_sections_fail() {
        let command = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            nsects: 3,
            ..Default::default()
        };
        let err = LoadCommand::decode(&raw(LC_SEGMENT_64, command.as_bytes().to_vec()), &default_registry())
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_dylib_name() {
        let command = DylibCommand {
            cmd: LC_LOAD_DYLIB,
            cmdsize: 56,
            name_offset: DylibCommand::SIZE as u32,
            ..Default::default()
        };
        let mut bytes = command.as_bytes().to_vec();
        bytes.extend_from_slice(b"/usr/lib/libSystem.B.dylib\0");
        bytes.resize(56, 0);

        let decoded = LoadCommand::decode(&raw(LC_LOAD_DYLIB, bytes), &default_registry()).unwrap();
        assert_eq!(decoded.name(), "LC_LOAD_DYLIB");
        assert!(matches!(
            decoded.kind,
            LoadCommandKind::Dylib { ref name, .. } if name == "/usr/lib/libSystem.B.dylib"
        ));
    }

    #[test]
    fn test_unknown_command_is_generic() {
        let decoded = LoadCommand::decode(&raw(0x7777, vec![0; 8]), &default_registry()).unwrap();
        assert!(matches!(decoded.kind, LoadCommandKind::Generic));
    }
}
