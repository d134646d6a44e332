//! Mach-O images.
//!
//! An image is parsed in one of two layouts. In a file the context address of
//! every structure is a file offset and segments are placed at their unslid VM
//! addresses. In memory (a shared cache or a live process) the context address
//! already is the slid VM address; the slide is whatever moves `__TEXT` from
//! its recorded address to where the header was found.
//!
//! Either way each segment node carries a VM-addressed [`MemoryMap`], so
//! anything built below a segment is looked up by VM address.

use std::sync::Arc;

use super::constants::*;
use super::load_command::{LoadCommand, LoadCommandKind, RawLoadCommand};
use super::segment::{Section, Segment};
use super::strings::StringTable;
use super::structs::*;
use super::symbols::SymbolTable;
use crate::data_model::{DataModel, Endianness};
use crate::dyld_info::{
    BindInfo, BindKind, ExportTrie, FixupContext, MappedFixupMemory, RebaseInfo, SegmentSpan,
};
use crate::error::{Error, ErrorKind, Result, Warning};
use crate::memory::{ByteSource, MemoryMap, WindowSource};
use crate::node::{NewNode, NodeClass, NodeId, NodeKind, NodeRange, NodeTree, Pointee};

/// How an image's context addresses relate to its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    /// Context addresses are file offsets; `base` is the offset of the image
    /// (non-zero for fat slices)
    File {
        /// File offset the image's segment offsets are relative to
        base: u64,
    },
    /// Context addresses are slid VM addresses
    Mapped,
}

/// A Mach-O image node payload.
#[derive(Debug, Clone)]
pub struct MachImage {
    /// The header, widened to 64 bits
    pub header: MachHeader64,
    /// True for 64-bit images
    pub is_64: bool,
    /// Layout the image was parsed in
    pub layout: ImageLayout,
    /// Context address of the header
    pub address: u64,
    /// Distance between recorded and actual VM addresses
    pub slide: i64,
    /// Install name from LC_ID_DYLIB
    pub install_name: Option<String>,
    /// LC_UUID contents
    pub uuid: Option<[u8; 16]>,
    linkedit: Option<SegmentCommand64>,
    vm_map: Arc<MemoryMap>,
}

/// A load command captured from the header area, decoded or not.
struct CapturedCommand {
    raw: RawLoadCommand,
    decoded: Result<LoadCommand>,
}

impl MachImage {
    /// Returns the header flags.
    pub fn flags(&self) -> MachOFlags {
        MachOFlags::from_bits_retain(self.header.flags)
    }

    /// Returns the architecture name.
    pub fn arch_name(&self) -> &'static str {
        self.header.arch_name()
    }

    /// Returns the file type name.
    pub fn filetype_name(&self) -> &'static str {
        filetype_name(self.header.filetype)
    }

    /// Returns the VM-addressed map shared by the image's segments.
    pub fn vm_map(&self) -> &Arc<MemoryMap> {
        &self.vm_map
    }

    /// Applies the slide to a recorded VM address.
    #[inline]
    pub fn slid(&self, vm_address: u64) -> u64 {
        vm_address.wrapping_add(self.slide as u64)
    }

    /// Translates a `__LINKEDIT` file offset into the image's context
    /// coordinates.
    ///
    /// In a file that is the offset itself (plus the slice base). In memory the
    /// offset is moved through the `__LINKEDIT` segment's file-to-VM mapping.
    pub fn linkedit_address(&self, file_offset: u64) -> Result<u64> {
        match self.layout {
            ImageLayout::File { base } => {
                base.checked_add(file_offset).ok_or(Error::AddressOverflow {
                    address: base,
                    offset: file_offset,
                })
            }
            ImageLayout::Mapped => {
                let linkedit = self.linkedit.as_ref().ok_or_else(|| {
                    Error::parse(file_offset, "no __LINKEDIT segment to translate through")
                })?;
                let delta = file_offset.checked_sub(linkedit.fileoff).ok_or_else(|| {
                    Error::parse(
                        file_offset,
                        format!("offset precedes __LINKEDIT at {:#x}", linkedit.fileoff),
                    )
                })?;
                self.slid(linkedit.vmaddr)
                    .checked_add(delta)
                    .ok_or(Error::AddressOverflow {
                        address: self.slid(linkedit.vmaddr),
                        offset: delta,
                    })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Child lookups
    // -------------------------------------------------------------------------

    /// Returns the load command nodes of `image` in header order.
    pub fn load_commands(tree: &NodeTree, image: NodeId) -> Vec<NodeId> {
        tree.children_of_class(image, NodeClass::LoadCommand)
    }

    /// Returns the segment nodes of `image` in load-command order.
    pub fn segments(tree: &NodeTree, image: NodeId) -> Vec<NodeId> {
        tree.children_of_class(image, NodeClass::Segment)
    }

    /// Returns every section node of `image`, numbered order.
    pub fn sections(tree: &NodeTree, image: NodeId) -> Vec<NodeId> {
        Self::segments(tree, image)
            .into_iter()
            .flat_map(|segment| tree.children_of_class(segment, NodeClass::Section))
            .collect()
    }

    /// Returns the first segment called `name`.
    pub fn segment_named(tree: &NodeTree, image: NodeId, name: &str) -> Option<NodeId> {
        Self::segments(tree, image).into_iter().find(|&id| {
            tree.get(id)
                .as_segment()
                .map_or(false, |segment| segment.name == name)
        })
    }

    /// Returns the symbol table node, if the image has one.
    pub fn symbol_table(tree: &NodeTree, image: NodeId) -> Option<NodeId> {
        tree.children_of_class(image, NodeClass::SymbolTable)
            .into_iter()
            .next()
    }

    /// Returns the rebase info node, if the image has one.
    pub fn rebase_info(tree: &NodeTree, image: NodeId) -> Option<NodeId> {
        tree.children_of_class(image, NodeClass::RebaseInfo)
            .into_iter()
            .next()
    }

    /// Returns the bind info node of one kind.
    pub fn bind_info(tree: &NodeTree, image: NodeId, kind: BindKind) -> Option<NodeId> {
        tree.children_of_class(image, NodeClass::BindInfo)
            .into_iter()
            .find(|&id| tree.get(id).as_bind_info().map_or(false, |info| info.kind == kind))
    }

    /// Returns the export trie node, if the image has one.
    pub fn export_trie(tree: &NodeTree, image: NodeId) -> Option<NodeId> {
        tree.children_of_class(image, NodeClass::ExportTrie)
            .into_iter()
            .next()
    }

    // -------------------------------------------------------------------------
    // Parsing
    // -------------------------------------------------------------------------

    /// Parses the image whose header is at `address` in `parent`'s context
    /// coordinates and builds its subtree.
    ///
    /// Only an unreadable or unrecognised header is fatal. Problems further in
    /// are recorded as warnings on the node they concern.
    pub fn parse(
        tree: &NodeTree,
        parent: NodeId,
        address: u64,
        layout: ImageLayout,
    ) -> Result<NodeId> {
        let map = tree.memory_map(parent);

        // The magic is compared as a little-endian value; a swapped magic
        // means a big-endian image.
        let magic = map.read_double_word(0, address, &DataModel::LP64)?;
        let (is_64, endianness) = match magic {
            MH_MAGIC_64 => (true, Endianness::Little),
            MH_CIGAM_64 => (true, Endianness::Big),
            MH_MAGIC => (false, Endianness::Little),
            MH_CIGAM => (false, Endianness::Big),
            other => return Err(Error::InvalidMachoMagic(other)),
        };
        let probe = DataModel::LP64.with_endianness(endianness);
        let (header, header_size) = if is_64 {
            (map.read_struct::<MachHeader64>(0, address, &probe)?, MachHeader64::SIZE)
        } else {
            (
                map.read_struct::<MachHeader32>(0, address, &probe)?.into(),
                MachHeader32::SIZE,
            )
        };
        let model = DataModel::for_cpu(header.cputype).with_endianness(endianness);

        tracing::debug!(
            "{} {} image at {:#x}: {} commands",
            header.arch_name(),
            filetype_name(header.filetype),
            address,
            header.ncmds
        );

        let mut warnings = Vec::new();
        let commands = capture_load_commands(
            tree,
            &map,
            address,
            header_size as u64,
            &header,
            model,
            &mut warnings,
        );

        let segment_commands: Vec<(usize, SegmentCommand64, Vec<Section64>)> = commands
            .iter()
            .enumerate()
            .filter_map(|(position, command)| match &command.decoded {
                Ok(LoadCommand {
                    kind: LoadCommandKind::Segment { command, sections },
                    ..
                }) => Some((position, *command, sections.clone())),
                _ => None,
            })
            .collect();

        let text = segment_commands
            .iter()
            .map(|(_, command, _)| command)
            .find(|command| command.name() == "__TEXT")
            .or_else(|| {
                segment_commands
                    .iter()
                    .map(|(_, command, _)| command)
                    .find(|command| command.fileoff == 0 && command.filesize > 0)
            })
            .copied();
        let slide = match (layout, text) {
            (ImageLayout::Mapped, Some(text)) => address.wrapping_sub(text.vmaddr) as i64,
            _ => 0,
        };
        if slide != 0 {
            tracing::debug!("image at {:#x} slid by {:#x}", address, slide);
        }

        let vm_map = match layout {
            ImageLayout::File { base } => Arc::new(file_vm_map(
                &map,
                base,
                segment_commands.iter().map(|(_, command, _)| command),
                &mut warnings,
            )),
            ImageLayout::Mapped => Arc::clone(&map),
        };

        let mut image = MachImage {
            header,
            is_64,
            layout,
            address,
            slide,
            install_name: None,
            uuid: None,
            linkedit: segment_commands
                .iter()
                .map(|(_, command, _)| command)
                .find(|command| command.name() == "__LINKEDIT")
                .copied(),
            vm_map: Arc::clone(&vm_map),
        };
        for command in commands.iter().filter_map(|c| c.decoded.as_ref().ok()) {
            match &command.kind {
                LoadCommandKind::Dylib { name, .. } if command.cmd == LC_ID_DYLIB => {
                    image.install_name = Some(name.clone());
                }
                LoadCommandKind::Uuid(uuid) => image.uuid = Some(*uuid),
                _ => {}
            }
        }

        let id = tree.insert(
            parent,
            NewNode::new(NodeKind::MachImage(image.clone()))
                .backed(NodeRange::context(address, 0))
                .with_data_model(model),
        )?;
        for warning in warnings {
            tree.warn(id, warning);
        }

        let command_ids = insert_load_commands(tree, id, commands);
        let sections = insert_segments(tree, id, &image, &segment_commands, &command_ids, &vm_map);

        let spans: Vec<SegmentSpan> = segment_commands
            .iter()
            .map(|(_, command, _)| SegmentSpan {
                name: command.name(),
                vm_address: image.slid(command.vmaddr),
                vm_size: command.vmsize,
            })
            .collect();
        let linkedit = LinkeditBuilder {
            tree,
            image: id,
            payload: &image,
            map: &map,
            model,
        };
        for command_id in &command_ids {
            let node = tree.get(*command_id);
            let Some(command) = node.as_load_command() else {
                continue;
            };
            match &command.kind {
                LoadCommandKind::Symtab(symtab) if tree.options().parse_symbols => {
                    linkedit.symbols(symtab, &sections);
                }
                LoadCommandKind::DyldInfo(info) if tree.options().parse_dyld_info => {
                    let fixups = FixupContext {
                        image_base: text.map_or(0, |text| text.vmaddr),
                        policy: tree.options().out_of_range,
                        ..FixupContext::new(&spans, model.pointer_size())
                    };
                    linkedit.dyld_info(info, fixups, &vm_map);
                }
                LoadCommandKind::LinkeditData(data)
                    if command.cmd == LC_DYLD_EXPORTS_TRIE && tree.options().parse_dyld_info =>
                {
                    linkedit.export_trie(data.dataoff, data.datasize);
                }
                _ => {}
            }
        }

        Ok(id)
    }
}

impl Pointee for MachImage {
    const CLASS: NodeClass = NodeClass::MachImage;

    fn materialize(tree: &NodeTree, parent: NodeId, address: u64) -> Result<NodeId> {
        MachImage::parse(tree, parent, address, ImageLayout::Mapped)
    }
}

// =============================================================================
// Load Commands
// =============================================================================

/// Copies out and decodes the load commands following the header.
///
/// Stops at the first command that does not fit in `sizeofcmds` or cannot be
/// read, recording why in `warnings`.
fn capture_load_commands(
    tree: &NodeTree,
    map: &MemoryMap,
    address: u64,
    header_size: u64,
    header: &MachHeader64,
    model: DataModel,
    warnings: &mut Vec<Warning>,
) -> Vec<CapturedCommand> {
    let mut commands = Vec::new();
    let Some(start) = address.checked_add(header_size) else {
        warnings.push(Warning::from_error(
            "load_commands",
            Error::AddressOverflow {
                address,
                offset: header_size,
            },
        ));
        return commands;
    };
    let limit = u64::from(header.sizeofcmds);
    let header_len = LoadCommandHeader::SIZE as u64;
    let mut offset = 0u64;

    for index in 0..header.ncmds {
        if offset + header_len > limit {
            warnings.push(Warning::from_error(
                "load_commands",
                Error::LoadCommandOverflow {
                    offset: start.wrapping_add(offset),
                },
            ));
            break;
        }
        let command: LoadCommandHeader = match map.read_struct(offset, start, &model) {
            Ok(command) => command,
            Err(error) => {
                warnings.push(Warning::from_error("load_commands", error));
                break;
            }
        };
        let size = u64::from(command.cmdsize);
        if size < header_len {
            warnings.push(Warning::from_error(
                "load_commands",
                Error::parse(
                    start + offset,
                    format!("command {index} has size {:#x}", command.cmdsize),
                ),
            ));
            break;
        }
        if offset + size > limit {
            warnings.push(Warning::from_error(
                "load_commands",
                Error::LoadCommandOverflow {
                    offset: start + offset,
                },
            ));
            break;
        }
        let bytes = match map.data(offset, start, size, true) {
            Ok(bytes) => bytes,
            Err(error) => {
                warnings.push(Warning::from_error("load_commands", error));
                break;
            }
        };

        let raw = RawLoadCommand {
            index,
            address: start + offset,
            cmd: command.cmd,
            cmdsize: command.cmdsize,
            bytes,
            model,
        };
        let decoded = LoadCommand::decode(&raw, &tree.options().load_commands);
        tracing::trace!("{} at {:#x}", load_command_name(raw.cmd), raw.address);
        commands.push(CapturedCommand { raw, decoded });
        offset += size;
    }

    if header.ncmds as usize != commands.len() {
        tracing::debug!("read {} of {} load commands", commands.len(), header.ncmds);
    }
    commands
}

/// Inserts one node per captured command. A command that failed to decode is
/// inserted as generic and carries the failure.
fn insert_load_commands(tree: &NodeTree, image: NodeId, commands: Vec<CapturedCommand>) -> Vec<NodeId> {
    let mut ids = Vec::with_capacity(commands.len());
    for CapturedCommand { raw, decoded } in commands {
        let (command, failure) = match decoded {
            Ok(command) => (command, None),
            Err(error) => (
                LoadCommand {
                    index: raw.index,
                    cmd: raw.cmd,
                    cmdsize: raw.cmdsize,
                    kind: LoadCommandKind::Generic,
                },
                Some(error),
            ),
        };
        let node = NewNode::new(NodeKind::LoadCommand(command))
            .backed(NodeRange::context(raw.address, raw.cmdsize.into()));
        match tree.insert(image, node) {
            Ok(id) => {
                if let Some(error) = failure {
                    tree.warn_error(id, "contents", error);
                }
                ids.push(id);
            }
            Err(error) => tree.warn_error(image, &format!("load_commands[{}]", raw.index), error),
        }
    }
    ids
}

// =============================================================================
// Segments and Sections
// =============================================================================

/// Builds the VM map of an image in a file: each segment's file bytes placed
/// at its VM address.
fn file_vm_map<'a>(
    map: &Arc<MemoryMap>,
    base: u64,
    segments: impl Iterator<Item = &'a SegmentCommand64>,
    warnings: &mut Vec<Warning>,
) -> MemoryMap {
    let window: Arc<dyn ByteSource> = Arc::new(WindowSource::new(Arc::clone(map)));
    let mut vm_map = MemoryMap::new();
    for segment in segments {
        let len = segment.filesize.min(segment.vmsize);
        if len == 0 {
            continue;
        }
        let mapped = base
            .checked_add(segment.fileoff)
            .ok_or(Error::AddressOverflow {
                address: base,
                offset: segment.fileoff,
            })
            .and_then(|from| vm_map.add_mapping(segment.vmaddr, len, Arc::clone(&window), from));
        if let Err(error) = mapped {
            warnings.push(Warning::from_error(format!("segments[{}]", segment.name()), error));
        }
    }
    vm_map
}

/// Inserts segment nodes and their sections. Returns the section nodes in
/// `n_sect` order.
fn insert_segments(
    tree: &NodeTree,
    image: NodeId,
    payload: &MachImage,
    segments: &[(usize, SegmentCommand64, Vec<Section64>)],
    command_ids: &[NodeId],
    vm_map: &Arc<MemoryMap>,
) -> Vec<NodeId> {
    let mut numbered = Vec::new();

    for (index, (position, command, sections)) in segments.iter().enumerate() {
        let name = command.name();
        let Ok(index) = u8::try_from(index) else {
            tree.warn_error(
                image,
                "segments",
                Error::parse(0, format!("segment {name} beyond the 256 that opcodes can address")),
            );
            break;
        };
        let Some(&load_command) = command_ids.get(*position) else {
            continue;
        };
        let vm_address = payload.slid(command.vmaddr);

        let mut range = NodeRange::default();
        match payload.layout {
            ImageLayout::File { base } if command.filesize > 0 => {
                range = NodeRange::context(base.wrapping_add(command.fileoff), command.filesize);
            }
            ImageLayout::Mapped if command.vmsize > 0 => {
                range = NodeRange::context(vm_address, command.vmsize);
            }
            _ => {}
        }
        if command.vmsize > 0 {
            range = range.with_vm(vm_address, command.vmsize);
        }

        let mut node = NewNode::new(NodeKind::Segment(Segment {
            name: name.clone(),
            index,
            command: *command,
            load_command,
            vm_address,
        }))
        .with_memory_map(Arc::clone(vm_map));
        if range.context.is_some() || range.vm.is_some() {
            node = node.backed(range);
        }
        let segment = match tree.insert(image, node) {
            Ok(id) => id,
            Err(error) => {
                tree.warn_error(image, &format!("segments[{name}]"), error);
                continue;
            }
        };
        tracing::trace!("segment {} at {:#x} ({:#x} bytes)", name, vm_address, command.vmsize);

        for header in sections {
            let number = numbered.len() + 1;
            let section_address = payload.slid(header.addr);
            let section = Section {
                name: header.name(),
                segment_name: header.segment_name(),
                number: u8::try_from(number).unwrap_or(0),
                header: *header,
                vm_address: section_address,
            };
            // Below a segment, context coordinates are VM addresses.
            let backed = (header.size > 0).then(|| {
                NodeRange::context(section_address, header.size).with_vm(section_address, header.size)
            });
            let inserted = match backed {
                Some(range) => tree
                    .insert(segment, NewNode::new(NodeKind::Section(section.clone())).backed(range))
                    .or_else(|error| {
                        tree.warn_error(segment, &format!("sections[{}]", section.name), error);
                        tree.insert(segment, NewNode::new(NodeKind::Section(section)))
                    }),
                None => tree.insert(segment, NewNode::new(NodeKind::Section(section))),
            };
            match inserted {
                Ok(id) => numbered.push(id),
                Err(error) => tree.warn_error(segment, "sections", error),
            }
            if number == usize::from(u8::MAX) + 1 {
                tree.warn(
                    segment,
                    Warning::new(
                        "sections",
                        ErrorKind::OutOfRange,
                        "sections past 255 cannot be named by n_sect",
                    ),
                );
            }
        }
    }

    numbered
}

// =============================================================================
// Linkedit Blobs
// =============================================================================

struct LinkeditBuilder<'a> {
    tree: &'a NodeTree,
    image: NodeId,
    payload: &'a MachImage,
    map: &'a MemoryMap,
    model: DataModel,
}

impl LinkeditBuilder<'_> {
    /// Copies a blob out of __LINKEDIT. Returns its context address too.
    fn read(&self, offset: u32, size: u64) -> Result<(u64, Vec<u8>)> {
        let address = self.payload.linkedit_address(offset.into())?;
        let data = self.map.data(0, address, size, true)?;
        Ok((address, data))
    }

    /// Inserts a blob node, or records why it could not be.
    fn insert(&self, property: &str, address: u64, size: u64, kind: NodeKind) -> Option<NodeId> {
        let node = NewNode::new(kind).backed(NodeRange::context(address, size));
        match self.tree.insert(self.image, node) {
            Ok(id) => Some(id),
            Err(error) => {
                self.tree.warn_error(self.image, property, error);
                None
            }
        }
    }

    fn symbols(&self, symtab: &SymtabCommand, sections: &[NodeId]) {
        let strings = if symtab.strsize == 0 {
            None
        } else {
            match self.read(symtab.stroff, symtab.strsize.into()) {
                Ok((address, data)) => {
                    let table = StringTable::new(data);
                    self.insert(
                        "string_table",
                        address,
                        symtab.strsize.into(),
                        NodeKind::StringTable(table.clone()),
                    )
                    .map(|id| (id, table))
                }
                Err(error) => {
                    self.tree.warn_error(self.image, "string_table", error);
                    None
                }
            }
        };

        if symtab.nsyms == 0 {
            return;
        }
        let size = SymbolTable::entry_size(&self.model) as u64 * u64::from(symtab.nsyms);
        let (address, data) = match self.read(symtab.symoff, size) {
            Ok(blob) => blob,
            Err(error) => {
                self.tree.warn_error(self.image, "symbol_table", error);
                return;
            }
        };
        let (mut table, warnings) = SymbolTable::decode(
            &data,
            symtab.nsyms,
            &self.model,
            strings.as_ref().map(|(_, table)| table),
            sections,
            &self.tree.options().symbols,
        );
        table.string_table = strings.map(|(id, _)| id);
        if let Some(id) = self.insert("symbol_table", address, size, NodeKind::SymbolTable(table)) {
            for warning in warnings {
                self.tree.warn(id, warning);
            }
        }
    }

    fn dyld_info(&self, info: &DyldInfoCommand, fixups: FixupContext<'_>, vm_map: &MemoryMap) {
        let memory = MappedFixupMemory::new(vm_map, self.model);
        let fixups = FixupContext {
            memory: Some(&memory),
            ..fixups
        };

        if info.rebase_size > 0 {
            match self.read(info.rebase_off, info.rebase_size.into()) {
                Ok((address, data)) => {
                    let rebases = RebaseInfo::decode(&data, &fixups);
                    let error = rebases.error.clone();
                    let id = self.insert(
                        "rebase",
                        address,
                        info.rebase_size.into(),
                        NodeKind::RebaseInfo(rebases),
                    );
                    self.stream_warning(id, error);
                }
                Err(error) => self.tree.warn_error(self.image, "rebase", error),
            }
        }

        let streams = [
            (BindKind::Regular, info.bind_off, info.bind_size),
            (BindKind::Weak, info.weak_bind_off, info.weak_bind_size),
            (BindKind::Lazy, info.lazy_bind_off, info.lazy_bind_size),
        ];
        for (kind, offset, size) in streams {
            if size == 0 {
                continue;
            }
            match self.read(offset, size.into()) {
                Ok((address, data)) => {
                    let binds = BindInfo::decode(&data, kind, &fixups);
                    let error = binds.error.clone();
                    let id = self.insert(kind.name(), address, size.into(), NodeKind::BindInfo(binds));
                    self.stream_warning(id, error);
                }
                Err(error) => self.tree.warn_error(self.image, kind.name(), error),
            }
        }

        self.export_trie(info.export_off, info.export_size);
    }

    fn export_trie(&self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }
        match self.read(offset, size.into()) {
            Ok((address, data)) => {
                let trie = ExportTrie::decode(data, &self.tree.options().export_terminals);
                let error = trie.error.clone();
                let id = self.insert("exports", address, size.into(), NodeKind::ExportTrie(trie));
                self.stream_warning(id, error);
            }
            Err(error) => self.tree.warn_error(self.image, "exports", error),
        }
    }

    /// Records the error that stopped a stream on the stream's node.
    fn stream_warning(&self, id: Option<NodeId>, error: Option<Arc<Error>>) {
        if let (Some(id), Some(error)) = (id, error) {
            self.tree.warn(
                id,
                Warning {
                    property: "opcodes".into(),
                    code: error.kind(),
                    description: error.to_string(),
                    underlying: Some(error),
                },
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data_model::SwapBytes;
    use crate::dyld_info::opcodes::*;
    use crate::dyld_info::ExportKind;
    use crate::macho::symbols::SymbolKind;
    use crate::memory::BufferSource;
    use crate::node::{Pointer, PointerOptions};
    use zerocopy::IntoBytes;

    pub(crate) const TEXT: u64 = 0x1_0000_0000;

    fn segment(name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64, nsects: u32) -> SegmentCommand64 {
        let mut command = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + nsects as usize * Section64::SIZE) as u32,
            vmaddr,
            vmsize,
            fileoff,
            filesize,
            nsects,
            ..Default::default()
        };
        command.segname[..name.len()].copy_from_slice(name.as_bytes());
        command
    }

    fn put(file: &mut [u8], at: usize, bytes: &[u8]) {
        file[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// A small x86_64 executable laid out as:
    ///
    /// | file offset | contents |
    /// |---|---|
    /// | 0x0000 | header, load commands, `__text` at 0x800 |
    /// | 0x1000 | `__DATA` (0x100 bytes) |
    /// | 0x1100 | `__LINKEDIT`: symbols, strings, rebase, bind, exports |
    pub(crate) fn sample_image() -> Vec<u8> {
        let mut file = vec![0u8; 0x1200];

        let mut text = segment("__TEXT", TEXT, 0x1000, 0, 0x1000, 1);
        text.initprot = 5;
        let mut section = Section64 {
            addr: TEXT + 0x800,
            size: 0x10,
            offset: 0x800,
            ..Default::default()
        };
        section.sectname[..6].copy_from_slice(b"__text");
        section.segname[..6].copy_from_slice(b"__TEXT");
        let data = segment("__DATA", TEXT + 0x1000, 0x1000, 0x1000, 0x100, 0);
        let linkedit = segment("__LINKEDIT", TEXT + 0x2000, 0x1000, 0x1100, 0x100, 0);
        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: 0x1100,
            nsyms: 2,
            stroff: 0x1120,
            strsize: 0x20,
        };
        let dyld_info = DyldInfoCommand {
            cmd: LC_DYLD_INFO_ONLY,
            cmdsize: DyldInfoCommand::SIZE as u32,
            rebase_off: 0x1140,
            rebase_size: 5,
            bind_off: 0x1150,
            bind_size: 13,
            export_off: 0x1180,
            export_size: 14,
            ..Default::default()
        };

        let mut commands = Vec::new();
        commands.extend_from_slice(text.as_bytes());
        commands.extend_from_slice(section.as_bytes());
        commands.extend_from_slice(data.as_bytes());
        commands.extend_from_slice(linkedit.as_bytes());
        commands.extend_from_slice(symtab.as_bytes());
        commands.extend_from_slice(dyld_info.as_bytes());

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
            filetype: MH_EXECUTE,
            ncmds: 5,
            sizeofcmds: commands.len() as u32,
            flags: (MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::PIE).bits(),
            reserved: 0,
        };
        put(&mut file, 0, header.as_bytes());
        put(&mut file, MachHeader64::SIZE, &commands);

        // A pointer in __DATA for the rebase to cover.
        put(&mut file, 0x1008, &(TEXT + 0x800).to_le_bytes());

        let main = Nlist64 {
            n_strx: 1,
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            n_desc: 0,
            n_value: TEXT + 0x800,
        };
        let exit = Nlist64 {
            n_strx: 7,
            n_type: N_UNDF | N_EXT,
            n_sect: NO_SECT,
            n_desc: 0x0100,
            n_value: 0,
        };
        put(&mut file, 0x1100, main.as_bytes());
        put(&mut file, 0x1110, exit.as_bytes());
        put(&mut file, 0x1120, b"\0_main\0_exit\0");

        put(
            &mut file,
            0x1140,
            &[
                REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
                0x08,
                REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
                REBASE_OPCODE_DONE,
            ],
        );

        let mut bind = vec![
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
        ];
        bind.extend_from_slice(b"_exit\0");
        bind.extend_from_slice(&[
            BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x10,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ]);
        assert_eq!(bind.len(), 13);
        put(&mut file, 0x1150, &bind);

        // "_main" -> terminal with address 0x800
        let mut trie = vec![0x00, 0x01];
        trie.extend_from_slice(b"_main\0");
        trie.push(9);
        trie.extend_from_slice(&[0x03, 0x00, 0x80, 0x10, 0x00]);
        assert_eq!(trie.len(), 14);
        put(&mut file, 0x1180, &trie);

        file
    }

    fn file_tree(bytes: Vec<u8>) -> NodeTree {
        NodeTree::new(MemoryMap::from_bytes(bytes).unwrap(), DataModel::LP64)
    }

    #[test]
    fn test_file_image() {
        let tree = file_tree(sample_image());
        let id = MachImage::parse(&tree, tree.root(), 0, ImageLayout::File { base: 0 }).unwrap();
        let node = tree.get(id);
        let image = node.as_mach_image().unwrap();

        assert!(image.is_64);
        assert_eq!(image.arch_name(), "x86_64");
        assert!(image.flags().contains(MachOFlags::PIE));
        assert_eq!(image.slide, 0);
        assert_eq!(tree.data_model(id), DataModel::X86_64);
        assert!(node.warnings().is_empty(), "{:?}", node.warnings());

        assert_eq!(MachImage::load_commands(&tree, id).len(), 5);
        let segments = MachImage::segments(&tree, id);
        let names: Vec<String> = segments
            .iter()
            .map(|&s| tree.get(s).as_segment().unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["__TEXT", "__DATA", "__LINKEDIT"]);

        let data = MachImage::segment_named(&tree, id, "__DATA").unwrap();
        assert_eq!(tree.get(data).as_segment().unwrap().index, 1);
        let pointer = tree
            .memory_map(data)
            .read_quad_word(0, TEXT + 0x1008, &DataModel::X86_64)
            .unwrap();
        assert_eq!(pointer, TEXT + 0x800);

        let sections = MachImage::sections(&tree, id);
        assert_eq!(sections.len(), 1);
        assert_eq!(tree.get(sections[0]).as_section().unwrap().number, 1);
        assert_eq!(tree.get(sections[0]).parent(), Some(segments[0]));
    }

    #[test]
    fn test_file_image_linkedit() {
        let tree = file_tree(sample_image());
        let id = MachImage::parse(&tree, tree.root(), 0, ImageLayout::File { base: 0 }).unwrap();

        let symbols = MachImage::symbol_table(&tree, id).unwrap();
        let node = tree.get(symbols);
        let table = node.as_symbol_table().unwrap();
        assert!(node.warnings().is_empty());
        assert_eq!(table.symbols.len(), 2);
        assert_eq!(table.symbols[0].name, "_main");
        let text_section = MachImage::sections(&tree, id)[0];
        assert!(matches!(
            table.symbols[0].kind,
            SymbolKind::Section { section: Some(s) } if s == text_section
        ));
        assert!(matches!(
            table.symbols[1].kind,
            SymbolKind::Undefined { library_ordinal: 1 }
        ));
        let strings = table.string_table.unwrap();
        assert_eq!(tree.get(strings).as_string_table().unwrap().string_at(7).unwrap(), "_exit");

        let rebases = MachImage::rebase_info(&tree, id).unwrap();
        let rebases = tree.get(rebases);
        let rebases = rebases.as_rebase_info().unwrap();
        assert_eq!(rebases.actions.len(), 1);
        assert_eq!(rebases.actions[0].address, Some(TEXT + 0x1008));

        let binds = MachImage::bind_info(&tree, id, BindKind::Regular).unwrap();
        let binds = tree.get(binds);
        let binds = binds.as_bind_info().unwrap();
        assert_eq!(binds.actions.len(), 1);
        assert_eq!(binds.actions[0].symbol_name, "_exit");
        assert_eq!(binds.actions[0].library_ordinal, Some(1));
        assert_eq!(binds.actions[0].address, Some(TEXT + 0x1010));
        assert!(MachImage::bind_info(&tree, id, BindKind::Lazy).is_none());

        let trie = MachImage::export_trie(&tree, id).unwrap();
        let trie = tree.get(trie);
        let trie = trie.as_export_trie().unwrap();
        assert_eq!(trie.exports.len(), 1);
        assert_eq!(trie.exports[0].name, "_main");
        assert_eq!(trie.exports[0].kind, ExportKind::Regular { address: 0x800 });
    }

    /// Places the sample image in a VM-addressed map, slid by `slide`.
    fn mapped_map(slide: u64) -> MemoryMap {
        let file = sample_image();
        let mut map = MemoryMap::new();
        map.add_mapping(
            TEXT + slide,
            0x1100,
            Arc::new(BufferSource::new(file[..0x1100].to_vec())),
            0,
        )
        .unwrap();
        map.add_mapping(
            TEXT + 0x2000 + slide,
            0x100,
            Arc::new(BufferSource::new(file[0x1100..].to_vec())),
            0,
        )
        .unwrap();
        map
    }

    #[test]
    fn test_mapped_image_with_slide() {
        let slide = 0x4000;
        let tree = NodeTree::new(mapped_map(slide), DataModel::LP64);
        let id = MachImage::parse(&tree, tree.root(), TEXT + slide, ImageLayout::Mapped).unwrap();
        let node = tree.get(id);
        let image = node.as_mach_image().unwrap();
        assert_eq!(image.slide, slide as i64);
        assert_eq!(image.linkedit_address(0x1120).unwrap(), TEXT + 0x2020 + slide);

        let data = MachImage::segment_named(&tree, id, "__DATA").unwrap();
        assert_eq!(tree.get(data).as_segment().unwrap().vm_address, TEXT + 0x1000 + slide);

        let symbols = MachImage::symbol_table(&tree, id).unwrap();
        let symbols = tree.get(symbols);
        assert_eq!(symbols.as_symbol_table().unwrap().symbols[1].name, "_exit");

        let rebases = MachImage::rebase_info(&tree, id).unwrap();
        let rebases = tree.get(rebases);
        assert_eq!(
            rebases.as_rebase_info().unwrap().actions[0].address,
            Some(TEXT + 0x1008 + slide)
        );
    }

    #[test]
    fn test_image_through_pointer() {
        let tree = NodeTree::new(mapped_map(0), DataModel::LP64);
        let pointer: Pointer<MachImage> =
            Pointer::new(&tree, tree.root(), TEXT, PointerOptions::default()).unwrap();
        let id = *pointer.pointee(&tree).value().unwrap();
        assert!(tree.get(id).as_mach_image().is_some());
        assert_eq!(pointer.pointee(&tree).value(), Some(&id));
        assert_eq!(tree.children_of_class(tree.root(), NodeClass::MachImage).len(), 1);
    }

    #[test]
    fn test_load_command_overflow_is_a_warning() {
        let mut file = sample_image();
        // Claim one command more than sizeofcmds covers.
        file[16..20].copy_from_slice(&6u32.to_le_bytes());
        let tree = file_tree(file);
        let id = MachImage::parse(&tree, tree.root(), 0, ImageLayout::File { base: 0 }).unwrap();
        let node = tree.get(id);
        let warnings = node.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].property, "load_commands");
        assert_eq!(warnings[0].code, ErrorKind::Bounds);
        assert_eq!(MachImage::load_commands(&tree, id).len(), 5);
    }

    #[test]
    fn test_big_endian_image() {
        let mut file = vec![0u8; 0x100];
        let mut text = SegmentCommand32 {
            cmd: LC_SEGMENT,
            cmdsize: SegmentCommand32::SIZE as u32,
            vmaddr: 0x1000,
            vmsize: 0x1000,
            fileoff: 0,
            filesize: 0x100,
            ..Default::default()
        };
        text.segname[..6].copy_from_slice(b"__TEXT");
        let header = MachHeader32 {
            magic: MH_MAGIC,
            cputype: CPU_TYPE_POWERPC,
            filetype: MH_EXECUTE,
            ncmds: 1,
            sizeofcmds: SegmentCommand32::SIZE as u32,
            ..Default::default()
        };
        put(&mut file, 0, header.swap_bytes().as_bytes());
        put(&mut file, MachHeader32::SIZE, text.swap_bytes().as_bytes());

        let tree = file_tree(file);
        let id = MachImage::parse(&tree, tree.root(), 0, ImageLayout::File { base: 0 }).unwrap();
        let node = tree.get(id);
        let image = node.as_mach_image().unwrap();
        assert!(!image.is_64);
        assert_eq!(tree.data_model(id), DataModel::PPC);
        let text = MachImage::segment_named(&tree, id, "__TEXT").unwrap();
        assert_eq!(tree.get(text).as_segment().unwrap().vm_size(), 0x1000);
    }

    #[test]
    fn test_bad_magic() {
        let tree = file_tree(vec![0x7F, b'E', b'L', b'F', 0, 0, 0, 0]);
        let err = MachImage::parse(&tree, tree.root(), 0, ImageLayout::File { base: 0 }).unwrap_err();
        assert!(matches!(err, Error::InvalidMachoMagic(_)));
        assert!(tree.is_empty());
    }
}
