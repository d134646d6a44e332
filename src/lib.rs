//! machtree - a typed, navigable node tree over Mach-O binaries.
//!
//! This library reads fat binaries, Mach-O images and dyld shared caches from
//! files, in-memory buffers or live process memory and turns every structure
//! it finds into a node of a [`NodeTree`].
//!
//! # Features
//!
//! - Address translation across file offsets, slid VM addresses and host memory
//! - Rebase, bind (regular, weak, lazy, threaded) and export trie decoding
//! - Recoverable problems recorded as per-node warnings instead of aborting
//! - Lazily resolved, memoized pointers between nodes
//! - Variant dispatch through ranking registries that callers can extend
//!
//! # Example
//!
//! ```no_run
//! use machtree::{parse_file, MachImage, NodeClass, ParseOptions};
//!
//! fn main() -> machtree::Result<()> {
//!     let (tree, top) = parse_file("/usr/lib/dyld", ParseOptions::default())?;
//!
//!     for image in tree.children_of_class(top, NodeClass::MachImage) {
//!         if let Some(symbols) = MachImage::symbol_table(&tree, image) {
//!             let node = tree.get(symbols);
//!             for symbol in &node.as_symbol_table().unwrap().symbols {
//!                 println!("{:#x} {}", symbol.value, symbol.name);
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod data_model;
pub mod dyld_info;
pub mod error;
pub mod macho;
pub mod memory;
pub mod node;
pub mod resolved;
pub mod shared_cache;
pub mod util;

// Re-export main types
pub use data_model::{DataModel, Endianness};
pub use dyld_info::{BindKind, ExportKind, OutOfRangePolicy, RawTerminal};
pub use error::{Error, ErrorKind, Result, Warning};
pub use macho::{
    FatBinary, ImageLayout, LoadCommandKind, MachImage, RawLoadCommand, RawSymbol, SymbolKind,
};
pub use memory::MemoryMap;
pub use node::{Node, NodeClass, NodeId, NodeKind, NodeTree, Registry};
pub use resolved::Resolved;
pub use shared_cache::SharedCache;

use std::path::Path;

use macho::{FAT_MAGIC, FAT_MAGIC_64, MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};

/// Options controlling how a tree is built.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Variants tried for each load command
    pub load_commands: Registry<RawLoadCommand, LoadCommandKind>,
    /// Variants tried for each symbol table entry
    pub symbols: Registry<RawSymbol, SymbolKind>,
    /// Variants tried for each export trie terminal
    pub export_terminals: Registry<RawTerminal, ExportKind>,
    /// What to do with fixups outside their segment
    pub out_of_range: OutOfRangePolicy,
    /// Fat arch entries read at most
    pub max_fat_archs: u32,
    /// Decode rebase, bind and export info
    pub parse_dyld_info: bool,
    /// Decode the symbol table
    pub parse_symbols: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            load_commands: macho::load_command::default_registry(),
            symbols: macho::symbols::default_registry(),
            export_terminals: dyld_info::export_trie::default_registry(),
            out_of_range: OutOfRangePolicy::default(),
            max_fat_archs: 64,
            parse_dyld_info: true,
            parse_symbols: true,
        }
    }
}

/// The container format a byte source starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// A fat (universal) binary
    Fat,
    /// A single Mach-O image
    MachO,
    /// A dyld shared cache
    SharedCache,
}

/// Identifies the format of the bytes at context address 0 of `map`.
pub fn detect_format(map: &MemoryMap) -> Result<SourceFormat> {
    let magic = map.read_double_word(0, 0, &DataModel::LP64)?;
    match magic {
        MH_MAGIC | MH_MAGIC_64 | MH_CIGAM | MH_CIGAM_64 => Ok(SourceFormat::MachO),
        _ if matches!(magic.swap_bytes(), FAT_MAGIC | FAT_MAGIC_64) => Ok(SourceFormat::Fat),
        _ if &magic.to_le_bytes() == shared_cache::DYLD_CACHE_MAGIC_PREFIX => {
            Ok(SourceFormat::SharedCache)
        }
        other => Err(Error::InvalidMachoMagic(other)),
    }
}

/// Builds a tree over `map` and parses whatever it starts with.
///
/// Returns the tree and the id of the top-level fat binary, image or cache.
pub fn parse_map(map: MemoryMap, options: ParseOptions) -> Result<(NodeTree, NodeId)> {
    let format = detect_format(&map)?;
    tracing::debug!("detected {:?}", format);
    let tree = NodeTree::with_options(map, DataModel::LP64, options);
    let root = tree.root();
    let top = match format {
        SourceFormat::Fat => FatBinary::parse(&tree, root, 0)?,
        SourceFormat::MachO => MachImage::parse(&tree, root, 0, ImageLayout::File { base: 0 })?,
        SourceFormat::SharedCache => SharedCache::parse(&tree, root, 0)?,
    };
    Ok((tree, top))
}

/// Parses an in-memory buffer.
pub fn parse_bytes(data: Vec<u8>, options: ParseOptions) -> Result<(NodeTree, NodeId)> {
    parse_map(MemoryMap::from_bytes(data)?, options)
}

/// Memory maps and parses a file.
pub fn parse_file<P: AsRef<Path>>(path: P, options: ParseOptions) -> Result<(NodeTree, NodeId)> {
    parse_map(MemoryMap::open(path)?, options)
}

/// Parses the image whose header is mapped at `header_address` in a live
/// process.
#[cfg(target_os = "linux")]
pub fn parse_process(
    pid: u32,
    header_address: u64,
    options: ParseOptions,
) -> Result<(NodeTree, NodeId)> {
    let tree = NodeTree::with_options(MemoryMap::for_process(pid)?, DataModel::LP64, options);
    let image = MachImage::parse(&tree, tree.root(), header_address, ImageLayout::Mapped)?;
    Ok((tree, image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::image::tests::{sample_image, TEXT};
    use std::io::Write;

    #[test]
    fn test_detect_format() {
        let map = MemoryMap::from_bytes(sample_image()).unwrap();
        assert_eq!(detect_format(&map).unwrap(), SourceFormat::MachO);

        let map = MemoryMap::from_bytes(vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 0]).unwrap();
        assert_eq!(detect_format(&map).unwrap(), SourceFormat::Fat);

        let map = MemoryMap::from_bytes(b"dyld_v1  x86_64h".to_vec()).unwrap();
        assert_eq!(detect_format(&map).unwrap(), SourceFormat::SharedCache);

        let map = MemoryMap::from_bytes(b"\x7fELF".to_vec()).unwrap();
        assert!(matches!(detect_format(&map), Err(Error::InvalidMachoMagic(_))));
    }

    #[test]
    fn test_parse_bytes() {
        let (tree, top) = parse_bytes(sample_image(), ParseOptions::default()).unwrap();
        assert_eq!(tree.get(top).class(), NodeClass::MachImage);
        assert!(MachImage::symbol_table(&tree, top).is_some());
        assert!(MachImage::segment_named(&tree, top, "__LINKEDIT").is_some());
    }

    #[test]
    fn test_options_skip_linkedit() {
        let options = ParseOptions {
            parse_dyld_info: false,
            parse_symbols: false,
            ..ParseOptions::default()
        };
        let (tree, top) = parse_bytes(sample_image(), options).unwrap();
        assert!(MachImage::symbol_table(&tree, top).is_none());
        assert!(MachImage::rebase_info(&tree, top).is_none());
        assert!(MachImage::export_trie(&tree, top).is_none());
        assert_eq!(MachImage::segments(&tree, top).len(), 3);
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sample_image()).unwrap();
        file.flush().unwrap();

        let (tree, top) = parse_file(file.path(), ParseOptions::default()).unwrap();
        let node = tree.get(top);
        let image = node.as_mach_image().unwrap();
        assert_eq!(image.arch_name(), "x86_64");
        let data = MachImage::segment_named(&tree, top, "__DATA").unwrap();
        assert_eq!(tree.get(data).as_segment().unwrap().vm_address, TEXT + 0x1000);
    }
}
