//! Dyld shared cache containers.
//!
//! A cache node overrides the memory map with one built from the cache's
//! mappings, so everything beneath it is addressed by unslid VM address. The
//! image list is decoded up front but each entry's header and path are only
//! built when first asked for.
//!
//! Only the primary cache file is read; subcaches are reported, not loaded.

mod structs;

pub use structs::*;

use std::cell::OnceCell;
use std::sync::Arc;

use crate::data_model::DataModel;
use crate::error::{Error, ErrorKind, Result, Warning};
use crate::macho::{CStringNode, MachImage};
use crate::memory::{ByteSource, MemoryMap, WindowSource};
use crate::node::{
    NewNode, NodeClass, NodeId, NodeKind, NodeRange, NodeTree, Pointer, PointerOptions, Rooting,
};

// =============================================================================
// Mappings
// =============================================================================

/// One cache mapping, from either entry layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMapping {
    /// Unslid VM address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// Offset from the cache header
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
    /// Flags; empty for basic entries
    pub flags: MappingFlags,
    /// Offset of the slide info, 0 if none
    pub slide_info_file_offset: u64,
    /// Size of the slide info
    pub slide_info_file_size: u64,
}

impl From<DyldCacheMappingInfo> for CacheMapping {
    fn from(info: DyldCacheMappingInfo) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            flags: MappingFlags::empty(),
            slide_info_file_offset: 0,
            slide_info_file_size: 0,
        }
    }
}

impl From<DyldCacheMappingAndSlideInfo> for CacheMapping {
    fn from(info: DyldCacheMappingAndSlideInfo) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            flags: MappingFlags::from_bits_retain(info.flags),
            slide_info_file_offset: info.slide_info_file_offset,
            slide_info_file_size: info.slide_info_file_size,
        }
    }
}

// =============================================================================
// Images
// =============================================================================

/// One image of the cache.
#[derive(Debug)]
pub struct CacheImage {
    /// Position in the image list
    pub index: usize,
    /// The raw entry
    pub info: DyldCacheImageInfo,
    /// The image's Mach-O header, built under the cache
    pub header: Pointer<MachImage>,
    /// The install path, built under the tree root
    pub path: Pointer<CStringNode>,
}

impl CacheImage {
    fn new(
        tree: &NodeTree,
        cache: NodeId,
        cache_address: u64,
        index: usize,
        info: DyldCacheImageInfo,
    ) -> Result<Self> {
        let header = Pointer::new(
            tree,
            cache,
            info.address,
            PointerOptions::rooted(Rooting::Ancestor(NodeClass::SharedCache)),
        )?;
        let path_address = match info.path_file_offset {
            0 => 0,
            offset => cache_address
                .checked_add(offset.into())
                .ok_or(Error::AddressOverflow {
                    address: cache_address,
                    offset: offset.into(),
                })?,
        };
        let path = Pointer::new(
            tree,
            cache,
            path_address,
            PointerOptions::rooted(Rooting::Absolute).optional(),
        )?;
        Ok(Self {
            index,
            info,
            header,
            path,
        })
    }

    /// Resolves the install path.
    pub fn path_string(&self, tree: &NodeTree) -> Option<String> {
        let node = *self.path.pointee(tree).value()?;
        tree.get(node).as_cstring().map(|s| s.value().to_string())
    }
}

// =============================================================================
// Cache
// =============================================================================

/// The shared cache node payload.
#[derive(Debug)]
pub struct SharedCache {
    /// The header; fields the cache predates read as zero
    pub header: DyldCacheHeader,
    /// Context address of the header in the parent
    pub address: u64,
    /// The mappings, with slide info when the cache records it
    pub mappings: Vec<CacheMapping>,
    image_infos: Vec<DyldCacheImageInfo>,
    vm_map: Arc<MemoryMap>,
    images: OnceCell<Vec<CacheImage>>,
}

impl SharedCache {
    /// Returns the architecture named by the magic.
    pub fn architecture(&self) -> String {
        self.header.architecture()
    }

    /// Returns the cache UUID as a string.
    pub fn uuid(&self) -> String {
        uuid_to_string(&self.header.uuid)
    }

    /// Returns the VM map built from the mappings.
    pub fn vm_map(&self) -> &Arc<MemoryMap> {
        &self.vm_map
    }

    /// Returns the number of entries in the image list.
    pub fn image_count(&self) -> usize {
        self.image_infos.len()
    }

    /// Returns the images, creating their pointers on first call.
    ///
    /// `cache` must be the id of the node holding this payload. An entry
    /// whose header address is not a valid pointer is left out and recorded
    /// as a warning on the cache.
    pub fn images(&self, tree: &NodeTree, cache: NodeId) -> &[CacheImage] {
        self.images.get_or_init(|| {
            self.image_infos
                .iter()
                .enumerate()
                .filter_map(|(index, info)| {
                    match CacheImage::new(tree, cache, self.address, index, *info) {
                        Ok(image) => Some(image),
                        Err(error) => {
                            tree.warn_error(cache, &format!("images[{index}]"), error);
                            None
                        }
                    }
                })
                .collect()
        })
    }

    /// Finds an image by install path.
    pub fn image_named(&self, tree: &NodeTree, cache: NodeId, path: &str) -> Option<&CacheImage> {
        self.images(tree, cache)
            .iter()
            .find(|image| image.path_string(tree).as_deref() == Some(path))
    }

    /// Parses the cache whose header is at `address` in `parent`'s context
    /// coordinates.
    ///
    /// A bad magic or an unreadable header prefix is fatal. Unreadable mapping
    /// or image entries end their list early with a warning.
    pub fn parse(tree: &NodeTree, parent: NodeId, address: u64) -> Result<NodeId> {
        let map = tree.memory_map(parent);
        let layout_model = DataModel::LP64;

        let magic = map.read_double_word(0, address, &layout_model)?;
        if &magic.to_le_bytes() != DYLD_CACHE_MAGIC_PREFIX {
            return Err(Error::InvalidCacheMagic(magic.to_le_bytes()));
        }

        // The header is as long as the first mapping is far; anything past
        // that is left zeroed.
        let mapping_offset = map.read_double_word(0x10, address, &layout_model)?;
        let header_len =
            (mapping_offset as usize).clamp(DYLD_CACHE_HEADER_PREFIX, DyldCacheHeader::SIZE);
        let mut raw = map.data(0, address, header_len as u64, true)?;
        raw.resize(DyldCacheHeader::SIZE, 0);
        let header: DyldCacheHeader = layout_model.read_struct(&raw)?;

        let mut warnings = Vec::new();
        let mappings = read_mappings(&map, address, &header, &layout_model, &mut warnings);
        let vm_map = Arc::new(cache_vm_map(&map, address, &mappings, &mut warnings));
        let image_infos = read_image_infos(&map, address, &header, &layout_model, &mut warnings);
        if header.has_subcaches() {
            warnings.push(Warning::new(
                "sub_cache_array_count",
                ErrorKind::Unsupported,
                format!("{} subcaches are not loaded", header.sub_cache_array_count),
            ));
        }

        let model = model_for_architecture(&header.architecture());
        tracing::debug!(
            "{} shared cache at {:#x}: {} mappings, {} images",
            header.architecture(),
            address,
            mappings.len(),
            image_infos.len()
        );

        let cache = SharedCache {
            header,
            address,
            mappings,
            image_infos,
            vm_map: Arc::clone(&vm_map),
            images: OnceCell::new(),
        };
        let id = tree.insert(
            parent,
            NewNode::new(NodeKind::SharedCache(cache))
                .backed(NodeRange::context(address, 0))
                .with_memory_map(vm_map)
                .with_data_model(model),
        )?;
        for warning in warnings {
            tree.warn(id, warning);
        }
        Ok(id)
    }
}

/// Picks the data model for a cache's architecture name.
fn model_for_architecture(arch: &str) -> DataModel {
    if arch.starts_with("arm64_32") {
        DataModel::ARM64_32
    } else if arch.starts_with("arm64") {
        DataModel::ARM64
    } else if arch.starts_with("x86_64") {
        DataModel::X86_64
    } else if arch == "i386" {
        DataModel::X86
    } else if arch.starts_with("arm") {
        DataModel::ARM
    } else {
        DataModel::LP64
    }
}

fn read_mappings(
    map: &MemoryMap,
    address: u64,
    header: &DyldCacheHeader,
    model: &DataModel,
    warnings: &mut Vec<Warning>,
) -> Vec<CacheMapping> {
    let (offset, count, entry_size) = if header.has_slide_mappings() {
        (
            header.mapping_with_slide_offset,
            header.mapping_with_slide_count,
            DyldCacheMappingAndSlideInfo::SIZE,
        )
    } else {
        (header.mapping_offset, header.mapping_count, DyldCacheMappingInfo::SIZE)
    };

    let mut mappings = Vec::new();
    for index in 0..u64::from(count) {
        let entry = u64::from(offset) + index * entry_size as u64;
        let mapping = if header.has_slide_mappings() {
            map.read_struct::<DyldCacheMappingAndSlideInfo>(entry, address, model)
                .map(CacheMapping::from)
        } else {
            map.read_struct::<DyldCacheMappingInfo>(entry, address, model)
                .map(CacheMapping::from)
        };
        match mapping {
            Ok(mapping) => mappings.push(mapping),
            Err(error) => {
                warnings.push(Warning::from_error(format!("mappings[{index}]"), error));
                break;
            }
        }
    }
    mappings
}

/// Places each mapping's file bytes at its VM address.
fn cache_vm_map(
    map: &Arc<MemoryMap>,
    address: u64,
    mappings: &[CacheMapping],
    warnings: &mut Vec<Warning>,
) -> MemoryMap {
    let window: Arc<dyn ByteSource> = Arc::new(WindowSource::new(Arc::clone(map)));
    let mut vm_map = MemoryMap::new();
    for (index, mapping) in mappings.iter().enumerate() {
        if mapping.size == 0 {
            continue;
        }
        let added = address
            .checked_add(mapping.file_offset)
            .ok_or(Error::AddressOverflow {
                address,
                offset: mapping.file_offset,
            })
            .and_then(|from| {
                vm_map.add_mapping(mapping.address, mapping.size, Arc::clone(&window), from)
            });
        if let Err(error) = added {
            warnings.push(Warning::from_error(format!("mappings[{index}]"), error));
        }
    }
    vm_map
}

fn read_image_infos(
    map: &MemoryMap,
    address: u64,
    header: &DyldCacheHeader,
    model: &DataModel,
    warnings: &mut Vec<Warning>,
) -> Vec<DyldCacheImageInfo> {
    let offset = header.actual_images_offset();
    let mut infos = Vec::new();
    for index in 0..header.actual_images_count() {
        let entry = offset + index * DyldCacheImageInfo::SIZE as u64;
        match map.read_struct::<DyldCacheImageInfo>(entry, address, model) {
            Ok(info) => infos.push(info),
            Err(error) => {
                warnings.push(Warning::from_error(format!("images[{index}]"), error));
                break;
            }
        }
    }
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::image::tests::{sample_image, TEXT};
    use zerocopy::{FromZeros, IntoBytes};

    const MAPPING: u64 = TEXT - 0x1000;
    const LIB_PATH: &[u8] = b"/usr/lib/libfoo.dylib\0";

    /// A one-mapping cache holding the sample image at `TEXT` and a second
    /// image entry whose header is not mapped.
    fn cache_file(modern: bool, extra_mapping: bool) -> Vec<u8> {
        let image = sample_image();
        let mut file = vec![0u8; 0x3100];
        file[0x1000..0x2100].copy_from_slice(&image[..0x1100]);
        file[0x3000..0x3100].copy_from_slice(&image[0x1100..]);

        let mapping = DyldCacheMappingInfo {
            address: MAPPING,
            size: 0x3100,
            file_offset: 0,
            max_prot: 5,
            init_prot: 5,
        };
        let count = if extra_mapping { 2 } else { 1 };

        let mut header = DyldCacheHeader::new_zeroed();
        header.magic = *b"dyld_v1  x86_64h";
        header.mapping_count = count;
        let (images_offset, path_offset) = if modern {
            header.mapping_offset = DyldCacheHeader::SIZE as u32;
            let slide_offset = DyldCacheHeader::SIZE + 2 * DyldCacheMappingInfo::SIZE;
            header.mapping_with_slide_offset = slide_offset as u32;
            header.mapping_with_slide_count = count;
            let slide_mapping = DyldCacheMappingAndSlideInfo {
                address: mapping.address,
                size: mapping.size,
                file_offset: mapping.file_offset,
                flags: MappingFlags::CONST_DATA.bits(),
                max_prot: 5,
                init_prot: 5,
                ..Default::default()
            };
            for i in 0..count as usize {
                let at = DyldCacheHeader::SIZE + i * DyldCacheMappingInfo::SIZE;
                file[at..at + DyldCacheMappingInfo::SIZE].copy_from_slice(mapping.as_bytes());
                let at = slide_offset + i * DyldCacheMappingAndSlideInfo::SIZE;
                file[at..at + DyldCacheMappingAndSlideInfo::SIZE]
                    .copy_from_slice(slide_mapping.as_bytes());
            }
            header.images_offset = 0x280;
            header.images_count = 2;
            (0x280, 0x2C0)
        } else {
            header.mapping_offset = DYLD_CACHE_HEADER_PREFIX as u32;
            for i in 0..count as usize {
                let at = DYLD_CACHE_HEADER_PREFIX + i * DyldCacheMappingInfo::SIZE;
                file[at..at + DyldCacheMappingInfo::SIZE].copy_from_slice(mapping.as_bytes());
            }
            header.images_offset_old = 0xB0;
            header.images_count_old = 2;
            (0xB0, 0xF0)
        };
        let header_len = (header.mapping_offset as usize).min(DyldCacheHeader::SIZE);
        file[..header_len].copy_from_slice(&header.as_bytes()[..header_len]);

        let infos = [
            DyldCacheImageInfo {
                address: TEXT,
                path_file_offset: path_offset as u32,
                ..Default::default()
            },
            DyldCacheImageInfo {
                address: 0x5000_0000,
                ..Default::default()
            },
        ];
        for (i, info) in infos.iter().enumerate() {
            let at = images_offset + i * DyldCacheImageInfo::SIZE;
            file[at..at + DyldCacheImageInfo::SIZE].copy_from_slice(info.as_bytes());
        }
        file[path_offset..path_offset + LIB_PATH.len()].copy_from_slice(LIB_PATH);
        file
    }

    fn cache_tree(file: Vec<u8>) -> (NodeTree, NodeId) {
        let tree = NodeTree::new(MemoryMap::from_bytes(file).unwrap(), DataModel::LP64);
        let id = SharedCache::parse(&tree, tree.root(), 0).unwrap();
        (tree, id)
    }

    #[test]
    fn test_legacy_cache() {
        let (tree, id) = cache_tree(cache_file(false, false));
        let node = tree.get(id);
        let cache = node.as_shared_cache().unwrap();
        assert!(node.warnings().is_empty());
        assert_eq!(cache.architecture(), "x86_64h");
        assert_eq!(tree.data_model(id), DataModel::X86_64);
        assert!(!cache.header.has_slide_mappings());
        assert!(!cache.header.uses_new_images_offset());
        assert_eq!(cache.mappings.len(), 1);
        assert_eq!(cache.mappings[0].address, MAPPING);
        assert!(cache.mappings[0].flags.is_empty());

        let images = cache.images(&tree, id);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].path_string(&tree).as_deref(), Some("/usr/lib/libfoo.dylib"));

        let image_id = *images[0].header.pointee(&tree).value().unwrap();
        assert_eq!(tree.get(image_id).parent(), Some(id));
        let image_node = tree.get(image_id);
        let image = image_node.as_mach_image().unwrap();
        assert_eq!(image.slide, 0);
        assert_eq!(image.linkedit_address(0x1120).unwrap(), TEXT + 0x2020);

        let symbols = MachImage::symbol_table(&tree, image_id).unwrap();
        assert_eq!(tree.get(symbols).as_symbol_table().unwrap().symbols[0].name, "_main");
        let rebases = MachImage::rebase_info(&tree, image_id).unwrap();
        assert_eq!(
            tree.get(rebases).as_rebase_info().unwrap().actions[0].address,
            Some(TEXT + 0x1008)
        );
    }

    #[test]
    fn test_modern_cache() {
        let (tree, id) = cache_tree(cache_file(true, false));
        let node = tree.get(id);
        let cache = node.as_shared_cache().unwrap();
        assert!(cache.header.has_slide_mappings());
        assert!(cache.header.uses_new_images_offset());
        assert_eq!(cache.mappings[0].flags, MappingFlags::CONST_DATA);
        assert_eq!(cache.image_count(), 2);

        let image = cache.image_named(&tree, id, "/usr/lib/libfoo.dylib").unwrap();
        assert_eq!(image.index, 0);
        let first = image.header.pointee(&tree);
        let second = image.header.pointee(&tree);
        assert_eq!(first.value(), second.value());
        assert_eq!(image.header.resolution_count(), 1);
        assert_eq!(tree.children_of_class(id, NodeClass::MachImage).len(), 1);
        assert!(cache.image_named(&tree, id, "/usr/lib/libbar.dylib").is_none());
    }

    #[test]
    fn test_unmapped_image_and_missing_path() {
        let (tree, id) = cache_tree(cache_file(false, false));
        let node = tree.get(id);
        let images = node.as_shared_cache().unwrap().images(&tree, id);

        let header = images[1].header.pointee(&tree);
        assert_eq!(header.error_ref().unwrap().kind(), ErrorKind::NotMapped);
        assert!(images[1].path.pointee(&tree).is_empty());
        assert!(images[1].path_string(&tree).is_none());
    }

    #[test]
    fn test_overlapping_mapping_is_a_warning() {
        let (tree, id) = cache_tree(cache_file(false, true));
        let node = tree.get(id);
        assert_eq!(node.as_shared_cache().unwrap().mappings.len(), 2);
        let warnings = node.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].property, "mappings[1]");
    }

    #[test]
    fn test_bad_magic() {
        let tree = NodeTree::new(
            MemoryMap::from_bytes(sample_image()).unwrap(),
            DataModel::LP64,
        );
        let error = SharedCache::parse(&tree, tree.root(), 0).unwrap_err();
        assert!(matches!(error, Error::InvalidCacheMagic(_)));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_model_for_architecture() {
        assert_eq!(model_for_architecture("arm64e"), DataModel::ARM64);
        assert_eq!(model_for_architecture("arm64_32"), DataModel::ARM64_32);
        assert_eq!(model_for_architecture("i386"), DataModel::X86);
        assert_eq!(model_for_architecture("armv7k"), DataModel::ARM);
    }
}
