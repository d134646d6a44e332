//! Fat (universal) binaries.

use super::constants::*;
use super::image::{ImageLayout, MachImage};
use super::structs::{FatArch32, FatArch64, FatHeader};
use crate::data_model::DataModel;
use crate::error::{Error, Result};
use crate::node::{NewNode, NodeId, NodeKind, NodeRange, NodeTree};

/// The fat header node payload.
#[derive(Debug, Clone)]
pub struct FatBinary {
    /// The header
    pub header: FatHeader,
}

impl FatBinary {
    /// Returns true for 64-bit arch entries.
    #[inline]
    pub fn is_64(&self) -> bool {
        self.header.magic == FAT_MAGIC_64
    }

    /// Parses a fat binary at `address` under `parent`, with one child per
    /// architecture and the slice's image beneath it.
    pub fn parse(tree: &NodeTree, parent: NodeId, address: u64) -> Result<NodeId> {
        let model = DataModel::FAT;
        let map = tree.memory_map(parent);
        let header: FatHeader = map.read_struct(0, address, &model)?;
        if header.magic != FAT_MAGIC && header.magic != FAT_MAGIC_64 {
            return Err(Error::InvalidFatMagic(header.magic));
        }

        let fat = FatBinary { header };
        let entry_size = if fat.is_64() {
            FatArch64::SIZE
        } else {
            FatArch32::SIZE
        } as u64;
        let limit = tree.options().max_fat_archs;
        let count = header.nfat_arch.min(limit);

        let id = tree.insert(
            parent,
            NewNode::new(NodeKind::FatBinary(fat.clone()))
                .backed(NodeRange::context(address, 0))
                .with_data_model(model),
        )?;
        if header.nfat_arch > limit {
            tree.warn_error(
                id,
                "nfat_arch",
                Error::parse(address, format!("{} archs, reading the first {limit}", header.nfat_arch)),
            );
        }
        tracing::debug!("fat binary at {:#x} with {} archs", address, header.nfat_arch);

        for index in 0..count {
            let property = format!("archs[{index}]");
            let entry_address = FatHeader::SIZE as u64 + u64::from(index) * entry_size;
            let arch = if fat.is_64() {
                map.read_struct::<FatArch64>(entry_address, address, &model)
                    .map(FatArch::from)
            } else {
                map.read_struct::<FatArch32>(entry_address, address, &model)
                    .map(FatArch::from)
            };
            let arch = match arch {
                Ok(arch) => arch,
                Err(error) => {
                    tree.warn_error(id, &property, error);
                    break;
                }
            };
            if let Err(error) = arch.parse_slice(tree, id, address) {
                tree.warn_error(id, &property, error);
            }
        }

        Ok(id)
    }
}

/// One architecture entry of a fat binary, widened to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// Offset of the slice from the start of the fat binary
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch {
    /// Returns the architecture name.
    pub fn arch_name(&self) -> &'static str {
        arch_name(self.cputype, self.cpusubtype)
    }

    /// Inserts this entry under `fat` and parses its image.
    ///
    /// A slice that is not fully mapped fails before anything is inserted. A
    /// slice whose image cannot be parsed keeps its arch node and records the
    /// failure there.
    fn parse_slice(&self, tree: &NodeTree, fat: NodeId, fat_address: u64) -> Result<NodeId> {
        let start = fat_address
            .checked_add(self.offset)
            .ok_or(Error::AddressOverflow {
                address: fat_address,
                offset: self.offset,
            })?;
        tree.memory_map(fat).check_mapping(0, start, self.size)?;

        let id = tree.insert(
            fat,
            NewNode::new(NodeKind::FatArch(*self)).backed(NodeRange::context(start, self.size)),
        )?;
        tracing::debug!("{} slice at {:#x} ({:#x} bytes)", self.arch_name(), start, self.size);

        if let Err(error) = MachImage::parse(tree, id, start, ImageLayout::File { base: start }) {
            tree.warn_error(id, "image", error);
        }
        Ok(id)
    }
}

impl From<FatArch32> for FatArch {
    fn from(arch: FatArch32) -> Self {
        Self {
            cputype: arch.cputype,
            cpusubtype: arch.cpusubtype,
            offset: arch.offset.into(),
            size: arch.size.into(),
            align: arch.align,
        }
    }
}

impl From<FatArch64> for FatArch {
    fn from(arch: FatArch64) -> Self {
        Self {
            cputype: arch.cputype,
            cpusubtype: arch.cpusubtype,
            offset: arch.offset,
            size: arch.size,
            align: arch.align,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::SwapBytes;
    use crate::macho::image::tests::sample_image;
    use crate::memory::MemoryMap;
    use crate::node::NodeClass;
    use zerocopy::IntoBytes;

    fn fat_file(archs: &[FatArch32], slices: &[(usize, Vec<u8>)]) -> Vec<u8> {
        let header = FatHeader {
            magic: FAT_MAGIC,
            nfat_arch: archs.len() as u32,
        };
        let mut file = header.swap_bytes().as_bytes().to_vec();
        for arch in archs {
            file.extend_from_slice(arch.swap_bytes().as_bytes());
        }
        for (offset, slice) in slices {
            file.resize(*offset, 0);
            file.extend_from_slice(slice);
        }
        file
    }

    #[test]
    fn test_slices_become_images() {
        let image = sample_image();
        let arch = FatArch32 {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
            offset: 0x1000,
            size: image.len() as u32,
            align: 12,
        };
        let file = fat_file(&[arch], &[(0x1000, image)]);
        let tree = NodeTree::new(MemoryMap::from_bytes(file).unwrap(), DataModel::LP64);

        let fat = FatBinary::parse(&tree, tree.root(), 0).unwrap();
        assert!(tree.get(fat).warnings().is_empty());
        let archs = tree.children_of_class(fat, NodeClass::FatArch);
        assert_eq!(archs.len(), 1);
        assert_eq!(tree.get(archs[0]).as_fat_arch().unwrap().arch_name(), "x86_64");

        let images = tree.children_of_class(archs[0], NodeClass::MachImage);
        assert_eq!(images.len(), 1);
        let node = tree.get(images[0]);
        let image = node.as_mach_image().unwrap();
        assert_eq!(image.address, 0x1000);
        assert_eq!(image.linkedit_address(0x1120).unwrap(), 0x2120);
        assert_eq!(
            MachImage::symbol_table(&tree, images[0])
                .map(|id| tree.get(id).as_symbol_table().unwrap().symbols.len()),
            Some(2)
        );
    }

    #[test]
    fn test_arch_outside_source_is_a_warning() {
        let image = sample_image();
        let good = FatArch32 {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
            offset: 0x1000,
            size: image.len() as u32,
            align: 12,
        };
        let bad = FatArch32 {
            cputype: CPU_TYPE_ARM64,
            offset: 0x10_0000,
            size: 0x1000,
            ..Default::default()
        };
        let file = fat_file(&[bad, good], &[(0x1000, image)]);
        let tree = NodeTree::new(MemoryMap::from_bytes(file).unwrap(), DataModel::LP64);

        let fat = FatBinary::parse(&tree, tree.root(), 0).unwrap();
        let node = tree.get(fat);
        let warnings = node.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].property, "archs[0]");
        assert_eq!(tree.children_of_class(fat, NodeClass::FatArch).len(), 1);
    }

    #[test]
    fn test_not_a_fat_binary() {
        let tree = NodeTree::new(MemoryMap::from_bytes(sample_image()).unwrap(), DataModel::LP64);
        let err = FatBinary::parse(&tree, tree.root(), 0).unwrap_err();
        assert!(matches!(err, Error::InvalidFatMagic(_)));
    }
}
