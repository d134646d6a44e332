//! Dyld shared cache binary structures.
//!
//! The cache header grew over time. Its first 0x70 bytes are always present;
//! anything at or beyond `mapping_offset` belongs to a newer format than the
//! cache was written in and reads as zero.

use std::mem::offset_of;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::data_model::impl_swap_bytes;
use crate::util::lossy_cstr;

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

/// Bytes of header every cache has.
pub const DYLD_CACHE_HEADER_PREFIX: usize = 0x70;

// =============================================================================
// Header
// =============================================================================

/// The dyld shared cache header, up to the modern image list.
///
/// Ranges this crate never reads are kept as reserved bytes so later fields
/// stay at their on-disk offsets.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// Magic identifier, e.g. "dyld_v1   arm64e"
    pub magic: [u8; 16],
    /// File offset of the first mapping entry; also the header's length
    pub mapping_offset: u32,
    /// Number of mapping entries
    pub mapping_count: u32,
    /// Legacy image list offset
    pub images_offset_old: u32,
    /// Legacy image count
    pub images_count_old: u32,
    /// Base address of dyld when the cache was built
    pub dyld_base_address: u64,
    /// File offset of the code signature
    pub code_signature_offset: u64,
    /// Size of the code signature
    pub code_signature_size: u64,
    /// Unused since per-mapping slide info
    pub slide_info_offset_unused: u64,
    /// Unused since per-mapping slide info
    pub slide_info_size_unused: u64,
    /// File offset of local symbols info
    pub local_symbols_offset: u64,
    /// Size of local symbols info
    pub local_symbols_size: u64,
    /// UUID of this cache
    pub uuid: [u8; 16],
    /// 0 = development, 1 = production, 2 = multi-cache
    pub cache_type: u64,
    _reserved_70: [u8; 0x68],
    /// Platform
    pub platform: u32,
    /// Format version (low 8 bits) and flags
    pub format_version_and_flags: u32,
    /// Start of the shared region
    pub shared_region_start: u64,
    /// Size of the shared region
    pub shared_region_size: u64,
    /// Largest slide the cache supports
    pub max_slide: u64,
    _reserved_f8: [u8; 0x40],
    /// File offset of mapping entries with slide info
    pub mapping_with_slide_offset: u32,
    /// Number of mapping entries with slide info
    pub mapping_with_slide_count: u32,
    _reserved_140: [u8; 0x2C],
    /// OS version
    pub os_version: u32,
    /// Alternative platform
    pub alt_platform: u32,
    /// Alternative OS version
    pub alt_os_version: u32,
    _reserved_178: [u8; 0x10],
    /// File offset of the subcache list
    pub sub_cache_array_offset: u32,
    /// Number of subcaches
    pub sub_cache_array_count: u32,
    /// UUID of the .symbols subcache
    pub symbol_file_uuid: [u8; 16],
    _reserved_1a0: [u8; 0x20],
    /// Image list offset
    pub images_offset: u32,
    /// Image count
    pub images_count: u32,
}

impl DyldCacheHeader {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 0x1C8;

    /// Returns the architecture from the magic string.
    pub fn architecture(&self) -> String {
        let magic = lossy_cstr(&self.magic);
        magic
            .trim_start_matches("dyld_v0")
            .trim_start_matches("dyld_v1")
            .trim()
            .to_string()
    }

    /// Returns true if the field at `field_offset` exists in this cache.
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    /// Returns true if the magic is a dyld cache magic.
    pub fn is_valid(&self) -> bool {
        &self.magic[..4] == DYLD_CACHE_MAGIC_PREFIX
    }

    /// Returns true if the cache lists subcaches, which are not loaded.
    pub fn has_subcaches(&self) -> bool {
        self.contains_field(offset_of!(Self, sub_cache_array_count)) && self.sub_cache_array_count > 0
    }

    /// Returns true if the mapping list carries slide info.
    pub fn has_slide_mappings(&self) -> bool {
        self.contains_field(offset_of!(Self, mapping_with_slide_offset))
            && self.mapping_with_slide_offset != 0
    }

    /// Returns true if the image list lives at the newer location.
    pub fn uses_new_images_offset(&self) -> bool {
        self.contains_field(offset_of!(Self, images_offset)) && self.images_offset != 0
    }

    /// Returns the image list offset, new or legacy.
    pub fn actual_images_offset(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_offset.into()
        } else {
            self.images_offset_old.into()
        }
    }

    /// Returns the image count, new or legacy.
    pub fn actual_images_count(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_count.into()
        } else {
            self.images_count_old.into()
        }
    }
}

impl_swap_bytes!(DyldCacheHeader {
    mapping_offset, mapping_count, images_offset_old, images_count_old, dyld_base_address,
    code_signature_offset, code_signature_size, slide_info_offset_unused,
    slide_info_size_unused, local_symbols_offset, local_symbols_size, cache_type, platform,
    format_version_and_flags, shared_region_start, shared_region_size, max_slide,
    mapping_with_slide_offset, mapping_with_slide_count, os_version, alt_platform,
    alt_os_version, sub_cache_array_offset, sub_cache_array_count, images_offset, images_count
});

// =============================================================================
// Mappings
// =============================================================================

/// Basic mapping entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingInfo {
    /// VM address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
}

impl DyldCacheMappingInfo {
    /// Size of an entry.
    pub const SIZE: usize = 32;
}

/// Mapping entry with per-mapping slide info.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    /// VM address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// File offset of this mapping's slide info
    pub slide_info_file_offset: u64,
    /// Size of this mapping's slide info
    pub slide_info_file_size: u64,
    /// [`MappingFlags`]
    pub flags: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
}

impl DyldCacheMappingAndSlideInfo {
    /// Size of an entry.
    pub const SIZE: usize = 56;
}

impl_swap_bytes!(DyldCacheMappingInfo { address, size, file_offset, max_prot, init_prot });
impl_swap_bytes!(DyldCacheMappingAndSlideInfo {
    address, size, file_offset, slide_info_file_offset, slide_info_file_size, flags, max_prot,
    init_prot
});

bitflags! {
    /// Flags of a mapping with slide info.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MappingFlags: u64 {
        /// Holds authenticated pointers
        const AUTH_DATA = 1 << 0;
        /// Holds dirty data
        const DIRTY_DATA = 1 << 1;
        /// Holds const data
        const CONST_DATA = 1 << 2;
        /// Holds text stubs
        const TEXT_STUBS = 1 << 3;
        /// Holds dynamic config data
        const CONFIG_DATA = 1 << 4;
    }
}

// =============================================================================
// Images
// =============================================================================

/// One entry of the cache's image list.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Unslid address of the Mach-O header
    pub address: u64,
    /// Modification time
    pub mod_time: u64,
    /// Inode
    pub inode: u64,
    /// File offset of the path string
    pub path_file_offset: u32,
    /// Padding
    pub pad: u32,
}

impl DyldCacheImageInfo {
    /// Size of an entry.
    pub const SIZE: usize = 32;
}

impl_swap_bytes!(DyldCacheImageInfo { address, mod_time, inode, path_file_offset, pad });

/// Formats a UUID the way Apple tools print it.
pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    let hex: Vec<String> = uuid.iter().map(|b| format!("{b:02X}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].concat(),
        hex[4..6].concat(),
        hex[6..8].concat(),
        hex[8..10].concat(),
        hex[10..16].concat()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<DyldCacheHeader>(), DyldCacheHeader::SIZE);
        assert_eq!(offset_of!(DyldCacheHeader, cache_type) + 8, DYLD_CACHE_HEADER_PREFIX);
        assert_eq!(offset_of!(DyldCacheHeader, platform), 0xD8);
        assert_eq!(offset_of!(DyldCacheHeader, mapping_with_slide_offset), 0x138);
        assert_eq!(offset_of!(DyldCacheHeader, os_version), 0x16C);
        assert_eq!(offset_of!(DyldCacheHeader, sub_cache_array_offset), 0x188);
        assert_eq!(offset_of!(DyldCacheHeader, images_offset), 0x1C0);
        assert_eq!(std::mem::size_of::<DyldCacheMappingInfo>(), DyldCacheMappingInfo::SIZE);
        assert_eq!(
            std::mem::size_of::<DyldCacheMappingAndSlideInfo>(),
            DyldCacheMappingAndSlideInfo::SIZE
        );
        assert_eq!(std::mem::size_of::<DyldCacheImageInfo>(), DyldCacheImageInfo::SIZE);
    }

    #[test]
    fn test_uuid_to_string() {
        let uuid: [u8; 16] = core::array::from_fn(|i| i as u8);
        assert_eq!(uuid_to_string(&uuid), "00010203-0405-0607-0809-0A0B0C0D0E0F");
    }
}
