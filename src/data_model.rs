//! Per-architecture data models.
//!
//! A [`DataModel`] fixes how bytes are interpreted: pointer width and mask,
//! C integer sizes and byte order. All presets share one shape; they differ only
//! in values.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::macho::{
    CPU_ARCH_ABI64, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32,
    CPU_TYPE_POWERPC, CPU_TYPE_POWERPC64, CPU_TYPE_X86, CPU_TYPE_X86_64,
};

/// Byte order of multi-byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl Endianness {
    /// Returns the byte order of the host.
    pub const fn host() -> Self {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }
}

// =============================================================================
// Byte Swapping
// =============================================================================

/// Values whose in-memory byte order can be reversed field by field.
pub trait SwapBytes: Sized {
    /// Returns `self` with every multi-byte field byte-swapped.
    fn swap_bytes(self) -> Self;
}

macro_rules! impl_swap_bytes_int {
    ($($ty:ty),*) => {
        $(impl SwapBytes for $ty {
            #[inline]
            fn swap_bytes(self) -> Self {
                <$ty>::swap_bytes(self)
            }
        })*
    };
}

impl_swap_bytes_int!(u16, u32, u64, i16, i32, i64);

impl SwapBytes for u8 {
    #[inline]
    fn swap_bytes(self) -> Self {
        self
    }
}

impl<const N: usize> SwapBytes for [u8; N] {
    #[inline]
    fn swap_bytes(self) -> Self {
        self
    }
}

/// Implements [`SwapBytes`] for a plain struct by swapping each named field.
macro_rules! impl_swap_bytes {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::data_model::SwapBytes for $ty {
            fn swap_bytes(self) -> Self {
                Self {
                    $($field: $crate::data_model::SwapBytes::swap_bytes(self.$field),)*
                    ..self
                }
            }
        }
    };
}

pub(crate) use impl_swap_bytes;

// =============================================================================
// Data Model
// =============================================================================

/// Describes how an architecture lays out integers and pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataModel {
    name: &'static str,
    pointer_size: u8,
    pointer_alignment: u8,
    pointer_mask: u64,
    int_size: u8,
    long_size: u8,
    longlong_size: u8,
    endianness: Endianness,
}

impl DataModel {
    /// Generic 32-bit little-endian model.
    pub const ILP32: DataModel = DataModel {
        name: "ILP32",
        pointer_size: 4,
        pointer_alignment: 4,
        pointer_mask: 0xFFFF_FFFF,
        int_size: 4,
        long_size: 4,
        longlong_size: 8,
        endianness: Endianness::Little,
    };

    /// Generic 64-bit little-endian model.
    pub const LP64: DataModel = DataModel {
        name: "LP64",
        pointer_size: 8,
        pointer_alignment: 8,
        pointer_mask: u64::MAX,
        int_size: 4,
        long_size: 8,
        longlong_size: 8,
        endianness: Endianness::Little,
    };

    /// 32-bit Intel.
    pub const X86: DataModel = DataModel {
        name: "x86",
        ..Self::ILP32
    };

    /// 64-bit Intel.
    pub const X86_64: DataModel = DataModel {
        name: "x86_64",
        ..Self::LP64
    };

    /// 32-bit ARM.
    pub const ARM: DataModel = DataModel {
        name: "arm",
        ..Self::ILP32
    };

    /// 64-bit ARM. Only the low 48 bits of a pointer carry an address; the rest
    /// holds tags or authentication codes.
    pub const ARM64: DataModel = DataModel {
        name: "arm64",
        pointer_mask: 0x0000_FFFF_FFFF_FFFF,
        ..Self::LP64
    };

    /// ARM64 hardware running a 32-bit pointer ABI.
    pub const ARM64_32: DataModel = DataModel {
        name: "arm64_32",
        ..Self::ILP32
    };

    /// 32-bit PowerPC (big-endian).
    pub const PPC: DataModel = DataModel {
        name: "ppc",
        endianness: Endianness::Big,
        ..Self::ILP32
    };

    /// 64-bit PowerPC (big-endian).
    pub const PPC64: DataModel = DataModel {
        name: "ppc64",
        endianness: Endianness::Big,
        ..Self::LP64
    };

    /// Big-endian 32-bit model used for fat headers, which are always big-endian.
    pub const FAT: DataModel = DataModel {
        name: "fat",
        endianness: Endianness::Big,
        ..Self::ILP32
    };

    /// Selects a preset for a Mach-O CPU type.
    ///
    /// Unknown CPU types fall back to [`ILP32`](Self::ILP32) or
    /// [`LP64`](Self::LP64) based on the ABI64 bit.
    pub fn for_cpu(cputype: u32) -> DataModel {
        match cputype {
            CPU_TYPE_X86 => Self::X86,
            CPU_TYPE_X86_64 => Self::X86_64,
            CPU_TYPE_ARM => Self::ARM,
            CPU_TYPE_ARM64 => Self::ARM64,
            CPU_TYPE_ARM64_32 => Self::ARM64_32,
            CPU_TYPE_POWERPC => Self::PPC,
            CPU_TYPE_POWERPC64 => Self::PPC64,
            _ if cputype & CPU_ARCH_ABI64 != 0 => Self::LP64,
            _ => Self::ILP32,
        }
    }

    /// Returns a copy of this model with a different byte order.
    pub const fn with_endianness(self, endianness: Endianness) -> DataModel {
        DataModel { endianness, ..self }
    }

    /// Returns the preset name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the pointer size in bytes.
    #[inline]
    pub fn pointer_size(&self) -> u8 {
        self.pointer_size
    }

    /// Returns the natural pointer alignment in bytes.
    #[inline]
    pub fn pointer_alignment(&self) -> u8 {
        self.pointer_alignment
    }

    /// Returns the mask of address-carrying pointer bits.
    #[inline]
    pub fn pointer_mask(&self) -> u64 {
        self.pointer_mask
    }

    /// Returns `sizeof(int)`.
    #[inline]
    pub fn int_size(&self) -> u8 {
        self.int_size
    }

    /// Returns `sizeof(long)`.
    #[inline]
    pub fn long_size(&self) -> u8 {
        self.long_size
    }

    /// Returns `sizeof(long long)`.
    #[inline]
    pub fn longlong_size(&self) -> u8 {
        self.longlong_size
    }

    /// Returns the byte order.
    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Returns true if values must be swapped to be read on this host.
    #[inline]
    pub fn needs_swap(&self) -> bool {
        self.endianness != Endianness::host()
    }

    /// Returns true if `address` fits within the pointer mask.
    #[inline]
    pub fn is_representable(&self, address: u64) -> bool {
        address & !self.pointer_mask == 0
    }

    // -------------------------------------------------------------------------
    // Swap functions
    // -------------------------------------------------------------------------

    /// Converts a 16-bit value between this model's byte order and the host's.
    #[inline]
    pub fn swap16(&self, value: u16) -> u16 {
        if self.needs_swap() {
            value.swap_bytes()
        } else {
            value
        }
    }

    /// Converts a 32-bit value between this model's byte order and the host's.
    #[inline]
    pub fn swap32(&self, value: u32) -> u32 {
        if self.needs_swap() {
            value.swap_bytes()
        } else {
            value
        }
    }

    /// Converts a 64-bit value between this model's byte order and the host's.
    #[inline]
    pub fn swap64(&self, value: u64) -> u64 {
        if self.needs_swap() {
            value.swap_bytes()
        } else {
            value
        }
    }

    /// Converts a raw struct read in host order into this model's order.
    #[inline]
    pub fn fix<T: SwapBytes>(&self, value: T) -> T {
        if self.needs_swap() {
            value.swap_bytes()
        } else {
            value
        }
    }

    // -------------------------------------------------------------------------
    // Slice readers
    // -------------------------------------------------------------------------

    /// Reads a 16-bit value from the start of `bytes`.
    pub fn read_u16(&self, bytes: &[u8]) -> Result<u16> {
        let bytes = prefix(bytes, 2)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u16(bytes),
            Endianness::Big => BigEndian::read_u16(bytes),
        })
    }

    /// Reads a 32-bit value from the start of `bytes`.
    pub fn read_u32(&self, bytes: &[u8]) -> Result<u32> {
        let bytes = prefix(bytes, 4)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u32(bytes),
            Endianness::Big => BigEndian::read_u32(bytes),
        })
    }

    /// Reads a 64-bit value from the start of `bytes`.
    pub fn read_u64(&self, bytes: &[u8]) -> Result<u64> {
        let bytes = prefix(bytes, 8)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u64(bytes),
            Endianness::Big => BigEndian::read_u64(bytes),
        })
    }

    /// Reads a raw struct from the start of `bytes` and converts it to host order.
    pub fn read_struct<T: FromBytes + SwapBytes>(&self, bytes: &[u8]) -> Result<T> {
        let (raw, _) = T::read_from_prefix(bytes)
            .map_err(|_| Error::buffer_too_small(std::mem::size_of::<T>(), bytes.len()))?;
        Ok(self.fix(raw))
    }

    /// Reads a pointer-sized value from the start of `bytes`.
    pub fn read_pointer(&self, bytes: &[u8]) -> Result<u64> {
        if self.pointer_size == 8 {
            self.read_u64(bytes)
        } else {
            self.read_u32(bytes).map(u64::from)
        }
    }
}

#[inline]
fn prefix(bytes: &[u8], len: usize) -> Result<&[u8]> {
    bytes
        .get(..len)
        .ok_or(Error::buffer_too_small(len, bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Pair {
        a: u32,
        b: u16,
        tag: [u8; 2],
    }

    impl_swap_bytes!(Pair { a, b, tag });

    #[test]
    fn test_presets_share_shape() {
        assert_eq!(DataModel::LP64.pointer_size(), 8);
        assert_eq!(DataModel::ILP32.pointer_size(), 4);
        assert_eq!(DataModel::ARM64.long_size(), 8);
        assert_eq!(DataModel::ARM64_32.long_size(), 4);
        assert_eq!(DataModel::PPC.endianness(), Endianness::Big);
        assert_eq!(DataModel::X86.longlong_size(), 8);
    }

    #[test]
    fn test_for_cpu() {
        assert_eq!(DataModel::for_cpu(CPU_TYPE_ARM64), DataModel::ARM64);
        assert_eq!(DataModel::for_cpu(CPU_TYPE_X86), DataModel::X86);
        assert_eq!(DataModel::for_cpu(CPU_TYPE_POWERPC64), DataModel::PPC64);
        assert_eq!(DataModel::for_cpu(0x0100_0099).pointer_size(), 8);
        assert_eq!(DataModel::for_cpu(99).pointer_size(), 4);
    }

    #[test]
    fn test_reads_honour_endianness() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(DataModel::LP64.read_u32(&bytes).unwrap(), 0x0403_0201);
        assert_eq!(DataModel::PPC.read_u32(&bytes).unwrap(), 0x0102_0304);
        assert_eq!(DataModel::PPC64.read_u64(&bytes).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(DataModel::ILP32.read_pointer(&bytes).unwrap(), 0x0403_0201);
        assert!(DataModel::LP64.read_u64(&bytes[..7]).is_err());
    }

    #[test]
    fn test_fix_swaps_foreign_structs() {
        let raw = Pair {
            a: 0x1122_3344,
            b: 0x5566,
            tag: [1, 2],
        };
        let foreign = if Endianness::host() == Endianness::Little {
            DataModel::PPC
        } else {
            DataModel::LP64
        };
        let fixed = foreign.fix(raw);
        assert_eq!(fixed.a, 0x4433_2211);
        assert_eq!(fixed.b, 0x6655);
        assert_eq!(fixed.tag, [1, 2]);

        let native = foreign.with_endianness(Endianness::host());
        assert_eq!(native.fix(raw), raw);
    }

    #[test]
    fn test_pointer_mask() {
        assert!(DataModel::ILP32.is_representable(0xFFFF_FFFF));
        assert!(!DataModel::ILP32.is_representable(0x1_0000_0000));
        assert!(!DataModel::ARM64.is_representable(0x8000_0001_0000_0000));
        assert!(DataModel::LP64.is_representable(u64::MAX));
    }
}
