//! Address translation over one or more byte sources.
//!
//! A [`MemoryMap`] places byte sources at context addresses. The meaning of a
//! context address depends on who built the map: a file offset, a slid VM
//! address, or an address in a live process. Every read goes through
//! [`MemoryMap::remap_bytes`], which checks the address arithmetic, resolves the
//! request against the mappings, and hands the caller a borrowed view valid only
//! for the duration of a closure.

mod source;

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use zerocopy::FromBytes;

use crate::data_model::{DataModel, SwapBytes};
use crate::error::{Error, Result};

pub use source::{
    BufferSource, ByteSource, FileSource, ProcessMemory, ProcessSource, WindowSource,
    PROCESS_PAGE_SIZE,
};
#[cfg(target_os = "linux")]
pub use source::ProcMem;

/// Bytes copied per read when a range cannot be borrowed.
const GATHER_CHUNK: u64 = 0x10000;

// =============================================================================
// Mapping
// =============================================================================

/// One contiguous range of context addresses backed by a byte source.
#[derive(Debug, Clone)]
pub struct Mapping {
    context_address: u64,
    size: u64,
    source_offset: u64,
    source: Arc<dyn ByteSource>,
}

impl Mapping {
    /// Returns the first context address covered.
    #[inline]
    pub fn context_address(&self) -> u64 {
        self.context_address
    }

    /// Returns the number of bytes covered.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the offset in the source of the first byte.
    #[inline]
    pub fn source_offset(&self) -> u64 {
        self.source_offset
    }

    /// Returns the exclusive end context address.
    #[inline]
    pub fn end(&self) -> u64 {
        self.context_address + self.size
    }

    /// Returns true if this mapping contains `address`.
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.context_address && address < self.end()
    }

    #[inline]
    fn source_position(&self, address: u64) -> u64 {
        self.source_offset.saturating_add(address - self.context_address)
    }
}

// =============================================================================
// Remapped View
// =============================================================================

/// The bytes handed to a [`MemoryMap::remap_bytes`] handler.
///
/// The view may be shorter than requested, and even empty, when the caller did
/// not require the full range.
#[derive(Debug)]
pub struct Remapped<'a> {
    address: u64,
    requested: u64,
    bytes: Cow<'a, [u8]>,
}

impl<'a> Remapped<'a> {
    /// Returns the context address of the first byte.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the number of bytes the caller asked for.
    #[inline]
    pub fn requested(&self) -> u64 {
        self.requested
    }

    /// Returns the available bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the number of available bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if nothing is mapped at the address.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns true if every requested byte is available.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bytes.len() as u64 == self.requested
    }

    /// Returns true if the bytes borrow the source directly.
    #[inline]
    pub fn is_direct(&self) -> bool {
        matches!(self.bytes, Cow::Borrowed(_))
    }
}

// =============================================================================
// Memory Map
// =============================================================================

/// Translates context addresses into bytes.
///
/// Mappings never overlap. Lookups are `&self` and keep no cursor state, so
/// any number of nodes may share one map.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    mappings: Vec<Mapping>,
}

impl MemoryMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a map of an owned buffer at context address 0.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let mut map = Self::new();
        let size = data.len() as u64;
        if size > 0 {
            map.add_mapping(0, size, Arc::new(BufferSource::new(data)), 0)?;
        }
        Ok(map)
    }

    /// Creates a map of a file at context address 0 (context = file offset).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = FileSource::open(path)?;
        let mut map = Self::new();
        let size = source.len();
        if size > 0 {
            map.add_mapping(0, size, Arc::new(source), 0)?;
        }
        Ok(map)
    }

    /// Creates a map of a live process (context = process address).
    #[cfg(target_os = "linux")]
    pub fn for_process(pid: u32) -> Result<Self> {
        let source = ProcessSource::new(pid, ProcMem::open(pid)?);
        let mut map = Self::new();
        map.add_mapping(0, u64::MAX, Arc::new(source), 0)?;
        Ok(map)
    }

    /// Places `size` bytes of `source`, starting at `source_offset`, at
    /// `context_address`.
    pub fn add_mapping(
        &mut self,
        context_address: u64,
        size: u64,
        source: Arc<dyn ByteSource>,
        source_offset: u64,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::EmptyMapping {
                address: context_address,
            });
        }
        let end = context_address
            .checked_add(size)
            .ok_or(Error::AddressOverflow {
                address: context_address,
                offset: size,
            })?;

        let index = self
            .mappings
            .partition_point(|m| m.context_address < context_address);
        let overlaps_prev = index
            .checked_sub(1)
            .map(|i| self.mappings[i].end() > context_address)
            .unwrap_or(false);
        let overlaps_next = self
            .mappings
            .get(index)
            .map(|m| m.context_address < end)
            .unwrap_or(false);
        if overlaps_prev || overlaps_next {
            return Err(Error::OverlappingMapping {
                address: context_address,
                size,
            });
        }

        tracing::trace!(
            "mapping {:#x}..{:#x} -> source offset {:#x}",
            context_address,
            end,
            source_offset
        );
        self.mappings.insert(
            index,
            Mapping {
                context_address,
                size,
                source_offset,
                source,
            },
        );
        Ok(())
    }

    /// Returns the mappings sorted by context address.
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Derives a map covering only `[start, start + len)` of this one, at the
    /// same context addresses.
    pub fn restricted(self: &Arc<Self>, start: u64, len: u64) -> Result<MemoryMap> {
        self.window(start, start, len)
    }

    /// Derives a map that shows `len` bytes of this map, starting at context
    /// address `from`, at context address `at`.
    pub fn window(self: &Arc<Self>, at: u64, from: u64, len: u64) -> Result<MemoryMap> {
        from.checked_add(len).ok_or(Error::AddressOverflow {
            address: from,
            offset: len,
        })?;
        let mut map = MemoryMap::new();
        map.add_mapping(at, len, Arc::new(WindowSource::new(Arc::clone(self))), from)?;
        Ok(map)
    }

    /// Finds the mapping containing `address`.
    fn find(&self, address: u64) -> Option<(usize, &Mapping)> {
        let index = self
            .mappings
            .partition_point(|m| m.context_address <= address)
            .checked_sub(1)?;
        let mapping = &self.mappings[index];
        mapping.contains(address).then_some((index, mapping))
    }

    /// Returns `len` bytes at `address` without copying, if one mapping holds
    /// them all and its source allows direct access.
    pub(crate) fn direct(&self, address: u64, len: usize) -> Option<&[u8]> {
        let (_, mapping) = self.find(address)?;
        let end = address.checked_add(len as u64)?;
        if end > mapping.end() {
            return None;
        }
        mapping.source.slice(mapping.source_position(address), len)
    }

    /// Computes `context_address + offset` and the end of a `length` byte range.
    fn span(offset: u64, context_address: u64, length: u64) -> Result<(u64, u64)> {
        let address = context_address
            .checked_add(offset)
            .ok_or(Error::AddressOverflow {
                address: context_address,
                offset,
            })?;
        let end = address.checked_add(length).ok_or(Error::AddressOverflow {
            address,
            offset: length,
        })?;
        Ok((address, end))
    }

    /// Returns how many bytes from `address` are covered by adjacent mappings,
    /// capped at `length`.
    fn covered(&self, address: u64, length: u64) -> u64 {
        let Some((mut index, _)) = self.find(address) else {
            return 0;
        };
        let mut cursor = address;
        let end = address.saturating_add(length);
        while cursor < end {
            let Some(mapping) = self.mappings.get(index) else {
                break;
            };
            if mapping.context_address != cursor && !mapping.contains(cursor) {
                break;
            }
            cursor = mapping.end().min(end);
            index += 1;
        }
        cursor - address
    }

    /// Checks that every byte of the range is mapped.
    ///
    /// An empty range is mapped only when its start address is.
    pub fn check_mapping(&self, offset: u64, context_address: u64, length: u64) -> Result<()> {
        let (address, _) = Self::span(offset, context_address, length)?;
        if length == 0 {
            return match self.find(address) {
                Some(_) => Ok(()),
                None => Err(Error::NotMapped { address }),
            };
        }
        match self.covered(address, length) {
            covered if covered == length => Ok(()),
            covered => Err(Self::short(address, length, covered)),
        }
    }

    /// The error for a range of which only `available` bytes are mapped.
    fn short(address: u64, requested: u64, available: u64) -> Error {
        if available == 0 {
            Error::NotMapped { address }
        } else {
            Error::PartiallyMapped {
                address,
                requested,
                available,
            }
        }
    }

    /// Returns true if every byte of the range is mapped.
    pub fn has_mapping(&self, offset: u64, context_address: u64, length: u64) -> bool {
        self.check_mapping(offset, context_address, length).is_ok()
    }

    /// Gathers up to `length` contiguous bytes starting at `address`.
    ///
    /// `length` must already be capped to what the mappings cover. Copies grow
    /// chunk by chunk as reads succeed.
    fn gather(&self, address: u64, length: u64) -> Result<Cow<'_, [u8]>> {
        let Some((first, mapping)) = self.find(address) else {
            return Ok(Cow::Borrowed(&[]));
        };

        let in_first = (mapping.end() - address).min(length);
        if in_first == length || !self.continues_after(first) {
            if let Some(bytes) = usize::try_from(in_first)
                .ok()
                .and_then(|len| mapping.source.slice(mapping.source_position(address), len))
            {
                return Ok(Cow::Borrowed(bytes));
            }
        }

        let mut buffer = Vec::new();
        let mut remaining = length;
        let mut cursor = address;
        let mut index = first;

        'mappings: while remaining > 0 {
            let Some(mapping) = self.mappings.get(index) else {
                break;
            };
            if !mapping.contains(cursor) {
                break;
            }
            let mut in_mapping = (mapping.end() - cursor).min(remaining);
            while in_mapping > 0 {
                let want = in_mapping.min(GATHER_CHUNK) as usize;
                let filled = buffer.len();
                buffer.resize(filled + want, 0);
                let got = mapping
                    .source
                    .read_into(mapping.source_position(cursor), &mut buffer[filled..])?;
                buffer.truncate(filled + got);
                cursor += got as u64;
                remaining -= got as u64;
                in_mapping -= got as u64;
                if got < want {
                    break 'mappings;
                }
            }
            index += 1;
        }

        Ok(Cow::Owned(buffer))
    }

    fn continues_after(&self, index: usize) -> bool {
        match (self.mappings.get(index), self.mappings.get(index + 1)) {
            (Some(a), Some(b)) => a.end() == b.context_address,
            _ => false,
        }
    }

    /// Translates a range into host bytes and runs `handler` over them.
    ///
    /// With `require_full`, fails before calling `handler` unless all `length`
    /// bytes are available. Without it, `handler` receives however many
    /// contiguous bytes are mapped from the start of the range, possibly none.
    /// The bytes are only valid for the duration of the call.
    pub fn remap_bytes<R>(
        &self,
        offset: u64,
        context_address: u64,
        length: u64,
        require_full: bool,
        handler: impl FnOnce(Remapped<'_>) -> R,
    ) -> Result<R> {
        let (address, _) = Self::span(offset, context_address, length)?;
        let covered = self.covered(address, length);
        if require_full && covered < length {
            return Err(Self::short(address, length, covered));
        }
        let bytes = if covered == 0 {
            Cow::Borrowed(&[][..])
        } else {
            self.gather(address, covered)?
        };

        if require_full && (bytes.len() as u64) < length {
            return Err(Self::short(address, length, bytes.len() as u64));
        }

        Ok(handler(Remapped {
            address,
            requested: length,
            bytes,
        }))
    }

    /// Copies the range into an owned buffer.
    pub fn data(
        &self,
        offset: u64,
        context_address: u64,
        length: u64,
        require_full: bool,
    ) -> Result<Vec<u8>> {
        self.remap_bytes(offset, context_address, length, require_full, |r| {
            r.bytes().to_vec()
        })
    }

    /// Copies the range into `buf`, returning the number of bytes copied.
    pub fn copy_bytes(
        &self,
        offset: u64,
        context_address: u64,
        buf: &mut [u8],
        require_full: bool,
    ) -> Result<usize> {
        self.remap_bytes(offset, context_address, buf.len() as u64, require_full, |r| {
            let count = r.len();
            buf[..count].copy_from_slice(r.bytes());
            count
        })
    }

    /// Reverse-translates a slice previously handed out directly by this map.
    ///
    /// Returns `None` for bytes that were copied or do not belong to this map.
    pub fn context_address_of(&self, host: &[u8]) -> Option<u64> {
        let target = host.as_ptr() as usize;
        self.mappings.iter().find_map(|mapping| {
            let len = usize::try_from(mapping.size)
                .unwrap_or(usize::MAX)
                .min(mapping.source.len().saturating_sub(mapping.source_offset) as usize);
            let whole = mapping.source.slice(mapping.source_offset, len)?;
            let base = whole.as_ptr() as usize;
            (target >= base && target + host.len() <= base + whole.len())
                .then(|| mapping.context_address + (target - base) as u64)
        })
    }

    // -------------------------------------------------------------------------
    // Fixed-width reads
    // -------------------------------------------------------------------------

    fn read_fixed<T>(
        &self,
        offset: u64,
        context_address: u64,
        size: u64,
        decode: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<T> {
        self.remap_bytes(offset, context_address, size, true, |r| decode(r.bytes()))?
    }

    /// Reads one byte.
    pub fn read_byte(&self, offset: u64, context_address: u64) -> Result<u8> {
        self.read_fixed(offset, context_address, 1, |b| Ok(b[0]))
    }

    /// Reads a 16-bit value in the data model's byte order.
    pub fn read_word(&self, offset: u64, context_address: u64, model: &DataModel) -> Result<u16> {
        self.read_fixed(offset, context_address, 2, |b| model.read_u16(b))
    }

    /// Reads a 32-bit value in the data model's byte order.
    pub fn read_double_word(
        &self,
        offset: u64,
        context_address: u64,
        model: &DataModel,
    ) -> Result<u32> {
        self.read_fixed(offset, context_address, 4, |b| model.read_u32(b))
    }

    /// Reads a 64-bit value in the data model's byte order.
    pub fn read_quad_word(
        &self,
        offset: u64,
        context_address: u64,
        model: &DataModel,
    ) -> Result<u64> {
        self.read_fixed(offset, context_address, 8, |b| model.read_u64(b))
    }

    /// Reads a pointer-sized value.
    pub fn read_pointer(&self, offset: u64, context_address: u64, model: &DataModel) -> Result<u64> {
        let size = u64::from(model.pointer_size());
        self.read_fixed(offset, context_address, size, |b| model.read_pointer(b))
    }

    /// Reads a raw struct and converts it to host byte order.
    pub fn read_struct<T: FromBytes + SwapBytes>(
        &self,
        offset: u64,
        context_address: u64,
        model: &DataModel,
    ) -> Result<T> {
        let size = std::mem::size_of::<T>() as u64;
        self.read_fixed(offset, context_address, size, |b| model.read_struct(b))
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes.
    pub fn read_cstr(&self, offset: u64, context_address: u64, max_len: u64) -> Result<Vec<u8>> {
        self.remap_bytes(offset, context_address, max_len, false, |r| {
            let bytes = r.bytes();
            memchr::memchr(0, bytes)
                .map(|end| bytes[..end].to_vec())
                .ok_or(Error::UnterminatedString {
                    offset: bytes.len(),
                })
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn buffer(data: &[u8]) -> Arc<dyn ByteSource> {
        Arc::new(BufferSource::new(data.to_vec()))
    }

    #[test]
    fn test_bounds_rejection() {
        let mut map = MemoryMap::new();
        map.add_mapping(0x1000, 15, buffer(&[7; 15]), 0).unwrap();

        let err = map.data(0, 0x1000, 16, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bounds);
        assert!(matches!(
            err,
            Error::PartiallyMapped {
                requested: 16,
                available: 15,
                ..
            }
        ));

        let short = map.data(0, 0x1000, 16, false).unwrap();
        assert_eq!(short.len(), 15);
    }

    #[test]
    fn test_handler_not_called_on_failure() {
        let map = MemoryMap::from_bytes(vec![1, 2, 3]).unwrap();
        let mut called = false;
        let result = map.remap_bytes(0, 2, 4, true, |_| called = true);
        assert!(result.is_err());
        assert!(!called);
    }

    #[test]
    fn test_zero_length_handler_when_unmapped() {
        let map = MemoryMap::from_bytes(vec![1, 2, 3]).unwrap();
        let seen = map
            .remap_bytes(0, 0x9000, 4, false, |r| (r.len(), r.is_empty(), r.requested()))
            .unwrap();
        assert_eq!(seen, (0, true, 4));

        let err = map.data(0, 0x9000, 4, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotMapped);
    }

    #[test]
    fn test_overflow_is_distinct_from_unmapped() {
        let map = MemoryMap::from_bytes(vec![0; 64]).unwrap();
        let model = DataModel::LP64;

        let err = map.read_quad_word(8, u64::MAX - 4, &model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert!(matches!(err, Error::AddressOverflow { .. }));

        let err = map.read_quad_word(8, 0x1_0000, &model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotMapped);

        // The end of the range wrapping is also an overflow.
        let err = map.read_quad_word(0, u64::MAX - 3, &model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
    }

    #[test]
    fn test_round_trip_translation() {
        let data: Vec<u8> = (0..=255).collect();
        let mut map = MemoryMap::new();
        map.add_mapping(0x4000, 256, buffer(&data), 0).unwrap();

        for (offset, length) in [(0u64, 1u64), (0x10, 8), (0xF0, 16), (0xFF, 1)] {
            assert!(map.has_mapping(offset, 0x4000, length));
            let back = map
                .remap_bytes(offset, 0x4000, length, true, |r| {
                    assert!(r.is_direct());
                    map.context_address_of(r.bytes())
                })
                .unwrap();
            assert_eq!(back, Some(0x4000 + offset));
        }
    }

    #[test]
    fn test_adjacent_mappings_are_stitched() {
        let mut map = MemoryMap::new();
        map.add_mapping(0x100, 4, buffer(&[1, 2, 3, 4]), 0).unwrap();
        map.add_mapping(0x104, 4, buffer(&[5, 6, 7, 8]), 0).unwrap();
        map.add_mapping(0x200, 4, buffer(&[9, 9, 9, 9]), 0).unwrap();

        assert_eq!(map.data(2, 0x100, 4, true).unwrap(), vec![3, 4, 5, 6]);
        assert!(map.has_mapping(0, 0x100, 8));
        assert!(!map.has_mapping(0, 0x100, 9));

        // A gap stops the read.
        let err = map.data(0, 0x104, 8, true).unwrap_err();
        assert!(matches!(err, Error::PartiallyMapped { available: 4, .. }));
        assert_eq!(map.data(0, 0x104, 8, false).unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_overlapping_mappings_rejected() {
        let mut map = MemoryMap::new();
        map.add_mapping(0x100, 0x10, buffer(&[0; 0x10]), 0).unwrap();

        let err = map.add_mapping(0x108, 0x10, buffer(&[0; 0x10]), 0).unwrap_err();
        assert!(matches!(err, Error::OverlappingMapping { .. }));
        let err = map.add_mapping(0xF8, 0x10, buffer(&[0; 0x10]), 0).unwrap_err();
        assert!(matches!(err, Error::OverlappingMapping { .. }));
        let err = map.add_mapping(0x200, 0, buffer(&[]), 0).unwrap_err();
        assert!(matches!(err, Error::EmptyMapping { .. }));

        map.add_mapping(0x110, 0x10, buffer(&[0; 0x10]), 0).unwrap();
        assert_eq!(map.mappings().len(), 2);
    }

    #[test]
    fn test_fixed_width_reads_honour_endianness() {
        let map = MemoryMap::from_bytes(vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]).unwrap();
        assert_eq!(map.read_byte(1, 0).unwrap(), 0x22);
        assert_eq!(map.read_word(0, 0, &DataModel::LP64).unwrap(), 0x2211);
        assert_eq!(map.read_word(0, 0, &DataModel::PPC).unwrap(), 0x1122);
        assert_eq!(
            map.read_double_word(4, 0, &DataModel::LP64).unwrap(),
            0x8877_6655
        );
        assert_eq!(
            map.read_quad_word(0, 0, &DataModel::PPC64).unwrap(),
            0x1122_3344_5566_7788
        );
        assert_eq!(map.read_pointer(0, 0, &DataModel::ILP32).unwrap(), 0x4433_2211);
        assert!(map.read_double_word(6, 0, &DataModel::LP64).is_err());
    }

    #[test]
    fn test_window_readdresses_bytes() {
        let file = Arc::new(MemoryMap::from_bytes((0..32).collect()).unwrap());
        let vm = file.window(0x1_0000_0000, 0x10, 0x10).unwrap();

        assert_eq!(vm.read_byte(0, 0x1_0000_0000).unwrap(), 0x10);
        assert_eq!(vm.data(0xC, 0x1_0000_0000, 4, true).unwrap(), vec![0x1C, 0x1D, 0x1E, 0x1F]);
        assert!(vm.data(0xC, 0x1_0000_0000, 5, true).is_err());

        // Window reads stay zero-copy when the underlying source allows it.
        let direct = vm.remap_bytes(0, 0x1_0000_0000, 4, true, |r| r.is_direct()).unwrap();
        assert!(direct);

        let narrow = file.restricted(4, 4).unwrap();
        assert_eq!(narrow.read_byte(4, 0).unwrap(), 4);
        assert!(narrow.read_byte(0, 0).is_err());
    }

    #[test]
    fn test_read_cstr() {
        let map = MemoryMap::from_bytes(b"/usr/lib/libz.dylib\0junk".to_vec()).unwrap();
        assert_eq!(map.read_cstr(0, 0, 64).unwrap(), b"/usr/lib/libz.dylib");
        assert!(map.read_cstr(20, 0, 64).is_err());
    }

    #[test]
    fn test_oversized_request_across_mappings() {
        let mut map = MemoryMap::new();
        map.add_mapping(0x100, 4, buffer(&[1, 2, 3, 4]), 0).unwrap();
        map.add_mapping(0x104, 4, buffer(&[5, 6, 7, 8]), 0).unwrap();

        let err = map.data(0, 0x100, 1 << 46, true).unwrap_err();
        assert!(matches!(
            err,
            Error::PartiallyMapped {
                requested: 0x4000_0000_0000,
                available: 8,
                ..
            }
        ));
        assert_eq!(map.data(0, 0x100, 1 << 46, false).unwrap().len(), 8);
    }

    #[derive(Debug)]
    struct ThreePages;

    impl ProcessMemory for ThreePages {
        fn read_at(&self, address: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            if address >= 3 * PROCESS_PAGE_SIZE {
                return Err(std::io::Error::from_raw_os_error(5));
            }
            buf.fill(0x5A);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_oversized_process_read_stops_at_unreadable_page() {
        let mut map = MemoryMap::new();
        map.add_mapping(0, u64::MAX, Arc::new(ProcessSource::new(1, ThreePages)), 0)
            .unwrap();

        let err = map.data(0, PROCESS_PAGE_SIZE, 1 << 46, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bounds);
        assert!(matches!(
            err,
            Error::PartiallyMapped {
                available: 0x2000,
                ..
            }
        ));

        let bytes = map.data(0, PROCESS_PAGE_SIZE, 1 << 46, false).unwrap();
        assert_eq!(bytes.len() as u64, 2 * PROCESS_PAGE_SIZE);
        assert!(bytes.iter().all(|&b| b == 0x5A));

        let err = map.data(0, 4 * PROCESS_PAGE_SIZE, 1 << 46, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotMapped);
    }

    #[test]
    fn test_copy_bytes() {
        let mut map = MemoryMap::new();
        map.add_mapping(0x100, 4, buffer(&[1, 2, 3, 4]), 0).unwrap();

        let mut buf = [0xFFu8; 6];
        assert_eq!(map.copy_bytes(1, 0x100, &mut buf, false).unwrap(), 3);
        assert_eq!(buf, [2, 3, 4, 0xFF, 0xFF, 0xFF]);

        let mut buf = [0xFFu8; 6];
        let err = map.copy_bytes(1, 0x100, &mut buf, true).unwrap_err();
        assert!(matches!(
            err,
            Error::PartiallyMapped {
                requested: 6,
                available: 3,
                ..
            }
        ));
        assert_eq!(buf, [0xFF; 6]);

        let mut buf = [0u8; 2];
        assert_eq!(map.copy_bytes(0, 0x102, &mut buf, true).unwrap(), 2);
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn test_empty_range_needs_mapped_start() {
        let mut map = MemoryMap::new();
        map.add_mapping(0x100, 4, buffer(&[1, 2, 3, 4]), 0).unwrap();

        assert!(map.has_mapping(0, 0x102, 0));
        assert!(!map.has_mapping(0, 0x900, 0));
        assert!(!map.has_mapping(0, 0x104, 0));
        assert_eq!(
            map.check_mapping(0, 0x900, 0).unwrap_err().kind(),
            ErrorKind::NotMapped
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_process_map() {
        let data = Box::new([0xDEu8, 0xAD, 0xBE, 0xEF]);
        let address = data.as_ptr() as u64;
        let map = MemoryMap::for_process(std::process::id()).unwrap();
        assert_eq!(map.data(0, address, 4, true).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(map.read_byte(0, 0).unwrap_err().kind(), ErrorKind::NotMapped);
    }
}
