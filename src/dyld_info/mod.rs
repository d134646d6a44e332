//! Compressed dyld info: rebase and bind opcode streams and the export trie.
//!
//! The decoders here work on blobs already copied out of __LINKEDIT plus a
//! description of the image's segments. They never touch the node tree, which
//! keeps them testable on hand-built byte streams; the image parser turns
//! their output into nodes.
//!
//! Decoding is lenient where dyld is. A fixup that lands outside its segment
//! is kept (or dropped, per [`OutOfRangePolicy`]) with a warning attached. A
//! stream that cannot be decoded any further stops, keeping the actions
//! emitted so far and recording the error that stopped it.

pub mod bind;
pub mod export_trie;
pub mod opcodes;
pub mod rebase;

pub use bind::{BindAction, BindInfo, BindKind};
pub use export_trie::{Export, ExportKind, ExportTrie, RawTerminal};
pub use rebase::{RebaseAction, RebaseInfo};

use crate::data_model::DataModel;
use crate::error::{Error, ErrorKind, Result, Warning};
use crate::memory::MemoryMap;

/// What to do with a fixup whose location falls outside its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutOfRangePolicy {
    /// Keep the action and attach a warning to it
    #[default]
    PassThrough,
    /// Leave the action out and count it
    Drop,
}

/// A segment as seen by the fixup decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpan {
    /// Segment name
    pub name: String,
    /// Slid VM address
    pub vm_address: u64,
    /// VM size
    pub vm_size: u64,
}

/// Reads the 64-bit values threaded fixup chains are stored in.
pub trait FixupMemory {
    /// Reads the value at a slid VM address.
    fn read_u64(&self, vm_address: u64) -> Result<u64>;
}

/// [`FixupMemory`] over a VM-addressed memory map.
#[derive(Debug, Clone, Copy)]
pub struct MappedFixupMemory<'a> {
    map: &'a MemoryMap,
    model: DataModel,
}

impl<'a> MappedFixupMemory<'a> {
    /// Reads from `map` with the byte order of `model`.
    pub fn new(map: &'a MemoryMap, model: DataModel) -> Self {
        Self { map, model }
    }
}

impl FixupMemory for MappedFixupMemory<'_> {
    fn read_u64(&self, vm_address: u64) -> Result<u64> {
        self.map.read_quad_word(0, vm_address, &self.model)
    }
}

/// Everything the opcode interpreters need to know about the image.
#[derive(Clone, Copy)]
pub struct FixupContext<'a> {
    /// Segments in load-command order
    pub segments: &'a [SegmentSpan],
    /// Pointer size, the stride of plain bind and rebase opcodes
    pub pointer_size: u8,
    /// Unslid address of __TEXT, the base of authenticated rebase targets
    pub image_base: u64,
    /// Out-of-range handling
    pub policy: OutOfRangePolicy,
    /// Memory for threaded chains; threaded streams fail without it
    pub memory: Option<&'a dyn FixupMemory>,
}

impl std::fmt::Debug for FixupContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixupContext")
            .field("segments", &self.segments)
            .field("pointer_size", &self.pointer_size)
            .field("image_base", &format_args!("{:#x}", self.image_base))
            .field("policy", &self.policy)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

impl<'a> FixupContext<'a> {
    /// A context with the default policy and no memory.
    pub fn new(segments: &'a [SegmentSpan], pointer_size: u8) -> Self {
        Self {
            segments,
            pointer_size,
            image_base: 0,
            policy: OutOfRangePolicy::default(),
            memory: None,
        }
    }

    /// Locates one fixup.
    ///
    /// Returns the slid address, if the segment exists, and a warning when
    /// the location does not fit inside its segment.
    pub(crate) fn locate(&self, segment_index: u8, segment_offset: u64) -> (Option<u64>, Option<Warning>) {
        let Some(segment) = self.segments.get(segment_index as usize) else {
            let error = Error::SegmentIndexOutOfRange {
                index: segment_index,
                count: self.segments.len(),
            };
            return (None, Some(Warning::from_error("segment_index", error)));
        };

        let address = segment.vm_address.checked_add(segment_offset);
        let fits = segment_offset
            .checked_add(self.pointer_size.into())
            .map_or(false, |end| end <= segment.vm_size);
        let warning = (!fits).then(|| {
            Warning::new(
                "segment_offset",
                ErrorKind::OutOfRange,
                format!(
                    "offset {:#x} is outside {} ({:#x} bytes)",
                    segment_offset, segment.name, segment.vm_size
                ),
            )
        });
        (address, warning)
    }

    /// Returns the most repetitions a loop opcode may request in a segment.
    pub(crate) fn repeat_limit(&self, segment_index: u8) -> u64 {
        match self.segments.get(segment_index as usize) {
            Some(segment) => (segment.vm_size / u64::from(self.pointer_size.max(1))).max(1),
            None => UNKNOWN_SEGMENT_REPEAT_LIMIT,
        }
    }

    /// Decides whether an action with this warning is kept.
    #[inline]
    pub(crate) fn keeps(&self, warning: &Option<Warning>) -> bool {
        warning.is_none() || self.policy == OutOfRangePolicy::PassThrough
    }
}

/// Loop cap when the segment index names no segment.
pub const UNKNOWN_SEGMENT_REPEAT_LIMIT: u64 = 0x1_0000;

#[cfg(test)]
mod tests {
    use super::*;

    fn segments() -> Vec<SegmentSpan> {
        vec![
            SegmentSpan {
                name: "__TEXT".into(),
                vm_address: 0x1_0000_0000,
                vm_size: 0x4000,
            },
            SegmentSpan {
                name: "__DATA".into(),
                vm_address: 0x1_0000_4000,
                vm_size: 0x20,
            },
        ]
    }

    #[test]
    fn test_locate() {
        let segments = segments();
        let context = FixupContext::new(&segments, 8);

        let (address, warning) = context.locate(1, 0x18);
        assert_eq!(address, Some(0x1_0000_4018));
        assert!(warning.is_none());

        let (address, warning) = context.locate(1, 0x1C);
        assert_eq!(address, Some(0x1_0000_401C));
        assert_eq!(warning.unwrap().code, ErrorKind::OutOfRange);

        let (address, warning) = context.locate(7, 0);
        assert_eq!(address, None);
        assert_eq!(warning.unwrap().property, "segment_index");
    }

    #[test]
    fn test_repeat_limit() {
        let segments = segments();
        let context = FixupContext::new(&segments, 8);
        assert_eq!(context.repeat_limit(0), 0x800);
        assert_eq!(context.repeat_limit(1), 4);
        assert_eq!(context.repeat_limit(9), UNKNOWN_SEGMENT_REPEAT_LIMIT);
    }
}
