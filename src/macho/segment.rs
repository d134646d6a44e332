//! Segment and section payloads.

use super::constants::is_zerofill;
use super::structs::{Section64, SegmentCommand64};
use crate::node::NodeId;

/// A segment of a Mach-O image.
///
/// Segment nodes carry their own memory map, so anything built beneath a
/// segment is addressed by (slid) VM address.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment name
    pub name: String,
    /// Position among the image's segments, as used by bind and rebase opcodes
    pub index: u8,
    /// The segment command, widened to 64 bits
    pub command: SegmentCommand64,
    /// The load command node that declared this segment
    pub load_command: NodeId,
    /// Slid VM address
    pub vm_address: u64,
}

impl Segment {
    /// Returns the VM size.
    #[inline]
    pub fn vm_size(&self) -> u64 {
        self.command.vmsize
    }

    /// Returns the number of bytes backed by the file.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.command.filesize
    }

    /// Returns true if `vm_address` lies within the segment.
    pub fn contains(&self, vm_address: u64) -> bool {
        vm_address >= self.vm_address && vm_address - self.vm_address < self.command.vmsize
    }
}

/// A section of a segment.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Segment name recorded in the section header
    pub segment_name: String,
    /// One-based section number across the whole image, as used by `n_sect`
    pub number: u8,
    /// The section header, widened to 64 bits
    pub header: Section64,
    /// Slid VM address
    pub vm_address: u64,
}

impl Section {
    /// Returns the "segment,section" name.
    pub fn full_name(&self) -> String {
        format!("{},{}", self.segment_name, self.name)
    }

    /// Returns the size.
    #[inline]
    pub fn size(&self) -> u64 {
        self.header.size
    }

    /// Returns true for sections with no file contents.
    pub fn is_zerofill(&self) -> bool {
        is_zerofill(self.header.flags)
    }
}
