//! String tables and standalone C strings.

use crate::error::{Error, Result};
use crate::node::{NewNode, NodeClass, NodeId, NodeKind, NodeRange, NodeTree, Pointee};
use crate::util::{lossy_cstr, memchr_null};

/// Longest string a [`CStringNode`] will read before giving up.
pub const MAX_CSTRING_LENGTH: u64 = 0x1000;

/// The string table referenced by LC_SYMTAB.
#[derive(Debug, Clone)]
pub struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    /// Wraps the table bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns the table size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the table is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the string starting at `offset`.
    ///
    /// A string that runs off the end of the table is returned truncated.
    pub fn string_at(&self, offset: u32) -> Result<String> {
        let tail = self
            .data
            .get(offset as usize..)
            .filter(|tail| !tail.is_empty())
            .ok_or_else(|| {
                Error::parse(
                    offset.into(),
                    format!("string index {offset:#x} outside table of {:#x} bytes", self.data.len()),
                )
            })?;
        Ok(lossy_cstr(tail))
    }

    /// Returns true if the string at `offset` has its terminating NUL inside
    /// the table.
    pub fn is_terminated_at(&self, offset: u32) -> bool {
        self.data
            .get(offset as usize..)
            .map(|tail| memchr_null(tail) < tail.len())
            .unwrap_or(false)
    }
}

/// A NUL-terminated string found through a pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStringNode {
    value: String,
}

impl CStringNode {
    /// Wraps a decoded string.
    pub fn new(value: String) -> Self {
        Self { value }
    }

    /// Returns the string.
    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Pointee for CStringNode {
    const CLASS: NodeClass = NodeClass::CString;

    fn materialize(tree: &NodeTree, parent: NodeId, address: u64) -> Result<NodeId> {
        let bytes = tree
            .memory_map(parent)
            .read_cstr(0, address, MAX_CSTRING_LENGTH)?;
        let size = bytes.len() as u64 + 1;
        let value = String::from_utf8_lossy(&bytes).into_owned();
        tree.insert(
            parent,
            NewNode::new(NodeKind::CString(CStringNode::new(value)))
                .backed(NodeRange::context(address, size)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_table() {
        let table = StringTable::new(b"\0_main\0_exit".to_vec());
        assert_eq!(table.string_at(0).unwrap(), "");
        assert_eq!(table.string_at(1).unwrap(), "_main");
        assert_eq!(table.string_at(3).unwrap(), "ain");
        assert_eq!(table.string_at(7).unwrap(), "_exit");
        assert!(table.is_terminated_at(1));
        assert!(!table.is_terminated_at(7));
        assert!(table.string_at(12).is_err());
    }
}
