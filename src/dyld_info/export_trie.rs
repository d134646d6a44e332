//! Export trie decoder.
//!
//! A trie node is a ULEB128 terminal size, that many bytes of terminal
//! payload, a child count byte, then `(label, ULEB128 child offset)` pairs.
//! An exported name is the concatenation of the labels on the path from the
//! root to its terminal node.
//!
//! Offsets come straight from the file, so the walk is iterative and keeps a
//! visited set: a node reachable twice is a cycle (or a shared subtree, which
//! well-formed tries never contain) and stops the walk, as does exceeding one
//! visited node per byte of trie.

use std::collections::HashSet;
use std::sync::Arc;

use super::opcodes::*;
use crate::error::{Error, Result};
use crate::node::{Candidate, Registry};
use crate::util::ByteCursor;

/// A terminal payload before ranking.
#[derive(Debug, Clone)]
pub struct RawTerminal {
    /// Offset of the trie node
    pub offset: usize,
    /// Export flags
    pub flags: u64,
    /// Payload bytes following the flags
    pub payload: Vec<u8>,
}

/// What an exported symbol resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportKind {
    /// A symbol defined in this image
    Regular {
        /// Address relative to the image's __TEXT
        address: u64,
    },
    /// A symbol defined in another image
    ReExport {
        /// Library ordinal of the defining image
        ordinal: u64,
        /// Name in the defining image, when it differs
        imported_name: Option<String>,
    },
    /// A symbol called through a stub whose target a resolver decides
    StubAndResolver {
        /// Stub offset relative to __TEXT
        stub_offset: u64,
        /// Resolver offset relative to __TEXT
        resolver_offset: u64,
    },
}

/// One exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Full symbol name
    pub name: String,
    /// Export flags
    pub flags: u64,
    /// Offset of the terminal node in the trie
    pub node_offset: usize,
    /// Decoded payload
    pub kind: ExportKind,
}

impl Export {
    /// Returns true for weak definitions.
    #[inline]
    pub fn is_weak_definition(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0
    }

    /// Returns true for thread-local variables.
    #[inline]
    pub fn is_thread_local(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK == EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL
    }

    /// Returns true for absolute symbols.
    #[inline]
    pub fn is_absolute(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
    }
}

// =============================================================================
// Terminal Registry
// =============================================================================

fn flagged(raw: &RawTerminal, flag: u64) -> u32 {
    if raw.flags & flag != 0 {
        10
    } else {
        0
    }
}

/// Returns the built-in terminal registry.
pub fn default_registry() -> Registry<RawTerminal, ExportKind> {
    let mut registry = Registry::new("export terminal");
    registry
        .register(Candidate::new("regular", |_| 1, |raw: &RawTerminal| {
            let mut cursor = ByteCursor::new(&raw.payload);
            Ok(ExportKind::Regular {
                address: cursor.read_uleb128().map_err(|e| e.rebased(raw.offset))?,
            })
        }))
        .register(Candidate::new(
            "re-export",
            |raw| flagged(raw, EXPORT_SYMBOL_FLAGS_REEXPORT),
            |raw| {
                let mut cursor = ByteCursor::new(&raw.payload);
                let ordinal = cursor.read_uleb128().map_err(|e| e.rebased(raw.offset))?;
                // The imported name may be missing entirely or empty.
                let imported_name = if cursor.is_empty() {
                    None
                } else {
                    let name = cursor.read_cstr().map_err(|e| e.rebased(raw.offset))?;
                    (!name.is_empty()).then(|| String::from_utf8_lossy(name).into_owned())
                };
                Ok(ExportKind::ReExport {
                    ordinal,
                    imported_name,
                })
            },
        ))
        .register(Candidate::new(
            "stub and resolver",
            |raw| flagged(raw, EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER),
            |raw| {
                let mut cursor = ByteCursor::new(&raw.payload);
                let stub_offset = cursor.read_uleb128().map_err(|e| e.rebased(raw.offset))?;
                let resolver_offset = cursor.read_uleb128().map_err(|e| e.rebased(raw.offset))?;
                Ok(ExportKind::StubAndResolver {
                    stub_offset,
                    resolver_offset,
                })
            },
        ));
    registry
}

// =============================================================================
// Trie
// =============================================================================

/// One decoded trie node.
struct TrieNode<'a> {
    terminal: Option<RawTerminal>,
    children: Vec<(&'a [u8], usize)>,
}

/// Decodes the node at `offset`.
fn read_node(data: &[u8], offset: usize) -> Result<TrieNode<'_>> {
    let mut cursor = ByteCursor::at(data, offset);
    let terminal_size = cursor.read_uleb128()?;
    let terminal = if terminal_size == 0 {
        None
    } else {
        let terminal_size = usize::try_from(terminal_size).map_err(|_| Error::InvalidExportTrie {
            offset,
            reason: format!("terminal size {terminal_size:#x}"),
        })?;
        let mut payload = ByteCursor::new(cursor.read_bytes(terminal_size)?);
        let flags = payload.read_uleb128()?;
        let rest = payload.read_bytes(payload.remaining())?;
        Some(RawTerminal {
            offset,
            flags,
            payload: rest.to_vec(),
        })
    };

    // A terminal node at the very end of the trie may omit its child count.
    let child_count = if cursor.is_empty() { 0 } else { cursor.read_u8()? };
    let mut children = Vec::with_capacity(child_count.into());
    for _ in 0..child_count {
        let label = cursor.read_cstr()?;
        let child = cursor.read_uleb128()?;
        let child = usize::try_from(child)
            .ok()
            .filter(|&child| child < data.len())
            .ok_or_else(|| Error::InvalidExportTrie {
                offset,
                reason: format!("child offset {child:#x} outside trie of {:#x} bytes", data.len()),
            })?;
        children.push((label, child));
    }
    Ok(TrieNode { terminal, children })
}

/// The decoded export trie of an image.
#[derive(Debug, Clone, Default)]
pub struct ExportTrie {
    /// Exports in depth-first, edge order
    pub exports: Vec<Export>,
    /// The error that stopped the walk early
    pub error: Option<Arc<Error>>,
    data: Vec<u8>,
}

impl ExportTrie {
    /// Decodes every export in `data`.
    pub fn decode(data: Vec<u8>, registry: &Registry<RawTerminal, ExportKind>) -> Self {
        let mut trie = ExportTrie {
            exports: Vec::new(),
            error: None,
            data,
        };
        if let Err(error) = trie.walk(registry) {
            tracing::debug!("export trie walk stopped: {}", error);
            trie.error = Some(Arc::new(error));
        }
        tracing::debug!("decoded {} exports", trie.exports.len());
        trie
    }

    /// Returns the trie bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn walk(&mut self, registry: &Registry<RawTerminal, ExportKind>) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }
        let limit = self.data.len();
        let mut visited = HashSet::new();
        let mut stack = vec![(0usize, Vec::<u8>::new())];

        while let Some((offset, prefix)) = stack.pop() {
            if !visited.insert(offset) {
                return Err(Error::ExportTrieCycle { offset });
            }
            if visited.len() > limit {
                return Err(Error::ExportTrieLimit { limit });
            }

            let node = read_node(&self.data, offset)?;
            if let Some(terminal) = node.terminal {
                self.exports.push(Export {
                    name: String::from_utf8_lossy(&prefix).into_owned(),
                    flags: terminal.flags,
                    node_offset: offset,
                    kind: registry.instantiate(&terminal)?,
                });
            }
            for (label, child) in node.children.into_iter().rev() {
                let mut name = prefix.clone();
                name.extend_from_slice(label);
                stack.push((child, name));
            }
        }
        Ok(())
    }

    /// Looks up one symbol by walking only the matching edges.
    pub fn lookup(&self, name: &str, registry: &Registry<RawTerminal, ExportKind>) -> Result<Option<Export>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let wanted = name.as_bytes();
        let mut offset = 0usize;
        let mut matched = 0usize;

        for _ in 0..self.data.len() {
            let node = read_node(&self.data, offset)?;
            if matched == wanted.len() {
                return match node.terminal {
                    Some(terminal) => Ok(Some(Export {
                        name: name.to_string(),
                        flags: terminal.flags,
                        node_offset: offset,
                        kind: registry.instantiate(&terminal)?,
                    })),
                    None => Ok(None),
                };
            }
            let next = node
                .children
                .iter()
                .find(|(label, _)| !label.is_empty() && wanted[matched..].starts_with(label));
            match next {
                Some(&(label, child)) => {
                    matched += label.len();
                    offset = child;
                }
                None => return Ok(None),
            }
        }
        Err(Error::ExportTrieLimit {
            limit: self.data.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Root with edges "foo" -> A and "_bar" -> B; A has "_baz" -> C.
    /// B and C are terminal.
    fn sample() -> Vec<u8> {
        let mut data = vec![0x00, 0x02];
        data.extend_from_slice(b"foo\0");
        data.push(13);
        data.extend_from_slice(b"_bar\0");
        data.push(21);
        assert_eq!(data.len(), 13);

        // A
        data.extend_from_slice(&[0x00, 0x01]);
        data.extend_from_slice(b"_baz\0");
        data.push(25);
        assert_eq!(data.len(), 21);

        // B: flags 0, address 0x10
        data.extend_from_slice(&[0x02, 0x00, 0x10, 0x00]);
        // C: weak, address 0x20
        data.extend_from_slice(&[0x02, 0x04, 0x20, 0x00]);
        data
    }

    #[test]
    fn test_name_reconstruction() {
        let trie = ExportTrie::decode(sample(), &default_registry());
        assert!(trie.error.is_none());

        let names: Vec<&str> = trie.exports.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["foo_baz", "_bar"]);
        assert_eq!(trie.exports[0].kind, ExportKind::Regular { address: 0x20 });
        assert!(trie.exports[0].is_weak_definition());
        assert_eq!(trie.exports[1].kind, ExportKind::Regular { address: 0x10 });
    }

    #[test]
    fn test_lookup() {
        let trie = ExportTrie::decode(sample(), &default_registry());
        let registry = default_registry();

        let found = trie.lookup("_bar", &registry).unwrap().unwrap();
        assert_eq!(found.kind, ExportKind::Regular { address: 0x10 });
        assert_eq!(found.node_offset, 21);

        assert!(trie.lookup("foo", &registry).unwrap().is_none());
        assert!(trie.lookup("foo_bazz", &registry).unwrap().is_none());
        assert!(trie.lookup("_qux", &registry).unwrap().is_none());
    }

    #[test]
    fn test_terminal_variants() {
        // Root: "_r" -> re-export, "_s" -> stub and resolver.
        let mut data = vec![0x00, 0x02];
        data.extend_from_slice(b"_r\0");
        data.push(10);
        data.extend_from_slice(b"_s\0");
        data.push(19);
        assert_eq!(data.len(), 10);

        data.extend_from_slice(&[0x07, 0x08, 0x03]);
        data.extend_from_slice(b"_imp\0");
        data.push(0x00);
        assert_eq!(data.len(), 19);
        data.extend_from_slice(&[0x04, 0x10, 0x40, 0xC0, 0x01, 0x00]);

        let trie = ExportTrie::decode(data, &default_registry());
        assert!(trie.error.is_none());
        assert_eq!(
            trie.exports[0].kind,
            ExportKind::ReExport {
                ordinal: 3,
                imported_name: Some("_imp".into())
            }
        );
        assert_eq!(
            trie.exports[1].kind,
            ExportKind::StubAndResolver {
                stub_offset: 0x40,
                resolver_offset: 0xC0
            }
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        // Root's only child points back at the root.
        let mut data = vec![0x00, 0x01];
        data.extend_from_slice(b"a\0");
        data.push(0);
        let trie = ExportTrie::decode(data, &default_registry());
        assert!(trie.exports.is_empty());
        assert!(matches!(
            trie.error.as_deref(),
            Some(Error::ExportTrieCycle { offset: 0 })
        ));
    }

    #[test]
    fn test_child_outside_trie() {
        let mut data = vec![0x00, 0x01];
        data.extend_from_slice(b"a\0");
        data.push(0x7F);
        let trie = ExportTrie::decode(data, &default_registry());
        assert!(matches!(
            trie.error.as_deref(),
            Some(Error::InvalidExportTrie { offset: 0, .. })
        ));
    }

    #[test]
    fn test_self_loop_lookup_is_bounded() {
        let mut data = vec![0x00, 0x01];
        data.extend_from_slice(b"a\0");
        data.push(0);
        let trie = ExportTrie::decode(data, &default_registry());
        let err = trie.lookup(&"a".repeat(64), &default_registry()).unwrap_err();
        assert!(matches!(err, Error::ExportTrieLimit { .. }));
    }
}
