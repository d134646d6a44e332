//! Symbol table entries.
//!
//! Each nlist entry is captured as a [`RawSymbol`] and ranked into the most
//! specific [`SymbolKind`]. Problems with one entry (a string index outside
//! the string table, a section number that names no section) are reported as
//! warnings and never drop the entry.

use super::constants::*;
use super::strings::StringTable;
use super::structs::{Nlist32, Nlist64};
use crate::data_model::DataModel;
use crate::error::{Error, ErrorKind, Result, Warning};
use crate::node::{Candidate, NodeId, Registry};

/// A symbol table entry before ranking.
#[derive(Debug, Clone)]
pub struct RawSymbol {
    /// Index in the symbol table
    pub index: u32,
    /// The entry, widened to 64 bits
    pub nlist: Nlist64,
}

impl RawSymbol {
    #[inline]
    fn is_stab(&self) -> bool {
        self.nlist.n_type & N_STAB != 0
    }

    #[inline]
    fn type_bits(&self) -> u8 {
        self.nlist.n_type & N_TYPE
    }
}

/// How a stab entry's value should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabValue {
    /// An address
    Address(u64),
    /// The length of the preceding function or block
    Length(u64),
}

/// The decoded meaning of a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    /// A debugging entry
    Stab {
        /// Stab type (`n_type`)
        stab_type: u8,
        /// Meaning of `n_value`
        value: StabValue,
    },
    /// An undefined external with a size: a common symbol
    Common {
        /// Size in bytes
        size: u64,
        /// Log2 alignment
        alignment: u8,
    },
    /// An undefined symbol
    Undefined {
        /// Two-level namespace library ordinal
        library_ordinal: u8,
    },
    /// An absolute symbol
    Absolute,
    /// A symbol defined in a section
    Section {
        /// The section node, if `n_sect` names one
        section: Option<NodeId>,
    },
    /// An indirect symbol
    Indirect {
        /// String index of the symbol this one aliases
        target_strx: u64,
    },
    /// A prebound undefined symbol
    Prebound,
    /// Anything else
    Generic,
}

/// One symbol table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Index in the symbol table
    pub index: u32,
    /// Name, empty if unresolvable
    pub name: String,
    /// Raw type byte
    pub n_type: u8,
    /// Raw section number
    pub n_sect: u8,
    /// Raw description
    pub n_desc: u16,
    /// Raw value
    pub value: u64,
    /// Decoded meaning
    pub kind: SymbolKind,
}

impl Symbol {
    /// Returns true for external symbols.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    /// Returns true for private externals.
    #[inline]
    pub fn is_private_external(&self) -> bool {
        self.n_type & N_PEXT != 0
    }

    /// Returns true for weak definitions.
    #[inline]
    pub fn is_weak_definition(&self) -> bool {
        self.n_desc & N_WEAK_DEF != 0
    }
}

// =============================================================================
// Registry
// =============================================================================

fn non_stab(raw: &RawSymbol, matches: bool) -> u32 {
    if !raw.is_stab() && matches {
        10
    } else {
        0
    }
}

fn build_stab(raw: &RawSymbol) -> Result<SymbolKind> {
    let stab_type = raw.nlist.n_type;
    let value = raw.nlist.n_value;
    // The closing entry of an N_FUN pair has no name and holds the function
    // length; N_ENSYM holds the length of its N_BNSYM block.
    let is_length = (stab_type == N_FUN && raw.nlist.n_strx == 0) || stab_type == N_ENSYM;
    Ok(SymbolKind::Stab {
        stab_type,
        value: if is_length {
            StabValue::Length(value)
        } else {
            StabValue::Address(value)
        },
    })
}

/// Returns the built-in symbol registry.
pub fn default_registry() -> Registry<RawSymbol, SymbolKind> {
    let mut registry = Registry::new("symbol");
    registry
        .register(Candidate::new("generic", |_| 1, |_| Ok(SymbolKind::Generic)))
        .register(Candidate::new(
            "stab",
            |raw| if raw.is_stab() { 10 } else { 0 },
            build_stab,
        ))
        .register(Candidate::new(
            "undefined",
            |raw| non_stab(raw, raw.type_bits() == N_UNDF),
            |raw| {
                Ok(SymbolKind::Undefined {
                    library_ordinal: library_ordinal(raw.nlist.n_desc),
                })
            },
        ))
        .register(Candidate::new(
            "common",
            |raw| {
                let common = raw.type_bits() == N_UNDF
                    && raw.nlist.n_type & N_EXT != 0
                    && raw.nlist.n_value != 0;
                if raw.is_stab() || !common {
                    0
                } else {
                    20
                }
            },
            |raw| {
                Ok(SymbolKind::Common {
                    size: raw.nlist.n_value,
                    alignment: common_alignment(raw.nlist.n_desc),
                })
            },
        ))
        .register(Candidate::new(
            "absolute",
            |raw| non_stab(raw, raw.type_bits() == N_ABS),
            |_| Ok(SymbolKind::Absolute),
        ))
        .register(Candidate::new(
            "section",
            |raw| non_stab(raw, raw.type_bits() == N_SECT),
            |_| Ok(SymbolKind::Section { section: None }),
        ))
        .register(Candidate::new(
            "indirect",
            |raw| non_stab(raw, raw.type_bits() == N_INDR),
            |raw| {
                Ok(SymbolKind::Indirect {
                    target_strx: raw.nlist.n_value,
                })
            },
        ))
        .register(Candidate::new(
            "prebound",
            |raw| non_stab(raw, raw.type_bits() == N_PBUD),
            |_| Ok(SymbolKind::Prebound),
        ));
    registry
}

// =============================================================================
// Symbol Table
// =============================================================================

/// The symbol table referenced by LC_SYMTAB.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Entries in table order
    pub symbols: Vec<Symbol>,
    /// The string table node names are read from
    pub string_table: Option<NodeId>,
}

impl SymbolTable {
    /// Returns the size of one entry under `model`.
    pub fn entry_size(model: &DataModel) -> usize {
        if model.pointer_size() == 8 {
            Nlist64::SIZE
        } else {
            Nlist32::SIZE
        }
    }

    /// Decodes `count` entries from `bytes`.
    ///
    /// `sections` lists the image's section nodes in `n_sect` order. Returns the
    /// table and the warnings found while decoding it.
    pub fn decode(
        bytes: &[u8],
        count: u32,
        model: &DataModel,
        strings: Option<&StringTable>,
        sections: &[NodeId],
        registry: &Registry<RawSymbol, SymbolKind>,
    ) -> (Self, Vec<Warning>) {
        let entry_size = Self::entry_size(model);
        let mut warnings = Vec::new();
        let mut symbols = Vec::with_capacity(count as usize);

        for index in 0..count {
            let property = format!("symbols[{index}]");
            let start = index as usize * entry_size;
            let nlist = match bytes.get(start..) {
                Some(entry) if entry_size == Nlist64::SIZE => model.read_struct::<Nlist64>(entry),
                Some(entry) => model.read_struct::<Nlist32>(entry).map(Nlist64::from),
                None => Err(Error::buffer_too_small(start + entry_size, bytes.len())),
            };
            let nlist = match nlist {
                Ok(nlist) => nlist,
                Err(error) => {
                    warnings.push(Warning::from_error(property, error));
                    break;
                }
            };

            let raw = RawSymbol { index, nlist };
            let mut kind = match registry.instantiate(&raw) {
                Ok(kind) => kind,
                Err(error) => {
                    warnings.push(Warning::from_error(property, error));
                    continue;
                }
            };

            let name = match strings {
                _ if nlist.n_strx == 0 => String::new(),
                Some(table) => table.string_at(nlist.n_strx).unwrap_or_else(|error| {
                    warnings.push(Warning::from_error(format!("{property}.n_strx"), error));
                    String::new()
                }),
                None => {
                    warnings.push(Warning::new(
                        format!("{property}.n_strx"),
                        ErrorKind::NotFound,
                        "image has no string table",
                    ));
                    String::new()
                }
            };

            if let SymbolKind::Section { section } = &mut kind {
                *section = match nlist.n_sect {
                    NO_SECT => None,
                    n => sections.get(n as usize - 1).copied(),
                };
                if section.is_none() {
                    warnings.push(Warning::new(
                        format!("{property}.n_sect"),
                        ErrorKind::OutOfRange,
                        format!(
                            "section number {} outside the image's {} sections",
                            nlist.n_sect,
                            sections.len()
                        ),
                    ));
                }
            }

            symbols.push(Symbol {
                index,
                name,
                n_type: nlist.n_type,
                n_sect: nlist.n_sect,
                n_desc: nlist.n_desc,
                value: nlist.n_value,
                kind,
            });
        }

        tracing::debug!("decoded {} symbols, {} warnings", symbols.len(), warnings.len());
        (
            Self {
                symbols,
                string_table: None,
            },
            warnings,
        )
    }

    /// Returns the first symbol with this name.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn entry(n_strx: u32, n_type: u8, n_sect: u8, n_desc: u16, n_value: u64) -> Nlist64 {
        Nlist64 {
            n_strx,
            n_type,
            n_sect,
            n_desc,
            n_value,
        }
    }

    fn decode(entries: &[Nlist64], sections: &[NodeId]) -> (SymbolTable, Vec<Warning>) {
        let bytes: Vec<u8> = entries.iter().flat_map(|e| e.as_bytes().to_vec()).collect();
        let strings = StringTable::new(b"\0_main\0_printf\0_buf\0".to_vec());
        SymbolTable::decode(
            &bytes,
            entries.len() as u32,
            &DataModel::LP64,
            Some(&strings),
            sections,
            &default_registry(),
        )
    }

    #[test]
    fn test_kinds() {
        let (table, warnings) = decode(
            &[
                entry(1, N_SECT | N_EXT, 1, 0, 0x1000),
                entry(7, N_UNDF | N_EXT, 0, 0x0200, 0),
                entry(15, N_UNDF | N_EXT, 0, 0x0300, 0x40),
                entry(0, N_ABS, 0, 0, 0x1234),
            ],
            &[],
        );
        assert_eq!(table.symbols[0].name, "_main");
        assert_eq!(table.symbols[1].kind, SymbolKind::Undefined { library_ordinal: 2 });
        assert_eq!(
            table.symbols[2].kind,
            SymbolKind::Common {
                size: 0x40,
                alignment: 3
            }
        );
        assert_eq!(table.symbols[3].kind, SymbolKind::Absolute);

        // Section 1 does not exist in an image without sections.
        assert_eq!(table.symbols[0].kind, SymbolKind::Section { section: None });
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].property, "symbols[0].n_sect");
    }

    #[test]
    fn test_stab_length_quirk() {
        let (table, warnings) = decode(
            &[
                entry(0, N_BNSYM, 1, 0, 0x1000),
                entry(1, N_FUN, 1, 0, 0x1000),
                entry(0, N_FUN, 0, 0, 0x80),
                entry(0, N_ENSYM, 1, 0, 0x80),
            ],
            &[],
        );
        assert!(warnings.is_empty());
        let values: Vec<StabValue> = table
            .symbols
            .iter()
            .map(|s| match s.kind {
                SymbolKind::Stab { value, .. } => value,
                ref other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            values,
            vec![
                StabValue::Address(0x1000),
                StabValue::Address(0x1000),
                StabValue::Length(0x80),
                StabValue::Length(0x80),
            ]
        );
    }

    #[test]
    fn test_bad_string_index_is_a_warning() {
        let (table, warnings) = decode(&[entry(0x400, N_SECT, 0, 0, 0)], &[]);
        assert_eq!(table.symbols.len(), 1);
        assert_eq!(table.symbols[0].name, "");
        assert_eq!(warnings[0].property, "symbols[0].n_strx");
    }
}
