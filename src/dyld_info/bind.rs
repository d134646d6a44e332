//! Bind opcode interpreter, including the threaded arm64e form.
//!
//! One interpreter serves the three bind streams. They differ in two places:
//! weak binds carry no library ordinal, and in the lazy stream DONE only ends
//! one entry, so decoding continues to the end of the blob.
//!
//! In threaded mode DO_BIND does not bind anything. It appends the current
//! symbol to an ordinal table, and APPLY later walks a chain of packed 64-bit
//! values in the image's data, each of which is either a rebase or a bind
//! referring to that table by index.

use std::sync::Arc;

use super::opcodes::*;
use super::rebase::RebaseAction;
use super::FixupContext;
use crate::error::{Error, Result, Warning};
use crate::util::ByteCursor;

/// Which bind stream an action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindKind {
    /// Bound at load time
    Regular,
    /// Weak definitions coalesced at load time
    Weak,
    /// Bound on first call
    Lazy,
}

impl BindKind {
    /// Returns a display name.
    pub fn name(self) -> &'static str {
        match self {
            BindKind::Regular => "bind",
            BindKind::Weak => "weak bind",
            BindKind::Lazy => "lazy bind",
        }
    }
}

/// One pointer bound to a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAction {
    /// Stream the action came from
    pub kind: BindKind,
    /// Segment index
    pub segment_index: u8,
    /// Offset within the segment
    pub segment_offset: u64,
    /// Slid address, if the segment exists
    pub address: Option<u64>,
    /// Bind type
    pub bind_type: u8,
    /// Library ordinal; weak binds have none
    pub library_ordinal: Option<i64>,
    /// Symbol name
    pub symbol_name: String,
    /// Symbol flags
    pub symbol_flags: u8,
    /// Addend
    pub addend: i64,
    /// Problem with this action's location
    pub warning: Option<Warning>,
}

/// The decoded contents of one bind stream.
#[derive(Debug, Clone)]
pub struct BindInfo {
    /// Stream kind
    pub kind: BindKind,
    /// Actions in stream order
    pub actions: Vec<BindAction>,
    /// Rebases found while walking threaded chains
    pub threaded_rebases: Vec<RebaseAction>,
    /// Symbols the weak stream marks as strong (non-weak) definitions
    pub strong_definitions: Vec<String>,
    /// Actions left out under [`OutOfRangePolicy::Drop`](super::OutOfRangePolicy::Drop)
    pub dropped: usize,
    /// The error that stopped decoding early
    pub error: Option<Arc<Error>>,
}

/// An ordinal-table entry of a threaded stream.
#[derive(Debug, Clone)]
struct BindTarget {
    library_ordinal: i64,
    symbol_name: String,
    symbol_flags: u8,
    bind_type: u8,
    addend: i64,
}

/// Scratch state of one pass over a stream.
#[derive(Debug)]
struct BindState {
    segment_index: u8,
    segment_offset: u64,
    library_ordinal: i64,
    symbol_name: String,
    symbol_flags: u8,
    bind_type: u8,
    addend: i64,
    threaded: bool,
    ordinal_table: Vec<BindTarget>,
}

impl Default for BindState {
    fn default() -> Self {
        Self {
            segment_index: 0,
            segment_offset: 0,
            library_ordinal: 0,
            symbol_name: String::new(),
            symbol_flags: 0,
            bind_type: BIND_TYPE_POINTER,
            addend: 0,
            threaded: false,
            ordinal_table: Vec::new(),
        }
    }
}

impl BindState {
    fn target(&self) -> BindTarget {
        BindTarget {
            library_ordinal: self.library_ordinal,
            symbol_name: self.symbol_name.clone(),
            symbol_flags: self.symbol_flags,
            bind_type: self.bind_type,
            addend: self.addend,
        }
    }
}

impl BindInfo {
    /// Decodes one bind stream.
    pub fn decode(data: &[u8], kind: BindKind, context: &FixupContext<'_>) -> Self {
        let mut info = BindInfo {
            kind,
            actions: Vec::new(),
            threaded_rebases: Vec::new(),
            strong_definitions: Vec::new(),
            dropped: 0,
            error: None,
        };
        if let Err(error) = info.run(data, context) {
            tracing::debug!("{} stream stopped: {}", kind.name(), error);
            info.error = Some(Arc::new(error));
        }
        tracing::debug!(
            "decoded {} {}s, {} threaded rebases ({} dropped)",
            info.actions.len(),
            kind.name(),
            info.threaded_rebases.len(),
            info.dropped
        );
        info
    }

    /// Returns the actions binding `symbol_name`.
    pub fn actions_for<'a>(&'a self, symbol_name: &'a str) -> impl Iterator<Item = &'a BindAction> + 'a {
        self.actions
            .iter()
            .filter(move |action| action.symbol_name == symbol_name)
    }

    fn run(&mut self, data: &[u8], context: &FixupContext<'_>) -> Result<()> {
        let step = u64::from(context.pointer_size);
        let mut cursor = ByteCursor::new(data);
        let mut state = BindState::default();

        while !cursor.is_empty() {
            let position = cursor.position();
            let byte = cursor.read_u8()?;
            let immediate = byte & IMMEDIATE_MASK;

            match byte & OPCODE_MASK {
                BIND_OPCODE_DONE => {
                    if self.kind != BindKind::Lazy {
                        break;
                    }
                }
                BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => state.library_ordinal = immediate.into(),
                BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                    state.library_ordinal = cursor.read_uleb128()? as i64;
                }
                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    state.library_ordinal = if immediate == 0 {
                        0
                    } else {
                        i64::from((OPCODE_MASK | immediate) as i8)
                    };
                }
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    state.symbol_name = String::from_utf8_lossy(cursor.read_cstr()?).into_owned();
                    state.symbol_flags = immediate;
                    if self.kind == BindKind::Weak
                        && immediate & BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION != 0
                    {
                        self.strong_definitions.push(state.symbol_name.clone());
                    }
                }
                BIND_OPCODE_SET_TYPE_IMM => state.bind_type = immediate,
                BIND_OPCODE_SET_ADDEND_SLEB => state.addend = cursor.read_sleb128()?,
                BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    state.segment_index = immediate;
                    state.segment_offset = cursor.read_uleb128()?;
                }
                BIND_OPCODE_ADD_ADDR_ULEB => {
                    let delta = cursor.read_uleb128()?;
                    state.segment_offset = state.segment_offset.wrapping_add(delta);
                }
                BIND_OPCODE_DO_BIND => {
                    if state.threaded {
                        let target = state.target();
                        state.ordinal_table.push(target);
                    } else {
                        self.emit(context, &state, &state.target());
                        state.segment_offset = state.segment_offset.wrapping_add(step);
                    }
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                    let delta = cursor.read_uleb128()?;
                    self.emit(context, &state, &state.target());
                    state.segment_offset = state
                        .segment_offset
                        .wrapping_add(delta)
                        .wrapping_add(step);
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                    self.emit(context, &state, &state.target());
                    state.segment_offset = state
                        .segment_offset
                        .wrapping_add(u64::from(immediate) * step)
                        .wrapping_add(step);
                }
                BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = cursor.read_uleb128()?;
                    let skip = cursor.read_uleb128()?;
                    if count > context.repeat_limit(state.segment_index) {
                        return Err(Error::RepeatCountTooLarge {
                            count,
                            segment: state.segment_index,
                        });
                    }
                    let target = state.target();
                    for _ in 0..count {
                        self.emit(context, &state, &target);
                        state.segment_offset = state
                            .segment_offset
                            .wrapping_add(skip)
                            .wrapping_add(step);
                    }
                }
                BIND_OPCODE_THREADED => match immediate {
                    BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB => {
                        let size = cursor.read_uleb128()?;
                        state.ordinal_table.clear();
                        state
                            .ordinal_table
                            .reserve(size.min(data.len() as u64) as usize);
                        state.threaded = true;
                    }
                    BIND_SUBOPCODE_THREADED_APPLY => self.apply_chain(context, &mut state)?,
                    _ => {
                        return Err(Error::UnknownOpcode {
                            opcode: byte,
                            offset: position,
                        })
                    }
                },
                _ => {
                    return Err(Error::UnknownOpcode {
                        opcode: byte,
                        offset: position,
                    })
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, context: &FixupContext<'_>, state: &BindState, target: &BindTarget) {
        let (address, warning) = context.locate(state.segment_index, state.segment_offset);
        if !context.keeps(&warning) {
            self.dropped += 1;
            return;
        }
        self.actions.push(BindAction {
            kind: self.kind,
            segment_index: state.segment_index,
            segment_offset: state.segment_offset,
            address,
            bind_type: target.bind_type,
            library_ordinal: (self.kind != BindKind::Weak).then_some(target.library_ordinal),
            symbol_name: target.symbol_name.clone(),
            symbol_flags: target.symbol_flags,
            addend: target.addend,
            warning,
        });
    }

    /// Walks the fixup chain starting at the current location.
    fn apply_chain(&mut self, context: &FixupContext<'_>, state: &mut BindState) -> Result<()> {
        let memory = context.memory.ok_or_else(|| {
            Error::parse(state.segment_offset, "threaded fixups need the image's memory")
        })?;
        let segment = context
            .segments
            .get(state.segment_index as usize)
            .ok_or(Error::SegmentIndexOutOfRange {
                index: state.segment_index,
                count: context.segments.len(),
            })?;

        loop {
            let address = segment
                .vm_address
                .checked_add(state.segment_offset)
                .ok_or(Error::AddressOverflow {
                    address: segment.vm_address,
                    offset: state.segment_offset,
                })?;
            let value = memory.read_u64(address)?;

            if value & THREADED_BIND != 0 {
                let index = value & THREADED_ORDINAL_MASK;
                let target = state
                    .ordinal_table
                    .get(index as usize)
                    .ok_or(Error::OrdinalOutOfRange {
                        index,
                        size: state.ordinal_table.len(),
                    })?
                    .clone();
                self.emit(context, state, &target);
            } else {
                let target = if value & THREADED_AUTH != 0 {
                    (value & 0xFFFF_FFFF).wrapping_add(context.image_base)
                } else {
                    // 43-bit target; the top byte is stored at bits 43..50.
                    (value & 0x7FF_FFFF_FFFF) | ((value << 13) & 0xFF00_0000_0000_0000)
                };
                let (address, warning) = context.locate(state.segment_index, state.segment_offset);
                if context.keeps(&warning) {
                    self.threaded_rebases.push(RebaseAction {
                        segment_index: state.segment_index,
                        segment_offset: state.segment_offset,
                        address,
                        rebase_type: REBASE_TYPE_POINTER,
                        target: Some(target),
                        warning,
                    });
                } else {
                    self.dropped += 1;
                }
            }

            let delta = ((value & THREADED_NEXT_MASK) >> THREADED_NEXT_SHIFT) * 8;
            if delta == 0 {
                return Ok(());
            }
            state.segment_offset = state.segment_offset.wrapping_add(delta);
            if state.segment_offset >= segment.vm_size {
                return Err(Error::parse(
                    state.segment_offset,
                    format!("threaded chain runs past the end of {}", segment.name),
                ));
            }
        }
    }
}
