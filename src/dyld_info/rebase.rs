//! Rebase opcode interpreter.

use std::sync::Arc;

use super::opcodes::*;
use super::FixupContext;
use crate::error::{Error, Result, Warning};
use crate::util::ByteCursor;

/// One pointer that slides with the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseAction {
    /// Segment index
    pub segment_index: u8,
    /// Offset within the segment
    pub segment_offset: u64,
    /// Slid address, if the segment exists
    pub address: Option<u64>,
    /// Rebase type
    pub rebase_type: u8,
    /// Decoded target, for threaded rebases
    pub target: Option<u64>,
    /// Problem with this action's location
    pub warning: Option<Warning>,
}

/// The decoded rebase stream of an image.
#[derive(Debug, Clone, Default)]
pub struct RebaseInfo {
    /// Actions in stream order
    pub actions: Vec<RebaseAction>,
    /// Actions left out under [`OutOfRangePolicy::Drop`](super::OutOfRangePolicy::Drop)
    pub dropped: usize,
    /// The error that stopped decoding early
    pub error: Option<Arc<Error>>,
}

#[derive(Debug, Default)]
struct RebaseState {
    rebase_type: u8,
    segment_index: u8,
    segment_offset: u64,
}

impl RebaseInfo {
    /// Decodes a rebase opcode stream.
    pub fn decode(data: &[u8], context: &FixupContext<'_>) -> Self {
        let mut info = RebaseInfo::default();
        if let Err(error) = info.run(data, context) {
            tracing::debug!("rebase stream stopped: {}", error);
            info.error = Some(Arc::new(error));
        }
        tracing::debug!(
            "decoded {} rebases ({} dropped)",
            info.actions.len(),
            info.dropped
        );
        info
    }

    fn run(&mut self, data: &[u8], context: &FixupContext<'_>) -> Result<()> {
        let step = u64::from(context.pointer_size);
        let mut cursor = ByteCursor::new(data);
        let mut state = RebaseState::default();

        while !cursor.is_empty() {
            let position = cursor.position();
            let byte = cursor.read_u8()?;
            let immediate = byte & IMMEDIATE_MASK;

            match byte & OPCODE_MASK {
                REBASE_OPCODE_DONE => break,
                REBASE_OPCODE_SET_TYPE_IMM => state.rebase_type = immediate,
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    state.segment_index = immediate;
                    state.segment_offset = cursor.read_uleb128()?;
                }
                REBASE_OPCODE_ADD_ADDR_ULEB => {
                    let delta = cursor.read_uleb128()?;
                    state.segment_offset = state.segment_offset.wrapping_add(delta);
                }
                REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                    state.segment_offset = state
                        .segment_offset
                        .wrapping_add(u64::from(immediate) * step);
                }
                REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    self.repeat(context, &mut state, immediate.into(), step)?;
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                    let count = cursor.read_uleb128()?;
                    self.repeat(context, &mut state, count, step)?;
                }
                REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                    let delta = cursor.read_uleb128()?;
                    self.emit(context, &state);
                    state.segment_offset = state
                        .segment_offset
                        .wrapping_add(delta)
                        .wrapping_add(step);
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = cursor.read_uleb128()?;
                    let skip = cursor.read_uleb128()?;
                    self.repeat(context, &mut state, count, step.wrapping_add(skip))?;
                }
                opcode => {
                    return Err(Error::UnknownOpcode {
                        opcode,
                        offset: position,
                    })
                }
            }
        }
        Ok(())
    }

    fn repeat(
        &mut self,
        context: &FixupContext<'_>,
        state: &mut RebaseState,
        count: u64,
        stride: u64,
    ) -> Result<()> {
        if count > context.repeat_limit(state.segment_index) {
            return Err(Error::RepeatCountTooLarge {
                count,
                segment: state.segment_index,
            });
        }
        for _ in 0..count {
            self.emit(context, state);
            state.segment_offset = state.segment_offset.wrapping_add(stride);
        }
        Ok(())
    }

    fn emit(&mut self, context: &FixupContext<'_>, state: &RebaseState) {
        let (address, warning) = context.locate(state.segment_index, state.segment_offset);
        if !context.keeps(&warning) {
            self.dropped += 1;
            return;
        }
        self.actions.push(RebaseAction {
            segment_index: state.segment_index,
            segment_offset: state.segment_offset,
            address,
            rebase_type: state.rebase_type,
            target: None,
            warning,
        });
    }
}
