//! Reassembly of tool-use input streamed as JSON fragments.
//!
//! Tool use blocks arrive as:
//!   content_block_start (type=tool_use, id, name, placeholder input)
//!   content_block_delta* (input_json_delta chunks)
//!   content_block_stop
//!
//! Several blocks may be open at once; each index owns its own buffer.

use std::collections::HashMap;

use ms_protocol::{ContentBlock, ToolInput};
use tracing::{debug, warn};

use crate::error::StreamError;

/// Key used when the wire omits a block index.
pub const UNINDEXED: u32 = u32::MAX;

fn key(index: Option<u32>) -> u32 {
    index.unwrap_or(UNINDEXED)
}

struct OpenBlock {
    /// Fragment from the start event: type, id, name, placeholder input.
    initial: ContentBlock,
    /// JSON fragments in arrival order.
    buffer: String,
}

/// Open tool-use blocks for one stream session.
#[derive(Default)]
pub struct ToolUseAccumulator {
    open: HashMap<u32, OpenBlock>,
}

impl ToolUseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a block at `index`, replacing any stale block already there.
    pub fn start_block(&mut self, index: Option<u32>, initial: ContentBlock) {
        let index = key(index);
        debug!(index, block_type = initial.type_name(), "tool block opened");
        let stale = self.open.insert(
            index,
            OpenBlock {
                initial,
                buffer: String::new(),
            },
        );
        if stale.is_some() {
            warn!(index, "duplicate block start, previous buffer discarded");
        }
    }

    /// Append a JSON fragment. Unknown indices and empty fragments are ignored.
    pub fn append_json(&mut self, index: Option<u32>, partial: Option<&str>) {
        let index = key(index);
        let Some(partial) = partial.filter(|p| !p.is_empty()) else {
            return;
        };
        match self.open.get_mut(&index) {
            Some(block) => {
                block.buffer.push_str(partial);
                debug!(index, len = partial.len(), "tool input fragment");
            }
            None => warn!(index, "input fragment for a block that is not open, dropped"),
        }
    }

    pub fn is_active(&self, index: Option<u32>) -> bool {
        self.open.contains_key(&key(index))
    }

    /// Close the block at `index` and build its finished fragment.
    ///
    /// Returns `Ok(None)` when no block is open there. With no fragments
    /// appended, the placeholder input from the start event is kept;
    /// otherwise the concatenated fragments must form one JSON value.
    pub fn finish_block(&mut self, index: Option<u32>) -> Result<Option<ContentBlock>, StreamError> {
        let index = key(index);
        let Some(block) = self.open.remove(&index) else {
            return Ok(None);
        };

        if block.buffer.is_empty() {
            return Ok(Some(block.initial));
        }

        let input = ToolInput::from_json(block.buffer)
            .map_err(|source| StreamError::ToolInput { index, source })?;
        let finished = match block.initial {
            ContentBlock::ToolUse { id, name, .. } => ContentBlock::ToolUse { id, name, input },
            // Only tool_use blocks are opened here; anything else keeps its shape.
            other => other,
        };
        debug!(index, "tool block finished");
        Ok(Some(finished))
    }

    /// Number of blocks currently open.
    pub fn open_blocks(&self) -> usize {
        self.open.len()
    }

    /// Drop every open block without finishing it.
    pub fn clear(&mut self) {
        if !self.open.is_empty() {
            debug!(count = self.open.len(), "discarding unfinished tool blocks");
        }
        self.open.clear();
    }
}
