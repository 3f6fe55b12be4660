//! Job handle generation.

use std::sync::Mutex;

use chrono::Utc;

use crate::types::JobHandle;

/// Source of globally-unique job handles.
///
/// Implementations must never return the same handle twice for the life of
/// the process.
pub trait HandleSource: Send + Sync {
    /// Produce a fresh handle.
    fn next_handle(&self) -> JobHandle;
}

/// Custom epoch (2010-11-04T01:42:54.657Z) in Unix milliseconds.
const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

/// Largest valid node identifier.
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake-style handle source.
///
/// A handle packs 41 bits of milliseconds since [`EPOCH_MS`], a 10-bit node
/// identifier and a 12-bit per-millisecond sequence. Handles from one source
/// are strictly increasing. When the sequence for a millisecond is exhausted,
/// or the wall clock steps backwards, the source keeps counting from its last
/// timestamp instead of waiting.
#[derive(Debug)]
pub struct SnowflakeSource {
    node: u16,
    state: Mutex<SnowflakeState>,
}

#[derive(Debug, Default)]
struct SnowflakeState {
    last_ms: u64,
    sequence: u64,
}

impl SnowflakeSource {
    /// Create a source for `node`, masked to 10 bits.
    pub fn new(node: u16) -> Self {
        Self {
            node: node & MAX_NODE_ID,
            state: Mutex::new(SnowflakeState::default()),
        }
    }

    /// Node identifier embedded in every handle.
    pub fn node(&self) -> u16 {
        self.node
    }

    fn next_at(&self, wall_ms: u64) -> JobHandle {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if wall_ms > state.last_ms {
            state.last_ms = wall_ms;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.last_ms += 1;
            }
        }

        let raw = (state.last_ms << (NODE_BITS + SEQUENCE_BITS))
            | (u64::from(self.node) << SEQUENCE_BITS)
            | state.sequence;
        JobHandle((raw & i64::MAX as u64) as i64)
    }
}

impl HandleSource for SnowflakeSource {
    fn next_handle(&self) -> JobHandle {
        let wall_ms = (Utc::now().timestamp_millis() - EPOCH_MS).max(0) as u64;
        self.next_at(wall_ms)
    }
}
