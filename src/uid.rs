//! In-process unique-ID composer backing the `GenerateId` RPC.
//!
//! Composes millisecond timestamp, node id, and a per-millisecond sequence
//! into an i64. Unique within a node as long as the clock does not run
//! backwards further than the sequence can absorb.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const NODE_MASK: i64 = (1 << NODE_BITS) - 1;
const SEQ_MASK: i64 = (1 << SEQ_BITS) - 1;

pub struct UidSource {
    node: i64,
    state: Mutex<(i64, i64)>, // (last_ms, seq)
}

impl UidSource {
    pub fn new(node: i64) -> Self {
        Self {
            node: node & NODE_MASK,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next(&self) -> i64 {
        self.next_with(self.node)
    }

    /// Composes an id for an explicit node, sharing this source's sequence
    /// state. Used by the `GenerateId` RPC where callers name their node.
    pub fn next_with(&self, node: i64) -> i64 {
        let node = node & NODE_MASK;
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut now = now_ms();
        if now < state.0 {
            // Clock went backwards; keep issuing against the last observed ms
            now = state.0;
        }
        if now == state.0 {
            state.1 = (state.1 + 1) & SEQ_MASK;
            if state.1 == 0 {
                // Sequence exhausted for this millisecond
                now += 1;
            }
        } else {
            state.1 = 0;
        }
        state.0 = now;
        (now << (NODE_BITS + SEQ_BITS)) | (node << SEQ_BITS) | state.1
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let source = UidSource::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = source.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn node_id_is_embedded() {
        let source = UidSource::new(42);
        let id = source.next();
        assert_eq!((id >> SEQ_BITS) & NODE_MASK, 42);
    }
}
