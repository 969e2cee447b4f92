use crate::common::get_current_time_or_zero;
use log::{info, warn};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;

const NODE_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_LEFT_SHIFT: u64 = SEQUENCE_BITS + NODE_ID_BITS;
const MAX_NODE_ID: u64 = (1 << NODE_ID_BITS) - 1;
const EPOCH: u64 = 1288834974657;

/// Snowflake-style generator for 64-bit, time-ordered document ids.
///
/// Ids combine a millisecond timestamp, a per-process node id derived from
/// a random UUID, and a per-millisecond sequence counter. The generated
/// values are unique within a process and approximately ordered by
/// creation time.
pub(crate) struct SnowflakeIdGenerator {
    node_id: u64,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    sequence: u64,
    last_timestamp: u64,
}

impl SnowflakeIdGenerator {
    pub fn new() -> Self {
        let mut node_id = derive_node_id();
        if node_id > MAX_NODE_ID {
            warn!("Node id can't be greater than {}", MAX_NODE_ID);
            node_id = OsRng.gen_range(1..=MAX_NODE_ID);
        }
        info!("Id generator initialized with node id: {}", node_id);

        SnowflakeIdGenerator {
            node_id,
            state: Mutex::new(GeneratorState {
                sequence: 0,
                last_timestamp: 0,
            }),
        }
    }

    pub fn get_id(&self) -> u64 {
        let mut state = self.state.lock();

        let mut timestamp = get_current_time_or_zero();
        if timestamp < state.last_timestamp {
            // clock moved backwards, stick with the last seen timestamp
            timestamp = state.last_timestamp;
        }

        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // sequence exhausted within this millisecond
                while timestamp <= state.last_timestamp {
                    timestamp = get_current_time_or_zero().max(state.last_timestamp + 1);
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = timestamp;

        ((timestamp - EPOCH) << TIMESTAMP_LEFT_SHIFT)
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence
    }
}

fn derive_node_id() -> u64 {
    let uuid = uuid::Uuid::new_v4();
    let uid = uuid.as_bytes();
    let rnd_byte = OsRng.gen::<u64>() & 0x000000FF;

    ((0x000000FF & uid[uid.len() - 1] as u64) | (0x0000FF00 & (rnd_byte << 8))) >> 6
}
