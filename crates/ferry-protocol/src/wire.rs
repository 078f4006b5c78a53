use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::CallbackToken;

/// Field name of the placeholder record that stands in for a callable on the
/// wire. Kept in lockstep with the serde rename on [`WireValue::Callback`].
pub const CALLBACK_MARKER: &str = "__ferry_callback__";

/// The wire form of an argument/result tree. Callables appear only as
/// placeholder tokens; everything else passes through marshaling unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    #[serde(rename = "__ferry_callback__")]
    Callback(CallbackToken),
}

impl WireValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Callback(_) => "callback",
        }
    }

    /// Depth-first transfer accounting over every byte buffer reachable in
    /// this tree. Channel transports move buffer ownership with the message;
    /// this walk is the advisory transfer list that survives the move.
    pub fn transfer_stats(&self) -> TransferStats {
        let mut stats = TransferStats::default();
        self.collect_transfer_stats(&mut stats);
        stats
    }

    fn collect_transfer_stats(&self, stats: &mut TransferStats) {
        match self {
            Self::Bytes(buffer) => stats.add(buffer.len()),
            Self::List(items) => {
                for item in items {
                    item.collect_transfer_stats(stats);
                }
            }
            Self::Map(fields) => {
                for value in fields.values() {
                    value.collect_transfer_stats(stats);
                }
            }
            _ => {}
        }
    }
}

/// Buffer count and byte total moved by one post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub buffers: usize,
    pub bytes: usize,
}

impl TransferStats {
    pub fn add(&mut self, bytes: usize) {
        self.buffers += 1;
        self.bytes += bytes;
    }

    pub fn merge(&mut self, other: TransferStats) {
        self.buffers += other.buffers;
        self.bytes += other.bytes;
    }

    pub fn is_empty(&self) -> bool {
        self.buffers == 0
    }
}

/// Transfer accounting across a whole argument list.
pub fn transfer_stats_for(values: &[WireValue]) -> TransferStats {
    let mut stats = TransferStats::default();
    for value in values {
        stats.merge(value.transfer_stats());
    }
    stats
}
