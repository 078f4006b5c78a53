mod ids;
mod message;
mod wire;

pub use ids::{CallId, CallbackToken, RequestId};
pub use message::Message;
pub use wire::{CALLBACK_MARKER, TransferStats, WireValue, transfer_stats_for};
