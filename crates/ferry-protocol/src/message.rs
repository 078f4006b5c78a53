use serde::{Deserialize, Serialize};

use crate::ids::{CallId, CallbackToken, RequestId};
use crate::wire::WireValue;

/// Everything that crosses an endpoint. `ready` is the worker's startup
/// sentinel; all other variants carry the id they are subordinate to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Function {
        id: RequestId,
        name: String,
        args: Vec<WireValue>,
    },
    Result {
        id: RequestId,
        result: WireValue,
    },
    Error {
        id: RequestId,
        error: String,
    },
    CallbackCall {
        id: RequestId,
        callback_id: CallbackToken,
        call_id: CallId,
        args: Vec<WireValue>,
    },
    CallbackResult {
        id: CallId,
        result: WireValue,
    },
    Ready,
}

impl Message {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Function { .. } => "function",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::CallbackCall { .. } => "callback_call",
            Self::CallbackResult { .. } => "callback_result",
            Self::Ready => "ready",
        }
    }

    /// Owning request id, where the variant carries one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Function { id, .. }
            | Self::Result { id, .. }
            | Self::Error { id, .. }
            | Self::CallbackCall { id, .. } => Some(*id),
            Self::CallbackResult { .. } | Self::Ready => None,
        }
    }

    /// Transfer accounting over the payload this message moves.
    pub fn transfer_stats(&self) -> crate::TransferStats {
        match self {
            Self::Function { args, .. } | Self::CallbackCall { args, .. } => {
                crate::wire::transfer_stats_for(args)
            }
            Self::Result { result, .. } | Self::CallbackResult { result, .. } => {
                result.transfer_stats()
            }
            Self::Error { .. } | Self::Ready => crate::TransferStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Message;
    use crate::ids::{CallId, CallbackToken, RequestId};
    use crate::wire::WireValue;

    #[test]
    fn messages_are_type_tagged_records() {
        let message = Message::Function {
            id: RequestId::new(1),
            name: "add".to_string(),
            args: vec![WireValue::Int(10), WireValue::Int(20)],
        };
        let json = serde_json::to_value(&message).expect("serialize function");
        assert_eq!(json["type"], serde_json::json!("function"));
        assert_eq!(json["id"], serde_json::json!(1));
        assert_eq!(json["name"], serde_json::json!("add"));
    }

    #[test]
    fn callback_result_correlates_by_call_id() {
        let message = Message::CallbackResult {
            id: CallId::compose(5),
            result: WireValue::Null,
        };
        let json = serde_json::to_value(&message).expect("serialize callback_result");
        assert_eq!(json["type"], serde_json::json!("callback_result"));
        assert_eq!(json["id"], serde_json::json!("call-5"));
        assert_eq!(message.request_id(), None);
    }

    #[test]
    fn subordinate_messages_echo_their_request_id() {
        let id = RequestId::new(12);
        let subordinate = Message::CallbackCall {
            id,
            callback_id: CallbackToken::compose(id, 1),
            call_id: CallId::compose(9),
            args: Vec::new(),
        };
        assert_eq!(subordinate.request_id(), Some(id));
        assert_eq!(subordinate.kind(), "callback_call");
    }

    #[test]
    fn ready_sentinel_round_trips() {
        let json = serde_json::to_string(&Message::Ready).expect("serialize ready");
        let back: Message = serde_json::from_str(&json).expect("deserialize ready");
        assert_eq!(back, Message::Ready);
    }
}
