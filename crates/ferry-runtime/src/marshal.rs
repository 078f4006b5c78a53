use std::sync::atomic::{AtomicU64, Ordering};

use ferry_protocol::{CallbackToken, RequestId, WireValue};

use crate::registry::CallbackRegistry;
use crate::value::{Callable, Value};

static UNIQUE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-wide source of uniqueness for callback tokens and call ids.
pub(crate) fn next_unique() -> u64 {
    UNIQUE_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Rewrites a live tree into its wire form. Callables are registered under
/// the owning request and replaced by placeholder tokens; byte buffers move
/// into the wire tree unchanged. Never fails.
pub(crate) fn marshal(
    registry: &mut CallbackRegistry,
    request: RequestId,
    value: Value,
) -> WireValue {
    match value {
        Value::Callable(callable) => {
            WireValue::Callback(registry.register_callback(request, callable))
        }
        Value::Bytes(buffer) => WireValue::Bytes(buffer),
        Value::List(items) => WireValue::List(
            items
                .into_iter()
                .map(|item| marshal(registry, request, item))
                .collect(),
        ),
        Value::Map(fields) => WireValue::Map(
            fields
                .into_iter()
                .map(|(key, field)| (key, marshal(registry, request, field)))
                .collect(),
        ),
        Value::Null => WireValue::Null,
        Value::Bool(value) => WireValue::Bool(value),
        Value::Int(value) => WireValue::Int(value),
        Value::Float(value) => WireValue::Float(value),
        Value::Text(value) => WireValue::Text(value),
    }
}

pub(crate) fn marshal_args(
    registry: &mut CallbackRegistry,
    request: RequestId,
    args: Vec<Value>,
) -> Vec<WireValue> {
    args.into_iter()
        .map(|value| marshal(registry, request, value))
        .collect()
}

/// Rewrites a wire tree back into live form. Placeholders resolve to the
/// memoized proxy for `(request, token)`; `make_proxy` is consulted only on
/// first sight of a token so identity is preserved across re-receives
/// within one request.
pub(crate) fn unmarshal<F>(
    registry: &mut CallbackRegistry,
    request: RequestId,
    wire: WireValue,
    make_proxy: &F,
) -> Value
where
    F: Fn(RequestId, CallbackToken) -> Callable,
{
    match wire {
        WireValue::Callback(token) => {
            if let Some(existing) = registry.proxy(request, &token) {
                return Value::Callable(existing);
            }
            let proxy = make_proxy(request, token.clone());
            registry.insert_proxy(request, token, proxy.clone());
            Value::Callable(proxy)
        }
        WireValue::Bytes(buffer) => Value::Bytes(buffer),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| unmarshal(registry, request, item, make_proxy))
                .collect(),
        ),
        WireValue::Map(fields) => Value::Map(
            fields
                .into_iter()
                .map(|(key, field)| (key, unmarshal(registry, request, field, make_proxy)))
                .collect(),
        ),
        WireValue::Null => Value::Null,
        WireValue::Bool(value) => Value::Bool(value),
        WireValue::Int(value) => Value::Int(value),
        WireValue::Float(value) => Value::Float(value),
        WireValue::Text(value) => Value::Text(value),
    }
}

pub(crate) fn unmarshal_args<F>(
    registry: &mut CallbackRegistry,
    request: RequestId,
    args: Vec<WireValue>,
    make_proxy: &F,
) -> Vec<Value>
where
    F: Fn(RequestId, CallbackToken) -> Callable,
{
    args.into_iter()
        .map(|wire| unmarshal(registry, request, wire, make_proxy))
        .collect()
}
