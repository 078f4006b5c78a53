use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use ferry_protocol::{CallId, CallbackToken, Message, RequestId, WireValue};

use crate::error::{Error, Result};
use crate::marshal::{self, next_unique};
use crate::registry::CallbackRegistry;
use crate::transport::MessageSender;
use crate::value::{CallTarget, Callable, Value};

struct PendingCallbackResult {
    request: RequestId,
    sender: oneshot::Sender<WireValue>,
}

/// Everything both dispatcher sides share for one endpoint: the posting
/// half, the callback registry and the transient waiters for in-flight
/// proxy invocations. The side tag only feeds the logs.
pub(crate) struct Channel {
    side: &'static str,
    sender: MessageSender,
    closed: AtomicBool,
    registry: Mutex<CallbackRegistry>,
    pending_callback_results: Mutex<HashMap<CallId, PendingCallbackResult>>,
}

impl Channel {
    pub fn new(sender: MessageSender, side: &'static str) -> Arc<Self> {
        Arc::new(Self {
            side,
            sender,
            closed: AtomicBool::new(false),
            registry: Mutex::new(CallbackRegistry::default()),
            pending_callback_results: Mutex::new(HashMap::new()),
        })
    }

    pub fn post(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::channel_closed("post"));
        }
        let stats = message.transfer_stats();
        if stats.is_empty() {
            debug!(side = self.side, kind = message.kind(), "posting message");
        } else {
            debug!(
                side = self.side,
                kind = message.kind(),
                buffers = stats.buffers,
                bytes = stats.bytes,
                "posting message with transferables"
            );
        }
        self.sender.post(message)
    }

    pub fn marshal_value(&self, request: RequestId, value: Value) -> WireValue {
        marshal::marshal(&mut self.registry.lock(), request, value)
    }

    pub fn marshal_args(&self, request: RequestId, args: Vec<Value>) -> Vec<WireValue> {
        marshal::marshal_args(&mut self.registry.lock(), request, args)
    }

    pub fn unmarshal_value(self: &Arc<Self>, request: RequestId, wire: WireValue) -> Value {
        let make_proxy = self.proxy_factory();
        marshal::unmarshal(&mut self.registry.lock(), request, wire, &make_proxy)
    }

    pub fn unmarshal_args(self: &Arc<Self>, request: RequestId, args: Vec<WireValue>) -> Vec<Value> {
        let make_proxy = self.proxy_factory();
        marshal::unmarshal_args(&mut self.registry.lock(), request, args, &make_proxy)
    }

    fn proxy_factory(self: &Arc<Self>) -> impl Fn(RequestId, CallbackToken) -> Callable + use<> {
        let channel = Arc::downgrade(self);
        move |request, token| {
            Callable::new(Arc::new(RemoteCallback {
                channel: channel.clone(),
                request,
                token,
            }))
        }
    }

    /// Serves one `callback_call` from the other side: invokes the callable
    /// registered under `(request, callback_id)` on its own task and posts
    /// the awaited result. A failing or panicking callable is logged and no
    /// response is posted; the remote awaiter never settles.
    pub fn handle_callback_call(
        self: &Arc<Self>,
        request: RequestId,
        callback_id: CallbackToken,
        call_id: CallId,
        args: Vec<WireValue>,
    ) {
        let callable = self.registry.lock().callback(request, &callback_id);
        let Some(callable) = callable else {
            debug!(
                side = self.side,
                %request,
                callback = %callback_id,
                "ignoring callback call with no registered callable"
            );
            return;
        };
        let channel = Arc::clone(self);
        crate::spawn(async move {
            let args = channel.unmarshal_args(request, args);
            match AssertUnwindSafe(callable.call(args)).catch_unwind().await {
                Ok(Ok(value)) => {
                    let result = channel.marshal_value(request, value);
                    let reply = Message::CallbackResult {
                        id: call_id,
                        result,
                    };
                    if channel.post(reply).is_err() {
                        debug!(side = channel.side, %request, "callback result undeliverable");
                    }
                }
                Ok(Err(error)) => {
                    warn!(
                        side = channel.side,
                        %request,
                        callback = %callback_id,
                        %error,
                        "callback failed; no response posted"
                    );
                }
                Err(panic) => {
                    warn!(
                        side = channel.side,
                        %request,
                        callback = %callback_id,
                        details = %panic_details(panic),
                        "callback panicked; no response posted"
                    );
                }
            }
        });
    }

    pub fn handle_callback_result(&self, call_id: CallId, result: WireValue) {
        let pending = self.pending_callback_results.lock().remove(&call_id);
        match pending {
            Some(entry) => {
                let _ = entry.sender.send(result);
            }
            None => debug!(
                side = self.side,
                %call_id,
                "ignoring callback result with no pending call"
            ),
        }
    }

    /// Terminal transition for `request`: drops its callbacks, proxies and
    /// transient callback waiters atomically.
    pub fn clear_request(&self, request: RequestId) {
        self.registry.lock().clear(request);
        self.pending_callback_results
            .lock()
            .retain(|_, entry| entry.request != request);
    }

    /// Endpoint gone: refuse further posts and drop all per-request state.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.registry.lock().clear_all();
        self.pending_callback_results.lock().clear();
    }

    #[cfg(test)]
    pub fn request_entries(&self, request: RequestId) -> usize {
        self.registry.lock().request_entries(request)
    }
}

pub(crate) fn panic_details(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

/// Local invocable standing in for a callable owned by the other side.
/// Calling it posts a `callback_call` under the owning request and awaits
/// the matching `callback_result`.
struct RemoteCallback {
    channel: Weak<Channel>,
    request: RequestId,
    token: CallbackToken,
}

#[async_trait::async_trait]
impl CallTarget for RemoteCallback {
    async fn call(&self, args: Vec<Value>) -> Result<Value> {
        let Some(channel) = self.channel.upgrade() else {
            return Err(Error::channel_closed("callback call"));
        };
        let call_id = CallId::compose(next_unique());
        let (reply_tx, reply_rx) = oneshot::channel();
        channel.pending_callback_results.lock().insert(
            call_id.clone(),
            PendingCallbackResult {
                request: self.request,
                sender: reply_tx,
            },
        );
        let wire_args = channel.marshal_args(self.request, args);
        let message = Message::CallbackCall {
            id: self.request,
            callback_id: self.token.clone(),
            call_id: call_id.clone(),
            args: wire_args,
        };
        if let Err(error) = channel.post(message) {
            channel.pending_callback_results.lock().remove(&call_id);
            return Err(error);
        }
        match reply_rx.await {
            Ok(result) => Ok(channel.unmarshal_value(self.request, result)),
            Err(_) => Err(Error::channel_closed("callback call")),
        }
    }
}
