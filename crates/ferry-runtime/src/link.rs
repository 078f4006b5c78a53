use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use ferry_protocol::{Message, RequestId, WireValue};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::transport::{Endpoint, MessageReceiver, WorkerHandle};
use crate::value::Value;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    RequestId::new(REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed))
}

enum CallReply {
    Result(WireValue),
    Error(String),
}

type PendingCalls = Arc<Mutex<HashMap<RequestId, oneshot::Sender<CallReply>>>>;

/// Main-side dispatcher for one worker endpoint. A router task owns the
/// inbound stream and routes by message type and id; `call` correlates its
/// terminal message through a pending-responder entry.
pub struct Link {
    channel: Arc<Channel>,
    pending_calls: PendingCalls,
    handle: Box<dyn WorkerHandle>,
    router: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    /// Wires the router and completes the startup handshake: resolves only
    /// once the worker's ready sentinel is observed. An endpoint that
    /// closes first is a handshake failure.
    pub async fn connect(endpoint: Endpoint) -> Result<Self> {
        let (sender, receiver, handle) = endpoint.into_parts();
        let channel = Channel::new(sender, "main");
        let pending_calls: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let router = crate::spawn(run_router(
            Arc::clone(&channel),
            Arc::clone(&pending_calls),
            receiver,
            ready_tx,
        ));
        let link = Self {
            channel,
            pending_calls,
            handle,
            router,
        };
        match ready_rx.await {
            Ok(()) => Ok(link),
            Err(_) => {
                link.terminate();
                Err(Error::handshake("endpoint closed before ready sentinel"))
            }
        }
    }

    /// Invokes the named worker procedure. Resolves with the unmarshaled
    /// result or the stringified remote failure; per-request registry state
    /// is dropped on either terminal.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let request = next_request_id();
        let wire_args = self.channel.marshal_args(request, args);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_calls.lock().insert(request, reply_tx);
        debug!(%request, name, "dispatching function call");
        let message = Message::Function {
            id: request,
            name: name.to_string(),
            args: wire_args,
        };
        if let Err(error) = self.channel.post(message) {
            self.pending_calls.lock().remove(&request);
            self.channel.clear_request(request);
            return Err(error);
        }
        match reply_rx.await {
            Ok(CallReply::Result(result)) => {
                let value = self.channel.unmarshal_value(request, result);
                self.channel.clear_request(request);
                Ok(value)
            }
            Ok(CallReply::Error(details)) => {
                self.channel.clear_request(request);
                Err(Error::remote(name, details))
            }
            Err(_) => Err(Error::channel_closed("function call")),
        }
    }

    /// Destroys the worker execution context behind this link, stops the
    /// router and fails every outstanding call with a closed-channel error.
    /// Later calls fail fast.
    pub fn terminate(&self) {
        self.handle.terminate();
        self.router.abort();
        // Dropping the responders settles outstanding calls.
        self.pending_calls.lock().clear();
        self.channel.close();
    }

    #[cfg(test)]
    pub(crate) fn registry_entries(&self, request: RequestId) -> usize {
        self.channel.request_entries(request)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn run_router(
    channel: Arc<Channel>,
    pending_calls: PendingCalls,
    mut receiver: MessageReceiver,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready = Some(ready_tx);
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Ready => {
                // Only the first sentinel completes the handshake.
                if let Some(ready_tx) = ready.take() {
                    let _ = ready_tx.send(());
                }
            }
            Message::Result { id, result } => {
                settle(&pending_calls, id, CallReply::Result(result));
            }
            Message::Error { id, error } => {
                settle(&pending_calls, id, CallReply::Error(error));
            }
            Message::CallbackCall {
                id,
                callback_id,
                call_id,
                args,
            } => channel.handle_callback_call(id, callback_id, call_id, args),
            Message::CallbackResult { id, result } => channel.handle_callback_result(id, result),
            Message::Function { id, .. } => {
                debug!(%id, "ignoring function message on the main side");
            }
        }
    }
    // Endpoint gone: dropping the responders fails outstanding calls.
    pending_calls.lock().clear();
    channel.close();
}

fn settle(pending_calls: &PendingCalls, id: RequestId, reply: CallReply) {
    match pending_calls.lock().remove(&id) {
        Some(reply_tx) => {
            let _ = reply_tx.send(reply);
        }
        None => debug!(%id, "ignoring message for unknown or settled request"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ferry_protocol::{Message, RequestId, WireValue};

    use super::Link;
    use crate::error::Error;
    use crate::transport::{Endpoint, endpoint_pair};
    use crate::value::{Value, callable_fn};

    async fn connect_with_fake_worker() -> (Link, Endpoint) {
        let (main_side, worker_side) = endpoint_pair();
        let (worker_sender, worker_receiver, worker_handle) = worker_side.into_parts();
        worker_sender.post(Message::Ready).expect("post ready");
        let link = Link::connect(main_side).await.expect("handshake");
        (
            link,
            Endpoint::new(worker_sender, worker_receiver, worker_handle),
        )
    }

    #[test]
    fn handshake_requires_the_ready_sentinel() {
        crate::block_on(async {
            let (main_side, worker_side) = endpoint_pair();
            drop(worker_side);
            let error = Link::connect(main_side).await.expect_err("no sentinel");
            assert!(matches!(error, Error::Handshake { .. }));
        });
    }

    #[test]
    fn call_resolves_result_and_ignores_foreign_ids() {
        crate::block_on(async {
            let (link, fake_worker) = connect_with_fake_worker().await;
            let (worker_sender, mut worker_receiver, _handle) = fake_worker.into_parts();

            let call = crate::spawn(async move { link.call("add", vec![]).await });

            let Some(Message::Function { id, name, .. }) = worker_receiver.recv().await else {
                panic!("expected function message");
            };
            assert_eq!(name, "add");

            // A terminal for a different request must not settle this call.
            worker_sender
                .post(Message::Result {
                    id: RequestId::new(id.value() + 1000),
                    result: WireValue::Int(-1),
                })
                .expect("post foreign result");
            worker_sender
                .post(Message::Result {
                    id,
                    result: WireValue::Int(30),
                })
                .expect("post result");

            let value = call.await.expect("join").expect("call");
            assert_eq!(value, Value::from(30));
        });
    }

    #[test]
    fn error_message_rejects_with_the_carried_string() {
        crate::block_on(async {
            let (link, fake_worker) = connect_with_fake_worker().await;
            let (worker_sender, mut worker_receiver, _handle) = fake_worker.into_parts();

            let call = crate::spawn(async move { link.call("boom", vec![]).await });
            let Some(Message::Function { id, .. }) = worker_receiver.recv().await else {
                panic!("expected function message");
            };
            worker_sender
                .post(Message::Error {
                    id,
                    error: "Worker error".to_string(),
                })
                .expect("post error");

            let error = call.await.expect("join").expect_err("remote failure");
            assert!(error.to_string().contains("Worker error"));
        });
    }

    #[test]
    fn callback_traffic_is_served_while_the_call_is_open() {
        crate::block_on(async {
            let (link, fake_worker) = connect_with_fake_worker().await;
            let (worker_sender, mut worker_receiver, _handle) = fake_worker.into_parts();

            let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
            let progress = callable_fn(move |args| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(args[0].as_i64().unwrap_or_default());
                    Ok(Value::Null)
                }
            });

            let call =
                crate::spawn(
                    async move { link.call("task", vec![Value::from(progress)]).await },
                );

            let Some(Message::Function { id, args, .. }) = worker_receiver.recv().await else {
                panic!("expected function message");
            };
            let WireValue::Callback(token) = &args[0] else {
                panic!("expected placeholder argument");
            };

            worker_sender
                .post(Message::CallbackCall {
                    id,
                    callback_id: token.clone(),
                    call_id: "call-test".into(),
                    args: vec![WireValue::Int(50)],
                })
                .expect("post callback call");

            let Some(Message::CallbackResult { id: call_id, .. }) = worker_receiver.recv().await
            else {
                panic!("expected callback result");
            };
            assert_eq!(call_id.as_str(), "call-test");
            assert_eq!(seen_rx.recv().await, Some(50));

            worker_sender
                .post(Message::Result {
                    id,
                    result: WireValue::Text("done".to_string()),
                })
                .expect("post result");
            let value = call.await.expect("join").expect("call");
            assert_eq!(value, Value::from("done"));
        });
    }

    #[test]
    fn same_token_received_twice_resolves_to_one_proxy() {
        crate::block_on(async {
            let (link, fake_worker) = connect_with_fake_worker().await;
            let (worker_sender, mut worker_receiver, _handle) = fake_worker.into_parts();

            let (pair_tx, mut pair_rx) = tokio::sync::mpsc::unbounded_channel();
            let checker = callable_fn(move |args| {
                let pair_tx = pair_tx.clone();
                async move {
                    let first = args[0].as_callable().expect("first").clone();
                    let second = args[1].as_callable().expect("second").clone();
                    let _ = pair_tx.send(first.same_target(&second));
                    Ok(Value::Null)
                }
            });

            let call =
                crate::spawn(async move { link.call("task", vec![Value::from(checker)]).await });

            let Some(Message::Function { id, args, .. }) = worker_receiver.recv().await else {
                panic!("expected function message");
            };
            let WireValue::Callback(checker_token) = &args[0] else {
                panic!("expected placeholder argument");
            };

            // One callback call carrying the same placeholder token twice:
            // both positions must unmarshal to the identical proxy.
            let shared_token = ferry_protocol::CallbackToken::new(format!("{id}:fake"));
            worker_sender
                .post(Message::CallbackCall {
                    id,
                    callback_id: checker_token.clone(),
                    call_id: "call-pair".into(),
                    args: vec![
                        WireValue::Callback(shared_token.clone()),
                        WireValue::Callback(shared_token),
                    ],
                })
                .expect("post callback call");

            assert_eq!(pair_rx.recv().await, Some(true));
            let Some(Message::CallbackResult { .. }) = worker_receiver.recv().await else {
                panic!("expected callback result");
            };

            worker_sender
                .post(Message::Result {
                    id,
                    result: WireValue::Null,
                })
                .expect("post result");
            call.await.expect("join").expect("call");
        });
    }

    #[test]
    fn terminal_clears_per_request_registry_state() {
        crate::block_on(async {
            let (link, fake_worker) = connect_with_fake_worker().await;
            let (worker_sender, mut worker_receiver, _handle) = fake_worker.into_parts();
            let link = std::sync::Arc::new(link);

            let callback = callable_fn(|_args| async { Ok(Value::Null) });
            let call_link = std::sync::Arc::clone(&link);
            let call = crate::spawn(async move {
                call_link.call("task", vec![Value::from(callback)]).await
            });

            let Some(Message::Function { id, .. }) = worker_receiver.recv().await else {
                panic!("expected function message");
            };
            assert_eq!(link.registry_entries(id), 1);

            worker_sender
                .post(Message::Result {
                    id,
                    result: WireValue::Null,
                })
                .expect("post result");
            call.await.expect("join").expect("call");
            assert_eq!(link.registry_entries(id), 0);
        });
    }

    #[test]
    fn router_drain_fails_outstanding_calls() {
        crate::block_on(async {
            let (link, fake_worker) = connect_with_fake_worker().await;
            let (_worker_sender, mut worker_receiver, _handle) = fake_worker.into_parts();

            let call = crate::spawn(async move { link.call("add", vec![]).await });
            let Some(Message::Function { .. }) = worker_receiver.recv().await else {
                panic!("expected function message");
            };
            drop(_worker_sender);
            drop(worker_receiver);

            let error = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .expect("settles once the channel drains")
                .expect("join")
                .expect_err("channel closed");
            assert!(matches!(error, Error::ChannelClosed { .. }));
        });
    }
}
