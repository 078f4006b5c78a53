use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::debug;

use ferry_protocol::{Message, RequestId, WireValue};

use crate::channel::{Channel, panic_details};
use crate::error::Result;
use crate::transport::Endpoint;
use crate::value::{Callable, Value, callable_fn};

/// The named procedures one worker exposes.
#[derive(Default, Clone)]
pub struct ProcedureMap {
    procedures: HashMap<String, Callable>,
}

impl ProcedureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn register(mut self, name: impl Into<String>, procedure: Callable) -> Self {
        self.procedures.insert(name.into(), procedure);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, procedure: Callable) {
        self.procedures.insert(name.into(), procedure);
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.procedures.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

/// Adapts an async closure to a worker procedure.
pub fn procedure_fn<F, Fut>(f: F) -> Callable
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    callable_fn(f)
}

/// Worker-side dispatcher: serves a procedure map over one endpoint.
pub struct WorkerRuntime;

impl WorkerRuntime {
    /// Serves until the channel closes. The ready sentinel is posted
    /// immediately after the inbound loop is wired, before any other
    /// traffic.
    pub async fn serve(endpoint: Endpoint, procedures: ProcedureMap) {
        let (sender, mut receiver, _handle) = endpoint.into_parts();
        let channel = Channel::new(sender, "worker");
        let procedures = Arc::new(procedures);
        if channel.post(Message::Ready).is_err() {
            return;
        }
        while let Some(message) = receiver.recv().await {
            match message {
                Message::Function { id, name, args } => {
                    handle_function(&channel, &procedures, id, name, args);
                }
                Message::CallbackCall {
                    id,
                    callback_id,
                    call_id,
                    args,
                } => channel.handle_callback_call(id, callback_id, call_id, args),
                Message::CallbackResult { id, result } => {
                    channel.handle_callback_result(id, result);
                }
                other => debug!(kind = other.kind(), "ignoring message on the worker side"),
            }
        }
        channel.close();
    }
}

fn handle_function(
    channel: &Arc<Channel>,
    procedures: &Arc<ProcedureMap>,
    id: RequestId,
    name: String,
    args: Vec<WireValue>,
) {
    let Some(procedure) = procedures.get(&name).cloned() else {
        // Unknown procedures are dropped without a reply; the caller owns
        // any timeout.
        debug!(%id, name, "ignoring call to unknown procedure");
        return;
    };
    let channel = Arc::clone(channel);
    crate::spawn(async move {
        let args = channel.unmarshal_args(id, args);
        let outcome = AssertUnwindSafe(procedure.call(args)).catch_unwind().await;
        let reply = match outcome {
            Ok(Ok(value)) => Message::Result {
                id,
                result: channel.marshal_value(id, value),
            },
            Ok(Err(error)) => Message::Error {
                id,
                error: error.to_string(),
            },
            Err(panic) => Message::Error {
                id,
                error: panic_details(panic),
            },
        };
        if channel.post(reply).is_err() {
            debug!(%id, "terminal message undeliverable");
        }
        channel.clear_request(id);
    });
}

#[cfg(test)]
mod tests {
    use super::{ProcedureMap, procedure_fn};
    use crate::value::Value;

    #[test]
    fn registration_is_by_name() {
        let map = ProcedureMap::new()
            .register("add", procedure_fn(|_args| async { Ok(Value::Null) }))
            .register("mul", procedure_fn(|_args| async { Ok(Value::Null) }));
        assert_eq!(map.len(), 2);
        assert!(map.get("add").is_some());
        assert!(map.get("missing").is_none());
        let mut names: Vec<_> = map.names().collect();
        names.sort_unstable();
        assert_eq!(names, ["add", "mul"]);
    }

    #[test]
    fn reregistering_a_name_replaces_the_procedure() {
        let first = procedure_fn(|_args| async { Ok(Value::from(1)) });
        let second = procedure_fn(|_args| async { Ok(Value::from(2)) });
        let mut map = ProcedureMap::new().register("answer", first);
        map.insert("answer", second.clone());
        assert_eq!(map.len(), 1);
        assert!(map.get("answer").expect("registered").same_target(&second));
    }
}
