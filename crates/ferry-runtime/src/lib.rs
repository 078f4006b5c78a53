use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

mod channel;
mod error;
mod link;
mod marshal;
mod registry;
mod transport;
mod value;
mod worker;

pub use error::{Error, Result};
pub use ferry_protocol::{CallId, CallbackToken, Message, RequestId, TransferStats, WireValue};
pub use link::Link;
pub use transport::{
    Endpoint, FnWorkerBuilder, MessageReceiver, MessageSender, WorkerBuilder, WorkerHandle,
    builder_fn, endpoint_pair, message_channel, spawn_task_worker, spawn_thread_worker,
    spawn_thread_worker_named,
};
pub use value::{CallTarget, Callable, Value, callable_fn};
pub use worker::{ProcedureMap, WorkerRuntime, procedure_fn};

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        Builder::new_multi_thread()
            .enable_all()
            .thread_name("ferry-runtime")
            .build()
            .expect("failed to build shared tokio runtime")
    })
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future)
    } else {
        runtime().spawn(future)
    }
}

pub fn block_on<F: Future>(future: F) -> F::Output {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        // Callers may already sit inside a Tokio context; entering the shared
        // runtime from there would panic.
        tokio::task::block_in_place(|| handle.block_on(future))
    } else {
        runtime().block_on(future)
    }
}
