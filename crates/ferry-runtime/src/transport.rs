use std::future::Future;
use std::thread;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ferry_protocol::Message;

use crate::error::{Error, Result};
use crate::worker::{ProcedureMap, WorkerRuntime};

/// Clonable posting half of an endpoint.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSender {
    pub fn post(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::channel_closed("post"))
    }
}

/// Single-consumer inbound half of an endpoint. Delivery is in posted order
/// for the lifetime of the channel.
pub struct MessageReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageReceiver {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Terminates the worker execution context behind an endpoint. Idempotent.
pub trait WorkerHandle: Send + Sync {
    fn terminate(&self);
}

struct NoopWorkerHandle;

impl WorkerHandle for NoopWorkerHandle {
    fn terminate(&self) {}
}

/// One side of a message channel to a worker execution context. The core
/// never references a concrete platform; adapters below (and callers with
/// their own transports) construct these.
pub struct Endpoint {
    sender: MessageSender,
    receiver: MessageReceiver,
    handle: Box<dyn WorkerHandle>,
}

impl Endpoint {
    pub fn new(
        sender: MessageSender,
        receiver: MessageReceiver,
        handle: Box<dyn WorkerHandle>,
    ) -> Self {
        Self {
            sender,
            receiver,
            handle,
        }
    }

    pub(crate) fn into_parts(self) -> (MessageSender, MessageReceiver, Box<dyn WorkerHandle>) {
        (self.sender, self.receiver, self.handle)
    }

    fn with_handle(mut self, handle: Box<dyn WorkerHandle>) -> Self {
        self.handle = handle;
        self
    }
}

/// Raw channel halves, for adapters that pump messages to some other
/// medium.
pub fn message_channel() -> (MessageSender, MessageReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MessageSender { tx }, MessageReceiver { rx })
}

/// In-process duplex channel pair: what one side posts, the other receives.
pub fn endpoint_pair() -> (Endpoint, Endpoint) {
    let (left_tx, right_rx) = message_channel();
    let (right_tx, left_rx) = message_channel();
    let left = Endpoint::new(left_tx, left_rx, Box::new(NoopWorkerHandle));
    let right = Endpoint::new(right_tx, right_rx, Box::new(NoopWorkerHandle));
    (left, right)
}

/// Caller-supplied construction of a worker execution context, yielding the
/// main-side endpoint of its channel.
#[async_trait]
pub trait WorkerBuilder: Send + Sync {
    async fn build(&self) -> Result<Endpoint>;
}

pub struct FnWorkerBuilder<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> WorkerBuilder for FnWorkerBuilder<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Endpoint>> + Send + 'static,
{
    async fn build(&self) -> Result<Endpoint> {
        (self.f)().await
    }
}

/// Adapts an async closure to a [`WorkerBuilder`].
pub fn builder_fn<F, Fut>(f: F) -> FnWorkerBuilder<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Endpoint>> + Send + 'static,
{
    FnWorkerBuilder { f }
}

struct TaskWorkerHandle {
    join: JoinHandle<()>,
}

impl WorkerHandle for TaskWorkerHandle {
    fn terminate(&self) {
        self.join.abort();
    }
}

/// Runs the worker runtime as a task on the shared tokio runtime and returns
/// the main-side endpoint. Terminating aborts the task; its endpoint drops
/// and the main side observes the channel closing.
pub fn spawn_task_worker(procedures: ProcedureMap) -> Endpoint {
    let (main_side, worker_side) = endpoint_pair();
    let join = crate::spawn(WorkerRuntime::serve(worker_side, procedures));
    main_side.with_handle(Box::new(TaskWorkerHandle { join }))
}

struct ThreadWorkerHandle {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl WorkerHandle for ThreadWorkerHandle {
    fn terminate(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
    }
}

/// Runs the worker runtime on a dedicated named OS thread. Spawn failure is
/// a synchronous startup error. The thread drains out when terminated or
/// when the main side drops its endpoint.
pub fn spawn_thread_worker(procedures: ProcedureMap) -> Result<Endpoint> {
    spawn_thread_worker_named(procedures, "ferry-worker")
}

pub fn spawn_thread_worker_named(
    procedures: ProcedureMap,
    thread_name: impl Into<String>,
) -> Result<Endpoint> {
    let (main_side, worker_side) = endpoint_pair();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let _detached = thread::Builder::new()
        .name(thread_name.into())
        .spawn(move || {
            crate::block_on(async move {
                tokio::select! {
                    () = WorkerRuntime::serve(worker_side, procedures) => {}
                    _ = shutdown_rx => {}
                }
            });
        })
        .map_err(Error::worker_spawn)?;
    Ok(main_side.with_handle(Box::new(ThreadWorkerHandle {
        shutdown: Mutex::new(Some(shutdown_tx)),
    })))
}
