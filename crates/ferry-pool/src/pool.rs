use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;

use ferry_runtime::{Error, Link, Result, Value, WorkerBuilder};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::options::PoolOptions;

#[derive(Default)]
struct Slot {
    link: Option<Arc<Link>>,
    busy: bool,
}

struct PoolState {
    slots: Vec<Slot>,
    /// Bumped by every reset; a completion carrying a stale epoch must not
    /// touch the replacement slots.
    epoch: u64,
    ready_waiters: VecDeque<oneshot::Sender<()>>,
    ready_scan_active: bool,
}

struct PoolInner {
    builder: Arc<dyn WorkerBuilder>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    slot_freed: Notify,
}

/// Bounded pool of lazily constructed workers. Each slot owns at most one
/// worker and at most one in-flight call; calls beyond capacity suspend
/// until a slot frees.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(builder: impl WorkerBuilder + 'static) -> Self {
        Self::with_options(builder, PoolOptions::default())
    }

    pub fn with_options(builder: impl WorkerBuilder + 'static, options: PoolOptions) -> Self {
        let slots = (0..options.limit).map(|_| Slot::default()).collect();
        Self {
            inner: Arc::new(PoolInner {
                builder: Arc::new(builder),
                options,
                state: Mutex::new(PoolState {
                    slots,
                    epoch: 0,
                    ready_waiters: VecDeque::new(),
                    ready_scan_active: false,
                }),
                slot_freed: Notify::new(),
            }),
        }
    }

    /// Runs the named procedure on the first free slot, constructing that
    /// slot's worker on first use.
    pub async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let (index, epoch) = self.acquire_slot().await;
        let result = self.run_on_slot(index, epoch, name, args).await;
        self.release_slot(index, epoch);
        result
    }

    async fn acquire_slot(&self) -> (usize, u64) {
        loop {
            let mut notified = pin!(self.inner.slot_freed.notified());
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if let Some(index) = state.slots.iter().position(|slot| !slot.busy) {
                    state.slots[index].busy = true;
                    return (index, state.epoch);
                }
            }
            notified.await;
        }
    }

    async fn run_on_slot(
        &self,
        index: usize,
        epoch: u64,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let existing = {
            let state = self.inner.state.lock();
            if state.epoch != epoch {
                return Err(Error::PoolReset);
            }
            state.slots[index].link.clone()
        };
        let link = match existing {
            Some(link) => link,
            None => {
                let endpoint = self.inner.builder.build().await?;
                let link = Arc::new(Link::connect(endpoint).await?);
                let mut state = self.inner.state.lock();
                if state.epoch != epoch {
                    drop(state);
                    link.terminate();
                    return Err(Error::PoolReset);
                }
                debug!(slot = index, "worker constructed");
                state.slots[index].link = Some(Arc::clone(&link));
                link
            }
        };
        match link.call(name, args).await {
            Err(Error::ChannelClosed { .. }) if self.inner.state.lock().epoch != epoch => {
                Err(Error::PoolReset)
            }
            other => other,
        }
    }

    fn release_slot(&self, index: usize, epoch: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.epoch == epoch && index < state.slots.len() {
                state.slots[index].busy = false;
            }
        }
        self.inner.slot_freed.notify_waiters();
    }

    /// Constructs every missing worker in parallel and completes their
    /// handshakes. Idempotent on slots whose worker already exists.
    pub async fn launch_workers(&self) -> Result<()> {
        let (epoch, missing) = {
            let state = self.inner.state.lock();
            let missing: Vec<usize> = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.link.is_none())
                .map(|(index, _)| index)
                .collect();
            (state.epoch, missing)
        };
        if missing.is_empty() {
            return Ok(());
        }
        let builds = missing.iter().map(|_| async {
            let endpoint = self.inner.builder.build().await?;
            Link::connect(endpoint).await
        });
        let links = join_all(builds).await;
        let mut first_error = None;
        {
            let mut state = self.inner.state.lock();
            for (index, link) in missing.into_iter().zip(links) {
                match link {
                    Ok(link) => {
                        let link = Arc::new(link);
                        if state.epoch == epoch
                            && index < state.slots.len()
                            && state.slots[index].link.is_none()
                        {
                            state.slots[index].link = Some(link);
                        } else {
                            // Lost a race with execute, or the pool reset.
                            link.terminate();
                        }
                    }
                    Err(error) => {
                        first_error.get_or_insert(error);
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Resolves once a scan observes no in-flight call on any slot. Calls
    /// assigned while waiting extend the wait.
    pub async fn wait_all(&self) {
        loop {
            let mut notified = pin!(self.inner.slot_freed.notified());
            notified.as_mut().enable();
            if !self.inner.state.lock().slots.iter().any(|slot| slot.busy) {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once at least one slot is free. Concurrent waiters enqueue
    /// behind a single cooperative scanner and are served FIFO.
    pub async fn wait_ready(&self) {
        let waiter = {
            let mut state = self.inner.state.lock();
            let (ready_tx, ready_rx) = oneshot::channel();
            state.ready_waiters.push_back(ready_tx);
            if !state.ready_scan_active {
                state.ready_scan_active = true;
                ferry_runtime::spawn(run_ready_scanner(Arc::clone(&self.inner)));
            }
            ready_rx
        };
        let _ = waiter.await;
    }

    /// Terminates every worker and replaces the slots with `limit` empty
    /// ones. Calls still in flight fail with [`Error::PoolReset`].
    pub fn set_limit(&self, limit: usize) {
        self.reset_slots(limit);
    }

    /// Terminates every worker; the slot count is kept and every slot
    /// starts over empty.
    pub fn close(&self) {
        let limit = self.limit();
        self.reset_slots(limit);
    }

    pub fn limit(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// Slots whose worker has been constructed.
    pub fn launched_workers(&self) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.link.is_some())
            .count()
    }

    fn reset_slots(&self, limit: usize) {
        let links = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            let old = std::mem::replace(
                &mut state.slots,
                (0..limit).map(|_| Slot::default()).collect(),
            );
            old.into_iter()
                .filter_map(|slot| slot.link)
                .collect::<Vec<_>>()
        };
        for link in &links {
            link.terminate();
        }
        debug!(limit, terminated = links.len(), "pool reset");
        self.inner.slot_freed.notify_waiters();
    }
}

async fn run_ready_scanner(inner: Arc<PoolInner>) {
    loop {
        let waiter = {
            let mut state = inner.state.lock();
            match state.ready_waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    state.ready_scan_active = false;
                    return;
                }
            }
        };
        loop {
            let mut notified = pin!(inner.slot_freed.notified());
            notified.as_mut().enable();
            if inner.state.lock().slots.iter().any(|slot| !slot.busy) {
                break;
            }
            notified.await;
        }
        let _ = waiter.send(());
        let retry = inner.options.ready_poll_interval;
        if !retry.is_zero() {
            tokio::time::sleep(retry).await;
        }
    }
}
