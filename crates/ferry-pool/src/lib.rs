mod options;
mod pool;

pub use options::PoolOptions;
pub use pool::WorkerPool;

pub use ferry_runtime::{
    Callable, Error, ProcedureMap, Result, Value, WorkerBuilder, builder_fn, callable_fn,
    procedure_fn, spawn_task_worker, spawn_thread_worker, spawn_thread_worker_named,
};
