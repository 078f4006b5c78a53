//! Spreads chunked sums over a small worker pool and streams progress back
//! through a callback.
//!
//! ```text
//! RUST_LOG=debug cargo run --example parallel_sum
//! ```

use anyhow::Result;
use ferry_pool::{
    PoolOptions, ProcedureMap, Value, WorkerPool, builder_fn, procedure_fn, spawn_task_worker,
};
use tracing_subscriber::EnvFilter;

fn procedures() -> ProcedureMap {
    ProcedureMap::new().register(
        "sum_chunk",
        procedure_fn(|args| async move {
            let chunk = args[0].as_list().expect("chunk of numbers");
            let progress = args[1].as_callable().expect("progress callback").clone();
            let mut total = 0i64;
            for (index, value) in chunk.iter().enumerate() {
                total += value.as_i64().unwrap_or_default();
                if (index + 1) % 250 == 0 {
                    progress
                        .call(vec![Value::from((index + 1) as i64)])
                        .await?;
                }
            }
            Ok(Value::from(total))
        }),
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    ferry_runtime::block_on(async {
        let pool = WorkerPool::with_options(
            builder_fn(|| async { Ok(spawn_task_worker(procedures())) }),
            PoolOptions::new().limit(2),
        );

        let numbers: Vec<i64> = (1..=2000).collect();
        let mut calls = Vec::new();
        for chunk in numbers.chunks(500) {
            let chunk = Value::List(chunk.iter().map(|n| Value::from(*n)).collect());
            let progress = procedure_fn(|args| async move {
                tracing::info!(done = args[0].as_i64().unwrap_or_default(), "chunk progress");
                Ok(Value::Null)
            });
            calls.push(pool.execute("sum_chunk", vec![chunk, Value::from(progress)]));
        }

        let mut total = 0i64;
        for result in futures_util::future::join_all(calls).await {
            total += result?.as_i64().expect("chunk sum");
        }
        pool.wait_all().await;
        pool.close();

        println!("sum of 1..=2000 = {total}");
        anyhow::Ok(())
    })?;
    Ok(())
}
