use std::process;

use active_object::testing::{self, Counter};
use active_object::{ActiveObject, ProcessRole, run_worker_process};

fn main() {
    if ProcessRole::current() == ProcessRole::Worker {
        if let Err(e) = run_worker_process(testing::registry()) {
            eprintln!("worker error: {e}");
            process::exit(1);
        }
        return;
    }

    active_object::init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let counter = ActiveObject::new(Counter::default())?;
    let increment = counter.method("increment");

    for _ in 0..3 {
        let value = increment.call_as::<i64>(vec![], Default::default()).await?;
        tracing::info!(?value, pid = ?counter.pid(), "Incremented in worker");
    }

    counter
        .method("log_then_get")
        .call(vec![], Default::default())
        .await?;

    let local = counter.into_inner();
    tracing::info!(count = local.count, "Controller copy after merge");
    Ok(())
}
