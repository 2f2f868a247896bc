//! Queue worker pool
//!
//! Drains a shared `CommandQueue` with up to `pool_size` dispatches in flight.
//! Dispatches are blocking (subprocesses, file writes, HTTP) and run on the
//! blocking pool. Commands on the same target are chained: each waits for the
//! previous command on its target to finish, so they never overlap and run in
//! dequeue order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::queue::CommandQueue;

/// Run every queued command and return the outcomes in completion order.
pub async fn run_pool(
    queue: Arc<Mutex<CommandQueue>>,
    dispatcher: Arc<Dispatcher>,
    pool_size: usize,
    workflow_id: Option<Uuid>,
) -> Vec<DispatchOutcome> {
    let permits = Arc::new(Semaphore::new(pool_size.max(1)));
    let mut tails: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
    let mut tasks = JoinSet::new();

    info!(pool_size, "Worker pool started");

    loop {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let command = {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.next()
        };
        let Some(command) = command else {
            break;
        };

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = tails.insert(command.target().to_string(), done_rx);
        let dispatcher = dispatcher.clone();

        tasks.spawn(async move {
            if let Some(previous) = previous {
                debug!(command_id = %command.id(), command_target = command.target(), "Waiting for earlier command on target");
                // A dropped sender means the earlier task ended; either way it is done
                let _ = previous.await;
            }

            let ctx = match workflow_id {
                Some(id) => RequestContext::for_workflow(id),
                None => RequestContext::new(),
            };
            let result = tokio::task::spawn_blocking(move || dispatcher.dispatch(&command, &ctx)).await;

            let _ = done_tx.send(());
            drop(permit);
            result
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(e)) | Err(e) => error!(error = %e, "Dispatch task failed"),
        }
    }

    info!(
        processed = outcomes.len(),
        failed = outcomes.iter().filter(|o| !o.success()).count(),
        "Worker pool finished"
    );
    outcomes
}
