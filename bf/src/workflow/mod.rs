//! Stage scheduler
//!
//! The stage graph, the global run slot cap, the run engine, and the
//! dispatcher that consumes workflow messages from the broker.

pub mod graph;

mod engine;
mod slots;

pub use engine::RunEngine;
pub use graph::{GraphLimits, Next};
pub use slots::{RunScheduler, RunSlot, SlotStats};

use std::sync::Arc;

use tracing::{error, warn};

use crate::broker::{Broker, WORKFLOWS};
use crate::queue::DispatchMessage;

/// Consume workflow dispatches and execute each run in its own task
///
/// Concurrency is bounded inside the engine by the run scheduler's slots;
/// the dispatcher itself never blocks on a run.
pub fn spawn_dispatcher(engine: Arc<RunEngine>, broker: Arc<Broker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = broker.consume(WORKFLOWS).await;
            let dispatch: DispatchMessage = match serde_json::from_value(message.body.clone()) {
                Ok(dispatch) => dispatch,
                Err(e) => {
                    warn!(error = %e, "Malformed workflow dispatch, dead-lettering");
                    broker.nack(WORKFLOWS, message).await;
                    continue;
                }
            };

            let engine = engine.clone();
            let broker = broker.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.execute(dispatch).await {
                    error!(error = %e, "Workflow execution failed");
                    broker.nack(WORKFLOWS, message).await;
                }
            });
        }
    })
}
