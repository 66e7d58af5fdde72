//! Application root
//!
//! Owns the process-wide components and wires them together: store actor,
//! broker, queue manager, slot scheduler, adapters, validation
//! coordinator, engine, dispatcher, sweeper, and the HTTP ingress.

use std::sync::Arc;

use eyre::{Context, Result};
use tracing::{debug, info};

use crate::adapters::{
    AdapterSet, AnalyzeAdapter, BoardApi, CodeHost, DebugAdapter, FinalizePrAdapter, GitCliHost,
    HttpBoardClient, ImplementAdapter, MergeAdapter, PrepareAdapter, QaAdapter, TestAdapter,
};
use crate::broker::{Broker, VALIDATIONS, WEBHOOKS};
use crate::config::Config;
use crate::ingress::{self, IngressService};
use crate::llm::{self, LlmClient};
use crate::queue::QueueManager;
use crate::reactivation::ReactivationAnalyzer;
use crate::state::{self, StateManager};
use crate::validation::{ReplyInterpreter, ValidationCoordinator};
use crate::workflow::{RunEngine, RunScheduler, spawn_dispatcher};

/// External collaborators, injectable for tests
pub struct Collaborators {
    pub board: Arc<dyn BoardApi>,
    pub codehost: Arc<dyn CodeHost>,
    pub llm: Option<Arc<dyn LlmClient>>,
}

/// The running orchestrator
pub struct Orchestrator {
    pub state: StateManager,
    pub broker: Arc<Broker>,
    pub queue: Arc<QueueManager>,
    pub slots: Arc<RunScheduler>,
    pub engine: Arc<RunEngine>,
    pub ingress: Arc<IngressService>,
    config: Config,
}

impl Orchestrator {
    /// Start against the real collaborators from configuration
    pub async fn start(config: Config) -> Result<Self> {
        let state = StateManager::spawn(&config.storage.store_dir).context("Failed to open store")?;

        let board: Arc<dyn BoardApi> =
            Arc::new(HttpBoardClient::from_config(&config.board).context("Board client unavailable")?);
        let codehost: Arc<dyn CodeHost> =
            Arc::new(GitCliHost::from_config(&config.codehost).context("Code host client unavailable")?);
        let llm = llm::create_client(&config.llm);

        Self::start_with(config, state, Collaborators { board, codehost, llm }).await
    }

    /// Start with injected collaborators
    pub async fn start_with(config: Config, state: StateManager, collaborators: Collaborators) -> Result<Self> {
        let Collaborators { board, codehost, llm } = collaborators;

        let broker = Broker::new();
        let slots = RunScheduler::new(config.orchestrator.max_concurrent_runs);
        let queue = QueueManager::new(state.clone(), broker.clone(), config.orchestrator.clone());

        let adapters = Arc::new(
            AdapterSet::new()
                .register(Arc::new(PrepareAdapter::new(
                    codehost.clone(),
                    config.codehost.workdir_base.clone(),
                    config.codehost.branch_prefix.clone(),
                )))
                .register(Arc::new(AnalyzeAdapter::new(llm.clone())))
                .register(Arc::new(ImplementAdapter::new(llm.clone(), codehost.clone())))
                .register(Arc::new(TestAdapter::new(config.commands.test_command.clone())))
                .register(Arc::new(DebugAdapter::new(llm.clone())))
                .register(Arc::new(QaAdapter::new(config.commands.qa_command.clone())))
                .register(Arc::new(FinalizePrAdapter::new(codehost.clone())))
                .register(Arc::new(MergeAdapter::new(codehost))),
        );

        let interpreter = ReplyInterpreter::new(llm.clone());
        let coordinator = Arc::new(ValidationCoordinator::new(
            state.clone(),
            board.clone(),
            interpreter,
            config.orchestrator.clone(),
        ));

        let engine = RunEngine::new(
            state.clone(),
            queue.clone(),
            adapters,
            coordinator,
            board.clone(),
            slots.clone(),
            config.clone(),
        );

        let analyzer = ReactivationAnalyzer::new(config.orchestrator.reactivation_confidence_threshold, llm);
        let ingress = IngressService::new(
            state.clone(),
            queue.clone(),
            broker.clone(),
            analyzer,
            config.clone(),
        );

        // Durable state is the source of truth: reconcile it before any
        // new work is admitted
        state::recover(&state).await?;
        queue.recover().await;

        spawn_dispatcher(engine.clone(), broker.clone());
        queue.spawn_sweeper();
        spawn_audit_drain(broker.clone());
        spawn_retention(state.clone(), config.orchestrator.webhook_retention_months);

        info!(
            max_concurrent_runs = config.orchestrator.max_concurrent_runs,
            "Orchestrator started"
        );

        Ok(Self {
            state,
            broker,
            queue,
            slots,
            engine,
            ingress,
            config,
        })
    }

    /// Run the HTTP ingress until the process stops
    pub async fn serve(self) -> Result<()> {
        let http = Arc::new(ingress::HttpState {
            service: self.ingress.clone(),
            state: self.state.clone(),
            broker: self.broker.clone(),
            slots: self.slots.clone(),
        });
        ingress::serve(http, &self.config.server.bind).await
    }
}

/// Drain the audit queues so their depth reflects unprocessed backlog
fn spawn_audit_drain(broker: Arc<Broker>) {
    for queue_name in [WEBHOOKS, VALIDATIONS] {
        let broker = broker.clone();
        tokio::spawn(async move {
            loop {
                let message = broker.consume(queue_name).await;
                debug!(queue = queue_name, message_id = %message.id, body = %message.body, "Audit event");
            }
        });
    }
}

/// Periodically drop webhook partitions past the retention window
fn spawn_retention(state: StateManager, retention_months: u32) {
    tokio::spawn(async move {
        let month_ms: i64 = 31 * 24 * 3600 * 1000;
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(24 * 3600)).await;
            let cutoff = boardstore::now_ms() - retention_months as i64 * month_ms;
            match state.drop_webhook_partitions_before(cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Webhook retention pass dropped old partitions"),
                Err(e) => tracing::warn!(error = %e, "Webhook retention pass failed"),
            }
        }
    });
}
