//! Background services: orchestrator consumer, simulated executors and the
//! reconciliation loop.

use std::sync::Arc;

use messaging::{
    DeadLetterSink, EventConsumer, EventProducer, MessagePublisher, MessageSource, TopicMap,
};
use saga::{
    CommandResponder, Orchestrator, Reconciler, SagaEventHandler, SimulatedExecutor, booking,
};
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::Config;

/// Running background tasks of one worker process.
pub struct Services {
    tasks: JoinSet<()>,
    executor: Option<SimulatedExecutor>,
}

impl Services {
    /// The in-process executor, when step commands are simulated.
    pub fn simulated_executor(&self) -> Option<&SimulatedExecutor> {
        self.executor.as_ref()
    }

    /// Waits for every task to stop after shutdown was signalled.
    pub async fn join(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "background task panicked");
            }
        }
    }
}

/// Wires the booking sagas onto `store` and the broker and spawns the
/// consumers and the reconciler. Everything stops once `shutdown` flips to
/// true.
pub fn spawn_services<St, Src, P>(
    config: &Config,
    store: St,
    source: Arc<Src>,
    publisher: P,
    shutdown: &watch::Receiver<bool>,
) -> saga::Result<Services>
where
    St: SagaStore + 'static,
    Src: MessageSource + 'static,
    P: MessagePublisher + 'static,
{
    let publisher = Arc::new(publisher);
    let topics = TopicMap::new(config.topic_prefix.as_str());
    let registry = Arc::new(booking::registry()?);
    let triggers = booking::trigger_bindings();
    let dead_letters = DeadLetterSink::new(publisher.clone());

    let orchestrator = Arc::new(Orchestrator::with_config(
        store,
        EventProducer::new(Arc::clone(&publisher), topics.clone()),
        Arc::clone(&registry),
        config.orchestrator_config(),
    ));

    let mut tasks = JoinSet::new();

    let orchestrator_topics = topics.topics_for(booking::orchestrator_event_types(&triggers));
    let consumer = EventConsumer::new(
        Arc::clone(&source),
        Arc::new(SagaEventHandler::new(Arc::clone(&orchestrator), triggers)),
        dead_letters.clone(),
        config.consumer_config(orchestrator_topics),
    );
    let rx = shutdown.clone();
    tasks.spawn(async move {
        if let Err(err) = consumer.run(rx).await {
            tracing::error!(error = %err, "orchestrator consumer failed");
        }
    });

    let executor = if config.simulate_executors() {
        let executor = SimulatedExecutor::new();
        let command_types = registry.command_types();
        let command_topics = topics.topics_for(command_types.iter().map(String::as_str));
        let responder = EventConsumer::new(
            source,
            Arc::new(CommandResponder::new(
                executor.clone(),
                EventProducer::new(Arc::clone(&publisher), topics),
            )),
            dead_letters,
            config.consumer_config(command_topics),
        );
        let rx = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = responder.run(rx).await {
                tracing::error!(error = %err, "simulated executor consumer failed");
            }
        });
        tracing::info!(commands = command_types.len(), "simulating step executors in-process");
        Some(executor)
    } else {
        None
    };

    let reconciler = Reconciler::new(orchestrator, config.reconciler_config());
    tasks.spawn(reconciler.run(config.reconcile_interval, shutdown.clone()));

    Ok(Services { tasks, executor })
}
