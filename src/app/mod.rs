//! Composition root: wires the connection, reply senders, adapter handler,
//! consumer and periodic jobs for one broker process.

use crate::backup::BackupJob;
use crate::broker::amqp::AmqpOpener;
use crate::broker::{
    AsyncConsumer, ConnectParams, ConnectionManager, ConnectionState, MessageSender, Opener,
    RetryPolicy, RetryingOpener, Subscription,
};
use crate::config::BrokerConfig;
use crate::dispatch::{
    AgentHandler, IndexingHandler, IndexingQueues, MessageHandler, NeuronHandler, Replies,
    SinkChain,
};
use crate::queue::PeriodicScheduler;
use crate::rest::{
    AgentGateway, HttpAgentGateway, HttpIndexingGateway, HttpNeuronGateway, IndexingGateway,
    NeuronGateway, RestClient,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which message taxonomy this process handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Adapter {
    #[strum(serialize = "neuronBroker")]
    Neuron,
    #[strum(serialize = "indexingBroker")]
    Indexing,
    #[strum(serialize = "agentBroker")]
    Agent,
}

/// REST backends an adapter may need.
#[derive(Clone, Default)]
pub struct Backends {
    pub neuron: Option<Arc<dyn NeuronGateway>>,
    pub indexing: Option<Arc<dyn IndexingGateway>>,
    pub agent: Option<Arc<dyn AgentGateway>>,
}

impl Backends {
    /// HTTP gateways for the servers `adapter` talks to.
    pub fn from_config(adapter: Adapter, config: &BrokerConfig) -> Result<Self> {
        let services = &config.services;
        let client = |label: &str, url: Option<&String>| -> Result<RestClient> {
            let url = url
                .filter(|u| !u.trim().is_empty())
                .with_context(|| format!("{adapter} requires a {label} server URL"))?;
            RestClient::new(url, services.api_key.clone())
                .with_context(|| format!("invalid {label} server URL: {url}"))
        };

        let mut backends = Self::default();
        match adapter {
            Adapter::Neuron => {
                let rest = client("persistence", services.persistence_server.as_ref())?;
                backends.neuron = Some(Arc::new(HttpNeuronGateway::new(rest)));
            }
            Adapter::Indexing => {
                let rest = client("indexing", services.indexing_server.as_ref())?;
                backends.indexing = Some(Arc::new(HttpIndexingGateway::new(rest)));
            }
            Adapter::Agent => {
                let rest = client("agent", services.agent_server.as_ref())?;
                backends.agent = Some(Arc::new(HttpAgentGateway::new(rest)));
                let rest = client("persistence", services.persistence_server.as_ref())?;
                backends.neuron = Some(Arc::new(HttpNeuronGateway::new(rest)));
            }
        }
        Ok(backends)
    }
}

/// A started broker. Dropping it without [`RunningBroker::shutdown`] leaves
/// the worker tasks running until the runtime exits.
pub struct RunningBroker {
    adapter: Adapter,
    connection: Arc<ConnectionManager>,
    consumer: AsyncConsumer,
    handler: Arc<dyn MessageHandler>,
    subscription: Subscription,
    scheduler: PeriodicScheduler,
    indexing: Option<Arc<IndexingHandler>>,
}

impl RunningBroker {
    pub fn adapter(&self) -> Adapter {
        self.adapter
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn consumer_tag(&self) -> &str {
        self.subscription.consumer_tag()
    }

    pub fn scheduled_jobs(&self) -> usize {
        self.scheduler.job_count()
    }

    /// The indexing handler, when this broker runs the indexing adapter.
    pub fn indexing(&self) -> Option<&Arc<IndexingHandler>> {
        self.indexing.as_ref()
    }

    /// Keeps the subscription alive until `shutdown` fires.
    ///
    /// When the broker ends the delivery stream the connection is reopened
    /// through its opener and the handler resubscribed. Exhausted connect
    /// retries or a failed resubscribe are fatal.
    pub async fn supervise(&mut self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = self.subscription.lost() => {}
            }
            if shutdown.is_cancelled() {
                return Ok(());
            }

            tracing::warn!(
                adapter = %self.adapter,
                consumer_tag = self.subscription.consumer_tag(),
                "Delivery stream ended, reconnecting"
            );
            if !self.resubscribe().await? {
                tracing::info!(adapter = %self.adapter, "Shutdown requested while reconnecting");
                return Ok(());
            }
        }
    }

    async fn resubscribe(&mut self) -> Result<bool> {
        let host = &self.connection.params().host;
        let state = self
            .connection
            .open()
            .await
            .with_context(|| format!("cannot reconnect to message broker at {host}"))?;
        if state == ConnectionState::Closed {
            return Ok(false);
        }

        let subscription = self
            .consumer
            .subscribe(Arc::clone(&self.handler))
            .await
            .context("cannot resubscribe after reconnect")?;
        tracing::info!(
            adapter = %self.adapter,
            consumer_tag = subscription.consumer_tag(),
            "Resubscribed after reconnect"
        );
        std::mem::replace(&mut self.subscription, subscription)
            .cancel()
            .await;
        Ok(true)
    }

    pub async fn shutdown(self) {
        tracing::info!(adapter = %self.adapter, "Shutting down broker");
        self.subscription.cancel().await;
        self.scheduler.shutdown().await;
        self.connection.close().await;
    }
}

/// Opens the connection and starts consuming.
///
/// Returns `None` when a shutdown request interrupted the connect retries.
pub async fn start(
    adapter: Adapter,
    config: &BrokerConfig,
    opener: Arc<dyn Opener>,
    backends: Backends,
) -> Result<Option<RunningBroker>> {
    config.validate()?;
    let message = &config.message;

    let connection = Arc::new(ConnectionManager::new(
        opener,
        ConnectParams {
            host: message.host.clone(),
            user: message.user.clone(),
            password: message.password.clone(),
            concurrency: message.consumer_threads,
        },
    ));
    let state = connection
        .open()
        .await
        .with_context(|| format!("cannot connect to message broker at {}", message.host))?;
    if state == ConnectionState::Closed {
        tracing::info!(adapter = %adapter, "Shutdown requested before the broker connected");
        return Ok(None);
    }

    let replies = Replies {
        success: reply_chain(&connection, message.success_exchange.as_deref(), &message.routing_key),
        error: reply_chain(&connection, message.error_exchange.as_deref(), &message.routing_key),
        forward: reply_chain(&connection, message.forward_exchange.as_deref(), &message.routing_key),
    };

    let scheduler = PeriodicScheduler::new(config.scheduler.threads);
    let mut indexing = None;
    let handler: Arc<dyn MessageHandler> = match adapter {
        Adapter::Neuron => {
            let gateway = backends
                .neuron
                .context("neuron broker needs a persistence gateway")?;
            Arc::new(NeuronHandler::new(
                gateway,
                replies,
                &config.services.system_owner,
            ))
        }
        Adapter::Indexing => {
            let gateway = backends
                .indexing
                .context("indexing broker needs an indexing gateway")?;
            let settings = &config.indexing;
            let queues = Arc::new(IndexingQueues::new(Duration::from_secs(settings.delay_secs)));
            let handler = Arc::new(IndexingHandler::new(
                queues,
                gateway,
                replies,
                settings.max_batch,
            ));
            let flusher = Arc::clone(&handler);
            scheduler.schedule_at_fixed_rate(
                "indexing-flush",
                Duration::from_secs(settings.initial_delay_secs),
                Duration::from_secs(settings.flush_interval_secs),
                move || {
                    let flusher = Arc::clone(&flusher);
                    async move {
                        flusher.flush().await;
                        Ok(())
                    }
                },
            );
            indexing = Some(Arc::clone(&handler));
            handler
        }
        Adapter::Agent => {
            let agents = backends
                .agent
                .context("agent broker needs an agent gateway")?;
            let neurons = backends
                .neuron
                .context("agent broker needs a persistence gateway")?;
            Arc::new(AgentHandler::new(agents, neurons, replies))
        }
    };

    if let Some((queue, location)) = config.backup.enabled() {
        let retries = u32::try_from(message.connect_retries.max(1)).unwrap_or(1);
        let job = Arc::new(BackupJob::new(Arc::clone(&connection), queue, location, retries));
        let interval = config.backup.interval();
        scheduler.schedule_at_fixed_rate("backup", interval, interval, move || {
            let job = Arc::clone(&job);
            async move { job.run().await.map(|_| ()) }
        });
    }

    let consumer = AsyncConsumer::new(
        Arc::clone(&connection),
        message.consumer_threads,
        message.auto_ack,
    );
    consumer.connect(&message.receive_queue);
    let subscription = match consumer.subscribe(Arc::clone(&handler)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            scheduler.shutdown().await;
            connection.close().await;
            return Err(e).with_context(|| {
                format!("cannot consume from queue {}", message.receive_queue)
            });
        }
    };

    tracing::info!(
        adapter = %adapter,
        queue = message.receive_queue.as_str(),
        workers = consumer.worker_count(),
        jobs = scheduler.job_count(),
        "Broker started"
    );
    Ok(Some(RunningBroker {
        adapter,
        connection,
        consumer,
        handler,
        subscription,
        scheduler,
        indexing,
    }))
}

fn reply_chain(
    connection: &Arc<ConnectionManager>,
    exchange: Option<&str>,
    routing_key: &str,
) -> SinkChain {
    let Some(exchange) = exchange.filter(|e| !e.trim().is_empty()) else {
        return SinkChain::new();
    };
    let sender = MessageSender::new(Arc::clone(connection));
    sender.connect(exchange, routing_key);
    SinkChain::new().then(Arc::new(sender))
}

/// Runs `adapter` against the configured AMQP broker and REST servers until
/// ctrl-c.
pub async fn run(adapter: Adapter, config: BrokerConfig) -> Result<()> {
    config.validate()?;
    let backends = Backends::from_config(adapter, &config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
        }
        signal.cancel();
    });

    let opener = RetryingOpener::new(
        AmqpOpener::new(),
        RetryPolicy::new(config.message.connect_retries, config.retry_pause()),
        shutdown.clone(),
    );
    let Some(mut broker) = start(adapter, &config, Arc::new(opener), backends).await? else {
        return Ok(());
    };

    let outcome = broker.supervise(&shutdown).await;
    broker.shutdown().await;
    outcome
}
