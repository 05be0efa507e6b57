use crate::app::Adapter;
use crate::config::BrokerConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// `neuronbroker` - bridges the message queue and the neuron, indexing and
/// agent REST services.
#[derive(Parser, Debug)]
#[command(name = "neuronbroker")]
#[command(author = "theonlyhennygod")]
#[command(version = "0.1.0")]
#[command(about = "Message broker for neuron ownership, indexing and agent events.", long_about = None)]
pub struct Cli {
    /// TOML config file (defaults to ~/.neuronbroker/config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Neuron edits and ownership requests
    #[command(name = "neuronBroker")]
    NeuronBroker {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Neuron persistence REST endpoint
        #[arg(long = "persistenceServer", visible_alias = "ps")]
        persistence_server: Option<String>,

        /// Shared owner whose neurons may be claimed by anyone
        #[arg(long = "systemOwner")]
        system_owner: Option<String>,
    },

    /// Document search-index maintenance
    #[command(name = "indexingBroker")]
    IndexingBroker {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Search-index REST endpoint
        #[arg(long = "indexingServer")]
        indexing_server: Option<String>,
    },

    /// Tracing-agent registration and updates
    #[command(name = "agentBroker")]
    AgentBroker {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Agent-tracking REST endpoint
        #[arg(long = "agentServer")]
        agent_server: Option<String>,

        /// Neuron persistence REST endpoint
        #[arg(long = "persistenceServer", visible_alias = "ps")]
        persistence_server: Option<String>,

        /// Exchange that relays agent updates to workstations
        #[arg(long = "forward")]
        forward_exchange: Option<String>,
    },
}

/// Flags shared by every adapter.
#[derive(Args, Debug, Clone, Default)]
pub struct BrokerArgs {
    /// Message broker host
    #[arg(long = "ms", value_name = "HOST")]
    pub message_host: Option<String>,

    #[arg(short = 'u', long)]
    pub user: Option<String>,

    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Queue to consume from
    #[arg(long = "rec", value_name = "QUEUE")]
    pub receive_queue: Option<String>,

    /// Exchange for success replies
    #[arg(long = "send", value_name = "EXCHANGE")]
    pub success_exchange: Option<String>,

    /// Exchange for error replies
    #[arg(long = "error", value_name = "EXCHANGE")]
    pub error_exchange: Option<String>,

    #[arg(long = "backupQueue")]
    pub backup_queue: Option<String>,

    /// Milliseconds between backup snapshots
    #[arg(long = "backupInterval")]
    pub backup_interval: Option<u64>,

    /// Backup path prefix; the weekday name is appended
    #[arg(long = "backupLocation")]
    pub backup_location: Option<String>,

    /// Connect attempts before giving up (0 or less retries forever)
    #[arg(long = "connectRetries", allow_negative_numbers = true)]
    pub connect_retries: Option<i32>,

    /// Delivery workers (0 uses the transport default)
    #[arg(long = "consumerThreads")]
    pub consumer_threads: Option<usize>,
}

impl BrokerArgs {
    pub fn apply(&self, config: &mut BrokerConfig) {
        let message = &mut config.message;
        if let Some(host) = &self.message_host {
            message.host.clone_from(host);
        }
        if let Some(user) = &self.user {
            message.user.clone_from(user);
        }
        if let Some(password) = &self.password {
            message.password.clone_from(password);
        }
        if let Some(queue) = &self.receive_queue {
            message.receive_queue.clone_from(queue);
        }
        if self.success_exchange.is_some() {
            message.success_exchange.clone_from(&self.success_exchange);
        }
        if self.error_exchange.is_some() {
            message.error_exchange.clone_from(&self.error_exchange);
        }
        if let Some(retries) = self.connect_retries {
            message.connect_retries = retries;
        }
        if let Some(threads) = self.consumer_threads {
            message.consumer_threads = threads;
        }

        let backup = &mut config.backup;
        if self.backup_queue.is_some() {
            backup.queue.clone_from(&self.backup_queue);
        }
        if let Some(interval) = self.backup_interval {
            backup.interval_ms = interval;
        }
        if self.backup_location.is_some() {
            backup.location.clone_from(&self.backup_location);
        }
    }
}

impl Commands {
    pub fn adapter(&self) -> Adapter {
        match self {
            Self::NeuronBroker { .. } => Adapter::Neuron,
            Self::IndexingBroker { .. } => Adapter::Indexing,
            Self::AgentBroker { .. } => Adapter::Agent,
        }
    }

    /// Layers the command-line flags over `config`.
    pub fn apply(&self, config: &mut BrokerConfig) {
        match self {
            Self::NeuronBroker {
                broker,
                persistence_server,
                system_owner,
            } => {
                broker.apply(config);
                if persistence_server.is_some() {
                    config
                        .services
                        .persistence_server
                        .clone_from(persistence_server);
                }
                if let Some(owner) = system_owner {
                    config.services.system_owner.clone_from(owner);
                }
            }
            Self::IndexingBroker {
                broker,
                indexing_server,
            } => {
                broker.apply(config);
                if indexing_server.is_some() {
                    config.services.indexing_server.clone_from(indexing_server);
                }
            }
            Self::AgentBroker {
                broker,
                agent_server,
                persistence_server,
                forward_exchange,
            } => {
                broker.apply(config);
                if agent_server.is_some() {
                    config.services.agent_server.clone_from(agent_server);
                }
                if persistence_server.is_some() {
                    config
                        .services
                        .persistence_server
                        .clone_from(persistence_server);
                }
                if forward_exchange.is_some() {
                    config.message.forward_exchange.clone_from(forward_exchange);
                }
            }
        }
    }
}
