mod env_overrides;
mod loader;
pub mod schema;
#[cfg(test)]
pub(crate) mod test_env;

pub use loader::default_config_path;
pub use schema::{
    BackupConfig, BrokerConfig, IndexingConfig, MessageConfig, SchedulerConfig, ServicesConfig,
};
