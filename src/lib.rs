#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod app;
pub mod backup;
pub mod broker;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod queue;
pub mod rest;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
