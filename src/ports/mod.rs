//! Port traits for the external collaborators.

pub mod config_port;
pub mod data_port;
pub mod monitor_port;
pub mod rule_store_port;
