//! Concrete adapter implementations for ports.

pub mod csv_adapter;
pub mod file_config_adapter;
pub mod memory_monitor;
pub mod memory_rule_store;
pub mod sqlite_adapter;
pub mod sqlite_rule_store;
