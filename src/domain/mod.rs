//! Core domain types and logic.

pub mod bar;
pub mod config;
pub mod context;
pub mod deployment;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod query_builder;
pub mod repository;
pub mod rule;
pub mod rule_document;
pub mod signal;
pub mod validation;
