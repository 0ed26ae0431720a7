// ABOUTME: Library crate for dockpool exposing the daemon broker for embedding and testing

#![allow(missing_docs)]

pub mod broker;
pub mod cli;
pub mod config;

pub use broker::{BrokerError, BrokerResult, BrokerStats, DaemonBroker, OperationKind};
